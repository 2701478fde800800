//! # Token Lifecycle Manager
//!
//! Decides, per account, whether a cached credential can be used, refreshed,
//! or has to be replaced through an interactive flow, and persists the result.
//!
//! ## State machine
//!
//! ```text
//!                    ┌──────────────────────┐ valid
//!   START ── load ──>│ cached credential?   ├────────> CACHE_HIT_VALID ───────────┐
//!     │              └──────────┬───────────┘                                     │
//!     │ none/corrupt            │ expired                                         │
//!     │               has refresh token?                                          │
//!     │               yes │             │ no                                      v
//!     │  CACHE_HIT_EXPIRED_REFRESHABLE  CACHE_HIT_EXPIRED_UNREFRESHABLE     AUTHENTICATED
//!     │        │ refresh ok ──> persist ──────────────────────────────────────>  ^
//!     │        │ InvalidGrant / retries exhausted ──> UNREFRESHABLE              │
//!     │        │ other error ──> FAILED                    │                    │
//!     v                                                    v                    │
//!   NEEDS_INTERACTIVE <────────────────────────────────────┘                    │
//!     │ consent ok ──> persist ─────────────────────────────────────────────────┘
//!     │ denied / timeout / setup error ──> FAILED (token file untouched)
//! ```
//!
//! ## Guarantees
//!
//! - A cached credential valid beyond the expiry margin is returned without
//!   any network call or prompt.
//! - A failed run never writes the token file.
//! - A credential that cannot be saved is still returned; the failure rides
//!   along as [`AuthOutcome::persistence_warning`].
//! - Runs for the same token file are serialized, so two concurrent callers
//!   never both prompt the user.
//!
//! ## Usage
//!
//! ```no_run
//! use core_auth::{AccountIdentity, TokenLifecycleManager};
//! use core_runtime::config::AuthConfig;
//! use std::sync::Arc;
//!
//! # async fn example(config: AuthConfig) -> core_auth::Result<()> {
//! let config = Arc::new(config);
//! let manager = TokenLifecycleManager::from_config(config.clone());
//!
//! for account in AccountIdentity::enabled(&config) {
//!     let credential = manager.get_valid_credential(&account).await?;
//!     println!("{account}: valid until {}", credential.expires_at);
//! }
//! # Ok(())
//! # }
//! ```

use crate::authorization_code::AuthorizationCodeFlow;
use crate::device_code::DeviceCodeFlow;
use crate::error::{AuthError, FlowError, Result};
use crate::flow::ProviderFlow;
use crate::progress::{NoopProgressSink, ProgressEvent, ProgressSink};
use crate::store::CredentialStore;
use crate::types::{AccountIdentity, Credential, ProviderTag};
use bridge_traits::{Clock, SystemClock};
use core_runtime::config::AuthConfig;
use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

/// Observable states of one `authenticate` run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LifecycleState {
    Start,
    CacheHitValid,
    CacheHitExpiredRefreshable,
    CacheHitExpiredUnrefreshable,
    NeedsInteractive,
    Authenticated,
    Failed,
}

impl LifecycleState {
    pub fn as_str(&self) -> &'static str {
        match self {
            LifecycleState::Start => "START",
            LifecycleState::CacheHitValid => "CACHE_HIT_VALID",
            LifecycleState::CacheHitExpiredRefreshable => "CACHE_HIT_EXPIRED_REFRESHABLE",
            LifecycleState::CacheHitExpiredUnrefreshable => "CACHE_HIT_EXPIRED_UNREFRESHABLE",
            LifecycleState::NeedsInteractive => "NEEDS_INTERACTIVE",
            LifecycleState::Authenticated => "AUTHENTICATED",
            LifecycleState::Failed => "FAILED",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, LifecycleState::Authenticated | LifecycleState::Failed)
    }
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of a successful run.
#[derive(Debug, Clone)]
pub struct AuthOutcome {
    pub credential: Credential,
    /// Set when the credential is usable now but could not be saved, so the
    /// next process run will have to authenticate again.
    pub persistence_warning: Option<AuthError>,
    /// States visited, from `Start` to `Authenticated`.
    pub states: Vec<LifecycleState>,
}

/// A state together with the data it carries.
enum Step {
    Start,
    CacheHitValid(Credential),
    CacheHitExpiredRefreshable(Credential),
    CacheHitExpiredUnrefreshable,
    NeedsInteractive,
    Authenticated { credential: Credential, persist: bool },
    Failed(AuthError),
}

impl Step {
    fn state(&self) -> LifecycleState {
        match self {
            Step::Start => LifecycleState::Start,
            Step::CacheHitValid(_) => LifecycleState::CacheHitValid,
            Step::CacheHitExpiredRefreshable(_) => LifecycleState::CacheHitExpiredRefreshable,
            Step::CacheHitExpiredUnrefreshable => LifecycleState::CacheHitExpiredUnrefreshable,
            Step::NeedsInteractive => LifecycleState::NeedsInteractive,
            Step::Authenticated { .. } => LifecycleState::Authenticated,
            Step::Failed(_) => LifecycleState::Failed,
        }
    }
}

/// Orchestrates credential store and provider flows per account.
pub struct TokenLifecycleManager {
    config: Arc<AuthConfig>,
    store: CredentialStore,
    flows: HashMap<ProviderTag, Arc<dyn ProviderFlow>>,
    clock: Arc<dyn Clock>,
    progress: Arc<dyn ProgressSink>,
    cancel: CancellationToken,
    /// Per-token-file locks serializing runs for the same account
    account_locks: Arc<Mutex<HashMap<PathBuf, Arc<Mutex<()>>>>>,
}

impl TokenLifecycleManager {
    /// Manager with the production flow for each provider.
    ///
    /// The configuration is treated as read-only from here on.
    pub fn from_config(config: Arc<AuthConfig>) -> Self {
        let cancel = CancellationToken::new();

        let mut flows: HashMap<ProviderTag, Arc<dyn ProviderFlow>> = HashMap::new();
        flows.insert(
            ProviderTag::Gmail,
            Arc::new(AuthorizationCodeFlow::from_config(&config).with_cancellation(cancel.clone())),
        );
        flows.insert(
            ProviderTag::Outlook,
            Arc::new(DeviceCodeFlow::from_config(&config)),
        );

        Self {
            store: CredentialStore::new(config.file_system.clone()),
            flows,
            clock: Arc::new(SystemClock),
            progress: Arc::new(NoopProgressSink),
            cancel,
            account_locks: Arc::new(Mutex::new(HashMap::new())),
            config,
        }
    }

    /// Replace the flow used for `provider`.
    pub fn with_flow(mut self, provider: ProviderTag, flow: Arc<dyn ProviderFlow>) -> Self {
        self.flows.insert(provider, flow);
        self
    }

    /// Clock used for cache validity decisions.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_progress_sink(mut self, sink: Arc<dyn ProgressSink>) -> Self {
        self.progress = sink;
        self
    }

    pub fn config(&self) -> &AuthConfig {
        &self.config
    }

    /// Cancels any browser redirect the built-in Gmail flow is waiting for.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Look up a configured account by e-mail.
    pub fn account(&self, email: &str) -> Option<AccountIdentity> {
        self.config
            .account_by_email(email)
            .map(|descriptor| AccountIdentity::from_config(&self.config, descriptor))
    }

    /// Run the lifecycle for `account` and return the credential to use.
    ///
    /// # Errors
    ///
    /// - `AuthError::Configuration` / `FlowSetup` if the client descriptor is unusable
    /// - `AuthError::UserDeniedConsent` / `Timeout` if interactive consent did not complete
    /// - `AuthError::InvalidGrant` / `Network` if the interactive exchange failed
    #[instrument(skip(self, account), fields(account = %account.email, provider = %account.provider))]
    pub async fn authenticate(&self, account: &AccountIdentity) -> Result<AuthOutcome> {
        let flow = self.flow_for(account.provider)?;
        account.client.validate(account.provider)?;

        let lock = {
            let mut locks = self.account_locks.lock().await;
            locks
                .entry(account.token_file.clone())
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .clone()
        };
        let _guard = lock.lock().await;

        let mut states = Vec::with_capacity(4);
        let mut step = Step::Start;

        loop {
            let from = step.state();
            states.push(from);

            let next = match step {
                Step::Start => self.load(account).await,

                Step::CacheHitValid(credential) => {
                    self.checkpoint(account, |account, provider| ProgressEvent::CacheHit {
                        account,
                        provider,
                    });
                    info!(
                        expires_in = credential.seconds_until_expiry(self.clock.now()),
                        "Using cached credential"
                    );
                    Step::Authenticated {
                        credential,
                        persist: false,
                    }
                }

                Step::CacheHitExpiredRefreshable(cached) => {
                    match self.refresh_with_retry(flow.as_ref(), account, &cached).await {
                        Ok(credential) => Step::Authenticated {
                            credential,
                            persist: true,
                        },
                        Err(FlowError::InvalidGrant(reason)) => {
                            info!(reason = %reason, "Refresh token rejected");
                            Step::CacheHitExpiredUnrefreshable
                        }
                        Err(e @ FlowError::Network(_)) => {
                            warn!(error = %e, "Refresh retries exhausted");
                            Step::CacheHitExpiredUnrefreshable
                        }
                        Err(e) => Step::Failed(e.into()),
                    }
                }

                Step::CacheHitExpiredUnrefreshable => Step::NeedsInteractive,

                Step::NeedsInteractive => {
                    self.checkpoint(account, |account, provider| {
                        ProgressEvent::InteractiveStarted { account, provider }
                    });
                    info!("Interactive sign-in required");

                    let result = flow.interactive_authenticate(account).await;
                    let success = result.is_ok();
                    self.checkpoint(account, |account, provider| {
                        ProgressEvent::InteractiveResult {
                            account,
                            provider,
                            success,
                        }
                    });

                    match result {
                        Ok(credential) => Step::Authenticated {
                            credential,
                            persist: true,
                        },
                        Err(e) => Step::Failed(e.into()),
                    }
                }

                Step::Authenticated {
                    credential,
                    persist,
                } => {
                    let persistence_warning = if persist {
                        self.persist(account, &credential).await
                    } else {
                        None
                    };
                    return Ok(AuthOutcome {
                        credential,
                        persistence_warning,
                        states,
                    });
                }

                Step::Failed(err) => {
                    error!(error = %err, "Authentication failed");
                    let message = err.to_string();
                    let recoverable = err.is_recoverable();
                    self.checkpoint(account, |account, provider| ProgressEvent::Failed {
                        account,
                        provider,
                        message,
                        recoverable,
                    });
                    return Err(err);
                }
            };

            debug!(%from, to = %next.state(), "Lifecycle transition");
            step = next;
        }
    }

    /// The credential for `account`, authenticating if necessary.
    ///
    /// A failure to save the credential is logged and reported to the
    /// progress sink but does not fail the call.
    pub async fn get_valid_credential(&self, account: &AccountIdentity) -> Result<Credential> {
        self.authenticate(account).await.map(|outcome| outcome.credential)
    }

    /// Authenticate every enabled account in configuration order.
    pub async fn authenticate_all(&self) -> Vec<(AccountIdentity, Result<AuthOutcome>)> {
        let mut results = Vec::new();
        for account in AccountIdentity::enabled(&self.config) {
            let result = self.authenticate(&account).await;
            results.push((account, result));
        }
        results
    }

    /// Remove the account's token file. Returns `false` if there was none.
    #[instrument(skip(self, account), fields(account = %account.email, provider = %account.provider))]
    pub async fn sign_out(&self, account: &AccountIdentity) -> Result<bool> {
        let lock = {
            let mut locks = self.account_locks.lock().await;
            locks
                .entry(account.token_file.clone())
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .clone()
        };
        let _guard = lock.lock().await;

        let removed = self.store.delete(&account.token_file).await?;
        if removed {
            info!("Signed out");
            self.checkpoint(account, |account, provider| ProgressEvent::SignedOut {
                account,
                provider,
            });
        }
        Ok(removed)
    }

    /// Whether a token file exists for `account`. Its content is not checked.
    pub async fn has_credential(&self, account: &AccountIdentity) -> bool {
        self.store.exists(&account.token_file).await
    }

    fn flow_for(&self, provider: ProviderTag) -> Result<Arc<dyn ProviderFlow>> {
        self.flows.get(&provider).cloned().ok_or_else(|| {
            AuthError::Configuration(format!("no sign-in flow registered for {provider}"))
        })
    }

    async fn load(&self, account: &AccountIdentity) -> Step {
        let Some(credential) = self.store.load(&account.token_file, account.provider).await else {
            return Step::NeedsInteractive;
        };

        if credential.is_valid_at(self.clock.now(), self.config.expiry_margin) {
            Step::CacheHitValid(credential)
        } else if credential.can_refresh() {
            Step::CacheHitExpiredRefreshable(credential)
        } else {
            Step::CacheHitExpiredUnrefreshable
        }
    }

    async fn refresh_with_retry(
        &self,
        flow: &dyn ProviderFlow,
        account: &AccountIdentity,
        cached: &Credential,
    ) -> std::result::Result<Credential, FlowError> {
        let policy = &self.config.refresh_retry;
        let max_attempts = policy.max_attempts.max(1);

        self.checkpoint(account, |account, provider| ProgressEvent::RefreshAttempted {
            account,
            provider,
        });

        let mut attempt = 0;
        let result = loop {
            attempt += 1;
            match flow.refresh(account, cached).await {
                Err(e) if e.is_retryable() && attempt < max_attempts => {
                    let delay = policy.delay_for(attempt);
                    warn!(
                        attempt,
                        max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Refresh failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                other => break other,
            }
        };

        let success = result.is_ok();
        self.checkpoint(account, |account, provider| ProgressEvent::RefreshResult {
            account,
            provider,
            success,
        });
        if success {
            info!(attempt, "Access token refreshed");
        }
        result
    }

    async fn persist(&self, account: &AccountIdentity, credential: &Credential) -> Option<AuthError> {
        let result = self.store.save(&account.token_file, credential).await;
        let success = result.is_ok();
        self.checkpoint(account, |account, provider| ProgressEvent::PersistResult {
            account,
            provider,
            success,
        });

        match result {
            Ok(outcome) => {
                debug!(?outcome, "Credential persisted");
                None
            }
            Err(err) => {
                warn!(
                    error = %err,
                    "Credential could not be saved; the next run will need to sign in again"
                );
                Some(err)
            }
        }
    }

    fn checkpoint<F>(&self, account: &AccountIdentity, event: F)
    where
        F: FnOnce(String, ProviderTag) -> ProgressEvent,
    {
        self.progress
            .checkpoint(event(account.email.clone(), account.provider));
    }
}

impl fmt::Debug for TokenLifecycleManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut providers: Vec<_> = self.flows.keys().map(|p| p.as_str()).collect();
        providers.sort_unstable();
        f.debug_struct("TokenLifecycleManager")
            .field("config", &self.config)
            .field("providers", &providers)
            .finish()
    }
}
