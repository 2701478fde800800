//! Device-Code Flow (Outlook)
//!
//! RFC 8628 device authorization against the Microsoft identity platform.
//! The operator is shown a short code and a verification URL, completes
//! consent on any device, and the flow polls the token endpoint until the
//! grant is issued, denied, or the device code expires.
//!
//! Polling honours the provider's `interval`, backs off by 5s on
//! `slow_down`, and bounds both the sleeps and the poll requests by the
//! device code's expiry, so a stalled token endpoint cannot stretch a run
//! past it.
//!
//! Silent reacquisition uses the refresh token kept in the account's session
//! cache. When it is rejected the lifecycle manager falls back to polling.

use crate::error::FlowError;
use crate::flow::ProviderFlow;
use crate::oauth::{post_form, TokenEndpoint, MICROSOFT_LOGIN_URL};
use crate::types::{AccountIdentity, Credential};
use async_trait::async_trait;
use bridge_traits::http::HttpClient;
use bridge_traits::{Clock, SystemClock, UserInteraction};
use core_runtime::config::AuthConfig;
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{sleep, timeout_at, Instant};
use tracing::{debug, info, instrument, warn};

const DEVICE_CODE_GRANT_TYPE: &str = "urn:ietf:params:oauth:grant-type:device_code";

/// Scopes the identity platform needs alongside the mail scopes to issue a
/// refresh token and an account profile.
const RESERVED_SCOPES: [&str; 3] = ["offline_access", "openid", "profile"];

const DEFAULT_POLL_INTERVAL_SECS: u64 = 5;
const SLOW_DOWN_STEP: Duration = Duration::from_secs(5);
const MAX_POLL_INTERVAL: Duration = Duration::from_secs(30);

/// Device authorization response (RFC 8628 §3.2).
#[derive(Debug, Clone, Deserialize)]
struct DeviceCodeResponse {
    device_code: String,
    user_code: String,
    #[serde(alias = "verification_url")]
    verification_uri: String,
    expires_in: u64,
    #[serde(default = "default_interval")]
    interval: u64,
    #[serde(default)]
    message: Option<String>,
}

fn default_interval() -> u64 {
    DEFAULT_POLL_INTERVAL_SECS
}

/// Device-code consent plus refresh-token reacquisition.
pub struct DeviceCodeFlow {
    http: Arc<dyn HttpClient>,
    interaction: Arc<dyn UserInteraction>,
    clock: Arc<dyn Clock>,
    login_url: String,
    poll_interval: Option<Duration>,
    code_expiry: Option<Duration>,
}

impl DeviceCodeFlow {
    /// Flow against the Microsoft identity platform.
    pub fn new(http: Arc<dyn HttpClient>, interaction: Arc<dyn UserInteraction>) -> Self {
        Self {
            http,
            interaction,
            clock: Arc::new(SystemClock),
            login_url: MICROSOFT_LOGIN_URL.to_string(),
            poll_interval: None,
            code_expiry: None,
        }
    }

    pub fn from_config(config: &AuthConfig) -> Self {
        let mut flow = Self::new(config.http_client.clone(), config.user_interaction.clone());
        flow.poll_interval = config.device_poll_interval;
        flow.code_expiry = config.device_code_expiry;
        flow
    }

    /// Replace `https://login.microsoftonline.com`; the tenant path is appended.
    pub fn with_login_url(mut self, login_url: impl Into<String>) -> Self {
        self.login_url = login_url.into().trim_end_matches('/').to_string();
        self
    }

    /// Poll at this interval instead of the one the provider announces.
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = Some(interval);
        self
    }

    /// Give up after this long instead of the provider's `expires_in`.
    pub fn with_code_expiry(mut self, expiry: Duration) -> Self {
        self.code_expiry = Some(expiry);
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    fn device_code_url(&self, account: &AccountIdentity) -> String {
        format!(
            "{}/{}/oauth2/v2.0/devicecode",
            self.login_url,
            account.client.tenant()
        )
    }

    fn token_endpoint(&self, account: &AccountIdentity) -> TokenEndpoint {
        TokenEndpoint::new(
            self.http.clone(),
            format!("{}/{}/oauth2/v2.0/token", self.login_url, account.client.tenant()),
        )
    }

    /// Requested scopes plus the reserved ones, without duplicates.
    fn scopes(account: &AccountIdentity) -> Vec<String> {
        let mut scopes: Vec<String> = account
            .client
            .scopes
            .iter()
            .map(|s| s.trim())
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect();
        for reserved in RESERVED_SCOPES {
            if !scopes.iter().any(|s| s == reserved) {
                scopes.push(reserved.to_string());
            }
        }
        scopes
    }

    async fn request_device_code(
        &self,
        account: &AccountIdentity,
        scope: &str,
    ) -> Result<DeviceCodeResponse, FlowError> {
        let params = [
            ("client_id", account.client.client_id.as_str()),
            ("scope", scope),
        ];
        let response: DeviceCodeResponse =
            post_form(self.http.as_ref(), &self.device_code_url(account), &params)
                .await
                .map_err(|e| {
                    warn!(error = %e, "Device code request failed");
                    FlowError::from(e)
                })?;

        debug!(
            expires_in = response.expires_in,
            interval = response.interval,
            "Device code issued"
        );
        Ok(response)
    }

    async fn poll_for_grant(
        &self,
        account: &AccountIdentity,
        device: &DeviceCodeResponse,
        scopes: &[String],
    ) -> Result<Credential, FlowError> {
        let endpoint = self.token_endpoint(account);
        let expiry = self
            .code_expiry
            .unwrap_or_else(|| Duration::from_secs(device.expires_in));
        let deadline = Instant::now() + expiry;
        let mut interval = self
            .poll_interval
            .unwrap_or_else(|| Duration::from_secs(device.interval.max(1)));

        let params = [
            ("grant_type", DEVICE_CODE_GRANT_TYPE),
            ("client_id", account.client.client_id.as_str()),
            ("device_code", device.device_code.as_str()),
        ];

        info!(expires_in = expiry.as_secs(), "Polling for device authorization");

        let expired = || {
            FlowError::Timeout(format!(
                "device code expired after {}s before sign-in completed",
                expiry.as_secs()
            ))
        };

        loop {
            let now = Instant::now();
            if now >= deadline {
                return Err(expired());
            }
            sleep(interval.min(deadline - now)).await;

            let polled = timeout_at(deadline, endpoint.request(&params))
                .await
                .map_err(|_| expired())?;
            let error = match polled {
                Ok(response) => {
                    return Ok(response.into_credential(
                        account.provider,
                        self.clock.now(),
                        None,
                        scopes,
                    ));
                }
                Err(error) => error,
            };

            match error.error_code() {
                Some("authorization_pending") => {
                    debug!("Authorization pending");
                }
                Some("slow_down") => {
                    interval = (interval + SLOW_DOWN_STEP).min(MAX_POLL_INTERVAL);
                    debug!(interval_secs = interval.as_secs(), "Provider asked to slow down");
                }
                _ => {
                    let flow_error = FlowError::from(error.clone());
                    if !flow_error.is_retryable() {
                        warn!(error = %error, "Device authorization ended");
                        return Err(flow_error);
                    }
                    warn!(error = %error, "Poll failed, will retry until the code expires");
                }
            }
        }
    }
}

/// Operator-facing instruction for a device code.
fn instructions(device: &DeviceCodeResponse) -> String {
    match device.message.as_deref().map(str::trim) {
        Some(message) if !message.is_empty() => message.to_string(),
        _ => format!(
            "To sign in, visit {} and enter the code {}",
            device.verification_uri, device.user_code
        ),
    }
}

#[async_trait]
impl ProviderFlow for DeviceCodeFlow {
    #[instrument(skip(self, account, credential), fields(account = %account.email))]
    async fn refresh(
        &self,
        account: &AccountIdentity,
        credential: &Credential,
    ) -> Result<Credential, FlowError> {
        let scope = Self::scopes(account).join(" ");
        let result = self
            .token_endpoint(account)
            .refresh(&account.client, credential, Some(&scope), self.clock.as_ref())
            .await;

        if let Err(FlowError::InvalidGrant(reason)) = &result {
            info!(reason = %reason, "No silent session available; consent will be requested");
        }
        result
    }

    #[instrument(skip(self, account), fields(account = %account.email, provider = %account.provider))]
    async fn interactive_authenticate(
        &self,
        account: &AccountIdentity,
    ) -> Result<Credential, FlowError> {
        account
            .client
            .validate(account.provider)
            .map_err(|e| FlowError::FlowSetup(e.to_string()))?;

        let scopes = Self::scopes(account);
        let device = self.request_device_code(account, &scopes.join(" ")).await?;

        self.interaction.show_message(&instructions(&device));
        info!(verification_uri = %device.verification_uri, "Waiting for device sign-in");

        self.poll_for_grant(account, &device, &scopes).await
    }
}
