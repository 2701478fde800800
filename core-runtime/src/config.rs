//! # Authentication Configuration
//!
//! Provides the account list, client descriptors, and lifecycle tuning for the
//! authentication core.
//!
//! ## Overview
//!
//! The configuration system uses a builder pattern to construct an
//! `AuthConfig` that holds every account descriptor plus the bridges the core
//! needs (HTTP, file system, operator interaction). `build()` validates
//! fail-fast; afterwards the value is shared as `Arc<AuthConfig>` and never
//! mutated. There is no global instance.
//!
//! ## Required Dependencies (with desktop defaults)
//!
//! - `HttpClient` - Token endpoint calls (desktop default: reqwest)
//! - `FileSystemAccess` - Token file persistence (desktop default: tokio fs)
//! - `UserInteraction` - Consent pages and device codes (desktop default: browser + stdout)
//!
//! When the `desktop-shims` feature is enabled, these defaults are injected
//! automatically if not provided.
//!
//! ## Usage
//!
//! ```ignore
//! use core_runtime::config::{AccountDescriptor, AuthConfig, ClientDescriptor, ProviderTag};
//!
//! let config = AuthConfig::builder()
//!     .token_dir("tokens")
//!     .account(AccountDescriptor::new(
//!         "Personal Gmail",
//!         "someone@gmail.com",
//!         ProviderTag::Gmail,
//!         ClientDescriptor::gmail("client-id.apps.googleusercontent.com", Some("secret")),
//!     ))
//!     .build()?;
//! ```
//!
//! Account lists can also be loaded from JSON:
//!
//! ```ignore
//! let config = AuthConfig::builder()
//!     .accounts_from_json_file("config/accounts.json")?
//!     .build()?;
//! ```

use crate::error::{Error, Result};
use bridge_traits::{FileSystemAccess, HttpClient, RetryPolicy, UserInteraction};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

/// Default Gmail scope: read-only mailbox access.
pub const GMAIL_READONLY_SCOPE: &str = "https://www.googleapis.com/auth/gmail.readonly";

/// Default Outlook scope: read-only mailbox access through Microsoft Graph.
pub const OUTLOOK_MAIL_READ_SCOPE: &str = "https://graph.microsoft.com/Mail.Read";

/// Default margin before expiry at which a cached token stops being trusted.
pub const DEFAULT_EXPIRY_MARGIN: Duration = Duration::from_secs(60);

/// Default bound on the authorization-code listener wait.
pub const DEFAULT_INTERACTIVE_TIMEOUT: Duration = Duration::from_secs(300);

/// Default token directory, relative to the working directory.
pub const DEFAULT_TOKEN_DIR: &str = "tokens";

/// Mail provider family. Selects the OAuth flow variant and token file format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderTag {
    /// Google Gmail, authorization-code flow with a loopback redirect.
    Gmail,
    /// Microsoft Outlook / Exchange Online, device-code flow.
    Outlook,
}

impl ProviderTag {
    /// Human-readable display name
    pub fn display_name(&self) -> &'static str {
        match self {
            ProviderTag::Gmail => "Gmail",
            ProviderTag::Outlook => "Outlook",
        }
    }

    /// Stable identifier used in file names and logs
    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderTag::Gmail => "gmail",
            ProviderTag::Outlook => "outlook",
        }
    }

    /// Parse from a case-insensitive identifier
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "gmail" | "google" => Some(ProviderTag::Gmail),
            "outlook" | "microsoft" | "office365" => Some(ProviderTag::Outlook),
            _ => None,
        }
    }

    /// Extension of the token file for this provider.
    ///
    /// Gmail token files are JSON; Outlook token files are an opaque session blob.
    pub fn token_file_extension(&self) -> &'static str {
        match self {
            ProviderTag::Gmail => "json",
            ProviderTag::Outlook => "bin",
        }
    }
}

impl fmt::Display for ProviderTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.display_name())
    }
}

/// OAuth client registration used for one account.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientDescriptor {
    /// OAuth client id (Google Cloud desktop client / Azure application id)
    pub client_id: String,
    /// Client secret; Google desktop clients have one, Azure public clients do not
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_secret: Option<String>,
    /// Azure tenant or authority (`common`, `consumers`, a tenant id, or a full
    /// `https://login.microsoftonline.com/<tenant>` URL). Unused for Gmail.
    #[serde(default, alias = "tenant_id", alias = "authority")]
    pub tenant_or_authority: Option<String>,
    /// Scopes requested during consent
    #[serde(default)]
    pub scopes: Vec<String>,
}

impl ClientDescriptor {
    /// Gmail desktop client with the read-only mailbox scope.
    pub fn gmail(client_id: impl Into<String>, client_secret: Option<&str>) -> Self {
        Self {
            client_id: client_id.into(),
            client_secret: client_secret.map(str::to_string),
            tenant_or_authority: None,
            scopes: vec![GMAIL_READONLY_SCOPE.to_string()],
        }
    }

    /// Azure public client with the Graph `Mail.Read` scope.
    pub fn outlook(client_id: impl Into<String>, tenant: impl Into<String>) -> Self {
        Self {
            client_id: client_id.into(),
            client_secret: None,
            tenant_or_authority: Some(tenant.into()),
            scopes: vec![OUTLOOK_MAIL_READ_SCOPE.to_string()],
        }
    }

    /// Replace the requested scopes.
    pub fn with_scopes<I, S>(mut self, scopes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.scopes = scopes.into_iter().map(Into::into).collect();
        self
    }

    /// The tenant segment to use in Microsoft identity platform URLs.
    ///
    /// Accepts either a bare tenant or a full authority URL and defaults to `common`.
    pub fn tenant(&self) -> &str {
        let raw = self
            .tenant_or_authority
            .as_deref()
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .unwrap_or("common");

        raw.trim_end_matches('/')
            .rsplit('/')
            .next()
            .filter(|t| !t.is_empty())
            .unwrap_or("common")
    }

    /// Validates the descriptor for the given provider.
    pub fn validate(&self, provider: ProviderTag) -> Result<()> {
        if self.client_id.trim().is_empty() {
            return Err(Error::Config(missing_client_message(provider)));
        }

        if self.scopes.iter().all(|s| s.trim().is_empty()) {
            return Err(Error::Config(format!(
                "{} client must request at least one scope",
                provider.display_name()
            )));
        }

        if provider == ProviderTag::Outlook {
            if let Some(tenant) = &self.tenant_or_authority {
                if tenant.trim().is_empty() {
                    return Err(Error::Config(
                        "Outlook tenant cannot be empty. Use 'common', 'consumers', \
                         'organizations', or your Azure tenant id."
                            .to_string(),
                    ));
                }
            }
        }

        Ok(())
    }
}

impl fmt::Debug for ClientDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientDescriptor")
            .field("client_id", &self.client_id)
            .field(
                "client_secret",
                &self.client_secret.as_ref().map(|_| "[REDACTED]"),
            )
            .field("tenant_or_authority", &self.tenant_or_authority)
            .field("scopes", &self.scopes)
            .finish()
    }
}

/// Setup instructions shown when a client descriptor is missing or incomplete.
pub fn missing_client_message(provider: ProviderTag) -> String {
    match provider {
        ProviderTag::Gmail => "Gmail client id is missing. To set it up: \
             1) open https://console.cloud.google.com/ and create or select a project, \
             2) enable the Gmail API, \
             3) create OAuth client credentials of type 'Desktop app', \
             4) put the client id and secret in the account's client descriptor."
            .to_string(),
        ProviderTag::Outlook => "Outlook client id is missing. To set it up: \
             1) register an application at https://portal.azure.com/ (App registrations), \
             2) enable 'Allow public client flows', \
             3) add the Microsoft Graph delegated permission Mail.Read, \
             4) put the application id and tenant in the account's client descriptor."
            .to_string(),
    }
}

/// Configuration for a single mail account.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountDescriptor {
    /// Display name (e.g. "Personal Gmail")
    pub name: String,
    /// Account e-mail address; the account's identity
    pub email: String,
    /// Provider family
    pub provider: ProviderTag,
    /// Disabled accounts are skipped by `enabled_accounts`
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Explicit token file; derived from the token directory when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_file: Option<PathBuf>,
    /// OAuth client registration
    pub client: ClientDescriptor,
}

fn default_enabled() -> bool {
    true
}

impl AccountDescriptor {
    pub fn new(
        name: impl Into<String>,
        email: impl Into<String>,
        provider: ProviderTag,
        client: ClientDescriptor,
    ) -> Self {
        Self {
            name: name.into(),
            email: email.into(),
            provider,
            enabled: true,
            token_file: None,
            client,
        }
    }

    pub fn with_token_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.token_file = Some(path.into());
        self
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }

    fn validate(&self) -> Result<()> {
        if !is_plausible_email(&self.email) {
            return Err(Error::Config(format!(
                "Account '{}' has an invalid e-mail address",
                self.name
            )));
        }

        self.client.validate(self.provider).map_err(|e| match e {
            Error::Config(message) => {
                Error::Config(format!("Account '{}': {}", self.email, message))
            }
            other => other,
        })
    }
}

fn is_plausible_email(email: &str) -> bool {
    let Some((local, domain)) = email.split_once('@') else {
        return false;
    };
    !local.is_empty()
        && domain.contains('.')
        && !domain.starts_with('.')
        && !domain.ends_with('.')
        && !email.chars().any(char::is_whitespace)
}

/// Derive a file-name-safe stem from an e-mail address.
pub fn sanitize_for_file_name(email: &str) -> String {
    email
        .chars()
        .map(|c| match c {
            'a'..='z' | 'A'..='Z' | '0'..='9' | '.' | '-' | '_' => c.to_ascii_lowercase(),
            '@' => '_',
            _ => '-',
        })
        .collect()
}

/// Authentication configuration.
///
/// This struct holds every dependency and setting the token lifecycle
/// manager needs. Use [`AuthConfigBuilder`] to construct instances.
#[derive(Clone)]
pub struct AuthConfig {
    /// Directory where derived token files live
    pub token_dir: PathBuf,

    /// A cached credential is only used if it is valid for at least this long
    pub expiry_margin: Duration,

    /// Retry policy for refresh calls that fail with network errors
    pub refresh_retry: RetryPolicy,

    /// Upper bound on waiting for the loopback redirect
    pub interactive_timeout: Duration,

    /// Overrides the device-code poll interval announced by the provider
    pub device_poll_interval: Option<Duration>,

    /// Overrides the device-code expiry announced by the provider
    pub device_code_expiry: Option<Duration>,

    /// Configured accounts
    pub accounts: Vec<AccountDescriptor>,

    /// HTTP client used for all OAuth endpoints
    pub http_client: Arc<dyn HttpClient>,

    /// File system used for token files
    pub file_system: Arc<dyn FileSystemAccess>,

    /// Operator interaction for consent pages and device codes
    pub user_interaction: Arc<dyn UserInteraction>,
}

impl fmt::Debug for AuthConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthConfig")
            .field("token_dir", &self.token_dir)
            .field("expiry_margin", &self.expiry_margin)
            .field("refresh_retry", &self.refresh_retry)
            .field("interactive_timeout", &self.interactive_timeout)
            .field("device_poll_interval", &self.device_poll_interval)
            .field("device_code_expiry", &self.device_code_expiry)
            .field("accounts", &self.accounts)
            .field("http_client", &"HttpClient { ... }")
            .field("file_system", &"FileSystemAccess { ... }")
            .field("user_interaction", &"UserInteraction { ... }")
            .finish()
    }
}

impl AuthConfig {
    /// Creates a new builder for constructing an `AuthConfig`.
    pub fn builder() -> AuthConfigBuilder {
        AuthConfigBuilder::default()
    }

    /// Validates the configuration and returns an error if invalid.
    ///
    /// This checks:
    /// - Token directory is not empty
    /// - Expiry margin is below one hour
    /// - Retry policy performs at least one attempt
    /// - Interactive timeout is non-zero
    /// - Every account is well-formed and e-mails are unique
    pub fn validate(&self) -> Result<()> {
        if self.token_dir.as_os_str().is_empty() {
            return Err(Error::Config("Token directory cannot be empty".to_string()));
        }

        if self.expiry_margin >= Duration::from_secs(3600) {
            return Err(Error::Config(
                "Expiry margin must be shorter than one hour, \
                 otherwise freshly issued tokens would never be used"
                    .to_string(),
            ));
        }

        if self.refresh_retry.max_attempts == 0 {
            return Err(Error::Config(
                "Refresh retry policy must allow at least one attempt".to_string(),
            ));
        }

        if self.interactive_timeout.is_zero() {
            return Err(Error::Config(
                "Interactive timeout must be greater than zero".to_string(),
            ));
        }

        if self.device_code_expiry.is_some_and(|d| d.is_zero()) {
            return Err(Error::Config(
                "Device code expiry override must be greater than zero".to_string(),
            ));
        }

        let mut seen = HashSet::new();
        for account in &self.accounts {
            account.validate()?;
            if !seen.insert(account.email.to_ascii_lowercase()) {
                return Err(Error::Config(format!(
                    "Account {} is configured more than once",
                    account.email
                )));
            }
        }

        Ok(())
    }

    /// Accounts with `enabled = true`.
    pub fn enabled_accounts(&self) -> impl Iterator<Item = &AccountDescriptor> {
        self.accounts.iter().filter(|a| a.enabled)
    }

    /// Look up an account by e-mail (case-insensitive).
    pub fn account_by_email(&self, email: &str) -> Option<&AccountDescriptor> {
        self.accounts
            .iter()
            .find(|a| a.email.eq_ignore_ascii_case(email))
    }

    /// Token file path for an account.
    ///
    /// An explicit `token_file` wins; otherwise the path is derived
    /// deterministically from the provider and e-mail inside `token_dir`.
    pub fn token_path(&self, account: &AccountDescriptor) -> PathBuf {
        account
            .token_file
            .clone()
            .unwrap_or_else(|| self.default_token_path(&account.email, account.provider))
    }

    /// `<token_dir>/<provider>_<sanitised-email>.<ext>`
    pub fn default_token_path(&self, email: &str, provider: ProviderTag) -> PathBuf {
        self.token_dir.join(format!(
            "{}_{}.{}",
            provider.as_str(),
            sanitize_for_file_name(email),
            provider.token_file_extension()
        ))
    }
}

/// On-disk shape accepted by [`AuthConfigBuilder::accounts_from_json_str`].
#[derive(Debug, Deserialize)]
struct AccountsFile {
    #[serde(default)]
    token_dir: Option<PathBuf>,
    #[serde(default)]
    expiry_margin_secs: Option<u64>,
    #[serde(default)]
    accounts: Vec<AccountDescriptor>,
}

#[cfg(not(feature = "desktop-shims"))]
fn capability_missing(capability: &str, desktop_default: &str) -> Error {
    Error::CapabilityMissing {
        capability: capability.to_string(),
        message: format!(
            "{capability} implementation is required. \
             Desktop: enable the 'desktop-shims' feature to use {desktop_default}. \
             Otherwise inject an implementation through the builder."
        ),
    }
}

#[cfg(feature = "desktop-shims")]
fn provide_default_http_client() -> Result<Arc<dyn HttpClient>> {
    use bridge_desktop::ReqwestHttpClient;

    let client = ReqwestHttpClient::new().map_err(|e| Error::CapabilityMissing {
        capability: "HttpClient".to_string(),
        message: format!("Failed to create default ReqwestHttpClient: {}", e),
    })?;
    Ok(Arc::new(client))
}

#[cfg(not(feature = "desktop-shims"))]
fn provide_default_http_client() -> Result<Arc<dyn HttpClient>> {
    Err(capability_missing("HttpClient", "ReqwestHttpClient"))
}

#[cfg(feature = "desktop-shims")]
fn provide_default_file_system() -> Result<Arc<dyn FileSystemAccess>> {
    Ok(Arc::new(bridge_desktop::TokioFileSystem::new()))
}

#[cfg(not(feature = "desktop-shims"))]
fn provide_default_file_system() -> Result<Arc<dyn FileSystemAccess>> {
    Err(capability_missing("FileSystemAccess", "TokioFileSystem"))
}

#[cfg(feature = "desktop-shims")]
fn provide_default_user_interaction() -> Result<Arc<dyn UserInteraction>> {
    Ok(Arc::new(bridge_desktop::DesktopUserInteraction::new()))
}

#[cfg(not(feature = "desktop-shims"))]
fn provide_default_user_interaction() -> Result<Arc<dyn UserInteraction>> {
    Err(capability_missing("UserInteraction", "DesktopUserInteraction"))
}

/// Builder for constructing [`AuthConfig`] instances.
///
/// Use this builder to incrementally set configuration options and then
/// call [`build()`](AuthConfigBuilder::build) to create the final config.
#[derive(Default)]
pub struct AuthConfigBuilder {
    token_dir: Option<PathBuf>,
    expiry_margin: Option<Duration>,
    refresh_retry: Option<RetryPolicy>,
    interactive_timeout: Option<Duration>,
    device_poll_interval: Option<Duration>,
    device_code_expiry: Option<Duration>,
    accounts: Vec<AccountDescriptor>,
    http_client: Option<Arc<dyn HttpClient>>,
    file_system: Option<Arc<dyn FileSystemAccess>>,
    user_interaction: Option<Arc<dyn UserInteraction>>,
}

impl AuthConfigBuilder {
    /// Sets the directory for derived token file paths.
    ///
    /// Default: `tokens`
    pub fn token_dir<P: Into<PathBuf>>(mut self, path: P) -> Self {
        self.token_dir = Some(path.into());
        self
    }

    /// Sets the validity margin applied to cached credentials.
    ///
    /// Default: 60 seconds
    pub fn expiry_margin(mut self, margin: Duration) -> Self {
        self.expiry_margin = Some(margin);
        self
    }

    /// Sets the retry policy for refresh network failures.
    ///
    /// Default: 3 attempts, 500ms exponential backoff capped at 5s
    pub fn refresh_retry(mut self, policy: RetryPolicy) -> Self {
        self.refresh_retry = Some(policy);
        self
    }

    /// Sets how long the authorization-code listener waits for the redirect.
    ///
    /// Default: 300 seconds
    pub fn interactive_timeout(mut self, timeout: Duration) -> Self {
        self.interactive_timeout = Some(timeout);
        self
    }

    /// Forces a device-code poll interval instead of the provider's value.
    pub fn device_poll_interval(mut self, interval: Duration) -> Self {
        self.device_poll_interval = Some(interval);
        self
    }

    /// Forces a device-code expiry instead of the provider's value.
    pub fn device_code_expiry(mut self, expiry: Duration) -> Self {
        self.device_code_expiry = Some(expiry);
        self
    }

    /// Adds one account.
    pub fn account(mut self, account: AccountDescriptor) -> Self {
        self.accounts.push(account);
        self
    }

    /// Adds several accounts.
    pub fn accounts<I: IntoIterator<Item = AccountDescriptor>>(mut self, accounts: I) -> Self {
        self.accounts.extend(accounts);
        self
    }

    /// Reads accounts (and optionally `token_dir` / `expiry_margin_secs`)
    /// from a JSON document.
    ///
    /// ```
    /// use core_runtime::config::AuthConfig;
    ///
    /// let builder = AuthConfig::builder().accounts_from_json_str(r#"{
    ///     "token_dir": "tokens",
    ///     "accounts": [{
    ///         "name": "Work",
    ///         "email": "me@contoso.com",
    ///         "provider": "outlook",
    ///         "client": { "client_id": "app-id", "tenant_or_authority": "common",
    ///                     "scopes": ["https://graph.microsoft.com/Mail.Read"] }
    ///     }]
    /// }"#);
    /// assert!(builder.is_ok());
    /// ```
    pub fn accounts_from_json_str(mut self, json: &str) -> Result<Self> {
        let file: AccountsFile = serde_json::from_str(json)
            .map_err(|e| Error::Config(format!("Invalid accounts JSON: {}", e)))?;

        if let Some(dir) = file.token_dir {
            self.token_dir = Some(dir);
        }
        if let Some(secs) = file.expiry_margin_secs {
            self.expiry_margin = Some(Duration::from_secs(secs));
        }
        self.accounts.extend(file.accounts);
        Ok(self)
    }

    /// Same as [`accounts_from_json_str`](Self::accounts_from_json_str), reading from a file.
    pub fn accounts_from_json_file(self, path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path).map_err(|source| Error::ConfigFile {
            path: path.to_path_buf(),
            source,
        })?;
        self.accounts_from_json_str(&json)
    }

    /// Sets the HTTP client.
    pub fn http_client(mut self, client: Arc<dyn HttpClient>) -> Self {
        self.http_client = Some(client);
        self
    }

    /// Sets the file system bridge used for token files.
    pub fn file_system(mut self, fs: Arc<dyn FileSystemAccess>) -> Self {
        self.file_system = Some(fs);
        self
    }

    /// Sets the operator interaction bridge.
    pub fn user_interaction(mut self, interaction: Arc<dyn UserInteraction>) -> Self {
        self.user_interaction = Some(interaction);
        self
    }

    /// Builds and validates the configuration.
    ///
    /// # Errors
    ///
    /// - `Error::Config` if any setting or account is invalid
    /// - `Error::CapabilityMissing` if a bridge is missing and no desktop default exists
    pub fn build(self) -> Result<AuthConfig> {
        let http_client = match self.http_client {
            Some(client) => client,
            None => provide_default_http_client()?,
        };

        let file_system = match self.file_system {
            Some(fs) => fs,
            None => provide_default_file_system()?,
        };

        let user_interaction = match self.user_interaction {
            Some(interaction) => interaction,
            None => provide_default_user_interaction()?,
        };

        let config = AuthConfig {
            token_dir: self
                .token_dir
                .unwrap_or_else(|| PathBuf::from(DEFAULT_TOKEN_DIR)),
            expiry_margin: self.expiry_margin.unwrap_or(DEFAULT_EXPIRY_MARGIN),
            refresh_retry: self.refresh_retry.unwrap_or_else(default_refresh_retry),
            interactive_timeout: self
                .interactive_timeout
                .unwrap_or(DEFAULT_INTERACTIVE_TIMEOUT),
            device_poll_interval: self.device_poll_interval,
            device_code_expiry: self.device_code_expiry,
            accounts: self.accounts,
            http_client,
            file_system,
            user_interaction,
        };

        config.validate()?;

        Ok(config)
    }
}

fn default_refresh_retry() -> RetryPolicy {
    RetryPolicy {
        max_attempts: 3,
        base_delay: Duration::from_millis(500),
        max_delay: Duration::from_secs(5),
        use_exponential_backoff: true,
    }
}
