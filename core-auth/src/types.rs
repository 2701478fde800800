use chrono::{DateTime, Utc};
use core_runtime::config::{AccountDescriptor, AuthConfig};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

pub use core_runtime::config::{ClientDescriptor, ProviderTag};

/// The account a credential is requested for.
///
/// Immutable once built. The token file path is resolved up front so every
/// component agrees on where the account's credential lives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccountIdentity {
    pub email: String,
    pub provider: ProviderTag,
    pub client: ClientDescriptor,
    pub token_file: PathBuf,
}

impl AccountIdentity {
    pub fn new(
        email: impl Into<String>,
        provider: ProviderTag,
        client: ClientDescriptor,
        token_file: impl Into<PathBuf>,
    ) -> Self {
        Self {
            email: email.into(),
            provider,
            client,
            token_file: token_file.into(),
        }
    }

    /// Resolve a configured account, deriving its token file from the config.
    pub fn from_config(config: &AuthConfig, descriptor: &AccountDescriptor) -> Self {
        Self {
            email: descriptor.email.clone(),
            provider: descriptor.provider,
            client: descriptor.client.clone(),
            token_file: config.token_path(descriptor),
        }
    }

    /// Every enabled account in `config`, in configuration order.
    pub fn enabled(config: &AuthConfig) -> Vec<Self> {
        config
            .enabled_accounts()
            .map(|descriptor| Self::from_config(config, descriptor))
            .collect()
    }
}

impl fmt::Display for AccountIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.email, self.provider)
    }
}

/// A bearer credential for one account.
///
/// The refresh token may be absent; some grants never issue one. The
/// `Debug` implementation never prints token values.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credential {
    pub access_token: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
    pub token_type: String,
    pub expires_at: DateTime<Utc>,
    #[serde(default)]
    pub scopes: Vec<String>,
    pub provider: ProviderTag,
}

impl Credential {
    /// A bearer credential without refresh token or scopes.
    pub fn new(
        provider: ProviderTag,
        access_token: impl Into<String>,
        expires_at: DateTime<Utc>,
    ) -> Self {
        Self {
            access_token: access_token.into(),
            refresh_token: None,
            token_type: "Bearer".to_string(),
            expires_at,
            scopes: Vec::new(),
            provider,
        }
    }

    pub fn with_refresh_token(mut self, refresh_token: impl Into<String>) -> Self {
        self.refresh_token = Some(refresh_token.into());
        self
    }

    pub fn with_scopes<I, S>(mut self, scopes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.scopes = scopes.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_token_type(mut self, token_type: impl Into<String>) -> Self {
        self.token_type = token_type.into();
        self
    }

    /// `true` when the credential is still usable at `now` with `margin` to spare.
    ///
    /// ```
    /// use chrono::{Duration as ChronoDuration, Utc};
    /// use core_auth::{Credential, ProviderTag};
    /// use std::time::Duration;
    ///
    /// let now = Utc::now();
    /// let credential = Credential::new(ProviderTag::Gmail, "AT", now + ChronoDuration::seconds(90));
    ///
    /// assert!(credential.is_valid_at(now, Duration::from_secs(60)));
    /// assert!(!credential.is_valid_at(now, Duration::from_secs(120)));
    /// ```
    pub fn is_valid_at(&self, now: DateTime<Utc>, margin: Duration) -> bool {
        let margin = chrono::Duration::from_std(margin)
            .unwrap_or_else(|_| chrono::Duration::days(36_500));
        match now.checked_add_signed(margin) {
            Some(threshold) => self.expires_at > threshold,
            None => false,
        }
    }

    /// Whether a silent refresh can be attempted.
    pub fn can_refresh(&self) -> bool {
        self.refresh_token
            .as_deref()
            .is_some_and(|token| !token.is_empty())
    }

    /// Seconds until expiry at `now`; negative once expired.
    pub fn seconds_until_expiry(&self, now: DateTime<Utc>) -> i64 {
        (self.expires_at - now).num_seconds()
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("access_token", &"[REDACTED]")
            .field(
                "refresh_token",
                &self.refresh_token.as_ref().map(|_| "[REDACTED]"),
            )
            .field("token_type", &self.token_type)
            .field("expires_at", &self.expires_at)
            .field("scopes", &self.scopes)
            .field("provider", &self.provider)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;

    fn credential(expires_in_secs: i64) -> (Credential, DateTime<Utc>) {
        let now = Utc::now();
        let credential = Credential::new(
            ProviderTag::Outlook,
            "AT-secret",
            now + ChronoDuration::seconds(expires_in_secs),
        );
        (credential, now)
    }

    #[test]
    fn test_validity_respects_margin() {
        let margin = Duration::from_secs(60);

        let (fresh, now) = credential(3600);
        assert!(fresh.is_valid_at(now, margin));

        let (near_expiry, now) = credential(30);
        assert!(!near_expiry.is_valid_at(now, margin));

        let (exactly_margin, now) = credential(60);
        assert!(!exactly_margin.is_valid_at(now, margin));

        let (expired, now) = credential(-10);
        assert!(!expired.is_valid_at(now, Duration::ZERO));
        assert!(expired.seconds_until_expiry(now) <= -10);
    }

    #[test]
    fn test_can_refresh() {
        let (credential, _) = credential(10);
        assert!(!credential.can_refresh());
        assert!(!credential.clone().with_refresh_token("").can_refresh());
        assert!(credential.with_refresh_token("RT1").can_refresh());
    }

    #[test]
    fn test_debug_redacts_tokens() {
        let (credential, _) = credential(10);
        let debug = format!("{:?}", credential.with_refresh_token("RT-secret"));

        assert!(!debug.contains("AT-secret"));
        assert!(!debug.contains("RT-secret"));
        assert!(debug.contains("[REDACTED]"));
    }

    #[test]
    fn test_account_from_config_derives_token_file() {
        use bridge_desktop::{DesktopUserInteraction, ReqwestHttpClient, TokioFileSystem};
        use std::sync::Arc;

        let descriptor = AccountDescriptor::new(
            "Personal",
            "me@gmail.com",
            ProviderTag::Gmail,
            ClientDescriptor::gmail("id", Some("secret")),
        );
        let config = AuthConfig::builder()
            .token_dir("/tmp/tokens")
            .account(descriptor.clone())
            .account(
                AccountDescriptor::new(
                    "Work",
                    "me@contoso.com",
                    ProviderTag::Outlook,
                    ClientDescriptor::outlook("app", "common"),
                )
                .disabled(),
            )
            .http_client(Arc::new(ReqwestHttpClient::new().unwrap()))
            .file_system(Arc::new(TokioFileSystem::new()))
            .user_interaction(Arc::new(DesktopUserInteraction::without_browser()))
            .build()
            .unwrap();

        let account = AccountIdentity::from_config(&config, &descriptor);
        assert_eq!(
            account.token_file,
            PathBuf::from("/tmp/tokens/gmail_me_gmail.com.json")
        );
        assert_eq!(account.to_string(), "me@gmail.com (Gmail)");

        let enabled = AccountIdentity::enabled(&config);
        assert_eq!(enabled, vec![account]);
    }
}
