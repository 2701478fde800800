use bridge_traits::BridgeError;
use std::path::PathBuf;
use thiserror::Error;

/// Errors returned by a [`ProviderFlow`](crate::flow::ProviderFlow).
///
/// Provider and transport specifics are translated into this taxonomy inside
/// the flows; nothing provider-specific escapes past them.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FlowError {
    #[error("network error: {0}")]
    Network(String),

    #[error("grant rejected: {0}")]
    InvalidGrant(String),

    #[error("user denied consent")]
    UserDeniedConsent,

    #[error("timed out: {0}")]
    Timeout(String),

    #[error("flow setup failed: {0}")]
    FlowSetup(String),
}

impl FlowError {
    /// Only transient network failures are worth retrying.
    pub fn is_retryable(&self) -> bool {
        matches!(self, FlowError::Network(_))
    }
}

impl From<BridgeError> for FlowError {
    fn from(err: BridgeError) -> Self {
        match err {
            BridgeError::NotAvailable(message) => FlowError::FlowSetup(message),
            other => FlowError::Network(other.to_string()),
        }
    }
}

/// Errors surfaced to callers of the lifecycle manager.
///
/// Messages state what the user has to do next.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AuthError {
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Access was not granted ({0}). Re-run and approve access when prompted.")]
    UserDeniedConsent(String),

    #[error("Sign-in timed out ({0}). Re-run and complete sign-in before the code expires.")]
    Timeout(String),

    #[error("The provider rejected the stored grant ({0}). Sign in again to issue a new one.")]
    InvalidGrant(String),

    #[error("Could not reach the provider ({0}). Check the network connection and retry.")]
    Network(String),

    #[error("OAuth client setup problem: {0}. Check the client id, secret, tenant and scopes.")]
    FlowSetup(String),

    #[error(
        "Credential could not be saved to {}: {reason}. \
         Authentication succeeded, but you will need to sign in again next run.",
        .path.display()
    )]
    Persistence { path: PathBuf, reason: String },
}

impl AuthError {
    /// Whether re-running without configuration changes could succeed.
    pub fn is_recoverable(&self) -> bool {
        !matches!(self, AuthError::Configuration(_) | AuthError::FlowSetup(_))
    }
}

impl From<FlowError> for AuthError {
    fn from(err: FlowError) -> Self {
        match err {
            FlowError::Network(reason) => AuthError::Network(reason),
            FlowError::InvalidGrant(reason) => AuthError::InvalidGrant(reason),
            FlowError::UserDeniedConsent => {
                AuthError::UserDeniedConsent("consent was declined".to_string())
            }
            FlowError::Timeout(reason) => AuthError::Timeout(reason),
            FlowError::FlowSetup(reason) => AuthError::FlowSetup(reason),
        }
    }
}

impl From<core_runtime::Error> for AuthError {
    fn from(err: core_runtime::Error) -> Self {
        match err {
            core_runtime::Error::Config(message) => AuthError::Configuration(message),
            other => AuthError::Configuration(other.to_string()),
        }
    }
}

pub type Result<T> = std::result::Result<T, AuthError>;
