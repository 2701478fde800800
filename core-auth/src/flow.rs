//! Provider Flow Capability
//!
//! Each provider family obtains credentials differently, but the lifecycle
//! manager only ever needs two operations from it. Implementations translate
//! every provider and transport failure into [`FlowError`].
//!
//! | Provider | Implementation | Interactive step |
//! |----------|----------------|------------------|
//! | Gmail | [`AuthorizationCodeFlow`](crate::AuthorizationCodeFlow) | browser consent with a loopback redirect |
//! | Outlook | [`DeviceCodeFlow`](crate::DeviceCodeFlow) | code entered on another device, polled |

use crate::error::FlowError;
use crate::types::{AccountIdentity, Credential};
use async_trait::async_trait;

/// Obtains credentials for one provider family.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ProviderFlow: Send + Sync {
    /// Exchange the credential's refresh token for a new access token.
    ///
    /// Must not prompt the user. A rejected or missing refresh token is
    /// `FlowError::InvalidGrant`.
    async fn refresh(
        &self,
        account: &AccountIdentity,
        credential: &Credential,
    ) -> Result<Credential, FlowError>;

    /// Ask the user for consent and return the issued credential.
    ///
    /// Must terminate on its own: success, denial, or a timeout.
    async fn interactive_authenticate(
        &self,
        account: &AccountIdentity,
    ) -> Result<Credential, FlowError>;
}
