//! # Authentication Module
//!
//! OAuth 2.0 token lifecycle for Gmail and Outlook mailboxes.
//!
//! ## Overview
//!
//! For every configured account this crate hands out a credential that is
//! valid right now. It reuses the cached token file when it can, refreshes
//! silently when the access token expired, and only falls back to an
//! interactive sign-in when nothing else works.
//!
//! ## Features
//!
//! - Authorization-code flow with PKCE and a loopback redirect (Gmail)
//! - Device-code flow with polling (Outlook / Microsoft Graph)
//! - Refresh with bounded retries on network errors
//! - Atomic, owner-only token files compatible with the Google and MSAL formats
//! - Per-account serialization of concurrent requests
//! - Lifecycle checkpoints for progress reporting

pub mod authorization_code;
pub mod client;
pub mod device_code;
pub mod error;
pub mod flow;
pub mod manager;
pub mod oauth;
pub mod progress;
pub mod store;
pub mod token_file;
pub mod types;

#[cfg(test)]
mod test_support;

pub use authorization_code::AuthorizationCodeFlow;
pub use client::{AuthorizedClient, ServiceClientFactory};
pub use device_code::DeviceCodeFlow;
pub use error::{AuthError, FlowError, Result};
pub use flow::ProviderFlow;
pub use manager::{AuthOutcome, LifecycleState, TokenLifecycleManager};
pub use oauth::{PkceVerifier, TokenEndpoint};
pub use progress::{EventBusProgressSink, NoopProgressSink, ProgressEvent, ProgressSink};
pub use store::{CredentialStore, SaveOutcome};
pub use types::{AccountIdentity, ClientDescriptor, Credential, ProviderTag};
