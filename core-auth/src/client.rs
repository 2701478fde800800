//! Authorized mailbox API handles.
//!
//! Turns a valid credential into a handle that sends bearer-authenticated
//! requests to the provider's mail API. Nothing here knows about mail
//! semantics; callers pass paths relative to the mailbox root.

use crate::error::{AuthError, FlowError, Result};
use crate::manager::TokenLifecycleManager;
use crate::oauth::sanitize_error_body;
use crate::types::{AccountIdentity, Credential, ProviderTag};
use bridge_traits::{HttpClient, HttpMethod, HttpRequest, HttpResponse};
use serde::de::DeserializeOwned;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, instrument};

pub const GMAIL_API_BASE_URL: &str = "https://gmail.googleapis.com/gmail/v1/users/me";
pub const GRAPH_API_BASE_URL: &str = "https://graph.microsoft.com/v1.0/me";

const API_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Mailbox root for a provider.
pub fn api_base_url(provider: ProviderTag) -> &'static str {
    match provider {
        ProviderTag::Gmail => GMAIL_API_BASE_URL,
        ProviderTag::Outlook => GRAPH_API_BASE_URL,
    }
}

/// A credential bound to its provider's API.
#[derive(Clone)]
pub struct AuthorizedClient {
    base_url: String,
    credential: Credential,
    http: Arc<dyn HttpClient>,
}

impl AuthorizedClient {
    pub fn new(credential: Credential, http: Arc<dyn HttpClient>) -> Self {
        Self {
            base_url: api_base_url(credential.provider).to_string(),
            credential,
            http,
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn credential(&self) -> &Credential {
        &self.credential
    }

    /// GET `path` below the mailbox root.
    ///
    /// A 401 means the token was revoked after it was issued and maps to
    /// `AuthError::InvalidGrant`; the caller should sign in again.
    pub async fn get(&self, path: &str) -> Result<HttpResponse> {
        let url = format!(
            "{}/{}",
            self.base_url.trim_end_matches('/'),
            path.trim_start_matches('/')
        );
        debug!(url = %url, "Mailbox API request");

        let request = HttpRequest::new(HttpMethod::Get, url)
            .bearer_token(self.credential.access_token.clone())
            .header("Accept", "application/json")
            .timeout(API_REQUEST_TIMEOUT);

        let response = self
            .http
            .execute(request)
            .await
            .map_err(FlowError::from)?;

        match response.status {
            200..=299 => Ok(response),
            401 => Err(AuthError::InvalidGrant(
                "access token rejected by the mailbox API".to_string(),
            )),
            status => Err(AuthError::Network(format!(
                "mailbox API returned {}: {}",
                status,
                sanitize_error_body(&String::from_utf8_lossy(&response.body))
            ))),
        }
    }

    /// GET `path` and decode the JSON body.
    pub async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        let response = self.get(path).await?;
        response
            .json()
            .map_err(|e| AuthError::Network(format!("unexpected mailbox API response: {e}")))
    }
}

impl std::fmt::Debug for AuthorizedClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthorizedClient")
            .field("base_url", &self.base_url)
            .field("credential", &self.credential)
            .finish()
    }
}

/// Hands out [`AuthorizedClient`]s backed by the lifecycle manager.
#[derive(Clone)]
pub struct ServiceClientFactory {
    manager: Arc<TokenLifecycleManager>,
    http: Arc<dyn HttpClient>,
}

impl ServiceClientFactory {
    pub fn new(manager: Arc<TokenLifecycleManager>) -> Self {
        let http = manager.config().http_client.clone();
        Self { manager, http }
    }

    #[instrument(skip(self, account), fields(account = %account.email, provider = %account.provider))]
    pub async fn client_for(&self, account: &AccountIdentity) -> Result<AuthorizedClient> {
        let credential = self.manager.get_valid_credential(account).await?;
        Ok(AuthorizedClient::new(credential, self.http.clone()))
    }
}
