//! OAuth 2.0 Token Endpoint Plumbing
//!
//! Shared by the authorization-code and device-code flows:
//!
//! - Well-known Google and Microsoft identity endpoints
//! - PKCE (RFC 7636) verifier and state generation
//! - Form-encoded token requests over the host [`HttpClient`]
//! - Translation of OAuth error bodies into [`FlowError`]
//!
//! # Security
//!
//! Token values, codes and verifiers are never logged. Error bodies returned
//! by the provider are truncated before they reach a log line.

use crate::error::FlowError;
use crate::types::{ClientDescriptor, Credential, ProviderTag};
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use bridge_traits::http::{HttpClient, HttpMethod, HttpRequest, RetryPolicy};
use bridge_traits::Clock;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use rand::Rng;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use sha2::{Digest, Sha256};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, instrument, warn};

/// Google consent page.
pub const GOOGLE_AUTH_URL: &str = "https://accounts.google.com/o/oauth2/v2/auth";

/// Google token endpoint.
pub const GOOGLE_TOKEN_URL: &str = "https://oauth2.googleapis.com/token";

/// Microsoft identity platform host; the tenant is appended per account.
pub const MICROSOFT_LOGIN_URL: &str = "https://login.microsoftonline.com";

/// Per-request bound for token endpoint calls.
const TOKEN_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Longest provider error body that is copied into logs and messages.
const MAX_ERROR_BODY_LENGTH: usize = 200;

/// Lifetime assumed when a token response omits `expires_in`.
const DEFAULT_EXPIRES_IN_SECS: i64 = 3600;

/// PKCE code verifier plus the CSRF `state` that travels with it.
///
/// Only the S256 challenge leaves the process before the code exchange.
#[derive(Clone)]
pub struct PkceVerifier {
    verifier: String,
    state: String,
}

impl PkceVerifier {
    /// 32 random bytes of verifier (43 characters once encoded) and 16 of state.
    pub fn new() -> Self {
        let mut rng = rand::thread_rng();

        let mut verifier_bytes = [0u8; 32];
        rng.fill(&mut verifier_bytes);

        let mut state_bytes = [0u8; 16];
        rng.fill(&mut state_bytes);

        Self {
            verifier: URL_SAFE_NO_PAD.encode(verifier_bytes),
            state: URL_SAFE_NO_PAD.encode(state_bytes),
        }
    }

    pub fn verifier(&self) -> &str {
        &self.verifier
    }

    pub fn state(&self) -> &str {
        &self.state
    }

    /// `BASE64URL(SHA256(verifier))`
    pub fn challenge(&self) -> String {
        URL_SAFE_NO_PAD.encode(Sha256::digest(self.verifier.as_bytes()))
    }

    /// Compare a returned `state` without short-circuiting on the first mismatch.
    pub fn state_matches(&self, candidate: &str) -> bool {
        let expected = self.state.as_bytes();
        let candidate = candidate.as_bytes();
        expected.len() == candidate.len()
            && expected
                .iter()
                .zip(candidate)
                .fold(0u8, |acc, (a, b)| acc | (a ^ b))
                == 0
    }
}

impl Default for PkceVerifier {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for PkceVerifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PkceVerifier")
            .field("verifier", &"[REDACTED]")
            .field("state", &self.state)
            .finish()
    }
}

/// Successful token endpoint response (RFC 6749 §5.1).
#[derive(Debug, Clone, Deserialize)]
pub struct TokenResponse {
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
    #[serde(default)]
    pub expires_in: Option<i64>,
    #[serde(default)]
    pub token_type: Option<String>,
    #[serde(default)]
    pub scope: Option<String>,
}

impl TokenResponse {
    /// Build a credential issued at `now`.
    ///
    /// Fields the response leaves out are carried over from `previous` (a
    /// refresh usually omits the refresh token and often the scope), and
    /// scopes finally fall back to the ones that were requested.
    pub fn into_credential(
        self,
        provider: ProviderTag,
        now: DateTime<Utc>,
        previous: Option<&Credential>,
        requested_scopes: &[String],
    ) -> Credential {
        let lifetime = self.expires_in.unwrap_or(DEFAULT_EXPIRES_IN_SECS).max(0);
        let expires_at = now
            .checked_add_signed(ChronoDuration::seconds(lifetime))
            .unwrap_or(now);

        let scopes = match self.scope.as_deref().map(str::trim) {
            Some(scope) if !scope.is_empty() => {
                scope.split_whitespace().map(str::to_string).collect()
            }
            _ => previous
                .map(|p| p.scopes.clone())
                .filter(|s| !s.is_empty())
                .unwrap_or_else(|| requested_scopes.to_vec()),
        };

        let refresh_token = self
            .refresh_token
            .filter(|t| !t.is_empty())
            .or_else(|| previous.and_then(|p| p.refresh_token.clone()));

        Credential {
            access_token: self.access_token,
            refresh_token,
            token_type: self
                .token_type
                .filter(|t| !t.is_empty())
                .unwrap_or_else(|| "Bearer".to_string()),
            expires_at,
            scopes,
            provider,
        }
    }
}

/// OAuth error body (RFC 6749 §5.2).
#[derive(Debug, Clone, Deserialize)]
struct OAuthErrorBody {
    error: String,
    #[serde(default)]
    error_description: Option<String>,
}

/// Failure talking to a token-style endpoint, before flow classification.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TokenEndpointError {
    #[error("transport failure: {0}")]
    Transport(String),

    #[error("endpoint returned HTTP {status} ({})", .error.as_deref().unwrap_or("no error code"))]
    Rejected {
        status: u16,
        error: Option<String>,
        description: Option<String>,
    },

    #[error("unreadable endpoint response: {0}")]
    Malformed(String),
}

impl TokenEndpointError {
    /// The OAuth `error` code, if the provider sent one.
    pub fn error_code(&self) -> Option<&str> {
        match self {
            TokenEndpointError::Rejected { error, .. } => error.as_deref(),
            _ => None,
        }
    }
}

impl From<TokenEndpointError> for FlowError {
    fn from(err: TokenEndpointError) -> Self {
        match err {
            TokenEndpointError::Transport(reason) => FlowError::Network(reason),
            TokenEndpointError::Malformed(reason) => FlowError::Network(reason),
            TokenEndpointError::Rejected {
                status,
                error,
                description,
            } => {
                let detail = match (&error, &description) {
                    (Some(code), Some(text)) => format!("{code}: {text}"),
                    (Some(code), None) => code.clone(),
                    (None, _) => format!("HTTP {status}"),
                };
                match error.as_deref() {
                    Some("invalid_grant") => FlowError::InvalidGrant(detail),
                    Some("access_denied") | Some("authorization_declined") => {
                        FlowError::UserDeniedConsent
                    }
                    Some("expired_token") | Some("code_expired") => FlowError::Timeout(detail),
                    Some("invalid_client")
                    | Some("unauthorized_client")
                    | Some("invalid_scope")
                    | Some("invalid_request")
                    | Some("unsupported_grant_type") => FlowError::FlowSetup(detail),
                    _ if status >= 500 || status == 429 => FlowError::Network(detail),
                    _ => FlowError::InvalidGrant(detail),
                }
            }
        }
    }
}

/// Truncate a provider error body for logging.
pub(crate) fn sanitize_error_body(body: &str) -> String {
    let cleaned: String = body
        .chars()
        .map(|c| if c.is_control() { ' ' } else { c })
        .collect();
    let cleaned = cleaned.trim();

    if cleaned.chars().count() > MAX_ERROR_BODY_LENGTH {
        let truncated: String = cleaned.chars().take(MAX_ERROR_BODY_LENGTH).collect();
        format!("{truncated}... (truncated)")
    } else {
        cleaned.to_string()
    }
}

/// POST `params` form-encoded to `url` and decode a JSON success body.
///
/// Non-2xx responses become [`TokenEndpointError::Rejected`] carrying the
/// OAuth error code when the body has one.
///
/// Sent exactly once: codes and refresh tokens may be single-use, and
/// retrying is the lifecycle manager's decision.
pub(crate) async fn post_form<T: DeserializeOwned>(
    http: &dyn HttpClient,
    url: &str,
    params: &[(&str, &str)],
) -> Result<T, TokenEndpointError> {
    let request = HttpRequest::new(HttpMethod::Post, url)
        .header("Accept", "application/json")
        .form(params)
        .map_err(|e| TokenEndpointError::Malformed(e.to_string()))?
        .timeout(TOKEN_REQUEST_TIMEOUT);

    let response = http
        .execute_with_retry(request, RetryPolicy::no_retry())
        .await
        .map_err(|e| TokenEndpointError::Transport(e.to_string()))?;

    if !response.is_success() {
        let parsed: Option<OAuthErrorBody> = serde_json::from_slice(&response.body).ok();
        let body = String::from_utf8_lossy(&response.body);
        debug!(
            status = response.status,
            error = parsed.as_ref().map(|p| p.error.as_str()).unwrap_or("-"),
            body = %sanitize_error_body(&body),
            "Endpoint rejected request"
        );
        let (error, description) = match parsed {
            Some(p) => (Some(p.error), p.error_description.map(|d| sanitize_error_body(&d))),
            None => (None, None),
        };
        return Err(TokenEndpointError::Rejected {
            status: response.status,
            error,
            description,
        });
    }

    response
        .json()
        .map_err(|e| TokenEndpointError::Malformed(e.to_string()))
}

/// A provider token endpoint bound to the host HTTP client.
#[derive(Clone)]
pub struct TokenEndpoint {
    http: Arc<dyn HttpClient>,
    url: String,
}

impl TokenEndpoint {
    pub fn new(http: Arc<dyn HttpClient>, url: impl Into<String>) -> Self {
        Self {
            http,
            url: url.into(),
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Issue one token request with the given grant parameters.
    pub async fn request(&self, params: &[(&str, &str)]) -> Result<TokenResponse, TokenEndpointError> {
        let response: TokenResponse = post_form(self.http.as_ref(), &self.url, params).await?;
        if response.access_token.trim().is_empty() {
            return Err(TokenEndpointError::Malformed(
                "token response carried an empty access_token".to_string(),
            ));
        }
        Ok(response)
    }

    /// `refresh_token` grant for `credential`.
    ///
    /// `scope` is sent when the provider needs the scope set restated
    /// (Microsoft identity platform).
    #[instrument(skip(self, client, credential, clock), fields(provider = %credential.provider))]
    pub async fn refresh(
        &self,
        client: &ClientDescriptor,
        credential: &Credential,
        scope: Option<&str>,
        clock: &dyn Clock,
    ) -> Result<Credential, FlowError> {
        let refresh_token = credential
            .refresh_token
            .as_deref()
            .filter(|t| !t.is_empty())
            .ok_or_else(|| FlowError::InvalidGrant("no refresh token cached".to_string()))?;

        let mut params = vec![
            ("grant_type", "refresh_token"),
            ("refresh_token", refresh_token),
            ("client_id", client.client_id.as_str()),
        ];
        if let Some(secret) = client.client_secret.as_deref().filter(|s| !s.is_empty()) {
            params.push(("client_secret", secret));
        }
        if let Some(scope) = scope {
            params.push(("scope", scope));
        }

        match self.request(&params).await {
            Ok(response) => {
                let refreshed = response.into_credential(
                    credential.provider,
                    clock.now(),
                    Some(credential),
                    &client.scopes,
                );
                debug!(
                    expires_in = refreshed.seconds_until_expiry(clock.now()),
                    rotated = refreshed.refresh_token != credential.refresh_token,
                    "Refresh grant succeeded"
                );
                Ok(refreshed)
            }
            Err(e) => {
                warn!(error = %e, "Refresh grant failed");
                Err(e.into())
            }
        }
    }
}

impl std::fmt::Debug for TokenEndpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenEndpoint").field("url", &self.url).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::ScriptedHttpClient;
    use bridge_traits::{BridgeError, FixedClock};
    use chrono::TimeZone;
    use serde_json::json;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2030, 1, 1, 12, 0, 0).unwrap()
    }

    #[test]
    fn test_pkce_verifier_generation() {
        let pkce = PkceVerifier::new();

        assert_eq!(pkce.verifier().len(), 43);
        assert!(!pkce.state().is_empty());
        assert_ne!(pkce.verifier(), PkceVerifier::new().verifier());
        assert!(!format!("{pkce:?}").contains(pkce.verifier()));
    }

    #[test]
    fn test_pkce_challenge_is_s256_of_verifier() {
        let pkce = PkceVerifier::new();
        let expected = URL_SAFE_NO_PAD.encode(Sha256::digest(pkce.verifier().as_bytes()));

        assert_eq!(pkce.challenge(), expected);
        assert!(!pkce.challenge().contains('='));
    }

    #[test]
    fn test_state_matches() {
        let pkce = PkceVerifier::new();
        let state = pkce.state().to_string();

        assert!(pkce.state_matches(&state));
        assert!(!pkce.state_matches("forged"));
        assert!(!pkce.state_matches(""));
    }

    #[test]
    fn test_refresh_response_merges_previous_fields() {
        let previous = Credential::new(ProviderTag::Gmail, "AT1", now())
            .with_refresh_token("RT1")
            .with_scopes(["scope-a"]);
        let response: TokenResponse =
            serde_json::from_value(json!({"access_token": "AT2", "expires_in": 3599})).unwrap();

        let credential = response.into_credential(ProviderTag::Gmail, now(), Some(&previous), &[]);

        assert_eq!(credential.access_token, "AT2");
        assert_eq!(credential.refresh_token.as_deref(), Some("RT1"));
        assert_eq!(credential.scopes, vec!["scope-a".to_string()]);
        assert_eq!(credential.token_type, "Bearer");
        assert_eq!(credential.expires_at, now() + ChronoDuration::seconds(3599));
    }

    #[test]
    fn test_minimal_response_defaults() {
        let response: TokenResponse = serde_json::from_value(json!({"access_token": "AT"})).unwrap();
        let requested = vec!["Mail.Read".to_string()];

        let credential = response.into_credential(ProviderTag::Outlook, now(), None, &requested);

        assert_eq!(credential.expires_at, now() + ChronoDuration::seconds(3600));
        assert_eq!(credential.scopes, requested);
        assert!(credential.refresh_token.is_none());
    }

    #[test]
    fn test_response_scope_string_is_split() {
        let response: TokenResponse = serde_json::from_value(json!({
            "access_token": "AT",
            "refresh_token": "RT-new",
            "scope": "Mail.Read offline_access",
            "token_type": "bearer"
        }))
        .unwrap();

        let credential = response.into_credential(ProviderTag::Outlook, now(), None, &[]);

        assert_eq!(credential.scopes, vec!["Mail.Read", "offline_access"]);
        assert_eq!(credential.refresh_token.as_deref(), Some("RT-new"));
        assert_eq!(credential.token_type, "bearer");
    }

    #[test]
    fn test_error_classification() {
        let rejected = |status, code: Option<&str>| TokenEndpointError::Rejected {
            status,
            error: code.map(str::to_string),
            description: None,
        };

        assert!(matches!(
            FlowError::from(rejected(400, Some("invalid_grant"))),
            FlowError::InvalidGrant(_)
        ));
        assert!(matches!(
            FlowError::from(rejected(401, Some("invalid_client"))),
            FlowError::FlowSetup(_)
        ));
        assert!(matches!(
            FlowError::from(rejected(400, Some("invalid_scope"))),
            FlowError::FlowSetup(_)
        ));
        assert_eq!(
            FlowError::from(rejected(400, Some("access_denied"))),
            FlowError::UserDeniedConsent
        );
        assert!(matches!(
            FlowError::from(rejected(400, Some("expired_token"))),
            FlowError::Timeout(_)
        ));
        assert!(matches!(
            FlowError::from(rejected(503, None)),
            FlowError::Network(_)
        ));
        assert!(matches!(
            FlowError::from(rejected(429, Some("rate_limited"))),
            FlowError::Network(_)
        ));
        assert!(matches!(
            FlowError::from(TokenEndpointError::Transport("reset".into())),
            FlowError::Network(_)
        ));
    }

    #[test]
    fn test_sanitize_error_body() {
        let long = "x".repeat(500);
        let sanitized = sanitize_error_body(&long);
        assert!(sanitized.len() < 250);
        assert!(sanitized.ends_with("(truncated)"));

        assert_eq!(sanitize_error_body("line\nbreak"), "line break");
        assert_eq!(sanitize_error_body(&"é".repeat(300)).chars().count(), 200 + 15);
    }

    #[tokio::test]
    async fn test_refresh_sends_refresh_grant() {
        let http = Arc::new(ScriptedHttpClient::new());
        http.push_json(200, json!({"access_token": "AT2", "expires_in": 3600}));
        let endpoint = TokenEndpoint::new(http.clone(), GOOGLE_TOKEN_URL);
        let clock = FixedClock::new(now());

        let client = ClientDescriptor::gmail("client-id", Some("secret"));
        let previous = Credential::new(ProviderTag::Gmail, "AT1", now()).with_refresh_token("RT1");

        let refreshed = endpoint
            .refresh(&client, &previous, None, &clock)
            .await
            .unwrap();

        assert_eq!(refreshed.access_token, "AT2");
        assert_eq!(refreshed.refresh_token.as_deref(), Some("RT1"));
        assert_eq!(http.policies(), vec![RetryPolicy::no_retry()]);

        let requests = http.requests();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].url, GOOGLE_TOKEN_URL);
        let form = ScriptedHttpClient::form_of(&requests[0]);
        assert_eq!(form["grant_type"], "refresh_token");
        assert_eq!(form["refresh_token"], "RT1");
        assert_eq!(form["client_id"], "client-id");
        assert_eq!(form["client_secret"], "secret");
        assert!(!form.contains_key("scope"));
    }

    #[tokio::test]
    async fn test_refresh_without_refresh_token_is_invalid_grant() {
        let http = Arc::new(ScriptedHttpClient::new());
        let endpoint = TokenEndpoint::new(http.clone(), GOOGLE_TOKEN_URL);
        let clock = FixedClock::new(now());
        let credential = Credential::new(ProviderTag::Gmail, "AT1", now());

        let err = endpoint
            .refresh(&ClientDescriptor::gmail("id", None), &credential, None, &clock)
            .await
            .unwrap_err();

        assert!(matches!(err, FlowError::InvalidGrant(_)));
        assert!(http.requests().is_empty());
    }

    #[tokio::test]
    async fn test_rejected_refresh_carries_error_code() {
        let http = Arc::new(ScriptedHttpClient::new());
        http.push_json(
            400,
            json!({"error": "invalid_grant", "error_description": "Token has been expired or revoked."}),
        );
        let endpoint = TokenEndpoint::new(http, GOOGLE_TOKEN_URL);
        let clock = FixedClock::new(now());
        let credential = Credential::new(ProviderTag::Gmail, "AT1", now()).with_refresh_token("RT1");

        let err = endpoint
            .refresh(&ClientDescriptor::gmail("id", None), &credential, None, &clock)
            .await
            .unwrap_err();

        assert_eq!(
            err,
            FlowError::InvalidGrant("invalid_grant: Token has been expired or revoked.".into())
        );
    }

    #[tokio::test]
    async fn test_transport_and_malformed_failures_are_network() {
        let http = Arc::new(ScriptedHttpClient::new());
        http.push_error(BridgeError::Timeout("30s".into()));
        http.push_raw(200, "<html>proxy</html>");
        let endpoint = TokenEndpoint::new(http, GOOGLE_TOKEN_URL);

        let first = endpoint.request(&[("grant_type", "refresh_token")]).await;
        assert!(matches!(first, Err(TokenEndpointError::Transport(_))));

        let second = endpoint.request(&[("grant_type", "refresh_token")]).await;
        assert!(matches!(second, Err(TokenEndpointError::Malformed(_))));
    }
}
