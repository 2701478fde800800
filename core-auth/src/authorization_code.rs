//! Authorization-Code Flow (Gmail)
//!
//! Interactive sign-in uses a loopback redirect:
//!
//! 1. Bind an OS-assigned port on `127.0.0.1`.
//! 2. Send the user to the consent page with `http://127.0.0.1:<port>/` as
//!    `redirect_uri`, a PKCE S256 challenge and a random `state`.
//! 3. Accept connections until one carries `code` or `error`; anything else
//!    (favicon requests and the like) gets a 404 and is ignored.
//! 4. Exchange the code at the token endpoint and close the listener.
//!
//! The wait is bounded by the configured interactive timeout and can be cut
//! short through the flow's [`CancellationToken`].

use crate::error::FlowError;
use crate::flow::ProviderFlow;
use crate::oauth::{PkceVerifier, TokenEndpoint, GOOGLE_AUTH_URL, GOOGLE_TOKEN_URL};
use crate::types::{AccountIdentity, Credential};
use async_trait::async_trait;
use bridge_traits::http::HttpClient;
use bridge_traits::{Clock, SystemClock, UserInteraction};
use core_runtime::config::{AuthConfig, DEFAULT_INTERACTIVE_TIMEOUT};
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::{sleep_until, timeout, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};
use url::Url;

const SUCCESS_HTML: &str = "<html><body><h1>Authentication successful</h1>\
    <p>You may close this window and return to the application.</p></body></html>";
const ERROR_HTML: &str = "<html><body><h1>Authentication failed</h1>\
    <p>You may close this window. Re-run the application to try again.</p></body></html>";
const NOT_FOUND_HTML: &str = "<html><body><h1>Not found</h1></body></html>";

const MAX_REQUEST_BYTES: usize = 8192;
const REQUEST_READ_TIMEOUT: Duration = Duration::from_secs(5);

/// Query parameters of the redirect back to the loopback listener.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
struct CallbackPayload {
    code: Option<String>,
    state: Option<String>,
    error: Option<String>,
    error_description: Option<String>,
}

/// Browser consent with a loopback redirect, then code exchange.
pub struct AuthorizationCodeFlow {
    interaction: Arc<dyn UserInteraction>,
    clock: Arc<dyn Clock>,
    auth_url: String,
    token_endpoint: TokenEndpoint,
    timeout: Duration,
    cancel: CancellationToken,
}

impl AuthorizationCodeFlow {
    /// Flow against Google's production endpoints.
    pub fn new(http: Arc<dyn HttpClient>, interaction: Arc<dyn UserInteraction>) -> Self {
        Self {
            interaction,
            clock: Arc::new(SystemClock),
            auth_url: GOOGLE_AUTH_URL.to_string(),
            token_endpoint: TokenEndpoint::new(http, GOOGLE_TOKEN_URL),
            timeout: DEFAULT_INTERACTIVE_TIMEOUT,
            cancel: CancellationToken::new(),
        }
    }

    pub fn from_config(config: &AuthConfig) -> Self {
        Self::new(config.http_client.clone(), config.user_interaction.clone())
            .with_timeout(config.interactive_timeout)
    }

    /// Point the flow at other authorization and token endpoints.
    pub fn with_endpoints(
        mut self,
        auth_url: impl Into<String>,
        token_url: impl Into<String>,
        http: Arc<dyn HttpClient>,
    ) -> Self {
        self.auth_url = auth_url.into();
        self.token_endpoint = TokenEndpoint::new(http, token_url);
        self
    }

    /// Upper bound on waiting for the browser redirect.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    /// Cancelling this token closes any listener that is waiting and makes
    /// later interactive attempts fail immediately.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    fn consent_url(
        &self,
        account: &AccountIdentity,
        redirect_uri: &str,
        pkce: &PkceVerifier,
    ) -> Result<String, FlowError> {
        let mut url = Url::parse(&self.auth_url)
            .map_err(|e| FlowError::FlowSetup(format!("invalid authorization URL: {e}")))?;

        url.query_pairs_mut()
            .append_pair("client_id", &account.client.client_id)
            .append_pair("redirect_uri", redirect_uri)
            .append_pair("response_type", "code")
            .append_pair("scope", &account.client.scopes.join(" "))
            .append_pair("state", pkce.state())
            .append_pair("code_challenge", &pkce.challenge())
            .append_pair("code_challenge_method", "S256")
            .append_pair("access_type", "offline")
            .append_pair("prompt", "consent")
            .append_pair("login_hint", &account.email);

        Ok(url.into())
    }

    /// Accept connections until the redirect arrives, the wait times out, or
    /// the flow is cancelled. The listener is dropped on return.
    async fn wait_for_code(
        &self,
        listener: TcpListener,
        pkce: &PkceVerifier,
    ) -> Result<String, FlowError> {
        let deadline = Instant::now() + self.timeout;

        loop {
            let (mut socket, peer) = tokio::select! {
                accepted = listener.accept() => accepted.map_err(|e| {
                    FlowError::Network(format!("redirect listener failed: {e}"))
                })?,
                _ = sleep_until(deadline) => return Err(self.timed_out()),
                _ = self.cancel.cancelled() => return Err(cancelled()),
            };

            // An idle connection (browser preconnect) must not hold off the
            // deadline or cancellation.
            let request = tokio::select! {
                request = read_request_head(&mut socket) => request,
                _ = sleep_until(deadline) => return Err(self.timed_out()),
                _ = self.cancel.cancelled() => return Err(cancelled()),
            };

            let Some(request) = request else {
                debug!(%peer, "Dropped unreadable connection on redirect listener");
                continue;
            };

            let Some(payload) = parse_callback_request(&request) else {
                respond(&mut socket, "404 Not Found", NOT_FOUND_HTML).await;
                continue;
            };

            let result = resolve_callback(payload, pkce);
            match &result {
                Ok(_) => respond(&mut socket, "200 OK", SUCCESS_HTML).await,
                Err(_) => respond(&mut socket, "400 Bad Request", ERROR_HTML).await,
            }
            return result;
        }
    }

    fn timed_out(&self) -> FlowError {
        FlowError::Timeout(format!(
            "no authorization response within {}s",
            self.timeout.as_secs()
        ))
    }

    async fn exchange_code(
        &self,
        account: &AccountIdentity,
        code: &str,
        redirect_uri: &str,
        pkce: &PkceVerifier,
    ) -> Result<Credential, FlowError> {
        let client = &account.client;
        let mut params = vec![
            ("grant_type", "authorization_code"),
            ("code", code),
            ("redirect_uri", redirect_uri),
            ("client_id", client.client_id.as_str()),
            ("code_verifier", pkce.verifier()),
        ];
        if let Some(secret) = client.client_secret.as_deref().filter(|s| !s.is_empty()) {
            params.push(("client_secret", secret));
        }

        let response = self.token_endpoint.request(&params).await.map_err(|e| {
            warn!(error = %e, "Authorization code exchange failed");
            FlowError::from(e)
        })?;

        let credential =
            response.into_credential(account.provider, self.clock.now(), None, &client.scopes);
        if credential.refresh_token.is_none() {
            warn!("Provider issued no refresh token; the next expiry will need consent again");
        }
        Ok(credential)
    }
}

#[async_trait]
impl ProviderFlow for AuthorizationCodeFlow {
    #[instrument(skip(self, account, credential), fields(account = %account.email))]
    async fn refresh(
        &self,
        account: &AccountIdentity,
        credential: &Credential,
    ) -> Result<Credential, FlowError> {
        self.token_endpoint
            .refresh(&account.client, credential, None, self.clock.as_ref())
            .await
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

        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0))
            .await
            .map_err(|e| FlowError::FlowSetup(format!("could not start redirect listener: {e}")))?;
        let port = listener
            .local_addr()
            .map_err(|e| FlowError::FlowSetup(format!("redirect listener has no address: {e}")))?
            .port();
        let redirect_uri = format!("http://127.0.0.1:{port}/");

        let pkce = PkceVerifier::new();
        let consent_url = self.consent_url(account, &redirect_uri, &pkce)?;

        info!(port, "Waiting for browser consent");
        self.interaction.show_message(&format!(
            "Sign in to {} in your browser. If it does not open, visit:\n{consent_url}",
            account
        ));
        if let Err(e) = self.interaction.open_url(&consent_url).await {
            warn!(error = %e, "Could not open a browser; the consent link was printed instead");
        }

        let code = self.wait_for_code(listener, &pkce).await?;
        debug!("Authorization code received");

        self.exchange_code(account, &code, &redirect_uri, &pkce).await
    }
}

fn cancelled() -> FlowError {
    FlowError::Timeout("sign-in cancelled".to_string())
}

async fn read_request_head(socket: &mut TcpStream) -> Option<String> {
    let mut buffer = vec![0u8; MAX_REQUEST_BYTES];
    let mut filled = 0;

    let read_line = async {
        while filled < buffer.len() {
            let n = socket.read(&mut buffer[filled..]).await.ok()?;
            if n == 0 {
                break;
            }
            filled += n;
            if buffer[..filled].windows(2).any(|w| w == b"\r\n") {
                break;
            }
        }
        Some(())
    };
    timeout(REQUEST_READ_TIMEOUT, read_line).await.ok()??;

    (filled > 0).then(|| String::from_utf8_lossy(&buffer[..filled]).into_owned())
}

/// `None` for anything that is not a GET carrying `code` or `error`.
fn parse_callback_request(request: &str) -> Option<CallbackPayload> {
    let mut parts = request.lines().next()?.split_whitespace();
    if parts.next()? != "GET" {
        return None;
    }
    let target = parts.next().filter(|t| t.starts_with('/'))?;
    let url = Url::parse(&format!("http://127.0.0.1{target}")).ok()?;

    let mut payload = CallbackPayload::default();
    for (key, value) in url.query_pairs() {
        match key.as_ref() {
            "code" => payload.code = Some(value.into_owned()),
            "state" => payload.state = Some(value.into_owned()),
            "error" => payload.error = Some(value.into_owned()),
            "error_description" => payload.error_description = Some(value.into_owned()),
            _ => {}
        }
    }

    (payload.code.is_some() || payload.error.is_some()).then_some(payload)
}

fn resolve_callback(payload: CallbackPayload, pkce: &PkceVerifier) -> Result<String, FlowError> {
    match payload.state.as_deref() {
        Some(state) if pkce.state_matches(state) => {}
        _ => {
            warn!("Authorization response state did not match the request");
            return Err(FlowError::FlowSetup(
                "authorization response state did not match the request".to_string(),
            ));
        }
    }

    if let Some(error) = payload.error {
        return Err(match error.as_str() {
            "access_denied" => FlowError::UserDeniedConsent,
            other => FlowError::FlowSetup(match payload.error_description {
                Some(description) => format!("authorization server returned {other}: {description}"),
                None => format!("authorization server returned {other}"),
            }),
        });
    }

    payload
        .code
        .filter(|c| !c.is_empty())
        .ok_or_else(|| FlowError::FlowSetup("authorization response carried no code".to_string()))
}

async fn respond(socket: &mut TcpStream, status: &str, body: &str) {
    let response = format!(
        "HTTP/1.1 {status}\r\nContent-Type: text/html; charset=utf-8\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
        body.len()
    );
    if let Err(e) = socket.write_all(response.as_bytes()).await {
        debug!(error = %e, "Could not answer redirect request");
    }
    let _ = socket.shutdown().await;
}
