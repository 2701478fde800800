//! Scripted bridge doubles for unit tests.

use async_trait::async_trait;
use bridge_traits::error::Result as BridgeResult;
use bridge_traits::http::{HttpClient, HttpRequest, HttpResponse, RetryPolicy};
use bridge_traits::{BridgeError, UserInteraction};
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;

/// Replays queued responses in order and records every request.
///
/// Once the queue is empty the `fallback` response (if any) is repeated,
/// each one after `stall` has elapsed.
#[derive(Default)]
pub struct ScriptedHttpClient {
    responses: Mutex<VecDeque<BridgeResult<HttpResponse>>>,
    fallback: Mutex<Option<HttpResponse>>,
    stall: Mutex<Option<Duration>>,
    requests: Mutex<Vec<HttpRequest>>,
    policies: Mutex<Vec<RetryPolicy>>,
}

impl ScriptedHttpClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_json(&self, status: u16, body: serde_json::Value) {
        self.push_raw(status, body.to_string());
    }

    pub fn push_raw(&self, status: u16, body: impl Into<String>) {
        self.responses
            .lock()
            .unwrap()
            .push_back(Ok(HttpResponse::new(status, body.into())));
    }

    pub fn push_error(&self, error: BridgeError) {
        self.responses.lock().unwrap().push_back(Err(error));
    }

    pub fn repeat_json(&self, status: u16, body: serde_json::Value) {
        *self.fallback.lock().unwrap() = Some(HttpResponse::new(status, body.to_string()));
    }

    /// Hold every request past the scripted queue for `delay`.
    pub fn stall_after_script(&self, delay: Duration) {
        *self.stall.lock().unwrap() = Some(delay);
    }

    pub fn requests(&self) -> Vec<HttpRequest> {
        self.requests.lock().unwrap().clone()
    }

    /// Policies passed to `execute_with_retry`, in call order.
    pub fn policies(&self) -> Vec<RetryPolicy> {
        self.policies.lock().unwrap().clone()
    }

    /// Decode a form-encoded request body.
    pub fn form_of(request: &HttpRequest) -> HashMap<String, String> {
        let body = request.body.clone().unwrap_or_default();
        serde_urlencoded::from_bytes(&body).unwrap()
    }
}

#[async_trait]
impl HttpClient for ScriptedHttpClient {
    async fn execute(&self, request: HttpRequest) -> BridgeResult<HttpResponse> {
        self.requests.lock().unwrap().push(request);
        let next = self.responses.lock().unwrap().pop_front();
        if let Some(next) = next {
            return next;
        }
        let stall = *self.stall.lock().unwrap();
        if let Some(delay) = stall {
            tokio::time::sleep(delay).await;
        }
        let fallback = self.fallback.lock().unwrap().clone();
        match fallback {
            Some(response) => Ok(response),
            None => Err(BridgeError::OperationFailed(
                "no scripted response left".to_string(),
            )),
        }
    }

    async fn execute_with_retry(
        &self,
        request: HttpRequest,
        policy: RetryPolicy,
    ) -> BridgeResult<HttpResponse> {
        self.policies.lock().unwrap().push(policy);
        self.execute(request).await
    }
}

/// Records what the flow showed and opened.
#[derive(Default)]
pub struct RecordingInteraction {
    messages: Mutex<Vec<String>>,
    opened: Mutex<Vec<String>>,
    fail_open: bool,
}

impl RecordingInteraction {
    pub fn new() -> Self {
        Self::default()
    }

    /// An interaction whose browser launch always fails.
    pub fn without_browser() -> Self {
        Self {
            fail_open: true,
            ..Self::default()
        }
    }

    pub fn messages(&self) -> Vec<String> {
        self.messages.lock().unwrap().clone()
    }

    pub fn opened(&self) -> Vec<String> {
        self.opened.lock().unwrap().clone()
    }

    /// Wait until the flow has opened (or tried to open) a URL.
    pub async fn next_opened_url(&self) -> String {
        loop {
            if let Some(url) = self.opened.lock().unwrap().first().cloned() {
                return url;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }
}

#[async_trait]
impl UserInteraction for RecordingInteraction {
    async fn open_url(&self, url: &str) -> BridgeResult<()> {
        self.opened.lock().unwrap().push(url.to_string());
        if self.fail_open {
            return Err(BridgeError::NotAvailable("no browser".to_string()));
        }
        Ok(())
    }

    fn show_message(&self, message: &str) {
        self.messages.lock().unwrap().push(message.to_string());
    }
}
