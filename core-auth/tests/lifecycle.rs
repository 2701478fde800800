//! End-to-end lifecycle runs against in-memory bridges.

use async_trait::async_trait;
use bridge_traits::error::Result as BridgeResult;
use bridge_traits::{
    BridgeError, FileSystemAccess, HttpClient, HttpRequest, HttpResponse, UserInteraction,
};
use bytes::Bytes;
use chrono::{Duration as ChronoDuration, Utc};
use core_auth::{
    AccountIdentity, AuthError, ClientDescriptor, Credential, CredentialStore, FlowError,
    LifecycleState, ProviderFlow, ProviderTag, TokenLifecycleManager,
};
use core_runtime::config::{AccountDescriptor, AuthConfig};
use serde_json::json;
use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

// ---------------------------------------------------------------------------
// Bridges
// ---------------------------------------------------------------------------

#[derive(Default)]
struct MemoryFileSystem {
    files: Mutex<HashMap<PathBuf, Bytes>>,
    read_only: bool,
}

impl MemoryFileSystem {
    fn read_only() -> Self {
        Self {
            read_only: true,
            ..Self::default()
        }
    }

    fn put(&self, path: &Path, data: impl Into<Bytes>) {
        self.files
            .lock()
            .unwrap()
            .insert(path.to_path_buf(), data.into());
    }

    fn get(&self, path: &Path) -> Option<Bytes> {
        self.files.lock().unwrap().get(path).cloned()
    }
}

#[async_trait]
impl FileSystemAccess for MemoryFileSystem {
    async fn get_data_directory(&self) -> BridgeResult<PathBuf> {
        Ok(PathBuf::from("/memory"))
    }

    async fn exists(&self, path: &Path) -> BridgeResult<bool> {
        Ok(self.files.lock().unwrap().contains_key(path))
    }

    async fn create_dir_all(&self, _path: &Path) -> BridgeResult<()> {
        if self.read_only {
            return Err(BridgeError::OperationFailed("read-only file system".into()));
        }
        Ok(())
    }

    async fn read_file(&self, path: &Path) -> BridgeResult<Bytes> {
        self.get(path).ok_or_else(|| {
            BridgeError::Io(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                "no such file",
            ))
        })
    }

    async fn write_file(&self, path: &Path, data: Bytes) -> BridgeResult<()> {
        if self.read_only {
            return Err(BridgeError::OperationFailed("read-only file system".into()));
        }
        self.put(path, data);
        Ok(())
    }

    async fn rename(&self, from: &Path, to: &Path) -> BridgeResult<()> {
        let mut files = self.files.lock().unwrap();
        let data = files
            .remove(from)
            .ok_or_else(|| BridgeError::OperationFailed("rename source missing".into()))?;
        files.insert(to.to_path_buf(), data);
        Ok(())
    }

    async fn delete_file(&self, path: &Path) -> BridgeResult<()> {
        self.files.lock().unwrap().remove(path);
        Ok(())
    }
}

/// Answers the device-code request, then reports `authorization_pending` forever.
#[derive(Default)]
struct PendingDeviceEndpoint {
    polls: AtomicUsize,
}

#[async_trait]
impl HttpClient for PendingDeviceEndpoint {
    async fn execute(&self, request: HttpRequest) -> BridgeResult<HttpResponse> {
        if request.url.ends_with("/devicecode") {
            let body = json!({
                "device_code": "DEV",
                "user_code": "ABCD-1234",
                "verification_uri": "https://microsoft.com/devicelogin",
                "expires_in": 900,
                "interval": 1
            });
            return Ok(HttpResponse::new(200, body.to_string()));
        }
        self.polls.fetch_add(1, Ordering::SeqCst);
        let body = json!({"error": "authorization_pending"});
        Ok(HttpResponse::new(400, body.to_string()))
    }
}

/// Answers the device-code request, then never answers a poll.
#[derive(Default)]
struct StalledTokenEndpoint {
    polls: AtomicUsize,
}

#[async_trait]
impl HttpClient for StalledTokenEndpoint {
    async fn execute(&self, request: HttpRequest) -> BridgeResult<HttpResponse> {
        if request.url.ends_with("/devicecode") {
            let body = json!({
                "device_code": "DEV",
                "user_code": "WXYZ-9876",
                "verification_uri": "https://microsoft.com/devicelogin",
                "expires_in": 900,
                "interval": 1
            });
            return Ok(HttpResponse::new(200, body.to_string()));
        }
        self.polls.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_secs(3600)).await;
        Err(BridgeError::Timeout("token endpoint never answered".into()))
    }
}

struct UnusedHttp;

#[async_trait]
impl HttpClient for UnusedHttp {
    async fn execute(&self, _request: HttpRequest) -> BridgeResult<HttpResponse> {
        Err(BridgeError::NotAvailable("network disabled in tests".into()))
    }
}

#[derive(Default)]
struct QuietInteraction {
    messages: Mutex<Vec<String>>,
}

#[async_trait]
impl UserInteraction for QuietInteraction {
    async fn open_url(&self, _url: &str) -> BridgeResult<()> {
        Ok(())
    }

    fn show_message(&self, message: &str) {
        self.messages.lock().unwrap().push(message.to_string());
    }
}

// ---------------------------------------------------------------------------
// Flow double
// ---------------------------------------------------------------------------

#[derive(Default)]
struct ScriptedFlow {
    refresh_results: Mutex<VecDeque<Result<Credential, FlowError>>>,
    interactive_results: Mutex<VecDeque<Result<Credential, FlowError>>>,
    refresh_calls: AtomicUsize,
    interactive_calls: AtomicUsize,
    refreshed_with: Mutex<Vec<Option<String>>>,
}

impl ScriptedFlow {
    fn on_refresh(self, result: Result<Credential, FlowError>) -> Self {
        self.refresh_results.lock().unwrap().push_back(result);
        self
    }

    fn on_interactive(self, result: Result<Credential, FlowError>) -> Self {
        self.interactive_results.lock().unwrap().push_back(result);
        self
    }

    fn refresh_calls(&self) -> usize {
        self.refresh_calls.load(Ordering::SeqCst)
    }

    fn interactive_calls(&self) -> usize {
        self.interactive_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ProviderFlow for ScriptedFlow {
    async fn refresh(
        &self,
        _account: &AccountIdentity,
        credential: &Credential,
    ) -> Result<Credential, FlowError> {
        self.refresh_calls.fetch_add(1, Ordering::SeqCst);
        self.refreshed_with
            .lock()
            .unwrap()
            .push(credential.refresh_token.clone());
        self.refresh_results
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Err(FlowError::Network("unscripted refresh".into())))
    }

    async fn interactive_authenticate(
        &self,
        _account: &AccountIdentity,
    ) -> Result<Credential, FlowError> {
        self.interactive_calls.fetch_add(1, Ordering::SeqCst);
        self.interactive_results
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Err(FlowError::Timeout("unscripted sign-in".into())))
    }
}

// ---------------------------------------------------------------------------
// Harness
// ---------------------------------------------------------------------------

struct Harness {
    fs: Arc<MemoryFileSystem>,
    config: Arc<AuthConfig>,
    account: AccountIdentity,
}

impl Harness {
    fn gmail() -> Self {
        Self::with_fs(Arc::new(MemoryFileSystem::default()))
    }

    fn with_fs(fs: Arc<MemoryFileSystem>) -> Self {
        let config = AuthConfig::builder()
            .token_dir("/memory/tokens")
            .account(AccountDescriptor::new(
                "Personal",
                "me@gmail.com",
                ProviderTag::Gmail,
                ClientDescriptor::gmail("client-id.apps.googleusercontent.com", Some("secret")),
            ))
            .http_client(Arc::new(UnusedHttp))
            .file_system(fs.clone())
            .user_interaction(Arc::new(QuietInteraction::default()))
            .build()
            .unwrap();
        let config = Arc::new(config);
        let account = AccountIdentity::enabled(&config).remove(0);
        Self {
            fs,
            config,
            account,
        }
    }

    fn manager(&self, flow: Arc<ScriptedFlow>) -> TokenLifecycleManager {
        TokenLifecycleManager::from_config(self.config.clone()).with_flow(ProviderTag::Gmail, flow)
    }

    async fn seed(&self, credential: &Credential) {
        CredentialStore::new(self.fs.clone())
            .save(&self.account.token_file, credential)
            .await
            .unwrap();
    }

    fn token_file(&self) -> Option<Bytes> {
        self.fs.get(&self.account.token_file)
    }
}

fn credential(access: &str, expires_in_secs: i64) -> Credential {
    Credential::new(
        ProviderTag::Gmail,
        access,
        Utc::now() + ChronoDuration::seconds(expires_in_secs),
    )
}

// ---------------------------------------------------------------------------
// Scenarios
// ---------------------------------------------------------------------------

#[tokio::test]
async fn first_sign_in_writes_token_file() {
    let harness = Harness::gmail();
    let issued = credential("AT1", 3600).with_refresh_token("RT1");
    let flow = Arc::new(ScriptedFlow::default().on_interactive(Ok(issued.clone())));

    let outcome = harness.manager(flow.clone()).authenticate(&harness.account).await.unwrap();

    assert_eq!(outcome.credential, issued);
    assert!(outcome.persistence_warning.is_none());
    assert_eq!(flow.interactive_calls(), 1);
    assert_eq!(flow.refresh_calls(), 0);

    let written: serde_json::Value =
        serde_json::from_slice(&harness.token_file().expect("token file written")).unwrap();
    assert_eq!(written["access_token"], "AT1");
    assert_eq!(written["refresh_token"], "RT1");
}

#[tokio::test]
async fn expired_credential_is_refreshed_silently() {
    let harness = Harness::gmail();
    harness
        .seed(&credential("AT1", -10).with_refresh_token("RT1"))
        .await;
    let flow = Arc::new(
        ScriptedFlow::default().on_refresh(Ok(credential("AT2", 3600).with_refresh_token("RT1"))),
    );

    let outcome = harness.manager(flow.clone()).authenticate(&harness.account).await.unwrap();

    assert_eq!(outcome.credential.access_token, "AT2");
    assert_eq!(flow.interactive_calls(), 0);
    assert_eq!(*flow.refreshed_with.lock().unwrap(), vec![Some("RT1".to_string())]);

    let stored = CredentialStore::new(harness.fs.clone())
        .load(&harness.account.token_file, ProviderTag::Gmail)
        .await
        .unwrap();
    assert_eq!(stored.access_token, "AT2");
}

#[tokio::test(start_paused = true)]
async fn unanswered_device_code_times_out() {
    let fs = Arc::new(MemoryFileSystem::default());
    let http = Arc::new(PendingDeviceEndpoint::default());
    let interaction = Arc::new(QuietInteraction::default());
    let config = AuthConfig::builder()
        .token_dir("/memory/tokens")
        .device_code_expiry(Duration::from_secs(5))
        .account(AccountDescriptor::new(
            "Work",
            "me@contoso.com",
            ProviderTag::Outlook,
            ClientDescriptor::outlook("app-id", "common"),
        ))
        .http_client(http.clone())
        .file_system(fs.clone())
        .user_interaction(interaction.clone())
        .build()
        .unwrap();
    let config = Arc::new(config);
    let account = AccountIdentity::enabled(&config).remove(0);
    let manager = TokenLifecycleManager::from_config(config);

    let started = tokio::time::Instant::now();
    let err = manager.authenticate(&account).await.unwrap_err();
    let elapsed = started.elapsed();

    assert!(matches!(err, AuthError::Timeout(_)), "got {err:?}");
    assert!(err.is_recoverable());
    assert!(elapsed >= Duration::from_secs(4), "gave up after {elapsed:?}");
    assert!(elapsed <= Duration::from_secs(6), "gave up after {elapsed:?}");
    assert!(http.polls.load(Ordering::SeqCst) >= 4);
    assert!(fs.get(&account.token_file).is_none());
    assert!(interaction
        .messages
        .lock()
        .unwrap()
        .iter()
        .any(|m| m.contains("ABCD-1234")));
}

#[tokio::test(start_paused = true)]
async fn stalled_token_endpoint_still_stops_at_code_expiry() {
    let http = Arc::new(StalledTokenEndpoint::default());
    let fs = Arc::new(MemoryFileSystem::default());
    let config = AuthConfig::builder()
        .token_dir("/memory/tokens")
        .device_code_expiry(Duration::from_secs(5))
        .account(AccountDescriptor::new(
            "Work",
            "me@contoso.com",
            ProviderTag::Outlook,
            ClientDescriptor::outlook("app-id", "common"),
        ))
        .http_client(http.clone())
        .file_system(fs.clone())
        .user_interaction(Arc::new(QuietInteraction::default()))
        .build()
        .unwrap();
    let config = Arc::new(config);
    let account = AccountIdentity::enabled(&config).remove(0);
    let manager = TokenLifecycleManager::from_config(config);

    let started = tokio::time::Instant::now();
    let err = manager.authenticate(&account).await.unwrap_err();
    let elapsed = started.elapsed();

    assert!(matches!(err, AuthError::Timeout(_)), "got {err:?}");
    assert!(elapsed <= Duration::from_secs(6), "gave up after {elapsed:?}");
    assert_eq!(http.polls.load(Ordering::SeqCst), 1);
    assert!(fs.get(&account.token_file).is_none());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn managers_sharing_a_token_file_never_corrupt_it() {
    let dir = tempfile::tempdir().unwrap();
    let fs = Arc::new(bridge_desktop::TokioFileSystem::with_data_directory(
        dir.path().to_path_buf(),
    ));
    let config = AuthConfig::builder()
        .token_dir(dir.path().join("tokens"))
        .account(AccountDescriptor::new(
            "Personal",
            "me@gmail.com",
            ProviderTag::Gmail,
            ClientDescriptor::gmail("client-id.apps.googleusercontent.com", Some("secret")),
        ))
        .http_client(Arc::new(UnusedHttp))
        .file_system(fs.clone())
        .user_interaction(Arc::new(QuietInteraction::default()))
        .build()
        .unwrap();
    let config = Arc::new(config);
    let account = AccountIdentity::enabled(&config).remove(0);

    for round in 0..20 {
        let _ = std::fs::remove_file(&account.token_file);

        // A long token makes an interleaved write visible as garbage
        let short = credential(&format!("AT-short-{round}"), 3600).with_refresh_token("RT1");
        let long = credential(&"L".repeat(32 * 1024), 3600).with_refresh_token("RT2");

        let runs = [short.clone(), long.clone()].map(|issued| {
            let manager = TokenLifecycleManager::from_config(config.clone()).with_flow(
                ProviderTag::Gmail,
                Arc::new(ScriptedFlow::default().on_interactive(Ok(issued))),
            );
            let account = account.clone();
            tokio::spawn(async move { manager.authenticate(&account).await })
        });

        for run in runs {
            let outcome = run.await.unwrap().expect("sign-in succeeds");
            assert!(outcome.persistence_warning.is_none(), "round {round}");
        }

        let stored = CredentialStore::new(fs.clone())
            .load(&account.token_file, ProviderTag::Gmail)
            .await
            .expect("token file readable");
        assert!(
            stored.access_token == short.access_token || stored.access_token == long.access_token,
            "round {round}"
        );
    }

    let entries = std::fs::read_dir(dir.path().join("tokens")).unwrap().count();
    assert_eq!(entries, 1);
}

// ---------------------------------------------------------------------------
// Properties
// ---------------------------------------------------------------------------

#[tokio::test]
async fn valid_cache_makes_no_calls() {
    let harness = Harness::gmail();
    harness
        .seed(&credential("AT1", 3600).with_refresh_token("RT1"))
        .await;
    let flow = Arc::new(ScriptedFlow::default());

    let outcome = harness.manager(flow.clone()).authenticate(&harness.account).await.unwrap();

    assert_eq!(outcome.credential.access_token, "AT1");
    assert_eq!(flow.refresh_calls() + flow.interactive_calls(), 0);
}

#[tokio::test]
async fn malformed_token_file_leads_to_sign_in() {
    for garbage in [&b""[..], b"{", b"[1, 2, 3]", b"{\"token\": 42}", b"\xff\xfe"] {
        let harness = Harness::gmail();
        harness.fs.put(&harness.account.token_file, garbage.to_vec());
        let flow = Arc::new(ScriptedFlow::default().on_interactive(Ok(credential("AT1", 3600))));

        let outcome = harness.manager(flow.clone()).authenticate(&harness.account).await.unwrap();

        assert_eq!(
            outcome.states,
            vec![
                LifecycleState::Start,
                LifecycleState::NeedsInteractive,
                LifecycleState::Authenticated
            ]
        );
        assert_eq!(flow.interactive_calls(), 1);
    }
}

#[tokio::test]
async fn rejected_refresh_prompts_exactly_once() {
    let harness = Harness::gmail();
    harness
        .seed(&credential("AT1", -10).with_refresh_token("RT1"))
        .await;
    let flow = Arc::new(
        ScriptedFlow::default()
            .on_refresh(Err(FlowError::InvalidGrant("Token has been expired or revoked.".into())))
            .on_interactive(Ok(credential("AT2", 3600).with_refresh_token("RT2"))),
    );

    let outcome = harness.manager(flow.clone()).authenticate(&harness.account).await.unwrap();

    assert_eq!(outcome.credential.access_token, "AT2");
    assert_eq!(flow.refresh_calls(), 1);
    assert_eq!(flow.interactive_calls(), 1);
}

#[tokio::test]
async fn denied_consent_leaves_token_file_untouched() {
    let harness = Harness::gmail();
    harness.seed(&credential("AT0", -3600)).await;
    let before = harness.token_file().unwrap();
    let flow = Arc::new(ScriptedFlow::default().on_interactive(Err(FlowError::UserDeniedConsent)));

    let err = harness
        .manager(flow)
        .authenticate(&harness.account)
        .await
        .unwrap_err();

    assert!(matches!(err, AuthError::UserDeniedConsent(_)));
    assert_eq!(harness.token_file().unwrap(), before);
}

#[tokio::test]
async fn unwritable_token_dir_still_returns_credential() {
    let harness = Harness::with_fs(Arc::new(MemoryFileSystem::read_only()));
    let flow = Arc::new(ScriptedFlow::default().on_interactive(Ok(credential("AT1", 3600))));

    let outcome = harness.manager(flow).authenticate(&harness.account).await.unwrap();

    assert_eq!(outcome.credential.access_token, "AT1");
    match outcome.persistence_warning {
        Some(AuthError::Persistence { path, .. }) => assert_eq!(path, harness.account.token_file),
        other => panic!("expected persistence warning, got {other:?}"),
    }
    assert!(harness.token_file().is_none());
}
