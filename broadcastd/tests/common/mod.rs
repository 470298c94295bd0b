//! Scripted remote service, credential store and encoder processes.

#![allow(dead_code)]

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use broadcastd::Result;
use broadcastd::broadcast::CommentRelay;
use broadcastd::client::{
    BroadcastId, BroadcastStatus, Challenge, Comment, CommentRef, CreatedBroadcast, FinalAudience,
    Heartbeat, LiveConnector, LiveSession, PasswordLogin, RecapRequest, ServiceError,
    ServiceResult, Viewer,
};
use broadcastd::config::{AccountCredentials, CredentialStore, EncoderConfig};
use broadcastd::records::RecordSink;
use broadcastd::stream::{Stream, StreamContext, StreamSettings, StreamTimings};
use bytes::Bytes;
use parking_lot::Mutex;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PasswordMode {
    Accept,
    Reject,
    Challenge { correct_code: String },
}

/// In-memory stand-in for the remote service. Every call is logged as
/// `op` or `op:<broadcast id>`.
pub struct MockRemote {
    calls: Mutex<Vec<String>>,
    pub token_valid: AtomicBool,
    pub password_mode: Mutex<PasswordMode>,
    /// Heartbeats per broadcast before it reports `stopped`.
    pub stop_after_heartbeats: Mutex<Option<usize>>,
    /// Next heartbeat fails with `LoginRequired`.
    pub expire_session_once: AtomicBool,
    pub comment_batches: Mutex<VecDeque<Vec<Comment>>>,
    /// Next create fails with a plain service error.
    pub fail_create_once: AtomicBool,
    /// Next create fails with `LoginRequired`.
    pub expire_on_create_once: AtomicBool,
    /// Every heartbeat fails with a transport error while set.
    pub heartbeat_down: AtomicBool,
    /// Next end fails with `LoginRequired`.
    pub expire_on_end_once: AtomicBool,
    /// Delay before unmuting comments succeeds.
    pub unmute_delay: Mutex<Option<Duration>>,
    heartbeats: Mutex<HashMap<BroadcastId, usize>>,
    next_broadcast_id: AtomicU64,
    sessions: AtomicUsize,
}

impl MockRemote {
    pub fn new(password_mode: PasswordMode) -> Arc<Self> {
        Arc::new(Self {
            calls: Mutex::new(Vec::new()),
            token_valid: AtomicBool::new(false),
            password_mode: Mutex::new(password_mode),
            stop_after_heartbeats: Mutex::new(None),
            expire_session_once: AtomicBool::new(false),
            comment_batches: Mutex::new(VecDeque::new()),
            fail_create_once: AtomicBool::new(false),
            expire_on_create_once: AtomicBool::new(false),
            heartbeat_down: AtomicBool::new(false),
            expire_on_end_once: AtomicBool::new(false),
            unmute_delay: Mutex::new(None),
            heartbeats: Mutex::new(HashMap::new()),
            next_broadcast_id: AtomicU64::new(1),
            sessions: AtomicUsize::new(0),
        })
    }

    fn log(&self, call: impl Into<String>) {
        self.calls.lock().push(call.into());
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().clone()
    }

    pub fn count(&self, call: &str) -> usize {
        self.calls.lock().iter().filter(|c| *c == call).count()
    }

    pub fn count_prefix(&self, prefix: &str) -> usize {
        self.calls
            .lock()
            .iter()
            .filter(|c| c.starts_with(prefix))
            .count()
    }

    /// Ids of every broadcast created so far.
    pub fn created(&self) -> Vec<BroadcastId> {
        self.calls
            .lock()
            .iter()
            .filter_map(|c| c.strip_prefix("create:"))
            .filter_map(|id| id.parse().ok())
            .collect()
    }

    fn session(self: &Arc<Self>) -> Arc<dyn LiveSession> {
        let n = self.sessions.fetch_add(1, Ordering::SeqCst) + 1;
        Arc::new(MockSession {
            remote: self.clone(),
            token: format!("session-{n}"),
        })
    }
}

pub struct MockConnector(pub Arc<MockRemote>);

#[async_trait]
impl LiveConnector for MockConnector {
    async fn login_with_token(
        &self,
        _account: &str,
        _token: &str,
    ) -> ServiceResult<Arc<dyn LiveSession>> {
        self.0.log("login_token");
        if self.0.token_valid.load(Ordering::SeqCst) {
            Ok(self.0.session())
        } else {
            Err(ServiceError::LoginRequired)
        }
    }

    async fn login_with_password(
        &self,
        _account: &str,
        _password: &str,
    ) -> ServiceResult<PasswordLogin> {
        self.0.log("login_password");
        let mode = self.0.password_mode.lock().clone();
        match mode {
            PasswordMode::Accept => Ok(PasswordLogin::Authenticated(self.0.session())),
            PasswordMode::Reject => Err(ServiceError::status("bad_password")),
            PasswordMode::Challenge { correct_code } => Ok(PasswordLogin::ChallengeRequired {
                api_path: "/challenge/1/".to_string(),
                challenge: Box::new(MockChallenge {
                    remote: self.0.clone(),
                    correct_code,
                }),
            }),
        }
    }
}

struct MockChallenge {
    remote: Arc<MockRemote>,
    correct_code: String,
}

#[async_trait]
impl Challenge for MockChallenge {
    async fn begin(&mut self, _api_path: &str) -> ServiceResult<()> {
        self.remote.log("challenge_begin");
        Ok(())
    }

    async fn submit(&mut self, code: &str) -> ServiceResult<Arc<dyn LiveSession>> {
        self.remote.log(format!("submit:{code}"));
        if code == self.correct_code {
            self.remote.log("submit_ok");
            Ok(self.remote.session())
        } else {
            Err(ServiceError::InvalidSecurityCode("wrong code".to_string()))
        }
    }
}

struct MockSession {
    remote: Arc<MockRemote>,
    token: String,
}

#[async_trait]
impl LiveSession for MockSession {
    fn export_token(&self) -> ServiceResult<String> {
        Ok(self.token.clone())
    }

    async fn create_broadcast(
        &self,
        width: u32,
        height: u32,
        _message: &str,
    ) -> ServiceResult<CreatedBroadcast> {
        assert_eq!((width, height), (720, 1280));
        if self.remote.expire_on_create_once.swap(false, Ordering::SeqCst) {
            self.remote.log("create_expired");
            return Err(ServiceError::LoginRequired);
        }
        if self.remote.fail_create_once.swap(false, Ordering::SeqCst) {
            self.remote.log("create_failed");
            return Err(ServiceError::status("feedback_required"));
        }
        let id = self.remote.next_broadcast_id.fetch_add(1, Ordering::SeqCst);
        self.remote.log(format!("create:{id}"));
        Ok(CreatedBroadcast {
            id,
            ingest_url: format!("rtmp://ingest.invalid/{id}"),
        })
    }

    async fn start_broadcast(&self, id: BroadcastId, _notify: bool) -> ServiceResult<()> {
        self.remote.log(format!("start:{id}"));
        Ok(())
    }

    async fn unmute_comments(&self, id: BroadcastId) -> ServiceResult<()> {
        self.remote.log(format!("unmute:{id}"));
        let delay = *self.remote.unmute_delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        Ok(())
    }

    async fn disable_join_requests(&self, id: BroadcastId) -> ServiceResult<()> {
        self.remote.log(format!("disable_join:{id}"));
        Ok(())
    }

    async fn heartbeat(&self, id: BroadcastId) -> ServiceResult<Heartbeat> {
        self.remote.log(format!("heartbeat:{id}"));
        if self.remote.expire_session_once.swap(false, Ordering::SeqCst) {
            return Err(ServiceError::LoginRequired);
        }
        if self.remote.heartbeat_down.load(Ordering::SeqCst) {
            return Err(ServiceError::transport("connection reset"));
        }

        let beats = {
            let mut heartbeats = self.remote.heartbeats.lock();
            let entry = heartbeats.entry(id).or_default();
            *entry += 1;
            *entry
        };
        let stopped = matches!(*self.remote.stop_after_heartbeats.lock(), Some(n) if beats >= n);

        Ok(Heartbeat {
            viewer_count: beats as u64,
            total_unique_viewers: beats as u64,
            status: if stopped {
                BroadcastStatus::Stopped
            } else {
                BroadcastStatus::Active
            },
        })
    }

    async fn fetch_comments(
        &self,
        id: BroadcastId,
        _limit: usize,
        since: i64,
    ) -> ServiceResult<Vec<Comment>> {
        self.remote.log(format!("comments:{id}:{since}"));
        Ok(self
            .remote
            .comment_batches
            .lock()
            .pop_front()
            .unwrap_or_default())
    }

    async fn post_comment(&self, id: BroadcastId, _text: &str) -> ServiceResult<CommentRef> {
        self.remote.log(format!("post:{id}"));
        Ok(CommentRef {
            id: "announcement".to_string(),
        })
    }

    async fn pin_comment(&self, id: BroadcastId, _comment: &CommentRef) -> ServiceResult<()> {
        self.remote.log(format!("pin:{id}"));
        Ok(())
    }

    async fn end_broadcast(&self, id: BroadcastId) -> ServiceResult<()> {
        self.remote.log(format!("end:{id}"));
        if self.remote.expire_on_end_once.swap(false, Ordering::SeqCst) {
            return Err(ServiceError::LoginRequired);
        }
        Ok(())
    }

    async fn publish_story(&self, id: BroadcastId) -> ServiceResult<()> {
        self.remote.log(format!("story:{id}"));
        Ok(())
    }

    async fn fetch_thumbnails(&self, id: BroadcastId) -> ServiceResult<Vec<String>> {
        self.remote.log(format!("thumbnails:{id}"));
        Ok(vec!["t0".into(), "t1".into(), "t2".into()])
    }

    async fn fetch_image(&self, url: &str) -> ServiceResult<Bytes> {
        self.remote.log(format!("image:{url}"));
        Ok(Bytes::from_static(b"jpeg"))
    }

    async fn upload_image(&self, _image: Bytes) -> ServiceResult<String> {
        self.remote.log("upload");
        Ok("asset-1".to_string())
    }

    async fn publish_recap(&self, request: &RecapRequest) -> ServiceResult<()> {
        self.remote
            .log(format!("recap:{}:{}", request.broadcast_id, request.cover_asset_id));
        Ok(())
    }

    async fn fetch_final_audience(&self, id: BroadcastId) -> ServiceResult<FinalAudience> {
        self.remote.log(format!("final_audience:{id}"));
        Ok(FinalAudience {
            viewers: vec![Viewer {
                id: "7".to_string(),
                username: "viewer".to_string(),
                full_name: String::new(),
            }],
            total_unique_viewers: 1,
        })
    }
}

/// Credential store counting writes.
#[derive(Default)]
pub struct MockCredentials {
    accounts: Mutex<BTreeMap<String, AccountCredentials>>,
    pub set_calls: AtomicUsize,
    pub save_calls: AtomicUsize,
}

impl MockCredentials {
    pub fn with_account(name: &str, password: &str, token: Option<&str>) -> Arc<Self> {
        let store = Self::default();
        store.add_account(name, password, token);
        Arc::new(store)
    }

    pub fn add_account(&self, name: &str, password: &str, token: Option<&str>) {
        self.accounts.lock().insert(
            name.to_string(),
            AccountCredentials {
                password: Some(password.to_string()),
                token: token.map(str::to_string),
            },
        );
    }

    pub fn token(&self, name: &str) -> Option<String> {
        self.accounts.lock().get(name).and_then(|a| a.token.clone())
    }
}

#[async_trait]
impl CredentialStore for MockCredentials {
    fn credentials(&self, account: &str) -> Option<AccountCredentials> {
        self.accounts.lock().get(account).cloned()
    }

    fn set_token(&self, account: &str, token: String) -> Result<()> {
        self.set_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(entry) = self.accounts.lock().get_mut(account) {
            entry.token = Some(token);
        }
        Ok(())
    }

    async fn save(&self) -> Result<()> {
        self.save_calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Write an executable shell script.
#[cfg(unix)]
pub fn write_script(dir: &Path, name: &str, body: &str) -> PathBuf {
    use std::os::unix::fs::PermissionsExt;

    let path = dir.join(name);
    std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    path
}

/// Encoder that records each launch and its pid, then idles until killed.
#[cfg(unix)]
pub fn idle_encoder(dir: &Path) -> PathBuf {
    let runs = dir.join("runs");
    let pid = dir.join("pid");
    write_script(
        dir,
        "encoder.sh",
        &format!(
            "echo run >> '{}'\necho $$ > '{}'\nexec sleep 30",
            runs.display(),
            pid.display()
        ),
    )
}

/// Encoder that records each launch and exits with an error right away.
#[cfg(unix)]
pub fn crashing_encoder(dir: &Path) -> PathBuf {
    let runs = dir.join("runs");
    write_script(
        dir,
        "crash.sh",
        &format!("echo run >> '{}'\nexit 1", runs.display()),
    )
}

pub fn encoder_runs(dir: &Path) -> usize {
    std::fs::read_to_string(dir.join("runs"))
        .map(|s| s.lines().count())
        .unwrap_or(0)
}

/// Short timings so lifecycles complete within a test.
pub fn fast_timings() -> StreamTimings {
    StreamTimings {
        cooldown: Duration::from_millis(100),
        encoder_restart: Duration::from_millis(100),
        poll_interval: Duration::from_millis(50),
        challenge_timeout: Duration::from_secs(5),
        grace_period: Duration::from_millis(300),
        comments_per_fetch: 10,
        max_poll_failures: 3,
    }
}

pub fn settings(encoder: &Path, timings: StreamTimings) -> StreamSettings {
    let mut settings = StreamSettings::new("rtmp://source.invalid/live");
    settings.title = "test".to_string();
    settings.encoder = EncoderConfig {
        command: encoder.display().to_string(),
        args: Vec::new(),
    };
    settings.timings = timings;
    settings
}

pub struct Harness {
    pub remote: Arc<MockRemote>,
    pub credentials: Arc<MockCredentials>,
    pub relay: Arc<CommentRelay>,
    pub stream: Stream,
}

pub fn harness(
    remote: Arc<MockRemote>,
    credentials: Arc<MockCredentials>,
    settings: StreamSettings,
) -> Harness {
    harness_with_records(remote, credentials, settings, None)
}

pub fn harness_with_records(
    remote: Arc<MockRemote>,
    credentials: Arc<MockCredentials>,
    settings: StreamSettings,
    records: Option<Arc<dyn RecordSink>>,
) -> Harness {
    let relay = Arc::new(CommentRelay::new(Duration::from_secs(60), 100));
    let context = StreamContext {
        connector: Arc::new(MockConnector(remote.clone())),
        credentials: credentials.clone(),
        forwarder: relay.clone(),
        records,
    };
    let stream = Stream::new("alice", Arc::new(settings), context);
    Harness {
        remote,
        credentials,
        relay,
        stream,
    }
}

/// Poll `condition` until it holds or `timeout` elapses.
pub async fn wait_for(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if condition() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Whether a process with `pid` still exists.
#[cfg(unix)]
pub fn process_alive(pid: u32) -> bool {
    std::process::Command::new("kill")
        .arg("-0")
        .arg(pid.to_string())
        .stderr(std::process::Stdio::null())
        .status()
        .map(|s| s.success())
        .unwrap_or(false)
}

pub fn read_pid(dir: &Path) -> Option<u32> {
    std::fs::read_to_string(dir.join("pid"))
        .ok()
        .and_then(|s| s.trim().parse().ok())
}
