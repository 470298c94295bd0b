//! Per-account broadcast lifecycle.
//!
//! A [`Stream`] drives one account through repeated broadcast cycles:
//!
//! ```text
//! Ready -> LoggingIn -> [ChallengeRequired] -> CreatingBroadcast -> Streaming -> Posting -> Ready
//! ```
//!
//! Error states cool down before retrying. While `Streaming`, the encoder
//! supervisor, the poller and the scheduled announcement run concurrently
//! under one cancellation scope derived from the stream's own token.

mod announcement;
mod encoder;
mod mailbox;
mod poller;
mod runner;
mod state;

pub use state::{FailureClass, LastError, StreamState, StreamStatus};

use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::client::{Comment, LiveConnector};
use crate::config::{
    AnnouncementConfig, AppConfig, CredentialStore, EncoderConfig, RecapConfig, TimingsConfig,
};
use crate::error::{Error, Result};
use crate::records::RecordSink;
use runner::StreamRunner;
use state::StreamShared;

/// Broadcast frame size.
pub const STREAM_WIDTH: u32 = 720;
pub const STREAM_HEIGHT: u32 = 1280;

/// Sink for comments discovered by a stream's poller.
pub trait CommentForwarder: Send + Sync {
    /// Returns `true` if the comment had not been seen before.
    fn forward(&self, account: &str, comment: Comment) -> Result<bool>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamTimings {
    pub cooldown: Duration,
    pub encoder_restart: Duration,
    pub poll_interval: Duration,
    pub challenge_timeout: Duration,
    pub grace_period: Duration,
    pub comments_per_fetch: usize,
    pub max_poll_failures: u32,
}

impl From<&TimingsConfig> for StreamTimings {
    fn from(config: &TimingsConfig) -> Self {
        Self {
            cooldown: Duration::from_millis(config.cooldown_ms),
            encoder_restart: Duration::from_millis(config.encoder_restart_ms),
            poll_interval: Duration::from_millis(config.poll_interval_ms),
            challenge_timeout: Duration::from_millis(config.challenge_timeout_ms),
            grace_period: Duration::from_millis(config.grace_period_ms),
            comments_per_fetch: config.comments_per_fetch,
            max_poll_failures: config.max_poll_failures,
        }
    }
}

impl Default for StreamTimings {
    fn default() -> Self {
        Self::from(&TimingsConfig::default())
    }
}

/// Immutable per-cycle parameters shared by every stream.
#[derive(Debug, Clone)]
pub struct StreamSettings {
    pub width: u32,
    pub height: u32,
    pub title: String,
    pub notify: bool,
    pub input_url: String,
    pub encoder: EncoderConfig,
    pub recap: RecapConfig,
    pub announcement: AnnouncementConfig,
    pub timings: StreamTimings,
}

impl StreamSettings {
    pub fn new(input_url: impl Into<String>) -> Self {
        Self {
            width: STREAM_WIDTH,
            height: STREAM_HEIGHT,
            title: String::new(),
            notify: false,
            input_url: input_url.into(),
            encoder: EncoderConfig::default(),
            recap: RecapConfig::default(),
            announcement: AnnouncementConfig::default(),
            timings: StreamTimings::default(),
        }
    }

    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            width: STREAM_WIDTH,
            height: STREAM_HEIGHT,
            title: config.title.clone(),
            notify: config.notify,
            input_url: config.input_url.clone(),
            encoder: config.encoder.clone(),
            recap: config.recap.clone(),
            announcement: config.announcement.clone(),
            timings: StreamTimings::from(&config.timings),
        }
    }
}

/// Collaborators of a stream.
#[derive(Clone)]
pub struct StreamContext {
    pub connector: Arc<dyn LiveConnector>,
    pub credentials: Arc<dyn CredentialStore>,
    pub forwarder: Arc<dyn CommentForwarder>,
    pub records: Option<Arc<dyn RecordSink>>,
}

struct RunningLoop {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

/// Handle on one account's lifecycle loop.
pub struct Stream {
    shared: Arc<StreamShared>,
    settings: Arc<StreamSettings>,
    context: StreamContext,
    task: Mutex<Option<RunningLoop>>,
}

impl Stream {
    pub fn new(name: impl Into<String>, settings: Arc<StreamSettings>, context: StreamContext) -> Self {
        Self {
            shared: Arc::new(StreamShared::new(name)),
            settings,
            context,
            task: Mutex::new(None),
        }
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    /// Spawn the lifecycle loop.
    pub async fn start(&self) -> Result<()> {
        let mut task = self.task.lock().await;
        if task.is_some() {
            return Err(Error::AlreadyStarted(self.shared.name.clone()));
        }

        let cancel = CancellationToken::new();
        let runner = StreamRunner::new(
            self.shared.clone(),
            self.settings.clone(),
            self.context.clone(),
            cancel.clone(),
        );

        self.shared.running.store(true, Ordering::Release);
        let handle = tokio::spawn(runner.run());
        *task = Some(RunningLoop { cancel, handle });

        info!(account = %self.shared.name, "Stream started");
        Ok(())
    }

    /// Cancel the loop and wait until it has drained. A no-op if not running.
    pub async fn stop(&self) -> Result<()> {
        let mut task = self.task.lock().await;
        let Some(running) = task.take() else {
            return Ok(());
        };

        info!(account = %self.shared.name, "Stopping stream");
        running.cancel.cancel();
        let joined = running.handle.await;

        self.shared.running.store(false, Ordering::Release);
        self.shared.state.set(StreamState::Ready);
        joined?;

        info!(account = %self.shared.name, "Stream stopped");
        Ok(())
    }

    /// Deliver a security code to a pending challenge. Never blocks.
    ///
    /// Returns whether a challenge was waiting for it.
    pub fn put_security_code(&self, code: impl Into<String>) -> bool {
        let delivered = self.shared.mailbox.put(code.into());
        if !delivered {
            info!(account = %self.shared.name, "Security code dropped, no challenge waiting");
        }
        delivered
    }

    pub fn state(&self) -> StreamState {
        self.shared.state.get()
    }

    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::Acquire)
    }

    pub fn status(&self) -> StreamStatus {
        self.shared.status()
    }
}
