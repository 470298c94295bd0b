//! The aggregate owning every stream and the shared comment relay.

pub mod relay;

pub use relay::{
    ChannelSubscriber, CommentRelay, CommentSink, RelayOutcome, RelayedComment, SinkError,
    SubscriberId,
};

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use futures::future::join_all;
use tokio::sync::Mutex;
use tracing::{error, info};

use crate::client::{Comment, LiveConnector};
use crate::config::{AppConfig, CredentialStore, RelayConfig};
use crate::error::{Error, Result};
use crate::records::{JsonlRecordSink, RecordSink};
use crate::stream::{CommentForwarder, Stream, StreamContext, StreamSettings, StreamStatus};

impl CommentForwarder for CommentRelay {
    fn forward(&self, account: &str, comment: Comment) -> Result<bool> {
        Ok(self.relay(account, comment).is_fresh())
    }
}

pub struct Broadcast {
    streams: BTreeMap<String, Arc<Stream>>,
    relay: Arc<CommentRelay>,
    /// Global started flag, readable while a transition is in flight.
    live: AtomicBool,
    /// Held across start-all/stop-all.
    transition: Mutex<()>,
}

impl Broadcast {
    pub fn new(
        accounts: impl IntoIterator<Item = String>,
        settings: StreamSettings,
        relay: &RelayConfig,
        connector: Arc<dyn LiveConnector>,
        credentials: Arc<dyn CredentialStore>,
        records: Option<Arc<dyn RecordSink>>,
    ) -> Self {
        let relay = Arc::new(CommentRelay::new(
            Duration::from_secs(relay.dedup_ttl_secs),
            relay.recent_capacity,
        ));
        let context = StreamContext {
            connector,
            credentials,
            forwarder: relay.clone(),
            records,
        };
        let settings = Arc::new(settings);

        let streams = accounts
            .into_iter()
            .map(|name| {
                let stream = Stream::new(name.clone(), settings.clone(), context.clone());
                (name, Arc::new(stream))
            })
            .collect();

        Self {
            streams,
            relay,
            live: AtomicBool::new(false),
            transition: Mutex::new(()),
        }
    }

    /// One stream per configured account.
    pub fn from_config(
        config: &AppConfig,
        connector: Arc<dyn LiveConnector>,
        credentials: Arc<dyn CredentialStore>,
    ) -> Self {
        let records: Option<Arc<dyn RecordSink>> = config
            .audience_log
            .enabled
            .then(|| {
                Arc::new(JsonlRecordSink::new(config.audience_log.directory.clone()))
                    as Arc<dyn RecordSink>
            });

        Self::new(
            config.accounts.keys().cloned(),
            StreamSettings::from_config(config),
            &config.relay,
            connector,
            credentials,
            records,
        )
    }

    fn stream(&self, name: &str) -> Result<&Arc<Stream>> {
        self.streams
            .get(name)
            .ok_or_else(|| Error::StreamNotFound(name.to_string()))
    }

    pub fn stream_names(&self) -> impl Iterator<Item = &str> {
        self.streams.keys().map(String::as_str)
    }

    pub fn is_live(&self) -> bool {
        self.live.load(Ordering::Acquire)
    }

    /// Start every stream. Every stream is attempted; the first error wins.
    pub async fn start_all(&self) -> Result<()> {
        let _transition = self.transition.lock().await;
        if self.is_live() {
            return Err(Error::AlreadyStarted("broadcast".to_string()));
        }
        self.live.store(true, Ordering::Release);

        info!(streams = self.streams.len(), "Starting all streams");
        let results = join_all(self.streams.values().map(|s| s.start())).await;
        first_error(results, "start")
    }

    /// Stop every stream, draining in-flight cycles.
    pub async fn stop_all(&self) -> Result<()> {
        let _transition = self.transition.lock().await;
        if !self.is_live() {
            return Err(Error::AlreadyStopped("broadcast".to_string()));
        }
        self.live.store(false, Ordering::Release);

        info!(streams = self.streams.len(), "Stopping all streams");
        let results = join_all(self.streams.values().map(|s| s.stop())).await;
        first_error(results, "stop")
    }

    pub async fn start_stream(&self, name: &str) -> Result<()> {
        self.stream(name)?.start().await
    }

    pub async fn stop_stream(&self, name: &str) -> Result<()> {
        self.stream(name)?.stop().await
    }

    /// Returns whether a challenge was waiting for the code.
    pub fn put_security_code(&self, name: &str, code: impl Into<String>) -> Result<bool> {
        Ok(self.stream(name)?.put_security_code(code))
    }

    pub fn status(&self, name: &str) -> Result<StreamStatus> {
        Ok(self.stream(name)?.status())
    }

    /// Sorted by account name.
    pub fn statuses(&self) -> Vec<StreamStatus> {
        self.streams.values().map(|s| s.status()).collect()
    }

    pub fn relay_comment(&self, account: &str, comment: Comment) -> RelayOutcome {
        self.relay.relay(account, comment)
    }

    pub fn subscribe(&self, sink: Arc<dyn CommentSink>) -> SubscriberId {
        self.relay.subscribe(sink)
    }

    pub fn unsubscribe(&self, id: SubscriberId) -> bool {
        self.relay.unsubscribe(id)
    }

    pub fn recent_comments(&self) -> Vec<RelayedComment> {
        self.relay.recent()
    }
}

fn first_error(results: Vec<Result<()>>, action: &str) -> Result<()> {
    let mut first = None;
    for result in results {
        if let Err(e) = result {
            error!(error = %e, "Failed to {action} stream");
            first.get_or_insert(e);
        }
    }
    first.map_or(Ok(()), Err)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_error_kept() {
        let results = vec![
            Ok(()),
            Err(Error::AlreadyStarted("alice".to_string())),
            Err(Error::AlreadyStarted("bob".to_string())),
        ];
        match first_error(results, "start") {
            Err(Error::AlreadyStarted(name)) => assert_eq!(name, "alice"),
            other => panic!("unexpected {other:?}"),
        }
        assert!(first_error(vec![Ok(()), Ok(())], "stop").is_ok());
    }
}
