//! Telemetry and comment polling for one live cycle.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::CommentForwarder;
use crate::client::{BroadcastId, Comment, LiveSession, ServiceError};
use crate::error::{Error, Result};
use crate::records::{RecordSink, TranscriptEntry, ViewerSample};

/// Why the poll loop returned without error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PollOutcome {
    /// The remote side reported the broadcast as stopped.
    Stopped,
    /// The scope was cancelled.
    Cancelled,
}

/// Highest creation time across `batch`, never lower than `current`.
pub(crate) fn advance_watermark(current: i64, batch: &[Comment]) -> i64 {
    batch.iter().map(|c| c.created_at).fold(current, i64::max)
}

pub(crate) struct Poller {
    pub(crate) account: String,
    pub(crate) session: Arc<dyn LiveSession>,
    pub(crate) broadcast_id: BroadcastId,
    pub(crate) forwarder: Arc<dyn CommentForwarder>,
    pub(crate) records: Option<Arc<dyn RecordSink>>,
    pub(crate) interval: Duration,
    pub(crate) comments_per_fetch: usize,
    pub(crate) max_failures: u32,
}

impl Poller {
    pub(crate) async fn run(&self, scope: &CancellationToken) -> Result<PollOutcome> {
        let mut watermark = 0i64;
        let mut failures = 0u32;

        loop {
            tokio::select! {
                biased;
                _ = scope.cancelled() => return Ok(PollOutcome::Cancelled),
                _ = tokio::time::sleep(self.interval) => {}
            }

            let polled = tokio::select! {
                biased;
                _ = scope.cancelled() => return Ok(PollOutcome::Cancelled),
                polled = self.poll_once(watermark) => polled,
            };

            match polled {
                Ok(Some(next)) => {
                    watermark = next;
                    failures = 0;
                }
                Ok(None) => {
                    info!(account = %self.account, broadcast_id = self.broadcast_id, "Broadcast stopped remotely");
                    return Ok(PollOutcome::Stopped);
                }
                Err(e) if e.requires_login() => return Err(e.into()),
                Err(e) => {
                    failures += 1;
                    warn!(
                        account = %self.account,
                        broadcast_id = self.broadcast_id,
                        failures,
                        error = %e,
                        "Poll failed"
                    );
                    if failures > self.max_failures {
                        return Err(Error::Service(e));
                    }
                }
            }
        }
    }

    /// One heartbeat plus comment fetch. `Ok(None)` means the broadcast stopped.
    async fn poll_once(&self, watermark: i64) -> std::result::Result<Option<i64>, ServiceError> {
        let heartbeat = self.session.heartbeat(self.broadcast_id).await?;
        if heartbeat.status.is_stopped() {
            return Ok(None);
        }
        debug!(
            account = %self.account,
            broadcast_id = self.broadcast_id,
            viewers = heartbeat.viewer_count,
            "Heartbeat"
        );

        if let Some(records) = &self.records {
            let sample = ViewerSample {
                timestamp: Utc::now(),
                broadcast_id: self.broadcast_id,
                account: self.account.clone(),
                viewer_count: heartbeat.viewer_count,
                total_unique_viewers: heartbeat.total_unique_viewers,
            };
            if let Err(e) = records.viewer_sample(&sample).await {
                warn!(account = %self.account, error = %e, "Failed to record viewer sample");
            }
        }

        let mut comments = self
            .session
            .fetch_comments(self.broadcast_id, self.comments_per_fetch, watermark)
            .await?;
        let next = advance_watermark(watermark, &comments);

        comments.sort_by_key(|c| c.created_at);
        for comment in comments {
            self.forward(comment).await;
        }

        Ok(Some(next))
    }

    async fn forward(&self, comment: Comment) {
        debug!(
            account = %self.account,
            comment_id = %comment.id,
            author = %comment.author,
            "Comment"
        );
        let entry = self
            .records
            .as_ref()
            .map(|_| TranscriptEntry::new(&self.account, &comment));

        match self.forwarder.forward(&self.account, comment) {
            Ok(true) => {
                if let (Some(records), Some(entry)) = (&self.records, entry)
                    && let Err(e) = records.comment(&entry).await
                {
                    warn!(account = %self.account, error = %e, "Failed to record comment");
                }
            }
            Ok(false) => {}
            Err(e) => warn!(account = %self.account, error = %e, "Failed to relay comment"),
        }
    }
}
