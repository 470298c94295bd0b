//! Shared comment relay: dedup, bounded history and subscriber fan-out.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use moka::sync::Cache;
use parking_lot::RwLock;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::client::Comment;

/// Identifier handed out by [`CommentRelay::subscribe`].
pub type SubscriberId = Uuid;

/// Smallest dedup cache regardless of the window.
const MIN_SEEN_CAPACITY: u64 = 100_000;

/// Aggregate comment rate, across all streams, the dedup cache is sized for.
/// Above it ids can be evicted before their window ends and be relayed again.
const MAX_RELAY_RATE_PER_SEC: u64 = 1_000;

/// Ids the dedup cache can hold: one full window at the supported rate.
fn seen_capacity(dedup_ttl: Duration) -> u64 {
    let window = dedup_ttl.as_secs().max(1);
    window
        .saturating_mul(MAX_RELAY_RATE_PER_SEC)
        .max(MIN_SEEN_CAPACITY)
}

/// A comment together with the account whose broadcast it was posted on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RelayedComment {
    pub account: String,
    #[serde(flatten)]
    pub comment: Comment,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum SinkError {
    #[error("subscriber is not keeping up")]
    Full,
    #[error("subscriber disconnected")]
    Disconnected,
}

/// A live push destination.
pub trait CommentSink: Send + Sync {
    /// Deliver without blocking.
    fn push(&self, comment: &RelayedComment) -> Result<(), SinkError>;
}

/// Subscriber backed by a bounded channel.
#[derive(Debug, Clone)]
pub struct ChannelSubscriber {
    tx: mpsc::Sender<RelayedComment>,
}

impl ChannelSubscriber {
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<RelayedComment>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx }, rx)
    }
}

impl CommentSink for ChannelSubscriber {
    fn push(&self, comment: &RelayedComment) -> Result<(), SinkError> {
        self.tx.try_send(comment.clone()).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => SinkError::Full,
            mpsc::error::TrySendError::Closed(_) => SinkError::Disconnected,
        })
    }
}

/// What happened to a relayed comment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayOutcome {
    /// Seen within the dedup window; nothing was delivered.
    Duplicate,
    Delivered { subscribers: usize, failed: usize },
}

impl RelayOutcome {
    pub fn is_fresh(&self) -> bool {
        matches!(self, Self::Delivered { .. })
    }
}

pub struct CommentRelay {
    seen: Cache<String, ()>,
    recent: RwLock<VecDeque<RelayedComment>>,
    capacity: usize,
    subscribers: RwLock<HashMap<SubscriberId, Arc<dyn CommentSink>>>,
}

impl CommentRelay {
    pub fn new(dedup_ttl: Duration, capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            seen: Cache::builder()
                .max_capacity(seen_capacity(dedup_ttl))
                .time_to_live(dedup_ttl)
                .build(),
            recent: RwLock::new(VecDeque::with_capacity(capacity)),
            capacity,
            subscribers: RwLock::new(HashMap::new()),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Dedupe, remember and fan out one comment.
    pub fn relay(&self, account: &str, comment: Comment) -> RelayOutcome {
        // Insert-if-absent is atomic, so concurrent relays of one id deliver once.
        let entry = self.seen.entry(comment.id.clone()).or_insert(());
        if !entry.is_fresh() {
            debug!(comment_id = %comment.id, "Duplicate comment skipped");
            return RelayOutcome::Duplicate;
        }

        let relayed = RelayedComment {
            account: account.to_string(),
            comment,
        };

        {
            let mut recent = self.recent.write();
            while recent.len() >= self.capacity {
                recent.pop_front();
            }
            recent.push_back(relayed.clone());
        }

        self.fan_out(&relayed)
    }

    fn fan_out(&self, comment: &RelayedComment) -> RelayOutcome {
        let subscribers: Vec<(SubscriberId, Arc<dyn CommentSink>)> = self
            .subscribers
            .read()
            .iter()
            .map(|(id, sink)| (*id, sink.clone()))
            .collect();

        let mut failed = 0;
        let mut disconnected = Vec::new();
        for (id, sink) in &subscribers {
            match sink.push(comment) {
                Ok(()) => {}
                Err(SinkError::Full) => {
                    failed += 1;
                    warn!(subscriber = %id, "Subscriber lagging, comment dropped");
                }
                Err(SinkError::Disconnected) => {
                    failed += 1;
                    disconnected.push(*id);
                }
            }
        }

        for id in disconnected {
            self.unsubscribe(id);
        }

        RelayOutcome::Delivered {
            subscribers: subscribers.len(),
            failed,
        }
    }

    pub fn subscribe(&self, sink: Arc<dyn CommentSink>) -> SubscriberId {
        let id = Uuid::new_v4();
        self.subscribers.write().insert(id, sink);
        debug!(subscriber = %id, "Subscriber added");
        id
    }

    /// Idempotent.
    pub fn unsubscribe(&self, id: SubscriberId) -> bool {
        let removed = self.subscribers.write().remove(&id).is_some();
        if removed {
            debug!(subscriber = %id, "Subscriber removed");
        }
        removed
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.read().len()
    }

    /// Oldest first.
    pub fn recent(&self) -> Vec<RelayedComment> {
        self.recent.read().iter().cloned().collect()
    }
}
