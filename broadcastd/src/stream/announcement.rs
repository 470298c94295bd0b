//! Delayed announcement posted and pinned on a live broadcast.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::client::{BroadcastId, LiveSession, ServiceResult};
use crate::config::AnnouncementConfig;

/// Post and pin the configured message once, `delay` after the cycle started.
pub(crate) async fn run_announcement(
    account: String,
    session: Arc<dyn LiveSession>,
    broadcast_id: BroadcastId,
    config: AnnouncementConfig,
    scope: CancellationToken,
) {
    if !config.enabled || config.message.trim().is_empty() {
        return;
    }

    tokio::select! {
        biased;
        _ = scope.cancelled() => return,
        _ = tokio::time::sleep(Duration::from_secs(config.delay_secs)) => {}
    }

    let posted = tokio::select! {
        biased;
        _ = scope.cancelled() => return,
        posted = post_and_pin(session.as_ref(), broadcast_id, &config.message) => posted,
    };

    match posted {
        Ok(()) => info!(account = %account, broadcast_id, "Announcement pinned"),
        Err(e) => warn!(account = %account, broadcast_id, error = %e, "Failed to post announcement"),
    }
}

async fn post_and_pin(
    session: &dyn LiveSession,
    broadcast_id: BroadcastId,
    message: &str,
) -> ServiceResult<()> {
    let comment = session.post_comment(broadcast_id, message).await?;
    session.pin_comment(broadcast_id, &comment).await
}
