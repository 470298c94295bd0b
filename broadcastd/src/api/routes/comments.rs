//! Comment history and live push.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    Json, Router,
    extract::{
        State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    response::IntoResponse,
    routing::get,
};
use futures::{SinkExt, StreamExt};
use tracing::{debug, warn};

use crate::api::server::AppState;
use crate::broadcast::{Broadcast, ChannelSubscriber, RelayedComment};

/// Per-connection buffer; a client this far behind starts losing comments.
const SUBSCRIBER_BUFFER: usize = 256;

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/api/comments", get(recent_comments))
        .route("/ws/comments", get(comments_ws))
}

async fn recent_comments(State(state): State<AppState>) -> Json<Vec<RelayedComment>> {
    Json(state.broadcast.recent_comments())
}

async fn comments_ws(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state.broadcast))
}

fn to_message(comment: &RelayedComment) -> Option<Message> {
    match serde_json::to_string(comment) {
        Ok(text) => Some(Message::Text(text.into())),
        Err(e) => {
            warn!(error = %e, "Failed to encode comment");
            None
        }
    }
}

/// Ids in the history snapshot. A comment relayed between subscribing and
/// taking the snapshot shows up in both and must be sent only once.
fn snapshot_ids(snapshot: &[RelayedComment]) -> HashSet<String> {
    snapshot.iter().map(|c| c.comment.id.clone()).collect()
}

/// Recent history first, then live fan-out until either side goes away.
async fn handle_socket(socket: WebSocket, broadcast: Arc<Broadcast>) {
    let (mut sender, mut receiver) = socket.split();

    let (sink, mut comments) = ChannelSubscriber::channel(SUBSCRIBER_BUFFER);
    let subscriber = broadcast.subscribe(Arc::new(sink));
    debug!(subscriber = %subscriber, "Comment subscriber connected");

    let snapshot = broadcast.recent_comments();
    let mut sent = snapshot_ids(&snapshot);
    let mut open = true;
    for comment in snapshot {
        if let Some(message) = to_message(&comment)
            && sender.send(message).await.is_err()
        {
            open = false;
            break;
        }
    }

    let mut heartbeat = tokio::time::interval(HEARTBEAT_INTERVAL);
    heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    while open {
        tokio::select! {
            comment = comments.recv() => {
                let Some(comment) = comment else { break };
                if sent.remove(&comment.comment.id) {
                    continue;
                }
                if let Some(message) = to_message(&comment)
                    && sender.send(message).await.is_err()
                {
                    break;
                }
            }

            _ = heartbeat.tick() => {
                if sender.send(Message::Ping(Vec::new().into())).await.is_err() {
                    break;
                }
            }

            msg = receiver.next() => {
                match msg {
                    Some(Ok(Message::Close(_))) | None | Some(Err(_)) => break,
                    Some(Ok(_)) => continue,
                }
            }
        }
    }

    broadcast.unsubscribe(subscriber);
    debug!(subscriber = %subscriber, "Comment subscriber disconnected");
}
