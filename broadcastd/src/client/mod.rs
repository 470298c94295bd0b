//! Remote broadcast service boundary.
//!
//! The stream lifecycle only ever talks to the platform through the traits
//! in this module. A [`LiveConnector`] turns credentials into a
//! [`LiveSession`]; password logins may first require an interactive
//! [`Challenge`]. Every call can fail with [`ServiceError::LoginRequired`],
//! which callers must treat as "the session is gone, log in again".

pub mod http;

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use http::{HttpConnector, HttpConnectorConfig};

/// Identifier of a remote broadcast.
pub type BroadcastId = u64;

/// Result type for remote service calls.
pub type ServiceResult<T> = std::result::Result<T, ServiceError>;

/// Errors surfaced by the remote service.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ServiceError {
    /// The session was invalidated remotely.
    #[error("re-authentication required")]
    LoginRequired,

    /// A challenge rejected the submitted security code.
    #[error("security code rejected: {0}")]
    InvalidSecurityCode(String),

    /// The service answered, but not with an "ok" status.
    #[error("unexpected status: {0}")]
    Status(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("invalid response: {0}")]
    Decode(String),
}

impl ServiceError {
    pub fn transport(msg: impl Into<String>) -> Self {
        Self::Transport(msg.into())
    }

    pub fn status(msg: impl Into<String>) -> Self {
        Self::Status(msg.into())
    }

    pub fn requires_login(&self) -> bool {
        matches!(self, Self::LoginRequired)
    }
}

/// A single live comment as observed on a broadcast.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Comment {
    /// Globally unique per remote service.
    pub id: String,
    pub broadcast_id: BroadcastId,
    pub author: String,
    pub text: String,
    /// Unix timestamp (seconds).
    pub created_at: i64,
}

/// Reference to a comment posted by this account.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommentRef {
    pub id: String,
}

/// A freshly created broadcast.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreatedBroadcast {
    pub id: BroadcastId,
    pub ingest_url: String,
}

/// Remote-side lifecycle status reported by a heartbeat.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BroadcastStatus {
    Active,
    Stopped,
    Other(String),
}

impl BroadcastStatus {
    pub fn parse(s: &str) -> Self {
        match s {
            "active" | "" => Self::Active,
            "stopped" => Self::Stopped,
            other => Self::Other(other.to_string()),
        }
    }

    pub fn is_stopped(&self) -> bool {
        matches!(self, Self::Stopped)
    }
}

/// Liveness probe answer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Heartbeat {
    pub viewer_count: u64,
    pub total_unique_viewers: u64,
    pub status: BroadcastStatus,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Viewer {
    pub id: String,
    pub username: String,
    #[serde(default)]
    pub full_name: String,
}

/// Audience of a finished broadcast.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FinalAudience {
    pub viewers: Vec<Viewer>,
    pub total_unique_viewers: u64,
}

/// Long-form publish request issued after a broadcast ends.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecapRequest {
    pub broadcast_id: BroadcastId,
    pub cover_asset_id: String,
    pub title: String,
    pub description: String,
    pub share_to_feed: bool,
}

/// An authenticated session. Replaced wholesale on every re-login.
#[async_trait]
pub trait LiveSession: Send + Sync {
    /// Serialize the session into an opaque token for later token logins.
    fn export_token(&self) -> ServiceResult<String>;

    async fn create_broadcast(
        &self,
        width: u32,
        height: u32,
        message: &str,
    ) -> ServiceResult<CreatedBroadcast>;

    async fn start_broadcast(&self, id: BroadcastId, notify: bool) -> ServiceResult<()>;

    async fn unmute_comments(&self, id: BroadcastId) -> ServiceResult<()>;

    async fn disable_join_requests(&self, id: BroadcastId) -> ServiceResult<()>;

    async fn heartbeat(&self, id: BroadcastId) -> ServiceResult<Heartbeat>;

    /// Comments created after `since` (unix seconds), at most `limit`.
    async fn fetch_comments(
        &self,
        id: BroadcastId,
        limit: usize,
        since: i64,
    ) -> ServiceResult<Vec<Comment>>;

    async fn post_comment(&self, id: BroadcastId, text: &str) -> ServiceResult<CommentRef>;

    async fn pin_comment(&self, id: BroadcastId, comment: &CommentRef) -> ServiceResult<()>;

    async fn end_broadcast(&self, id: BroadcastId) -> ServiceResult<()>;

    /// Publish the ended broadcast to the ephemeral story feed.
    async fn publish_story(&self, id: BroadcastId) -> ServiceResult<()>;

    async fn fetch_thumbnails(&self, id: BroadcastId) -> ServiceResult<Vec<String>>;

    async fn fetch_image(&self, url: &str) -> ServiceResult<Bytes>;

    /// Upload an image and return its asset id.
    async fn upload_image(&self, image: Bytes) -> ServiceResult<String>;

    async fn publish_recap(&self, request: &RecapRequest) -> ServiceResult<()>;

    async fn fetch_final_audience(&self, id: BroadcastId) -> ServiceResult<FinalAudience>;
}

/// Interactive verification required before a password login completes.
#[async_trait]
pub trait Challenge: Send + Sync {
    /// Ask the service to send a security code out of band.
    async fn begin(&mut self, api_path: &str) -> ServiceResult<()>;

    /// Submit a security code. A wrong code yields
    /// [`ServiceError::InvalidSecurityCode`] and may be retried.
    async fn submit(&mut self, code: &str) -> ServiceResult<Arc<dyn LiveSession>>;
}

/// Outcome of a password login.
pub enum PasswordLogin {
    Authenticated(Arc<dyn LiveSession>),
    ChallengeRequired {
        api_path: String,
        challenge: Box<dyn Challenge>,
    },
}

impl std::fmt::Debug for PasswordLogin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Authenticated(_) => f.write_str("Authenticated"),
            Self::ChallengeRequired { api_path, .. } => f
                .debug_struct("ChallengeRequired")
                .field("api_path", api_path)
                .finish(),
        }
    }
}

/// Entry point into the remote service.
#[async_trait]
pub trait LiveConnector: Send + Sync {
    async fn login_with_token(
        &self,
        account: &str,
        token: &str,
    ) -> ServiceResult<Arc<dyn LiveSession>>;

    async fn login_with_password(
        &self,
        account: &str,
        password: &str,
    ) -> ServiceResult<PasswordLogin>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_broadcast_status_parse() {
        assert_eq!(BroadcastStatus::parse("stopped"), BroadcastStatus::Stopped);
        assert_eq!(BroadcastStatus::parse("active"), BroadcastStatus::Active);
        assert!(BroadcastStatus::parse("stopped").is_stopped());
        assert_eq!(
            BroadcastStatus::parse("interrupted"),
            BroadcastStatus::Other("interrupted".to_string())
        );
    }

    #[test]
    fn test_service_error_classification() {
        assert!(ServiceError::LoginRequired.requires_login());
        assert!(!ServiceError::status("fail").requires_login());
        assert!(!ServiceError::InvalidSecurityCode("bad".into()).requires_login());
    }
}
