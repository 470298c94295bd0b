//! HTTP adapter for the remote broadcast service.
//!
//! The daemon does not sign platform requests itself. It talks JSON to a
//! signing gateway (`POST {base_url}/v1/<operation>`) which owns the platform
//! endpoint catalog. Error bodies follow the platform's shape:
//! `{"status": "fail", "message": "login_required", "error_type": ...}`.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use reqwest::{Client, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::debug;
use url::Url;

use super::{
    BroadcastId, BroadcastStatus, Challenge, Comment, CommentRef, CreatedBroadcast, FinalAudience,
    Heartbeat, LiveConnector, LiveSession, PasswordLogin, RecapRequest, ServiceError,
    ServiceResult, Viewer,
};

const SESSION_HEADER: &str = "x-session-token";

/// Gateway connection settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HttpConnectorConfig {
    /// Base URL of the signing gateway.
    pub base_url: String,
    /// Request timeout in seconds.
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,
}

fn default_timeout() -> u64 {
    30
}

impl Default for HttpConnectorConfig {
    fn default() -> Self {
        Self {
            base_url: "http://127.0.0.1:8765".to_string(),
            timeout_secs: default_timeout(),
        }
    }
}

/// Failure of a single gateway call, before it is narrowed to a [`ServiceError`].
#[derive(Debug)]
enum CallError {
    Service(ServiceError),
    ChallengeRequired {
        api_path: String,
        challenge_token: String,
    },
}

impl From<ServiceError> for CallError {
    fn from(e: ServiceError) -> Self {
        Self::Service(e)
    }
}

impl From<CallError> for ServiceError {
    fn from(e: CallError) -> Self {
        match e {
            CallError::Service(e) => e,
            CallError::ChallengeRequired { .. } => ServiceError::status("challenge_required"),
        }
    }
}

/// Map a non-success HTTP answer to a call error.
fn classify_error(status: StatusCode, body: &Value) -> CallError {
    let message = body
        .get("message")
        .and_then(Value::as_str)
        .unwrap_or_default();
    let error_type = body
        .get("error_type")
        .and_then(Value::as_str)
        .unwrap_or_default();

    match message {
        "login_required" => return CallError::Service(ServiceError::LoginRequired),
        "challenge_required" => {
            let api_path = body
                .pointer("/challenge/api_path")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string();
            let challenge_token = body
                .get("challenge_token")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string();
            return CallError::ChallengeRequired {
                api_path,
                challenge_token,
            };
        }
        _ => {}
    }

    if error_type == "invalid_security_code" {
        return CallError::Service(ServiceError::InvalidSecurityCode(message.to_string()));
    }
    let auth_failure = status == StatusCode::UNAUTHORIZED
        || (status == StatusCode::FORBIDDEN && message.is_empty());
    if auth_failure {
        return CallError::Service(ServiceError::LoginRequired);
    }

    CallError::Service(ServiceError::status(format!(
        "{status}: {message} ({error_type})"
    )))
}

fn transport(e: reqwest::Error) -> ServiceError {
    ServiceError::transport(e.to_string())
}

#[derive(Debug)]
struct Gateway {
    client: Client,
    base_url: Url,
}

impl Gateway {
    fn new(config: &HttpConnectorConfig) -> ServiceResult<Self> {
        let base_url = Url::parse(&config.base_url)
            .map_err(|e| ServiceError::transport(format!("invalid gateway url: {e}")))?;
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(transport)?;
        Ok(Self { client, base_url })
    }

    fn endpoint(&self, operation: &str) -> ServiceResult<Url> {
        self.base_url
            .join(&format!("v1/{operation}"))
            .map_err(|e| ServiceError::transport(e.to_string()))
    }

    async fn call<R: DeserializeOwned>(
        &self,
        operation: &str,
        session: Option<&str>,
        body: Value,
    ) -> Result<R, CallError> {
        let mut request = self.client.post(self.endpoint(operation)?).json(&body);
        if let Some(token) = session {
            request = request.header(SESSION_HEADER, token);
        }
        debug!(operation, "Calling gateway");

        let response = request.send().await.map_err(transport)?;
        let status = response.status();
        if !status.is_success() {
            // Error bodies are often empty or not JSON at all.
            let body = response.bytes().await.unwrap_or_default();
            let value = serde_json::from_slice(&body).unwrap_or(Value::Null);
            return Err(classify_error(status, &value));
        }

        let value: Value = response.json().await.map_err(transport)?;
        match value.get("status").and_then(Value::as_str) {
            Some("ok") | None => {}
            Some(other) => return Err(ServiceError::status(other.to_string()).into()),
        }

        serde_json::from_value(value)
            .map_err(|e| CallError::Service(ServiceError::Decode(e.to_string())))
    }
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    token: String,
}

#[derive(Debug, Deserialize)]
struct Empty {}

#[derive(Debug, Deserialize)]
struct CreateResponse {
    broadcast_id: BroadcastId,
    upload_url: String,
}

#[derive(Debug, Deserialize)]
struct HeartbeatResponse {
    #[serde(default)]
    viewer_count: f64,
    #[serde(default)]
    total_unique_viewer_count: u64,
    #[serde(default)]
    broadcast_status: String,
}

#[derive(Debug, Deserialize)]
struct WireUser {
    #[serde(default)]
    pk: Value,
    username: String,
    #[serde(default)]
    full_name: String,
}

#[derive(Debug, Deserialize)]
struct WireComment {
    pk: Value,
    text: String,
    created_at: i64,
    user: WireUser,
}

#[derive(Debug, Deserialize)]
struct CommentsResponse {
    #[serde(default)]
    comments: Vec<WireComment>,
}

#[derive(Debug, Deserialize)]
struct PostCommentResponse {
    comment: PostedComment,
}

#[derive(Debug, Deserialize)]
struct PostedComment {
    pk: Value,
}

#[derive(Debug, Deserialize)]
struct ThumbnailsResponse {
    #[serde(default)]
    thumbnails: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct UploadResponse {
    upload_id: String,
}

#[derive(Debug, Deserialize)]
struct FinalViewersResponse {
    #[serde(default)]
    users: Vec<WireUser>,
    #[serde(default)]
    total_unique_viewer_count: u64,
}

/// Platform ids arrive as either numbers or strings.
fn id_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

impl WireComment {
    fn into_comment(self, broadcast_id: BroadcastId) -> Comment {
        Comment {
            id: id_string(&self.pk),
            broadcast_id,
            author: self.user.username,
            text: self.text,
            created_at: self.created_at,
        }
    }
}

impl From<WireUser> for Viewer {
    fn from(user: WireUser) -> Self {
        Self {
            id: id_string(&user.pk),
            username: user.username,
            full_name: user.full_name,
        }
    }
}

/// [`LiveConnector`] backed by the signing gateway.
#[derive(Debug, Clone)]
pub struct HttpConnector {
    gateway: Arc<Gateway>,
}

impl HttpConnector {
    pub fn new(config: &HttpConnectorConfig) -> ServiceResult<Self> {
        Ok(Self {
            gateway: Arc::new(Gateway::new(config)?),
        })
    }

    fn session(&self, token: String) -> Arc<dyn LiveSession> {
        Arc::new(HttpSession {
            gateway: Arc::clone(&self.gateway),
            token,
        })
    }
}

#[async_trait]
impl LiveConnector for HttpConnector {
    async fn login_with_token(
        &self,
        account: &str,
        token: &str,
    ) -> ServiceResult<Arc<dyn LiveSession>> {
        let resp: TokenResponse = self
            .gateway
            .call(
                "login/token",
                None,
                json!({ "username": account, "token": token }),
            )
            .await?;
        Ok(self.session(resp.token))
    }

    async fn login_with_password(
        &self,
        account: &str,
        password: &str,
    ) -> ServiceResult<PasswordLogin> {
        let result: Result<TokenResponse, CallError> = self
            .gateway
            .call(
                "login/password",
                None,
                json!({ "username": account, "password": password }),
            )
            .await;

        match result {
            Ok(resp) => Ok(PasswordLogin::Authenticated(self.session(resp.token))),
            Err(CallError::ChallengeRequired {
                api_path,
                challenge_token,
            }) => Ok(PasswordLogin::ChallengeRequired {
                api_path,
                challenge: Box::new(HttpChallenge {
                    connector: self.clone(),
                    challenge_token,
                }),
            }),
            Err(CallError::Service(e)) => Err(e),
        }
    }
}

struct HttpChallenge {
    connector: HttpConnector,
    challenge_token: String,
}

#[async_trait]
impl Challenge for HttpChallenge {
    async fn begin(&mut self, api_path: &str) -> ServiceResult<()> {
        let _: Empty = self
            .connector
            .gateway
            .call(
                "challenge/begin",
                None,
                json!({ "challenge_token": self.challenge_token, "api_path": api_path }),
            )
            .await?;
        Ok(())
    }

    async fn submit(&mut self, code: &str) -> ServiceResult<Arc<dyn LiveSession>> {
        let resp: TokenResponse = self
            .connector
            .gateway
            .call(
                "challenge/submit",
                None,
                json!({ "challenge_token": self.challenge_token, "security_code": code }),
            )
            .await?;
        Ok(self.connector.session(resp.token))
    }
}

struct HttpSession {
    gateway: Arc<Gateway>,
    token: String,
}

impl HttpSession {
    async fn call<R: DeserializeOwned>(&self, operation: &str, body: Value) -> ServiceResult<R> {
        Ok(self
            .gateway
            .call(operation, Some(&self.token), body)
            .await?)
    }

    async fn call_unit(&self, operation: &str, body: Value) -> ServiceResult<()> {
        let _: Empty = self.call(operation, body).await?;
        Ok(())
    }
}

#[async_trait]
impl LiveSession for HttpSession {
    fn export_token(&self) -> ServiceResult<String> {
        Ok(self.token.clone())
    }

    async fn create_broadcast(
        &self,
        width: u32,
        height: u32,
        message: &str,
    ) -> ServiceResult<CreatedBroadcast> {
        let resp: CreateResponse = self
            .call(
                "broadcast/create",
                json!({
                    "preview_width": width,
                    "preview_height": height,
                    "broadcast_message": message,
                    "broadcast_type": "RTMP",
                }),
            )
            .await?;
        Ok(CreatedBroadcast {
            id: resp.broadcast_id,
            ingest_url: resp.upload_url,
        })
    }

    async fn start_broadcast(&self, id: BroadcastId, notify: bool) -> ServiceResult<()> {
        self.call_unit(
            "broadcast/start",
            json!({ "broadcast_id": id, "should_send_notifications": notify }),
        )
        .await
    }

    async fn unmute_comments(&self, id: BroadcastId) -> ServiceResult<()> {
        self.call_unit("broadcast/unmute_comment", json!({ "broadcast_id": id }))
            .await
    }

    async fn disable_join_requests(&self, id: BroadcastId) -> ServiceResult<()> {
        self.call_unit(
            "broadcast/disable_request_to_join",
            json!({ "broadcast_id": id }),
        )
        .await
    }

    async fn heartbeat(&self, id: BroadcastId) -> ServiceResult<Heartbeat> {
        let resp: HeartbeatResponse = self
            .call(
                "broadcast/heartbeat_and_get_viewer_count",
                json!({ "broadcast_id": id }),
            )
            .await?;
        Ok(Heartbeat {
            viewer_count: resp.viewer_count.max(0.0) as u64,
            total_unique_viewers: resp.total_unique_viewer_count,
            status: BroadcastStatus::parse(&resp.broadcast_status),
        })
    }

    async fn fetch_comments(
        &self,
        id: BroadcastId,
        limit: usize,
        since: i64,
    ) -> ServiceResult<Vec<Comment>> {
        let resp: CommentsResponse = self
            .call(
                "broadcast/get_comment",
                json!({
                    "broadcast_id": id,
                    "num_comments_requested": limit,
                    "last_comment_ts": since,
                }),
            )
            .await?;
        Ok(resp
            .comments
            .into_iter()
            .map(|c| c.into_comment(id))
            .collect())
    }

    async fn post_comment(&self, id: BroadcastId, text: &str) -> ServiceResult<CommentRef> {
        let resp: PostCommentResponse = self
            .call(
                "broadcast/comment",
                json!({ "broadcast_id": id, "comment_text": text }),
            )
            .await?;
        Ok(CommentRef {
            id: id_string(&resp.comment.pk),
        })
    }

    async fn pin_comment(&self, id: BroadcastId, comment: &CommentRef) -> ServiceResult<()> {
        self.call_unit(
            "broadcast/pin_comment",
            json!({ "broadcast_id": id, "comment_id": comment.id }),
        )
        .await
    }

    async fn end_broadcast(&self, id: BroadcastId) -> ServiceResult<()> {
        self.call_unit(
            "broadcast/end_broadcast",
            json!({ "broadcast_id": id, "end_after_copyright_warning": false }),
        )
        .await
    }

    async fn publish_story(&self, id: BroadcastId) -> ServiceResult<()> {
        self.call_unit("broadcast/add_to_post_live", json!({ "broadcast_id": id }))
            .await
    }

    async fn fetch_thumbnails(&self, id: BroadcastId) -> ServiceResult<Vec<String>> {
        let resp: ThumbnailsResponse = self
            .call(
                "broadcast/get_post_live_thumbnails",
                json!({ "broadcast_id": id }),
            )
            .await?;
        Ok(resp.thumbnails)
    }

    async fn fetch_image(&self, url: &str) -> ServiceResult<Bytes> {
        let response = self
            .gateway
            .client
            .get(url)
            .send()
            .await
            .map_err(transport)?
            .error_for_status()
            .map_err(transport)?;
        response.bytes().await.map_err(transport)
    }

    async fn upload_image(&self, image: Bytes) -> ServiceResult<String> {
        let response = self
            .gateway
            .client
            .post(self.gateway.endpoint("media/upload_photo")?)
            .header(SESSION_HEADER, &self.token)
            .header(reqwest::header::CONTENT_TYPE, "image/jpeg")
            .body(image)
            .send()
            .await
            .map_err(transport)?;
        let status = response.status();
        let value: Value = response.json().await.map_err(transport)?;
        if !status.is_success() {
            return Err(classify_error(status, &value).into());
        }
        let resp: UploadResponse =
            serde_json::from_value(value).map_err(|e| ServiceError::Decode(e.to_string()))?;
        Ok(resp.upload_id)
    }

    async fn publish_recap(&self, request: &RecapRequest) -> ServiceResult<()> {
        self.call_unit(
            "broadcast/add_post_live_to_igtv",
            json!({
                "broadcast_id": request.broadcast_id,
                "cover_upload_id": request.cover_asset_id,
                "title": request.title,
                "description": request.description,
                "igtv_share_preview_to_feed": request.share_to_feed,
            }),
        )
        .await
    }

    async fn fetch_final_audience(&self, id: BroadcastId) -> ServiceResult<FinalAudience> {
        let resp: FinalViewersResponse = self
            .call(
                "broadcast/get_final_viewer_list",
                json!({ "broadcast_id": id }),
            )
            .await?;
        Ok(FinalAudience {
            viewers: resp.users.into_iter().map(Viewer::from).collect(),
            total_unique_viewers: resp.total_unique_viewer_count,
        })
    }
}
