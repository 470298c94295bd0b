//! Stream lifecycle routes.

use axum::{
    Json, Router,
    extract::{Path, State},
    routing::{get, post},
};
use serde::{Deserialize, Serialize};

use crate::api::error::{ApiError, ApiResult};
use crate::api::server::AppState;
use crate::stream::StreamStatus;

#[derive(Debug, Serialize)]
pub struct StreamsResponse {
    pub live: bool,
    pub streams: Vec<StreamStatus>,
}

#[derive(Debug, Deserialize)]
pub struct LiveRequest {
    pub live: bool,
}

#[derive(Debug, Serialize)]
pub struct LiveResponse {
    pub live: bool,
}

#[derive(Debug, Deserialize)]
pub struct SecurityCodeRequest {
    pub code: String,
}

#[derive(Debug, Serialize)]
pub struct SecurityCodeResponse {
    /// Whether a challenge was waiting for the code.
    pub delivered: bool,
}

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/api/live", post(set_live))
        .route("/api/streams", get(list_streams))
        .route("/api/streams/{name}", get(get_stream))
        .route("/api/streams/{name}/start", post(start_stream))
        .route("/api/streams/{name}/stop", post(stop_stream))
        .route("/api/streams/{name}/security_code", post(put_security_code))
}

async fn list_streams(State(state): State<AppState>) -> Json<StreamsResponse> {
    Json(StreamsResponse {
        live: state.broadcast.is_live(),
        streams: state.broadcast.statuses(),
    })
}

async fn get_stream(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> ApiResult<Json<StreamStatus>> {
    Ok(Json(state.broadcast.status(&name)?))
}

/// Start or stop every stream. Stopping waits for in-flight cycles to drain.
async fn set_live(
    State(state): State<AppState>,
    Json(request): Json<LiveRequest>,
) -> ApiResult<Json<LiveResponse>> {
    let result = if request.live {
        state.broadcast.start_all().await
    } else {
        state.broadcast.stop_all().await
    };

    match result {
        Ok(()) => {}
        // The global flag flipped; per-stream failures are reported in the log.
        Err(e @ (crate::Error::AlreadyStarted(_) | crate::Error::AlreadyStopped(_))) => {
            return Err(e.into());
        }
        Err(e) => tracing::warn!(error = %e, "Some streams failed to change state"),
    }

    Ok(Json(LiveResponse {
        live: state.broadcast.is_live(),
    }))
}

async fn start_stream(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> ApiResult<Json<StreamStatus>> {
    state.broadcast.start_stream(&name).await?;
    Ok(Json(state.broadcast.status(&name)?))
}

async fn stop_stream(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> ApiResult<Json<StreamStatus>> {
    state.broadcast.stop_stream(&name).await?;
    Ok(Json(state.broadcast.status(&name)?))
}

async fn put_security_code(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Json(request): Json<SecurityCodeRequest>,
) -> ApiResult<Json<SecurityCodeResponse>> {
    let code = request.code.trim();
    if code.is_empty() {
        return Err(ApiError::bad_request("code must not be empty"));
    }

    let delivered = state.broadcast.put_security_code(&name, code)?;
    Ok(Json(SecurityCodeResponse { delivered }))
}
