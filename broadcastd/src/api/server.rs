//! Control-plane server setup.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::Router;
use axum::extract::Request;
use axum::response::Response;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::classify::{ServerErrorsAsFailures, SharedClassifier};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::{
    DefaultMakeSpan, DefaultOnRequest, DefaultOnResponse, MakeSpan, OnResponse, TraceLayer,
};
use tracing::{Level, Span, info};

use crate::api::routes;
use crate::broadcast::Broadcast;
use crate::config::ApiConfig;
use crate::error::{Error, Result};
use crate::logging::LoggingConfig;

#[derive(Debug, Clone)]
pub struct ApiServerConfig {
    pub bind_address: String,
    pub port: u16,
    pub enable_cors: bool,
}

impl Default for ApiServerConfig {
    fn default() -> Self {
        Self::from(&ApiConfig::default())
    }
}

impl From<&ApiConfig> for ApiServerConfig {
    fn from(config: &ApiConfig) -> Self {
        Self {
            bind_address: config.bind_address.clone(),
            port: config.port,
            enable_cors: true,
        }
    }
}

/// Shared handler state.
#[derive(Clone)]
pub struct AppState {
    pub start_time: Instant,
    pub broadcast: Arc<Broadcast>,
    /// Absent when the subscriber was installed elsewhere (tests).
    pub logging_config: Option<Arc<LoggingConfig>>,
}

impl AppState {
    pub fn new(broadcast: Arc<Broadcast>) -> Self {
        Self {
            start_time: Instant::now(),
            broadcast,
            logging_config: None,
        }
    }

    pub fn with_logging(mut self, logging_config: Arc<LoggingConfig>) -> Self {
        self.logging_config = Some(logging_config);
        self
    }
}

pub struct ApiServer {
    config: ApiServerConfig,
    state: AppState,
    cancel_token: CancellationToken,
}

impl ApiServer {
    pub fn new(config: ApiServerConfig, state: AppState) -> Self {
        Self {
            config,
            state,
            cancel_token: CancellationToken::new(),
        }
    }

    /// Cancelling this token shuts the server down gracefully.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel_token.clone()
    }

    /// Router with every route and middleware attached.
    pub fn build_router(&self) -> Router {
        let router = routes::create_router(self.state.clone());
        let router = if self.config.enable_cors {
            router.layer(
                CorsLayer::new()
                    .allow_origin(Any)
                    .allow_methods(Any)
                    .allow_headers(Any),
            )
        } else {
            router
        };
        router.layer(trace_layer())
    }

    pub async fn run(&self) -> Result<()> {
        let addr: SocketAddr = format!("{}:{}", self.config.bind_address, self.config.port)
            .parse()
            .map_err(|e| Error::config(format!("Invalid address: {e}")))?;

        let router = self.build_router();
        let listener = TcpListener::bind(addr).await?;

        info!(%addr, "Control plane listening");

        let cancel_token = self.cancel_token.clone();
        axum::serve(listener, router)
            .with_graceful_shutdown(async move {
                cancel_token.cancelled().await;
                info!("Control plane shutting down");
            })
            .await?;

        Ok(())
    }
}

/// Paths whose requests are not traced: health probes are frequent and
/// comment sockets stay open for the whole session.
const QUIET_PATHS: &[&str] = &["/api/health", "/ws/comments"];

fn is_quiet(path: &str) -> bool {
    QUIET_PATHS.iter().any(|quiet| path.starts_with(quiet))
}

fn trace_layer() -> TraceLayer<
    SharedClassifier<ServerErrorsAsFailures>,
    impl Fn(&Request) -> Span + Clone,
    DefaultOnRequest,
    impl Fn(&Response, Duration, &Span) + Clone,
> {
    TraceLayer::new_for_http()
        .make_span_with(|req: &Request| {
            if is_quiet(req.uri().path()) {
                Span::none()
            } else {
                DefaultMakeSpan::new().level(Level::INFO).make_span(req)
            }
        })
        .on_response(|res: &Response, latency: Duration, span: &Span| {
            if !span.is_disabled() {
                DefaultOnResponse::new()
                    .level(Level::INFO)
                    .on_response(res, latency, span);
            }
        })
}
