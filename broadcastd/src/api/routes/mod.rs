//! Control-plane routes.

pub mod comments;
pub mod health;
pub mod logging;
pub mod streams;

use axum::Router;

use crate::api::server::AppState;

pub fn create_router(state: AppState) -> Router {
    Router::new()
        .merge(health::router())
        .merge(streams::router())
        .merge(comments::router())
        .merge(logging::router())
        .with_state(state)
}

#[cfg(test)]
pub(crate) mod test_support {
    use std::sync::Arc;

    use async_trait::async_trait;
    use axum::Router;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    use crate::api::server::AppState;
    use crate::broadcast::Broadcast;
    use crate::client::{LiveConnector, LiveSession, PasswordLogin, ServiceError, ServiceResult};
    use crate::config::{AppConfig, ConfigFile};

    /// Rejects every login, so started streams sit in their cooldown.
    pub(crate) struct RejectingConnector;

    #[async_trait]
    impl LiveConnector for RejectingConnector {
        async fn login_with_token(
            &self,
            _account: &str,
            _token: &str,
        ) -> ServiceResult<Arc<dyn LiveSession>> {
            Err(ServiceError::status("rejected"))
        }

        async fn login_with_password(
            &self,
            _account: &str,
            _password: &str,
        ) -> ServiceResult<PasswordLogin> {
            Err(ServiceError::status("rejected"))
        }
    }

    pub(crate) fn state() -> AppState {
        let config = AppConfig::from_yaml(
            "input_url: rtmp://127.0.0.1/live\naccounts:\n  bob:\n    password: b\n  alice:\n    password: a\n",
        )
        .unwrap();
        let credentials = Arc::new(ConfigFile::new("unused.yaml", config.clone()));
        let broadcast = Broadcast::from_config(&config, Arc::new(RejectingConnector), credentials);
        AppState::new(Arc::new(broadcast))
    }

    pub(crate) async fn send(
        router: Router,
        method: &str,
        uri: &str,
        body: Option<serde_json::Value>,
    ) -> (StatusCode, serde_json::Value) {
        let builder = Request::builder().method(method).uri(uri);
        let request = match body {
            Some(json) => builder
                .header("content-type", "application/json")
                .body(Body::from(json.to_string()))
                .unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        };

        let response = router.oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        let json = if bytes.is_empty() {
            serde_json::Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, json)
    }
}
