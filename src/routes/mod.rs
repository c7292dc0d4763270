//! Route modules for the Depot server

pub mod health;
pub mod objects;
pub mod quota;
pub mod upload;

use axum::{async_trait, extract::FromRequestParts, http::request::Parts, Router};

use crate::error::AppError;
use crate::state::AppState;

/// Header carrying the caller's identity, set by the upstream auth layer
pub const USER_ID_HEADER: &str = "x-user-id";

/// Authenticated caller
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserId(pub String);

#[async_trait]
impl<S: Send + Sync> FromRequestParts<S> for UserId {
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts
            .headers
            .get(USER_ID_HEADER)
            .and_then(|value| value.to_str().ok())
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .map(|value| UserId(value.to_string()))
            .ok_or_else(|| AppError::Unauthorized("missing X-User-Id header".to_string()))
    }
}

/// Build the full API router
pub fn router(state: AppState) -> Router {
    Router::new()
        .nest("/health", health::router())
        .nest("/api/v1/uploads", upload::router(&state))
        .nest("/api/v1/quota", quota::router())
        .nest("/api/v1/objects", objects::router())
        .with_state(state)
}

#[cfg(test)]
pub(crate) mod test_app {
    use axum::{
        body::{to_bytes, Body},
        http::{Request, StatusCode},
        Router,
    };
    use tower::ServiceExt;

    use crate::config::Config;
    use crate::state::AppState;
    use crate::test_support::Harness;

    /// Router over a test harness's database and storage
    pub fn app(h: &Harness) -> (Router, AppState) {
        let mut config = Config::default();
        config.storage.local_path = h.root.path().display().to_string();

        let state = AppState::new(config, h.pool.clone(), h.storage.clone(), h.store.clone());
        (super::router(state.clone()), state)
    }

    pub async fn send(app: &Router, request: Request<Body>) -> (StatusCode, serde_json::Value) {
        let response = app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let json = if bytes.is_empty() {
            serde_json::Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, json)
    }

    pub fn json_request(method: &str, uri: &str, user: &str, body: serde_json::Value) -> Request<Body> {
        Request::builder()
            .method(method)
            .uri(uri)
            .header("x-user-id", user)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    pub fn empty_request(method: &str, uri: &str, user: &str) -> Request<Body> {
        Request::builder()
            .method(method)
            .uri(uri)
            .header("x-user-id", user)
            .body(Body::empty())
            .unwrap()
    }
}
