//! Upload Routes
//!
//! HTTP endpoints for chunked, resumable uploads.
//!
//! Endpoints:
//! - POST /api/v1/uploads - Initiate upload
//! - GET /api/v1/uploads/:session_id - Progress and missing chunk indices
//! - PUT /api/v1/uploads/:session_id/chunks/:index - Upload a chunk
//! - GET /api/v1/uploads/:session_id/missing - Missing chunks with byte ranges
//! - POST /api/v1/uploads/:session_id/finalize - Assemble and register the object
//! - DELETE /api/v1/uploads/:session_id - Cancel upload

use axum::{
    body::Bytes,
    extract::{DefaultBodyLimit, Path, State},
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
    routing::{get, post, put},
    Json, Router,
};
use serde::Serialize;
use uuid::Uuid;

use crate::error::ErrorResponse;
use crate::state::AppState;
use crate::upload::{
    ChunkUploadResponse, FinalizeResponse, InitiateRequest, InitiateResponse, MissingChunk,
    SessionStatusResponse, UploadError, UploadSession,
};

use super::UserId;

/// Header carrying the hex SHA-256 of a chunk body
pub const CHUNK_DIGEST_HEADER: &str = "x-chunk-digest";

// ============================================================================
// Error Response
// ============================================================================

impl IntoResponse for UploadError {
    fn into_response(self) -> axum::response::Response {
        let status = self.status_code();
        if status.is_server_error() {
            tracing::error!(code = self.code(), error = %self, "Upload request failed");
        }

        let body = Json(ErrorResponse {
            error: self.to_string(),
            code: self.code(),
            details: self.details(),
        });

        (status, body).into_response()
    }
}

// ============================================================================
// Router
// ============================================================================

/// Create the upload router
pub fn router(state: &AppState) -> Router<AppState> {
    // Room for a full chunk plus framing
    let body_limit = state.config().upload.max_chunk_size as usize + 64 * 1024;

    Router::new()
        .route("/", post(initiate))
        .route("/:session_id", get(get_status).delete(cancel))
        .route(
            "/:session_id/chunks/:index",
            put(upload_chunk).layer(DefaultBodyLimit::max(body_limit)),
        )
        .route("/:session_id/missing", get(get_missing))
        .route("/:session_id/finalize", post(finalize))
}

// ============================================================================
// Handlers
// ============================================================================

/// POST /api/v1/uploads
async fn initiate(
    State(state): State<AppState>,
    UserId(user_id): UserId,
    Json(request): Json<InitiateRequest>,
) -> Result<(StatusCode, Json<InitiateResponse>), UploadError> {
    let response = state.sessions().initiate(&user_id, &request).await?;
    Ok((StatusCode::CREATED, Json(response)))
}

/// GET /api/v1/uploads/:session_id
async fn get_status(
    State(state): State<AppState>,
    UserId(user_id): UserId,
    Path(session_id): Path<String>,
) -> Result<Json<SessionStatusResponse>, UploadError> {
    let session = owned_session(&state, &user_id, &session_id).await?;
    Ok(Json(state.sessions().status(session.id).await?))
}

/// PUT /api/v1/uploads/:session_id/chunks/:index
///
/// The raw body is the chunk; its digest travels in `X-Chunk-Digest`.
async fn upload_chunk(
    State(state): State<AppState>,
    UserId(user_id): UserId,
    Path((session_id, index)): Path<(String, u64)>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<ChunkUploadResponse>, UploadError> {
    let digest = headers
        .get(CHUNK_DIGEST_HEADER)
        .and_then(|value| value.to_str().ok())
        .ok_or_else(|| UploadError::InvalidRequest("missing X-Chunk-Digest header".to_string()))?;

    let session = owned_session(&state, &user_id, &session_id).await?;
    let response = state
        .sessions()
        .accept_chunk(session.id, index, &body, digest)
        .await?;

    Ok(Json(response))
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct MissingResponse {
    session_id: Uuid,
    missing: Vec<MissingChunk>,
}

/// GET /api/v1/uploads/:session_id/missing
async fn get_missing(
    State(state): State<AppState>,
    UserId(user_id): UserId,
    Path(session_id): Path<String>,
) -> Result<Json<MissingResponse>, UploadError> {
    let session = owned_session(&state, &user_id, &session_id).await?;

    Ok(Json(MissingResponse {
        session_id: session.id,
        missing: crate::upload::compute_missing(&session),
    }))
}

/// POST /api/v1/uploads/:session_id/finalize
async fn finalize(
    State(state): State<AppState>,
    UserId(user_id): UserId,
    Path(session_id): Path<String>,
) -> Result<Json<FinalizeResponse>, UploadError> {
    let session = owned_session(&state, &user_id, &session_id).await?;
    Ok(Json(state.finalizer().finalize(session.id).await?))
}

#[derive(Serialize)]
struct CancelResponse {
    ok: bool,
}

/// DELETE /api/v1/uploads/:session_id
async fn cancel(
    State(state): State<AppState>,
    UserId(user_id): UserId,
    Path(session_id): Path<String>,
) -> Result<Json<CancelResponse>, UploadError> {
    let id = parse_session_id(&session_id)?;

    match state.sessions().get_session(id).await {
        Ok(session) if session.user_id != user_id => {
            return Err(UploadError::SessionNotFound(session_id));
        }
        Ok(_) | Err(UploadError::SessionNotFound(_)) => {}
        Err(e) => return Err(e),
    }

    state.sessions().abort(id).await?;
    Ok(Json(CancelResponse { ok: true }))
}

// ============================================================================
// Helpers
// ============================================================================

fn parse_session_id(session_id: &str) -> Result<Uuid, UploadError> {
    Uuid::parse_str(session_id).map_err(|_| UploadError::SessionNotFound(session_id.to_string()))
}

/// Load a session, hiding other users' sessions as not found
async fn owned_session(
    state: &AppState,
    user_id: &str,
    session_id: &str,
) -> Result<UploadSession, UploadError> {
    let id = parse_session_id(session_id)?;
    let session = state.sessions().get_session(id).await?;

    if session.user_id != user_id {
        return Err(UploadError::SessionNotFound(session_id.to_string()));
    }
    Ok(session)
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use axum::{body::Body, http::Request};
    use serde_json::json;

    use super::*;
    use crate::routes::test_app::{app, empty_request, json_request, send};
    use crate::test_support::{content, digest_of, harness, slice};

    fn chunk_request(session_id: &str, index: u64, user: &str, data: &[u8], digest: &str) -> Request<Body> {
        Request::builder()
            .method("PUT")
            .uri(format!("/api/v1/uploads/{}/chunks/{}", session_id, index))
            .header("x-user-id", user)
            .header(CHUNK_DIGEST_HEADER, digest)
            .body(Body::from(data.to_vec()))
            .unwrap()
    }

    #[tokio::test]
    async fn test_full_upload_over_http() {
        let h = harness().await;
        let (app, _) = app(&h);
        let data = content(250);

        let (status, body) = send(
            &app,
            json_request(
                "POST",
                "/api/v1/uploads",
                "alice",
                json!({"fileName": "notes.txt", "size": 250, "chunkSize": 100}),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(body["totalChunks"], 3);
        let id = body["sessionId"].as_str().unwrap().to_string();

        for index in [2u64, 0] {
            let chunk = slice(&data, 100, index);
            let (status, body) = send(&app, chunk_request(&id, index, "alice", chunk, &digest_of(chunk))).await;
            assert_eq!(status, StatusCode::OK);
            assert_eq!(body["accepted"], true);
        }

        let (status, body) = send(&app, empty_request("GET", &format!("/api/v1/uploads/{}", id), "alice")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["chunksReceived"], 2);
        assert_eq!(body["missing"], json!([1]));

        let (status, body) = send(
            &app,
            empty_request("POST", &format!("/api/v1/uploads/{}/finalize", id), "alice"),
        )
        .await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body["code"], "INCOMPLETE_UPLOAD");
        assert_eq!(body["details"]["missing"], json!([1]));

        let (status, body) = send(
            &app,
            empty_request("GET", &format!("/api/v1/uploads/{}/missing", id), "alice"),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["missing"][0]["start"], 100);
        assert_eq!(body["missing"][0]["end"], 200);

        let chunk = slice(&data, 100, 1);
        send(&app, chunk_request(&id, 1, "alice", chunk, &digest_of(chunk))).await;

        let (status, body) = send(
            &app,
            empty_request("POST", &format!("/api/v1/uploads/{}/finalize", id), "alice"),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["size"], 250);
        assert!(body["objectId"].is_string());
    }

    #[tokio::test]
    async fn test_error_bodies_carry_details() {
        let h = harness().await;
        let (app, _) = app(&h);

        let (_, body) = send(
            &app,
            json_request("POST", "/api/v1/uploads", "alice", json!({"fileName": "a.bin", "size": 20, "chunkSize": 10})),
        )
        .await;
        let id = body["sessionId"].as_str().unwrap().to_string();

        let data = vec![9u8; 10];
        let (status, body) = send(&app, chunk_request(&id, 5, "alice", &data, &digest_of(&data))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["code"], "INDEX_OUT_OF_RANGE");
        assert_eq!(body["details"]["validRange"], json!([0, 1]));

        let (status, body) = send(&app, chunk_request(&id, 0, "alice", &data, &digest_of(b"other"))).await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
        assert_eq!(body["code"], "CHUNK_INTEGRITY_ERROR");
        assert_eq!(body["details"]["computed"], digest_of(&data));
    }

    #[tokio::test]
    async fn test_quota_exceeded_over_http() {
        let h = harness().await;
        let (app, _) = app(&h);
        h.quota.set_limit("alice", 100).await.unwrap();

        let (status, body) = send(
            &app,
            json_request("POST", "/api/v1/uploads", "alice", json!({"fileName": "big.bin", "size": 101})),
        )
        .await;

        assert_eq!(status, StatusCode::INSUFFICIENT_STORAGE);
        assert_eq!(body["code"], "QUOTA_EXCEEDED");
        assert_eq!(body["details"]["required"], 101);
        assert_eq!(body["details"]["available"], 100);
    }

    #[tokio::test]
    async fn test_sessions_are_private_to_their_owner() {
        let h = harness().await;
        let (app, _) = app(&h);

        let (_, body) = send(
            &app,
            json_request("POST", "/api/v1/uploads", "alice", json!({"fileName": "a.bin", "size": 10})),
        )
        .await;
        let id = body["sessionId"].as_str().unwrap().to_string();

        let (status, body) = send(&app, empty_request("GET", &format!("/api/v1/uploads/{}", id), "mallory")).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["code"], "SESSION_NOT_FOUND");

        let (status, _) = send(&app, empty_request("DELETE", &format!("/api/v1/uploads/{}", id), "mallory")).await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, body) = send(&app, empty_request("DELETE", &format!("/api/v1/uploads/{}", id), "alice")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["ok"], true);

        // Cancelling again is still fine
        let (status, _) = send(&app, empty_request("DELETE", &format!("/api/v1/uploads/{}", id), "alice")).await;
        assert_eq!(status, StatusCode::OK);
    }

    #[tokio::test]
    async fn test_requests_without_identity_are_rejected() {
        let h = harness().await;
        let (app, _) = app(&h);

        let request = Request::builder()
            .method("POST")
            .uri("/api/v1/uploads")
            .header("content-type", "application/json")
            .body(Body::from(json!({"fileName": "a.bin", "size": 10}).to_string()))
            .unwrap();
        let (status, body) = send(&app, request).await;

        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body["code"], "UNAUTHORIZED");
    }

    #[tokio::test]
    async fn test_missing_digest_header() {
        let h = harness().await;
        let (app, _) = app(&h);
        let (_, body) = send(
            &app,
            json_request("POST", "/api/v1/uploads", "alice", json!({"fileName": "a.bin", "size": 10})),
        )
        .await;
        let id = body["sessionId"].as_str().unwrap();

        let request = Request::builder()
            .method("PUT")
            .uri(format!("/api/v1/uploads/{}/chunks/0", id))
            .header("x-user-id", "alice")
            .body(Body::from(vec![0u8; 10]))
            .unwrap();
        let (status, body) = send(&app, request).await;

        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["code"], "INVALID_REQUEST");
    }
}
