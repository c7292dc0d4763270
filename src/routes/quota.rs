//! Quota endpoints
//!
//! - GET /api/v1/quota - Caller's quota, optionally checked against `?required=`
//! - PUT /api/v1/quota/:user_id/limit - Set a user's limit
//! - POST /api/v1/quota/:user_id/reconcile - Recompute usage from stored objects

use axum::{
    extract::{Path, Query, State},
    routing::{get, post, put},
    Json, Router,
};
use serde::Deserialize;

use crate::error::{AppError, Result};
use crate::quota::{QuotaCheck, QuotaSnapshot, ReconcileReport};
use crate::state::AppState;

use super::UserId;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/", get(get_quota))
        .route("/:user_id/limit", put(set_limit))
        .route("/:user_id/reconcile", post(reconcile))
}

#[derive(Debug, Deserialize)]
struct QuotaQuery {
    #[serde(default)]
    required: u64,
}

async fn get_quota(
    State(state): State<AppState>,
    UserId(user_id): UserId,
    Query(query): Query<QuotaQuery>,
) -> Result<Json<QuotaCheck>> {
    let check = state.quota().check_quota(&user_id, query.required).await?;
    Ok(Json(check))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SetLimitRequest {
    limit_bytes: u64,
}

async fn set_limit(
    State(state): State<AppState>,
    Path(user_id): Path<String>,
    Json(request): Json<SetLimitRequest>,
) -> Result<Json<QuotaSnapshot>> {
    if user_id.trim().is_empty() {
        return Err(AppError::BadRequest("user id must not be empty".to_string()));
    }
    let snapshot = state.quota().set_limit(&user_id, request.limit_bytes).await?;
    Ok(Json(snapshot))
}

async fn reconcile(
    State(state): State<AppState>,
    Path(user_id): Path<String>,
) -> Result<Json<ReconcileReport>> {
    let report = state.quota().reconcile(&user_id).await?;
    Ok(Json(report))
}

#[cfg(test)]
mod tests {
    use axum::http::StatusCode;
    use serde_json::json;

    use crate::routes::test_app::{app, empty_request, json_request, send};
    use crate::test_support::harness;

    #[tokio::test]
    async fn test_quota_lifecycle_over_http() {
        let h = harness().await;
        let (app, _) = app(&h);

        let (status, body) = send(
            &app,
            json_request("PUT", "/api/v1/quota/alice/limit", "admin", json!({"limitBytes": 1000})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["limit"], 1000);

        h.quota.charge("alice", 400).await.unwrap();

        let (status, body) = send(&app, empty_request("GET", "/api/v1/quota?required=700", "alice")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["hasQuota"], false);
        assert_eq!(body["available"], 600);
        assert_eq!(body["used"], 400);

        // Nothing stored, so the charge is drift; the default threshold is 1 MiB
        let (status, body) = send(&app, empty_request("POST", "/api/v1/quota/alice/reconcile", "admin")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["ledgerUsed"], 400);
        assert_eq!(body["actualUsed"], 0);
        assert_eq!(body["corrected"], false);
    }
}
