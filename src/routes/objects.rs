//! Registered object endpoints
//!
//! - GET /api/v1/objects - List the caller's objects
//! - DELETE /api/v1/objects/:object_id - Delete an object and release its quota

use axum::{
    extract::{Path, State},
    routing::{delete, get},
    Json, Router,
};
use serde::Serialize;

use crate::db::{ObjectRepository, StoredObject};
use crate::error::{AppError, Result};
use crate::state::AppState;

use super::UserId;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/", get(list_objects))
        .route("/:object_id", delete(delete_object))
}

async fn list_objects(
    State(state): State<AppState>,
    UserId(user_id): UserId,
) -> Result<Json<Vec<StoredObject>>> {
    let objects = ObjectRepository::new(state.db()).list_for_owner(&user_id).await?;
    Ok(Json(objects))
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct DeleteResponse {
    object_id: String,
    released_bytes: u64,
}

async fn delete_object(
    State(state): State<AppState>,
    UserId(user_id): UserId,
    Path(object_id): Path<String>,
) -> Result<Json<DeleteResponse>> {
    let object = ObjectRepository::new(state.db())
        .soft_delete(&user_id, &object_id)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("Object not found: {}", object_id)))?;

    let size = object.size.max(0) as u64;
    state.quota().release(&user_id, size).await?;

    tracing::info!(
        object_id = %object.id,
        user_id = %user_id,
        object_key = %object.object_key,
        size,
        "Object deleted"
    );

    Ok(Json(DeleteResponse {
        object_id: object.id,
        released_bytes: size,
    }))
}
