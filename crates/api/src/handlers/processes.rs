//! Handlers for the `/processes` resource.
//!
//! An identifier is either a single process or a workflow run; both are
//! polled, fetched and cancelled through the same routes.

use axum::extract::{Path, State};
use axum::response::IntoResponse;
use axum::Json;
use imgflow_core::types::EntityId;

use crate::error::AppResult;
use crate::response::DataResponse;
use crate::state::AppState;

/// GET /processes/{id}
pub async fn get_process(
    State(state): State<AppState>,
    Path(id): Path<EntityId>,
) -> AppResult<impl IntoResponse> {
    let tracked = state.engine.status(id).await?;
    Ok(Json(DataResponse { data: tracked }))
}

/// GET /processes/{id}/result
///
/// 409 until the process or run is DONE.
pub async fn get_result(
    State(state): State<AppState>,
    Path(id): Path<EntityId>,
) -> AppResult<impl IntoResponse> {
    let result = state.engine.result(id).await?;
    Ok(Json(DataResponse { data: result }))
}

/// POST /processes/{id}/cancel
pub async fn cancel_process(
    State(state): State<AppState>,
    Path(id): Path<EntityId>,
) -> AppResult<impl IntoResponse> {
    let tracked = state.engine.cancel(id).await?;
    tracing::info!(identifier = %id, "Cancellation requested");
    Ok(Json(DataResponse { data: tracked }))
}
