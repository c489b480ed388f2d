//! Handlers for the `/algorithms` resource.

use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use imgflow_core::service::{ExecutionSpec, ServiceKind};
use serde::Deserialize;

use crate::error::AppResult;
use crate::response::{DataResponse, StatusResponse};
use crate::state::AppState;

/// Body of `POST /algorithms`.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterAlgorithm {
    pub name: String,
    pub version: String,
    pub image: String,
    #[serde(default)]
    pub command: Vec<String>,
    #[serde(default)]
    pub timeout_secs: Option<u64>,
    #[serde(default)]
    pub description: Option<String>,
}

/// GET /algorithms
pub async fn list_algorithms(State(state): State<AppState>) -> impl IntoResponse {
    let algorithms = state.registry.list(Some(ServiceKind::Algorithm)).await;
    Json(DataResponse { data: algorithms })
}

/// POST /algorithms
pub async fn register_algorithm(
    State(state): State<AppState>,
    Json(input): Json<RegisterAlgorithm>,
) -> AppResult<impl IntoResponse> {
    let execution = ExecutionSpec {
        image: input.image,
        command: input.command,
        timeout_secs: input.timeout_secs,
    };
    let entry = state
        .engine
        .register_algorithm(&input.name, &input.version, execution, input.description)
        .await?;

    tracing::info!(service_id = %entry.identifier, path = %entry.path, "Algorithm registered");

    Ok(Json(StatusResponse::registered(
        entry.identifier,
        entry.status.status_code,
        &entry.status.status_message,
    )))
}

/// POST /algorithms/{name}/{version}
pub async fn execute_algorithm(
    State(state): State<AppState>,
    Path((name, version)): Path<(String, String)>,
    body: Bytes,
) -> AppResult<(StatusCode, Json<StatusResponse>)> {
    super::execute_service(&state, ServiceKind::Algorithm, &name, &version, &body).await
}
