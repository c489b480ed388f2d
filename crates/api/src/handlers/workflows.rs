//! Handlers for the `/workflows` resource.

use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use imgflow_core::naming::service_path;
use imgflow_core::service::ServiceKind;
use imgflow_core::workflow::WorkflowDefinition;

use crate::error::AppResult;
use crate::response::{DataResponse, MessageResponse, StatusResponse};
use crate::state::AppState;

/// GET /workflows
pub async fn list_workflows(State(state): State<AppState>) -> impl IntoResponse {
    let workflows = state.registry.list(Some(ServiceKind::Workflow)).await;
    Json(DataResponse { data: workflows })
}

/// POST /workflows
///
/// Parse and register a workflow definition. Nothing is written when the
/// definition is rejected.
pub async fn register_workflow(
    State(state): State<AppState>,
    Json(definition): Json<WorkflowDefinition>,
) -> AppResult<impl IntoResponse> {
    let entry = state
        .engine
        .register_definition(&definition)
        .await?;

    tracing::info!(
        service_id = %entry.identifier,
        path = %entry.path,
        steps = definition.steps.len(),
        "Workflow registered",
    );

    Ok(Json(StatusResponse::registered(
        entry.identifier,
        entry.status.status_code,
        &entry.status.status_message,
    )))
}

/// POST /workflows/{name}/{version}
pub async fn execute_workflow(
    State(state): State<AppState>,
    Path((name, version)): Path<(String, String)>,
    body: Bytes,
) -> AppResult<(StatusCode, Json<StatusResponse>)> {
    super::execute_service(&state, ServiceKind::Workflow, &name, &version, &body).await
}

/// DELETE /workflows/{name}/{version}
///
/// Tombstones the workflow. Runs already admitted finish normally.
pub async fn delete_workflow(
    State(state): State<AppState>,
    Path((name, version)): Path<(String, String)>,
) -> AppResult<impl IntoResponse> {
    let path = service_path(ServiceKind::Workflow, &name, &version);
    let entry = state.registry.lookup_by_path(&path).await?;
    state.engine.delete(entry.identifier).await?;

    Ok(Json(MessageResponse {
        message: format!("Workflow {name} successfully deleted!"),
    }))
}
