//! Handlers for the `/collections` resource.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use imgflow_store::FileSource;
use serde::Deserialize;

use crate::error::AppResult;
use crate::response::{DataResponse, MessageResponse, StatusResponse};
use crate::state::AppState;

/// Body of `POST /collections`.
#[derive(Debug, Deserialize)]
pub struct CreateCollection {
    pub name: String,
    #[serde(default)]
    pub files: Vec<FileSource>,
}

/// POST /collections
///
/// Starts downloading `files` into a new collection and answers 202. The
/// collection becomes available once every file has arrived.
pub async fn create_collection(
    State(state): State<AppState>,
    Json(input): Json<CreateCollection>,
) -> AppResult<impl IntoResponse> {
    let total = input.files.len();
    let collection = state
        .collections
        .download(&input.name, input.files, state.fetcher.clone())
        .await?;

    tracing::info!(collection = %collection.name, files = total, "Collection download started");

    Ok((
        StatusCode::ACCEPTED,
        Json(StatusResponse::accepted(
            &collection.name,
            &collection.status.status_message,
            format!("/collections/{}", collection.name),
        )),
    ))
}

/// GET /collections/{name}
pub async fn get_collection(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> AppResult<impl IntoResponse> {
    let collection = state.collections.get(&name).await?;
    Ok(Json(DataResponse { data: collection }))
}

/// DELETE /collections/{name}
pub async fn delete_collection(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> AppResult<impl IntoResponse> {
    state.collections.delete(&name).await?;
    Ok(Json(MessageResponse {
        message: format!("Collection {name} successfully deleted!"),
    }))
}
