//! Route definitions for the `/processes` resource.

use axum::routing::{get, post};
use axum::Router;

use crate::handlers::processes;
use crate::state::AppState;

/// Routes mounted at `/processes`.
///
/// ```text
/// GET    /{id}            -> get_process
/// GET    /{id}/result     -> get_result
/// POST   /{id}/cancel     -> cancel_process
/// ```
pub fn router() -> Router<AppState> {
    Router::new()
        .route("/{id}", get(processes::get_process))
        .route("/{id}/result", get(processes::get_result))
        .route("/{id}/cancel", post(processes::cancel_process))
}
