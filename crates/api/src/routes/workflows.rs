//! Route definitions for the `/workflows` resource.

use axum::routing::{get, post};
use axum::Router;

use crate::handlers::workflows;
use crate::state::AppState;

/// Routes mounted at `/workflows`.
///
/// ```text
/// GET    /                    -> list_workflows
/// POST   /                    -> register_workflow
/// POST   /{name}/{version}    -> execute_workflow
/// DELETE /{name}/{version}    -> delete_workflow
/// ```
pub fn router() -> Router<AppState> {
    Router::new()
        .route(
            "/",
            get(workflows::list_workflows).post(workflows::register_workflow),
        )
        .route(
            "/{name}/{version}",
            post(workflows::execute_workflow).delete(workflows::delete_workflow),
        )
}
