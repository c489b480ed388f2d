//! Route definitions for the `/algorithms` resource.

use axum::routing::{get, post};
use axum::Router;

use crate::handlers::algorithms;
use crate::state::AppState;

/// Routes mounted at `/algorithms`.
///
/// ```text
/// GET    /                    -> list_algorithms
/// POST   /                    -> register_algorithm
/// POST   /{name}/{version}    -> execute_algorithm
/// ```
pub fn router() -> Router<AppState> {
    Router::new()
        .route(
            "/",
            get(algorithms::list_algorithms).post(algorithms::register_algorithm),
        )
        .route("/{name}/{version}", post(algorithms::execute_algorithm))
}
