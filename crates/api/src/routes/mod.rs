pub mod algorithms;
pub mod collections;
pub mod health;
pub mod processes;
pub mod workflows;

use axum::Router;

use crate::state::AppState;

/// Build the service route tree.
///
/// Route hierarchy:
///
/// ```text
/// /workflows                         list, register
/// /workflows/{name}/{version}        execute (POST), delete
///
/// /algorithms                        list, register
/// /algorithms/{name}/{version}       execute (POST)
///
/// /processes/{id}                    poll a process or workflow run
/// /processes/{id}/result             published result
/// /processes/{id}/cancel             cancel (POST)
///
/// /collections                       start a download (POST)
/// /collections/{name}                get, delete
/// ```
pub fn api_routes() -> Router<AppState> {
    Router::new()
        .nest("/workflows", workflows::router())
        .nest("/algorithms", algorithms::router())
        .nest("/processes", processes::router())
        .nest("/collections", collections::router())
}
