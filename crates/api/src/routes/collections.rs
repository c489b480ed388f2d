//! Route definitions for the `/collections` resource.

use axum::routing::{get, post};
use axum::Router;

use crate::handlers::collections;
use crate::state::AppState;

/// Routes mounted at `/collections`.
///
/// ```text
/// POST   /           -> create_collection
/// GET    /{name}     -> get_collection
/// DELETE /{name}     -> delete_collection
/// ```
pub fn router() -> Router<AppState> {
    Router::new()
        .route("/", post(collections::create_collection))
        .route(
            "/{name}",
            get(collections::get_collection).delete(collections::delete_collection),
        )
}
