//! Request routing for the context API.

use axum::routing::get;
use axum::Router;
use tower::ServiceBuilder;
use tower_http::trace::TraceLayer;

use crate::state::AppState;

pub mod admin;
pub mod contexts;
pub mod stream;

/// Assemble the full HTTP surface, identical on every node role.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/contexts", get(contexts::list_contexts))
        .route("/contexts/stream", get(stream::all_contexts_stream))
        .route(
            "/contexts/:id",
            get(contexts::get_context)
                .put(contexts::put_context)
                .delete(contexts::delete_context),
        )
        .route("/contexts/:id/metadata", get(contexts::get_metadata))
        .route("/contexts/:id/stream", get(stream::per_context_stream))
        .route("/health", get(admin::health))
        .route("/status", get(admin::status))
        .route("/metrics", get(admin::metrics))
        .with_state(state)
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .into_inner(),
        )
}
