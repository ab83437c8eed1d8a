//! Route definitions for the relay's HTTP boundary.

use axum::{
    extract::DefaultBodyLimit,
    routing::{get, post},
    Router,
};
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};

use super::api::{self, SharedRelay};

/// Largest accepted request body. Oversized bodies surface as a JSON
/// rejection, so callers still get an acknowledgment.
pub const MAX_BODY_BYTES: usize = 1024 * 1024;

/// Create the relay router.
///
/// `:who` is any external name the routing table knows.
pub fn create_app_router(relay: SharedRelay) -> Router {
    Router::new()
        .route("/", get(api::health))
        .route("/diag", get(api::diag))
        .route("/enqueue", post(api::enqueue))
        .route("/mailbox/:who", get(api::dequeue).post(api::send_from))
        .route("/mailbox/:who/all", get(api::dequeue_all))
        .with_state(relay)
        .layer(DefaultBodyLimit::max(MAX_BODY_BYTES))
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .layer(TraceLayer::new_for_http())
}
