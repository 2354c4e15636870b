//! HTTP routing.

pub mod error;
mod serve;

use axum::{routing::get, Router};
use tower_http::{compression::CompressionLayer, trace::TraceLayer};

use crate::state::AppState;

pub use serve::PROCESSING;

/// Create the router. Every GET goes to the site handler.
pub fn create_router(state: AppState, gzip: bool) -> Router {
    let router = Router::new()
        .route("/", get(serve::serve))
        .route("/{*path}", get(serve::serve));

    let router = if gzip {
        router.layer(CompressionLayer::new())
    } else {
        router
    };

    router.layer(TraceLayer::new_for_http()).with_state(state)
}
