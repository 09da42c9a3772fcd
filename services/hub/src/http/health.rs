//! Health check endpoints.
//!
//! Mounted at the top level of every HTTP router, including the redirect
//! server and underneath a root path.

use axum::{response::IntoResponse, routing::get, Router};

/// Create health check routes.
pub fn routes() -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/readyz", get(healthz))
}

/// The process is up and its listeners are being served.
async fn healthz() -> impl IntoResponse {
    "OK\n"
}
