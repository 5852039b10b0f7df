//! Default authentication backend mounting point.
//!
//! The gateway fronts a third-party authentication backend; deployments
//! replace this router with the real one when wiring [`crate::gardisto::router`].
//! Until then the entry points answer 501 so misconfigured environments are
//! obvious.

use axum::{http::StatusCode, response::IntoResponse, routing::post, Json, Router};
use serde_json::json;
use tracing::warn;

#[must_use]
pub fn router() -> Router {
    Router::new()
        .route("/sign-up/email", post(backend_not_mounted))
        .route("/sign-in/email", post(backend_not_mounted))
}

async fn backend_not_mounted() -> impl IntoResponse {
    warn!("authentication backend not mounted");
    (
        StatusCode::NOT_IMPLEMENTED,
        Json(json!({
            "error": "Not Implemented",
            "message": "authentication backend not mounted",
        })),
    )
}
