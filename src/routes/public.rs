use crate::{AppState, handlers};
use axum::{Router, routing::get};

/// Public Router Module
///
/// Unauthenticated endpoints. Nothing here reads a token.
pub fn public_routes() -> Router<AppState> {
    Router::new()
        // GET /readiness
        // 200 once verification keys are loaded, 503 otherwise.
        .route("/readiness", get(handlers::readiness))
        // GET /liveness
        .route("/liveness", get(handlers::liveness))
        // GET /test
        .route("/test", get(handlers::test))
}
