use crate::{
    AppState, handlers,
    middleware::{Guard, SubjectSource, guard},
    policy::Rule,
};
use axum::{Router, middleware, routing::get};

/// Admin Router Module
///
/// Every route here is wrapped in Authenticate + `AdminOnly`. The guard runs
/// as a route layer, so an unmatched path is still a plain 404 rather than a
/// 401.
pub fn admin_routes(state: &AppState) -> Router<AppState> {
    let admin_only = Guard::rule(state, Rule::AdminOnly, SubjectSource::None);

    Router::new()
        // GET /auth
        // Smoke test for the admin chain.
        .route("/auth", get(handlers::test_auth))
        .route_layer(middleware::from_fn_with_state(admin_only, guard))
}
