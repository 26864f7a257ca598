use crate::{
    AppState, handlers,
    middleware::{Guard, SubjectSource, guard},
    policy::Rule,
};
use axum::{Router, middleware, routing::get};

/// Path parameter naming the subject a `/users` route is about.
pub const USER_ID_PARAM: &str = "user_id";

/// Authenticated Router Module
///
/// Routes about a specific user. Guarded by `AdminOrSubject`, comparing the
/// verified subject with the `{user_id}` path segment.
pub fn authenticated_routes(state: &AppState) -> Router<AppState> {
    let admin_or_subject = Guard::rule(
        state,
        Rule::AdminOrSubject,
        SubjectSource::PathParam(USER_ID_PARAM),
    );

    Router::new()
        // GET /users/{user_id}
        .route("/users/{user_id}", get(handlers::query_user))
        .route_layer(middleware::from_fn_with_state(admin_or_subject, guard))
}
