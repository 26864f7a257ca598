use axum::{
    Json,
    extract::{Path, State},
    http::StatusCode,
};
use serde::Serialize;

use crate::{AppState, error::AppError, verify::VerifiedIdentity};

/// Status
///
/// Minimal body returned by the probe and test endpoints.
#[derive(Debug, Serialize, utoipa::ToSchema)]
pub struct Status {
    pub status: String,
}

impl Status {
    fn new(status: &str) -> Self {
        Self {
            status: status.to_string(),
        }
    }
}

/// Liveness
#[derive(Debug, Serialize, utoipa::ToSchema)]
pub struct Liveness {
    pub status: String,
    pub build: String,
    pub host: String,
}

/// UserView
///
/// What `GET /users/{user_id}` returns: the id asked for and who asked.
#[derive(Debug, Serialize, utoipa::ToSchema)]
pub struct UserView {
    pub user_id: String,
    pub viewer: VerifiedIdentity,
}

/// readiness
///
/// [Public Route] Ready once at least one verification key is loaded. A
/// service with an empty key store would reject every protected request.
#[utoipa::path(
    get,
    path = "/readiness",
    responses(
        (status = 200, description = "Ready", body = Status),
        (status = 503, description = "No verification keys loaded", body = crate::error::ErrorResponse)
    )
)]
pub async fn readiness(State(state): State<AppState>) -> Result<Json<Status>, AppError> {
    if state.verifier.keys().is_empty() {
        return Err(AppError::trusted(
            StatusCode::SERVICE_UNAVAILABLE,
            "no verification keys loaded",
        ));
    }
    Ok(Json(Status::new("ok")))
}

/// liveness
///
/// [Public Route] Always 200 while the process is serving.
#[utoipa::path(
    get,
    path = "/liveness",
    responses((status = 200, description = "Alive", body = Liveness))
)]
pub async fn liveness(State(state): State<AppState>) -> Json<Liveness> {
    let host = std::env::var("HOSTNAME").unwrap_or_else(|_| "unavailable".to_string());
    Json(Liveness {
        status: "up".to_string(),
        build: state.build.clone(),
        host,
    })
}

/// test
///
/// [Public Route] Smoke-test endpoint.
#[utoipa::path(
    get,
    path = "/test",
    responses((status = 200, description = "OK", body = Status))
)]
pub async fn test() -> Json<Status> {
    Json(Status::new("OK"))
}

/// test_auth
///
/// [Admin Route] Same body as `/test`, behind `AdminOnly`.
#[utoipa::path(
    get,
    path = "/auth",
    responses(
        (status = 200, description = "OK", body = Status),
        (status = 401, description = "Unauthorized", body = crate::error::ErrorResponse),
        (status = 403, description = "Forbidden", body = crate::error::ErrorResponse)
    )
)]
pub async fn test_auth(identity: VerifiedIdentity) -> Json<Status> {
    tracing::debug!(sub = %identity.subject, "admin test endpoint");
    Json(Status::new("OK"))
}

/// query_user
///
/// [Authenticated Route] Guarded by `AdminOrSubject` on the `user_id` path
/// parameter: admins may look at anyone, users only at themselves.
#[utoipa::path(
    get,
    path = "/users/{user_id}",
    params(("user_id" = String, Path, description = "Subject id")),
    responses(
        (status = 200, description = "Found", body = UserView),
        (status = 401, description = "Unauthorized", body = crate::error::ErrorResponse),
        (status = 403, description = "Forbidden", body = crate::error::ErrorResponse)
    )
)]
pub async fn query_user(viewer: VerifiedIdentity, Path(user_id): Path<String>) -> Json<UserView> {
    Json(UserView { user_id, viewer })
}
