use std::sync::Arc;

use axum::{Router, extract::FromRef, http::HeaderName};
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

use tower::ServiceBuilder;
use tower_http::{
    cors::{Any, CorsLayer},
    request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer},
    trace::{DefaultOnResponse, TraceLayer},
};
use tracing::{Level, Span};

// --- Module Structure ---

// Trust layer: keys, minting, verification, rules.
pub mod keystore;
pub mod policy;
pub mod token;
pub mod verify;

// HTTP plumbing: errors, auth chain, handlers.
pub mod config;
pub mod error;
pub mod handlers;
pub mod middleware;

pub mod routes;
use routes::{admin, authenticated, public};

// --- Public Re-exports ---

pub use config::AppConfig;
pub use error::{AppError, ShutdownHandle};
pub use keystore::KeyStore;
pub use policy::{PolicyEvaluator, Rule};
pub use token::{Claims, TokenIssuer};
pub use verify::{RejectionReason, TokenVerifier, VerifiedIdentity};

/// ApiDoc
///
/// OpenAPI description of every routed handler, served at
/// `/api-docs/openapi.json`.
#[derive(OpenApi)]
#[openapi(
    paths(
        handlers::readiness, handlers::liveness, handlers::test,
        handlers::test_auth, handlers::query_user
    ),
    components(
        schemas(
            handlers::Status, handlers::Liveness, handlers::UserView,
            verify::VerifiedIdentity, error::ErrorResponse,
        )
    ),
    tags(
        (name = "sales-api", description = "Token-protected sales service API")
    )
)]
struct ApiDoc;

/// AppState
///
/// Everything a request may need, shared across requests. The verifier and
/// policy are immutable after startup; key rotation goes through the
/// verifier's `KeyStore`, which swaps its key set atomically.
#[derive(Clone)]
pub struct AppState {
    pub verifier: Arc<TokenVerifier>,
    pub policy: Arc<PolicyEvaluator>,
    pub config: AppConfig,
    /// Signalled by the `errors` layer when a handler asks for shutdown.
    pub shutdown: ShutdownHandle,
    /// Build tag reported by `/liveness`.
    pub build: String,
}

impl AppState {
    /// State with local-default configuration, a fresh shutdown handle and
    /// the crate version as build tag.
    pub fn new(verifier: Arc<TokenVerifier>, policy: Arc<PolicyEvaluator>) -> Self {
        Self {
            verifier,
            policy,
            config: AppConfig::default(),
            shutdown: ShutdownHandle::new(),
            build: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

// --- Axum FromRef Extractor Implementations ---

impl FromRef<AppState> for AppConfig {
    fn from_ref(app_state: &AppState) -> AppConfig {
        app_state.config.clone()
    }
}

impl FromRef<AppState> for ShutdownHandle {
    fn from_ref(app_state: &AppState) -> ShutdownHandle {
        app_state.shutdown.clone()
    }
}

impl FromRef<AppState> for Arc<TokenVerifier> {
    fn from_ref(app_state: &AppState) -> Arc<TokenVerifier> {
        app_state.verifier.clone()
    }
}

/// create_router
///
/// Assembles the route groups and wraps them, innermost first, in:
///
/// 1. per-route auth guards (inside each group)
/// 2. the `errors` layer, which turns every `AppError` into its single
///    client-visible response
/// 3. request id, tracing and CORS
pub fn create_router(state: AppState) -> Router {
    let app = Router::new()
        .merge(public::public_routes())
        .merge(admin::admin_routes(&state))
        .merge(authenticated::authenticated_routes(&state));

    with_layers(app, state)
}

/// with_layers
///
/// Applies state, the error classification layer and the observability
/// stack to `routes`. Exposed so extra route groups (tests, tools) get the
/// same treatment as the service's own.
pub fn with_layers(routes: Router<AppState>, state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_methods(Any)
        .allow_origin(Any)
        .allow_headers(Any);

    let x_request_id = HeaderName::from_static("x-request-id");
    let shutdown = state.shutdown.clone();

    routes
        .with_state(state)
        .layer(axum::middleware::from_fn_with_state(shutdown, error::errors))
        .merge(SwaggerUi::new("/swagger-ui").url("/api-docs/openapi.json", ApiDoc::openapi()))
        .layer(
            ServiceBuilder::new()
                .layer(SetRequestIdLayer::new(x_request_id.clone(), MakeRequestUuid))
                .layer(
                    TraceLayer::new_for_http()
                        .make_span_with(trace_span_logger)
                        .on_response(
                            DefaultOnResponse::new()
                                .level(Level::INFO)
                                .latency_unit(tower_http::LatencyUnit::Millis),
                        ),
                )
                .layer(PropagateRequestIdLayer::new(x_request_id)),
        )
        .layer(cors)
}

/// trace_span_logger
///
/// Span for one request, tagged with the `x-request-id` set above so every
/// log line of the request (including auth refusals) can be correlated.
fn trace_span_logger(request: &axum::http::Request<axum::body::Body>) -> Span {
    let request_id = request
        .headers()
        .get("x-request-id")
        .and_then(|value| value.to_str().ok())
        .unwrap_or("unknown");

    tracing::info_span!(
        "http_request",
        method = ?request.method(),
        uri = ?request.uri(),
        req_id = %request_id,
    )
}
