mod common;

use std::sync::Arc;

use axum::{
    Router,
    body::{Body, to_bytes},
    http::{Request, StatusCode, header},
    response::Response,
    routing::get,
};
use chrono::{Duration, Utc};
use common::{ISSUER, TestKeys};
use jsonwebtoken::Algorithm;
use sales_api::{
    AppError, AppState, PolicyEvaluator, TokenVerifier, create_router,
    keystore::{KeySet, KeyStore},
    with_layers,
};
use serde_json::{Value, json};
use tower::ServiceExt;

async fn get_with(router: Router, uri: &str, token: Option<&str>) -> Response {
    let mut request = Request::builder().uri(uri);
    if let Some(token) = token {
        request = request.header(header::AUTHORIZATION, format!("Bearer {token}"));
    }
    router
        .oneshot(request.body(Body::empty()).unwrap())
        .await
        .unwrap()
}

async fn body_json(response: Response) -> Value {
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

#[tokio::test]
async fn public_test_route_needs_no_token() {
    let keys = TestKeys::load();
    let response = get_with(create_router(keys.state()), "/test", None).await;

    assert_eq!(response.status(), StatusCode::OK);
    assert!(response.headers().contains_key("x-request-id"));
    assert_eq!(body_json(response).await, json!({ "status": "OK" }));
}

#[tokio::test]
async fn every_401_looks_the_same() {
    let keys = TestKeys::load();
    let expired = keys.token_at(
        "u1",
        &["ADMIN"],
        Utc::now() - Duration::hours(2),
        Duration::hours(1),
    );

    let mut bodies = Vec::new();
    for token in [None, Some(expired.as_str()), Some("not-a-token"), Some("a.b.c")] {
        let response = get_with(create_router(keys.state()), "/auth", token).await;
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED, "{token:?}");
        bodies.push(body_json(response).await);
    }

    for body in &bodies {
        assert_eq!(body, &json!({ "error": "Unauthorized" }));
    }
}

#[tokio::test]
async fn wrong_scheme_is_unauthorized() {
    let keys = TestKeys::load();
    let token = keys.token("root", &["ADMIN"]);
    let request = Request::builder()
        .uri("/auth")
        .header(header::AUTHORIZATION, format!("Basic {token}"))
        .body(Body::empty())
        .unwrap();

    let response = create_router(keys.state()).oneshot(request).await.unwrap();

    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn user_token_on_admin_route_is_forbidden() {
    let keys = TestKeys::load();
    let token = keys.token("u1", &["USER"]);

    let response = get_with(create_router(keys.state()), "/auth", Some(&token)).await;

    assert_eq!(response.status(), StatusCode::FORBIDDEN);
    assert_eq!(body_json(response).await, json!({ "error": "Forbidden" }));
}

#[tokio::test]
async fn admin_token_on_admin_route_is_allowed() {
    let keys = TestKeys::load();
    let token = keys.token("root", &["USER", "ADMIN"]);

    let response = get_with(create_router(keys.state()), "/auth", Some(&token)).await;

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_json(response).await, json!({ "status": "OK" }));
}

#[tokio::test]
async fn users_route_allows_self_and_admin_only() {
    let keys = TestKeys::load();
    let user = keys.token("u1", &["USER"]);
    let admin = keys.token("root", &["ADMIN"]);

    let response = get_with(create_router(keys.state()), "/users/u1", Some(&user)).await;
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["user_id"], "u1");
    assert_eq!(body["viewer"]["subject"], "u1");
    assert_eq!(body["viewer"]["roles"], json!(["USER"]));

    let response = get_with(create_router(keys.state()), "/users/u2", Some(&user)).await;
    assert_eq!(response.status(), StatusCode::FORBIDDEN);

    let response = get_with(create_router(keys.state()), "/users/u2", Some(&admin)).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_json(response).await["viewer"]["subject"], "root");
}

#[tokio::test]
async fn unknown_path_is_not_found_without_auth() {
    let keys = TestKeys::load();

    let response = get_with(create_router(keys.state()), "/nope", None).await;

    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn readiness_tracks_key_availability() {
    let keys = TestKeys::load();
    let response = get_with(create_router(keys.state()), "/readiness", None).await;
    assert_eq!(response.status(), StatusCode::OK);

    let empty = Arc::new(KeyStore::new(KeySet::new()));
    let verifier = TokenVerifier::new(empty, ISSUER, vec![Algorithm::RS256]);
    let state = AppState::new(Arc::new(verifier), Arc::new(PolicyEvaluator::new()));

    let response = get_with(create_router(state), "/readiness", None).await;

    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(
        body_json(response).await,
        json!({ "error": "no verification keys loaded" })
    );
}

#[tokio::test]
async fn liveness_reports_build() {
    let keys = TestKeys::load();
    let mut state = keys.state();
    state.build = "abc123".to_string();

    let response = get_with(create_router(state), "/liveness", None).await;

    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["status"], "up");
    assert_eq!(body["build"], "abc123");
}

#[tokio::test]
async fn internal_errors_hide_detail() {
    let keys = TestKeys::load();
    let routes = Router::new().route(
        "/boom",
        get(|| async {
            Err::<&'static str, AppError>(anyhow::anyhow!("db password is hunter2").into())
        }),
    );

    let response = get_with(with_layers(routes, keys.state()), "/boom", None).await;

    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(
        body_json(response).await,
        json!({ "error": "Internal Server Error" })
    );
}

#[tokio::test]
async fn shutdown_request_reaches_the_handle() {
    let keys = TestKeys::load();
    let state = keys.state();
    let shutdown = state.shutdown.clone();
    let routes = Router::new().route(
        "/halt",
        get(|| async { Err::<&'static str, AppError>(AppError::shutdown("key integrity lost")) }),
    );

    let response = get_with(with_layers(routes, state), "/halt", None).await;

    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    assert!(bytes.is_empty());
    assert_eq!(shutdown.reason().as_deref(), Some("key integrity lost"));
}

#[tokio::test]
async fn openapi_document_lists_routes() {
    let keys = TestKeys::load();

    let response = get_with(create_router(keys.state()), "/api-docs/openapi.json", None).await;

    assert_eq!(response.status(), StatusCode::OK);
    let doc = body_json(response).await;
    for path in ["/readiness", "/liveness", "/test", "/auth", "/users/{user_id}"] {
        assert!(doc["paths"].get(path).is_some(), "{path} missing");
    }
}
