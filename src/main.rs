use std::sync::Arc;

use anyhow::Context;
use sales_api::{
    AppState, KeyStore, PolicyEvaluator, ShutdownHandle, TokenVerifier,
    config::{AppConfig, Env},
    create_router,
};
use tokio::net::TcpListener;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// main
///
/// Loads configuration, initializes logging, loads the verification keys and
/// serves HTTP until Ctrl-C or until a handler requests shutdown.
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // 1. Configuration
    dotenv::dotenv().ok();
    let config = AppConfig::load().context("loading configuration")?;

    // 2. Logging: pretty locally, JSON in production.
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "sales_api=debug,tower_http=info".into());

    match config.env {
        Env::Local => {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(tracing_subscriber::fmt::layer().pretty())
                .init();
        }
        Env::Production => {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(tracing_subscriber::fmt::layer().json())
                .init();
        }
    }

    tracing::info!("Application starting in {:?} mode", config.env);

    // 3. Keys
    let keys = KeyStore::load_dir(&config.auth.keys_folder).with_context(|| {
        format!("loading keys from {}", config.auth.keys_folder.display())
    })?;
    if keys.resolve(&config.auth.active_kid).is_err() {
        tracing::warn!(kid = %config.auth.active_kid, "active key id is not in the key store");
    }

    let verifier = TokenVerifier::new(
        Arc::new(keys),
        config.auth.issuer.clone(),
        config.auth.algorithms.clone(),
    )
    .with_leeway(config.auth.leeway_secs);

    // 4. State
    let shutdown = ShutdownHandle::new();
    let bind_addr = config.bind_addr.clone();
    let app_state = AppState {
        verifier: Arc::new(verifier),
        policy: Arc::new(PolicyEvaluator::new()),
        config,
        shutdown: shutdown.clone(),
        build: std::env::var("BUILD_REF").unwrap_or_else(|_| env!("CARGO_PKG_VERSION").to_string()),
    };

    // 5. Serve
    let app = create_router(app_state);
    let listener = TcpListener::bind(&bind_addr)
        .await
        .with_context(|| format!("binding {bind_addr}"))?;

    tracing::info!("Listening on {bind_addr}");
    tracing::info!("API Documentation (Swagger UI) available at: http://{bind_addr}/swagger-ui");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(shutdown.clone()))
        .await
        .context("serving HTTP")?;

    if let Some(reason) = shutdown.reason() {
        anyhow::bail!("shut down on request: {reason}");
    }
    tracing::info!("shutdown complete");
    Ok(())
}

/// Resolves on Ctrl-C or when a handler requests shutdown.
async fn shutdown_signal(shutdown: ShutdownHandle) {
    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            if let Err(err) = result {
                tracing::error!(error = %err, "failed to listen for Ctrl-C");
            }
            tracing::info!("Ctrl-C received, shutting down");
        }
        reason = shutdown.wait() => {
            tracing::error!(%reason, "shutting down on request");
        }
    }
}
