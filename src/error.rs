//! Error taxonomy and the error-classification stage.
//!
//! Handlers and middleware stages return `AppError`. Converting it into a
//! response does not render anything yet: the error is parked in the response
//! extensions and the outermost `errors` middleware decides what the client
//! sees. That keeps the trust-boundary policy (what may be exposed, what is
//! only logged) in one place.

use std::sync::Arc;

use axum::{
    Json,
    extract::{Request, State},
    http::StatusCode,
    middleware::Next,
    response::{IntoResponse, Response},
};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::watch;

use crate::{policy::PolicyError, policy::Rule, verify::RejectionReason};

/// ErrorResponse
///
/// The only error body the service ever emits.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, utoipa::ToSchema)]
pub struct ErrorResponse {
    pub error: String,
}

impl ErrorResponse {
    fn status_text(status: StatusCode) -> Self {
        Self {
            error: status.canonical_reason().unwrap_or("Error").to_string(),
        }
    }
}

/// AuthFailure
///
/// Every way the authenticate/authorize stages can refuse a request. The
/// variant is for logs; the client gets the bare status text.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AuthFailure {
    #[error("no bearer token in request")]
    MissingToken,

    #[error("token rejected: {0}")]
    Rejected(RejectionReason),

    #[error("denied by rule {rule}")]
    Denied { rule: Rule },

    #[error("authorization misconfigured: {0}")]
    Misconfigured(PolicyError),

    #[error("authorization ran without an authenticated identity")]
    MissingIdentity,
}

impl AuthFailure {
    pub fn status(&self) -> StatusCode {
        match self {
            AuthFailure::MissingToken | AuthFailure::Rejected(_) => StatusCode::UNAUTHORIZED,
            AuthFailure::Denied { .. }
            | AuthFailure::Misconfigured(_)
            | AuthFailure::MissingIdentity => StatusCode::FORBIDDEN,
        }
    }
}

/// AppError
///
/// The error type shared by handlers and middleware stages.
#[derive(Debug, Error)]
pub enum AppError {
    /// An expected failure whose message is safe to show the caller.
    #[error("{message}")]
    Trusted { status: StatusCode, message: String },

    #[error(transparent)]
    Auth(#[from] AuthFailure),

    /// Anything else. Logged in full, reported as a bare 500.
    #[error(transparent)]
    Internal(#[from] anyhow::Error),

    /// Not a failure: asks the serving loop to stop.
    #[error("shutdown requested: {0}")]
    Shutdown(String),
}

impl AppError {
    pub fn trusted(status: StatusCode, message: impl Into<String>) -> Self {
        AppError::Trusted {
            status,
            message: message.into(),
        }
    }

    pub fn shutdown(reason: impl Into<String>) -> Self {
        AppError::Shutdown(reason.into())
    }

    pub fn is_trusted(&self) -> bool {
        matches!(self, AppError::Trusted { .. })
    }
}

impl From<RejectionReason> for AppError {
    fn from(reason: RejectionReason) -> Self {
        AppError::Auth(AuthFailure::Rejected(reason))
    }
}

/// Shutdown
///
/// The reason carried by `AppError::Shutdown`, handed back by `classify`
/// untouched so it can reach the serving loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Shutdown(pub String);

/// classify
///
/// Maps an error onto exactly one client-visible outcome:
///
/// - trusted: its own status and message
/// - auth: 401 or 403 with the canonical status text, never the reason
/// - anything else: 500 with the canonical status text
///
/// A shutdown request is not a response at all and comes back as `Err`.
pub fn classify(err: &AppError) -> Result<(StatusCode, ErrorResponse), Shutdown> {
    match err {
        AppError::Trusted { status, message } => Ok((
            *status,
            ErrorResponse {
                error: message.clone(),
            },
        )),
        AppError::Auth(failure) => {
            let status = failure.status();
            Ok((status, ErrorResponse::status_text(status)))
        }
        AppError::Internal(_) => Ok((
            StatusCode::INTERNAL_SERVER_ERROR,
            ErrorResponse::status_text(StatusCode::INTERNAL_SERVER_ERROR),
        )),
        AppError::Shutdown(reason) => Err(Shutdown(reason.clone())),
    }
}

/// Response extension carrying an unclassified error to the `errors` layer.
#[derive(Clone)]
struct PendingError(Arc<AppError>);

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let mut response = StatusCode::INTERNAL_SERVER_ERROR.into_response();
        response.extensions_mut().insert(PendingError(Arc::new(self)));
        response
    }
}

/// ShutdownHandle
///
/// Shared by the `errors` layer (which triggers it) and the serving loop
/// (which waits on it).
#[derive(Clone, Debug)]
pub struct ShutdownHandle {
    tx: Arc<watch::Sender<Option<String>>>,
}

impl Default for ShutdownHandle {
    fn default() -> Self {
        Self::new()
    }
}

impl ShutdownHandle {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(None);
        Self { tx: Arc::new(tx) }
    }

    pub fn trigger(&self, reason: impl Into<String>) {
        let reason = reason.into();
        self.tx.send_if_modified(|current| {
            if current.is_some() {
                return false;
            }
            *current = Some(reason);
            true
        });
    }

    /// The first reason passed to `trigger`, if any.
    pub fn reason(&self) -> Option<String> {
        self.tx.borrow().clone()
    }

    /// Resolves once `trigger` has been called.
    pub async fn wait(&self) -> String {
        let mut rx = self.tx.subscribe();
        match rx.wait_for(Option::is_some).await {
            Ok(reason) => reason.clone().unwrap_or_default(),
            // The sender lives in `self`, so the channel cannot close here.
            Err(_) => String::new(),
        }
    }
}

/// errors
///
/// Outermost middleware. Finds an `AppError` parked by `into_response`,
/// logs it with full detail, and replaces the response with the classified
/// one. A shutdown request is forwarded to the `ShutdownHandle` and the
/// client gets a bare 503.
pub async fn errors(State(shutdown): State<ShutdownHandle>, request: Request, next: Next) -> Response {
    let response = next.run(request).await;
    let Some(PendingError(err)) = response.extensions().get::<PendingError>().cloned() else {
        return response;
    };

    match classify(&err) {
        Ok((status, body)) => {
            match err.as_ref() {
                AppError::Trusted { .. } => {
                    tracing::info!(status = status.as_u16(), error = %err, "request failed")
                }
                AppError::Auth(failure) => {
                    tracing::warn!(status = status.as_u16(), error = %failure, "request refused")
                }
                _ => tracing::error!(status = status.as_u16(), error = ?err, "request failed"),
            }
            (status, Json(body)).into_response()
        }
        Err(Shutdown(reason)) => {
            tracing::error!(%reason, "shutdown requested by handler");
            shutdown.trigger(reason);
            StatusCode::SERVICE_UNAVAILABLE.into_response()
        }
    }
}
