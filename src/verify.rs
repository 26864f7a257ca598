//! Token verification.
//!
//! A token is checked in a fixed order and the first failing check decides
//! the rejection:
//!
//! ```text
//! split + base64 + JSON      -> Malformed
//! header alg in allow-list   -> AlgorithmNotAllowed
//! header kid in key store    -> UnknownKey
//! signature over raw bytes   -> BadSignature
//! iss == expected issuer     -> IssuerMismatch
//! now < exp                  -> Expired
//! now + leeway >= iat        -> NotYetValid
//! ```
//!
//! The rejection kinds exist for operator logs. Clients only ever see a
//! generic 401 (see `error::AuthFailure`).

use std::{collections::HashSet, sync::Arc};

use base64::{Engine, engine::general_purpose::URL_SAFE_NO_PAD};
use chrono::{DateTime, Utc};
use jsonwebtoken::{Algorithm, Validation, decode, errors::ErrorKind};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{keystore::KeyStore, token::Claims};

/// RejectionReason
///
/// The precise reason a token was refused.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RejectionReason {
    #[error("malformed token: {0}")]
    Malformed(String),

    #[error("algorithm not allowed: {0}")]
    AlgorithmNotAllowed(String),

    #[error("unknown signing key: {0:?}")]
    UnknownKey(Option<String>),

    #[error("signature does not verify")]
    BadSignature,

    #[error("issuer mismatch: expected {expected:?}, got {actual:?}")]
    IssuerMismatch { expected: String, actual: String },

    #[error("token expired")]
    Expired,

    #[error("token not yet valid")]
    NotYetValid,
}

impl RejectionReason {
    /// A stable, low-cardinality label for logs and metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Malformed(_) => "malformed",
            Self::AlgorithmNotAllowed(_) => "algorithm_not_allowed",
            Self::UnknownKey(_) => "unknown_key",
            Self::BadSignature => "bad_signature",
            Self::IssuerMismatch { .. } => "issuer_mismatch",
            Self::Expired => "expired",
            Self::NotYetValid => "not_yet_valid",
        }
    }
}

/// VerifiedIdentity
///
/// The trusted projection of a token that passed every check. Lives for one
/// request in the request extensions; never persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, utoipa::ToSchema)]
pub struct VerifiedIdentity {
    pub subject: String,
    pub roles: Vec<String>,
    pub issuer: String,
}

impl VerifiedIdentity {
    /// Exact, case-sensitive role membership.
    pub fn has_role(&self, role: &str) -> bool {
        self.roles.iter().any(|r| r == role)
    }
}

impl From<Claims> for VerifiedIdentity {
    fn from(claims: Claims) -> Self {
        Self {
            subject: claims.sub,
            roles: claims.roles,
            issuer: claims.iss,
        }
    }
}

#[derive(Deserialize)]
struct RawHeader {
    alg: String,
    #[serde(default)]
    kid: Option<String>,
}

/// TokenVerifier
///
/// Checks tokens against a pinned issuer and algorithm allow-list using the
/// public keys in a shared `KeyStore`. Holds no mutable state, so a single
/// instance serves all requests concurrently.
#[derive(Debug, Clone)]
pub struct TokenVerifier {
    keys: Arc<KeyStore>,
    issuer: String,
    algorithms: Vec<Algorithm>,
    leeway_secs: i64,
}

impl TokenVerifier {
    pub fn new(keys: Arc<KeyStore>, issuer: impl Into<String>, algorithms: Vec<Algorithm>) -> Self {
        Self {
            keys,
            issuer: issuer.into(),
            algorithms,
            leeway_secs: 0,
        }
    }

    /// Tolerance for issuers whose clock runs ahead of ours. Only applied to
    /// the issued-at check; expiry is exact.
    pub fn with_leeway(mut self, leeway_secs: u64) -> Self {
        self.leeway_secs = i64::try_from(leeway_secs).unwrap_or(i64::MAX);
        self
    }

    pub fn keys(&self) -> &Arc<KeyStore> {
        &self.keys
    }

    pub fn issuer(&self) -> &str {
        &self.issuer
    }

    pub fn verify(&self, token: &str) -> Result<VerifiedIdentity, RejectionReason> {
        self.verify_at(token, Utc::now())
    }

    /// verify_at
    ///
    /// Runs every check against the supplied instant.
    pub fn verify_at(
        &self,
        token: &str,
        now: DateTime<Utc>,
    ) -> Result<VerifiedIdentity, RejectionReason> {
        let (header, claims) = parse(token)?;

        let algorithm: Algorithm = header
            .alg
            .parse()
            .map_err(|_| RejectionReason::AlgorithmNotAllowed(header.alg.clone()))?;
        if !self.algorithms.contains(&algorithm) {
            return Err(RejectionReason::AlgorithmNotAllowed(header.alg));
        }

        let kid = header.kid.ok_or(RejectionReason::UnknownKey(None))?;
        let pair = self
            .keys
            .resolve(&kid)
            .map_err(|_| RejectionReason::UnknownKey(Some(kid.clone())))?;

        // Claims were already parsed above; this pass only checks the
        // signature over the received segments, so every time-based and
        // issuer check is switched off here and done below.
        let mut validation = Validation::new(algorithm);
        validation.validate_exp = false;
        validation.validate_nbf = false;
        validation.validate_aud = false;
        validation.required_spec_claims = HashSet::new();
        validation.leeway = 0;

        if let Err(err) = decode::<serde_json::Value>(token, pair.decoding_key(), &validation) {
            return Err(match err.kind() {
                ErrorKind::InvalidAlgorithm | ErrorKind::MissingAlgorithm => {
                    RejectionReason::AlgorithmNotAllowed(header.alg)
                }
                ErrorKind::InvalidToken | ErrorKind::Base64(_) | ErrorKind::Json(_) | ErrorKind::Utf8(_) => {
                    RejectionReason::Malformed(err.to_string())
                }
                _ => RejectionReason::BadSignature,
            });
        }

        if claims.iss != self.issuer {
            return Err(RejectionReason::IssuerMismatch {
                expected: self.issuer.clone(),
                actual: claims.iss,
            });
        }

        let now = now.timestamp();
        if now >= claims.exp {
            return Err(RejectionReason::Expired);
        }
        if now.saturating_add(self.leeway_secs) < claims.iat {
            return Err(RejectionReason::NotYetValid);
        }

        Ok(claims.into())
    }
}

/// Splits the token and decodes header and claims without trusting either.
fn parse(token: &str) -> Result<(RawHeader, Claims), RejectionReason> {
    let malformed = |what: &str| RejectionReason::Malformed(what.to_string());

    let mut segments = token.split('.');
    let (Some(header), Some(claims), Some(signature), None) = (
        segments.next(),
        segments.next(),
        segments.next(),
        segments.next(),
    ) else {
        return Err(malformed("expected three dot-separated segments"));
    };
    if header.is_empty() || claims.is_empty() || signature.is_empty() {
        return Err(malformed("empty segment"));
    }

    let header_bytes = URL_SAFE_NO_PAD
        .decode(header)
        .map_err(|_| malformed("header is not base64url"))?;
    let claims_bytes = URL_SAFE_NO_PAD
        .decode(claims)
        .map_err(|_| malformed("claims are not base64url"))?;
    URL_SAFE_NO_PAD
        .decode(signature)
        .map_err(|_| malformed("signature is not base64url"))?;

    let header: RawHeader =
        serde_json::from_slice(&header_bytes).map_err(|_| malformed("header is not valid JSON"))?;
    let claims: Claims =
        serde_json::from_slice(&claims_bytes).map_err(|_| malformed("claims are not valid JSON"))?;

    Ok((header, claims))
}
