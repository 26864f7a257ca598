use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use jsonwebtoken::{Algorithm, Header, encode};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::keystore::{KeyStore, KeyStoreError};

/// Claims
///
/// The payload carried by every token this service mints or accepts.
/// Timestamps are Unix seconds, matching the JWT `NumericDate` encoding.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Claims {
    /// Subject (sub): the opaque user identifier.
    pub sub: String,
    /// Issuer (iss): who minted the token. Checked verbatim by the verifier.
    pub iss: String,
    /// Issued At (iat).
    pub iat: i64,
    /// Expiration Time (exp). Always strictly after `iat` for minted tokens.
    pub exp: i64,
    /// Role names. Serialized under the capitalized key used by the
    /// existing token tooling.
    #[serde(rename = "Roles", default)]
    pub roles: Vec<String>,
}

/// SigningError
///
/// Why a single issuance call failed. Never fatal to the process.
#[derive(Debug, Error)]
pub enum SigningError {
    #[error("signing key unavailable: {0}")]
    Key(#[from] KeyStoreError),

    #[error("token validity must be positive, got {seconds}s")]
    InvalidValidity { seconds: i64 },

    #[error("signing failed: {0}")]
    Crypto(#[from] jsonwebtoken::errors::Error),
}

/// TokenIssuer
///
/// Mints signed tokens with keys resolved from the shared `KeyStore`. This is
/// the administrative path (the CLI and tests); request handling only ever
/// verifies.
#[derive(Debug, Clone)]
pub struct TokenIssuer {
    keys: Arc<KeyStore>,
    algorithm: Algorithm,
}

impl TokenIssuer {
    pub fn new(keys: Arc<KeyStore>) -> Self {
        Self {
            keys,
            algorithm: Algorithm::RS256,
        }
    }

    /// Overrides the signing algorithm. Must be an RSA algorithm, since that
    /// is the only key type the store holds.
    pub fn with_algorithm(mut self, algorithm: Algorithm) -> Self {
        self.algorithm = algorithm;
        self
    }

    /// issue
    ///
    /// Mints a token for `subject`, valid from now for `validity`, signed by
    /// the private key registered under `kid`. The kid is written into the
    /// header so verifiers can find the matching public key.
    pub fn issue(
        &self,
        subject: &str,
        issuer: &str,
        roles: &[String],
        kid: &str,
        validity: Duration,
    ) -> Result<String, SigningError> {
        self.issue_at(subject, issuer, roles, kid, validity, Utc::now())
    }

    /// Same as `issue`, with an explicit issuance instant.
    pub fn issue_at(
        &self,
        subject: &str,
        issuer: &str,
        roles: &[String],
        kid: &str,
        validity: Duration,
        now: DateTime<Utc>,
    ) -> Result<String, SigningError> {
        if validity.num_seconds() <= 0 {
            return Err(SigningError::InvalidValidity {
                seconds: validity.num_seconds(),
            });
        }

        let iat = now.timestamp();
        let claims = Claims {
            sub: subject.to_string(),
            iss: issuer.to_string(),
            iat,
            exp: iat + validity.num_seconds(),
            roles: roles.to_vec(),
        };

        self.sign(&claims, kid)
    }

    /// Signs an already-built claim set. Used by `issue_at` and by tooling
    /// that needs full control over timestamps.
    pub fn sign(&self, claims: &Claims, kid: &str) -> Result<String, SigningError> {
        let key = self.keys.resolve_private_key(kid)?;

        let mut header = Header::new(self.algorithm);
        header.kid = Some(kid.to_string());

        let token = encode(&header, claims, &key)?;
        tracing::debug!(kid, sub = %claims.sub, exp = claims.exp, "token signed");
        Ok(token)
    }
}
