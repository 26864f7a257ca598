#![allow(dead_code)]

use std::{path::PathBuf, sync::Arc};

use chrono::{DateTime, Duration, Utc};
use jsonwebtoken::Algorithm;
use sales_api::{AppState, KeyStore, PolicyEvaluator, TokenIssuer, TokenVerifier};

pub const ISSUER: &str = "service project";

/// Directory with the `k1` / `k2` private keys checked in for tests.
pub fn fixture_keys_dir() -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("tests/fixtures/keys")
}

pub struct TestKeys {
    pub store: Arc<KeyStore>,
    pub issuer: TokenIssuer,
}

impl TestKeys {
    pub fn load() -> Self {
        let store = Arc::new(KeyStore::load_dir(fixture_keys_dir()).expect("fixture keys load"));
        Self {
            issuer: TokenIssuer::new(store.clone()),
            store,
        }
    }

    pub fn token(&self, subject: &str, roles: &[&str]) -> String {
        self.token_at(subject, roles, Utc::now(), Duration::hours(1))
    }

    pub fn token_at(
        &self,
        subject: &str,
        roles: &[&str],
        now: DateTime<Utc>,
        validity: Duration,
    ) -> String {
        let roles: Vec<String> = roles.iter().map(|r| r.to_string()).collect();
        self.issuer
            .issue_at(subject, ISSUER, &roles, "k1", validity, now)
            .expect("fixture token")
    }

    pub fn state(&self) -> AppState {
        let verifier = TokenVerifier::new(self.store.clone(), ISSUER, vec![Algorithm::RS256]);
        AppState::new(Arc::new(verifier), Arc::new(PolicyEvaluator::new()))
    }
}
