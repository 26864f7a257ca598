use std::{env, path::PathBuf};

use jsonwebtoken::Algorithm;
use thiserror::Error;

/// Key id used by the default development key pair.
pub const DEFAULT_KID: &str = "54bb2165-71e1-41a6-af3e-7da4a0e1e2c1";
pub const DEFAULT_ISSUER: &str = "service project";
pub const DEFAULT_KEYS_FOLDER: &str = "zarf/keys/";

/// AppConfig
///
/// Holds the application's configuration. Loaded once at startup, immutable
/// afterwards, and pulled into handlers through `FromRef`.
#[derive(Clone, Debug)]
pub struct AppConfig {
    /// Runtime environment marker. Controls log format and which settings may
    /// fall back to defaults.
    pub env: Env,
    /// Listen address for the HTTP server.
    pub bind_addr: String,
    pub auth: AuthConfig,
}

/// AuthConfig
///
/// Settings for the trust layer.
#[derive(Clone, Debug)]
pub struct AuthConfig {
    /// Directory holding `<kid>.pem` / `<kid>.pub.pem` files.
    pub keys_folder: PathBuf,
    /// Key id used when minting without an explicit kid.
    pub active_kid: String,
    /// The `iss` value every accepted token must carry.
    pub issuer: String,
    /// Algorithms a token header may declare.
    pub algorithms: Vec<Algorithm>,
    /// Clock-skew tolerance for the issued-at check, in seconds.
    pub leeway_secs: u64,
}

/// Env
///
/// The runtime context. Production refuses to start on defaults.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Env {
    Local,
    Production,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{0} must be set in production")]
    Missing(&'static str),

    #[error("invalid value for {var}: {reason}")]
    Invalid { var: &'static str, reason: String },
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            keys_folder: PathBuf::from(DEFAULT_KEYS_FOLDER),
            active_kid: DEFAULT_KID.to_string(),
            issuer: DEFAULT_ISSUER.to_string(),
            algorithms: vec![Algorithm::RS256],
            leeway_secs: 0,
        }
    }
}

impl Default for AppConfig {
    /// Local defaults, used for test state setup without touching the
    /// process environment.
    fn default() -> Self {
        Self {
            env: Env::Local,
            bind_addr: "0.0.0.0:3000".to_string(),
            auth: AuthConfig::default(),
        }
    }
}

impl AppConfig {
    /// load
    ///
    /// Reads configuration from environment variables. In production the key
    /// folder and issuer have no defaults; a missing one is an error so the
    /// service never starts trusting a development issuer.
    pub fn load() -> Result<Self, ConfigError> {
        let env = match env::var("APP_ENV").as_deref() {
            Ok("production") => Env::Production,
            _ => Env::Local,
        };

        let required = |var: &'static str, default: &str| match (env, env::var(var)) {
            (_, Ok(value)) if !value.trim().is_empty() => Ok(value),
            (Env::Production, _) => Err(ConfigError::Missing(var)),
            (Env::Local, _) => Ok(default.to_string()),
        };

        let keys_folder = PathBuf::from(required("AUTH_KEYS_FOLDER", DEFAULT_KEYS_FOLDER)?);
        let issuer = required("AUTH_ISSUER", DEFAULT_ISSUER)?;
        let active_kid = env::var("AUTH_ACTIVE_KID").unwrap_or_else(|_| DEFAULT_KID.to_string());
        let algorithms = match env::var("AUTH_ALGORITHMS") {
            Ok(list) => parse_algorithms(&list)?,
            Err(_) => vec![Algorithm::RS256],
        };
        let leeway_secs = match env::var("AUTH_LEEWAY_SECS") {
            Ok(raw) => raw.trim().parse().map_err(|e| ConfigError::Invalid {
                var: "AUTH_LEEWAY_SECS",
                reason: format!("{e}"),
            })?,
            Err(_) => 0,
        };

        Ok(Self {
            env,
            bind_addr: env::var("BIND_ADDR").unwrap_or_else(|_| "0.0.0.0:3000".to_string()),
            auth: AuthConfig {
                keys_folder,
                active_kid,
                issuer,
                algorithms,
                leeway_secs,
            },
        })
    }
}

/// Parses a comma-separated algorithm list such as `RS256,RS512`.
pub fn parse_algorithms(list: &str) -> Result<Vec<Algorithm>, ConfigError> {
    let invalid = |reason: String| ConfigError::Invalid {
        var: "AUTH_ALGORITHMS",
        reason,
    };

    let algorithms = list
        .split(',')
        .map(str::trim)
        .filter(|name| !name.is_empty())
        .map(|name| {
            name.parse::<Algorithm>()
                .map_err(|_| invalid(format!("unknown algorithm {name:?}")))
        })
        .collect::<Result<Vec<_>, _>>()?;

    if algorithms.is_empty() {
        return Err(invalid("at least one algorithm is required".to_string()));
    }
    Ok(algorithms)
}
