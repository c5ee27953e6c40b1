//! Configuration management
//!
//! Settings are layered: built-in defaults, then an optional YAML file, then
//! `COREAPI_`-prefixed environment variables (`__` separates sections), and
//! finally the flat variable names older deployments used (`JWKS_URI`,
//! `CLIENT_ID`, `PORT`, ...).

use std::{path::PathBuf, time::Duration};

use figment::{
    Figment,
    providers::{Env, Format, Serialized, Yaml},
};
use jsonwebtoken::Algorithm;
use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Prefix for structured environment overrides.
pub const ENV_PREFIX: &str = "COREAPI_";

/// Flat environment names accepted for compatibility, with the config key
/// each one overrides.
const LEGACY_ENV: &[(&str, &str)] = &[
    ("REDIRECT_URI", "oauth.redirect_uri"),
    ("TOKEN_URL", "oauth.token_url"),
    ("OAUTH_URL", "oauth.authorization_url"),
    ("CLIENT_ID", "oauth.client_id"),
    ("CLIENT_SECRET", "oauth.client_secret"),
    ("JWKS_URI", "jwks.uri"),
    ("RBAC_MODEL", "rbac.model"),
    ("RBAC_POLICY", "rbac.policy"),
    ("DB_PATH", "store.path"),
    ("BASE_PATH", "server.base_path"),
    ("PORT", "server.port"),
];

/// Main configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// HTTP listener
    pub server: ServerConfig,
    /// OAuth2 authorization-code client
    pub oauth: OAuthConfig,
    /// Remote key set
    pub jwks: JwksConfig,
    /// ID token validation rules
    pub verifier: VerifierConfig,
    /// RBAC model and policy files
    pub rbac: RbacConfig,
    /// Session and identity handling
    pub auth: AuthConfig,
    /// Core record persistence
    pub store: StoreConfig,
}

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Host to bind to
    pub host: String,
    /// Port to listen on
    pub port: u16,
    /// Path prefix every route is mounted under (empty for root)
    pub base_path: String,
    /// Maximum time to wait for background tasks after the listener stops
    #[serde(with = "humantime_serde")]
    pub shutdown_timeout: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8008,
            base_path: String::new(),
            shutdown_timeout: Duration::from_secs(30),
        }
    }
}

impl ServerConfig {
    /// Base path with a single leading slash and no trailing slash, or empty.
    #[must_use]
    pub fn normalized_base_path(&self) -> String {
        let trimmed = self.base_path.trim().trim_matches('/');
        if trimmed.is_empty() {
            String::new()
        } else {
            format!("/{trimmed}")
        }
    }
}

/// OAuth2 client settings for the identity provider
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OAuthConfig {
    /// Authorization endpoint the browser is sent to
    pub authorization_url: String,
    /// Token endpoint used for the code exchange
    pub token_url: String,
    /// Registered client id
    pub client_id: String,
    /// Client secret
    #[serde(skip_serializing)]
    pub client_secret: String,
    /// Callback URL registered with the provider
    pub redirect_uri: String,
    /// Requested scopes, space separated
    pub scope: String,
    /// Timeout for the token-endpoint call
    #[serde(with = "humantime_serde")]
    pub exchange_timeout: Duration,
}

impl Default for OAuthConfig {
    fn default() -> Self {
        Self {
            authorization_url: String::new(),
            token_url: String::new(),
            client_id: String::new(),
            client_secret: String::new(),
            redirect_uri: String::new(),
            scope: "openid userinfo".to_string(),
            exchange_timeout: Duration::from_secs(10),
        }
    }
}

/// JWKS endpoint and refresh policy
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct JwksConfig {
    /// JWKS document URL
    pub uri: String,
    /// Background refresh period
    #[serde(with = "humantime_serde")]
    pub refresh_interval: Duration,
    /// Minimum spacing between refreshes triggered by unknown key ids
    #[serde(with = "humantime_serde")]
    pub refresh_rate_limit: Duration,
    /// Timeout for a single fetch
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,
    /// After a failed fetch, how long lookups reuse that failure instead of
    /// fetching again
    #[serde(with = "humantime_serde")]
    pub retry_backoff: Duration,
    /// Refuse plain-HTTP JWKS endpoints
    pub require_https: bool,
}

impl Default for JwksConfig {
    fn default() -> Self {
        Self {
            uri: String::new(),
            refresh_interval: Duration::from_secs(3600),
            refresh_rate_limit: Duration::from_secs(300),
            timeout: Duration::from_secs(10),
            retry_backoff: Duration::from_secs(30),
            require_https: true,
        }
    }
}

/// ID token validation
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VerifierConfig {
    /// Accepted signing algorithms
    pub allowed_algorithms: Vec<Algorithm>,
    /// Clock skew tolerance in seconds for `exp` and `nbf`
    pub leeway_secs: u64,
    /// Check the `aud` claim
    pub verify_audience: bool,
    /// Expected audience; falls back to the OAuth client id
    pub audience: Option<String>,
    /// Expected issuer; not checked when unset
    pub issuer: Option<String>,
}

impl Default for VerifierConfig {
    fn default() -> Self {
        Self {
            allowed_algorithms: vec![Algorithm::RS512, Algorithm::ES256],
            leeway_secs: 60,
            verify_audience: true,
            audience: None,
            issuer: None,
        }
    }
}

/// Casbin model and policy locations
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RbacConfig {
    /// Model definition (`.conf`)
    pub model: PathBuf,
    /// Policy rules (`.csv`)
    pub policy: PathBuf,
}

impl Default for RbacConfig {
    fn default() -> Self {
        Self {
            model: PathBuf::from("./model.conf"),
            policy: PathBuf::from("./policy.csv"),
        }
    }
}

/// Where the request identity comes from
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IdentitySource {
    /// Verified ID token in the session cookie
    #[default]
    Jwt,
    /// Headers injected by an authenticating reverse proxy
    ProxyHeaders,
}

/// Session and identity handling
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    /// Identity source for protected routes
    pub identity_source: IdentitySource,
    /// Mark the session cookie `Secure`
    pub cookie_secure: bool,
    /// Paths (relative to the base path) that skip authentication and RBAC
    pub public_paths: Vec<String>,
    /// Header carrying the username in proxy mode
    pub proxy_username_header: String,
    /// Header carrying the email in proxy mode
    pub proxy_email_header: String,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            identity_source: IdentitySource::Jwt,
            cookie_secure: true,
            public_paths: vec![
                "/authentication".to_string(),
                "/redirect-call".to_string(),
                "/logout".to_string(),
                "/healthz".to_string(),
            ],
            proxy_username_header: "OIDC_CLAIM_username".to_string(),
            proxy_email_header: "OIDC_CLAIM_email".to_string(),
        }
    }
}

/// Core record store backend
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    /// Process memory, lost on restart
    Memory,
    /// SQLite file
    #[default]
    Sqlite,
}

/// Core record persistence
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Backend kind
    pub backend: StoreBackend,
    /// Database path for the SQLite backend (`:memory:` allowed)
    pub path: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackend::Sqlite,
            path: "./cores.db".to_string(),
        }
    }
}

impl Config {
    /// Load configuration from an optional YAML file plus the environment.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] when the file is missing or a value fails to
    /// deserialize.
    pub fn load(path: Option<&std::path::Path>) -> Result<Self> {
        let mut figment = Figment::from(Serialized::defaults(Self::default()));

        if let Some(p) = path {
            if !p.exists() {
                return Err(Error::Config(format!(
                    "Config file not found: {}",
                    p.display()
                )));
            }
            figment = figment.merge(Yaml::file(p));
        }

        figment = figment
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
            .merge(legacy_env());

        let config: Self = figment
            .extract()
            .map_err(|e| Error::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject settings that cannot work at all.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] describing the first problem found.
    pub fn validate(&self) -> Result<()> {
        if self.verifier.allowed_algorithms.is_empty() {
            return Err(Error::Config(
                "verifier.allowed_algorithms must not be empty".to_string(),
            ));
        }
        if self.store.backend == StoreBackend::Sqlite && self.store.path.is_empty() {
            return Err(Error::Config(
                "store.path is required for the sqlite backend".to_string(),
            ));
        }
        if self.auth.identity_source == IdentitySource::Jwt {
            for (name, value) in [
                ("jwks.uri", &self.jwks.uri),
                ("oauth.authorization_url", &self.oauth.authorization_url),
                ("oauth.token_url", &self.oauth.token_url),
                ("oauth.client_id", &self.oauth.client_id),
            ] {
                if value.is_empty() {
                    tracing::warn!(setting = name, "OIDC setting is empty");
                }
            }
        }
        Ok(())
    }
}

/// Map the flat legacy variable names onto nested config keys.
fn legacy_env() -> Env {
    Env::raw().filter_map(|key| {
        LEGACY_ENV
            .iter()
            .find(|(name, _)| key.as_str().eq_ignore_ascii_case(name))
            .map(|(_, target)| (*target).into())
    })
}

/// Serde helper for human-readable durations ("30s", "5m", "1h", "250ms").
pub mod humantime_serde {
    use std::time::Duration;

    use serde::{self, Deserialize, Deserializer, Serializer};

    /// Serialize Duration to human-readable string (e.g., "30s")
    ///
    /// # Errors
    ///
    /// Returns a serialization error if the serializer fails.
    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        if duration.subsec_millis() != 0 {
            serializer.serialize_str(&format!("{}ms", duration.as_millis()))
        } else {
            serializer.serialize_str(&format!("{}s", duration.as_secs()))
        }
    }

    /// Deserialize human-readable duration string (e.g., "30s", "5m", "1h", "100ms")
    ///
    /// # Errors
    ///
    /// Returns a deserialization error if the string cannot be parsed as a duration.
    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Secs(u64),
            Text(String),
        }

        let s = match Raw::deserialize(deserializer)? {
            Raw::Secs(secs) => return Ok(Duration::from_secs(secs)),
            Raw::Text(s) => s,
        };
        let s = s.trim();

        // "ms" must be checked before "s" and "m"
        if let Some(ms) = s.strip_suffix("ms") {
            ms.parse::<u64>()
                .map(Duration::from_millis)
                .map_err(serde::de::Error::custom)
        } else if let Some(secs) = s.strip_suffix('s') {
            secs.parse::<u64>()
                .map(Duration::from_secs)
                .map_err(serde::de::Error::custom)
        } else if let Some(mins) = s.strip_suffix('m') {
            mins.parse::<u64>()
                .map(|m| Duration::from_secs(m * 60))
                .map_err(serde::de::Error::custom)
        } else if let Some(hours) = s.strip_suffix('h') {
            hours
                .parse::<u64>()
                .map(|h| Duration::from_secs(h * 3600))
                .map_err(serde::de::Error::custom)
        } else {
            // Assume seconds
            s.parse::<u64>()
                .map(Duration::from_secs)
                .map_err(serde::de::Error::custom)
        }
    }
}
