//! Authentication and authorization.
//!
//! [`AuthContext`] is built once at startup and shared by the middleware and
//! the session handlers. It owns the key-set cache, the token verifier, the
//! RBAC enforcer and the login flow controller.

pub mod audit;
pub mod claims;
pub mod cookie;
pub mod flow;
pub mod jwks;
pub mod middleware;
pub mod policy;
pub mod verifier;

#[cfg(test)]
pub(crate) mod test_fixtures;

use std::sync::Arc;

use axum::{
    http::{HeaderMap, StatusCode, header},
    response::{IntoResponse, Response},
};
use tracing::warn;

use self::claims::{IdTokenClaims, Identity};
use self::cookie::CookieOptions;
use self::flow::{AuthFlowController, encode_requested_uri};
use self::jwks::KeySetCache;
use self::policy::PolicyEnforcer;
use self::verifier::TokenVerifier;
use crate::Result;
use crate::config::{Config, IdentitySource};

/// A request whose session cookie passed verification.
///
/// Inserted into request extensions by the authentication middleware.
#[derive(Debug, Clone)]
pub struct VerifiedSession {
    /// Raw ID token from the cookie
    pub token: String,
    /// Its verified claims
    pub claims: IdTokenClaims,
}

/// Shared authentication state.
pub struct AuthContext {
    /// JWKS cache
    pub keys: Arc<KeySetCache>,
    /// ID token verifier
    pub verifier: Arc<TokenVerifier>,
    /// RBAC enforcer
    pub enforcer: Arc<PolicyEnforcer>,
    /// Login flow
    pub flow: AuthFlowController,
    /// Where protected routes take the identity from
    pub identity_source: IdentitySource,
    base_path: String,
    public_paths: Vec<String>,
    proxy_username_header: String,
    proxy_email_header: String,
}

impl AuthContext {
    /// Build from configuration, loading the RBAC files from disk.
    ///
    /// # Errors
    ///
    /// Returns an error if the policy files cannot be loaded or an HTTP client
    /// cannot be built.
    pub async fn from_config(config: &Config) -> Result<Self> {
        let keys = Arc::new(KeySetCache::new(&config.jwks)?);
        let enforcer =
            Arc::new(PolicyEnforcer::from_files(&config.rbac.model, &config.rbac.policy).await?);
        Self::new(config, keys, enforcer)
    }

    /// Build from already-constructed components.
    ///
    /// # Errors
    ///
    /// Returns an error if the login flow's HTTP client cannot be built.
    pub fn new(
        config: &Config,
        keys: Arc<KeySetCache>,
        enforcer: Arc<PolicyEnforcer>,
    ) -> Result<Self> {
        let audience = if config.verifier.verify_audience {
            config
                .verifier
                .audience
                .clone()
                .or_else(|| Some(config.oauth.client_id.clone()))
                .filter(|aud| !aud.is_empty())
        } else {
            None
        };
        let verifier = Arc::new(TokenVerifier::new(
            Arc::clone(&keys),
            &config.verifier,
            audience,
        ));

        let base_path = config.server.normalized_base_path();
        let cookie = CookieOptions {
            secure: config.auth.cookie_secure,
            ..CookieOptions::default()
        };
        let flow = AuthFlowController::new(
            &config.oauth,
            Arc::clone(&verifier),
            cookie,
            format!("{base_path}/"),
        )?;

        if config.auth.identity_source == IdentitySource::ProxyHeaders {
            warn!(
                username_header = %config.auth.proxy_username_header,
                "Identity taken from proxy headers; tokens are not verified on protected routes"
            );
        }

        Ok(Self {
            keys,
            verifier,
            enforcer,
            flow,
            identity_source: config.auth.identity_source,
            base_path,
            public_paths: config.auth.public_paths.clone(),
            proxy_username_header: config.auth.proxy_username_header.clone(),
            proxy_email_header: config.auth.proxy_email_header.clone(),
        })
    }

    /// Normalized base path ("" or "/prefix").
    #[must_use]
    pub fn base_path(&self) -> &str {
        &self.base_path
    }

    /// Whether `path` (relative to the base path) skips auth and RBAC.
    #[must_use]
    pub fn is_public_path(&self, path: &str) -> bool {
        self.public_paths.iter().any(|p| p == path)
    }

    /// 302 to the login route, remembering `requested_uri`.
    #[must_use]
    pub fn login_redirect(&self, requested_uri: &str) -> Response {
        let query = url::form_urlencoded::Serializer::new(String::new())
            .append_pair("requested_uri", &encode_requested_uri(requested_uri))
            .finish();
        found(&format!("{}/authentication?{query}", self.base_path))
    }

    /// Identity asserted by an authenticating reverse proxy.
    #[must_use]
    pub fn identity_from_headers(&self, headers: &HeaderMap) -> Option<Identity> {
        let read = |name: &str| {
            headers
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(str::trim)
                .filter(|v| !v.is_empty())
                .map(str::to_string)
        };
        Some(Identity {
            username: read(&self.proxy_username_header)?,
            email: read(&self.proxy_email_header)?,
        })
    }
}

/// `302 Found` to `location`.
pub(crate) fn found(location: &str) -> Response {
    (StatusCode::FOUND, [(header::LOCATION, location.to_string())]).into_response()
}
