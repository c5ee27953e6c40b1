//! OAuth2 authorization-code login flow.
//!
//! A callback moves through three typed stages, each produced only by the
//! previous one:
//!
//! ```text
//! AwaitingCode ──exchange──▶ ExchangingToken ──verify──▶ Verified
//! ```
//!
//! The `state` parameter carries the base64-encoded URI the user originally
//! asked for. It is decoded and checked before the code is spent, so a
//! tampered `state` never reaches the token endpoint and never yields a
//! cookie.

use std::fmt;
use std::sync::Arc;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use serde::Deserialize;
use tracing::{debug, info, warn};
use url::Url;

use super::claims::IdTokenClaims;
use super::cookie::{CookieOptions, build_clear_cookie, build_set_cookie};
use super::verifier::{TokenVerifier, VerifyError};
use crate::config::OAuthConfig;
use axum::http::StatusCode;

/// Stage of a login callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowStage {
    /// Code and state received, nothing spent yet
    AwaitingCode,
    /// Code sent to the token endpoint
    ExchangingToken,
    /// ID token verified
    Verified,
}

impl fmt::Display for FlowStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::AwaitingCode => "awaiting_code",
            Self::ExchangingToken => "exchanging_token",
            Self::Verified => "verified",
        })
    }
}

/// Login flow failures.
#[derive(Debug, thiserror::Error)]
pub enum FlowError {
    /// Callback without `code`.
    #[error("authorization code is missing")]
    MissingCode,

    /// `state` absent, not base64, or not a local path.
    #[error("requested URI missing or malformed in state parameter")]
    InvalidState,

    /// The provider redirected back with an error instead of a code.
    #[error("authorization denied by identity provider: {0}")]
    Denied(String),

    /// Authorization endpoint URL unusable.
    #[error("invalid authorization endpoint URL: {0}")]
    AuthorizationUrl(String),

    /// Token endpoint unreachable or answered with a failure status.
    #[error("failed to exchange code for tokens: {0}")]
    Exchange(String),

    /// Token endpoint answered with an OAuth `error`.
    #[error("token exchange error: {0}")]
    Provider(String),

    /// Token endpoint body not understood.
    #[error("failed to parse token response: {0}")]
    MalformedResponse(String),

    /// The returned ID token failed verification.
    #[error("ID token rejected: {0}")]
    Verification(#[from] VerifyError),
}

impl FlowError {
    /// Stage the flow was in when it failed.
    #[must_use]
    pub fn stage(&self) -> FlowStage {
        match self {
            Self::MissingCode | Self::InvalidState | Self::Denied(_) | Self::AuthorizationUrl(_) => {
                FlowStage::AwaitingCode
            }
            Self::Exchange(_) | Self::Provider(_) | Self::MalformedResponse(_) => {
                FlowStage::ExchangingToken
            }
            Self::Verification(_) => FlowStage::Verified,
        }
    }

    /// HTTP status for this failure.
    #[must_use]
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::MissingCode | Self::InvalidState => StatusCode::BAD_REQUEST,
            Self::Denied(_) => StatusCode::UNAUTHORIZED,
            Self::Verification(e) if e.requires_reauthentication() => StatusCode::UNAUTHORIZED,
            Self::Verification(_)
            | Self::AuthorizationUrl(_)
            | Self::Exchange(_)
            | Self::Provider(_)
            | Self::MalformedResponse(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

/// Token endpoint success body.
#[derive(Clone, Deserialize)]
pub struct TokenResponse {
    /// Signed ID token
    pub id_token: String,
    /// Access token
    #[serde(default)]
    pub access_token: Option<String>,
    /// Token type (usually "Bearer")
    #[serde(default)]
    pub token_type: Option<String>,
    /// Lifetime in seconds
    #[serde(default)]
    pub expires_in: Option<u64>,
    /// Refresh token
    #[serde(default)]
    pub refresh_token: Option<String>,
    /// Granted scopes
    #[serde(default)]
    pub scope: Option<String>,
}

#[derive(Deserialize)]
struct TokenErrorResponse {
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    error_description: Option<String>,
}

/// Callback accepted: a code to spend and a safe URI to return to.
#[derive(Debug)]
pub struct AwaitingCode {
    code: String,
    requested_uri: String,
}

impl AwaitingCode {
    /// Validate the callback parameters.
    ///
    /// # Errors
    ///
    /// [`FlowError::InvalidState`] for a missing or unsafe `state`,
    /// [`FlowError::MissingCode`] for a missing `code`.
    pub fn new(code: Option<&str>, state: Option<&str>) -> Result<Self, FlowError> {
        let requested_uri = decode_requested_uri(state.ok_or(FlowError::InvalidState)?)?;
        let code = code
            .filter(|c| !c.is_empty())
            .ok_or(FlowError::MissingCode)?
            .to_string();
        Ok(Self {
            code,
            requested_uri,
        })
    }

    /// Where the user goes after login.
    #[must_use]
    pub fn requested_uri(&self) -> &str {
        &self.requested_uri
    }
}

/// Code exchanged; tokens not yet trusted.
pub struct ExchangingToken {
    requested_uri: String,
    tokens: TokenResponse,
}

impl ExchangingToken {
    /// Raw token endpoint response.
    #[must_use]
    pub fn tokens(&self) -> &TokenResponse {
        &self.tokens
    }
}

/// Login complete.
pub struct Verified {
    requested_uri: String,
    id_token: String,
    claims: IdTokenClaims,
}

impl Verified {
    /// Where the user goes now.
    #[must_use]
    pub fn requested_uri(&self) -> &str {
        &self.requested_uri
    }

    /// The verified ID token, stored as the session cookie.
    #[must_use]
    pub fn id_token(&self) -> &str {
        &self.id_token
    }

    /// Its claims.
    #[must_use]
    pub fn claims(&self) -> &IdTokenClaims {
        &self.claims
    }
}

/// Drives login redirects, callbacks and logout.
pub struct AuthFlowController {
    config: OAuthConfig,
    http: reqwest::Client,
    verifier: Arc<TokenVerifier>,
    cookie: CookieOptions,
    landing_uri: String,
}

impl AuthFlowController {
    /// Create the controller.
    ///
    /// `landing_uri` is used when a login starts without a requested URI.
    ///
    /// # Errors
    ///
    /// Returns [`FlowError::Exchange`] if the HTTP client cannot be built.
    pub fn new(
        config: &OAuthConfig,
        verifier: Arc<TokenVerifier>,
        cookie: CookieOptions,
        landing_uri: impl Into<String>,
    ) -> Result<Self, FlowError> {
        let http = reqwest::Client::builder()
            .timeout(config.exchange_timeout)
            .build()
            .map_err(|e| FlowError::Exchange(e.to_string()))?;
        Ok(Self {
            config: config.clone(),
            http,
            verifier,
            cookie,
            landing_uri: landing_uri.into(),
        })
    }

    /// Provider URL that starts a login.
    ///
    /// `state` is the already-encoded requested URI; when absent the landing
    /// URI is encoded instead.
    ///
    /// # Errors
    ///
    /// Returns [`FlowError::AuthorizationUrl`] if the configured endpoint is
    /// not a URL.
    pub fn authorization_url(&self, state: Option<&str>) -> Result<Url, FlowError> {
        let state = match state.filter(|s| !s.is_empty()) {
            Some(s) => s.to_string(),
            None => encode_requested_uri(&self.landing_uri),
        };

        let mut url = Url::parse(&self.config.authorization_url)
            .map_err(|e| FlowError::AuthorizationUrl(e.to_string()))?;
        url.query_pairs_mut()
            .append_pair("client_id", &self.config.client_id)
            .append_pair("redirect_uri", &self.config.redirect_uri)
            .append_pair("scope", &self.config.scope)
            .append_pair("response_type", "code")
            .append_pair("state", &state);
        Ok(url)
    }

    /// Run a whole callback: validate, exchange, verify.
    ///
    /// # Errors
    ///
    /// Returns the [`FlowError`] of the first stage that fails.
    pub async fn complete(&self, code: Option<&str>, state: Option<&str>) -> Result<Verified, FlowError> {
        let awaiting = AwaitingCode::new(code, state)?;
        let exchanging = self.exchange(awaiting).await?;
        self.verify(exchanging).await
    }

    /// Spend the authorization code at the token endpoint.
    ///
    /// # Errors
    ///
    /// Returns [`FlowError::Exchange`], [`FlowError::Provider`] or
    /// [`FlowError::MalformedResponse`].
    pub async fn exchange(&self, awaiting: AwaitingCode) -> Result<ExchangingToken, FlowError> {
        let params = [
            ("grant_type", "authorization_code"),
            ("code", awaiting.code.as_str()),
            ("redirect_uri", self.config.redirect_uri.as_str()),
            ("client_id", self.config.client_id.as_str()),
            ("client_secret", self.config.client_secret.as_str()),
        ];

        debug!(token_url = %self.config.token_url, "Exchanging authorization code");
        let response = self
            .http
            .post(&self.config.token_url)
            .form(&params)
            .send()
            .await
            .map_err(|e| FlowError::Exchange(e.to_string()))?;

        let status = response.status();
        let body = response
            .bytes()
            .await
            .map_err(|e| FlowError::Exchange(e.to_string()))?;

        if let Ok(TokenErrorResponse {
            error: Some(error),
            error_description,
        }) = serde_json::from_slice::<TokenErrorResponse>(&body)
        {
            if !error.is_empty() {
                let detail = match error_description {
                    Some(desc) if !desc.is_empty() => format!("{error}: {desc}"),
                    _ => error,
                };
                warn!(%status, error = %detail, "Token endpoint returned an error");
                return Err(FlowError::Provider(detail));
            }
        }

        if !status.is_success() {
            return Err(FlowError::Exchange(format!("HTTP {status}")));
        }

        let tokens: TokenResponse = serde_json::from_slice(&body)
            .map_err(|e| FlowError::MalformedResponse(e.to_string()))?;
        Ok(ExchangingToken {
            requested_uri: awaiting.requested_uri,
            tokens,
        })
    }

    /// Verify the ID token from the exchange.
    ///
    /// # Errors
    ///
    /// Returns [`FlowError::Verification`].
    pub async fn verify(&self, exchanging: ExchangingToken) -> Result<Verified, FlowError> {
        let id_token = exchanging.tokens.id_token;
        let claims = self.verifier.verify(&id_token).await?;
        info!(sub = %claims.sub, "Login completed");
        Ok(Verified {
            requested_uri: exchanging.requested_uri,
            id_token,
            claims,
        })
    }

    /// `Set-Cookie` value establishing the session.
    #[must_use]
    pub fn session_cookie(&self, verified: &Verified) -> String {
        build_set_cookie(verified.id_token(), &self.cookie)
    }

    /// `Set-Cookie` value ending the session.
    #[must_use]
    pub fn logout_cookie(&self) -> String {
        build_clear_cookie(&self.cookie)
    }
}

/// Encode a URI for the `state` / `requested_uri` parameters.
#[must_use]
pub fn encode_requested_uri(uri: &str) -> String {
    STANDARD.encode(uri)
}

/// Decode `state` and accept it only as a local absolute path.
///
/// # Errors
///
/// Returns [`FlowError::InvalidState`] for bad base64, non-UTF-8 content, or
/// anything that could leave the site (`https://…`, `//host`, `/\host`).
pub fn decode_requested_uri(state: &str) -> Result<String, FlowError> {
    let bytes = STANDARD
        .decode(state.trim())
        .map_err(|_| FlowError::InvalidState)?;
    let uri = String::from_utf8(bytes).map_err(|_| FlowError::InvalidState)?;

    let mut chars = uri.chars();
    match (chars.next(), chars.next()) {
        (Some('/'), Some('/' | '\\')) => Err(FlowError::InvalidState),
        (Some('/'), _) if !uri.chars().any(char::is_control) => Ok(uri),
        _ => Err(FlowError::InvalidState),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::jwks::KeySetCache;
    use crate::config::{JwksConfig, VerifierConfig};

    fn controller() -> AuthFlowController {
        let keys = Arc::new(
            KeySetCache::new(&JwksConfig {
                require_https: false,
                ..JwksConfig::default()
            })
            .unwrap(),
        );
        let verifier = Arc::new(TokenVerifier::new(keys, &VerifierConfig::default(), None));
        let config = OAuthConfig {
            authorization_url: "https://idp.example.com/auth?kc_idp_hint=corp".to_string(),
            token_url: "http://127.0.0.1:9/token".to_string(),
            client_id: "coreapi".to_string(),
            client_secret: "s3cret".to_string(),
            redirect_uri: "https://api.example.com/redirect-call".to_string(),
            ..OAuthConfig::default()
        };
        AuthFlowController::new(&config, verifier, CookieOptions::default(), "/").unwrap()
    }

    #[test]
    fn authorization_url_carries_oauth_parameters() {
        let state = encode_requested_uri("/cores/");
        let url = controller().authorization_url(Some(&state)).unwrap();
        let pairs: std::collections::HashMap<_, _> = url.query_pairs().into_owned().collect();

        assert_eq!(url.host_str(), Some("idp.example.com"));
        assert_eq!(pairs["kc_idp_hint"], "corp");
        assert_eq!(pairs["client_id"], "coreapi");
        assert_eq!(pairs["redirect_uri"], "https://api.example.com/redirect-call");
        assert_eq!(pairs["scope"], "openid userinfo");
        assert_eq!(pairs["response_type"], "code");
        assert_eq!(pairs["state"], state);
    }

    #[test]
    fn missing_state_defaults_to_landing_uri() {
        let url = controller().authorization_url(None).unwrap();
        let state = url
            .query_pairs()
            .find(|(k, _)| k == "state")
            .map(|(_, v)| v.into_owned())
            .unwrap();
        assert_eq!(decode_requested_uri(&state).unwrap(), "/");
    }

    #[test]
    fn requested_uri_must_be_local() {
        for uri in ["/cores/", "/core/abc?x=1", "/"] {
            assert_eq!(decode_requested_uri(&encode_requested_uri(uri)).unwrap(), uri);
        }
        for uri in ["https://evil.example", "//evil.example", "/\\evil.example", "cores", ""] {
            assert!(
                matches!(decode_requested_uri(&encode_requested_uri(uri)), Err(FlowError::InvalidState)),
                "accepted {uri:?}"
            );
        }
        assert!(decode_requested_uri("%%%not-base64").is_err());
    }

    #[test]
    fn state_is_checked_before_code() {
        // GIVEN: a callback with neither code nor a valid state
        let err = AwaitingCode::new(None, Some("bm90LWEtcGF0aA==")).unwrap_err();

        // THEN: the state problem is reported first
        assert!(matches!(err, FlowError::InvalidState));

        let err = AwaitingCode::new(None, Some(&encode_requested_uri("/cores/"))).unwrap_err();
        assert!(matches!(err, FlowError::MissingCode));
    }

    #[tokio::test]
    async fn unreachable_token_endpoint_is_an_exchange_error() {
        let awaiting = AwaitingCode::new(Some("abc"), Some(&encode_requested_uri("/"))).unwrap();
        let err = controller().exchange(awaiting).await.err().unwrap();
        assert!(matches!(err, FlowError::Exchange(_)));
        assert_eq!(err.stage(), FlowStage::ExchangingToken);
        assert_eq!(err.status_code(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[test]
    fn client_errors_map_to_4xx() {
        assert_eq!(FlowError::InvalidState.status_code(), StatusCode::BAD_REQUEST);
        assert_eq!(FlowError::MissingCode.status_code(), StatusCode::BAD_REQUEST);
        assert_eq!(
            FlowError::Verification(VerifyError::Expired).status_code(),
            StatusCode::UNAUTHORIZED
        );
    }
}
