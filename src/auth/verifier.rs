//! ID token verification against the cached key set.
//!
//! # Verification order
//!
//! 1. Obtain the key set; failure is [`VerifyError::Generation`].
//! 2. Parse the header; structural failure is [`VerifyError::Parse`].
//! 3. Check the algorithm against the allow-list and resolve `kid`.
//! 4. Check the signature, then `exp` and `nbf` (with leeway), then `aud` and
//!    `iss` when configured.
//!
//! An expired token is only reported as [`VerifyError::Expired`] when its
//! signature is valid; a bad signature always wins as
//! [`VerifyError::Invalid`].

use std::sync::Arc;

use jsonwebtoken::{Algorithm, Validation, decode, decode_header, errors::ErrorKind};
use serde::Serialize;
use tracing::debug;

use super::claims::IdTokenClaims;
use super::jwks::{KeySetCache, KeySetError};
use crate::config::VerifierConfig;

/// Outcome code of a verification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum VerifyCode {
    /// Token accepted
    Ok,
    /// Key set could not be obtained
    GenerationError,
    /// Token expired
    TokenExpired,
    /// Token structurally malformed
    ParseError,
    /// Signature, algorithm, key or claim check failed
    InvalidToken,
}

/// Classified verification failure.
#[derive(Debug, thiserror::Error)]
pub enum VerifyError {
    /// No key set available.
    #[error("failed to obtain JWKS: {0}")]
    Generation(#[from] KeySetError),

    /// `exp` in the past beyond the leeway.
    #[error("token is expired")]
    Expired,

    /// Not a parseable JWT.
    #[error("failed to parse token: {0}")]
    Parse(String),

    /// Anything else that makes the token unacceptable.
    #[error("token is not valid: {0}")]
    Invalid(String),
}

impl VerifyError {
    /// Outcome code for this failure.
    #[must_use]
    pub fn code(&self) -> VerifyCode {
        match self {
            Self::Generation(_) => VerifyCode::GenerationError,
            Self::Expired => VerifyCode::TokenExpired,
            Self::Parse(_) => VerifyCode::ParseError,
            Self::Invalid(_) => VerifyCode::InvalidToken,
        }
    }

    /// Whether logging in again can fix this.
    ///
    /// Generation errors are server-side and are not the caller's fault.
    #[must_use]
    pub fn requires_reauthentication(&self) -> bool {
        !matches!(self, Self::Generation(_))
    }
}

impl From<jsonwebtoken::errors::Error> for VerifyError {
    fn from(e: jsonwebtoken::errors::Error) -> Self {
        match e.kind() {
            ErrorKind::ExpiredSignature => Self::Expired,
            ErrorKind::InvalidToken
            | ErrorKind::Base64(_)
            | ErrorKind::Json(_)
            | ErrorKind::Utf8(_)
            | ErrorKind::MissingRequiredClaim(_) => Self::Parse(e.to_string()),
            _ => Self::Invalid(e.to_string()),
        }
    }
}

/// Verifies ID tokens issued by the configured provider.
pub struct TokenVerifier {
    keys: Arc<KeySetCache>,
    allowed_algorithms: Vec<Algorithm>,
    audience: Option<String>,
    issuer: Option<String>,
    leeway: u64,
}

impl TokenVerifier {
    /// Create a verifier.
    ///
    /// `audience` is the effective expected audience; `None` disables the
    /// audience check.
    #[must_use]
    pub fn new(keys: Arc<KeySetCache>, config: &VerifierConfig, audience: Option<String>) -> Self {
        Self {
            keys,
            allowed_algorithms: config.allowed_algorithms.clone(),
            audience,
            issuer: config.issuer.clone(),
            leeway: config.leeway_secs,
        }
    }

    /// The key set this verifier reads.
    #[must_use]
    pub fn key_set(&self) -> &Arc<KeySetCache> {
        &self.keys
    }

    /// Verify `token` and return its claims.
    ///
    /// # Errors
    ///
    /// Returns the classified [`VerifyError`].
    pub async fn verify(&self, token: &str) -> Result<IdTokenClaims, VerifyError> {
        self.keys.ensure_loaded().await?;

        if token.is_empty() {
            return Err(VerifyError::Parse("empty token".to_string()));
        }
        let header = decode_header(token).map_err(|e| match VerifyError::from(e) {
            VerifyError::Invalid(msg) => VerifyError::Parse(msg),
            other => other,
        })?;

        if !self.allowed_algorithms.contains(&header.alg) {
            return Err(VerifyError::Invalid(format!(
                "signing algorithm {:?} is not allowed",
                header.alg
            )));
        }

        let kid = header
            .kid
            .as_deref()
            .ok_or_else(|| VerifyError::Invalid("token header has no kid".to_string()))?;
        let key = self
            .keys
            .get(kid)
            .await?
            .ok_or_else(|| VerifyError::Invalid(format!("unknown key id {kid}")))?;
        if !key.accepts(header.alg) {
            return Err(VerifyError::Invalid(format!(
                "key {kid} cannot verify {:?} signatures",
                header.alg
            )));
        }

        let data = decode::<IdTokenClaims>(token, key.decoding_key(), &self.validation(header.alg))?;
        debug!(sub = %data.claims.sub, kid, "ID token verified");
        Ok(data.claims)
    }

    fn validation(&self, alg: Algorithm) -> Validation {
        let mut v = Validation::new(alg);
        v.leeway = self.leeway;
        v.validate_exp = true;
        v.validate_nbf = true;
        match &self.audience {
            Some(aud) => v.set_audience(&[aud]),
            None => v.validate_aud = false,
        }
        if let Some(iss) = &self.issuer {
            v.set_issuer(&[iss]);
        }
        v
    }
}
