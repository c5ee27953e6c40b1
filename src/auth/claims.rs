//! ID token claims and the identity derived from them.

use base64::Engine as _;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use serde::{Deserialize, Serialize};

/// A required identity claim is absent.
#[derive(Debug, thiserror::Error)]
pub enum ClaimError {
    /// Named claim missing or empty.
    #[error("{0} not found in the token claims")]
    Missing(&'static str),
}

/// Claims of a verified ID token.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdTokenClaims {
    /// Subject
    pub sub: String,
    /// Expiry (Unix seconds)
    pub exp: u64,
    /// Not-before (Unix seconds)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nbf: Option<u64>,
    /// Issued-at (Unix seconds)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iat: Option<u64>,
    /// Issuer
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iss: Option<String>,
    /// Username claim
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    /// OIDC standard username claim, used when `username` is absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preferred_username: Option<String>,
    /// Email
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
}

impl IdTokenClaims {
    /// `username`, falling back to `preferred_username`.
    #[must_use]
    pub fn username(&self) -> Option<&str> {
        non_empty(self.username.as_deref()).or_else(|| non_empty(self.preferred_username.as_deref()))
    }
}

/// The caller's identity as used for RBAC and responses.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Identity {
    /// RBAC subject
    pub username: String,
    /// Contact address
    pub email: String,
}

impl Identity {
    /// Extract the identity from verified claims.
    ///
    /// # Errors
    ///
    /// Returns [`ClaimError::Missing`] when `username` (or
    /// `preferred_username`) or `email` is absent.
    pub fn from_claims(claims: &IdTokenClaims) -> Result<Self, ClaimError> {
        let username = claims.username().ok_or(ClaimError::Missing("username"))?;
        let email = non_empty(claims.email.as_deref()).ok_or(ClaimError::Missing("email"))?;
        Ok(Self {
            username: username.to_string(),
            email: email.to_string(),
        })
    }
}

/// Claims read from a token without checking its signature.
///
/// Only for log context; never for decisions.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct UnverifiedClaims {
    /// Subject
    #[serde(default)]
    pub sub: Option<String>,
    /// Username
    #[serde(default)]
    pub username: Option<String>,
    /// Preferred username
    #[serde(default)]
    pub preferred_username: Option<String>,
    /// Email
    #[serde(default)]
    pub email: Option<String>,
}

impl UnverifiedClaims {
    /// Best label for log lines.
    #[must_use]
    pub fn display_name(&self) -> Option<&str> {
        non_empty(self.username.as_deref())
            .or_else(|| non_empty(self.preferred_username.as_deref()))
            .or_else(|| non_empty(self.email.as_deref()))
            .or_else(|| non_empty(self.sub.as_deref()))
    }
}

/// Decode the payload segment of a JWT without verifying it.
#[must_use]
pub fn peek_unverified(token: &str) -> Option<UnverifiedClaims> {
    let mut parts = token.split('.');
    let (_header, payload) = (parts.next()?, parts.next()?);
    let bytes = URL_SAFE_NO_PAD.decode(payload.trim_end_matches('=')).ok()?;
    serde_json::from_slice(&bytes).ok()
}

fn non_empty(value: Option<&str>) -> Option<&str> {
    value.filter(|v| !v.is_empty())
}
