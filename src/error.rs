//! Error types for the Core API gateway

use std::io;

use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde_json::json;
use thiserror::Error;

use crate::auth::claims::ClaimError;
use crate::auth::flow::FlowError;
use crate::auth::jwks::KeySetError;
use crate::auth::policy::PolicyError;
use crate::auth::verifier::VerifyError;
use crate::lifecycle::LifecycleError;
use crate::lifecycle::store::StoreError;

/// Result type alias for the gateway
pub type Result<T> = std::result::Result<T, Error>;

/// Gateway errors
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Malformed request from the client
    #[error("{0}")]
    BadRequest(String),

    /// No usable identity on the request
    #[error("{0}")]
    Unauthenticated(String),

    /// Identity is known but the policy denies the request
    #[error("{0}")]
    Forbidden(String),

    /// Token verification failed
    #[error(transparent)]
    Verify(#[from] VerifyError),

    /// Required identity claim missing from a verified token
    #[error(transparent)]
    Claims(#[from] ClaimError),

    /// RBAC engine failure
    #[error(transparent)]
    Policy(#[from] PolicyError),

    /// OAuth2 authorization-code flow failure
    #[error(transparent)]
    Flow(#[from] FlowError),

    /// Core lifecycle failure
    #[error(transparent)]
    Lifecycle(#[from] LifecycleError),

    /// Persistence failure
    #[error(transparent)]
    Store(#[from] StoreError),

    /// Key-set cache failure
    #[error(transparent)]
    KeySet(#[from] KeySetError),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// JSON error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// HTTP status this error is reported with.
    #[must_use]
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::Unauthenticated(_) => StatusCode::UNAUTHORIZED,
            Self::Forbidden(_) => StatusCode::FORBIDDEN,
            Self::Verify(e) => {
                if e.requires_reauthentication() {
                    StatusCode::UNAUTHORIZED
                } else {
                    StatusCode::INTERNAL_SERVER_ERROR
                }
            }
            Self::Flow(e) => e.status_code(),
            Self::Lifecycle(e) => e.status_code(),
            Self::Config(_)
            | Self::Claims(_)
            | Self::Policy(_)
            | Self::Store(_)
            | Self::KeySet(_)
            | Self::Io(_)
            | Self::Json(_)
            | Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            tracing::error!(error = %self, "Request failed");
        }
        (status, Json(json!({ "error": self.to_string() }))).into_response()
    }
}
