//! Core API Gateway Library
//!
//! HTTP API for managing the lifecycle of mobile-network "Cores", fronted by
//! an OAuth2/OIDC authorization-code login and Casbin RBAC.
//!
//! # Components
//!
//! - **Key-set cache**: JWKS fetched from the identity provider, refreshed
//!   on a timer and on unknown key ids (rate limited)
//! - **Token verifier**: ID token signature and claim validation with
//!   classified failure codes
//! - **Policy enforcer**: `(subject, path, method)` decisions from a Casbin
//!   model and policy
//! - **Auth flow**: login redirect, code exchange, session cookie, logout
//! - **Middleware**: authentication then authorization on every protected
//!   route
//! - **Lifecycle manager**: Core records moving through
//!   `Created → Deploying → Deployed → Stopping → Stopped`

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod auth;
pub mod cli;
pub mod config;
pub mod error;
pub mod gateway;
pub mod lifecycle;

pub use error::{Error, Result};

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Setup tracing/logging
///
/// # Errors
///
/// Returns [`Error::Internal`] if a global subscriber is already installed.
pub fn setup_tracing(level: &str, format: Option<&str>) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let subscriber = tracing_subscriber::registry().with(filter);

    match format {
        Some("json") => subscriber
            .with(fmt::layer().json())
            .try_init()
            .map_err(|e| Error::Internal(e.to_string())),
        _ => subscriber
            .with(fmt::layer())
            .try_init()
            .map_err(|e| Error::Internal(e.to_string())),
    }
}
