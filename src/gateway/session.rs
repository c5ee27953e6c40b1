//! Login, callback, logout and token handlers.

use std::sync::Arc;

use axum::{
    Json,
    extract::{Query, Request, State},
    http::{StatusCode, header},
    response::{IntoResponse, Response},
};
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, warn};

use super::router::AppState;
use crate::auth::audit::{self, AuditEvent};
use crate::auth::claims::peek_unverified;
use crate::auth::cookie::{SESSION_COOKIE, read_cookie};
use crate::auth::flow::FlowError;
use crate::auth::middleware::identity_from_extensions;
use crate::auth::{VerifiedSession, found};
use crate::Result;

/// Query of `GET /authentication`.
#[derive(Debug, Deserialize)]
pub struct BeginParams {
    /// Base64 of the URI to return to after login
    pub requested_uri: Option<String>,
}

/// Query of `GET /redirect-call`.
#[derive(Debug, Deserialize)]
pub struct CallbackParams {
    /// Authorization code
    pub code: Option<String>,
    /// Echo of the requested URI
    pub state: Option<String>,
    /// Provider error code
    pub error: Option<String>,
    /// Provider error description
    pub error_description: Option<String>,
}

/// GET /authentication: send the browser to the identity provider.
pub async fn begin_auth(
    State(state): State<Arc<AppState>>,
    Query(params): Query<BeginParams>,
) -> Result<Response> {
    let url = state
        .auth
        .flow
        .authorization_url(params.requested_uri.as_deref())?;
    debug!(target = %url, "Starting login");
    Ok(found(url.as_str()))
}

/// GET /redirect-call: finish the login and set the session cookie.
pub async fn callback(
    State(state): State<Arc<AppState>>,
    Query(params): Query<CallbackParams>,
) -> Result<Response> {
    if let Some(error) = params.error.filter(|e| !e.is_empty()) {
        let detail = match params.error_description {
            Some(desc) if !desc.is_empty() => format!("{error}: {desc}"),
            _ => error,
        };
        audit::emit(&AuditEvent::login_failed(&detail));
        return Err(FlowError::Denied(detail).into());
    }

    let verified = match state
        .auth
        .flow
        .complete(params.code.as_deref(), params.state.as_deref())
        .await
    {
        Ok(verified) => verified,
        Err(e) => {
            warn!(stage = %e.stage(), error = %e, "Login callback failed");
            audit::emit(&AuditEvent::login_failed(e.to_string()));
            return Err(e.into());
        }
    };

    let claims = verified.claims();
    audit::emit(&AuditEvent::login(claims.username(), claims.email.as_deref()));

    let cookie = state.auth.flow.session_cookie(&verified);
    Ok((
        StatusCode::FOUND,
        [
            (header::SET_COOKIE, cookie),
            (header::LOCATION, verified.requested_uri().to_string()),
        ],
    )
        .into_response())
}

/// GET /logout: clear the session cookie.
pub async fn logout(
    State(state): State<Arc<AppState>>,
    headers: axum::http::HeaderMap,
) -> Response {
    let who = read_cookie(&headers, SESSION_COOKIE)
        .and_then(peek_unverified)
        .and_then(|claims| claims.display_name().map(str::to_string));
    audit::emit(&AuditEvent::logout(who.as_deref()));

    (
        StatusCode::OK,
        [(header::SET_COOKIE, state.auth.flow.logout_cookie())],
        Json(json!({})),
    )
        .into_response()
}

/// GET /token: the caller's token and identity.
///
/// `token` is null when the identity came from proxy headers.
pub async fn token(request: Request) -> Result<Json<serde_json::Value>> {
    let identity = identity_from_extensions(request.extensions())?;
    let token = request
        .extensions()
        .get::<VerifiedSession>()
        .map(|session| session.token.clone());
    Ok(Json(json!({
        "token": token,
        "username": identity.username,
        "email": identity.email,
    })))
}
