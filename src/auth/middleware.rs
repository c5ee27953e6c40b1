//! Authentication and RBAC middleware.
//!
//! Layer order on protected routes is authentication first, then RBAC:
//!
//! - [`auth_middleware`] establishes who is calling. In `jwt` mode it verifies
//!   the `token` cookie and redirects to login on any client-side failure; a
//!   key-set failure is a 500 instead. In `proxy_headers` mode it trusts the
//!   upstream identity headers and answers 401 when they are missing.
//! - [`role_middleware`] asks the enforcer whether that identity may use the
//!   request method on the request path.
//!
//! Both pass public paths straight through.

use std::sync::Arc;

use axum::{
    body::Body,
    extract::{OriginalUri, State},
    http::{Extensions, Request},
    middleware::Next,
    response::{IntoResponse, Response},
};
use tracing::{debug, error, warn};

use super::audit::{self, AuditEvent};
use super::claims::{Identity, peek_unverified};
use super::cookie::{SESSION_COOKIE, read_cookie};
use super::{AuthContext, VerifiedSession};
use crate::config::IdentitySource;
use crate::{Error, Result};

/// Authentication middleware.
pub async fn auth_middleware(
    State(auth): State<Arc<AuthContext>>,
    mut request: Request<Body>,
    next: Next,
) -> Response {
    let path = request.uri().path().to_string();
    if auth.is_public_path(&path) {
        debug!(path = %path, "Public path, skipping authentication");
        return next.run(request).await;
    }

    match auth.identity_source {
        IdentitySource::ProxyHeaders => match auth.identity_from_headers(request.headers()) {
            Some(identity) => {
                debug!(username = %identity.username, "Identity from proxy headers");
                request.extensions_mut().insert(identity);
                next.run(request).await
            }
            None => {
                warn!(path = %path, "Proxy identity headers missing");
                Error::Unauthenticated("missing authenticated identity".to_string()).into_response()
            }
        },
        IdentitySource::Jwt => {
            let requested_uri = requested_uri(&request);
            let Some(token) = read_cookie(request.headers(), SESSION_COOKIE).map(str::to_owned)
            else {
                debug!(path = %path, "No session cookie, redirecting to login");
                return auth.login_redirect(&requested_uri);
            };

            match auth.verifier.verify(&token).await {
                Ok(claims) => {
                    request
                        .extensions_mut()
                        .insert(VerifiedSession { token, claims });
                    next.run(request).await
                }
                Err(e) if e.requires_reauthentication() => {
                    let peeked = peek_unverified(&token);
                    let claimed = peeked.as_ref().and_then(|c| c.display_name());
                    warn!(
                        path = %path,
                        claimed_user = ?claimed,
                        code = ?e.code(),
                        error = %e,
                        "Session rejected, redirecting to login"
                    );
                    audit::emit(&AuditEvent::session_rejected(e.code(), &path, claimed));
                    auth.login_redirect(&requested_uri)
                }
                Err(e) => {
                    error!(path = %path, error = %e, "Token verification unavailable");
                    Error::Verify(e).into_response()
                }
            }
        }
    }
}

/// RBAC middleware. Must run after [`auth_middleware`].
pub async fn role_middleware(
    State(auth): State<Arc<AuthContext>>,
    request: Request<Body>,
    next: Next,
) -> Response {
    let path = request.uri().path().to_string();
    if auth.is_public_path(&path) {
        return next.run(request).await;
    }

    let identity = match identity_from_extensions(request.extensions()) {
        Ok(identity) => identity,
        Err(e) => {
            error!(path = %path, error = %e, "No usable identity for RBAC");
            return e.into_response();
        }
    };

    let method = request.method().as_str().to_string();
    match auth.enforcer.enforce(&identity.username, &path, &method) {
        Ok(true) => next.run(request).await,
        Ok(false) => {
            warn!(username = %identity.username, method = %method, path = %path, "Access denied");
            audit::emit(&AuditEvent::denied(&identity, &method, &path));
            Error::Forbidden("access denied".to_string()).into_response()
        }
        Err(e) => Error::Policy(e).into_response(),
    }
}

/// Identity established by [`auth_middleware`] for this request.
///
/// # Errors
///
/// Returns [`Error::Claims`] when a verified token lacks username or email,
/// and [`Error::Internal`] when authentication did not run.
pub fn identity_from_extensions(extensions: &Extensions) -> Result<Identity> {
    if let Some(identity) = extensions.get::<Identity>() {
        return Ok(identity.clone());
    }
    if let Some(session) = extensions.get::<VerifiedSession>() {
        return Ok(Identity::from_claims(&session.claims)?);
    }
    Err(Error::Internal(
        "no authenticated identity on request".to_string(),
    ))
}

/// Full URI as the client sent it, including any base path.
fn requested_uri(request: &Request<Body>) -> String {
    let uri = request
        .extensions()
        .get::<OriginalUri>()
        .map_or_else(|| request.uri(), |original| &original.0);
    uri.path_and_query()
        .map_or_else(|| uri.path().to_string(), |pq| pq.as_str().to_string())
}
