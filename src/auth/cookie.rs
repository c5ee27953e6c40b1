//! Session cookie helpers.

use axum::http::{HeaderMap, header};

/// Name of the cookie holding the raw ID token.
pub const SESSION_COOKIE: &str = "token";

/// `SameSite` attribute values.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SameSite {
    /// Sent on same-site requests and top-level navigations
    Lax,
    /// Same-site requests only
    Strict,
}

impl SameSite {
    fn as_str(self) -> &'static str {
        match self {
            Self::Lax => "Lax",
            Self::Strict => "Strict",
        }
    }
}

/// Attributes applied to every session cookie.
#[derive(Debug, Clone)]
pub struct CookieOptions {
    /// Emit `Secure`
    pub secure: bool,
    /// Cookie path
    pub path: String,
    /// `SameSite` policy; `Lax` keeps the post-login redirect working
    pub same_site: SameSite,
}

impl Default for CookieOptions {
    fn default() -> Self {
        Self {
            secure: true,
            path: "/".to_string(),
            same_site: SameSite::Lax,
        }
    }
}

/// `Set-Cookie` value storing `value` as the session cookie.
#[must_use]
pub fn build_set_cookie(value: &str, options: &CookieOptions) -> String {
    let mut cookie = format!(
        "{SESSION_COOKIE}={value}; Path={}; HttpOnly; SameSite={}",
        options.path,
        options.same_site.as_str()
    );
    if options.secure {
        cookie.push_str("; Secure");
    }
    cookie
}

/// `Set-Cookie` value that removes the session cookie.
#[must_use]
pub fn build_clear_cookie(options: &CookieOptions) -> String {
    let mut cookie = format!(
        "{SESSION_COOKIE}=; Path={}; Max-Age=0; Expires=Thu, 01 Jan 1970 00:00:00 GMT; HttpOnly; SameSite={}",
        options.path,
        options.same_site.as_str()
    );
    if options.secure {
        cookie.push_str("; Secure");
    }
    cookie
}

/// First non-empty value of cookie `name` across all `Cookie` headers.
#[must_use]
pub fn read_cookie<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get_all(header::COOKIE)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(';'))
        .filter_map(|pair| pair.trim().split_once('='))
        .find(|(key, value)| *key == name && !value.is_empty())
        .map(|(_, value)| value)
}
