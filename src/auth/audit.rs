//! Structured audit events for logins, rejected sessions and RBAC denials.
//!
//! Events go to the `audit` tracing target as one JSON blob:
//!
//! ```text
//! INFO audit: audit={"event":"access.denied","username":"bob",...}
//! ```

use serde::Serialize;

use super::claims::Identity;
use super::verifier::VerifyCode;

/// One auditable authentication or authorization outcome.
#[derive(Debug, Clone, Serialize)]
pub struct AuditEvent {
    /// Event type, e.g. `"login.succeeded"`
    pub event: &'static str,
    /// Verified subject username
    #[serde(skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    /// Username read from a token whose signature was not (or could not be)
    /// verified; never a proven identity
    #[serde(skip_serializing_if = "Option::is_none")]
    pub claimed_username: Option<String>,
    /// Subject email, when known
    #[serde(skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    /// HTTP method
    #[serde(skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,
    /// Request path
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    /// Verification outcome
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<VerifyCode>,
    /// Free-form reason
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl AuditEvent {
    fn new(event: &'static str) -> Self {
        Self {
            event,
            username: None,
            claimed_username: None,
            email: None,
            method: None,
            path: None,
            code: None,
            reason: None,
        }
    }

    /// Construct a `login.succeeded` event.
    #[must_use]
    pub fn login(username: Option<&str>, email: Option<&str>) -> Self {
        Self {
            username: username.map(str::to_string),
            email: email.map(str::to_string),
            ..Self::new("login.succeeded")
        }
    }

    /// Construct a `login.failed` event.
    #[must_use]
    pub fn login_failed(reason: impl Into<String>) -> Self {
        Self {
            reason: Some(reason.into()),
            ..Self::new("login.failed")
        }
    }

    /// Construct a `session.rejected` event (token failed verification).
    #[must_use]
    pub fn session_rejected(code: VerifyCode, path: &str, claimed: Option<&str>) -> Self {
        Self {
            claimed_username: claimed.map(str::to_string),
            path: Some(path.to_string()),
            code: Some(code),
            ..Self::new("session.rejected")
        }
    }

    /// Construct an `access.denied` event (RBAC said no).
    #[must_use]
    pub fn denied(identity: &Identity, method: &str, path: &str) -> Self {
        Self {
            username: Some(identity.username.clone()),
            email: Some(identity.email.clone()),
            method: Some(method.to_string()),
            path: Some(path.to_string()),
            ..Self::new("access.denied")
        }
    }

    /// Construct a `logout` event; the name comes from the unverified cookie.
    #[must_use]
    pub fn logout(claimed: Option<&str>) -> Self {
        Self {
            claimed_username: claimed.map(str::to_string),
            ..Self::new("logout")
        }
    }
}

/// Emit an audit event on the `audit` target.
pub fn emit(event: &AuditEvent) {
    match serde_json::to_string(event) {
        Ok(ref json) => tracing::info!(target: "audit", audit = %json, "auth audit"),
        Err(ref e) => tracing::warn!(error = %e, "Failed to serialize audit event"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn identity() -> Identity {
        Identity {
            username: "bob".to_string(),
            email: "bob@example.com".to_string(),
        }
    }

    #[test]
    fn denied_event_names_subject_and_request() {
        // GIVEN/WHEN: build a denied event
        let event = AuditEvent::denied(&identity(), "DELETE", "/core/abc");

        // THEN: who and what are recorded
        assert_eq!(event.event, "access.denied");
        assert_eq!(event.username.as_deref(), Some("bob"));
        assert_eq!(event.method.as_deref(), Some("DELETE"));
        assert_eq!(event.path.as_deref(), Some("/core/abc"));
    }

    #[test]
    fn rejected_session_serializes_code() {
        let event = AuditEvent::session_rejected(VerifyCode::TokenExpired, "/cores/", None);
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event"], "session.rejected");
        assert_eq!(json["code"], "TOKEN_EXPIRED");
        assert!(json.get("username").is_none());
    }

    #[test]
    fn rejected_session_keeps_claimed_name_apart_from_verified_username() {
        // GIVEN: a token that failed verification but names "alice"
        let event =
            AuditEvent::session_rejected(VerifyCode::InvalidToken, "/cores/", Some("alice"));

        // WHEN: serialized for the audit log
        let json = serde_json::to_value(&event).unwrap();

        // THEN: the name is only recorded as claimed
        assert_eq!(json["claimed_username"], "alice");
        assert!(json.get("username").is_none());
    }

    #[test]
    fn logout_records_claimed_name_only() {
        let json = serde_json::to_value(AuditEvent::logout(Some("bob"))).unwrap();
        assert_eq!(json["claimed_username"], "bob");
        assert!(json.get("username").is_none());
    }

    #[test]
    fn emit_does_not_panic() {
        emit(&AuditEvent::login_failed("bad state"));
        emit(&AuditEvent::logout(Some("bob")));
        emit(&AuditEvent::login(Some("bob"), Some("bob@example.com")));
    }
}
