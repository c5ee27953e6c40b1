//! RBAC decisions backed by a Casbin model and a CSV policy.
//!
//! The policy file uses Casbin's CSV layout, one rule per line:
//!
//! ```text
//! p, admin, /core/*, (GET)|(POST)|(DELETE)
//! g, alice, admin
//! ```
//!
//! Rules are loaded into an in-memory adapter once at startup; the enforcer
//! is read-only afterwards.

use std::path::{Path, PathBuf};

use casbin::{CoreApi, DefaultModel, Enforcer, MemoryAdapter, MgmtApi};
use tracing::{debug, info};

/// Policy load and evaluation failures.
#[derive(Debug, thiserror::Error)]
pub enum PolicyError {
    /// Model or policy file unreadable.
    #[error("failed to read {}: {source}", path.display())]
    Read {
        /// File that failed
        path: PathBuf,
        /// Underlying IO error
        source: std::io::Error,
    },

    /// Malformed policy line.
    #[error("invalid policy line {line}: {reason}")]
    Syntax {
        /// 1-based line number
        line: usize,
        /// What is wrong
        reason: String,
    },

    /// Model text rejected or rule insertion failed.
    #[error("invalid RBAC model or policy: {0}")]
    Model(String),

    /// The engine failed while evaluating a request.
    #[error("could not enforce: {0}")]
    Enforcement(String),
}

/// Casbin-backed `(subject, resource, action)` decisions.
pub struct PolicyEnforcer {
    enforcer: Enforcer,
    rules: usize,
}

impl PolicyEnforcer {
    /// Load the model and policy from files.
    ///
    /// # Errors
    ///
    /// Returns [`PolicyError`] if either file is unreadable or invalid.
    pub async fn from_files(model: &Path, policy: &Path) -> Result<Self, PolicyError> {
        let model_text = read(model).await?;
        let policy_text = read(policy).await?;
        let enforcer = Self::from_parts(&model_text, &policy_text).await?;
        info!(
            model = %model.display(),
            policy = %policy.display(),
            rules = enforcer.rules,
            "RBAC policy loaded"
        );
        Ok(enforcer)
    }

    /// Build from model and policy text.
    ///
    /// # Errors
    ///
    /// Returns [`PolicyError`] if the model does not parse or a policy line is
    /// malformed.
    pub async fn from_parts(model_text: &str, policy_text: &str) -> Result<Self, PolicyError> {
        let model = DefaultModel::from_str(model_text)
            .await
            .map_err(|e| PolicyError::Model(e.to_string()))?;
        let mut enforcer = Enforcer::new(model, MemoryAdapter::default())
            .await
            .map_err(|e| PolicyError::Model(e.to_string()))?;

        let mut rules = 0;
        for (index, raw) in policy_text.lines().enumerate() {
            let Some(rule) = parse_line(index + 1, raw)? else {
                continue;
            };
            let added = if rule.ptype.starts_with('g') {
                enforcer
                    .add_named_grouping_policy(&rule.ptype, rule.fields)
                    .await
            } else {
                enforcer.add_named_policy(&rule.ptype, rule.fields).await
            };
            if added.map_err(|e| PolicyError::Model(e.to_string()))? {
                rules += 1;
            } else {
                debug!(line = index + 1, "Duplicate policy rule ignored");
            }
        }

        enforcer
            .build_role_links()
            .map_err(|e| PolicyError::Model(e.to_string()))?;
        Ok(Self { enforcer, rules })
    }

    /// Decide whether `subject` may perform `action` on `resource`.
    ///
    /// `Ok(false)` is a denial; `Err` means no decision could be made.
    ///
    /// # Errors
    ///
    /// Returns [`PolicyError::Enforcement`] if the engine fails.
    pub fn enforce(&self, subject: &str, resource: &str, action: &str) -> Result<bool, PolicyError> {
        let allowed = self
            .enforcer
            .enforce((subject, resource, action))
            .map_err(|e| PolicyError::Enforcement(e.to_string()))?;
        debug!(subject, resource, action, allowed, "RBAC decision");
        Ok(allowed)
    }

    /// Number of rules loaded.
    #[must_use]
    pub fn rule_count(&self) -> usize {
        self.rules
    }
}

struct PolicyLine {
    ptype: String,
    fields: Vec<String>,
}

fn parse_line(line: usize, raw: &str) -> Result<Option<PolicyLine>, PolicyError> {
    let trimmed = raw.trim();
    if trimmed.is_empty() || trimmed.starts_with('#') {
        return Ok(None);
    }

    let mut parts = trimmed.split(',').map(str::trim);
    let ptype = parts.next().unwrap_or_default().to_string();
    if !(ptype.starts_with('p') || ptype.starts_with('g')) {
        return Err(PolicyError::Syntax {
            line,
            reason: format!("unknown rule type {ptype:?}"),
        });
    }

    let fields: Vec<String> = parts.map(str::to_string).collect();
    if fields.len() < 2 || fields.iter().any(String::is_empty) {
        return Err(PolicyError::Syntax {
            line,
            reason: "expected at least two non-empty fields".to_string(),
        });
    }
    Ok(Some(PolicyLine { ptype, fields }))
}

async fn read(path: &Path) -> Result<String, PolicyError> {
    tokio::fs::read_to_string(path)
        .await
        .map_err(|source| PolicyError::Read {
            path: path.to_path_buf(),
            source,
        })
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) const MODEL: &str = r#"
[request_definition]
r = sub, obj, act

[policy_definition]
p = sub, obj, act

[role_definition]
g = _, _

[policy_effect]
e = some(where (p.eft == allow))

[matchers]
m = g(r.sub, p.sub) && keyMatch2(r.obj, p.obj) && regexMatch(r.act, p.act)
"#;

    pub(crate) const POLICY: &str = "
# operators manage cores
p, operator, /core/, POST
p, operator, /core/:id, (GET)|(DELETE)
p, operator, /cores/, GET
p, viewer, /cores/, GET
p, viewer, /token, GET
p, operator, /token, GET

g, alice, operator
g, bob, viewer
";

    async fn enforcer() -> PolicyEnforcer {
        PolicyEnforcer::from_parts(MODEL, POLICY).await.unwrap()
    }

    #[tokio::test]
    async fn role_members_inherit_permissions() {
        let e = enforcer().await;
        assert!(e.enforce("alice", "/core/", "POST").unwrap());
        assert!(e.enforce("alice", "/core/7c1e", "DELETE").unwrap());
        assert!(e.enforce("bob", "/cores/", "GET").unwrap());
        assert_eq!(e.rule_count(), 8);
    }

    #[tokio::test]
    async fn duplicate_rules_are_counted_once() {
        let policy = format!("{POLICY}\np, viewer, /token, GET\ng, bob, viewer\n");
        let e = PolicyEnforcer::from_parts(MODEL, &policy).await.unwrap();
        assert_eq!(e.rule_count(), 8);
        assert!(e.enforce("bob", "/token", "GET").unwrap());
    }

    #[tokio::test]
    async fn unmatched_requests_are_denied_not_errors() {
        let e = enforcer().await;
        assert!(!e.enforce("bob", "/core/", "POST").unwrap());
        assert!(!e.enforce("bob", "/core/7c1e", "DELETE").unwrap());
        assert!(!e.enforce("mallory", "/cores/", "GET").unwrap());
    }

    #[tokio::test]
    async fn malformed_policy_line_reports_its_number() {
        let err = PolicyEnforcer::from_parts(MODEL, "p, alice, /x, GET\nx, nope, nope\n")
            .await
            .err()
            .unwrap();
        assert!(matches!(err, PolicyError::Syntax { line: 2, .. }));
    }

    #[tokio::test]
    async fn path_parameters_match_a_single_segment() {
        let e = enforcer().await;
        assert!(e.enforce("alice", "/core/abc", "GET").unwrap());
        assert!(!e.enforce("alice", "/core/abc/extra", "GET").unwrap());
    }

    #[tokio::test]
    async fn loads_from_files() {
        let dir = tempfile::tempdir().unwrap();
        let model = dir.path().join("model.conf");
        let policy = dir.path().join("policy.csv");
        std::fs::write(&model, MODEL).unwrap();
        std::fs::write(&policy, POLICY).unwrap();

        let e = PolicyEnforcer::from_files(&model, &policy).await.unwrap();
        assert!(e.enforce("alice", "/cores/", "GET").unwrap());

        let missing = PolicyEnforcer::from_files(&dir.path().join("nope.conf"), &policy).await;
        assert!(matches!(missing, Err(PolicyError::Read { .. })));
    }
}
