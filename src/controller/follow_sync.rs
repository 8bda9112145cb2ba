//! Follow synchronization planning
//!
//! Diffs a node's desired follows against the sessions the follow-session
//! provider reports. Sessions are keyed by a normalized target so that
//! formatting differences do not cause churn. Applying the plan is the
//! caller's job.

use std::collections::{HashMap, HashSet};

use multiaddr::Multiaddr;
use reqwest::Url;
use thiserror::Error;

use crate::crd::FollowParams;

use super::runtime::FollowSession;

const URL_SCHEMES: [&str; 4] = ["http", "https", "ipfs", "ipns"];

/// Why a follow descriptor was rejected
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum FollowValidationError {
    #[error("follow target is empty")]
    EmptyTarget,

    #[error("invalid URL {url:?}: {reason}")]
    InvalidUrl { url: String, reason: String },

    #[error("unsupported URL scheme {0:?}")]
    UnsupportedScheme(String),

    #[error("URL {0:?} has no host")]
    MissingHost(String),

    #[error("invalid multiaddr {addr:?}: {reason}")]
    InvalidMultiaddr { addr: String, reason: String },

    #[error("follow target {0:?} is neither a URL, a multiaddr nor an identifier")]
    UnrecognizedTarget(String),

    #[error("follow name {0:?} must be a lowercase DNS label")]
    InvalidName(String),

    #[error("follow name {0:?} is already used by another follow")]
    DuplicateName(String),
}

/// A follow descriptor that failed validation
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InvalidFollow {
    pub name: String,
    pub message: String,
}

impl InvalidFollow {
    fn new(name: &str, error: FollowValidationError) -> Self {
        Self {
            name: name.to_string(),
            message: error.to_string(),
        }
    }
}

/// Parse a multiaddr, tolerating a trailing slash
fn parse_multiaddr(addr: &str) -> Result<Multiaddr, FollowValidationError> {
    let invalid = |reason: String| FollowValidationError::InvalidMultiaddr {
        addr: addr.to_string(),
        reason,
    };
    let parsed: Multiaddr = addr
        .trim_end_matches('/')
        .parse()
        .map_err(|e: multiaddr::Error| invalid(e.to_string()))?;
    if parsed.is_empty() {
        return Err(invalid("no protocols".to_string()));
    }
    Ok(parsed)
}

/// Normalize a follow target into its identity key
///
/// Accepts URLs, multiaddrs and bare identifiers (CIDs, peer IDs,
/// cluster names).
pub fn normalize_target(template: &str) -> Result<String, FollowValidationError> {
    let trimmed = template.trim();
    if trimmed.is_empty() {
        return Err(FollowValidationError::EmptyTarget);
    }

    if trimmed.contains("://") {
        let url = Url::parse(trimmed).map_err(|e| FollowValidationError::InvalidUrl {
            url: trimmed.to_string(),
            reason: e.to_string(),
        })?;
        if !URL_SCHEMES.contains(&url.scheme()) {
            return Err(FollowValidationError::UnsupportedScheme(url.scheme().to_string()));
        }
        if url.host_str().map_or(true, str::is_empty) {
            return Err(FollowValidationError::MissingHost(trimmed.to_string()));
        }
        return Ok(url.as_str().trim_end_matches('/').to_string());
    }

    if trimmed.starts_with('/') {
        return Ok(parse_multiaddr(trimmed)?.to_string());
    }

    if trimmed
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'))
    {
        return Ok(trimmed.to_string());
    }

    Err(FollowValidationError::UnrecognizedTarget(trimmed.to_string()))
}

fn is_dns_label(name: &str) -> bool {
    !name.is_empty()
        && name.len() <= 63
        && name
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
        && !name.starts_with('-')
        && !name.ends_with('-')
}

/// Validate one descriptor and turn it into the session it asks for
pub fn desired_session(follow: &FollowParams) -> Result<FollowSession, FollowValidationError> {
    if !is_dns_label(&follow.name) {
        return Err(FollowValidationError::InvalidName(follow.name.clone()));
    }
    Ok(FollowSession {
        name: follow.name.clone(),
        target: normalize_target(&follow.template)?,
        policy: follow.policy.clone(),
    })
}

/// What to change so established sessions match the desired follows
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct FollowPlan {
    /// Desired sessions that are not established
    pub add: Vec<FollowSession>,
    /// Established targets whose name or policy changed; restarted with the
    /// desired session
    pub update: Vec<FollowSession>,
    /// Targets of established sessions no longer desired
    pub remove: Vec<String>,
    /// Descriptors rejected by validation
    pub invalid: Vec<InvalidFollow>,
    /// Desired sessions already established as declared
    pub retained: usize,
}

impl FollowPlan {
    pub fn is_noop(&self) -> bool {
        self.add.is_empty() && self.update.is_empty() && self.remove.is_empty()
    }

    /// Number of valid, distinct desired sessions
    pub fn desired(&self) -> usize {
        self.add.len() + self.update.len() + self.retained
    }
}

/// Compute add, update and remove sets, keyed by normalized target
///
/// When several descriptors normalize to the same target the first one
/// wins. A name may only be used once, since sessions are stored by name.
/// Invalid descriptors are reported and otherwise ignored.
pub fn plan_follows(desired: &[FollowParams], established: &[FollowSession]) -> FollowPlan {
    let mut plan = FollowPlan::default();
    let by_target: HashMap<&str, &FollowSession> =
        established.iter().map(|s| (s.target.as_str(), s)).collect();
    let mut wanted: HashSet<String> = HashSet::new();
    let mut names: HashSet<&str> = HashSet::new();

    for follow in desired {
        let session = match desired_session(follow) {
            Ok(session) => session,
            Err(e) => {
                plan.invalid.push(InvalidFollow::new(&follow.name, e));
                continue;
            }
        };
        if !names.insert(follow.name.as_str()) {
            plan.invalid.push(InvalidFollow::new(
                &follow.name,
                FollowValidationError::DuplicateName(follow.name.clone()),
            ));
            continue;
        }
        if !wanted.insert(session.target.clone()) {
            continue;
        }
        match by_target.get(session.target.as_str()) {
            Some(current) if current.name == session.name && current.policy == session.policy => {
                plan.retained += 1
            }
            Some(_) => plan.update.push(session),
            None => plan.add.push(session),
        }
    }

    let mut removed = HashSet::new();
    for session in established {
        if !wanted.contains(&session.target) && removed.insert(session.target.as_str()) {
            plan.remove.push(session.target.clone());
        }
    }

    plan
}

/// Result of applying a [`FollowPlan`]
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct FollowOutcome {
    /// Follows requested by the spec, valid or not
    pub required: usize,
    /// Desired sessions that are established after this pass
    pub established: usize,
    /// Sessions that could not be created, with the error
    pub failed: Vec<(String, String)>,
    pub invalid: Vec<InvalidFollow>,
}

impl FollowOutcome {
    /// No follows were requested
    pub fn none() -> Self {
        Self::default()
    }

    /// Readiness is blocked only when follows were requested and none is up
    pub fn is_blocking(&self) -> bool {
        self.required > 0 && self.established == 0
    }

    pub fn is_complete(&self) -> bool {
        self.failed.is_empty() && self.invalid.is_empty() && self.established == self.required
    }

    /// Blocked because of invalid descriptors alone
    pub fn blocked_by_config(&self) -> bool {
        self.is_blocking() && self.failed.is_empty() && !self.invalid.is_empty()
    }

    pub fn summary(&self) -> String {
        if self.required == 0 {
            return "no follows requested".to_string();
        }
        let mut msg = format!("{}/{} follows established", self.established, self.required);
        for (name, err) in &self.failed {
            msg.push_str(&format!("; {name}: {err}"));
        }
        for invalid in &self.invalid {
            msg.push_str(&format!("; {}: {}", invalid.name, invalid.message));
        }
        msg
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::SyncPolicy;

    fn follow(name: &str, template: &str) -> FollowParams {
        FollowParams {
            name: name.to_string(),
            template: template.to_string(),
            policy: SyncPolicy::Continuous,
        }
    }

    fn established(plan: &FollowPlan, previous: &[FollowSession]) -> Vec<FollowSession> {
        let mut sessions: Vec<FollowSession> = previous
            .iter()
            .filter(|s| {
                !plan.remove.contains(&s.target) && !plan.update.iter().any(|u| u.target == s.target)
            })
            .cloned()
            .collect();
        sessions.extend(plan.update.iter().cloned());
        sessions.extend(plan.add.iter().cloned());
        sessions
    }

    #[test]
    fn test_normalize_url() {
        assert_eq!(
            normalize_target("HTTPS://Collab.Example.org/").unwrap(),
            "https://collab.example.org"
        );
        assert_eq!(
            normalize_target(" https://collab.example.org/cluster/ ").unwrap(),
            "https://collab.example.org/cluster"
        );
        assert!(normalize_target("ftp://collab.example.org").is_err());
    }

    #[test]
    fn test_normalize_multiaddr() {
        assert_eq!(
            normalize_target(" /dns4/collab.example.org/tcp/9096/ ").unwrap(),
            "/dns4/collab.example.org/tcp/9096"
        );
        assert_eq!(
            normalize_target("/ip4/10.0.0.1/tcp/9096").unwrap(),
            "/ip4/10.0.0.1/tcp/9096"
        );
        assert!(normalize_target("/dns4").is_err());
        assert!(normalize_target("/").is_err());
    }

    #[test]
    fn test_rejects_malformed_multiaddr() {
        for addr in ["/not-a-proto/x", "/ip4/999.1.1.1/tcp/abc", "/ip4/10.0.0.1/tcp/70000"] {
            assert!(
                matches!(
                    normalize_target(addr),
                    Err(FollowValidationError::InvalidMultiaddr { .. })
                ),
                "{addr} should be rejected"
            );
        }
    }

    #[test]
    fn test_validation_errors_are_typed() {
        assert_eq!(normalize_target("  "), Err(FollowValidationError::EmptyTarget));
        assert_eq!(
            normalize_target("ftp://collab.example.org"),
            Err(FollowValidationError::UnsupportedScheme("ftp".to_string()))
        );
        assert_eq!(
            normalize_target("not a target"),
            Err(FollowValidationError::UnrecognizedTarget("not a target".to_string()))
        );
        assert_eq!(
            desired_session(&follow("Bad_Name", "collab")).unwrap_err(),
            FollowValidationError::InvalidName("Bad_Name".to_string())
        );
    }

    #[test]
    fn test_normalize_identifier() {
        assert_eq!(normalize_target("collab.ipfscluster.io").unwrap(), "collab.ipfscluster.io");
        assert!(normalize_target("not a target").is_err());
        assert!(normalize_target("").is_err());
    }

    #[test]
    fn test_plan_adds_missing_and_removes_stale() {
        let existing = vec![FollowSession {
            name: "old".to_string(),
            target: "old-cluster".to_string(),
            policy: SyncPolicy::Continuous,
        }];
        let plan = plan_follows(&[follow("collab", "collab-cluster")], &existing);
        assert_eq!(plan.add.len(), 1);
        assert_eq!(plan.add[0].target, "collab-cluster");
        assert_eq!(plan.remove, vec!["old-cluster".to_string()]);
        assert_eq!(plan.retained, 0);
    }

    #[test]
    fn test_equivalent_formatting_is_same_entry() {
        let existing = vec![FollowSession {
            name: "collab".to_string(),
            target: "https://collab.example.org".to_string(),
            policy: SyncPolicy::Continuous,
        }];
        let plan = plan_follows(&[follow("collab", "https://COLLAB.example.org/")], &existing);
        assert!(plan.is_noop());
        assert_eq!(plan.retained, 1);
    }

    #[test]
    fn test_second_pass_is_empty() {
        let desired = vec![
            follow("a", "https://a.example.org"),
            follow("b", "/dns4/b.example.org/tcp/9096"),
        ];
        let first = plan_follows(&desired, &[]);
        assert_eq!(first.add.len(), 2);

        let sessions = established(&first, &[]);
        let second = plan_follows(&desired, &sessions);
        assert!(second.add.is_empty());
        assert!(second.remove.is_empty());
        assert_eq!(second.retained, 2);
    }

    #[test]
    fn test_invalid_descriptor_does_not_block_others() {
        let desired = vec![
            follow("Bad_Name", "https://a.example.org"),
            follow("ok", "https://b.example.org"),
            follow("broken", "::::"),
        ];
        let plan = plan_follows(&desired, &[]);
        assert_eq!(plan.add.len(), 1);
        assert_eq!(plan.add[0].name, "ok");
        let invalid: Vec<_> = plan.invalid.iter().map(|i| i.name.as_str()).collect();
        assert_eq!(invalid, vec!["Bad_Name", "broken"]);
    }

    #[test]
    fn test_duplicate_targets_first_wins() {
        let desired = vec![
            follow("first", "https://a.example.org"),
            follow("second", "https://a.example.org/"),
        ];
        let plan = plan_follows(&desired, &[]);
        assert_eq!(plan.add.len(), 1);
        assert_eq!(plan.add[0].name, "first");
        assert_eq!(plan.desired(), 1);
    }

    #[test]
    fn test_duplicate_names_rejected() {
        let desired = vec![
            follow("collab", "https://a.example.org"),
            follow("collab", "https://b.example.org"),
        ];
        let plan = plan_follows(&desired, &[]);
        assert_eq!(plan.add.len(), 1);
        assert_eq!(plan.add[0].target, "https://a.example.org");
        assert_eq!(plan.invalid.len(), 1);
        assert_eq!(plan.invalid[0].name, "collab");
        assert!(plan.invalid[0].message.contains("already used"));

        let sessions = established(&plan, &[]);
        let second = plan_follows(&desired, &sessions);
        assert!(second.is_noop());
        assert_eq!(second.retained, 1);
    }

    #[test]
    fn test_policy_change_updates_session() {
        let existing = vec![FollowSession {
            name: "collab".to_string(),
            target: "https://collab.example.org".to_string(),
            policy: SyncPolicy::Continuous,
        }];
        let mut changed = follow("collab", "https://collab.example.org");
        changed.policy = SyncPolicy::Periodic {
            interval_seconds: 600,
        };

        let plan = plan_follows(&[changed.clone()], &existing);
        assert!(!plan.is_noop());
        assert!(plan.add.is_empty());
        assert!(plan.remove.is_empty());
        assert_eq!(plan.update.len(), 1);
        assert_eq!(plan.update[0].policy, changed.policy);
        assert_eq!(plan.desired(), 1);

        let sessions = established(&plan, &existing);
        assert!(plan_follows(&[changed], &sessions).is_noop());
    }

    #[test]
    fn test_rename_updates_session() {
        let existing = vec![FollowSession {
            name: "old".to_string(),
            target: "collab".to_string(),
            policy: SyncPolicy::Continuous,
        }];
        let plan = plan_follows(&[follow("new", "collab")], &existing);
        assert_eq!(plan.update.len(), 1);
        assert_eq!(plan.update[0].name, "new");
        assert_eq!(plan.retained, 0);
    }

    #[test]
    fn test_outcome_blocking_rules() {
        assert!(!FollowOutcome::none().is_blocking());

        let partial = FollowOutcome {
            required: 2,
            established: 1,
            failed: vec![("b".to_string(), "unreachable".to_string())],
            invalid: vec![],
        };
        assert!(!partial.is_blocking());
        assert!(!partial.is_complete());
        assert!(partial.summary().contains("1/2 follows established"));
        assert!(partial.summary().contains("b: unreachable"));

        let none_up = FollowOutcome {
            required: 1,
            established: 0,
            failed: vec![],
            invalid: vec![InvalidFollow {
                name: "a".to_string(),
                message: "bad".to_string(),
            }],
        };
        assert!(none_up.is_blocking());
        assert!(none_up.blocked_by_config());
    }
}
