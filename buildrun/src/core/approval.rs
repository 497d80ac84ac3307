//! Human approval gate: which payloads need sign-off, how a payload is
//! fingerprinted, and whether a stored approval authorizes it.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::core::path_pattern::{PatternError, PatternSet};
use crate::core::types::{ApprovalRequest, ApprovalStatus, FileOpKind, PlannedWrite};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ApprovalRules {
    /// Writes to paths matching any of these need approval.
    pub require_for: Vec<String>,
    /// Any delete needs approval.
    pub require_on_delete: bool,
    /// Phase ids that always need approval.
    pub phases: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct ApprovalPolicy {
    paths: PatternSet,
    require_on_delete: bool,
    phases: Vec<String>,
}

impl ApprovalPolicy {
    pub fn from_rules(rules: &ApprovalRules) -> Result<Self, PatternError> {
        Ok(Self {
            paths: PatternSet::parse(&rules.require_for)?,
            require_on_delete: rules.require_on_delete,
            phases: rules.phases.clone(),
        })
    }

    pub fn requires_approval(&self, phase_id: &str, writes: &[PlannedWrite]) -> bool {
        if self.phases.iter().any(|p| p == phase_id) {
            return true;
        }
        writes.iter().filter(|w| !w.is_noop()).any(|w| {
            (self.require_on_delete && w.kind == FileOpKind::Delete)
                || self.paths.matches_any(&w.path)
        })
    }
}

/// Fingerprint of the exact change about to execute. Any difference in
/// phase, revision, paths, kinds or resulting bytes changes the hash.
pub fn payload_hash(phase_id: &str, revision_epoch: u32, writes: &[PlannedWrite]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(b"buildrun-payload-v1\0");
    hasher.update(phase_id.as_bytes());
    hasher.update(b"\0");
    hasher.update(revision_epoch.to_le_bytes());
    for write in writes.iter().filter(|w| !w.is_noop()) {
        hasher.update(write.path.as_bytes());
        hasher.update(b"\0");
        hasher.update(write.kind.as_str().as_bytes());
        hasher.update(b"\0");
        match &write.after {
            Some(after) => {
                hasher.update((after.len() as u64).to_le_bytes());
                hasher.update(after.as_bytes());
            }
            None => hasher.update(b"DELETED"),
        }
        hasher.update(b"\0");
    }
    hex::encode(hasher.finalize())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Authorization {
    Authorized,
    Pending,
    Denied,
    TimedOut,
    /// The stored hash belongs to a different payload.
    Stale,
}

/// An approval authorizes only while APPROVED and bound to `expected_hash`.
pub fn authorize(request: &ApprovalRequest, expected_hash: &str) -> Authorization {
    if request.payload_hash != expected_hash {
        return Authorization::Stale;
    }
    match request.status {
        ApprovalStatus::Approved => Authorization::Authorized,
        ApprovalStatus::Pending => Authorization::Pending,
        ApprovalStatus::Denied => Authorization::Denied,
        ApprovalStatus::TimedOut => Authorization::TimedOut,
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use super::*;

    fn write(path: &str, after: Option<&str>) -> PlannedWrite {
        PlannedWrite {
            path: path.to_string(),
            kind: if after.is_some() {
                FileOpKind::Modify
            } else {
                FileOpKind::Delete
            },
            before: Some("old".to_string()),
            after: after.map(str::to_string),
        }
    }

    fn request(hash: &str, status: ApprovalStatus) -> ApprovalRequest {
        ApprovalRequest {
            id: "apr-1".to_string(),
            phase_id: "p1".to_string(),
            payload_hash: hash.to_string(),
            requested_at: Utc::now(),
            approved_at: None,
            status,
        }
    }

    #[test]
    fn hash_changes_with_content_and_epoch() {
        let a = payload_hash("p1", 0, &[write("x.rs", Some("one"))]);
        assert_eq!(a, payload_hash("p1", 0, &[write("x.rs", Some("one"))]));
        assert_ne!(a, payload_hash("p1", 0, &[write("x.rs", Some("two"))]));
        assert_ne!(a, payload_hash("p1", 1, &[write("x.rs", Some("one"))]));
        assert_ne!(a, payload_hash("p2", 0, &[write("x.rs", Some("one"))]));
        assert_eq!(a.len(), 64);
    }

    #[test]
    fn approved_with_matching_hash_authorizes() {
        let hash = payload_hash("p1", 0, &[write("x.rs", Some("one"))]);
        assert_eq!(
            authorize(&request(&hash, ApprovalStatus::Approved), &hash),
            Authorization::Authorized
        );
    }

    #[test]
    fn approved_with_mismatched_hash_never_authorizes() {
        let approved = payload_hash("p1", 0, &[write("x.rs", Some("one"))]);
        let about_to_run = payload_hash("p1", 0, &[write("x.rs", Some("one!"))]);
        assert_eq!(
            authorize(&request(&approved, ApprovalStatus::Approved), &about_to_run),
            Authorization::Stale
        );
    }

    #[test]
    fn non_approved_statuses_map_through() {
        let h = "abc";
        assert_eq!(authorize(&request(h, ApprovalStatus::Pending), h), Authorization::Pending);
        assert_eq!(authorize(&request(h, ApprovalStatus::Denied), h), Authorization::Denied);
        assert_eq!(authorize(&request(h, ApprovalStatus::TimedOut), h), Authorization::TimedOut);
    }

    #[test]
    fn requirement_rules() {
        let policy = ApprovalPolicy::from_rules(&ApprovalRules {
            require_for: vec!["deploy/**".to_string()],
            require_on_delete: true,
            phases: vec!["release".to_string()],
        })
        .expect("rules");
        assert!(policy.requires_approval("release", &[]));
        assert!(policy.requires_approval("p1", &[write("deploy/app.yaml", Some("x"))]));
        assert!(policy.requires_approval("p1", &[write("src/lib.rs", None)]));
        assert!(!policy.requires_approval("p1", &[write("src/lib.rs", Some("x"))]));

        let none = ApprovalPolicy::from_rules(&ApprovalRules::default()).expect("rules");
        assert!(!none.requires_approval("release", &[write("deploy/app.yaml", None)]));
    }
}
