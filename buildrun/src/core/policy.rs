//! Path policy for proposed file operations.
//!
//! The policy is built once per run from configuration and narrowed per phase
//! with the phase scope. It never touches the filesystem; the kernel calls it
//! before any checkpoint or write.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::core::path_pattern::{PatternError, PatternSet, normalize_path};

/// Paths no proposal may touch, internal mode included.
pub const ALWAYS_PROTECTED: &[&str] = &[".git/**", ".buildrun/**"];

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PolicyConfig {
    pub protected_paths: Vec<String>,
    /// Write allow-list. Empty means nothing is writable.
    pub allowed_paths: Vec<String>,
    pub internal_mode: bool,
    /// Protected paths that internal mode unlocks.
    pub internal_paths: Vec<String>,
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            protected_paths: Vec::new(),
            allowed_paths: vec!["**".to_string()],
            internal_mode: false,
            internal_paths: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ViolationRule {
    InvalidPath,
    AlwaysProtected,
    Protected,
    NotAllowed,
    OutOfScope,
    /// The path resolves through a symlink in the working tree.
    Symlink,
}

impl ViolationRule {
    pub fn as_str(self) -> &'static str {
        match self {
            ViolationRule::InvalidPath => "invalid path",
            ViolationRule::AlwaysProtected => "always protected",
            ViolationRule::Protected => "protected",
            ViolationRule::NotAllowed => "not in allowed paths",
            ViolationRule::OutOfScope => "outside phase scope",
            ViolationRule::Symlink => "crosses a symlink",
        }
    }
}

/// One path rejected by one rule.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyViolation {
    pub path: String,
    pub rule: ViolationRule,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pattern: Option<String>,
}

impl fmt::Display for PolicyViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.pattern {
            Some(pattern) => write!(f, "{} ({}: {pattern})", self.path, self.rule.as_str()),
            None => write!(f, "{} ({})", self.path, self.rule.as_str()),
        }
    }
}

#[derive(Debug, Clone)]
pub struct PatchPolicy {
    always_protected: PatternSet,
    protected: PatternSet,
    allowed: PatternSet,
    internal: PatternSet,
    internal_mode: bool,
    scope: Option<PatternSet>,
}

impl PatchPolicy {
    pub fn from_config(config: &PolicyConfig) -> Result<Self, PatternError> {
        Ok(Self {
            always_protected: PatternSet::parse(ALWAYS_PROTECTED)?,
            protected: PatternSet::parse(&config.protected_paths)?,
            allowed: PatternSet::parse(&config.allowed_paths)?,
            internal: PatternSet::parse(&config.internal_paths)?,
            internal_mode: config.internal_mode,
            scope: None,
        })
    }

    /// Narrow the policy to a phase scope. An empty scope leaves it unchanged.
    pub fn with_scope<S: AsRef<str>>(mut self, scope: &[S]) -> Result<Self, PatternError> {
        self.scope = if scope.is_empty() {
            None
        } else {
            Some(PatternSet::parse(scope)?)
        };
        Ok(self)
    }

    pub fn internal_mode(&self) -> bool {
        self.internal_mode
    }

    /// Check one raw path. Returns the first rule it breaks.
    pub fn check_path(&self, raw: &str) -> Result<String, PolicyViolation> {
        let violation = |path: &str, rule, pattern: Option<&str>| PolicyViolation {
            path: path.to_string(),
            rule,
            pattern: pattern.map(str::to_string),
        };

        let path = normalize_path(raw)
            .map_err(|_| violation(raw, ViolationRule::InvalidPath, None))?;

        if let Some(pattern) = self.always_protected.matching(&path).first() {
            return Err(violation(&path, ViolationRule::AlwaysProtected, Some(pattern)));
        }

        let unlocked = self.internal_mode && self.internal.matches_any(&path);
        if !unlocked && let Some(pattern) = self.protected.matching(&path).first() {
            return Err(violation(&path, ViolationRule::Protected, Some(pattern)));
        }

        if !self.allowed.matches_any(&path) {
            return Err(violation(&path, ViolationRule::NotAllowed, None));
        }

        if let Some(scope) = &self.scope
            && !scope.matches_any(&path)
        {
            return Err(violation(&path, ViolationRule::OutOfScope, None));
        }

        Ok(path)
    }

    /// Check every path and collect all violations, so a report names each
    /// offending path rather than the first.
    pub fn check_paths<'a, I>(&self, paths: I) -> Result<(), Vec<PolicyViolation>>
    where
        I: IntoIterator<Item = &'a str>,
    {
        let violations: Vec<PolicyViolation> = paths
            .into_iter()
            .filter_map(|p| self.check_path(p).err())
            .collect();
        if violations.is_empty() {
            Ok(())
        } else {
            Err(violations)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(protected: &[&str], allowed: &[&str]) -> PatchPolicy {
        PatchPolicy::from_config(&PolicyConfig {
            protected_paths: protected.iter().map(|s| s.to_string()).collect(),
            allowed_paths: allowed.iter().map(|s| s.to_string()).collect(),
            internal_mode: false,
            internal_paths: Vec::new(),
        })
        .expect("policy")
    }

    #[test]
    fn always_protected_wins_over_allow_all() {
        let p = policy(&[], &["**"]);
        let err = p.check_path(".git/config").expect_err("blocked");
        assert_eq!(err.rule, ViolationRule::AlwaysProtected);
        let err = p.check_path(".buildrun/state/run_state.json").expect_err("blocked");
        assert_eq!(err.rule, ViolationRule::AlwaysProtected);
    }

    #[test]
    fn protected_path_is_rejected_even_when_allowed() {
        let p = policy(&["src/core/**"], &["src/**"]);
        let err = p.check_path("src/core/policy.rs").expect_err("blocked");
        assert_eq!(err.rule, ViolationRule::Protected);
        assert_eq!(err.pattern.as_deref(), Some("src/core/**"));
        assert_eq!(p.check_path("src/io/git.rs").expect("ok"), "src/io/git.rs");
    }

    #[test]
    fn empty_allow_list_denies_everything() {
        let p = policy(&[], &[]);
        let err = p.check_path("README.md").expect_err("denied");
        assert_eq!(err.rule, ViolationRule::NotAllowed);
    }

    #[test]
    fn scope_narrows_allowed_paths() {
        let p = policy(&[], &["**"]).with_scope(&["web/**"]).expect("scope");
        assert!(p.check_path("web/app.tsx").is_ok());
        let err = p.check_path("server/main.rs").expect_err("out of scope");
        assert_eq!(err.rule, ViolationRule::OutOfScope);

        let unscoped = policy(&[], &["**"]).with_scope::<&str>(&[]).expect("scope");
        assert!(unscoped.check_path("server/main.rs").is_ok());
    }

    #[test]
    fn traversal_and_absolute_paths_are_invalid() {
        let p = policy(&[], &["**"]);
        assert_eq!(
            p.check_path("../outside.txt").expect_err("invalid").rule,
            ViolationRule::InvalidPath
        );
        assert_eq!(
            p.check_path("/etc/hosts").expect_err("invalid").rule,
            ViolationRule::InvalidPath
        );
    }

    #[test]
    fn internal_mode_unlocks_only_internal_paths() {
        let config = PolicyConfig {
            protected_paths: vec!["tools/**".to_string(), "ci/**".to_string()],
            allowed_paths: vec!["**".to_string()],
            internal_mode: true,
            internal_paths: vec!["tools/**".to_string(), ".git/**".to_string()],
        };
        let p = PatchPolicy::from_config(&config).expect("policy");
        assert!(p.check_path("tools/gen.py").is_ok());
        assert_eq!(
            p.check_path("ci/build.yml").expect_err("blocked").rule,
            ViolationRule::Protected
        );
        assert_eq!(
            p.check_path(".git/HEAD").expect_err("blocked").rule,
            ViolationRule::AlwaysProtected
        );

        let off = PatchPolicy::from_config(&PolicyConfig {
            internal_mode: false,
            ..config
        })
        .expect("policy");
        assert!(off.check_path("tools/gen.py").is_err());
    }

    #[test]
    fn check_paths_reports_every_violation_and_is_idempotent() {
        let p = policy(&["secrets/**"], &["**"]);
        let paths = ["src/ok.rs", "secrets/key.pem", ".git/HEAD"];
        let first = p.check_paths(paths).expect_err("violations");
        let second = p.check_paths(paths).expect_err("violations");
        assert_eq!(first.len(), 2);
        assert_eq!(first, second);
        assert!(p.check_paths(["src/ok.rs"]).is_ok());
    }

    mod properties {
        use proptest::prelude::*;

        use super::*;

        fn relative_path() -> impl Strategy<Value = String> {
            prop::collection::vec("[a-zA-Z0-9_.-]{1,8}", 1..5)
                .prop_filter("no dot segments", |segs| {
                    segs.iter().all(|s| s != "." && s != "..")
                })
                .prop_map(|segs| segs.join("/"))
        }

        proptest! {
            /// Nothing under an always-protected root is writable, whatever
            /// the configuration allows.
            #[test]
            fn always_protected_holds_for_any_config(
                root in prop_oneof![Just(".git"), Just(".buildrun")],
                rest in relative_path(),
                internal_mode in any::<bool>(),
            ) {
                let p = PatchPolicy::from_config(&PolicyConfig {
                    protected_paths: Vec::new(),
                    allowed_paths: vec!["**".to_string()],
                    internal_mode,
                    internal_paths: vec!["**".to_string()],
                })
                .expect("policy");
                let path = format!("{root}/{rest}");
                let err = p.check_path(&path).expect_err("protected");
                prop_assert_eq!(err.rule, ViolationRule::AlwaysProtected);
            }

            /// Same inputs, same verdict.
            #[test]
            fn verdicts_are_deterministic(
                path in relative_path(),
                scope in prop::option::of("[a-z]{1,4}/\\*\\*"),
            ) {
                let mut p = policy(&["secrets/**"], &["**"]);
                if let Some(scope) = scope {
                    p = p.with_scope(&[scope]).expect("scope");
                }
                prop_assert_eq!(p.check_path(&path), p.check_path(&path));
            }

            #[test]
            fn protected_prefix_always_violates(rest in relative_path()) {
                let p = policy(&["secrets/**"], &["**"]);
                let err = p.check_path(&format!("secrets/{rest}")).expect_err("protected");
                prop_assert_eq!(err.rule, ViolationRule::Protected);
            }
        }
    }
}
