//! Writes planned file changes to the working tree.
//!
//! Every write goes through a temp file and a rename. If a later write
//! fails, the earlier ones are reverted from their recorded `before` text,
//! so a failed apply leaves the tree as it found it.

use std::collections::BTreeMap;
use std::fs;
use std::io::ErrorKind;
use std::path::{Component, Path, PathBuf};

use tracing::{debug, error, instrument, warn};

use crate::core::policy::{PolicyViolation, ViolationRule};
use crate::core::types::{ApplyFailure, PlannedWrite};
use crate::io::init::write_atomic;

#[derive(Debug, Clone)]
pub struct ApplyEngine {
    root: PathBuf,
}

impl ApplyEngine {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Current text of each path, `None` for paths that do not exist.
    pub fn read_originals<'a, I>(
        &self,
        paths: I,
    ) -> Result<BTreeMap<String, Option<String>>, ApplyFailure>
    where
        I: IntoIterator<Item = &'a str>,
    {
        let mut originals = BTreeMap::new();
        for path in paths {
            let full = self.root.join(path);
            let text = match fs::read(&full) {
                Ok(bytes) => Some(
                    String::from_utf8(bytes).map_err(|_| io_failure(path, "file is not UTF-8"))?,
                ),
                Err(e) if e.kind() == ErrorKind::NotFound => None,
                Err(e) => return Err(io_failure(path, &e.to_string())),
            };
            originals.insert(path.to_string(), text);
        }
        Ok(originals)
    }

    /// Refuse paths that cross a symlink or resolve outside the root on disk.
    pub fn check_containment<'a, I>(&self, paths: I) -> Result<(), Vec<PolicyViolation>>
    where
        I: IntoIterator<Item = &'a str>,
    {
        let root = match self.root.canonicalize() {
            Ok(root) => root,
            Err(e) => {
                return Err(vec![PolicyViolation {
                    path: self.root.display().to_string(),
                    rule: ViolationRule::InvalidPath,
                    pattern: Some(e.to_string()),
                }]);
            }
        };
        let violations: Vec<PolicyViolation> = paths
            .into_iter()
            .filter_map(|path| {
                containment(&root, path).map(|rule| PolicyViolation {
                    path: path.to_string(),
                    rule,
                    pattern: None,
                })
            })
            .collect();
        if violations.is_empty() {
            Ok(())
        } else {
            Err(violations)
        }
    }

    /// Apply `writes` in order. Returns the paths that changed on disk.
    #[instrument(skip_all, fields(writes = writes.len()))]
    pub fn apply(&self, writes: &[PlannedWrite]) -> Result<Vec<String>, ApplyFailure> {
        let mut done: Vec<&PlannedWrite> = Vec::new();
        for write in writes.iter().filter(|w| !w.is_noop()) {
            if let Err(failure) = self.write_state(&write.path, write.after.as_deref()) {
                error!(path = %write.path, err = %failure, "write failed, reverting");
                self.revert(&done);
                return Err(failure);
            }
            debug!(path = %write.path, kind = write.kind.as_str(), "applied");
            done.push(write);
        }
        Ok(done.into_iter().map(|w| w.path.clone()).collect())
    }

    fn revert(&self, done: &[&PlannedWrite]) {
        for write in done.iter().rev() {
            if let Err(failure) = self.write_state(&write.path, write.before.as_deref()) {
                warn!(path = %write.path, err = %failure, "revert failed");
            }
        }
    }

    /// Put every changed path back to its `before` state. Stops at the
    /// first path that cannot be restored.
    pub fn restore(&self, writes: &[PlannedWrite]) -> Result<(), ApplyFailure> {
        for write in writes.iter().rev().filter(|w| !w.is_noop()) {
            self.write_state(&write.path, write.before.as_deref())?;
        }
        Ok(())
    }

    /// Make `path` hold `contents`, or not exist when `contents` is `None`.
    fn write_state(&self, path: &str, contents: Option<&str>) -> Result<(), ApplyFailure> {
        let full = self.root.join(path);
        match contents {
            Some(text) => write_atomic(&full, text.as_bytes())
                .map_err(|e| io_failure(path, &format!("{e:#}"))),
            None => match fs::remove_file(&full) {
                Ok(()) => Ok(()),
                Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
                Err(e) => Err(io_failure(path, &e.to_string())),
            },
        }
    }
}

/// Walk `path` under the canonical `root`. Components that do not exist yet
/// are fine; an existing symlink is not, and neither is anything that
/// resolves outside the root.
fn containment(root: &Path, path: &str) -> Option<ViolationRule> {
    let mut current = root.to_path_buf();
    for component in Path::new(path).components() {
        let Component::Normal(part) = component else {
            return Some(ViolationRule::InvalidPath);
        };
        current.push(part);
        match fs::symlink_metadata(&current) {
            Ok(meta) if meta.file_type().is_symlink() => return Some(ViolationRule::Symlink),
            Ok(_) => {}
            Err(_) => break,
        }
    }
    let existing = current.ancestors().find(|p| p.exists())?;
    match existing.canonicalize() {
        Ok(resolved) if resolved.starts_with(root) => None,
        _ => Some(ViolationRule::InvalidPath),
    }
}

fn io_failure(path: &str, detail: &str) -> ApplyFailure {
    ApplyFailure::ApplyIoError {
        detail: format!("{path}: {detail}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::FileOpKind;

    fn write(
        path: &str,
        kind: FileOpKind,
        before: Option<&str>,
        after: Option<&str>,
    ) -> PlannedWrite {
        PlannedWrite {
            path: path.to_string(),
            kind,
            before: before.map(str::to_string),
            after: after.map(str::to_string),
        }
    }

    #[test]
    fn applies_add_modify_delete() {
        let temp = tempfile::tempdir().expect("tempdir");
        fs::write(temp.path().join("a.txt"), "old\n").expect("write");
        fs::write(temp.path().join("b.txt"), "bye\n").expect("write");
        let engine = ApplyEngine::new(temp.path());

        let touched = engine
            .apply(&[
                write("a.txt", FileOpKind::Modify, Some("old\n"), Some("new\n")),
                write("b.txt", FileOpKind::Delete, Some("bye\n"), None),
                write("src/c.rs", FileOpKind::Add, None, Some("fn c() {}\n")),
                write("same.txt", FileOpKind::Add, None, None),
            ])
            .expect("apply");

        assert_eq!(touched, vec!["a.txt", "b.txt", "src/c.rs"]);
        assert_eq!(fs::read_to_string(temp.path().join("a.txt")).expect("read"), "new\n");
        assert!(!temp.path().join("b.txt").exists());
        assert!(temp.path().join("src/c.rs").is_file());
    }

    /// Verifies a mid-apply failure reverts earlier writes.
    #[test]
    fn failure_reverts_earlier_writes() {
        let temp = tempfile::tempdir().expect("tempdir");
        fs::write(temp.path().join("a.txt"), "old\n").expect("write");
        fs::write(temp.path().join("blocker"), "file, not a dir\n").expect("write");
        let engine = ApplyEngine::new(temp.path());

        let err = engine
            .apply(&[
                write("a.txt", FileOpKind::Modify, Some("old\n"), Some("new\n")),
                write("blocker/inner.txt", FileOpKind::Add, None, Some("x\n")),
            ])
            .expect_err("second write cannot create a dir over a file");

        assert_eq!(err.code(), "APPLY_IO_ERROR");
        assert_eq!(fs::read_to_string(temp.path().join("a.txt")).expect("read"), "old\n");
    }

    #[test]
    fn restore_puts_back_before_state() {
        let temp = tempfile::tempdir().expect("tempdir");
        fs::write(temp.path().join("a.txt"), "old\n").expect("write");
        let engine = ApplyEngine::new(temp.path());
        let writes = [
            write("a.txt", FileOpKind::Modify, Some("old\n"), Some("new\n")),
            write("b.txt", FileOpKind::Add, None, Some("b\n")),
        ];
        engine.apply(&writes).expect("apply");

        engine.restore(&writes).expect("restore");
        assert_eq!(fs::read_to_string(temp.path().join("a.txt")).expect("read"), "old\n");
        assert!(!temp.path().join("b.txt").exists());
    }

    #[test]
    fn plain_paths_are_contained() {
        let temp = tempfile::tempdir().expect("tempdir");
        fs::create_dir_all(temp.path().join("src")).expect("mkdir");
        fs::write(temp.path().join("src/lib.rs"), "x\n").expect("write");
        let engine = ApplyEngine::new(temp.path());
        assert!(engine.check_containment(["src/lib.rs", "src/new/mod.rs", "top.txt"]).is_ok());
    }

    #[cfg(unix)]
    #[test]
    fn symlinks_in_the_tree_are_refused() {
        let temp = tempfile::tempdir().expect("tempdir");
        let outside = tempfile::tempdir().expect("outside");
        fs::create_dir_all(temp.path().join(".git")).expect("mkdir");
        fs::write(temp.path().join("real.txt"), "r\n").expect("write");
        std::os::unix::fs::symlink(".git", temp.path().join("link")).expect("symlink");
        std::os::unix::fs::symlink(outside.path(), temp.path().join("out")).expect("symlink");
        std::os::unix::fs::symlink("real.txt", temp.path().join("alias.txt")).expect("symlink");

        let violations = ApplyEngine::new(temp.path())
            .check_containment(["link/config", "out/escaped.txt", "alias.txt", "real.txt"])
            .expect_err("refused");
        let refused: Vec<(&str, ViolationRule)> =
            violations.iter().map(|v| (v.path.as_str(), v.rule)).collect();
        assert_eq!(
            refused,
            vec![
                ("link/config", ViolationRule::Symlink),
                ("out/escaped.txt", ViolationRule::Symlink),
                ("alias.txt", ViolationRule::Symlink),
            ]
        );
    }

    #[test]
    fn read_originals_reports_missing_as_none() {
        let temp = tempfile::tempdir().expect("tempdir");
        fs::write(temp.path().join("a.txt"), "a\n").expect("write");
        let originals = ApplyEngine::new(temp.path())
            .read_originals(["a.txt", "missing.txt"])
            .expect("read");
        assert_eq!(originals["a.txt"].as_deref(), Some("a\n"));
        assert_eq!(originals["missing.txt"], None);
    }
}
