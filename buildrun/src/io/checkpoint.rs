//! Pre-apply snapshots of the working tree.
//!
//! `GitCheckpoint` records the tree with plumbing commands against a private
//! index, so the user's index, HEAD and branches are never touched. Each
//! checkpoint is a commit object kept alive by
//! `refs/buildrun/checkpoints/<id>`.

use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};
use tracing::{debug, info, instrument};

use crate::io::git::Git;

const CHECKPOINT_REF_PREFIX: &str = "refs/buildrun/checkpoints/";
/// Run bookkeeping is never captured or restored.
const EXCLUDE_BUILDRUN: &str = ":(exclude).buildrun";

/// Snapshot and restore the working tree around an apply.
pub trait RunCheckpoint {
    /// Record the current tree; returns the checkpoint id.
    fn checkpoint(&self, label: &str) -> Result<String>;
    /// Restore the tree recorded by `checkpoint_id`.
    fn rollback(&self, checkpoint_id: &str) -> Result<()>;
    /// Forget a checkpoint that will never be rolled back to.
    fn release(&self, _checkpoint_id: &str) -> Result<()> {
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct GitCheckpoint {
    git: Git,
    index_path: PathBuf,
}

impl GitCheckpoint {
    /// `state_dir` holds the private index file.
    pub fn open(root: &Path, state_dir: &Path) -> Result<Self> {
        let git = Git::new(root)
            .with_env("GIT_AUTHOR_NAME", "buildrun")
            .with_env("GIT_AUTHOR_EMAIL", "buildrun@localhost")
            .with_env("GIT_COMMITTER_NAME", "buildrun")
            .with_env("GIT_COMMITTER_EMAIL", "buildrun@localhost");
        if !git.is_work_tree() {
            return Err(anyhow!(
                "{} is not a git work tree (checkpoints need git)",
                root.display()
            ));
        }
        fs::create_dir_all(state_dir)
            .with_context(|| format!("create directory {}", state_dir.display()))?;
        Ok(Self {
            git,
            index_path: state_dir.join("checkpoint.index"),
        })
    }

    /// Git handle bound to a freshly emptied private index.
    fn private(&self) -> Result<Git> {
        match fs::remove_file(&self.index_path) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                return Err(e)
                    .with_context(|| format!("remove {}", self.index_path.display()));
            }
        }
        Ok(self.git.with_index_file(&self.index_path))
    }

    fn stage_worktree(git: &Git) -> Result<()> {
        git.run_checked(&["add", "-A", "--", ".", EXCLUDE_BUILDRUN])?;
        Ok(())
    }

    fn ref_name(checkpoint_id: &str) -> String {
        format!("{CHECKPOINT_REF_PREFIX}{checkpoint_id}")
    }
}

impl RunCheckpoint for GitCheckpoint {
    #[instrument(skip_all, fields(label = %label))]
    fn checkpoint(&self, label: &str) -> Result<String> {
        let id = ref_safe(label);
        let git = self.private()?;
        Self::stage_worktree(&git)?;
        let tree = git.run_capture(&["write-tree"])?;

        let message = format!("buildrun checkpoint {id}");
        let commit = match self.git.resolve("HEAD^{commit}")? {
            Some(head) => git.run_capture(&["commit-tree", &tree, "-p", &head, "-m", &message])?,
            None => git.run_capture(&["commit-tree", &tree, "-m", &message])?,
        };
        self.git
            .run_checked(&["update-ref", &Self::ref_name(&id), &commit])?;
        debug!(checkpoint_id = %id, %commit, "checkpoint recorded");
        Ok(id)
    }

    #[instrument(skip_all, fields(checkpoint_id = %checkpoint_id))]
    fn rollback(&self, checkpoint_id: &str) -> Result<()> {
        let reference = Self::ref_name(checkpoint_id);
        let commit = self
            .git
            .resolve(&format!("{reference}^{{commit}}"))?
            .ok_or_else(|| anyhow!("unknown checkpoint {checkpoint_id}"))?;

        let git = self.private()?;
        Self::stage_worktree(&git)?;
        let current: BTreeSet<String> = git.ls_files()?.into_iter().collect();

        git.run_checked(&["read-tree", &commit])?;
        let recorded: BTreeSet<String> = git.ls_files()?.into_iter().collect();

        let root = self.git.workdir();
        for created in current.difference(&recorded) {
            let path = root.join(created);
            match fs::remove_file(&path) {
                Ok(()) => prune_empty_parents(root, &path),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e).with_context(|| format!("remove {}", path.display())),
            }
        }
        git.run_checked(&["checkout-index", "-a", "-f"])?;
        info!(
            checkpoint_id,
            removed = current.difference(&recorded).count(),
            "rolled back to checkpoint"
        );
        Ok(())
    }

    fn release(&self, checkpoint_id: &str) -> Result<()> {
        let reference = Self::ref_name(checkpoint_id);
        if self.git.resolve(&reference)?.is_some() {
            self.git.run_checked(&["update-ref", "-d", &reference])?;
            debug!(checkpoint_id, "checkpoint released");
        }
        Ok(())
    }
}

/// Make a label usable as a ref component.
fn ref_safe(label: &str) -> String {
    let mut out: String = label
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '-' | '_') {
                c
            } else {
                '-'
            }
        })
        .collect();
    if out.is_empty() {
        out.push_str("checkpoint");
    }
    out
}

fn prune_empty_parents(root: &Path, file: &Path) {
    let mut dir = file.parent();
    while let Some(d) = dir {
        if d == root || !d.starts_with(root) {
            break;
        }
        // Stops at the first non-empty directory.
        if fs::remove_dir(d).is_err() {
            break;
        }
        dir = d.parent();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn repo() -> (tempfile::TempDir, GitCheckpoint) {
        let temp = tempfile::tempdir().expect("tempdir");
        Git::new(temp.path())
            .run_checked(&["init", "-q"])
            .expect("git init");
        let state = temp.path().join(".buildrun/state");
        let cp = GitCheckpoint::open(temp.path(), &state).expect("open");
        (temp, cp)
    }

    #[test]
    fn ref_safe_replaces_separators() {
        assert_eq!(ref_safe("run-1/p1/3"), "run-1-p1-3");
        assert_eq!(ref_safe(""), "checkpoint");
    }

    /// Verifies rollback restores modified and deleted files and removes new ones.
    #[test]
    fn rollback_restores_tree_without_head() {
        let (temp, cp) = repo();
        let root = temp.path();
        fs::write(root.join("keep.txt"), "original\n").expect("write");
        fs::write(root.join("gone.txt"), "will be deleted\n").expect("write");

        let id = cp.checkpoint("run-1/p1/1").expect("checkpoint");

        fs::write(root.join("keep.txt"), "changed\n").expect("write");
        fs::remove_file(root.join("gone.txt")).expect("rm");
        fs::create_dir_all(root.join("src/new")).expect("mkdir");
        fs::write(root.join("src/new/file.rs"), "fn x() {}\n").expect("write");

        cp.rollback(&id).expect("rollback");

        assert_eq!(fs::read_to_string(root.join("keep.txt")).expect("read"), "original\n");
        assert!(root.join("gone.txt").is_file());
        assert!(!root.join("src/new/file.rs").exists());
        assert!(!root.join("src").exists());
    }

    #[test]
    fn checkpoint_leaves_user_index_and_buildrun_alone() {
        let (temp, cp) = repo();
        let root = temp.path();
        fs::write(root.join("a.txt"), "a\n").expect("write");
        fs::write(root.join(".buildrun/state/run_state.json"), "{}").expect("write");

        let id = cp.checkpoint("cp").expect("checkpoint");
        let git = Git::new(root);
        assert!(git.ls_files().expect("ls").is_empty(), "real index untouched");
        assert!(git.resolve("HEAD").expect("resolve").is_none(), "no commit on HEAD");

        fs::write(root.join(".buildrun/state/run_state.json"), "{\"x\":1}").expect("write");
        cp.rollback(&id).expect("rollback");
        assert_eq!(
            fs::read_to_string(root.join(".buildrun/state/run_state.json")).expect("read"),
            "{\"x\":1}"
        );
    }

    #[test]
    fn release_deletes_the_checkpoint_ref() {
        let (temp, cp) = repo();
        fs::write(temp.path().join("a.txt"), "a\n").expect("write");
        let id = cp.checkpoint("run-1-p1-0").expect("checkpoint");
        let reference = GitCheckpoint::ref_name(&id);
        assert!(Git::new(temp.path()).resolve(&reference).expect("resolve").is_some());

        cp.release(&id).expect("release");
        assert!(Git::new(temp.path()).resolve(&reference).expect("resolve").is_none());
        assert!(cp.rollback(&id).is_err());
        cp.release(&id).expect("second release is a no-op");
    }

    #[test]
    fn unknown_checkpoint_is_an_error() {
        let (_temp, cp) = repo();
        assert!(cp.rollback("nope").is_err());
    }

    #[test]
    fn open_outside_git_fails() {
        let temp = tempfile::tempdir().expect("tempdir");
        assert!(GitCheckpoint::open(temp.path(), &temp.path().join("s")).is_err());
    }
}
