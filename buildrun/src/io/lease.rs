//! Exclusive workspace lease held for the length of a run.

use std::fs::{self, File, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};
use fs2::FileExt;
use tracing::debug;

/// Advisory lock on `.buildrun/lease.lock`. Released on drop.
#[derive(Debug)]
pub struct WorkspaceLease {
    file: File,
    path: PathBuf,
}

impl WorkspaceLease {
    /// Take the lease without waiting. Fails if another run holds it.
    pub fn acquire(path: &Path, run_id: &str) -> Result<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| format!("create {}", parent.display()))?;
        }
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)
            .with_context(|| format!("open lease {}", path.display()))?;

        match FileExt::try_lock_exclusive(&file) {
            Ok(()) => {}
            Err(err) if err.kind() == ErrorKind::WouldBlock => {
                let holder = fs::read_to_string(path).unwrap_or_default();
                return Err(anyhow!(
                    "workspace is leased by another run ({})",
                    holder.trim()
                ));
            }
            Err(err) => {
                return Err(err).with_context(|| format!("lock lease {}", path.display()));
            }
        }

        // Holder note for operators; the lock itself is what matters.
        file.set_len(0)
            .and_then(|()| writeln!(file, "run_id={run_id} pid={}", std::process::id()))
            .with_context(|| format!("write lease {}", path.display()))?;
        debug!(path = %path.display(), run_id, "workspace lease acquired");
        Ok(Self {
            file,
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for WorkspaceLease {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.file);
        debug!(path = %self.path.display(), "workspace lease released");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_lease_is_refused_until_first_drops() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join(".buildrun/lease.lock");

        let first = WorkspaceLease::acquire(&path, "run-a").expect("first lease");
        let err = WorkspaceLease::acquire(&path, "run-b").expect_err("contended");
        assert!(format!("{err:#}").contains("run-a"), "{err:#}");

        drop(first);
        let second = WorkspaceLease::acquire(&path, "run-b").expect("after release");
        assert!(
            fs::read_to_string(second.path())
                .expect("read")
                .contains("run_id=run-b")
        );
    }
}
