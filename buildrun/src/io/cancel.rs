//! Run-level cancellation.
//!
//! A `CancelToken` is an in-process flag, optionally backed by a sentinel
//! file so an operator can cancel a running process with `touch`. Blocking
//! operations poll it between bounded wait slices.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tracing::info;

#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
    sentinel: Option<PathBuf>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Token that also reports cancelled once `sentinel` exists.
    pub fn with_sentinel(sentinel: impl Into<PathBuf>) -> Self {
        Self {
            flag: Arc::new(AtomicBool::new(false)),
            sentinel: Some(sentinel.into()),
        }
    }

    pub fn cancel(&self) {
        if !self.flag.swap(true, Ordering::SeqCst) {
            info!("cancellation requested");
        }
    }

    pub fn is_cancelled(&self) -> bool {
        if self.flag.load(Ordering::SeqCst) {
            return true;
        }
        if let Some(path) = &self.sentinel
            && path.exists()
        {
            self.cancel();
            return true;
        }
        false
    }

    pub fn sentinel(&self) -> Option<&Path> {
        self.sentinel.as_deref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clones_share_the_flag() {
        let token = CancelToken::new();
        let other = token.clone();
        assert!(!other.is_cancelled());
        token.cancel();
        assert!(other.is_cancelled());
    }

    #[test]
    fn sentinel_file_cancels() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("CANCEL");
        let token = CancelToken::with_sentinel(&path);
        assert!(!token.is_cancelled());
        std::fs::write(&path, "").expect("touch");
        assert!(token.is_cancelled());
        std::fs::remove_file(&path).expect("rm");
        assert!(token.is_cancelled(), "cancellation is sticky");
    }
}
