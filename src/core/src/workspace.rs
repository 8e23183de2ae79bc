//! Ephemeral workspace owning all intermediate files of one workflow.
//!
//! The workspace root lives under the OS temp dir at
//! `com.senetas.crypto/<uuid>`. Workers are handed their own UUID
//! subdirectories, so no two tasks ever write to the same path. The root is
//! removed on every exit path; cleanup errors are merged with the primary
//! error rather than masking it.

use std::path::{Path, PathBuf};

use uuid::Uuid;

use crate::error::{CryptoCliError, ErrorSet, Result};

/// Directory name under the OS temp dir that namespaces all workspaces.
const WORKSPACE_NAMESPACE: &str = "com.senetas.crypto";

/// An ephemeral directory tree owned by a single workflow invocation.
#[derive(Debug)]
pub struct Workspace {
    root: PathBuf,
    cleaned: bool,
}

impl Workspace {
    /// Create a fresh workspace under `$TMPDIR/com.senetas.crypto/<uuid>`.
    pub fn create() -> Result<Self> {
        let root = std::env::temp_dir()
            .join(WORKSPACE_NAMESPACE)
            .join(Uuid::new_v4().to_string());
        Self::at(root)
    }

    /// Create a workspace rooted at an explicit path.
    pub fn at(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        std::fs::create_dir_all(&root).map_err(|e| CryptoCliError::io(&root, e))?;
        tracing::debug!(root = %root.display(), "Created workspace");
        Ok(Self {
            root,
            cleaned: false,
        })
    }

    /// The workspace root directory.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Allocate a fresh UUID subdirectory for one worker.
    pub fn subdir(&self) -> Result<PathBuf> {
        let dir = self.root.join(Uuid::new_v4().to_string());
        std::fs::create_dir_all(&dir).map_err(|e| CryptoCliError::io(&dir, e))?;
        Ok(dir)
    }

    /// A path directly under the workspace root.
    pub fn path(&self, name: impl AsRef<Path>) -> PathBuf {
        self.root.join(name)
    }

    /// Remove the workspace root and everything under it.
    pub fn cleanup(mut self) -> Result<()> {
        self.cleaned = true;
        remove_root(&self.root)
    }

    /// Remove the workspace, merging any cleanup failure with `primary`.
    ///
    /// The primary error always comes first in the merged set.
    pub fn cleanup_merging<T>(self, primary: Result<T>) -> Result<T> {
        match (primary, self.cleanup()) {
            (Ok(value), Ok(())) => Ok(value),
            (Ok(_), Err(cleanup)) => Err(cleanup),
            (Err(primary), Ok(())) => Err(primary),
            (Err(primary), Err(cleanup)) => {
                let mut set = ErrorSet::new();
                set.push(primary);
                set.push(cleanup);
                Err(set.into_error().expect("set is non-empty"))
            }
        }
    }
}

impl Drop for Workspace {
    fn drop(&mut self) {
        if !self.cleaned {
            // Last-resort removal when a workflow unwinds without cleanup.
            let _ = std::fs::remove_dir_all(&self.root);
        }
    }
}

fn remove_root(root: &Path) -> Result<()> {
    match std::fs::remove_dir_all(root) {
        Ok(()) => {
            tracing::debug!(root = %root.display(), "Removed workspace");
            Ok(())
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(CryptoCliError::io(root, e)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_and_cleanup() {
        let ws = Workspace::create().unwrap();
        let root = ws.root().to_path_buf();
        assert!(root.exists());
        ws.cleanup().unwrap();
        assert!(!root.exists());
    }

    #[test]
    fn test_subdirs_are_distinct() {
        let ws = Workspace::create().unwrap();
        let a = ws.subdir().unwrap();
        let b = ws.subdir().unwrap();
        assert_ne!(a, b);
        assert!(a.starts_with(ws.root()));
        assert!(b.starts_with(ws.root()));
        ws.cleanup().unwrap();
    }

    #[test]
    fn test_cleanup_merging_keeps_primary_first() {
        let ws = Workspace::create().unwrap();
        let primary: Result<()> = Err(CryptoCliError::BadPassphrase);
        let err = ws.cleanup_merging(primary).unwrap_err();
        // Cleanup succeeded, so only the primary error remains.
        assert!(matches!(err, CryptoCliError::BadPassphrase));
    }

    #[test]
    fn test_cleanup_merging_passes_value() {
        let ws = Workspace::create().unwrap();
        let value = ws.cleanup_merging(Ok(42)).unwrap();
        assert_eq!(value, 42);
    }

    #[test]
    fn test_drop_removes_root() {
        let root;
        {
            let ws = Workspace::create().unwrap();
            root = ws.root().to_path_buf();
            assert!(root.exists());
        }
        assert!(!root.exists());
    }

    #[test]
    fn test_cleanup_idempotent_when_absent() {
        let ws = Workspace::create().unwrap();
        let root = ws.root().to_path_buf();
        std::fs::remove_dir_all(&root).unwrap();
        // Root already gone; cleanup still succeeds.
        ws.cleanup().unwrap();
    }
}
