//! Workspace root context.
//!
//! The workspace root is the one directory tree the filesystem API may
//! touch. It is modeled as an immutable context object: setting a new root
//! installs a fresh context rather than mutating the old one, so a request
//! that has already snapshotted its context keeps a consistent view while
//! later requests observe the change.

use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

use crate::error::FsError;

/// An immutable view of the configured workspace.
#[derive(Debug)]
pub struct WorkspaceContext {
    root: PathBuf,
}

impl WorkspaceContext {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

/// Shared handle to the current workspace context.
#[derive(Clone)]
pub struct WorkspaceHandle {
    inner: Arc<RwLock<Option<Arc<WorkspaceContext>>>>,
}

impl WorkspaceHandle {
    /// Handle with no workspace configured.
    pub fn empty() -> Self {
        Self {
            inner: Arc::new(RwLock::new(None)),
        }
    }

    /// Handle preconfigured with a root directory.
    pub fn with_root(root: PathBuf) -> Self {
        Self {
            inner: Arc::new(RwLock::new(Some(Arc::new(WorkspaceContext::new(root))))),
        }
    }

    /// Snapshot the current context, failing closed when none is set.
    pub fn current(&self) -> Result<Arc<WorkspaceContext>, FsError> {
        self.inner
            .read()
            .expect("workspace lock poisoned")
            .clone()
            .ok_or(FsError::NoWorkspace)
    }

    /// Current root path, if a workspace is configured.
    pub fn root_path(&self) -> Option<PathBuf> {
        self.inner
            .read()
            .expect("workspace lock poisoned")
            .as_ref()
            .map(|ctx| ctx.root.clone())
    }

    /// Install a new workspace context, replacing any previous one.
    pub fn replace(&self, root: PathBuf) -> Arc<WorkspaceContext> {
        let ctx = Arc::new(WorkspaceContext::new(root));
        *self.inner.write().expect("workspace lock poisoned") = Some(ctx.clone());
        ctx
    }
}
