//! Workspace-scoped filesystem API.
//!
//! This crate provides handlers and routes for reading and modifying files
//! inside a single workspace directory. Every operation validates its path
//! against the workspace root and rejects traversal attempts. It is meant to
//! be embedded in a larger server (the routes are nested under `/fs`).

pub mod error;
pub mod handlers;
pub mod routes;
pub mod workspace;

pub use error::FsError;
pub use workspace::{WorkspaceContext, WorkspaceHandle};

/// Application state shared across filesystem handlers.
#[derive(Clone)]
pub struct FilesState {
    /// Currently configured workspace, if any. Swapped atomically when a
    /// client sets a new workspace root; handlers snapshot it once per
    /// request.
    pub workspace: WorkspaceHandle,
}

impl FilesState {
    /// Create state with no workspace configured. All operations fail
    /// closed until a workspace is set.
    pub fn new() -> Self {
        Self {
            workspace: WorkspaceHandle::empty(),
        }
    }

    /// Create state with a preconfigured workspace root.
    pub fn with_root(root: std::path::PathBuf) -> Self {
        Self {
            workspace: WorkspaceHandle::with_root(root),
        }
    }
}

impl Default for FilesState {
    fn default() -> Self {
        Self::new()
    }
}
