use std::sync::Arc;

use termhub_files::FilesState;

use crate::session::SessionRegistry;
use crate::venv::VenvSettings;

/// Shared state for all HTTP and WebSocket handlers.
#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<SessionRegistry>,
    pub venv: VenvSettings,
    /// Shell executable spawned for new sessions.
    pub shell: String,
    pub files: FilesState,
}

impl AppState {
    pub fn new(shell: String, venv: VenvSettings, files: FilesState) -> Self {
        Self {
            registry: Arc::new(SessionRegistry::new()),
            venv,
            shell,
            files,
        }
    }
}
