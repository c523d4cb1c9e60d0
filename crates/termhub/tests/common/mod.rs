use std::path::PathBuf;
use std::time::Duration;

use axum::Router;
use termhub::api::{AppState, create_router};
use termhub::venv::VenvSettings;
use termhub_files::FilesState;

fn test_settings() -> VenvSettings {
    VenvSettings {
        poll_interval: Duration::from_millis(10),
        create_timeout: Duration::from_millis(100),
        install_notify_delay: Duration::from_millis(1),
    }
}

/// Router with no workspace configured.
pub fn test_app() -> Router {
    let state = AppState::new("/bin/sh".to_string(), test_settings(), FilesState::new());
    create_router(state)
}

/// Router whose filesystem API is rooted at `root`.
pub fn test_app_with_workspace(root: PathBuf) -> Router {
    let state = AppState::new(
        "/bin/sh".to_string(),
        test_settings(),
        FilesState::with_root(root),
    );
    create_router(state)
}
