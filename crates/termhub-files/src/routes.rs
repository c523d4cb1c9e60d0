use axum::{
    Router,
    routing::{delete, get, post},
};

use crate::FilesState;
use crate::handlers;

/// Filesystem API routes, meant to be nested under `/fs`.
pub fn fs_routes() -> Router<FilesState> {
    Router::new()
        .route(
            "/workspace",
            get(handlers::get_workspace).post(handlers::set_workspace),
        )
        .route("/read", get(handlers::read_file))
        .route("/write", post(handlers::write_file))
        .route("/delete", delete(handlers::delete_path))
        .route("/rename", post(handlers::rename_path))
        .route("/mkdir", post(handlers::make_dir))
        .route("/list", get(handlers::list_dir))
        .route("/tree", get(handlers::get_tree))
        .route("/exists", get(handlers::path_exists))
}
