use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::Serialize;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum FsError {
    #[error("No workspace configured")]
    NoWorkspace,

    #[error("Path not found: {0}")]
    NotFound(String),

    #[error("Path is outside the workspace root")]
    PathTraversal,

    #[error("Invalid path: {0}")]
    InvalidPath(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("File too large: {size} bytes exceeds limit of {limit} bytes")]
    FileTooLarge { size: u64, limit: u64 },

    #[error("Expected a directory")]
    NotADirectory,

    #[error("Expected a file")]
    NotAFile,

    #[error("File is not valid UTF-8 text")]
    NotText,
}

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
    code: &'static str,
}

impl IntoResponse for FsError {
    fn into_response(self) -> Response {
        let (status, code) = match &self {
            FsError::NoWorkspace => (StatusCode::CONFLICT, "NO_WORKSPACE"),
            FsError::NotFound(_) => (StatusCode::NOT_FOUND, "NOT_FOUND"),
            FsError::PathTraversal => (StatusCode::FORBIDDEN, "PATH_TRAVERSAL"),
            FsError::InvalidPath(_) => (StatusCode::BAD_REQUEST, "INVALID_PATH"),
            FsError::Io(_) => (StatusCode::INTERNAL_SERVER_ERROR, "IO_ERROR"),
            FsError::FileTooLarge { .. } => (StatusCode::PAYLOAD_TOO_LARGE, "PAYLOAD_TOO_LARGE"),
            FsError::NotADirectory => (StatusCode::BAD_REQUEST, "NOT_A_DIRECTORY"),
            FsError::NotAFile => (StatusCode::BAD_REQUEST, "NOT_A_FILE"),
            FsError::NotText => (StatusCode::UNPROCESSABLE_ENTITY, "NOT_TEXT"),
        };

        let body = ErrorResponse {
            error: self.to_string(),
            code,
        };

        (status, Json(body)).into_response()
    }
}
