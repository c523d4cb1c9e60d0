use std::path::{Component, Path, PathBuf};
use std::time::UNIX_EPOCH;

use axum::{
    Json,
    extract::{Query, State},
};
use serde::{Deserialize, Serialize};
use tokio::fs;
use tracing::{debug, error, warn};

use crate::FilesState;
use crate::error::FsError;

/// Maximum file size served by the read endpoint.
const MAX_READ_BYTES: u64 = 5 * 1024 * 1024;

/// Default recursion depth for the tree endpoint.
const DEFAULT_TREE_DEPTH: usize = 6;

/// Directory names always excluded from list and tree responses:
/// version-control metadata, dependency caches, build caches.
const DENYLIST: &[&str] = &[
    ".git",
    ".hg",
    ".svn",
    "node_modules",
    "__pycache__",
    ".pytest_cache",
    ".mypy_cache",
];

/// Virtual environment directories, hidden unless the client opts in with
/// `includeEnv=true` (driven by the session's `showEnvInTree` setting).
const ENV_DIRS: &[&str] = &[".venv", "venv", "env"];

/// Node in a directory listing or tree response.
#[derive(Debug, Serialize)]
pub struct FileNode {
    pub name: String,
    pub path: String,
    #[serde(rename = "type")]
    pub node_type: FileType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub modified: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub children: Option<Vec<FileNode>>,
}

#[derive(Debug, Serialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum FileType {
    File,
    Directory,
}

#[derive(Debug, Deserialize)]
pub struct PathQuery {
    pub path: String,
}

#[derive(Debug, Deserialize)]
pub struct ListQuery {
    pub path: String,
    #[serde(rename = "includeEnv", default)]
    pub include_env: bool,
}

#[derive(Debug, Deserialize)]
pub struct TreeQuery {
    pub depth: Option<usize>,
    #[serde(rename = "includeEnv", default)]
    pub include_env: bool,
}

#[derive(Debug, Deserialize)]
pub struct WriteRequest {
    pub path: String,
    pub content: String,
}

#[derive(Debug, Deserialize)]
pub struct RenameRequest {
    #[serde(rename = "oldPath")]
    pub old_path: String,
    #[serde(rename = "newPath")]
    pub new_path: String,
}

#[derive(Debug, Deserialize)]
pub struct MkdirRequest {
    pub path: String,
}

#[derive(Debug, Deserialize)]
pub struct SetWorkspaceRequest {
    pub path: String,
}

#[derive(Debug, Serialize)]
pub struct WorkspaceResponse {
    pub workspace: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct ReadResponse {
    pub path: String,
    pub content: String,
    pub size: u64,
}

#[derive(Debug, Serialize)]
pub struct ExistsResponse {
    pub exists: bool,
    #[serde(rename = "type", skip_serializing_if = "Option::is_none")]
    pub node_type: Option<FileType>,
}

#[derive(Debug, Serialize)]
pub struct SuccessResponse {
    pub success: bool,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
}

// ============================================================================
// Path resolution
// ============================================================================

/// Resolve a relative path against the workspace root, rejecting traversal.
///
/// The path is rebuilt component-by-component: parent references, absolute
/// components, and NUL bytes are rejected outright rather than normalized
/// away, so the result always stays inside the root by construction.
fn resolve_path(root: &Path, relative: &str) -> Result<PathBuf, FsError> {
    let relative = relative.trim_start_matches('/');

    if relative.is_empty() || relative == "." {
        return Ok(root.to_path_buf());
    }

    let mut result = root.to_path_buf();

    for component in Path::new(relative).components() {
        match component {
            Component::Normal(name) => {
                let name_str = name.to_string_lossy();
                if name_str.contains('\0') {
                    warn!("path component contains NUL byte: {:?}", name);
                    return Err(FsError::PathTraversal);
                }
                result.push(name);
            }
            Component::ParentDir => {
                // Reject even when it would stay inside root.
                warn!("path traversal attempt: parent directory in {relative:?}");
                return Err(FsError::PathTraversal);
            }
            Component::CurDir => continue,
            Component::RootDir | Component::Prefix(_) => {
                warn!("absolute component in relative path {relative:?}");
                return Err(FsError::PathTraversal);
            }
        }
    }

    if !result.starts_with(root) {
        error!("path resolution escaped root: {:?}", result);
        return Err(FsError::PathTraversal);
    }

    Ok(result)
}

/// Resolve a path and, when it (or its parent) already exists, canonicalize
/// and re-verify containment so symlinks cannot escape the root.
fn resolve_and_verify_path(root: &Path, relative: &str) -> Result<PathBuf, FsError> {
    let built_path = resolve_path(root, relative)?;

    if built_path.exists() {
        let canonical_root = root.canonicalize().map_err(FsError::Io)?;
        let canonical_path = built_path.canonicalize().map_err(FsError::Io)?;

        if !canonical_path.starts_with(&canonical_root) {
            warn!(
                "symlink escape: {:?} resolved to {:?} outside {:?}",
                built_path, canonical_path, canonical_root
            );
            return Err(FsError::PathTraversal);
        }

        Ok(canonical_path)
    } else {
        if let Some(parent) = built_path.parent() {
            if parent.exists() {
                let canonical_root = root.canonicalize().map_err(FsError::Io)?;
                let canonical_parent = parent.canonicalize().map_err(FsError::Io)?;

                if !canonical_parent.starts_with(&canonical_root) {
                    warn!("parent of {:?} resolved outside root", built_path);
                    return Err(FsError::PathTraversal);
                }
            }
        }

        Ok(built_path)
    }
}

/// Relative path from root, always `/`-separated.
fn get_relative_path(root: &Path, full_path: &Path) -> String {
    let Ok(relative) = full_path.strip_prefix(root) else {
        return String::new();
    };

    let mut parts = Vec::new();
    for component in relative.components() {
        if let Component::Normal(part) = component {
            parts.push(part.to_string_lossy().to_string());
        }
    }

    parts.join("/")
}

fn is_denylisted(name: &str, include_env: bool) -> bool {
    DENYLIST.contains(&name) || (!include_env && ENV_DIRS.contains(&name))
}

// ============================================================================
// Workspace handlers
// ============================================================================

/// POST /fs/workspace
///
/// Sets the workspace root. The path must exist and be a directory.
pub async fn set_workspace(
    State(state): State<FilesState>,
    Json(req): Json<SetWorkspaceRequest>,
) -> Result<Json<WorkspaceResponse>, FsError> {
    let requested = PathBuf::from(&req.path);
    if !requested.exists() {
        return Err(FsError::NotFound(req.path));
    }
    if !requested.is_dir() {
        return Err(FsError::NotADirectory);
    }

    let canonical = requested.canonicalize().map_err(FsError::Io)?;
    let ctx = state.workspace.replace(canonical);
    debug!("workspace root set to {}", ctx.root().display());

    Ok(Json(WorkspaceResponse {
        workspace: Some(ctx.root().display().to_string()),
    }))
}

/// GET /fs/workspace
pub async fn get_workspace(State(state): State<FilesState>) -> Json<WorkspaceResponse> {
    Json(WorkspaceResponse {
        workspace: state.workspace.root_path().map(|p| p.display().to_string()),
    })
}

// ============================================================================
// File handlers
// ============================================================================

/// GET /fs/read?path=
pub async fn read_file(
    State(state): State<FilesState>,
    Query(query): Query<PathQuery>,
) -> Result<Json<ReadResponse>, FsError> {
    let ctx = state.workspace.current()?;
    let full_path = resolve_and_verify_path(ctx.root(), &query.path)?;

    if !full_path.exists() {
        return Err(FsError::NotFound(query.path));
    }
    if full_path.is_dir() {
        return Err(FsError::NotAFile);
    }

    let metadata = fs::metadata(&full_path).await.map_err(FsError::Io)?;
    if metadata.len() > MAX_READ_BYTES {
        return Err(FsError::FileTooLarge {
            size: metadata.len(),
            limit: MAX_READ_BYTES,
        });
    }

    let content = fs::read_to_string(&full_path)
        .await
        .map_err(|e| match e.kind() {
            std::io::ErrorKind::InvalidData => FsError::NotText,
            _ => FsError::Io(e),
        })?;
    let size = content.len() as u64;

    Ok(Json(ReadResponse {
        path: get_relative_path(ctx.root(), &full_path),
        content,
        size,
    }))
}

/// POST /fs/write
///
/// Creates parent directories as needed and overwrites unconditionally.
pub async fn write_file(
    State(state): State<FilesState>,
    Json(req): Json<WriteRequest>,
) -> Result<Json<SuccessResponse>, FsError> {
    let ctx = state.workspace.current()?;
    let full_path = resolve_and_verify_path(ctx.root(), &req.path)?;

    if full_path.is_dir() {
        return Err(FsError::NotAFile);
    }

    if let Some(parent) = full_path.parent() {
        fs::create_dir_all(parent).await.map_err(FsError::Io)?;
    }

    fs::write(&full_path, req.content.as_bytes())
        .await
        .map_err(FsError::Io)?;

    Ok(Json(SuccessResponse {
        success: true,
        message: format!("Wrote {} bytes", req.content.len()),
        path: Some(get_relative_path(ctx.root(), &full_path)),
    }))
}

/// DELETE /fs/delete?path=
///
/// Removes a file, or a directory and its entire contents.
pub async fn delete_path(
    State(state): State<FilesState>,
    Query(query): Query<PathQuery>,
) -> Result<Json<SuccessResponse>, FsError> {
    let ctx = state.workspace.current()?;
    let full_path = resolve_and_verify_path(ctx.root(), &query.path)?;

    if !full_path.exists() {
        return Err(FsError::NotFound(query.path));
    }

    // Never delete the workspace root itself.
    let canonical_root = ctx.root().canonicalize().map_err(FsError::Io)?;
    if full_path == canonical_root {
        return Err(FsError::InvalidPath(
            "cannot delete the workspace root".to_string(),
        ));
    }

    if full_path.is_dir() {
        fs::remove_dir_all(&full_path).await.map_err(FsError::Io)?;
    } else {
        fs::remove_file(&full_path).await.map_err(FsError::Io)?;
    }

    Ok(Json(SuccessResponse {
        success: true,
        message: "Deleted".to_string(),
        path: Some(query.path),
    }))
}

/// POST /fs/rename
pub async fn rename_path(
    State(state): State<FilesState>,
    Json(req): Json<RenameRequest>,
) -> Result<Json<SuccessResponse>, FsError> {
    let ctx = state.workspace.current()?;
    let old_full = resolve_and_verify_path(ctx.root(), &req.old_path)?;
    let new_full = resolve_and_verify_path(ctx.root(), &req.new_path)?;

    if !old_full.exists() {
        return Err(FsError::NotFound(req.old_path));
    }

    if let Some(parent) = new_full.parent() {
        fs::create_dir_all(parent).await.map_err(FsError::Io)?;
    }

    fs::rename(&old_full, &new_full).await.map_err(FsError::Io)?;

    Ok(Json(SuccessResponse {
        success: true,
        message: "Renamed".to_string(),
        path: Some(get_relative_path(ctx.root(), &new_full)),
    }))
}

/// POST /fs/mkdir
///
/// Recursive creation; an already-existing directory is not an error.
pub async fn make_dir(
    State(state): State<FilesState>,
    Json(req): Json<MkdirRequest>,
) -> Result<Json<SuccessResponse>, FsError> {
    let ctx = state.workspace.current()?;
    let full_path = resolve_and_verify_path(ctx.root(), &req.path)?;

    if full_path.exists() {
        if full_path.is_dir() {
            return Ok(Json(SuccessResponse {
                success: true,
                message: "Directory already exists".to_string(),
                path: Some(req.path),
            }));
        }
        return Err(FsError::NotADirectory);
    }

    fs::create_dir_all(&full_path).await.map_err(FsError::Io)?;

    Ok(Json(SuccessResponse {
        success: true,
        message: "Directory created".to_string(),
        path: Some(req.path),
    }))
}

/// GET /fs/list?path=&includeEnv=
///
/// One level of children, with denylisted names filtered out. Environment
/// directories are included only when `includeEnv` is set.
pub async fn list_dir(
    State(state): State<FilesState>,
    Query(query): Query<ListQuery>,
) -> Result<Json<Vec<FileNode>>, FsError> {
    let ctx = state.workspace.current()?;
    let full_path = resolve_and_verify_path(ctx.root(), &query.path)?;

    if !full_path.exists() {
        return Err(FsError::NotFound(query.path));
    }
    if !full_path.is_dir() {
        return Err(FsError::NotADirectory);
    }

    let root = ctx.root().to_path_buf();
    let include_env = query.include_env;
    let nodes =
        tokio::task::spawn_blocking(move || read_children(&root, &full_path, 0, include_env))
            .await
            .map_err(|e| FsError::Io(std::io::Error::other(e)))??;

    Ok(Json(nodes))
}

/// GET /fs/tree?depth=&includeEnv=
///
/// Recursive listing from the workspace root down to a bounded depth.
pub async fn get_tree(
    State(state): State<FilesState>,
    Query(query): Query<TreeQuery>,
) -> Result<Json<Vec<FileNode>>, FsError> {
    let ctx = state.workspace.current()?;
    let depth = query.depth.unwrap_or(DEFAULT_TREE_DEPTH);

    let root = ctx.root().to_path_buf();
    let start = root.clone();
    let include_env = query.include_env;
    let nodes =
        tokio::task::spawn_blocking(move || read_children(&root, &start, depth, include_env))
            .await
            .map_err(|e| FsError::Io(std::io::Error::other(e)))??;

    Ok(Json(nodes))
}

/// GET /fs/exists?path=
pub async fn path_exists(
    State(state): State<FilesState>,
    Query(query): Query<PathQuery>,
) -> Result<Json<ExistsResponse>, FsError> {
    let ctx = state.workspace.current()?;
    let full_path = resolve_and_verify_path(ctx.root(), &query.path)?;

    if !full_path.exists() {
        return Ok(Json(ExistsResponse {
            exists: false,
            node_type: None,
        }));
    }

    let node_type = if full_path.is_dir() {
        FileType::Directory
    } else {
        FileType::File
    };

    Ok(Json(ExistsResponse {
        exists: true,
        node_type: Some(node_type),
    }))
}

// ============================================================================
// Tree building
// ============================================================================

/// Read the children of `dir`, recursing `remaining_depth` levels into
/// subdirectories. Directories sort before files, then case-insensitive by
/// name within each group.
fn read_children(
    root: &Path,
    dir: &Path,
    remaining_depth: usize,
    include_env: bool,
) -> Result<Vec<FileNode>, FsError> {
    let mut nodes = Vec::new();

    let entries = std::fs::read_dir(dir).map_err(FsError::Io)?;
    for entry in entries.flatten() {
        let name = entry.file_name().to_string_lossy().to_string();
        if is_denylisted(&name, include_env) {
            continue;
        }

        let path = entry.path();
        let Ok(metadata) = entry.metadata() else {
            continue;
        };

        let modified = metadata
            .modified()
            .ok()
            .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
            .map(|d| d.as_secs());

        if metadata.is_dir() {
            let children = if remaining_depth > 0 {
                Some(read_children(root, &path, remaining_depth - 1, include_env)?)
            } else {
                None
            };
            nodes.push(FileNode {
                name,
                path: get_relative_path(root, &path),
                node_type: FileType::Directory,
                size: None,
                modified,
                children,
            });
        } else {
            nodes.push(FileNode {
                name,
                path: get_relative_path(root, &path),
                node_type: FileType::File,
                size: Some(metadata.len()),
                modified,
                children: None,
            });
        }
    }

    nodes.sort_by(|a, b| match (a.node_type, b.node_type) {
        (FileType::Directory, FileType::File) => std::cmp::Ordering::Less,
        (FileType::File, FileType::Directory) => std::cmp::Ordering::Greater,
        _ => a.name.to_lowercase().cmp(&b.name.to_lowercase()),
    });

    Ok(nodes)
}
