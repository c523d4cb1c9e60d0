mod common;

use axum::Router;
use axum::body::Body;
use axum::http::{Request, StatusCode};
use common::{test_app, test_app_with_workspace};
use serde_json::{Value, json};
use tower::ServiceExt;

async fn body_json(response: axum::response::Response) -> Value {
    let bytes = axum::body::to_bytes(response.into_body(), 1024 * 1024)
        .await
        .unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

async fn get(app: &Router, uri: &str) -> axum::response::Response {
    app.clone()
        .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
        .await
        .unwrap()
}

async fn send_json(
    app: &Router,
    method: &str,
    uri: &str,
    body: Value,
) -> axum::response::Response {
    app.clone()
        .oneshot(
            Request::builder()
                .method(method)
                .uri(uri)
                .header("content-type", "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
        )
        .await
        .unwrap()
}

#[tokio::test]
async fn test_health_reports_version_and_session_count() {
    let app = test_app();
    let response = get(&app, "/health").await;
    assert_eq!(response.status(), StatusCode::OK);

    let json = body_json(response).await;
    assert_eq!(json["status"], "ok");
    assert_eq!(json["activeSessions"], 0);
    assert!(json["version"].is_string());
}

#[tokio::test]
async fn test_sessions_starts_empty() {
    let app = test_app();
    let response = get(&app, "/sessions").await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_json(response).await, json!([]));
}

#[tokio::test]
async fn test_install_requirements_unknown_terminal() {
    let app = test_app();
    let response = send_json(
        &app,
        "POST",
        "/install-requirements",
        json!({"terminalId": "no-such-terminal"}),
    )
    .await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    assert_eq!(body_json(response).await["code"], "NOT_FOUND");
}

#[tokio::test]
async fn test_fs_fails_closed_without_workspace() {
    let app = test_app();

    let response = get(&app, "/fs/workspace").await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_json(response).await["workspace"], Value::Null);

    let response = get(&app, "/fs/read?path=anything.txt").await;
    assert_eq!(response.status(), StatusCode::CONFLICT);
    assert_eq!(body_json(response).await["code"], "NO_WORKSPACE");
}

#[tokio::test]
async fn test_fs_set_workspace_requires_existing_path() {
    let app = test_app();

    let response = send_json(
        &app,
        "POST",
        "/fs/workspace",
        json!({"path": "/definitely/not/a/real/path"}),
    )
    .await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);

    let tmp = tempfile::TempDir::new().unwrap();
    let response = send_json(
        &app,
        "POST",
        "/fs/workspace",
        json!({"path": tmp.path().display().to_string()}),
    )
    .await;
    assert_eq!(response.status(), StatusCode::OK);
    assert!(body_json(response).await["workspace"].is_string());

    let response = get(&app, "/fs/workspace").await;
    assert!(body_json(response).await["workspace"].is_string());
}

#[tokio::test]
async fn test_fs_write_then_read_roundtrip() {
    let tmp = tempfile::TempDir::new().unwrap();
    let app = test_app_with_workspace(tmp.path().canonicalize().unwrap());

    let response = send_json(
        &app,
        "POST",
        "/fs/write",
        json!({"path": "src/main.py", "content": "print('hi')\n"}),
    )
    .await;
    assert_eq!(response.status(), StatusCode::OK);

    let response = get(&app, "/fs/read?path=src/main.py").await;
    assert_eq!(response.status(), StatusCode::OK);
    let json = body_json(response).await;
    assert_eq!(json["content"], "print('hi')\n");
    assert_eq!(json["path"], "src/main.py");
}

#[tokio::test]
async fn test_fs_mkdir_is_idempotent() {
    let tmp = tempfile::TempDir::new().unwrap();
    let app = test_app_with_workspace(tmp.path().canonicalize().unwrap());

    for _ in 0..2 {
        let response = send_json(&app, "POST", "/fs/mkdir", json!({"path": "a/b"})).await;
        assert_eq!(response.status(), StatusCode::OK);
    }

    let response = get(&app, "/fs/exists?path=a/b").await;
    let json = body_json(response).await;
    assert_eq!(json["exists"], true);
    assert_eq!(json["type"], "directory");
}

#[tokio::test]
async fn test_fs_rejects_path_traversal() {
    let tmp = tempfile::TempDir::new().unwrap();
    let app = test_app_with_workspace(tmp.path().canonicalize().unwrap());

    let response = get(&app, "/fs/read?path=../../etc/passwd").await;
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
    assert_eq!(body_json(response).await["code"], "PATH_TRAVERSAL");

    let response = send_json(
        &app,
        "POST",
        "/fs/write",
        json!({"path": "../escape.txt", "content": "x"}),
    )
    .await;
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn test_fs_delete_missing_path() {
    let tmp = tempfile::TempDir::new().unwrap();
    let app = test_app_with_workspace(tmp.path().canonicalize().unwrap());

    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .method("DELETE")
                .uri("/fs/delete?path=ghost.txt")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    assert_eq!(body_json(response).await["code"], "NOT_FOUND");
}

#[tokio::test]
async fn test_fs_rename_moves_file() {
    let tmp = tempfile::TempDir::new().unwrap();
    std::fs::write(tmp.path().join("old.txt"), "content").unwrap();
    let app = test_app_with_workspace(tmp.path().canonicalize().unwrap());

    let response = send_json(
        &app,
        "POST",
        "/fs/rename",
        json!({"oldPath": "old.txt", "newPath": "nested/new.txt"}),
    )
    .await;
    assert_eq!(response.status(), StatusCode::OK);

    let response = get(&app, "/fs/exists?path=old.txt").await;
    assert_eq!(body_json(response).await["exists"], false);
    let response = get(&app, "/fs/read?path=nested/new.txt").await;
    assert_eq!(body_json(response).await["content"], "content");
}

#[tokio::test]
async fn test_fs_tree_filters_and_sorts() {
    let tmp = tempfile::TempDir::new().unwrap();
    std::fs::write(tmp.path().join("b.txt"), "").unwrap();
    std::fs::create_dir(tmp.path().join("src")).unwrap();
    std::fs::create_dir(tmp.path().join("node_modules")).unwrap();
    let app = test_app_with_workspace(tmp.path().canonicalize().unwrap());

    let response = get(&app, "/fs/tree?depth=2").await;
    assert_eq!(response.status(), StatusCode::OK);
    let json = body_json(response).await;
    let names: Vec<&str> = json
        .as_array()
        .unwrap()
        .iter()
        .map(|n| n["name"].as_str().unwrap())
        .collect();
    assert_eq!(names, vec!["src", "b.txt"]);
}

#[tokio::test]
async fn test_fs_tree_include_env_reveals_env_dirs() {
    let tmp = tempfile::TempDir::new().unwrap();
    std::fs::create_dir(tmp.path().join(".venv")).unwrap();
    std::fs::create_dir(tmp.path().join("src")).unwrap();
    let app = test_app_with_workspace(tmp.path().canonicalize().unwrap());

    let names = |json: Value| -> Vec<String> {
        json.as_array()
            .unwrap()
            .iter()
            .map(|n| n["name"].as_str().unwrap().to_string())
            .collect()
    };

    let response = get(&app, "/fs/tree?depth=1").await;
    assert_eq!(names(body_json(response).await), vec!["src"]);

    let response = get(&app, "/fs/tree?depth=1&includeEnv=true").await;
    assert_eq!(names(body_json(response).await), vec![".venv", "src"]);

    let response = get(&app, "/fs/list?path=.&includeEnv=true").await;
    assert_eq!(names(body_json(response).await), vec![".venv", "src"]);
}

#[tokio::test]
async fn test_fs_read_binary_file_is_unprocessable() {
    let tmp = tempfile::TempDir::new().unwrap();
    std::fs::write(tmp.path().join("blob.bin"), [0xFF, 0xFE, 0x80]).unwrap();
    let app = test_app_with_workspace(tmp.path().canonicalize().unwrap());

    let response = get(&app, "/fs/read?path=blob.bin").await;
    assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);
    let json = body_json(response).await;
    assert_eq!(json["code"], "NOT_TEXT");
    assert!(json["error"].as_str().unwrap().contains("not valid UTF-8"));
}

#[tokio::test]
async fn test_fs_list_requires_directory() {
    let tmp = tempfile::TempDir::new().unwrap();
    std::fs::write(tmp.path().join("file.txt"), "").unwrap();
    let app = test_app_with_workspace(tmp.path().canonicalize().unwrap());

    let response = get(&app, "/fs/list?path=file.txt").await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(body_json(response).await["code"], "NOT_A_DIRECTORY");
}
