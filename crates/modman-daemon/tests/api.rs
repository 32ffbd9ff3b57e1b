//! REST API tests against an in-memory daemon

use axum::{
    body::{to_bytes, Body},
    http::{Request, StatusCode},
    Router,
};
use modman_daemon::{DaemonConfig, Server};
use serde_json::{json, Value};
use std::time::Duration;
use tempfile::TempDir;
use tower::ServiceExt;

async fn daemon() -> (Router, TempDir) {
    let modules = tempfile::tempdir().unwrap();
    let descriptor = json!({
        "id": "broker",
        "name": "broker",
        "version": "1.0.0",
        "services": { "main": { "image": "acme/broker:1" } }
    });
    std::fs::write(
        modules.path().join("broker.json"),
        serde_json::to_vec(&descriptor).unwrap(),
    )
    .unwrap();

    let mut config = DaemonConfig::default();
    config.modules.dir = Some(modules.path().to_path_buf());
    let server = Server::new(config).await.unwrap();
    (server.router(), modules)
}

async fn call(app: &Router, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
    let mut request = Request::builder().method(method).uri(uri);
    let body = match body {
        Some(body) => {
            request = request.header("content-type", "application/json");
            Body::from(serde_json::to_vec(&body).unwrap())
        }
        None => Body::empty(),
    };
    let response = app
        .clone()
        .oneshot(request.body(body).unwrap())
        .await
        .unwrap();

    let status = response.status();
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let value = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, value)
}

async fn wait_for_job(app: &Router, job_id: &str) -> Value {
    for _ in 0..100 {
        let (status, job) = call(app, "GET", &format!("/api/v1/jobs/{}", job_id), None).await;
        assert_eq!(status, StatusCode::OK);
        if job["completed"] != Value::Null || job["canceled"] != Value::Null {
            return job;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("job {} did not finish", job_id);
}

#[tokio::test]
async fn test_health() {
    let (app, _modules) = daemon().await;
    let (status, body) = call(&app, "GET", "/api/v1/health", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "healthy");
}

#[tokio::test]
async fn test_deployment_lifecycle() {
    let (app, _modules) = daemon().await;

    let (status, created) = call(
        &app,
        "POST",
        "/api/v1/deployments",
        Some(json!({ "module_id": "broker", "name": "main broker" })),
    )
    .await;
    assert_eq!(status, StatusCode::ACCEPTED);
    let id = created["deployment_id"].as_str().unwrap().to_string();
    let job = wait_for_job(&app, created["job_id"].as_str().unwrap()).await;
    assert_eq!(job["error"], Value::Null);

    let (status, dep) = call(&app, "GET", &format!("/api/v1/deployments/{}", id), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(dep["name"], "main broker");
    assert_eq!(dep["enabled"], false);

    let (status, accepted) = call(
        &app,
        "PATCH",
        &format!("/api/v1/deployments/{}/start", id),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::ACCEPTED);
    wait_for_job(&app, accepted["job_id"].as_str().unwrap()).await;

    let (_, list) = call(&app, "GET", "/api/v1/deployments?enabled=true", None).await;
    assert_eq!(list.as_array().unwrap().len(), 1);

    let (status, accepted) = call(
        &app,
        "DELETE",
        &format!("/api/v1/deployments/{}", id),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::ACCEPTED);
    wait_for_job(&app, accepted["job_id"].as_str().unwrap()).await;

    let (status, body) = call(&app, "GET", &format!("/api/v1/deployments/{}", id), None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["code"], "NOT_FOUND");
}

#[tokio::test]
async fn test_unknown_module_is_not_found() {
    let (app, _modules) = daemon().await;
    let (status, body) = call(
        &app,
        "POST",
        "/api/v1/deployments",
        Some(json!({ "module_id": "missing" })),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert!(body["error"].as_str().unwrap().contains("missing"));
}

#[tokio::test]
async fn test_invalid_ids_are_bad_requests() {
    let (app, _modules) = daemon().await;
    let (status, _) = call(&app, "GET", "/api/v1/deployments/not-a-uuid", None).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    let (status, _) = call(&app, "PATCH", "/api/v1/jobs/not-a-uuid/cancel", None).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_batch_start_on_empty_selection() {
    let (app, _modules) = daemon().await;
    let (status, body) = call(
        &app,
        "PATCH",
        "/api/v1/deployments-batch/start",
        Some(json!({ "enabled": false })),
    )
    .await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(body["deployment_ids"], json!([]));
    let job = wait_for_job(&app, body["job_id"].as_str().unwrap()).await;
    assert_eq!(job["error"], Value::Null);

    let (status, jobs) = call(&app, "GET", "/api/v1/jobs?status=completed", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(jobs.as_array().unwrap().len(), 1);
}
