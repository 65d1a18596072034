//! API integration tests.
//!
//! Drive the full router (coordinator, task runtime, executor) against the
//! in-memory store and a scripted sandbox runtime.

use axum::{
    Router,
    body::Body,
    http::{Method, Request, StatusCode, header},
};
use serde_json::{Value, json};
use tower::ServiceExt;

use code_executor::store::SessionStore;

mod common;
use common::{TestApp, test_app};

async fn send(
    router: &Router,
    method: Method,
    uri: &str,
    body: Option<Value>,
) -> (StatusCode, Value) {
    let request = match body {
        Some(body) => Request::builder()
            .uri(uri)
            .method(method)
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(serde_json::to_string(&body).unwrap()))
            .unwrap(),
        None => Request::builder()
            .uri(uri)
            .method(method)
            .body(Body::empty())
            .unwrap(),
    };

    let response = router.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), 1024 * 1024)
        .await
        .unwrap();
    let json = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, json)
}

/// Poll a session until it reports the wanted status.
async fn wait_for_session_status(app: &TestApp, session_id: &str, status: &str) -> Value {
    for _ in 0..100 {
        let (code, body) = send(
            &app.router,
            Method::GET,
            &format!("/api/v1/sessions/{}", session_id),
            None,
        )
        .await;
        if code == StatusCode::OK && body["status"] == status {
            return body;
        }
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
    }
    panic!("session {} never reached status {}", session_id, status);
}

#[tokio::test]
async fn health_endpoint_reports_service() {
    let app = test_app();

    let (status, body) = send(&app.router, Method::GET, "/api/v1/health", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "healthy");
    assert_eq!(body["service"], "code-executor");
}

#[tokio::test]
async fn index_points_at_health() {
    let app = test_app();

    let (status, body) = send(&app.router, Method::GET, "/", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["service"], "Code Executor API");
    assert_eq!(body["health"], "/api/v1/health");
}

#[tokio::test]
async fn environments_lists_enabled_entries() {
    let app = test_app();

    let (status, body) = send(&app.router, Method::GET, "/api/v1/environments", None).await;
    assert_eq!(status, StatusCode::OK);

    let names: Vec<&str> = body
        .as_array()
        .unwrap()
        .iter()
        .map(|e| e["name"].as_str().unwrap())
        .collect();
    assert_eq!(names, vec!["node", "python"]);
    assert_eq!(body[1]["file_extension"], ".py");
}

#[tokio::test(start_paused = true)]
async fn ephemeral_execute_success() {
    let app = test_app();

    let (status, body) = send(
        &app.router,
        Method::POST,
        "/api/v1/execute",
        Some(json!({"environment": "python", "code": "print(2+3)"})),
    )
    .await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["environment"], "python");
    assert_eq!(body["stdout"], "5\n");
    assert_eq!(body["stderr"], "");
    assert_eq!(body["exit_code"], 0);
    assert_eq!(body["status"], "completed");

    // The one-shot sandbox is destroyed after the run
    assert_eq!(app.sandbox.container_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn ephemeral_execute_runtime_error() {
    let app = test_app();

    let (status, body) = send(
        &app.router,
        Method::POST,
        "/api/v1/execute",
        Some(json!({"environment": "python", "code": "raise ValueError('x')"})),
    )
    .await;

    assert_eq!(status, StatusCode::OK);
    assert_ne!(body["exit_code"], 0);
    assert!(body["stderr"].as_str().unwrap().contains("ValueError"));
    assert_eq!(body["status"], "error");
}

#[tokio::test(start_paused = true)]
async fn ephemeral_execute_timeout() {
    let app = test_app();

    let (status, body) = send(
        &app.router,
        Method::POST,
        "/api/v1/execute",
        Some(json!({"environment": "python", "code": "while True: pass"})),
    )
    .await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["exit_code"], 124);
    assert!(
        body["stderr"]
            .as_str()
            .unwrap()
            .starts_with("Execution timed out\n")
    );
    assert_eq!(body["status"], "error");
}

#[tokio::test]
async fn unknown_environment_lists_available() {
    let app = test_app();

    let (status, body) = send(
        &app.router,
        Method::POST,
        "/api/v1/sessions",
        Some(json!({"environment": "cobol"})),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    let error = body["error"].as_str().unwrap();
    assert!(error.contains("cobol"));
    assert!(error.contains("python"));

    let (status, _) = send(
        &app.router,
        Method::POST,
        "/api/v1/execute",
        Some(json!({"environment": "cobol", "code": "x"})),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test(start_paused = true)]
async fn session_lifecycle_create_execute_stop() {
    let app = test_app();

    // Create: returns immediately with a pending session
    let (status, body) = send(
        &app.router,
        Method::POST,
        "/api/v1/sessions",
        Some(json!({"environment": "python"})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "pending");
    let session_id = body["session_id"].as_str().unwrap().to_string();

    // The start worker brings it to ready with a container attached
    let ready = wait_for_session_status(&app, &session_id, "ready").await;
    assert!(ready["container_id"].is_string());
    assert_eq!(ready["environment"], "python");

    // Execute against the live sandbox
    let (status, body) = send(
        &app.router,
        Method::POST,
        &format!("/api/v1/sessions/{}/execute", session_id),
        Some(json!({"code": "print('hi')"})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["stdout"], "hi\n");
    assert_eq!(body["exit_code"], 0);
    assert_eq!(body["status"], "completed");
    assert_eq!(body["session_id"], session_id.as_str());

    // Last execution timestamp is now populated
    let (_, body) = send(
        &app.router,
        Method::GET,
        &format!("/api/v1/sessions/{}", session_id),
        None,
    )
    .await;
    assert!(body["last_execution"].is_string());

    // Stop: returns stopping immediately, then the worker finishes
    let (status, body) = send(
        &app.router,
        Method::DELETE,
        &format!("/api/v1/sessions/{}", session_id),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "stopping");

    let stopped = wait_for_session_status(&app, &session_id, "stopped").await;
    assert!(stopped["container_id"].is_null());
    assert_eq!(app.sandbox.container_count(), 0);

    // A stopped session refuses further executions
    let (status, body) = send(
        &app.router,
        Method::POST,
        &format!("/api/v1/sessions/{}/execute", session_id),
        Some(json!({"code": "print(1)"})),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["error"].as_str().unwrap().contains("stopped"));
}

#[tokio::test]
async fn execute_before_ready_is_rejected() {
    let app = test_app();

    // Seed a record no worker has picked up yet
    app.store.create("s-pending", "python").await.unwrap();

    let (status, body) = send(
        &app.router,
        Method::POST,
        "/api/v1/sessions/s-pending/execute",
        Some(json!({"code": "print(1)"})),
    )
    .await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["error"].as_str().unwrap().contains("starting"));

    // The rejected call must not have touched the record
    let (_, body) = send(&app.router, Method::GET, "/api/v1/sessions/s-pending", None).await;
    assert_eq!(body["status"], "pending");
}

#[tokio::test]
async fn unknown_session_is_not_found() {
    let app = test_app();

    let (status, _) = send(&app.router, Method::GET, "/api/v1/sessions/ghost", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, _) = send(
        &app.router,
        Method::DELETE,
        "/api/v1/sessions/ghost",
        None,
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, _) = send(
        &app.router,
        Method::POST,
        "/api/v1/sessions/ghost/execute",
        Some(json!({"code": "x"})),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}
