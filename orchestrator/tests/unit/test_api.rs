//! HTTP surface tests

use std::sync::Arc;

use axum::body::{to_bytes, Body};
use axum::http::{Request, StatusCode};
use axum::Router;
use serde_json::{json, Value};
use tower::ServiceExt;

use stackpilot::server::serve::router;
use stackpilot::server::state::ServerState;

use crate::fakes::{ok, Harness, CREDENTIAL, OWNER};

fn app(harness: &Harness) -> Router {
    router(Arc::new(ServerState::new(
        harness.infra.clone(),
        harness.apps.clone(),
    )))
}

async fn send(router: Router, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
    let builder = Request::builder().method(method).uri(uri);
    let request = match body {
        Some(body) => builder
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    };
    let response = router.oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let value = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, value)
}

fn identity_request() -> Value {
    json!({
        "ownerId": OWNER,
        "credentialId": CREDENTIAL,
        "resourceKind": "identity",
        "resourceName": "deploy-bot",
        "config": {}
    })
}

#[test]
fn test_health() {
    let (status, body) = tokio_test::block_on(async {
        let harness = Harness::new();
        send(app(&harness), "GET", "/health", None).await
    });
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "healthy");
    assert_eq!(body["service"], "stackpilot");
}

#[tokio::test]
async fn test_create_deployment_is_accepted() {
    let harness = Harness::new();
    harness.runner.respond("apply", ok("Apply complete!"));

    let (status, body) = send(app(&harness), "POST", "/deployments", Some(identity_request())).await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(body["status"], "pending");
    let id = body["deploymentId"].as_str().unwrap().to_string();
    harness.settle().await;

    let (status, body) = send(app(&harness), "GET", &format!("/deployments/{}", id), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "completed");

    let (status, body) = send(
        app(&harness),
        "GET",
        &format!("/deployments?owner={}", OWNER),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body.as_array().unwrap().len(), 1);

    let (_, body) = send(app(&harness), "GET", "/deployments?owner=someone-else", None).await;
    assert!(body.as_array().unwrap().is_empty());
}

#[tokio::test]
async fn test_error_status_mapping() {
    let harness = Harness::new();

    let (status, body) = send(app(&harness), "GET", "/deployments/missing", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert!(body["error"].as_str().unwrap().contains("missing"));

    let mut invalid = identity_request();
    invalid["resourceKind"] = json!("object-store");
    invalid["resourceName"] = json!("Not_A_Bucket");
    let (status, _) = send(app(&harness), "POST", "/deployments", Some(invalid)).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let mut unknown = identity_request();
    unknown["credentialId"] = json!("nope");
    let (status, _) = send(app(&harness), "POST", "/deployments", Some(unknown)).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let (status, _) = send(app(&harness), "POST", "/applications/missing/redeploy", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    assert!(harness.runner.calls().is_empty());
}

#[tokio::test]
async fn test_malformed_body_gets_json_error() {
    let harness = Harness::new();

    let request = Request::builder()
        .method("POST")
        .uri("/deployments")
        .header("content-type", "application/json")
        .body(Body::from("{\"ownerId\": "))
        .unwrap();
    let response = app(&harness).oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let body: Value = serde_json::from_slice(&bytes).unwrap();
    assert!(!body["error"].as_str().unwrap().is_empty());

    // Missing fields and a missing content type take the same path
    let (status, body) = send(app(&harness), "POST", "/applications", Some(json!({"name": "api"}))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["error"].is_string());

    let (status, body) = send(app(&harness), "POST", "/deployments", None).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["error"].is_string());

    assert!(harness.runner.calls().is_empty());
}

#[tokio::test]
async fn test_sync_route_is_not_an_id() {
    let harness = Harness::new();
    let (status, body) = send(app(&harness), "POST", "/deployments/sync", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["checked"], 0);
}

#[tokio::test]
async fn test_application_lifecycle_over_http() {
    let harness = Harness::new();
    let request = json!({
        "ownerId": OWNER,
        "credentialId": CREDENTIAL,
        "name": "api",
        "source": {"type": "image", "image": "nginx"},
        "runtime": {"port": 80},
        "target": {"kind": "managed-cluster"}
    });

    let (status, body) = send(app(&harness), "POST", "/applications", Some(request)).await;
    assert_eq!(status, StatusCode::ACCEPTED);
    let id = body["applicationId"].as_str().unwrap().to_string();
    harness.settle().await;

    let (status, body) = send(app(&harness), "POST", &format!("/applications/{}/stop", id), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "stopped");

    // Cancel only applies to in-flight pipelines
    let (status, _) = send(app(&harness), "POST", &format!("/applications/{}/cancel", id), None).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _) = send(app(&harness), "DELETE", &format!("/applications/{}", id), None).await;
    assert_eq!(status, StatusCode::OK);
    let (status, _) = send(app(&harness), "GET", &format!("/applications/{}", id), None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}
