use std::sync::Arc;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use serde_json::{json, Value};
use tower::ServiceExt;

use fleet_broker::{app, AppState, Config, MemoryStore, NoopAnalytics, Stores};

fn create_test_state() -> Arc<AppState> {
    let mut config = Config::default();
    config.server.backend_host = "replica-routes".to_string();
    let (state, _background) = AppState::build(
        config,
        Stores::memory(Arc::new(MemoryStore::new())),
        Arc::new(NoopAnalytics),
    );
    state
}

async fn body_json(response: axum::response::Response) -> Value {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

fn chat_request(body: Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri("/v1/chat/completions")
        .header("content-type", "application/json")
        .header("x-user-id", "user-1")
        .body(Body::from(body.to_string()))
        .unwrap()
}

#[tokio::test]
async fn test_health_endpoint() {
    let response = app(create_test_state())
        .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["status"], "ok");
    assert_eq!(body["backend_host"], "replica-routes");
    assert_eq!(body["connected_nodes"], 0);
    assert!(body["version"].is_string());
}

#[tokio::test]
async fn test_chat_without_nodes_is_no_capacity() {
    let response = app(create_test_state())
        .oneshot(chat_request(json!({
            "model": "llama3",
            "messages": [{"role": "user", "content": "hi"}]
        })))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    let body = body_json(response).await;
    assert_eq!(body["error"]["type"], "no_capacity");
}

#[tokio::test]
async fn test_chat_requires_model() {
    let response = app(create_test_state())
        .oneshot(chat_request(json!({
            "messages": [{"role": "user", "content": "hi"}]
        })))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body = body_json(response).await;
    assert_eq!(body["error"]["type"], "invalid_request");
}

#[tokio::test]
async fn test_unknown_route_is_not_found() {
    let response = app(create_test_state())
        .oneshot(Request::builder().uri("/admin").body(Body::empty()).unwrap())
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}
