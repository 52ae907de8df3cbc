use std::sync::Arc;

use axum::{
    body::{to_bytes, Body},
    http::{Request, StatusCode},
};
use model_gateway::{build_app, registry::Registry, state::AppState};
use tower::util::ServiceExt;

const MOCK_MODELS: &str = r#"
models:
  - name: mock-a
    display_name: Mock A
    type: mock
  - name: mock-b
    type: mock
"#;

fn test_app() -> axum::Router {
    let registry = Registry::from_yaml(MOCK_MODELS).expect("test config should load");
    build_app(AppState::new(Arc::new(registry)))
}

#[tokio::test]
async fn generate_streams_plain_text_for_named_model() {
    let app = test_app();

    let response = app
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/api/generate?model=mock-a")
                .header("content-type", "application/json")
                .body(Body::from(r#"{"prompt":"stream this back"}"#))
                .expect("request build"),
        )
        .await
        .expect("request execution");

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response
            .headers()
            .get("content-type")
            .and_then(|value| value.to_str().ok()),
        Some("text/plain; charset=utf-8")
    );

    let bytes = to_bytes(response.into_body(), 1024 * 1024)
        .await
        .expect("body should be readable");
    let body = String::from_utf8(bytes.to_vec()).expect("body should be UTF-8");
    assert_eq!(body, "Mock A reply: stream this back");
}

#[tokio::test]
async fn generate_defaults_to_first_loaded_model() {
    let app = test_app();

    let response = app
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/api/generate")
                .header("content-type", "application/json")
                .body(Body::from(r#"{"prompt":"hello"}"#))
                .expect("request build"),
        )
        .await
        .expect("request execution");

    assert_eq!(response.status(), StatusCode::OK);
    let bytes = to_bytes(response.into_body(), 1024 * 1024)
        .await
        .expect("body should be readable");
    let body = String::from_utf8(bytes.to_vec()).expect("body should be UTF-8");
    assert!(body.starts_with("Mock A reply:"));
}

#[tokio::test]
async fn unknown_model_is_a_client_error() {
    let app = test_app();

    let response = app
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/api/generate?model=absent")
                .header("content-type", "application/json")
                .body(Body::from(r#"{"prompt":"hello"}"#))
                .expect("request build"),
        )
        .await
        .expect("request execution");

    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    let bytes = to_bytes(response.into_body(), 1024 * 1024)
        .await
        .expect("body should be readable");
    let body = String::from_utf8(bytes.to_vec()).expect("body should be UTF-8");
    assert!(body.contains("unknown model: absent"));
    assert!(body.contains("not_found_error"));
}

#[tokio::test]
async fn models_listing_preserves_load_order() {
    let app = test_app();

    let response = app
        .oneshot(
            Request::builder()
                .method("GET")
                .uri("/api/models")
                .body(Body::empty())
                .expect("request build"),
        )
        .await
        .expect("request execution");

    assert_eq!(response.status(), StatusCode::OK);
    let bytes = to_bytes(response.into_body(), 1024 * 1024)
        .await
        .expect("body should be readable");
    let listed: serde_json::Value =
        serde_json::from_slice(&bytes).expect("listing should be JSON");

    assert_eq!(listed[0]["name"], "mock-a");
    assert_eq!(listed[0]["display_name"], "Mock A");
    assert_eq!(listed[0]["type"], "mock");
    assert_eq!(listed[1]["name"], "mock-b");
    assert_eq!(listed[1]["display_name"], "mock-b");
}

#[tokio::test]
async fn healthz_answers_ok() {
    let app = test_app();

    let response = app
        .oneshot(
            Request::builder()
                .method("GET")
                .uri("/healthz")
                .body(Body::empty())
                .expect("request build"),
        )
        .await
        .expect("request execution");

    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn metrics_endpoint_renders_exposition_format() {
    let app = test_app();

    let warmup = app
        .clone()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/api/generate?model=mock-b")
                .header("content-type", "application/json")
                .body(Body::from(r#"{"prompt":"count me"}"#))
                .expect("request build"),
        )
        .await
        .expect("request execution");
    assert_eq!(warmup.status(), StatusCode::OK);
    to_bytes(warmup.into_body(), 1024 * 1024)
        .await
        .expect("warmup body should drain");

    let response = app
        .oneshot(
            Request::builder()
                .method("GET")
                .uri("/metrics")
                .body(Body::empty())
                .expect("request build"),
        )
        .await
        .expect("request execution");

    assert_eq!(response.status(), StatusCode::OK);
    let bytes = to_bytes(response.into_body(), 1024 * 1024)
        .await
        .expect("body should be readable");
    let body = String::from_utf8(bytes.to_vec()).expect("body should be UTF-8");
    assert!(body.contains("gateway_http_requests_total"));
}
