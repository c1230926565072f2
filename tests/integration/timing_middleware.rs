//! End-to-end tests of the timing layer against the in-memory gateway

use axum::{
    extract::Request,
    http::StatusCode,
    middleware::{Next, from_fn},
    response::Response,
};
use pretty_assertions::assert_eq;
use request_timings::middleware::{
    HeaderAllowlist, SessionData, TimingMiddleware, TimingOptions,
};
use serde_json::{Map, json};
use tower::ServiceExt;

use crate::helpers::*;

#[tokio::test]
async fn test_health_request_is_recorded() {
    let gateway = memory_gateway("mw_health");
    let app = instrumented(gateway.clone());

    let response = app.oneshot(get_request("/health")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_bytes(response).await, "ok");

    let stored = recent(gateway.as_ref(), 10).await;
    assert_eq!(stored.len(), 1);

    let data = &stored[0].data;
    assert!(data["execution_time"].as_f64().unwrap() >= 0.012);
    assert_eq!(data["request.url"], "http://localhost/health");
    assert_eq!(data["request.method"], "GET");
    assert_eq!(data["response.status"], 200);
    assert_eq!(data["request.session"], serde_json::Value::Null);
}

#[tokio::test]
async fn test_status_and_body_pass_through() {
    let gateway = memory_gateway("mw_teapot");
    let app = instrumented(gateway.clone());

    let response = app.oneshot(get_request("/teapot")).await.unwrap();
    assert_eq!(response.status(), StatusCode::IM_A_TEAPOT);
    assert_eq!(
        response.headers().get("content-type").unwrap(),
        "application/json"
    );
    assert_eq!(body_bytes(response).await, TEAPOT_BODY);

    let stored = recent(gateway.as_ref(), 10).await;
    assert_eq!(stored[0].data["response.status"], 418);
}

#[tokio::test]
async fn test_sensitive_headers_are_not_recorded() {
    let gateway = memory_gateway("mw_headers");
    let app = instrumented(gateway.clone());

    app.oneshot(get_request("/health")).await.unwrap();

    let stored = recent(gateway.as_ref(), 1).await;
    let headers = stored[0].data["request.headers"].as_object().unwrap();
    assert_eq!(headers["user-agent"], "integration-test");
    assert_eq!(headers["host"], "localhost");
    assert!(!headers.contains_key("authorization"));
}

#[tokio::test]
async fn test_custom_allowlist() {
    let gateway = memory_gateway("mw_allowlist");
    let options = TimingOptions {
        headers: HeaderAllowlist::new(["Host"]),
        ..TimingOptions::default()
    };
    let app = TimingMiddleware::new(gateway.clone(), options).instrument(routes());

    app.oneshot(get_request("/health")).await.unwrap();

    let stored = recent(gateway.as_ref(), 1).await;
    assert_eq!(stored[0].data["request.headers"], json!({"host": "localhost"}));
}

async fn attach_session(mut request: Request, next: Next) -> Response {
    let mut values = Map::new();
    values.insert("user_id".to_string(), json!(42));
    request.extensions_mut().insert(SessionData(values));
    next.run(request).await
}

#[tokio::test]
async fn test_session_data_from_outer_layer() {
    let gateway = memory_gateway("mw_session");
    let app = instrumented(gateway.clone()).layer(from_fn(attach_session));

    app.oneshot(get_request("/echo/7")).await.unwrap();

    let stored = recent(gateway.as_ref(), 1).await;
    assert_eq!(stored[0].data["request.session"], json!({"user_id": 42}));
    assert_eq!(stored[0].data["request.url"], "http://localhost/echo/7");
}
