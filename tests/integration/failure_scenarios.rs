//! Failure tests for the timing layer
//!
//! A broken storage backend must never change what the client sees:
//! - Failed commits
//! - Sessions that never open
//! - Unreachable databases
//! - Requests dropped before they finish

use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;

use assert_matches::assert_matches;
use axum::http::StatusCode;
use request_timings::middleware::{TimingMiddleware, TimingOptions, TimingPhase};
use request_timings::storage::GatewayError;
use serde_json::json;
use tower::ServiceExt;

use crate::helpers::*;

#[tokio::test]
async fn test_failed_commit_still_closes_session() {
    let gateway = Arc::new(ScriptedGateway::new("fail_commit", Failure::Commit));
    let app = instrumented(gateway.clone());

    let response = app.oneshot(get_request("/health")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_bytes(response).await, "ok");

    assert_eq!(gateway.opened.load(Ordering::SeqCst), 1);
    assert_eq!(gateway.closed.load(Ordering::SeqCst), 1);
    assert!(gateway.inner().is_empty().await);
}

#[tokio::test]
async fn test_response_identical_with_failing_gateway() {
    let working = instrumented(memory_gateway("transparent_ok"));
    let failing = instrumented(Arc::new(ScriptedGateway::new(
        "transparent_fail",
        Failure::Commit,
    )));

    let expected = working.oneshot(get_request("/teapot")).await.unwrap();
    let actual = failing.oneshot(get_request("/teapot")).await.unwrap();

    assert_eq!(expected.status(), actual.status());
    assert_eq!(
        expected.headers().get("content-type"),
        actual.headers().get("content-type")
    );
    assert_eq!(body_bytes(expected).await, body_bytes(actual).await);
}

#[tokio::test]
async fn test_persist_timeout_degrades() {
    let gateway = Arc::new(ScriptedGateway::new("slow_session", Failure::SlowSession));
    let options = TimingOptions {
        persist_timeout: Duration::from_millis(50),
        ..TimingOptions::default()
    };
    let timing = TimingMiddleware::new(gateway.clone(), options);

    let phase = timing.persist(json!({"execution_time": 0.5})).await;
    assert_eq!(phase, TimingPhase::Degraded);

    let app = timing.instrument(routes());
    let response = tokio::time::timeout(
        Duration::from_secs(5),
        app.oneshot(get_request("/echo/1")),
    )
    .await
    .expect("response should not wait for storage")
    .unwrap();
    assert_eq!(body_bytes(response).await, "echo 1");

    assert_eq!(gateway.opened.load(Ordering::SeqCst), 0);
    assert!(gateway.inner().is_empty().await);
}

#[cfg(feature = "storage-postgres")]
#[tokio::test]
async fn test_unreachable_postgres_keeps_serving() {
    let gateway = Arc::new(unreachable_postgres().await);
    let timing = TimingMiddleware::new(gateway, TimingOptions::default());

    // the failure persist() logs
    let written = timing.write(json!({"execution_time": 0.1})).await;
    assert_matches!(written, Err(GatewayError::Connection(_)));

    let phase = timing.persist(json!({"execution_time": 0.1})).await;
    assert_eq!(phase, TimingPhase::Degraded);

    let app = timing.instrument(routes());
    let response = app.oneshot(get_request("/health")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_bytes(response).await, "ok");
}

#[tokio::test]
async fn test_dropped_request_leaves_no_record() {
    let gateway = Arc::new(ScriptedGateway::new("cancelled", Failure::None));
    let app = instrumented(gateway.clone());

    let request = tokio::spawn(app.oneshot(get_request("/hang")));
    tokio::time::sleep(Duration::from_millis(50)).await;
    request.abort();
    assert!(request.await.unwrap_err().is_cancelled());

    assert_eq!(gateway.opened.load(Ordering::SeqCst), 0);
    assert!(gateway.inner().is_empty().await);
}
