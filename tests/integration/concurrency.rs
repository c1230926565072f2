//! Concurrent requests through one timing layer

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::Ordering;

use futures::future::join_all;
use request_timings::storage::{RecordFactory, TableKey, TableRegistry};
use serde_json::json;
use tower::ServiceExt;

use crate::helpers::*;

#[tokio::test]
async fn test_concurrent_requests_each_get_a_record() {
    let gateway = memory_gateway("concurrent_requests");
    let app = instrumented(gateway.clone());

    let responses = join_all(
        (0..20).map(|i| app.clone().oneshot(get_request(&format!("/echo/{i}")))),
    )
    .await;
    assert!(responses.iter().all(|response| response.is_ok()));

    let stored = recent(gateway.as_ref(), 100).await;
    assert_eq!(stored.len(), 20);

    let ids: HashSet<_> = stored.iter().map(|record| record.id).collect();
    assert_eq!(ids.len(), 20);

    let urls: HashSet<_> = stored
        .iter()
        .map(|record| record.data["request.url"].as_str().unwrap().to_string())
        .collect();
    for i in 0..20 {
        assert!(urls.contains(&format!("http://localhost/echo/{i}")));
    }
}

#[tokio::test]
async fn test_every_request_opens_its_own_session() {
    let gateway = Arc::new(ScriptedGateway::new("session_per_request", Failure::None));
    let app = instrumented(gateway.clone());

    join_all((0..8).map(|_| app.clone().oneshot(get_request("/health")))).await;

    assert_eq!(gateway.opened.load(Ordering::SeqCst), 8);
    assert_eq!(gateway.closed.load(Ordering::SeqCst), 8);
    assert_eq!(gateway.inner().len().await, 8);
}

#[tokio::test]
async fn test_factory_shares_definitions_across_tasks() {
    let tasks = (0..16).map(|i| {
        tokio::spawn(async move {
            RecordFactory::build("shared_definition", "metrics", json!({"n": i}))
        })
    });
    let records: Vec<_> = join_all(tasks)
        .await
        .into_iter()
        .map(|record| record.unwrap())
        .collect();

    let first = records[0].table();
    assert!(records.iter().all(|record| Arc::ptr_eq(record.table(), first)));
    assert!(
        TableRegistry::global()
            .get(&TableKey::new("metrics", "shared_definition"))
            .is_some()
    );
}
