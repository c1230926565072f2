//! Tests against a live Postgres
//!
//! Run with `--features pg-tests` and the `DATABASE_*` (and optionally
//! `REMOTE_SSH_*`/`PEM_PATH`) variables pointing at a disposable database.

use std::sync::Arc;

use axum::http::StatusCode;
use request_timings::config::{ConnectionConfig, ConnectionSettings};
use request_timings::storage::{
    RecordFactory, StorageGateway, postgres::PostgresGateway, with_session,
};
use serde_json::json;
use tower::ServiceExt;

use crate::helpers::*;

fn live_gateway() -> PostgresGateway {
    dotenv::dotenv().ok();
    let settings = ConnectionSettings::from_env().unwrap();
    PostgresGateway::new(ConnectionConfig::try_from(settings).unwrap())
}

#[tokio::test]
async fn test_setup_twice() {
    let gateway = live_gateway();
    gateway.setup().await.unwrap();
    gateway.setup().await.unwrap();
}

#[tokio::test]
async fn test_request_is_committed() {
    let gateway = Arc::new(live_gateway());
    gateway.setup().await.unwrap();

    let response = instrumented(gateway.clone())
        .oneshot(get_request("/echo/99"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let stored = recent(gateway.as_ref(), 50).await;
    assert!(
        stored
            .iter()
            .any(|record| record.data["request.url"] == "http://localhost/echo/99")
    );
}

#[tokio::test]
async fn test_uncommitted_record_is_rolled_back() {
    let gateway = live_gateway();
    gateway.setup().await.unwrap();
    let target = gateway.target();
    let marker = format!("rollback-{}", std::process::id());

    let payload = json!({"marker": marker.clone()});
    let record = RecordFactory::build(&target.table, &target.schema, payload);
    with_session(&gateway, |session| {
        Box::pin(async move { session.add(&record).await })
    })
    .await
    .unwrap();

    let stored = recent(&gateway, 50).await;
    assert!(stored.iter().all(|record| record.data["marker"] != marker));
}

#[tokio::test]
async fn test_record_for_new_table_creates_it() {
    let gateway = live_gateway();
    let target = gateway.target();
    let table = format!("{}_extra", target.table);

    let record = RecordFactory::build(&table, &target.schema, json!({"execution_time": 0.2}));
    let id = with_session(&gateway, |session| {
        Box::pin(async move {
            let id = session.add(&record).await?;
            session.commit().await?;
            Ok(id)
        })
    })
    .await
    .unwrap();

    assert!(id > 0);
}

#[tokio::test]
async fn test_concurrent_first_use_of_new_table() {
    let gateway = live_gateway();
    let target = gateway.target();
    let table = format!("{}_race_{}", target.table, std::process::id());

    let writes = (0..4).map(|i| {
        let record = RecordFactory::build(&table, &target.schema, json!({"seq": i}));
        with_session(&gateway, |session| {
            Box::pin(async move {
                let id = session.add(&record).await?;
                session.commit().await?;
                Ok(id)
            })
        })
    });
    let results = futures::future::join_all(writes).await;

    assert!(results.iter().all(Result::is_ok), "{results:?}");
}
