//! Helper functions for integration tests

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use axum::{
    Router,
    body::{Body, Bytes},
    extract::Path,
    http::{Request, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
};
use request_timings::{
    middleware::{TimingMiddleware, TimingOptions},
    storage::{
        GatewayError, GatewayResult, GatewaySession, StorageGateway, StoredRecord, TableKey,
        TimingRecord, memory::MemoryGateway, with_session,
    },
};
#[cfg(feature = "storage-postgres")]
use request_timings::{
    config::{ConnectionConfig, Secret},
    storage::postgres::PostgresGateway,
};
#[cfg(feature = "storage-sqlite")]
use request_timings::storage::sqlite::SqliteGateway;

pub const TEAPOT_BODY: &str = r#"{"error":"short and stout"}"#;

/// Routes used by every middleware test
pub fn routes() -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/teapot", get(teapot))
        .route("/echo/:id", get(echo))
        .route("/hang", get(hang))
}

async fn health() -> &'static str {
    tokio::time::sleep(Duration::from_millis(12)).await;
    "ok"
}

async fn teapot() -> Response {
    (
        StatusCode::IM_A_TEAPOT,
        [("content-type", "application/json")],
        TEAPOT_BODY,
    )
        .into_response()
}

async fn echo(Path(id): Path<u32>) -> String {
    format!("echo {id}")
}

async fn hang() -> &'static str {
    tokio::time::sleep(Duration::from_secs(60)).await;
    "too late"
}

pub fn instrumented(gateway: Arc<dyn StorageGateway>) -> Router {
    TimingMiddleware::new(gateway, TimingOptions::default()).instrument(routes())
}

pub fn get_request(uri: &str) -> Request<Body> {
    Request::builder()
        .uri(uri)
        .header("host", "localhost")
        .header("user-agent", "integration-test")
        .header("authorization", "Bearer do-not-store")
        .body(Body::empty())
        .unwrap()
}

pub async fn body_bytes(response: Response) -> Bytes {
    axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap()
}

pub async fn recent(gateway: &dyn StorageGateway, limit: usize) -> Vec<StoredRecord> {
    with_session(gateway, |session| Box::pin(session.recent(limit)))
        .await
        .unwrap()
}

#[cfg(feature = "storage-sqlite")]
pub async fn sqlite_gateway(dir: &tempfile::TempDir) -> Arc<SqliteGateway> {
    let gateway = SqliteGateway::new(dir.path().join("timings.db"), "requests")
        .await
        .unwrap();
    gateway.setup().await.unwrap();
    Arc::new(gateway)
}

pub fn memory_gateway(table: &str) -> Arc<MemoryGateway> {
    Arc::new(MemoryGateway::new(TableKey::new("public", table)))
}

/// A local port nothing listens on
#[cfg(feature = "storage-postgres")]
pub async fn refused_port() -> u16 {
    let listener = tokio::net::TcpListener::bind((std::net::Ipv4Addr::LOCALHOST, 0))
        .await
        .unwrap();
    listener.local_addr().unwrap().port()
}

#[cfg(feature = "storage-postgres")]
pub async fn unreachable_postgres() -> PostgresGateway {
    PostgresGateway::new(ConnectionConfig {
        host: "127.0.0.1".to_string(),
        port: refused_port().await,
        username: "timings".to_string(),
        password: Secret::new("secret"),
        database: "observability".to_string(),
        schema: "public".to_string(),
        table: "requests".to_string(),
        ssh: None,
        connect_timeout: Duration::from_millis(300),
    })
}

/// How a [`ScriptedGateway`] misbehaves
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Failure {
    None,
    Commit,
    SlowSession,
}

/// Gateway double wrapping a [`MemoryGateway`], counting sessions and
/// failing on demand
pub struct ScriptedGateway {
    inner: MemoryGateway,
    failure: Failure,
    pub opened: AtomicUsize,
    pub closed: Arc<AtomicUsize>,
}

impl ScriptedGateway {
    pub fn new(table: &str, failure: Failure) -> Self {
        Self {
            inner: MemoryGateway::new(TableKey::new("public", table)),
            failure,
            opened: AtomicUsize::new(0),
            closed: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn inner(&self) -> &MemoryGateway {
        &self.inner
    }
}

#[async_trait]
impl StorageGateway for ScriptedGateway {
    fn name(&self) -> &'static str {
        "scripted"
    }

    fn target(&self) -> TableKey {
        self.inner.target()
    }

    async fn setup(&self) -> GatewayResult<()> {
        self.inner.setup().await
    }

    async fn session(&self) -> GatewayResult<Box<dyn GatewaySession>> {
        if self.failure == Failure::SlowSession {
            tokio::time::sleep(Duration::from_secs(30)).await;
        }
        self.opened.fetch_add(1, Ordering::SeqCst);

        Ok(Box::new(ScriptedSession {
            inner: self.inner.session().await?,
            fail_commit: self.failure == Failure::Commit,
            closed: self.closed.clone(),
        }))
    }
}

struct ScriptedSession {
    inner: Box<dyn GatewaySession>,
    fail_commit: bool,
    closed: Arc<AtomicUsize>,
}

#[async_trait]
impl GatewaySession for ScriptedSession {
    async fn add(&mut self, record: &TimingRecord) -> GatewayResult<i64> {
        self.inner.add(record).await
    }

    async fn commit(&mut self) -> GatewayResult<()> {
        if self.fail_commit {
            return Err(GatewayError::Persistence("disk full".to_string()));
        }
        self.inner.commit().await
    }

    async fn recent(&mut self, limit: usize) -> GatewayResult<Vec<StoredRecord>> {
        self.inner.recent(limit).await
    }

    async fn close(self: Box<Self>) {
        self.closed.fetch_add(1, Ordering::SeqCst);
        self.inner.close().await;
    }
}
