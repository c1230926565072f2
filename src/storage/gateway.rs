//! Storage gateway trait definition
//!
//! This module defines the contract every storage backend implements and
//! the scoped-session helper the middleware persists through.

use async_trait::async_trait;
use futures::future::BoxFuture;
use tracing::debug;

use super::error::GatewayResult;
use super::schema::{StoredRecord, TableKey, TimingRecord};

/// Trait for timing record backends
///
/// A gateway knows how to reach one backend and hands out short-lived
/// sessions to it. The middleware only ever talks to this trait, so a
/// backend can be swapped at construction time without touching it.
///
/// ## Thread Safety
///
/// Implementations must be `Send + Sync`; one gateway is shared by every
/// in-flight request. Sessions are never shared.
#[async_trait]
pub trait StorageGateway: Send + Sync {
    /// Backend name, e.g. `"postgres"`
    fn name(&self) -> &'static str;

    /// Table timing records are written to
    fn target(&self) -> TableKey;

    /// Prepare backend prerequisites (schema and table).
    ///
    /// Safe to call any number of times. Fails with
    /// [`GatewayError::Setup`](super::GatewayError::Setup) if the backend is
    /// unreachable or rejects the credentials.
    async fn setup(&self) -> GatewayResult<()>;

    /// Open a new session. Prefer [`with_session`], which guarantees the
    /// session is closed again.
    async fn session(&self) -> GatewayResult<Box<dyn GatewaySession>>;
}

/// One transactional unit of work against a backend
#[async_trait]
pub trait GatewaySession: Send {
    /// Stage a record in the open transaction, returning its assigned id
    async fn add(&mut self, record: &TimingRecord) -> GatewayResult<i64>;

    /// Commit everything staged so far
    async fn commit(&mut self) -> GatewayResult<()>;

    /// Read back the `limit` newest records of the gateway's target table
    async fn recent(&mut self, limit: usize) -> GatewayResult<Vec<StoredRecord>>;

    /// Release every resource held by the session. Uncommitted work is
    /// rolled back. Teardown failures are logged, never returned.
    async fn close(self: Box<Self>);
}

/// Run `f` inside a fresh session and close the session afterwards,
/// whatever `f` returned.
///
/// ```no_run
/// # use request_timings::storage::{StorageGateway, RecordFactory, with_session};
/// # async fn example(gateway: &dyn StorageGateway) -> request_timings::storage::GatewayResult<()> {
/// let record = RecordFactory::build("requests", "public", serde_json::json!({}));
/// with_session(gateway, |session| {
///     Box::pin(async move {
///         session.add(&record).await?;
///         session.commit().await
///     })
/// })
/// .await
/// # }
/// ```
pub async fn with_session<T, F>(gateway: &dyn StorageGateway, f: F) -> GatewayResult<T>
where
    T: Send,
    F: for<'s> FnOnce(&'s mut dyn GatewaySession) -> BoxFuture<'s, GatewayResult<T>> + Send,
{
    let mut session = gateway.session().await?;
    debug!(backend = gateway.name(), "session opened");

    let result = f(session.as_mut()).await;

    session.close().await;
    debug!(backend = gateway.name(), "session closed");

    result
}
