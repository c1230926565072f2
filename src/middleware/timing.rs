//! Request timing middleware

use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::{
    Router,
    extract::{Request, State},
    middleware::Next,
    response::Response,
};
use serde_json::Value;
use tracing::{debug, error, instrument, trace};

use super::payload::{HeaderAllowlist, RequestSnapshot};
use crate::config::TimingSettings;
use crate::storage::{GatewayResult, RecordFactory, StorageGateway, with_session};

const DEFAULT_PERSIST_TIMEOUT: Duration = Duration::from_secs(10);

/// Where a request's timing flow ended up.
///
/// `Start → Measuring → Persisting → Done`, or `Persisting → Degraded` when
/// the record could not be written. Both `Done` and `Degraded` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimingPhase {
    Start,
    Measuring,
    Persisting,
    Done,
    Degraded,
}

#[derive(Debug, Clone)]
pub struct TimingOptions {
    /// Request headers copied into the payload
    pub headers: HeaderAllowlist,

    /// Upper bound for opening the session, writing and committing
    pub persist_timeout: Duration,
}

impl Default for TimingOptions {
    fn default() -> Self {
        Self {
            headers: HeaderAllowlist::default(),
            persist_timeout: DEFAULT_PERSIST_TIMEOUT,
        }
    }
}

impl From<&TimingSettings> for TimingOptions {
    fn from(settings: &TimingSettings) -> Self {
        Self {
            headers: settings
                .header_allowlist
                .as_ref()
                .map(HeaderAllowlist::new)
                .unwrap_or_default(),
            persist_timeout: settings
                .persist_timeout_secs
                .map_or(DEFAULT_PERSIST_TIMEOUT, Duration::from_secs),
        }
    }
}

/// Times every request passing through it and persists one record per
/// completed request through a [`StorageGateway`].
///
/// Persistence is best effort: failures are logged and the response the
/// inner service produced is always returned as is.
#[derive(Clone)]
pub struct TimingMiddleware {
    gateway: Arc<dyn StorageGateway>,
    options: Arc<TimingOptions>,
}

impl TimingMiddleware {
    pub fn new(gateway: Arc<dyn StorageGateway>, options: TimingOptions) -> Self {
        Self {
            gateway,
            options: Arc::new(options),
        }
    }

    /// Wrap `router` so every route and every layer added before this call
    /// is timed.
    pub fn instrument<S>(self, router: Router<S>) -> Router<S>
    where
        S: Clone + Send + Sync + 'static,
    {
        router.layer(axum::middleware::from_fn_with_state(self, record_timing))
    }

    /// Write one payload through a fresh session, returning the record id
    pub async fn write(&self, payload: Value) -> GatewayResult<i64> {
        let target = self.gateway.target();
        let record = RecordFactory::build(&target.table, &target.schema, payload);

        with_session(self.gateway.as_ref(), |session| {
            Box::pin(async move {
                let id = session.add(&record).await?;
                session.commit().await?;
                Ok(id)
            })
        })
        .await
    }

    /// Persist one payload, returning the terminal phase. Failures are
    /// logged, never returned.
    #[instrument(skip_all, fields(backend = self.gateway.name()))]
    pub async fn persist(&self, payload: Value) -> TimingPhase {
        trace!(phase = ?TimingPhase::Persisting);

        let target = self.gateway.target();
        let write = self.write(payload);

        match tokio::time::timeout(self.options.persist_timeout, write).await {
            Ok(Ok(id)) => {
                debug!(id, table = %target, "request timing committed");
                TimingPhase::Done
            }
            Ok(Err(e)) => {
                error!(
                    table = %target,
                    kind = e.kind(),
                    "failed to persist request timing: {}",
                    e
                );
                TimingPhase::Degraded
            }
            Err(_) => {
                error!(
                    table = %target,
                    "persisting request timing timed out after {:?}",
                    self.options.persist_timeout
                );
                TimingPhase::Degraded
            }
        }
    }
}

/// Axum middleware function behind [`TimingMiddleware::instrument`]
pub async fn record_timing(
    State(timing): State<TimingMiddleware>,
    request: Request,
    next: Next,
) -> Response {
    let started = Instant::now();
    let snapshot = RequestSnapshot::capture(&request, &timing.options.headers);
    trace!(phase = ?TimingPhase::Start, url = %snapshot.url);

    trace!(phase = ?TimingPhase::Measuring);
    let response = next.run(request).await;
    let elapsed = started.elapsed();

    let payload = snapshot.into_payload(elapsed, response.status());
    let phase = timing.persist(payload).await;
    trace!(?phase, ?elapsed, "request timing finished");

    response
}
