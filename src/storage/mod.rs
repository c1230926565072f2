//! Storage gateways for timing records
//!
//! This module provides a trait-based abstraction over the backends timing
//! records are persisted to.
//!
//! ## Design
//!
//! - **Trait-based**: `StorageGateway` lets backends be swapped at construction time
//! - **Scoped sessions**: every write happens inside a session that is always closed
//! - **Lazy tables**: the target table is declared and created on first use
//!
//! ## Backends
//!
//! - **Postgres**: one tunnel + engine + transaction per request, optional SSH forwarding
//! - **SQLite**: embedded database file with a shared pool
//! - **In-Memory**: no persistence, for tests or running without a database
//!
//! ## Usage
//!
//! ```no_run
//! use request_timings::config::StorageConfig;
//! use request_timings::storage::connect;
//!
//! # async fn example(config: StorageConfig) -> anyhow::Result<()> {
//! let gateway = connect(&config).await?;
//! gateway.setup().await?;
//! # Ok(())
//! # }
//! ```

pub mod error;
pub mod factory;
pub mod gateway;
pub mod memory;
#[cfg(feature = "storage-postgres")]
pub mod postgres;
pub mod schema;
#[cfg(feature = "storage-sqlite")]
pub mod sqlite;

use std::sync::Arc;

use tracing::info;

pub use error::{GatewayError, GatewayResult};
pub use factory::RecordFactory;
pub use gateway::{GatewaySession, StorageGateway, with_session};
pub use schema::{StoredRecord, TableKey, TableRegistry, TimingRecord};

use crate::config::StorageConfig;

/// Build the gateway selected by `config`. Nothing is contacted yet; call
/// [`StorageGateway::setup`] before serving traffic.
pub async fn connect(config: &StorageConfig) -> GatewayResult<Arc<dyn StorageGateway>> {
    let gateway: Arc<dyn StorageGateway> = match config {
        #[cfg(feature = "storage-postgres")]
        StorageConfig::Postgres(settings) => {
            let config = crate::config::ConnectionConfig::try_from(settings.clone())?;
            Arc::new(postgres::PostgresGateway::new(config))
        }
        #[cfg(feature = "storage-sqlite")]
        StorageConfig::Sqlite { path, table } => {
            Arc::new(sqlite::SqliteGateway::new(path, table).await?)
        }
        StorageConfig::Memory { schema, table } => {
            Arc::new(memory::MemoryGateway::new(TableKey::new(schema, table)))
        }
        #[allow(unreachable_patterns)]
        other => {
            return Err(GatewayError::InvalidConfig(format!(
                "backend {other:?} is not compiled in"
            )));
        }
    };

    info!("using {} storage gateway for {}", gateway.name(), gateway.target());
    Ok(gateway)
}
