//! Per-request execution timing for axum services, persisted through
//! swappable storage gateways.
//!
//! - [`middleware`]: the timing layer and the payload it records
//! - [`storage`]: the gateway contract and its Postgres, SQLite and in-memory backends
//! - [`tunnel`]: SSH port forwarding used by the Postgres backend
//! - [`config`]: connection settings from the environment or a config file

pub mod config;
pub mod middleware;
pub mod storage;
#[cfg(feature = "storage-postgres")]
pub mod tunnel;
