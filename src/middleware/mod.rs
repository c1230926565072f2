//! HTTP middleware recording per-request execution time
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use axum::{Router, routing::get};
//! use request_timings::middleware::{TimingMiddleware, TimingOptions};
//! use request_timings::storage::{TableKey, memory::MemoryGateway};
//!
//! let gateway = Arc::new(MemoryGateway::new(TableKey::new("public", "requests")));
//! let app: Router = TimingMiddleware::new(gateway, TimingOptions::default())
//!     .instrument(Router::new().route("/health", get(|| async { "ok" })));
//! ```

pub mod payload;
pub mod timing;

pub use payload::{HeaderAllowlist, SessionData};
pub use timing::{TimingMiddleware, TimingOptions, TimingPhase, record_timing};
