//! In-memory gateway (no persistence)
//!
//! Keeps committed timing records in a bounded buffer inside the process.
//! It's useful for:
//! - Running the middleware without a database
//! - Tests that need to look at what was written
//!
//! ## Limitations
//!
//! - **No persistence**: All data lost on restart
//! - **Limited capacity**: oldest records are evicted once the buffer is full

use std::collections::VecDeque;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::RwLock;
use tracing::debug;

use super::error::{GatewayError, GatewayResult};
use super::gateway::{GatewaySession, StorageGateway};
use super::schema::{StoredRecord, TableKey, TableRegistry, TimingRecord};

/// Maximum records kept in memory
const MAX_RECORDS: usize = 10_000;

#[derive(Debug, Default)]
struct Store {
    records: VecDeque<(TableKey, StoredRecord)>,
    next_id: i64,
}

/// In-memory gateway
#[derive(Debug, Clone)]
pub struct MemoryGateway {
    target: TableKey,
    store: Arc<RwLock<Store>>,
}

impl MemoryGateway {
    pub const NAME: &'static str = "memory";

    pub fn new(target: TableKey) -> Self {
        Self {
            target,
            store: Arc::default(),
        }
    }

    /// Number of committed records across all tables
    pub async fn len(&self) -> usize {
        self.store.read().await.records.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[async_trait]
impl StorageGateway for MemoryGateway {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn target(&self) -> TableKey {
        self.target.clone()
    }

    async fn setup(&self) -> GatewayResult<()> {
        TableRegistry::global().declare(&self.target);
        Ok(())
    }

    async fn session(&self) -> GatewayResult<Box<dyn GatewaySession>> {
        Ok(Box::new(MemorySession {
            target: self.target.clone(),
            store: self.store.clone(),
            staged: Some(Vec::new()),
        }))
    }
}

struct MemorySession {
    target: TableKey,
    store: Arc<RwLock<Store>>,
    staged: Option<Vec<(TableKey, StoredRecord)>>,
}

#[async_trait]
impl GatewaySession for MemorySession {
    async fn add(&mut self, record: &TimingRecord) -> GatewayResult<i64> {
        let staged = self
            .staged
            .as_mut()
            .ok_or_else(|| GatewayError::Persistence("session already committed".to_string()))?;

        let id = {
            let mut store = self.store.write().await;
            store.next_id += 1;
            store.next_id
        };

        staged.push((
            record.table().key().clone(),
            StoredRecord {
                id,
                data: record.data.clone(),
                timestamp: Utc::now(),
            },
        ));
        Ok(id)
    }

    async fn commit(&mut self) -> GatewayResult<()> {
        let staged = self
            .staged
            .take()
            .ok_or_else(|| GatewayError::Persistence("session already committed".to_string()))?;

        let mut store = self.store.write().await;
        for entry in staged {
            if store.records.len() >= MAX_RECORDS {
                store.records.pop_front();
            }
            store.records.push_back(entry);
        }
        Ok(())
    }

    async fn recent(&mut self, limit: usize) -> GatewayResult<Vec<StoredRecord>> {
        let store = self.store.read().await;
        let mut records: Vec<_> = store
            .records
            .iter()
            .filter(|(key, _)| key == &self.target)
            .map(|(_, record)| record.clone())
            .collect();

        records.sort_by(|a, b| b.timestamp.cmp(&a.timestamp).then(b.id.cmp(&a.id)));
        records.truncate(limit);
        Ok(records)
    }

    async fn close(self: Box<Self>) {
        if let Some(staged) = &self.staged {
            if !staged.is_empty() {
                debug!("discarding {} uncommitted in-memory records", staged.len());
            }
        }
    }
}
