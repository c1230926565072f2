//! Construction of timing records

use serde_json::Value;

use super::schema::{TableKey, TableRegistry, TimingRecord};

/// Builds unpersisted [`TimingRecord`]s.
///
/// The target table is declared in the registry on first use. Committing the
/// record is left to whoever holds the session.
#[derive(Debug, Clone, Copy)]
pub struct RecordFactory<'r> {
    registry: &'r TableRegistry,
}

impl RecordFactory<'static> {
    /// Factory backed by the process-wide registry
    pub fn global() -> Self {
        Self {
            registry: TableRegistry::global(),
        }
    }

    /// Shorthand for `RecordFactory::global().create(..)`
    pub fn build(table: &str, schema: &str, payload: Value) -> TimingRecord {
        Self::global().create(table, schema, payload)
    }
}

impl<'r> RecordFactory<'r> {
    pub fn with_registry(registry: &'r TableRegistry) -> Self {
        Self { registry }
    }

    pub fn create(&self, table: &str, schema: &str, payload: Value) -> TimingRecord {
        let definition = self.registry.declare(&TableKey::new(schema, table));
        TimingRecord::new(definition, payload)
    }
}
