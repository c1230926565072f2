//! Timing table definitions and record types
//!
//! Every backend stores the same record shape:
//!
//! | column      | meaning                                  |
//! |-------------|------------------------------------------|
//! | `id`        | integer primary key, assigned on insert  |
//! | `data`      | JSON document, stored and never parsed   |
//! | `timestamp` | creation time, defaulted by the backend  |
//!
//! Which physical table a record lands in is decided by its [`TableKey`].
//! Keys are declared lazily in the process-wide [`TableRegistry`]; declaring
//! the same key twice returns the definition created the first time.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, LazyLock, PoisonError, RwLock};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::debug;

/// Identity of a timing table: `(schema, table)`
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TableKey {
    pub schema: String,
    pub table: String,
}

impl TableKey {
    pub fn new(schema: impl Into<String>, table: impl Into<String>) -> Self {
        Self {
            schema: schema.into(),
            table: table.into(),
        }
    }

    /// `"schema"."table"`, quoted for use in SQL
    pub fn qualified(&self) -> String {
        format!("{}.{}", quote_ident(&self.schema), quote_ident(&self.table))
    }
}

impl fmt::Display for TableKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.schema, self.table)
    }
}

/// Quote an SQL identifier, doubling embedded quotes
pub fn quote_ident(ident: &str) -> String {
    format!("\"{}\"", ident.replace('"', "\"\""))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnKind {
    Identity,
    Document,
    CreatedAt,
}

#[derive(Debug, Clone, Copy)]
pub struct ColumnSpec {
    pub name: &'static str,
    pub kind: ColumnKind,
}

/// The fixed column layout shared by every timing table
pub const TIMING_COLUMNS: [ColumnSpec; 3] = [
    ColumnSpec {
        name: "id",
        kind: ColumnKind::Identity,
    },
    ColumnSpec {
        name: "data",
        kind: ColumnKind::Document,
    },
    ColumnSpec {
        name: "timestamp",
        kind: ColumnKind::CreatedAt,
    },
];

/// SQL flavour used to render DDL
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dialect {
    Postgres,
    Sqlite,
}

impl Dialect {
    fn column_type(self, kind: ColumnKind) -> &'static str {
        match (self, kind) {
            (Dialect::Postgres, ColumnKind::Identity) => "SERIAL PRIMARY KEY",
            (Dialect::Postgres, ColumnKind::Document) => "JSONB",
            (Dialect::Postgres, ColumnKind::CreatedAt) => "TIMESTAMPTZ NOT NULL DEFAULT now()",
            (Dialect::Sqlite, ColumnKind::Identity) => "INTEGER PRIMARY KEY AUTOINCREMENT",
            (Dialect::Sqlite, ColumnKind::Document) => "TEXT",
            (Dialect::Sqlite, ColumnKind::CreatedAt) => {
                "TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ', 'now'))"
            }
        }
    }
}

/// Declared shape of one timing table
#[derive(Debug)]
pub struct TableDefinition {
    key: TableKey,
    columns: &'static [ColumnSpec],
    // serializes DDL for this table within the process
    ddl_lock: Mutex<()>,
}

impl TableDefinition {
    fn new(key: TableKey) -> Self {
        Self {
            key,
            columns: &TIMING_COLUMNS,
            ddl_lock: Mutex::new(()),
        }
    }

    pub fn key(&self) -> &TableKey {
        &self.key
    }

    pub fn columns(&self) -> &'static [ColumnSpec] {
        self.columns
    }

    pub fn ddl_lock(&self) -> &Mutex<()> {
        &self.ddl_lock
    }

    /// `CREATE TABLE IF NOT EXISTS` statement for this table
    pub fn create_table_sql(&self, dialect: Dialect) -> String {
        let columns = self
            .columns
            .iter()
            .map(|column| format!("{} {}", quote_ident(column.name), dialect.column_type(column.kind)))
            .collect::<Vec<_>>()
            .join(", ");

        format!(
            "CREATE TABLE IF NOT EXISTS {} ({})",
            self.key.qualified(),
            columns
        )
    }

    /// `CREATE SCHEMA IF NOT EXISTS` statement, if the dialect has schemas
    pub fn create_schema_sql(&self, dialect: Dialect) -> Option<String> {
        match dialect {
            Dialect::Postgres => Some(format!(
                "CREATE SCHEMA IF NOT EXISTS {}",
                quote_ident(&self.key.schema)
            )),
            Dialect::Sqlite => None,
        }
    }
}

static GLOBAL_REGISTRY: LazyLock<TableRegistry> = LazyLock::new(TableRegistry::new);

/// Registry of declared timing tables.
///
/// The process-wide instance starts empty and only ever grows.
#[derive(Debug, Default)]
pub struct TableRegistry {
    tables: RwLock<HashMap<TableKey, Arc<TableDefinition>>>,
}

impl TableRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn global() -> &'static TableRegistry {
        &GLOBAL_REGISTRY
    }

    /// Declare `key`, returning the existing definition if there is one
    pub fn declare(&self, key: &TableKey) -> Arc<TableDefinition> {
        if let Some(definition) = self
            .tables
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
        {
            return definition.clone();
        }

        let mut tables = self.tables.write().unwrap_or_else(PoisonError::into_inner);
        tables
            .entry(key.clone())
            .or_insert_with(|| {
                debug!("declaring timing table {key}");
                Arc::new(TableDefinition::new(key.clone()))
            })
            .clone()
    }

    pub fn get(&self, key: &TableKey) -> Option<Arc<TableDefinition>> {
        self.tables
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.tables
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// One timing event, bound to the table it will be written to
#[derive(Debug, Clone)]
pub struct TimingRecord {
    table: Arc<TableDefinition>,

    /// Free-form payload (execution time, URL, headers, session)
    pub data: serde_json::Value,
}

impl TimingRecord {
    pub(crate) fn new(table: Arc<TableDefinition>, data: serde_json::Value) -> Self {
        Self { table, data }
    }

    pub fn table(&self) -> &Arc<TableDefinition> {
        &self.table
    }
}

/// A timing record as read back from a backend
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredRecord {
    pub id: i64,
    pub data: serde_json::Value,
    pub timestamp: DateTime<Utc>,
}
