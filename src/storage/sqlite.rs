//! SQLite gateway implementation
//!
//! Embedded backend that keeps timing records in a local database file.
//! There is no tunnel and no per-request engine: one connection pool lives
//! as long as the gateway and every session borrows a transaction from it.
//!
//! SQLite has no user schemas, so the target table always lives in `main`.
//!
//! ## Features
//!
//! - **WAL mode**: readers are not blocked by the per-request writers
//! - **Busy timeout**: concurrent request transactions wait instead of failing

use std::collections::HashSet;
use std::path::Path;
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use sqlx::{Pool, Sqlite, SqliteConnection, Transaction};
use tracing::{debug, info, instrument, warn};

use super::error::{GatewayError, GatewayResult};
use super::gateway::{GatewaySession, StorageGateway};
use super::schema::{Dialect, StoredRecord, TableDefinition, TableKey, TableRegistry, TimingRecord};

const SQLITE_SCHEMA: &str = "main";

/// Tables already created in this database file
type KnownTables = Arc<Mutex<HashSet<TableKey>>>;

/// SQLite storage gateway
pub struct SqliteGateway {
    pool: Pool<Sqlite>,
    db_path: String,
    target: TableKey,
    known: KnownTables,
}

impl SqliteGateway {
    pub const NAME: &'static str = "sqlite";

    /// Open (or create) the database file at `db_path`, writing to `table`.
    ///
    /// The table itself is created by [`StorageGateway::setup`] or lazily by
    /// the first insert.
    #[instrument(skip_all)]
    pub async fn new(db_path: impl AsRef<Path>, table: &str) -> GatewayResult<Self> {
        let db_path_str = db_path.as_ref().to_string_lossy().to_string();

        info!("initializing SQLite gateway at: {}", db_path_str);

        let options = SqliteConnectOptions::new()
            .filename(&db_path_str)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .busy_timeout(std::time::Duration::from_secs(30));

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await
            .map_err(|e| GatewayError::Connection(e.to_string()))?;

        info!("SQLite connection pool created");

        Ok(Self {
            pool,
            db_path: db_path_str,
            target: TableKey::new(SQLITE_SCHEMA, table),
            known: Arc::default(),
        })
    }

    pub fn path(&self) -> &str {
        &self.db_path
    }

    /// Close the underlying pool
    pub async fn close(&self) {
        debug!("closing SQLite pool");
        self.pool.close().await;
    }

    /// Create the table for `definition` on its own autocommit connection,
    /// so the DDL is durable before any request transaction relies on it.
    async fn prepare(&self, definition: &TableDefinition) -> GatewayResult<()> {
        if is_known(&self.known, definition.key()) {
            return Ok(());
        }

        let mut conn = self
            .pool
            .acquire()
            .await
            .map_err(|e| GatewayError::Connection(e.to_string()))?;

        let _guard = definition.ddl_lock().lock().await;
        if is_known(&self.known, definition.key()) {
            return Ok(());
        }

        create_table(&mut conn, definition).await?;
        mark_known(&self.known, [definition.key().clone()]);
        Ok(())
    }
}

#[async_trait]
impl StorageGateway for SqliteGateway {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn target(&self) -> TableKey {
        self.target.clone()
    }

    #[instrument(skip(self), fields(table = %self.target))]
    async fn setup(&self) -> GatewayResult<()> {
        let definition = TableRegistry::global().declare(&self.target);
        self.prepare(&definition)
            .await
            .map_err(GatewayError::into_setup)?;

        info!("timing table {} ready", self.target);
        Ok(())
    }

    async fn session(&self) -> GatewayResult<Box<dyn GatewaySession>> {
        let target = TableRegistry::global().declare(&self.target);
        self.prepare(&target).await?;

        let tx = self
            .pool
            .begin()
            .await
            .map_err(|e| GatewayError::Connection(e.to_string()))?;

        Ok(Box::new(SqliteSession {
            tx: Some(tx),
            pool: self.pool.clone(),
            target,
            known: self.known.clone(),
            created: Vec::new(),
        }))
    }
}

/// One request's transaction on the SQLite pool
pub struct SqliteSession {
    tx: Option<Transaction<'static, Sqlite>>,
    pool: Pool<Sqlite>,
    target: Arc<TableDefinition>,
    known: KnownTables,
    // tables created inside `tx`, only known once it commits
    created: Vec<TableKey>,
}

#[async_trait]
impl GatewaySession for SqliteSession {
    async fn add(&mut self, record: &TimingRecord) -> GatewayResult<i64> {
        let tx = self
            .tx
            .as_mut()
            .ok_or_else(|| GatewayError::Persistence("session already committed".to_string()))?;

        let key = record.table().key();
        if !is_known(&self.known, key) && !self.created.contains(key) {
            // Another connection cannot take the write lock while `tx` may
            // hold it, so the table is created inside the transaction.
            let _guard = record.table().ddl_lock().lock().await;
            create_table(tx, record.table()).await?;
            self.created.push(key.clone());
        }

        let data = serde_json::to_string(&record.data)?;
        let sql = format!(
            r#"INSERT INTO {} ("data") VALUES (?) RETURNING "id""#,
            key.qualified()
        );

        let id: i64 = sqlx::query_scalar(&sql)
            .bind(data)
            .fetch_one(&mut **tx)
            .await
            .map_err(|e| GatewayError::Persistence(e.to_string()))?;

        debug!("staged timing record {} in {}", id, key);
        Ok(id)
    }

    async fn commit(&mut self) -> GatewayResult<()> {
        let tx = self
            .tx
            .take()
            .ok_or_else(|| GatewayError::Persistence("session already committed".to_string()))?;

        tx.commit()
            .await
            .map_err(|e| GatewayError::Persistence(e.to_string()))?;

        mark_known(&self.known, self.created.drain(..));
        Ok(())
    }

    async fn recent(&mut self, limit: usize) -> GatewayResult<Vec<StoredRecord>> {
        let sql = format!(
            r#"SELECT "id", "data", "timestamp" FROM {} ORDER BY "timestamp" DESC, "id" DESC LIMIT ?"#,
            self.target.key().qualified()
        );
        let query = sqlx::query_as::<_, (i64, Option<String>, String)>(&sql).bind(limit as i64);

        let rows = match self.tx.as_mut() {
            Some(tx) => query.fetch_all(&mut **tx).await,
            None => query.fetch_all(&self.pool).await,
        }
        .map_err(|e| GatewayError::Persistence(e.to_string()))?;

        rows.into_iter()
            .map(|(id, data, timestamp)| {
                let data = match data {
                    Some(data) => serde_json::from_str(&data)?,
                    None => serde_json::Value::Null,
                };
                let timestamp = DateTime::parse_from_rfc3339(&timestamp)
                    .map_err(|e| {
                        GatewayError::Serialization(format!("invalid timestamp {timestamp:?}: {e}"))
                    })?
                    .with_timezone(&Utc);

                Ok(StoredRecord {
                    id,
                    data,
                    timestamp,
                })
            })
            .collect()
    }

    async fn close(self: Box<Self>) {
        let mut session = *self;
        if let Some(tx) = session.tx.take() {
            if let Err(e) = tx.rollback().await {
                warn!("failed to roll back uncommitted SQLite transaction: {}", e);
            }
        }
    }
}

fn is_known(known: &KnownTables, key: &TableKey) -> bool {
    known
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .contains(key)
}

fn mark_known(known: &KnownTables, keys: impl IntoIterator<Item = TableKey>) {
    known
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .extend(keys);
}

async fn create_table(conn: &mut SqliteConnection, definition: &TableDefinition) -> GatewayResult<()> {
    debug!("creating SQLite table {}", definition.key());
    sqlx::query(&definition.create_table_sql(Dialect::Sqlite))
        .execute(&mut *conn)
        .await
        .map_err(|e| GatewayError::Connection(e.to_string()))?;
    Ok(())
}
