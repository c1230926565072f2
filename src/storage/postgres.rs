//! Postgres gateway, optionally reached through an SSH tunnel
//!
//! Every session is fully self-contained: it opens its own tunnel (when SSH
//! settings are present) and its own single-connection engine, and tears
//! both down again when it is closed. Nothing but the immutable
//! [`ConnectionConfig`] is shared between requests.
//!
//! ## Session lifecycle
//!
//! 1. open the tunnel, if configured
//! 2. connect to the tunnel's local port, or straight to `host:port`
//! 3. create the target schema and table if they are missing
//! 4. begin one transaction
//! 5. on close: roll back whatever was not committed, close the engine,
//!    stop the tunnel
//!
//! Teardown never fails; every step runs and problems are logged.

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgConnectOptions, PgPoolOptions};
use sqlx::types::Json;
use sqlx::{PgConnection, PgPool, Postgres, Transaction};
use tracing::{debug, info, instrument, warn};

use super::error::{GatewayError, GatewayResult};
use super::gateway::{GatewaySession, StorageGateway};
use super::schema::{Dialect, StoredRecord, TableDefinition, TableKey, TableRegistry, TimingRecord};
use crate::config::ConnectionConfig;
use crate::tunnel::{RemoteEndpoint, SshConnector, Tunnel, TunnelConnector};

/// SQLSTATEs raised when a concurrent `CREATE ... IF NOT EXISTS` won the race
const ALREADY_EXISTS_CODES: [&str; 3] = ["42P06", "42P07", "23505"];

/// Postgres storage gateway
pub struct PostgresGateway {
    config: Arc<ConnectionConfig>,
    connector: Arc<dyn TunnelConnector>,
}

impl PostgresGateway {
    pub const NAME: &'static str = "postgres";

    /// Gateway that tunnels over SSH when the config asks for it
    pub fn new(config: ConnectionConfig) -> Self {
        Self::with_connector(config, Arc::new(SshConnector))
    }

    pub fn with_connector(config: ConnectionConfig, connector: Arc<dyn TunnelConnector>) -> Self {
        Self {
            config: Arc::new(config),
            connector,
        }
    }
}

#[async_trait]
impl StorageGateway for PostgresGateway {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn target(&self) -> TableKey {
        self.config.target()
    }

    #[instrument(skip(self), fields(endpoint = %self.config.endpoint(), table = %self.config.target()))]
    async fn setup(&self) -> GatewayResult<()> {
        let session = TunnelSession::open(&self.config, self.connector.as_ref())
            .await
            .map_err(GatewayError::into_setup)?;
        Box::new(session).close().await;

        info!("timing table {} ready", self.config.target());
        Ok(())
    }

    async fn session(&self) -> GatewayResult<Box<dyn GatewaySession>> {
        let session = TunnelSession::open(&self.config, self.connector.as_ref()).await?;
        Ok(Box::new(session))
    }
}

/// One request's connection: optional tunnel, engine and transaction.
///
/// Fields are declared in teardown order, so an abandoned session that is
/// only dropped still releases the transaction before the engine and the
/// engine before the tunnel.
pub struct TunnelSession {
    tx: Option<Transaction<'static, Postgres>>,
    pool: PgPool,
    tunnel: Option<Box<dyn Tunnel>>,
    target: Arc<TableDefinition>,
    materialized: HashSet<TableKey>,
}

impl TunnelSession {
    #[instrument(skip_all, fields(endpoint = %config.endpoint(), tunnelled = config.is_tunnelled()))]
    pub async fn open(
        config: &ConnectionConfig,
        connector: &dyn TunnelConnector,
    ) -> GatewayResult<Self> {
        let tunnel = match &config.ssh {
            Some(ssh) => {
                let remote = RemoteEndpoint {
                    host: config.host.clone(),
                    port: config.port,
                };
                Some(connector.open(ssh, &remote, config.connect_timeout).await?)
            }
            None => {
                debug!("no SSH settings, connecting directly");
                None
            }
        };

        match Self::connect(config, tunnel.as_deref()).await {
            Ok((pool, tx, target)) => {
                let mut materialized = HashSet::new();
                materialized.insert(target.key().clone());
                Ok(Self {
                    tx: Some(tx),
                    pool,
                    tunnel,
                    target,
                    materialized,
                })
            }
            Err(e) => {
                if let Some(tunnel) = tunnel {
                    stop_tunnel(tunnel).await;
                }
                Err(e)
            }
        }
    }

    async fn connect(
        config: &ConnectionConfig,
        tunnel: Option<&dyn Tunnel>,
    ) -> GatewayResult<(PgPool, Transaction<'static, Postgres>, Arc<TableDefinition>)> {
        let (host, port) = match tunnel {
            Some(tunnel) => {
                let addr = tunnel.local_addr();
                (addr.ip().to_string(), addr.port())
            }
            None => (config.host.clone(), config.port),
        };

        let options = PgConnectOptions::new()
            .host(&host)
            .port(port)
            .username(&config.username)
            .password(config.password.expose())
            .database(&config.database);

        let pool = PgPoolOptions::new()
            .max_connections(1)
            .acquire_timeout(config.connect_timeout)
            .connect_with(options)
            .await
            .map_err(|e| {
                GatewayError::Connection(format!("{} ({}:{}): {}", config.endpoint(), host, port, e))
            })?;

        let target = TableRegistry::global().declare(&config.target());
        let prepared = async {
            let mut conn = pool
                .acquire()
                .await
                .map_err(|e| GatewayError::Connection(e.to_string()))?;
            materialize(&mut conn, &target, false).await?;
            drop(conn);

            pool.begin()
                .await
                .map_err(|e| GatewayError::Connection(e.to_string()))
        }
        .await;

        match prepared {
            Ok(tx) => Ok((pool, tx, target)),
            Err(e) => {
                pool.close().await;
                Err(e)
            }
        }
    }
}

#[async_trait]
impl GatewaySession for TunnelSession {
    async fn add(&mut self, record: &TimingRecord) -> GatewayResult<i64> {
        let tx = self
            .tx
            .as_mut()
            .ok_or_else(|| GatewayError::Persistence("session already committed".to_string()))?;

        let key = record.table().key();
        if !self.materialized.contains(key) {
            materialize(tx, record.table(), true).await?;
            self.materialized.insert(key.clone());
        }

        let sql = format!(
            r#"INSERT INTO {} ("data") VALUES ($1) RETURNING "id""#,
            key.qualified()
        );
        let id: i32 = sqlx::query_scalar(&sql)
            .bind(Json(&record.data))
            .fetch_one(&mut **tx)
            .await
            .map_err(|e| GatewayError::Persistence(e.to_string()))?;

        debug!("staged timing record {} in {}", id, key);
        Ok(i64::from(id))
    }

    async fn commit(&mut self) -> GatewayResult<()> {
        let tx = self
            .tx
            .take()
            .ok_or_else(|| GatewayError::Persistence("session already committed".to_string()))?;

        tx.commit()
            .await
            .map_err(|e| GatewayError::Persistence(e.to_string()))
    }

    async fn recent(&mut self, limit: usize) -> GatewayResult<Vec<StoredRecord>> {
        let sql = format!(
            r#"SELECT "id", "data", "timestamp" FROM {} ORDER BY "timestamp" DESC, "id" DESC LIMIT $1"#,
            self.target.key().qualified()
        );
        let query = sqlx::query_as::<_, (i32, Option<Json<serde_json::Value>>, DateTime<Utc>)>(&sql)
            .bind(limit as i64);

        let rows = match self.tx.as_mut() {
            Some(tx) => query.fetch_all(&mut **tx).await,
            None => query.fetch_all(&self.pool).await,
        }
        .map_err(|e| GatewayError::Persistence(e.to_string()))?;

        Ok(rows
            .into_iter()
            .map(|(id, data, timestamp)| StoredRecord {
                id: i64::from(id),
                data: data.map(|Json(value)| value).unwrap_or_default(),
                timestamp,
            })
            .collect())
    }

    async fn close(self: Box<Self>) {
        let mut session = *self;

        if let Some(tx) = session.tx.take() {
            if let Err(e) = tx.rollback().await {
                warn!("failed to roll back uncommitted transaction: {}", e);
            }
        }

        session.pool.close().await;

        if let Some(tunnel) = session.tunnel.take() {
            stop_tunnel(tunnel).await;
        }
    }
}

async fn stop_tunnel(tunnel: Box<dyn Tunnel>) {
    let local_addr = tunnel.local_addr();
    if let Err(e) = tunnel.stop().await {
        warn!("failed to stop tunnel on {}: {}", local_addr, e);
    }
}

/// Create schema and table for `definition` if they do not exist yet.
///
/// Inside a transaction each statement runs under a savepoint, so a lost
/// `IF NOT EXISTS` race does not abort the surrounding transaction.
async fn materialize(
    conn: &mut PgConnection,
    definition: &TableDefinition,
    in_transaction: bool,
) -> GatewayResult<()> {
    let _guard = definition.ddl_lock().lock().await;

    let statements = definition
        .create_schema_sql(Dialect::Postgres)
        .into_iter()
        .chain(std::iter::once(definition.create_table_sql(Dialect::Postgres)));

    for statement in statements {
        if in_transaction {
            savepoint(conn, "SAVEPOINT materialize").await?;
        }

        match sqlx::query(&statement).execute(&mut *conn).await {
            Ok(_) => {
                if in_transaction {
                    savepoint(conn, "RELEASE SAVEPOINT materialize").await?;
                }
            }
            Err(e) if is_already_exists(&e) => {
                debug!("{} already exists: {}", definition.key(), e);
                if in_transaction {
                    savepoint(conn, "ROLLBACK TO SAVEPOINT materialize").await?;
                }
            }
            Err(e) => {
                return Err(GatewayError::Connection(format!(
                    "failed to create {}: {}",
                    definition.key(),
                    e
                )));
            }
        }
    }

    Ok(())
}

async fn savepoint(conn: &mut PgConnection, sql: &str) -> GatewayResult<()> {
    sqlx::query(sql)
        .execute(&mut *conn)
        .await
        .map_err(|e| GatewayError::Connection(format!("{sql}: {e}")))?;
    Ok(())
}

fn is_already_exists(err: &sqlx::Error) -> bool {
    err.as_database_error()
        .and_then(|e| e.code())
        .is_some_and(|code| ALREADY_EXISTS_CODES.contains(&code.as_ref()))
}
