use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;
use tracing::trace;

use crate::storage::schema::TableKey;

pub const DATABASE_HOST: &str = "DATABASE_HOST";
pub const DATABASE_PORT: &str = "DATABASE_PORT";
pub const DATABASE_USERNAME: &str = "DATABASE_USERNAME";
pub const DATABASE_PASSWORD: &str = "DATABASE_PASSWORD";
pub const DATABASE_NAME: &str = "DATABASE_NAME";
pub const DATABASE_SCHEMA: &str = "DATABASE_SCHEMA";
pub const DATABASE_TABLE: &str = "DATABASE_TABLE";
pub const DATABASE_CONNECT_TIMEOUT_SECS: &str = "DATABASE_CONNECT_TIMEOUT_SECS";
pub const REMOTE_SSH_HOST: &str = "REMOTE_SSH_HOST";
pub const REMOTE_SSH_USER: &str = "REMOTE_SSH_USER";
pub const REMOTE_SSH_PORT: &str = "REMOTE_SSH_PORT";
pub const PEM_PATH: &str = "PEM_PATH";
pub const SSH_STRICT_HOST_KEY_CHECKING: &str = "SSH_STRICT_HOST_KEY_CHECKING";
pub const STORAGE_BACKEND: &str = "STORAGE_BACKEND";
pub const SQLITE_PATH: &str = "SQLITE_PATH";
pub const TIMING_PERSIST_TIMEOUT_SECS: &str = "TIMING_PERSIST_TIMEOUT_SECS";

const DEFAULT_POSTGRES_PORT: u16 = 5432;
const DEFAULT_SSH_PORT: u16 = 22;
const DEFAULT_SCHEMA: &str = "public";
const DEFAULT_TABLE: &str = "requests";
const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 5;

/// A credential that never shows up in `Debug` or `Display` output
#[derive(Clone, Deserialize)]
#[serde(transparent)]
pub struct Secret(String);

impl Secret {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Secret(***)")
    }
}

impl fmt::Display for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("***")
    }
}

/// Errors raised while reading or validating settings
#[derive(Debug)]
pub enum ConfigError {
    /// A required setting is absent
    Missing(&'static str),

    /// A setting is present but cannot be parsed
    Invalid { key: &'static str, value: String },

    /// Only some of the SSH tunnel settings were provided
    PartialTunnel { missing: Vec<&'static str> },

    /// The configuration file could not be read
    Io(std::io::Error),

    /// The configuration file could not be parsed
    Parse(String),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::Missing(key) => write!(f, "missing required setting {}", key),
            ConfigError::Invalid { key, value } => {
                write!(f, "invalid value {:?} for setting {}", value, key)
            }
            ConfigError::PartialTunnel { missing } => write!(
                f,
                "SSH tunnel settings are all-or-nothing, missing: {}",
                missing.join(", ")
            ),
            ConfigError::Io(err) => write!(f, "failed to read configuration: {}", err),
            ConfigError::Parse(msg) => write!(f, "failed to parse configuration: {}", msg),
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ConfigError::Io(err) => Some(err),
            _ => None,
        }
    }
}

impl From<std::io::Error> for ConfigError {
    fn from(err: std::io::Error) -> Self {
        ConfigError::Io(err)
    }
}

/// Raw connection settings as they come from the environment or a config file.
///
/// Nothing is validated here; convert into a [`ConnectionConfig`] to get a
/// value the gateways accept.
#[derive(Debug, Clone, Deserialize)]
pub struct ConnectionSettings {
    pub host: String,
    #[serde(default = "default_postgres_port")]
    pub port: u16,
    pub username: String,
    pub password: Secret,
    pub database: String,
    #[serde(default = "default_schema")]
    pub schema: String,
    pub table: String,
    pub ssh_host: Option<String>,
    pub ssh_user: Option<String>,
    pub ssh_key_path: Option<PathBuf>,
    pub ssh_port: Option<u16>,
    #[serde(default)]
    pub strict_host_key_checking: bool,
    pub connect_timeout_secs: Option<u64>,
}

impl ConnectionSettings {
    /// Read settings from the process environment
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Read settings through an arbitrary key lookup. Empty values count as unset.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|value| !value.trim().is_empty());
        let require = |key: &'static str| get(key).ok_or(ConfigError::Missing(key));

        Ok(Self {
            host: require(DATABASE_HOST)?,
            port: parse_or(get(DATABASE_PORT), DATABASE_PORT, DEFAULT_POSTGRES_PORT)?,
            username: require(DATABASE_USERNAME)?,
            password: Secret::new(require(DATABASE_PASSWORD)?),
            database: require(DATABASE_NAME)?,
            schema: get(DATABASE_SCHEMA).unwrap_or_else(default_schema),
            table: require(DATABASE_TABLE)?,
            ssh_host: get(REMOTE_SSH_HOST),
            ssh_user: get(REMOTE_SSH_USER),
            ssh_key_path: get(PEM_PATH).map(PathBuf::from),
            ssh_port: get(REMOTE_SSH_PORT)
                .map(|value| parse(&value, REMOTE_SSH_PORT))
                .transpose()?,
            strict_host_key_checking: parse_or(
                get(SSH_STRICT_HOST_KEY_CHECKING),
                SSH_STRICT_HOST_KEY_CHECKING,
                false,
            )?,
            connect_timeout_secs: get(DATABASE_CONNECT_TIMEOUT_SECS)
                .map(|value| parse(&value, DATABASE_CONNECT_TIMEOUT_SECS))
                .transpose()?,
        })
    }
}

/// SSH parameters of a tunnelled connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SshConfig {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub key_path: PathBuf,
    pub strict_host_key_checking: bool,
}

/// Validated, immutable description of where timing records go.
///
/// Built once at startup and shared read-only by every request.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: Secret,
    pub database: String,
    pub schema: String,
    pub table: String,
    pub ssh: Option<SshConfig>,
    pub connect_timeout: Duration,
}

impl ConnectionConfig {
    /// The (schema, table) pair records are written to
    pub fn target(&self) -> TableKey {
        TableKey::new(&self.schema, &self.table)
    }

    /// `host:port/database`, safe to log
    pub fn endpoint(&self) -> String {
        format!("{}:{}/{}", self.host, self.port, self.database)
    }

    pub fn is_tunnelled(&self) -> bool {
        self.ssh.is_some()
    }
}

impl TryFrom<ConnectionSettings> for ConnectionConfig {
    type Error = ConfigError;

    fn try_from(settings: ConnectionSettings) -> Result<Self, Self::Error> {
        if settings.host.trim().is_empty() {
            return Err(ConfigError::Missing(DATABASE_HOST));
        }
        if settings.table.trim().is_empty() {
            return Err(ConfigError::Missing(DATABASE_TABLE));
        }
        if settings.schema.trim().is_empty() {
            return Err(ConfigError::Missing(DATABASE_SCHEMA));
        }

        let ssh = match (settings.ssh_host, settings.ssh_user, settings.ssh_key_path) {
            (None, None, None) => None,
            (Some(host), Some(user), Some(key_path)) => Some(SshConfig {
                host,
                port: settings.ssh_port.unwrap_or(DEFAULT_SSH_PORT),
                user,
                key_path,
                strict_host_key_checking: settings.strict_host_key_checking,
            }),
            (host, user, key_path) => {
                let mut missing = vec![];
                if host.is_none() {
                    missing.push(REMOTE_SSH_HOST);
                }
                if user.is_none() {
                    missing.push(REMOTE_SSH_USER);
                }
                if key_path.is_none() {
                    missing.push(PEM_PATH);
                }
                return Err(ConfigError::PartialTunnel { missing });
            }
        };

        Ok(Self {
            host: settings.host,
            port: settings.port,
            username: settings.username,
            password: settings.password,
            database: settings.database,
            schema: settings.schema,
            table: settings.table,
            ssh,
            connect_timeout: Duration::from_secs(
                settings
                    .connect_timeout_secs
                    .unwrap_or(DEFAULT_CONNECT_TIMEOUT_SECS),
            ),
        })
    }
}

/// Storage backend configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "backend", rename_all = "lowercase")]
pub enum StorageConfig {
    /// Postgres, reached directly or through an SSH tunnel
    Postgres(ConnectionSettings),

    /// Embedded SQLite database file
    Sqlite {
        #[serde(default = "default_sqlite_path")]
        path: PathBuf,

        #[serde(default = "default_table")]
        table: String,
    },

    /// In-memory buffer (no persistence)
    Memory {
        #[serde(default = "default_schema")]
        schema: String,

        #[serde(default = "default_table")]
        table: String,
    },
}

/// Middleware tuning
#[derive(Debug, Clone, Default, Deserialize)]
pub struct TimingSettings {
    /// Request headers copied into the payload (lowercase names)
    pub header_allowlist: Option<Vec<String>>,

    /// Upper bound for the whole persistence step of one request
    pub persist_timeout_secs: Option<u64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub storage: StorageConfig,

    #[serde(default)]
    pub timing: TimingSettings,
}

impl Config {
    /// Build the configuration from the process environment
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|value| !value.trim().is_empty());

        let storage = match get(STORAGE_BACKEND).as_deref() {
            None | Some("postgres") => StorageConfig::Postgres(ConnectionSettings::from_lookup(&lookup)?),
            Some("sqlite") => StorageConfig::Sqlite {
                path: get(SQLITE_PATH)
                    .map(PathBuf::from)
                    .unwrap_or_else(default_sqlite_path),
                table: get(DATABASE_TABLE).unwrap_or_else(default_table),
            },
            Some("memory") => StorageConfig::Memory {
                schema: get(DATABASE_SCHEMA).unwrap_or_else(default_schema),
                table: get(DATABASE_TABLE).unwrap_or_else(default_table),
            },
            Some(other) => {
                return Err(ConfigError::Invalid {
                    key: STORAGE_BACKEND,
                    value: other.to_string(),
                });
            }
        };

        let timing = TimingSettings {
            header_allowlist: None,
            persist_timeout_secs: get(TIMING_PERSIST_TIMEOUT_SECS)
                .map(|value| parse(&value, TIMING_PERSIST_TIMEOUT_SECS))
                .transpose()?,
        };

        Ok(Self { storage, timing })
    }
}

pub fn read_config_file(path: &str) -> Result<Config, ConfigError> {
    let file_content = std::fs::read_to_string(path)?;
    serde_json::from_str(&file_content)
        .map_err(|e| ConfigError::Parse(e.to_string()))
        .inspect(|config| trace!("loaded config: {config:?}"))
}

fn parse<T: std::str::FromStr>(value: &str, key: &'static str) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::Invalid {
        key,
        value: value.to_string(),
    })
}

fn parse_or<T: std::str::FromStr>(
    value: Option<String>,
    key: &'static str,
    default: T,
) -> Result<T, ConfigError> {
    value.map_or(Ok(default), |value| parse(&value, key))
}

fn default_postgres_port() -> u16 {
    DEFAULT_POSTGRES_PORT
}

fn default_schema() -> String {
    DEFAULT_SCHEMA.to_string()
}

fn default_table() -> String {
    DEFAULT_TABLE.to_string()
}

fn default_sqlite_path() -> PathBuf {
    PathBuf::from("./timings.db")
}
