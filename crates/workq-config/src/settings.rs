use std::path::PathBuf;
use std::str::FromStr;

use tracing::debug;
use workq_domain::{QueueName, DEFAULT_INLINE_THRESHOLD};

use crate::error::ConfigError;

/// Which backend realizes the adapter contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdapterKind {
    Sqlite,
    Redis,
    DocDb,
}

impl AdapterKind {
    /// Parse the `RC_WORKITEM_ADAPTER` selector.
    ///
    /// Accepts the aliases `sqlite` / `redis` / `docdb` (case-insensitive).
    /// Legacy deployments configured a fully-qualified class path; the final
    /// path segment still selects the backend.
    pub fn parse(selector: &str) -> Result<Self, ConfigError> {
        match selector.to_ascii_lowercase().as_str() {
            "sqlite" => return Ok(AdapterKind::Sqlite),
            "redis" => return Ok(AdapterKind::Redis),
            "docdb" | "documentdb" => return Ok(AdapterKind::DocDb),
            _ => {}
        }
        let last = selector.rsplit('.').next().unwrap_or(selector);
        match last {
            "SQLiteAdapter" => Ok(AdapterKind::Sqlite),
            "RedisAdapter" => Ok(AdapterKind::Redis),
            "DocumentDBAdapter" => Ok(AdapterKind::DocDb),
            _ => Err(ConfigError::UnknownAdapter(selector.to_string())),
        }
    }
}

impl std::fmt::Display for AdapterKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AdapterKind::Sqlite => write!(f, "sqlite"),
            AdapterKind::Redis => write!(f, "redis"),
            AdapterKind::DocDb => write!(f, "docdb"),
        }
    }
}

// ── Backend sections ──────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct SqliteSettings {
    /// Path to the database file (`RC_WORKITEM_DB_PATH`).
    pub db_path: PathBuf,
}

#[derive(Debug, Clone)]
pub struct RedisSettings {
    pub host: String,
    pub port: u16,
    pub db: i64,
    pub password: Option<String>,
    pub max_connections: u32,
}

#[derive(Debug, Clone)]
pub struct DocDbSettings {
    /// Full connection URI; takes precedence over the component fields.
    pub uri: Option<String>,
    pub hostname: Option<String>,
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
    pub database: String,
    /// CA bundle path for TLS against a managed cluster.
    pub tls_ca_file: Option<PathBuf>,
    pub replica_set: Option<String>,
}

// ── Top-level configuration ───────────────────────────────────────────────────

/// Adapter configuration resolved from the environment.
///
/// Only the section for the selected backend is populated and validated;
/// the other two stay `None`.
#[derive(Debug, Clone)]
pub struct WorkItemsConfig {
    pub adapter: AdapterKind,
    /// Input queue `Q`; the output queue is derived as `Q_output`.
    pub queue: QueueName,
    /// Filesystem root for large file blobs.
    pub files_dir: PathBuf,
    pub orphan_timeout_minutes: u64,
    /// Inline-vs-external storage threshold in bytes.
    pub file_size_threshold: usize,
    pub sqlite: Option<SqliteSettings>,
    pub redis: Option<RedisSettings>,
    pub docdb: Option<DocDbSettings>,
}

impl WorkItemsConfig {
    /// Load from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load from an arbitrary variable source. Tests inject variables here
    /// without mutating process-global state.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let selector = lookup("RC_WORKITEM_ADAPTER")
            .ok_or(ConfigError::MissingVariable("RC_WORKITEM_ADAPTER"))?;
        let adapter = AdapterKind::parse(&selector)?;

        let queue = QueueName::new(
            lookup("RC_WORKITEM_QUEUE_NAME").unwrap_or_else(|| "default".to_string()),
        );
        let files_dir = PathBuf::from(
            lookup("RC_WORKITEM_FILES_DIR")
                .unwrap_or_else(|| "devdata/work_item_files".to_string()),
        );
        let orphan_timeout_minutes =
            parse_or("RC_WORKITEM_ORPHAN_TIMEOUT_MINUTES", &lookup, 30u64)?;
        let file_size_threshold =
            parse_or("RC_WORKITEM_FILE_SIZE_THRESHOLD", &lookup, DEFAULT_INLINE_THRESHOLD)?;

        let mut config = WorkItemsConfig {
            adapter,
            queue,
            files_dir,
            orphan_timeout_minutes,
            file_size_threshold,
            sqlite: None,
            redis: None,
            docdb: None,
        };

        match adapter {
            AdapterKind::Sqlite => config.sqlite = Some(load_sqlite(&lookup)?),
            AdapterKind::Redis => config.redis = Some(load_redis(&lookup)?),
            AdapterKind::DocDb => config.docdb = Some(load_docdb(&lookup)?),
        }

        debug!(
            adapter = %config.adapter,
            queue = %config.queue,
            files_dir = %config.files_dir.display(),
            "resolved work-item configuration"
        );
        Ok(config)
    }
}

fn load_sqlite(lookup: &impl Fn(&str) -> Option<String>) -> Result<SqliteSettings, ConfigError> {
    let db_path = lookup("RC_WORKITEM_DB_PATH")
        .ok_or(ConfigError::MissingVariable("RC_WORKITEM_DB_PATH"))?;
    Ok(SqliteSettings { db_path: PathBuf::from(db_path) })
}

fn load_redis(lookup: &impl Fn(&str) -> Option<String>) -> Result<RedisSettings, ConfigError> {
    Ok(RedisSettings {
        host: lookup("REDIS_HOST").unwrap_or_else(|| "localhost".to_string()),
        port: parse_or("REDIS_PORT", lookup, 6379u16)?,
        db: parse_or("REDIS_DB", lookup, 0i64)?,
        password: lookup("REDIS_PASSWORD"),
        max_connections: parse_or("REDIS_MAX_CONNECTIONS", lookup, 50u32)?,
    })
}

fn load_docdb(lookup: &impl Fn(&str) -> Option<String>) -> Result<DocDbSettings, ConfigError> {
    let uri = lookup("DOCDB_URI");
    let hostname = lookup("DOCDB_HOSTNAME");
    let username = lookup("DOCDB_USERNAME");
    let password = lookup("DOCDB_PASSWORD");

    if uri.is_none() && (hostname.is_none() || username.is_none() || password.is_none()) {
        return Err(ConfigError::InvalidValue {
            variable: "DOCDB_URI",
            message: "either DOCDB_URI or DOCDB_HOSTNAME + DOCDB_USERNAME + DOCDB_PASSWORD \
                      is required"
                .to_string(),
        });
    }

    let database =
        lookup("DOCDB_DATABASE").ok_or(ConfigError::MissingVariable("DOCDB_DATABASE"))?;

    Ok(DocDbSettings {
        uri,
        hostname,
        port: parse_or("DOCDB_PORT", lookup, 27017u16)?,
        username,
        password,
        database,
        tls_ca_file: lookup("DOCDB_TLS_CERT").map(PathBuf::from),
        replica_set: lookup("DOCDB_REPLICA_SET"),
    })
}

fn parse_or<T>(
    variable: &'static str,
    lookup: &impl Fn(&str) -> Option<String>,
    default: T,
) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match lookup(variable) {
        Some(raw) => raw.parse().map_err(|e: T::Err| ConfigError::InvalidValue {
            variable,
            message: e.to_string(),
        }),
        None => Ok(default),
    }
}
