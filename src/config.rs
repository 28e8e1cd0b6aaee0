//! Run configuration.
//!
//! [`Config::from_env`] is the only place that reads process environment.
//! Everything downstream receives an already validated [`Config`].

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use crate::{Error, Result};

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    pub source: SyncTarget,
    pub target: SyncTarget,
    pub sync: SyncOptions,
}

/// One database endpoint.
#[derive(Clone, Deserialize, Serialize)]
pub struct SyncTarget {
    pub host: String,
    pub port: u16,
    pub database: String,
    pub username: String,
    #[serde(skip_serializing, default)]
    pub password: String,
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
    #[serde(default = "default_application_name")]
    pub application_name: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SyncOptions {
    #[serde(default = "default_schema")]
    pub schema: String,
    /// Restrict the run to these tables; `None` syncs every table in `schema`.
    #[serde(default)]
    pub tables: Option<Vec<String>>,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_call_timeout")]
    pub call_timeout_secs: u64,
    #[serde(default)]
    pub conflict_policy: ConflictPolicy,
    #[serde(default)]
    pub isolation: IsolationLevel,
    /// Delete target rows of every planned table before copying.
    #[serde(default)]
    pub clean_target: bool,
}

/// What happens when a source row's key already exists in the target.
#[derive(Debug, Clone, Copy, Deserialize, Serialize, Default, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum ConflictPolicy {
    /// Overwrite the target row when any non-key column differs.
    #[default]
    SourceWins,
    /// Leave existing target rows untouched.
    InsertOnly,
}

/// Isolation level of each target batch transaction.
#[derive(Debug, Clone, Copy, Deserialize, Serialize, Default, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum IsolationLevel {
    #[default]
    ReadCommitted,
    RepeatableRead,
    Serializable,
}

impl Config {
    /// Builds the configuration from process environment and validates it.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds the configuration from an arbitrary variable lookup.
    ///
    /// Source credentials are mandatory: `PROD_DB_HOST`, `PROD_DB_NAME`,
    /// `PROD_DB_USER` and `PROD_DB_PASSWORD` must be present. Target settings
    /// default to a local PostgreSQL instance.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        let required = |key: &str| {
            get(key).ok_or_else(|| Error::Config(format!("{} must be set", key)))
        };

        let source = SyncTarget {
            host: required("PROD_DB_HOST")?,
            port: parse_or("PROD_DB_PORT", get("PROD_DB_PORT"), 5432)?,
            database: required("PROD_DB_NAME")?,
            username: required("PROD_DB_USER")?,
            password: required("PROD_DB_PASSWORD")?,
            max_connections: parse_or(
                "PROD_DB_MAX_CONNECTIONS",
                get("PROD_DB_MAX_CONNECTIONS"),
                default_max_connections(),
            )?,
            connect_timeout_secs: parse_or(
                "PROD_DB_CONNECT_TIMEOUT_SECS",
                get("PROD_DB_CONNECT_TIMEOUT_SECS"),
                default_connect_timeout(),
            )?,
            application_name: default_application_name(),
        };

        let target = SyncTarget::local_from_lookup(&lookup)?;

        let sync = SyncOptions {
            schema: get("SYNC_SCHEMA").unwrap_or_else(default_schema),
            tables: get("SYNC_TABLES").map(|list| parse_table_list(&list)),
            batch_size: parse_or("SYNC_BATCH_SIZE", get("SYNC_BATCH_SIZE"), default_batch_size())?,
            call_timeout_secs: parse_or(
                "SYNC_TIMEOUT_SECS",
                get("SYNC_TIMEOUT_SECS"),
                default_call_timeout(),
            )?,
            conflict_policy: parse_or(
                "SYNC_CONFLICT_POLICY",
                get("SYNC_CONFLICT_POLICY"),
                ConflictPolicy::default(),
            )?,
            isolation: parse_or("SYNC_ISOLATION", get("SYNC_ISOLATION"), IsolationLevel::default())?,
            clean_target: parse_or("SYNC_CLEAN_TARGET", get("SYNC_CLEAN_TARGET"), false)?,
        };

        let config = Config {
            source,
            target,
            sync,
        };
        config.validate()?;
        Ok(config)
    }

    /// Rejects values the engine cannot run with.
    pub fn validate(&self) -> Result<()> {
        self.source.validate("source")?;
        self.target.validate("target")?;

        if self.sync.batch_size == 0 {
            return Err(Error::Config("batch size must be greater than zero".to_string()));
        }
        if self.sync.call_timeout_secs == 0 {
            return Err(Error::Config("call timeout must be greater than zero".to_string()));
        }
        if self.sync.schema.trim().is_empty() {
            return Err(Error::Config("schema must not be empty".to_string()));
        }
        if let Some(tables) = &self.sync.tables {
            if tables.is_empty() {
                return Err(Error::Config("table subset must not be empty".to_string()));
            }
        }
        if self.source.host == self.target.host
            && self.source.port == self.target.port
            && self.source.database == self.target.database
        {
            return Err(Error::Config(
                "source and target point at the same database".to_string(),
            ));
        }
        Ok(())
    }

    pub fn call_timeout(&self) -> Duration {
        Duration::from_secs(self.sync.call_timeout_secs)
    }
}

impl SyncTarget {
    /// The local endpoint alone, from `LOCAL_DB_*` variables.
    ///
    /// Needs no production credentials.
    pub fn local_from_env() -> Result<Self> {
        let target = Self::local_from_lookup(|key| std::env::var(key).ok())?;
        target.validate("target")?;
        Ok(target)
    }

    fn local_from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        Ok(SyncTarget {
            host: get("LOCAL_DB_HOST").unwrap_or_else(|| "localhost".to_string()),
            port: parse_or("LOCAL_DB_PORT", get("LOCAL_DB_PORT"), 5432)?,
            database: get("LOCAL_DB_NAME").unwrap_or_else(|| "postgres".to_string()),
            username: get("LOCAL_DB_USER").unwrap_or_else(|| "postgres".to_string()),
            password: lookup("LOCAL_DB_PASSWORD").unwrap_or_default(),
            max_connections: parse_or(
                "LOCAL_DB_MAX_CONNECTIONS",
                get("LOCAL_DB_MAX_CONNECTIONS"),
                default_max_connections(),
            )?,
            connect_timeout_secs: parse_or(
                "LOCAL_DB_CONNECT_TIMEOUT_SECS",
                get("LOCAL_DB_CONNECT_TIMEOUT_SECS"),
                default_connect_timeout(),
            )?,
            application_name: default_application_name(),
        })
    }

    fn validate(&self, endpoint: &str) -> Result<()> {
        if self.host.trim().is_empty() || self.database.trim().is_empty() {
            return Err(Error::Config(format!(
                "{} host and database must not be empty",
                endpoint
            )));
        }
        if self.max_connections == 0 {
            return Err(Error::Config(format!(
                "{} pool size must be greater than zero",
                endpoint
            )));
        }
        if self.connect_timeout_secs == 0 {
            return Err(Error::Config(format!(
                "{} connect timeout must be greater than zero",
                endpoint
            )));
        }
        Ok(())
    }

    /// Connection parameters for `tokio_postgres`.
    pub fn pg_config(&self) -> tokio_postgres::Config {
        let mut config = tokio_postgres::Config::new();
        config
            .host(&self.host)
            .port(self.port)
            .dbname(&self.database)
            .user(&self.username)
            .application_name(&self.application_name)
            .connect_timeout(self.connect_timeout());
        if !self.password.is_empty() {
            config.password(&self.password);
        }
        config
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }
}

impl fmt::Debug for SyncTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SyncTarget")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("database", &self.database)
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .field("max_connections", &self.max_connections)
            .field("connect_timeout_secs", &self.connect_timeout_secs)
            .field("application_name", &self.application_name)
            .finish()
    }
}

impl Default for SyncOptions {
    fn default() -> Self {
        Self {
            schema: default_schema(),
            tables: None,
            batch_size: default_batch_size(),
            call_timeout_secs: default_call_timeout(),
            conflict_policy: ConflictPolicy::default(),
            isolation: IsolationLevel::default(),
            clean_target: false,
        }
    }
}

impl FromStr for ConflictPolicy {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "source-wins" | "source_wins" => Ok(ConflictPolicy::SourceWins),
            "insert-only" | "insert_only" => Ok(ConflictPolicy::InsertOnly),
            other => Err(Error::Config(format!("unknown conflict policy '{}'", other))),
        }
    }
}

impl FromStr for IsolationLevel {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().replace(' ', "-").as_str() {
            "read-committed" | "read_committed" => Ok(IsolationLevel::ReadCommitted),
            "repeatable-read" | "repeatable_read" => Ok(IsolationLevel::RepeatableRead),
            "serializable" => Ok(IsolationLevel::Serializable),
            other => Err(Error::Config(format!("unknown isolation level '{}'", other))),
        }
    }
}

impl From<IsolationLevel> for tokio_postgres::IsolationLevel {
    fn from(level: IsolationLevel) -> Self {
        match level {
            IsolationLevel::ReadCommitted => tokio_postgres::IsolationLevel::ReadCommitted,
            IsolationLevel::RepeatableRead => tokio_postgres::IsolationLevel::RepeatableRead,
            IsolationLevel::Serializable => tokio_postgres::IsolationLevel::Serializable,
        }
    }
}

/// Splits a comma-separated table list, dropping blanks.
pub fn parse_table_list(list: &str) -> Vec<String> {
    list.split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

fn parse_or<T>(key: &str, value: Option<String>, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: fmt::Display,
{
    match value {
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|e| Error::Config(format!("invalid value for {}: {}", key, e))),
        None => Ok(default),
    }
}

fn default_max_connections() -> usize {
    4
}

fn default_connect_timeout() -> u64 {
    30
}

fn default_application_name() -> String {
    "prod-sync".to_string()
}

fn default_schema() -> String {
    "public".to_string()
}

fn default_batch_size() -> usize {
    1000
}

fn default_call_timeout() -> u64 {
    30
}
