//! Repository connection configuration.

use crate::error::{RepositoryError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Which driver/dialect pair to use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    Sqlite,
    Mysql,
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackendKind::Sqlite => write!(f, "sqlite"),
            BackendKind::Mysql => write!(f, "mysql"),
        }
    }
}

/// Connection settings for a repository.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RepositoryConfig {
    /// Backend type (default: sqlite).
    #[serde(default = "default_backend")]
    pub backend: BackendKind,

    /// Database host. Ignored by SQLite.
    #[serde(default = "default_host")]
    pub host: String,

    /// Database port (default: 3306). Ignored by SQLite.
    #[serde(default = "default_mysql_port")]
    pub port: u16,

    /// Database name, or file path / `:memory:` for SQLite.
    pub database: String,

    #[serde(default)]
    pub user: String,

    #[serde(default)]
    pub password: String,

    /// Per-statement deadline in seconds. `None` disables it.
    #[serde(default)]
    pub statement_timeout_secs: Option<u64>,
}

fn default_backend() -> BackendKind {
    BackendKind::Sqlite
}

fn default_host() -> String {
    "localhost".to_string()
}

fn default_mysql_port() -> u16 {
    3306
}

impl Default for RepositoryConfig {
    fn default() -> Self {
        Self {
            backend: default_backend(),
            host: default_host(),
            port: default_mysql_port(),
            database: ":memory:".to_string(),
            user: String::new(),
            password: String::new(),
            statement_timeout_secs: None,
        }
    }
}

impl RepositoryConfig {
    /// In-memory SQLite configuration.
    pub fn sqlite_memory() -> Self {
        Self::default()
    }

    pub fn sqlite_file(path: &str) -> Self {
        Self {
            database: path.to_string(),
            ..Self::default()
        }
    }

    pub fn mysql(host: &str, port: u16, database: &str, user: &str, password: &str) -> Self {
        Self {
            backend: BackendKind::Mysql,
            host: host.to_string(),
            port,
            database: database.to_string(),
            user: user.to_string(),
            password: password.to_string(),
            statement_timeout_secs: None,
        }
    }

    /// Parse configuration from a JSON document and validate it.
    pub fn from_json(json: &str) -> Result<Self> {
        let config: RepositoryConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.database.is_empty() {
            return Err(RepositoryError::Config("database is required".into()));
        }
        if self.statement_timeout_secs == Some(0) {
            return Err(RepositoryError::Config(
                "statement_timeout_secs must be at least 1".into(),
            ));
        }
        if self.backend == BackendKind::Mysql {
            if self.host.is_empty() {
                return Err(RepositoryError::Config("host is required for mysql".into()));
            }
            if self.user.is_empty() {
                return Err(RepositoryError::Config("user is required for mysql".into()));
            }
            if self.port == 0 {
                return Err(RepositoryError::Config("port must be non-zero".into()));
            }
        }
        Ok(())
    }

    pub fn statement_timeout(&self) -> Option<Duration> {
        self.statement_timeout_secs.map(Duration::from_secs)
    }

    /// Credential-free description of where the repository connects.
    pub fn target(&self) -> ConnectionTarget {
        match self.backend {
            BackendKind::Sqlite => ConnectionTarget::new("localhost", 0, &self.database),
            BackendKind::Mysql => ConnectionTarget::new(&self.host, self.port, &self.database),
        }
    }

    /// SQLite connection URL for sqlx.
    pub fn sqlite_url(&self) -> String {
        if self.database == ":memory:" {
            "sqlite::memory:".to_string()
        } else {
            format!("sqlite://{}", self.database)
        }
    }
}

/// Host, port and database of a connection, used in error messages.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionTarget {
    pub host: String,
    pub port: u16,
    pub database: String,
}

impl ConnectionTarget {
    pub fn new(host: &str, port: u16, database: &str) -> Self {
        Self {
            host: host.to_string(),
            port,
            database: database.to_string(),
        }
    }
}

impl fmt::Display for ConnectionTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "host={} port={} database={}",
            self.host, self.port, self.database
        )
    }
}
