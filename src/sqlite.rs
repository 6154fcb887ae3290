use crate::backend::{DatabaseBackend, QueryResult, Row};
use crate::codec::SqlValue;
use crate::config::{BackendKind, RepositoryConfig};
use crate::dialect::{Dialect, SqliteDialect};
use crate::error::{ErrorKind, ErrorMapper, RepositoryError, Result};
use async_trait::async_trait;
use sqlx::sqlite::{SqliteArguments, SqliteConnectOptions, SqliteConnection, SqliteRow};
use sqlx::{ConnectOptions, Connection, Row as _, Sqlite, TypeInfo, ValueRef};
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, info};

type SqliteQuery<'q> = sqlx::query::Query<'q, Sqlite, SqliteArguments<'q>>;

/// SQLite backend on a single connection.
pub struct SqliteBackend {
    conn: SqliteConnection,
    dialect: SqliteDialect,
    errors: ErrorMapper,
    statement_timeout: Option<Duration>,
    in_transaction: bool,
    connected: bool,
}

impl SqliteBackend {
    /// Open the database described by `config`.
    pub async fn connect(config: &RepositoryConfig) -> Result<Self> {
        if config.backend != BackendKind::Sqlite {
            return Err(RepositoryError::Config(format!(
                "SqliteBackend cannot serve a {} configuration",
                config.backend
            )));
        }
        config.validate()?;

        let errors = ErrorMapper::new(config.target());
        let options = SqliteConnectOptions::from_str(&config.sqlite_url())
            .map_err(|e| errors.map(e))?
            .create_if_missing(true)
            .foreign_keys(true);

        let mut conn = options.connect().await.map_err(|e| errors.map(e))?;

        // Cascades depend on this being on for the connection
        sqlx::query("PRAGMA foreign_keys = ON")
            .execute(&mut conn)
            .await
            .map_err(|e| errors.map(e))?;

        info!(target = %errors.target(), "Connected to SQLite");

        Ok(Self {
            conn,
            dialect: SqliteDialect::new(),
            errors,
            statement_timeout: config.statement_timeout(),
            in_transaction: false,
            connected: true,
        })
    }

    /// Create an in-memory SQLite database
    pub async fn memory() -> Result<Self> {
        Self::connect(&RepositoryConfig::sqlite_memory()).await
    }

    /// Create a file-based SQLite database
    pub async fn file(path: &str) -> Result<Self> {
        Self::connect(&RepositoryConfig::sqlite_file(path)).await
    }

    fn bind<'q>(sql: &'q str, params: &[SqlValue]) -> SqliteQuery<'q> {
        let mut query = sqlx::query(sql);
        for value in params {
            query = match value {
                SqlValue::Null => query.bind(None::<String>),
                SqlValue::Integer(v) => query.bind(*v),
                SqlValue::Real(v) => query.bind(*v),
                SqlValue::Text(v) => query.bind(v.clone()),
                SqlValue::Bytes(v) => query.bind(v.clone()),
            };
        }
        query
    }

    /// Convert SQLite row to Row, dispatching on the stored value's class
    fn convert_row(row: &SqliteRow) -> std::result::Result<Row, sqlx::Error> {
        let mut converted = Row::new();

        for (i, column) in sqlx::Row::columns(row).iter().enumerate() {
            let name = sqlx::Column::name(column);
            let raw = row.try_get_raw(i)?;

            let value = if raw.is_null() {
                SqlValue::Null
            } else {
                let class = raw.type_info().name().to_string();
                match class.as_str() {
                    "INTEGER" | "BOOLEAN" => SqlValue::Integer(row.try_get::<i64, _>(i)?),
                    "REAL" | "NUMERIC" => SqlValue::Real(row.try_get::<f64, _>(i)?),
                    "BLOB" => SqlValue::Bytes(row.try_get::<Vec<u8>, _>(i)?),
                    _ => SqlValue::Text(row.try_get::<String, _>(i)?),
                }
            };

            converted.insert(name, value);
        }

        Ok(converted)
    }

    fn track<T>(&mut self, result: &Result<T>) {
        if let Err(err) = result {
            if err.kind() == Some(ErrorKind::Connection) {
                self.connected = false;
            }
        }
    }

    /// Get list of all tables
    pub async fn list_tables(&mut self) -> Result<Vec<String>> {
        let rows = self
            .query(
                "SELECT name FROM sqlite_master WHERE type='table' AND name NOT LIKE 'sqlite_%' ORDER BY name",
                &[],
            )
            .await?;

        Ok(rows
            .iter()
            .filter_map(|row| match row.get("name") {
                SqlValue::Text(name) => Some(name.clone()),
                _ => None,
            })
            .collect())
    }
}

#[async_trait]
impl DatabaseBackend for SqliteBackend {
    fn dialect(&self) -> &dyn Dialect {
        &self.dialect
    }

    async fn execute(&mut self, sql: &str, params: &[SqlValue]) -> Result<u64> {
        debug!(sql, params = params.len(), "execute");
        let limit = self.statement_timeout;
        let errors = self.errors.clone();
        let fut = Self::bind(sql, params).execute(&mut self.conn);

        let result = match limit {
            Some(limit) => match tokio::time::timeout(limit, fut).await {
                Ok(result) => result.map_err(|e| errors.map(e)),
                Err(elapsed) => Err(errors.timeout(sql, limit, elapsed)),
            },
            None => fut.await.map_err(|e| errors.map(e)),
        };
        self.track(&result);

        Ok(result?.rows_affected())
    }

    async fn query(&mut self, sql: &str, params: &[SqlValue]) -> Result<QueryResult> {
        debug!(sql, params = params.len(), "query");
        let limit = self.statement_timeout;
        let errors = self.errors.clone();
        let fut = Self::bind(sql, params).fetch_all(&mut self.conn);

        let rows = match limit {
            Some(limit) => match tokio::time::timeout(limit, fut).await {
                Ok(result) => result.map_err(|e| errors.map(e)),
                Err(elapsed) => Err(errors.timeout(sql, limit, elapsed)),
            },
            None => fut.await.map_err(|e| errors.map(e)),
        };
        self.track(&rows);

        rows?
            .iter()
            .map(|row| Self::convert_row(row).map_err(|e| errors.map(e)))
            .collect()
    }

    async fn begin_transaction(&mut self) -> Result<()> {
        if self.in_transaction {
            return Err(RepositoryError::Transaction(
                "Already in transaction".to_string(),
            ));
        }

        self.execute("BEGIN", &[]).await?;
        self.in_transaction = true;
        Ok(())
    }

    async fn commit(&mut self) -> Result<()> {
        if !self.in_transaction {
            return Err(RepositoryError::Transaction("Not in transaction".to_string()));
        }

        self.execute("COMMIT", &[]).await?;
        self.in_transaction = false;
        Ok(())
    }

    async fn rollback(&mut self) -> Result<()> {
        if !self.in_transaction {
            return Err(RepositoryError::Transaction("Not in transaction".to_string()));
        }

        // The flag is cleared even if ROLLBACK fails: SQLite has already
        // ended the transaction when it reports most errors.
        self.in_transaction = false;
        self.execute("ROLLBACK", &[]).await?;
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected
    }

    async fn close(self) -> Result<()> {
        let errors = self.errors.clone();
        self.conn.close().await.map_err(|e| errors.map(e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_sqlite_memory() {
        let backend = SqliteBackend::memory().await;
        assert!(backend.is_ok());
        assert!(backend.unwrap().is_connected());
    }

    #[tokio::test]
    async fn test_sqlite_create_table() {
        let mut backend = SqliteBackend::memory().await.unwrap();

        backend
            .execute("CREATE TABLE test_table (id INTEGER PRIMARY KEY, name TEXT NOT NULL)", &[])
            .await
            .unwrap();

        let tables = backend.list_tables().await.unwrap();
        assert!(tables.contains(&"test_table".to_string()));
    }

    #[tokio::test]
    async fn test_sqlite_bound_values() {
        let mut backend = SqliteBackend::memory().await.unwrap();

        backend
            .execute("CREATE TABLE users (id BLOB PRIMARY KEY, name TEXT, age INTEGER, score REAL)", &[])
            .await
            .unwrap();

        backend
            .execute(
                "INSERT INTO users (id, name, age, score) VALUES (?, ?, ?, ?)",
                &[
                    SqlValue::Bytes(vec![1, 2, 3]),
                    SqlValue::Text("Alice's".to_string()),
                    SqlValue::Integer(30),
                    SqlValue::Null,
                ],
            )
            .await
            .unwrap();

        let results = backend.query("SELECT id, name, age, score FROM users", &[]).await.unwrap();

        assert_eq!(results.len(), 1);
        assert_eq!(results[0].get("id"), &SqlValue::Bytes(vec![1, 2, 3]));
        assert_eq!(results[0].get("name"), &SqlValue::Text("Alice's".to_string()));
        assert_eq!(results[0].get("age"), &SqlValue::Integer(30));
        assert_eq!(results[0].get("score"), &SqlValue::Null);
    }

    #[tokio::test]
    async fn test_sqlite_transaction_rollback() {
        let mut backend = SqliteBackend::memory().await.unwrap();

        backend
            .execute("CREATE TABLE accounts (id INTEGER PRIMARY KEY, balance INTEGER)", &[])
            .await
            .unwrap();

        backend.begin_transaction().await.unwrap();
        assert!(backend.begin_transaction().await.is_err());

        backend
            .execute("INSERT INTO accounts (id, balance) VALUES (1, 100)", &[])
            .await
            .unwrap();
        backend.rollback().await.unwrap();

        let results = backend.query("SELECT * FROM accounts", &[]).await.unwrap();
        assert!(results.is_empty());
        assert!(backend.commit().await.is_err());
    }

    #[tokio::test]
    async fn test_sqlite_duplicate_key_is_classified() {
        let mut backend = SqliteBackend::memory().await.unwrap();

        backend
            .execute("CREATE TABLE t (id INTEGER PRIMARY KEY)", &[])
            .await
            .unwrap();
        backend
            .execute("INSERT INTO t (id) VALUES (?)", &[SqlValue::Integer(1)])
            .await
            .unwrap();

        let err = backend
            .execute("INSERT INTO t (id) VALUES (?)", &[SqlValue::Integer(1)])
            .await
            .unwrap_err();
        assert_eq!(err.kind(), Some(ErrorKind::Duplicate));
    }

    #[tokio::test]
    async fn test_sqlite_foreign_key_is_constraint() {
        let mut backend = SqliteBackend::memory().await.unwrap();

        backend
            .execute("CREATE TABLE parent (id INTEGER PRIMARY KEY)", &[])
            .await
            .unwrap();
        backend
            .execute(
                "CREATE TABLE child (parent_id INTEGER NOT NULL REFERENCES parent (id) ON DELETE CASCADE)",
                &[],
            )
            .await
            .unwrap();

        let err = backend
            .execute("INSERT INTO child (parent_id) VALUES (?)", &[SqlValue::Integer(9)])
            .await
            .unwrap_err();
        assert_eq!(err.kind(), Some(ErrorKind::Constraint));
    }

    #[tokio::test]
    async fn test_sqlite_missing_table_is_unknown() {
        let mut backend = SqliteBackend::memory().await.unwrap();

        let err = backend.query("SELECT * FROM nowhere", &[]).await.unwrap_err();
        assert_eq!(err.kind(), Some(ErrorKind::Unknown));
        assert!(std::error::Error::source(&err).is_some());
    }

    #[tokio::test]
    async fn test_rejects_mysql_config() {
        let config = RepositoryConfig::mysql("db", 3306, "shop", "app", "pw");
        assert!(matches!(
            SqliteBackend::connect(&config).await,
            Err(RepositoryError::Config(_))
        ));
    }
}
