use crate::backend::{DatabaseBackend, QueryResult, Row};
use crate::codec::SqlValue;
use crate::config::{BackendKind, RepositoryConfig};
use crate::dialect::{Dialect, MySqlDialect};
use crate::error::{ErrorKind, ErrorMapper, RepositoryError, Result};
use async_trait::async_trait;
use chrono::NaiveDateTime;
use sqlx::mysql::{MySqlArguments, MySqlConnectOptions, MySqlConnection, MySqlRow};
use sqlx::{ConnectOptions, Connection, Executor, MySql, Row as _, TypeInfo, ValueRef};
use std::time::Duration;
use tracing::{debug, info};

type MySqlQuery<'q> = sqlx::query::Query<'q, MySql, MySqlArguments>;

/// MySQL/MariaDB backend on a single connection.
pub struct MySqlBackend {
    conn: MySqlConnection,
    dialect: MySqlDialect,
    errors: ErrorMapper,
    statement_timeout: Option<Duration>,
    in_transaction: bool,
    connected: bool,
}

impl MySqlBackend {
    pub async fn connect(config: &RepositoryConfig) -> Result<Self> {
        if config.backend != BackendKind::Mysql {
            return Err(RepositoryError::Config(format!(
                "MySqlBackend cannot serve a {} configuration",
                config.backend
            )));
        }
        config.validate()?;

        let errors = ErrorMapper::new(config.target());
        let mut options = MySqlConnectOptions::new()
            .host(&config.host)
            .port(config.port)
            .database(&config.database)
            .username(&config.user)
            .charset("utf8mb4");
        if !config.password.is_empty() {
            options = options.password(&config.password);
        }

        let conn = match config.statement_timeout() {
            Some(limit) => tokio::time::timeout(limit, options.connect())
                .await
                .map_err(|elapsed| errors.timeout("connect", limit, elapsed))?,
            None => options.connect().await,
        }
        .map_err(|e| errors.map(e))?;

        info!(target = %errors.target(), "Connected to MySQL");

        Ok(Self {
            conn,
            dialect: MySqlDialect::new(),
            errors,
            statement_timeout: config.statement_timeout(),
            in_transaction: false,
            connected: true,
        })
    }

    fn bind<'q>(sql: &'q str, params: &[SqlValue]) -> MySqlQuery<'q> {
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

    /// Run a transaction control statement over the text protocol.
    /// MySQL refuses to prepare `START TRANSACTION`.
    async fn execute_control(&mut self, sql: &'static str) -> Result<()> {
        debug!(sql, "execute");
        let errors = self.errors.clone();
        let fut = (&mut self.conn).execute(sql);

        let result = match self.statement_timeout {
            Some(limit) => match tokio::time::timeout(limit, fut).await {
                Ok(result) => result.map_err(|e| errors.map(e)),
                Err(elapsed) => Err(errors.timeout(sql, limit, elapsed)),
            },
            None => fut.await.map_err(|e| errors.map(e)),
        };
        self.track(&result);

        result.map(|_| ())
    }

    /// Convert MySQL row to Row, dispatching on the declared column type
    fn convert_row(row: &MySqlRow) -> std::result::Result<Row, sqlx::Error> {
        let mut converted = Row::new();

        for (i, column) in sqlx::Row::columns(row).iter().enumerate() {
            let name = sqlx::Column::name(column);
            let type_name = sqlx::Column::type_info(column).name().to_uppercase();

            let value = if row.try_get_raw(i)?.is_null() {
                SqlValue::Null
            } else if type_name == "DATETIME" || type_name == "TIMESTAMP" {
                let naive: NaiveDateTime = row.try_get_unchecked(i)?;
                SqlValue::Text(naive.format(crate::dialect::DATETIME_FORMAT).to_string())
            } else if type_name.contains("INT") || type_name == "BOOLEAN" {
                SqlValue::Integer(row.try_get_unchecked::<i64, _>(i)?)
            } else if type_name == "DOUBLE" || type_name == "FLOAT" {
                SqlValue::Real(row.try_get_unchecked::<f64, _>(i)?)
            } else if type_name.contains("BINARY") || type_name.contains("BLOB") {
                SqlValue::Bytes(row.try_get::<Vec<u8>, _>(i)?)
            } else {
                SqlValue::Text(row.try_get::<String, _>(i)?)
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

    /// Get list of all tables in the current database
    pub async fn list_tables(&mut self) -> Result<Vec<String>> {
        let rows = self
            .query(
                "SELECT CAST(table_name AS CHAR) AS name FROM information_schema.tables \
                 WHERE table_schema = DATABASE() ORDER BY table_name",
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
impl DatabaseBackend for MySqlBackend {
    fn dialect(&self) -> &dyn Dialect {
        &self.dialect
    }

    async fn execute(&mut self, sql: &str, params: &[SqlValue]) -> Result<u64> {
        debug!(sql, params = params.len(), "execute");
        let errors = self.errors.clone();
        let fut = Self::bind(sql, params).execute(&mut self.conn);

        let result = match self.statement_timeout {
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
        let errors = self.errors.clone();
        let fut = Self::bind(sql, params).fetch_all(&mut self.conn);

        let rows = match self.statement_timeout {
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

        self.execute_control("START TRANSACTION").await?;
        self.in_transaction = true;
        Ok(())
    }

    async fn commit(&mut self) -> Result<()> {
        if !self.in_transaction {
            return Err(RepositoryError::Transaction("Not in transaction".to_string()));
        }

        self.execute_control("COMMIT").await?;
        self.in_transaction = false;
        Ok(())
    }

    async fn rollback(&mut self) -> Result<()> {
        if !self.in_transaction {
            return Err(RepositoryError::Transaction("Not in transaction".to_string()));
        }

        self.in_transaction = false;
        self.execute_control("ROLLBACK").await?;
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
