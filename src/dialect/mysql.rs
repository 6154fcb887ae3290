//! MySQL/MariaDB dialect.

use super::Dialect;
use crate::codec::{malformed, uuid_from_bytes, uuid_from_text, SqlValue, TimestampPrecision, TypeCodec};
use crate::descriptor::ScalarType;
use crate::error::{RepositoryError, Result};
use chrono::{DateTime, NaiveDateTime, Utc};
use uuid::Uuid;

/// Format of a `DATETIME` literal.
pub(crate) const DATETIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// MySQL/MariaDB dialect implementation.
///
/// Compatible with MySQL 5.7+, 8.0+ and MariaDB 10.2+. UUIDs are stored
/// as `CHAR(36)` text; `DATETIME` columns carry no fractional seconds, so
/// timestamps are truncated to the second on encode.
#[derive(Debug, Clone, Default)]
pub struct MySqlDialect;

impl MySqlDialect {
    pub fn new() -> Self {
        Self
    }
}

impl TypeCodec for MySqlDialect {
    fn timestamp_precision(&self) -> TimestampPrecision {
        TimestampPrecision::Seconds
    }

    fn encode_uuid(&self, value: &Uuid) -> SqlValue {
        SqlValue::Text(value.hyphenated().to_string())
    }

    fn decode_uuid(&self, value: &SqlValue) -> Result<Uuid> {
        match value {
            SqlValue::Text(text) if text.len() == 36 => uuid_from_text(text),
            SqlValue::Text(text) => Err(RepositoryError::Argument(format!(
                "uuid text must be 36 characters, got {}",
                text.len()
            ))),
            // BINARY(16) columns written by other tools
            SqlValue::Bytes(bytes) => uuid_from_bytes(bytes),
            other => Err(malformed("uuid text", other)),
        }
    }

    fn encode_datetime(&self, value: &DateTime<Utc>) -> SqlValue {
        let truncated = self.timestamp_precision().truncate(*value);
        SqlValue::Text(truncated.format(DATETIME_FORMAT).to_string())
    }

    fn decode_datetime(&self, value: &SqlValue) -> Result<DateTime<Utc>> {
        match value {
            SqlValue::Text(text) => NaiveDateTime::parse_from_str(text, DATETIME_FORMAT)
                .map(|naive| naive.and_utc())
                .map_err(|e| {
                    RepositoryError::Argument(format!("malformed DATETIME '{}': {}", text, e))
                }),
            other => Err(malformed("DATETIME text", other)),
        }
    }
}

impl Dialect for MySqlDialect {
    fn name(&self) -> &str {
        "mysql"
    }

    fn quote_ident(&self, name: &str) -> String {
        // MySQL uses backticks; embedded backticks are doubled
        format!("`{}`", name.replace('`', "``"))
    }

    fn column_type(&self, scalar_type: ScalarType, keyed: bool) -> String {
        match scalar_type {
            ScalarType::Uuid => "CHAR(36)",
            // TEXT cannot be indexed without a prefix length
            ScalarType::Text if keyed => "VARCHAR(255)",
            ScalarType::Text => "TEXT",
            ScalarType::Integer => "BIGINT",
            ScalarType::Real => "DOUBLE",
            ScalarType::Boolean => "TINYINT(1)",
            ScalarType::Timestamp => "DATETIME",
        }
        .to_string()
    }

    fn table_options(&self) -> Option<&str> {
        Some("ENGINE=InnoDB DEFAULT CHARSET=utf8mb4")
    }

    fn upsert(&self, table: &str, columns: &[String], key_columns: &[String]) -> String {
        let updates: Vec<String> = columns
            .iter()
            .filter(|c| !key_columns.contains(c))
            .map(|c| {
                let col = self.quote_ident(c);
                format!("{} = VALUES({})", col, col)
            })
            .collect();

        let updates = if updates.is_empty() {
            // Only key columns: a no-op assignment keeps errors visible
            key_columns
                .iter()
                .map(|c| {
                    let col = self.quote_ident(c);
                    format!("{} = {}", col, col)
                })
                .collect()
        } else {
            updates
        };

        format!(
            "{} ON DUPLICATE KEY UPDATE {}",
            self.insert(table, columns),
            updates.join(", ")
        )
    }
}
