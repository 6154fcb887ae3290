//! SQLite dialect.

use super::Dialect;
use crate::codec::{malformed, uuid_from_bytes, SqlValue, TimestampPrecision, TypeCodec};
use crate::descriptor::ScalarType;
use crate::error::{RepositoryError, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use uuid::Uuid;

/// SQLite dialect.
///
/// UUIDs are stored as 16-byte blobs and timestamps as RFC 3339 text
/// with microsecond precision.
#[derive(Debug, Clone, Default)]
pub struct SqliteDialect;

impl SqliteDialect {
    pub fn new() -> Self {
        Self
    }
}

impl TypeCodec for SqliteDialect {
    fn timestamp_precision(&self) -> TimestampPrecision {
        TimestampPrecision::Microseconds
    }

    fn encode_uuid(&self, value: &Uuid) -> SqlValue {
        SqlValue::Bytes(value.as_bytes().to_vec())
    }

    fn decode_uuid(&self, value: &SqlValue) -> Result<Uuid> {
        match value {
            SqlValue::Bytes(bytes) => uuid_from_bytes(bytes),
            other => Err(malformed("uuid blob", other)),
        }
    }

    fn encode_datetime(&self, value: &DateTime<Utc>) -> SqlValue {
        let truncated = self.timestamp_precision().truncate(*value);
        SqlValue::Text(truncated.to_rfc3339_opts(SecondsFormat::Micros, true))
    }

    fn decode_datetime(&self, value: &SqlValue) -> Result<DateTime<Utc>> {
        match value {
            SqlValue::Text(text) => DateTime::parse_from_rfc3339(text)
                .map(|dt| dt.with_timezone(&Utc))
                .map_err(|e| {
                    RepositoryError::Argument(format!("malformed timestamp '{}': {}", text, e))
                }),
            other => Err(malformed("timestamp text", other)),
        }
    }
}

impl Dialect for SqliteDialect {
    fn name(&self) -> &str {
        "sqlite"
    }

    fn quote_ident(&self, name: &str) -> String {
        format!("\"{}\"", name.replace('"', "\"\""))
    }

    fn column_type(&self, scalar_type: ScalarType, _keyed: bool) -> String {
        match scalar_type {
            ScalarType::Uuid => "BLOB",
            ScalarType::Text => "TEXT",
            ScalarType::Integer => "INTEGER",
            ScalarType::Real => "REAL",
            ScalarType::Boolean => "INTEGER",
            ScalarType::Timestamp => "TEXT",
        }
        .to_string()
    }

    fn upsert(&self, table: &str, columns: &[String], key_columns: &[String]) -> String {
        let mut sql = format!(
            "{} ON CONFLICT ({})",
            self.insert(table, columns),
            self.ident_list(key_columns)
        );

        let updates: Vec<String> = columns
            .iter()
            .filter(|c| !key_columns.contains(c))
            .map(|c| {
                let col = self.quote_ident(c);
                format!("{} = excluded.{}", col, col)
            })
            .collect();

        if updates.is_empty() {
            sql.push_str(" DO NOTHING");
        } else {
            sql.push_str(" DO UPDATE SET ");
            sql.push_str(&updates.join(", "));
        }
        sql
    }
}
