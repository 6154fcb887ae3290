//! Scalar encoding between the aggregate model and driver values.

use crate::descriptor::ScalarType;
use crate::error::{RepositoryError, Result};
use crate::model::Scalar;
use chrono::{DateTime, DurationRound, TimeDelta, Utc};
use std::fmt;
use uuid::Uuid;

/// Dialect-encoded column value, as bound to or read from a driver.
#[derive(Debug, Clone, PartialEq)]
pub enum SqlValue {
    Null,
    Integer(i64),
    Real(f64),
    Text(String),
    Bytes(Vec<u8>),
}

impl SqlValue {
    pub fn is_null(&self) -> bool {
        matches!(self, SqlValue::Null)
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            SqlValue::Null => "NULL",
            SqlValue::Integer(_) => "integer",
            SqlValue::Real(_) => "real",
            SqlValue::Text(_) => "text",
            SqlValue::Bytes(_) => "bytes",
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            SqlValue::Integer(v) => Some(*v),
            _ => None,
        }
    }
}

impl fmt::Display for SqlValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SqlValue::Null => write!(f, "NULL"),
            SqlValue::Integer(v) => write!(f, "{}", v),
            SqlValue::Real(v) => write!(f, "{}", v),
            SqlValue::Text(v) => write!(f, "'{}'", v.replace('\'', "''")),
            SqlValue::Bytes(v) => write!(f, "<{} bytes>", v.len()),
        }
    }
}

/// Finest timestamp granularity a dialect stores.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimestampPrecision {
    Seconds,
    Microseconds,
}

impl TimestampPrecision {
    /// Drop the sub-precision part of a timestamp.
    pub fn truncate(&self, value: DateTime<Utc>) -> DateTime<Utc> {
        let unit = match self {
            TimestampPrecision::Seconds => TimeDelta::seconds(1),
            TimestampPrecision::Microseconds => TimeDelta::microseconds(1),
        };
        value.duration_trunc(unit).unwrap_or(value)
    }
}

/// Per-dialect encode/decode of the scalar types.
///
/// `encode_*` are total; `decode_*` fail with [`RepositoryError::Argument`]
/// on NULL or malformed input.
pub trait TypeCodec: Send + Sync {
    fn timestamp_precision(&self) -> TimestampPrecision;

    fn encode_uuid(&self, value: &Uuid) -> SqlValue;

    fn decode_uuid(&self, value: &SqlValue) -> Result<Uuid>;

    fn encode_datetime(&self, value: &DateTime<Utc>) -> SqlValue;

    fn decode_datetime(&self, value: &SqlValue) -> Result<DateTime<Utc>>;

    fn encode_boolean(&self, value: bool) -> SqlValue {
        SqlValue::Integer(i64::from(value))
    }

    fn decode_boolean(&self, value: &SqlValue) -> Result<bool> {
        match value {
            SqlValue::Integer(0) => Ok(false),
            SqlValue::Integer(1) => Ok(true),
            other => Err(malformed("boolean", other)),
        }
    }

    fn encode(&self, value: &Scalar) -> SqlValue {
        match value {
            Scalar::Text(v) => SqlValue::Text(v.clone()),
            Scalar::Integer(v) => SqlValue::Integer(*v),
            Scalar::Real(v) => SqlValue::Real(*v),
            Scalar::Boolean(v) => self.encode_boolean(*v),
            Scalar::Timestamp(v) => self.encode_datetime(v),
            Scalar::Uuid(v) => self.encode_uuid(v),
        }
    }

    fn encode_nullable(&self, value: Option<&Scalar>) -> SqlValue {
        value.map(|v| self.encode(v)).unwrap_or(SqlValue::Null)
    }

    fn decode(&self, value: &SqlValue, scalar_type: ScalarType) -> Result<Scalar> {
        match scalar_type {
            ScalarType::Text => match value {
                SqlValue::Text(v) => Ok(Scalar::Text(v.clone())),
                other => Err(malformed("text", other)),
            },
            ScalarType::Integer => match value {
                SqlValue::Integer(v) => Ok(Scalar::Integer(*v)),
                other => Err(malformed("integer", other)),
            },
            ScalarType::Real => match value {
                SqlValue::Real(v) => Ok(Scalar::Real(*v)),
                // SQLite hands back integral REALs as integers.
                SqlValue::Integer(v) => Ok(Scalar::Real(*v as f64)),
                other => Err(malformed("real", other)),
            },
            ScalarType::Boolean => self.decode_boolean(value).map(Scalar::Boolean),
            ScalarType::Timestamp => self.decode_datetime(value).map(Scalar::Timestamp),
            ScalarType::Uuid => self.decode_uuid(value).map(Scalar::Uuid),
        }
    }

    fn decode_nullable(&self, value: &SqlValue, scalar_type: ScalarType) -> Result<Option<Scalar>> {
        if value.is_null() {
            return Ok(None);
        }
        self.decode(value, scalar_type).map(Some)
    }
}

pub(crate) fn malformed(expected: &str, value: &SqlValue) -> RepositoryError {
    match value {
        SqlValue::Null => RepositoryError::Argument(format!("expected {}, got NULL", expected)),
        other => RepositoryError::Argument(format!(
            "expected {}, got {} value {}",
            expected,
            other.type_name(),
            other
        )),
    }
}

pub(crate) fn uuid_from_bytes(bytes: &[u8]) -> Result<Uuid> {
    Uuid::from_slice(bytes).map_err(|_| {
        RepositoryError::Argument(format!(
            "uuid must be exactly 16 bytes, got {}",
            bytes.len()
        ))
    })
}

pub(crate) fn uuid_from_text(text: &str) -> Result<Uuid> {
    Uuid::parse_str(text)
        .map_err(|e| RepositoryError::Argument(format!("malformed uuid '{}': {}", text, e)))
}
