use std::fmt;
use std::time::Duration;
use thiserror::Error;

use crate::config::ConnectionTarget;

pub type Result<T> = std::result::Result<T, RepositoryError>;

/// Boxed driver error kept as the cause of a mapped failure.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Stable classification presented to callers of the repository.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    NotFound,
    Duplicate,
    Constraint,
    Connection,
    Timeout,
    Unknown,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorKind::NotFound => write!(f, "not found"),
            ErrorKind::Duplicate => write!(f, "duplicate"),
            ErrorKind::Constraint => write!(f, "constraint violation"),
            ErrorKind::Connection => write!(f, "connection error"),
            ErrorKind::Timeout => write!(f, "timeout"),
            ErrorKind::Unknown => write!(f, "unknown database error"),
        }
    }
}

#[derive(Debug, Error)]
pub enum RepositoryError {
    /// Runtime failure, classified by the [`ErrorMapper`].
    #[error("{kind}: {message}")]
    Database {
        kind: ErrorKind,
        message: String,
        #[source]
        cause: Option<BoxError>,
    },

    /// Aggregate descriptor rejected at construction time.
    #[error("invalid field '{field}' of type {type_name}: {reason}. {suggestion}")]
    Descriptor {
        field: String,
        type_name: String,
        reason: String,
        suggestion: String,
    },

    /// A stored row could not be turned back into an aggregate.
    #[error("cannot deserialize {aggregate}: field '{field}' {reason}")]
    Deserialization {
        aggregate: String,
        field: String,
        reason: String,
    },

    /// Malformed value handed to a codec or flattener.
    #[error("Invalid argument: {0}")]
    Argument(String),

    #[error("Schema error: {0}")]
    Schema(String),

    #[error("Transaction error: {0}")]
    Transaction(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl RepositoryError {
    /// Error for a primary-key lookup that matched no row.
    pub fn not_found(aggregate: &str, id: impl fmt::Display) -> Self {
        RepositoryError::Database {
            kind: ErrorKind::NotFound,
            message: format!("{} with id {} does not exist", aggregate, id),
            cause: None,
        }
    }

    pub fn descriptor(
        field: impl Into<String>,
        type_name: impl Into<String>,
        reason: impl Into<String>,
        suggestion: impl Into<String>,
    ) -> Self {
        RepositoryError::Descriptor {
            field: field.into(),
            type_name: type_name.into(),
            reason: reason.into(),
            suggestion: suggestion.into(),
        }
    }

    pub fn deserialization(
        aggregate: impl Into<String>,
        field: impl Into<String>,
        reason: impl Into<String>,
    ) -> Self {
        RepositoryError::Deserialization {
            aggregate: aggregate.into(),
            field: field.into(),
            reason: reason.into(),
        }
    }

    /// Classification of a runtime failure, `None` for the other layers.
    pub fn kind(&self) -> Option<ErrorKind> {
        match self {
            RepositoryError::Database { kind, .. } => Some(*kind),
            _ => None,
        }
    }

    pub fn is_not_found(&self) -> bool {
        self.kind() == Some(ErrorKind::NotFound)
    }

    pub fn is_duplicate(&self) -> bool {
        self.kind() == Some(ErrorKind::Duplicate)
    }

    /// Format error with full details including the cause chain
    pub fn format_detailed(&self) -> String {
        let mut output = format!("Error: {}\n", self);

        let mut source = std::error::Error::source(self);
        let mut depth = 1;
        while let Some(err) = source {
            output.push_str(&format!("\nCaused by:\n  {}: {}", depth, err));
            source = err.source();
            depth += 1;
        }

        output
    }
}

// SQLite extended result codes.
const SQLITE_CONSTRAINT_CHECK: &str = "275";
const SQLITE_CONSTRAINT_FOREIGNKEY: &str = "787";
const SQLITE_CONSTRAINT_NOTNULL: &str = "1299";
const SQLITE_CONSTRAINT_PRIMARYKEY: &str = "1555";
const SQLITE_CONSTRAINT_UNIQUE: &str = "2067";

// MySQL server error numbers, reported as the SQLSTATE by sqlx, so
// messages are inspected for them as well.
const MYSQL_DUPLICATE_ENTRY: &str = "1062";
const MYSQL_ACCESS_DENIED: [&str; 2] = ["1044", "1045"];

/// Normalizes driver failures into the closed [`ErrorKind`] taxonomy.
///
/// The connection target is only used to build messages for connection
/// failures; credentials never reach it.
#[derive(Debug, Clone)]
pub struct ErrorMapper {
    target: ConnectionTarget,
}

impl ErrorMapper {
    pub fn new(target: ConnectionTarget) -> Self {
        Self { target }
    }

    pub fn target(&self) -> &ConnectionTarget {
        &self.target
    }

    pub fn map(&self, err: sqlx::Error) -> RepositoryError {
        let (kind, message) = match &err {
            sqlx::Error::Database(db) => self.classify_database(db.as_ref()),
            sqlx::Error::RowNotFound => (ErrorKind::NotFound, "no row returned".to_string()),
            sqlx::Error::PoolTimedOut => (
                ErrorKind::Timeout,
                format!("timed out acquiring a connection to {}", self.target),
            ),
            sqlx::Error::Io(io) => (
                ErrorKind::Connection,
                format!("cannot reach {}: {}", self.target, io),
            ),
            sqlx::Error::Tls(tls) => (
                ErrorKind::Connection,
                format!("TLS handshake with {} failed: {}", self.target, tls),
            ),
            sqlx::Error::Configuration(cfg) => (
                ErrorKind::Connection,
                format!("invalid connection settings for {}: {}", self.target, cfg),
            ),
            sqlx::Error::PoolClosed | sqlx::Error::WorkerCrashed => (
                ErrorKind::Connection,
                format!("connection to {} is closed", self.target),
            ),
            other => (ErrorKind::Unknown, other.to_string()),
        };

        RepositoryError::Database {
            kind,
            message,
            cause: Some(Box::new(err)),
        }
    }

    /// Maps an elapsed statement deadline.
    pub fn timeout(&self, sql: &str, limit: Duration, elapsed: tokio::time::error::Elapsed) -> RepositoryError {
        RepositoryError::Database {
            kind: ErrorKind::Timeout,
            message: format!(
                "statement exceeded {:?} deadline on {}: {}",
                limit, self.target, sql
            ),
            cause: Some(Box::new(elapsed)),
        }
    }

    fn classify_database(&self, db: &dyn sqlx::error::DatabaseError) -> (ErrorKind, String) {
        let message = db.message().to_string();
        let code = db.code().map(|c| c.into_owned()).unwrap_or_default();

        let kind = match db.kind() {
            sqlx::error::ErrorKind::UniqueViolation => ErrorKind::Duplicate,
            sqlx::error::ErrorKind::ForeignKeyViolation
            | sqlx::error::ErrorKind::NotNullViolation
            | sqlx::error::ErrorKind::CheckViolation => ErrorKind::Constraint,
            _ => classify_code(&code, &message),
        };

        if kind == ErrorKind::Connection {
            return (
                kind,
                format!("cannot connect to {}: {}", self.target, message),
            );
        }

        (kind, message)
    }
}

/// Fallback classification on raw codes and messages.
fn classify_code(code: &str, message: &str) -> ErrorKind {
    match code {
        SQLITE_CONSTRAINT_PRIMARYKEY | SQLITE_CONSTRAINT_UNIQUE => return ErrorKind::Duplicate,
        SQLITE_CONSTRAINT_FOREIGNKEY | SQLITE_CONSTRAINT_NOTNULL | SQLITE_CONSTRAINT_CHECK => {
            return ErrorKind::Constraint
        }
        _ => {}
    }

    let lowered = message.to_lowercase();
    if lowered.contains("duplicate entry")
        || lowered.contains("unique constraint failed")
        || code == MYSQL_DUPLICATE_ENTRY
    {
        ErrorKind::Duplicate
    } else if lowered.contains("foreign key constraint") {
        ErrorKind::Constraint
    } else if MYSQL_ACCESS_DENIED.iter().any(|c| *c == code)
        || lowered.contains("access denied")
        || lowered.contains("unable to open database")
    {
        ErrorKind::Connection
    } else if lowered.contains("lock wait timeout") || lowered.contains("maximum statement execution time") {
        ErrorKind::Timeout
    } else {
        ErrorKind::Unknown
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mapper() -> ErrorMapper {
        ErrorMapper::new(ConnectionTarget::new("db.internal", 3306, "shop"))
    }

    #[test]
    fn test_io_error_names_target() {
        let io = std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "refused");
        let err = mapper().map(sqlx::Error::Io(io));

        assert_eq!(err.kind(), Some(ErrorKind::Connection));
        let text = err.to_string();
        assert!(text.contains("db.internal"));
        assert!(text.contains("3306"));
        assert!(text.contains("shop"));
        assert!(std::error::Error::source(&err).is_some());
    }

    #[tokio::test]
    async fn test_elapsed_deadline_is_timeout() {
        let elapsed = tokio::time::timeout(Duration::from_millis(1), std::future::pending::<()>())
            .await
            .unwrap_err();
        let err = mapper().timeout("SELECT 1", Duration::from_millis(1), elapsed);

        assert_eq!(err.kind(), Some(ErrorKind::Timeout));
        let text = err.to_string();
        assert!(text.contains("db.internal"));
        assert!(text.contains("3306"));
        assert!(text.contains("shop"));
        assert!(text.contains("SELECT 1"));
        assert!(std::error::Error::source(&err).is_some());
    }

    #[test]
    fn test_pool_timeout_is_timeout() {
        let err = mapper().map(sqlx::Error::PoolTimedOut);
        assert_eq!(err.kind(), Some(ErrorKind::Timeout));
    }

    #[test]
    fn test_protocol_error_is_unknown_with_cause() {
        let err = mapper().map(sqlx::Error::Protocol("bad packet".to_string()));
        assert_eq!(err.kind(), Some(ErrorKind::Unknown));
        assert!(err.format_detailed().contains("bad packet"));
    }

    #[test]
    fn test_classify_code_fallbacks() {
        assert_eq!(classify_code("1555", ""), ErrorKind::Duplicate);
        assert_eq!(classify_code("2067", ""), ErrorKind::Duplicate);
        assert_eq!(classify_code("787", ""), ErrorKind::Constraint);
        assert_eq!(
            classify_code("23000", "Duplicate entry 'x' for key 'PRIMARY'"),
            ErrorKind::Duplicate
        );
        assert_eq!(
            classify_code("23000", "Cannot add or update a child row: a foreign key constraint fails"),
            ErrorKind::Constraint
        );
        assert_eq!(classify_code("1045", "Access denied for user"), ErrorKind::Connection);
        assert_eq!(classify_code("1", "no such table: missing"), ErrorKind::Unknown);
    }

    #[test]
    fn test_not_found_names_aggregate_and_key() {
        let err = RepositoryError::not_found("order", "42");
        assert!(err.is_not_found());
        assert_eq!(err.to_string(), "not found: order with id 42 does not exist");
    }

    #[test]
    fn test_descriptor_error_message() {
        let err = RepositoryError::descriptor(
            "customer",
            "Customer",
            "aggregate roots cannot be collection elements",
            "store the referenced aggregate's id instead",
        );
        let text = err.to_string();
        assert!(text.contains("customer"));
        assert!(text.contains("Customer"));
        assert!(text.contains("store the referenced aggregate's id instead"));
        assert_eq!(err.kind(), None);
    }
}
