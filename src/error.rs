//! Error types for the plugsql client.
//!

use crate::database::error_codes::PgErrorCode;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ClientError {
    #[error("Connection refused: {0}")]
    ConnectionRefused(String),
    #[error("Timed out waiting for database to accept connections: {0}")]
    ConnectTimeout(String),
    #[error("Timed out acquiring a connection from the pool")]
    PoolTimeout,
    #[error("Pool error: {0}")]
    PoolError(String),
    #[error("Connection lost: {0}")]
    ConnectionLost(String),
    #[error("Query cancelled")]
    Cancelled,
    #[error("Deadline exceeded")]
    DeadlineExceeded,
    #[error("Database error: {message}")]
    DatabaseError {
        code: Option<String>,
        message: String,
    },
    #[error("Connection '{connection}' failed to load: {message}")]
    ConnectionStateError { connection: String, message: String },
    #[error("System call '{call}' failed: {message}")]
    SystemCallError { call: String, message: String },
    #[error("Configuration error: {0}")]
    ConfigurationError(String),
    #[error("Decode error: {0}")]
    DecodeError(String),
    #[error("Timeout error: {0}")]
    Timeout(String),
    #[error("Client is closed")]
    ClientClosed,
}

impl ClientError {
    /// Build a database error carrying a SQLSTATE code.
    pub fn database(code: impl Into<String>, message: impl Into<String>) -> Self {
        ClientError::DatabaseError {
            code: Some(code.into()),
            message: message.into(),
        }
    }

    /// SQLSTATE of a database error, if any.
    pub fn sql_state(&self) -> Option<&str> {
        match self {
            ClientError::DatabaseError { code, .. } => code.as_deref(),
            _ => None,
        }
    }

    /// True only for the "relation does not exist" SQLSTATE. This is the sole
    /// trigger for the schema retry controller.
    pub fn is_relation_not_found(&self) -> bool {
        self.sql_state()
            .is_some_and(PgErrorCode::is_undefined_table)
    }

    /// True for caller-initiated cancellation and deadline expiry.
    pub fn is_cancellation(&self) -> bool {
        matches!(self, ClientError::Cancelled | ClientError::DeadlineExceeded)
    }

    /// True when a leased connection turned out to be unusable and a fresh
    /// lease may succeed.
    pub fn is_stale_connection(&self) -> bool {
        match self {
            ClientError::ConnectionLost(_) => true,
            ClientError::DatabaseError { code: Some(code), .. } => {
                PgErrorCode::is_stale_connection(code)
            }
            _ => false,
        }
    }

    /// Schema named in a "relation does not exist" message.
    ///
    /// Returns `None` when the error is not a missing relation or the relation
    /// was not schema-qualified (`relation "foo" does not exist`).
    pub fn missing_relation_schema(&self) -> Option<String> {
        if !self.is_relation_not_found() {
            return None;
        }
        let ClientError::DatabaseError { message, .. } = self else {
            return None;
        };
        parse_missing_relation_schema(message)
    }
}

/// Extract the schema from `relation "schema.table" does not exist`.
pub fn parse_missing_relation_schema(message: &str) -> Option<String> {
    let start = message.find("relation \"")? + "relation \"".len();
    let rest = &message[start..];
    let end = rest.find("\" does not exist")?;
    let relation = &rest[..end];
    let (schema, _table) = relation.split_once('.')?;
    if schema.is_empty() {
        None
    } else {
        Some(schema.to_string())
    }
}

impl From<sqlx::Error> for ClientError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::PoolTimedOut => ClientError::PoolTimeout,
            sqlx::Error::PoolClosed => ClientError::PoolError("pool is closed".to_string()),
            sqlx::Error::Database(db_err) => ClientError::DatabaseError {
                code: db_err.code().map(|c| c.into_owned()),
                message: db_err.message().to_string(),
            },
            sqlx::Error::Io(io_err) if io_err.kind() == std::io::ErrorKind::ConnectionRefused => {
                ClientError::ConnectionRefused(io_err.to_string())
            }
            sqlx::Error::Io(io_err) => ClientError::ConnectionLost(io_err.to_string()),
            sqlx::Error::WorkerCrashed => {
                ClientError::ConnectionLost("connection worker crashed".to_string())
            }
            sqlx::Error::ColumnDecode { index, source } => {
                ClientError::DecodeError(format!("column {index}: {source}"))
            }
            sqlx::Error::Decode(source) => ClientError::DecodeError(source.to_string()),
            sqlx::Error::Configuration(source) => ClientError::ConfigurationError(source.to_string()),
            other => ClientError::DatabaseError {
                code: None,
                message: other.to_string(),
            },
        }
    }
}

impl From<config::ConfigError> for ClientError {
    fn from(err: config::ConfigError) -> Self {
        ClientError::ConfigurationError(err.to_string())
    }
}

impl From<serde_json::Error> for ClientError {
    fn from(err: serde_json::Error) -> Self {
        ClientError::DecodeError(format!("JSON serialization error: {err}"))
    }
}

pub type ClientResult<T> = Result<T, ClientError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_relation_not_found_detection() {
        let err = ClientError::database("42P01", "relation \"aws.aws_s3_bucket\" does not exist");
        assert!(err.is_relation_not_found());

        let other = ClientError::database("42703", "column \"foo\" does not exist");
        assert!(!other.is_relation_not_found());

        assert!(!ClientError::Cancelled.is_relation_not_found());
    }

    #[test]
    fn test_missing_relation_schema_qualified() {
        let err = ClientError::database("42P01", "relation \"aws.aws_s3_bucket\" does not exist");
        assert_eq!(err.missing_relation_schema(), Some("aws".to_string()));
    }

    #[test]
    fn test_missing_relation_schema_unqualified() {
        let err = ClientError::database("42P01", "relation \"aws_s3_bucket\" does not exist");
        assert_eq!(err.missing_relation_schema(), None);
    }

    #[test]
    fn test_missing_relation_schema_requires_code() {
        let err = ClientError::database("XX000", "relation \"aws.aws_s3_bucket\" does not exist");
        assert_eq!(err.missing_relation_schema(), None);
    }

    #[test]
    fn test_cancellation_classification() {
        assert!(ClientError::Cancelled.is_cancellation());
        assert!(ClientError::DeadlineExceeded.is_cancellation());
        assert!(!ClientError::PoolTimeout.is_cancellation());
    }

    #[test]
    fn test_stale_connection_classification() {
        assert!(ClientError::ConnectionLost("reset".into()).is_stale_connection());
        assert!(ClientError::database("25P03", "idle-in-transaction timeout").is_stale_connection());
        assert!(ClientError::database("57P01", "terminating connection").is_stale_connection());
        assert!(!ClientError::database("42P01", "missing").is_stale_connection());
        assert!(!ClientError::PoolTimeout.is_stale_connection());
    }

    #[test]
    fn test_connection_state_error_mentions_cause() {
        let err = ClientError::ConnectionStateError {
            connection: "aws".to_string(),
            message: "boom".to_string(),
        };
        assert!(err.to_string().contains("boom"));
        assert!(err.to_string().contains("aws"));
    }
}
