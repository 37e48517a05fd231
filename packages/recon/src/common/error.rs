use std::fmt::Write;

use thiserror::Error;
use uuid::Uuid;

pub type StoreResult<T> = Result<T, StoreError>;
pub type OrchestratorResult<T> = Result<T, OrchestratorError>;

/// Errors returned by the persistence gateway.
///
/// Raw driver errors never cross this boundary; they are classified by
/// SQLSTATE (or by failure mode for transport errors) on the way out.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("referenced {table} row(s) missing: {}", join_ids(.ids))]
    ForeignKeyMissing { table: String, ids: Vec<Uuid> },

    #[error("serialization conflict: {0}")]
    SerializationConflict(String),

    #[error("constraint violation: {0}")]
    ConstraintViolation(String),

    #[error("database unavailable: {0}")]
    ConnectionFailure(String),

    #[error("{0} not found")]
    NotFound(String),

    #[error("failed to decode row: {0}")]
    Decode(String),

    #[error("database error: {0}")]
    Database(String),
}

impl StoreError {
    pub fn foreign_key_missing(table: &str, ids: impl IntoIterator<Item = Uuid>) -> Self {
        StoreError::ForeignKeyMissing {
            table: table.to_string(),
            ids: ids.into_iter().collect(),
        }
    }

    /// Transient failures the retry policy may re-attempt.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            StoreError::SerializationConflict(_) | StoreError::ConnectionFailure(_)
        )
    }
}

fn join_ids(ids: &[Uuid]) -> String {
    let mut out = String::new();
    for (i, id) in ids.iter().enumerate() {
        if i > 0 {
            out.push_str(", ");
        }
        let _ = write!(out, "{}", id);
    }
    out
}

/// Maps a Postgres SQLSTATE to the gateway taxonomy.
pub fn classify_sqlstate(code: &str, message: &str) -> StoreError {
    let message = message.to_string();
    match code {
        "40001" | "40P01" => StoreError::SerializationConflict(message),
        // The guard reports missing parents with their ids before the
        // insert runs; this only fires if a write bypassed it.
        "23503" => StoreError::ForeignKeyMissing {
            table: message,
            ids: Vec::new(),
        },
        "23505" | "23514" | "23502" | "23P01" => StoreError::ConstraintViolation(message),
        "57P01" | "57P02" | "57P03" | "53300" => StoreError::ConnectionFailure(message),
        c if c.starts_with("08") => StoreError::ConnectionFailure(message),
        _ => StoreError::Database(message),
    }
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::RowNotFound => StoreError::NotFound("row".to_string()),
            sqlx::Error::Database(db) => {
                let code = db.code().map(|c| c.into_owned()).unwrap_or_default();
                classify_sqlstate(&code, db.message())
            }
            sqlx::Error::Io(e) => StoreError::ConnectionFailure(e.to_string()),
            sqlx::Error::Tls(e) => StoreError::ConnectionFailure(e.to_string()),
            sqlx::Error::Protocol(msg) => StoreError::ConnectionFailure(msg),
            sqlx::Error::PoolTimedOut => {
                StoreError::ConnectionFailure("timed out acquiring a connection".to_string())
            }
            sqlx::Error::PoolClosed => {
                StoreError::ConnectionFailure("connection pool is closed".to_string())
            }
            sqlx::Error::WorkerCrashed => {
                StoreError::ConnectionFailure("connection worker crashed".to_string())
            }
            e @ (sqlx::Error::ColumnDecode { .. }
            | sqlx::Error::Decode(_)
            | sqlx::Error::ColumnNotFound(_)
            | sqlx::Error::TypeNotFound { .. }) => StoreError::Decode(e.to_string()),
            other => StoreError::Database(other.to_string()),
        }
    }
}

/// Input rejected before anything was written.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{0}")]
pub struct ValidationError(pub String);

impl ValidationError {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

/// Errors surfaced to callers of the orchestrator.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum OrchestratorError {
    #[error("referenced {table} row(s) missing: {}", join_ids(.ids))]
    ForeignKeyMissing { table: String, ids: Vec<Uuid> },

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("unavailable: {0}")]
    Unavailable(String),

    #[error("invalid state: {0}")]
    InvalidState(String),

    #[error("{0} not found")]
    NotFound(String),

    #[error("validation failed: {0}")]
    Validation(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl From<StoreError> for OrchestratorError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::ForeignKeyMissing { table, ids } => {
                OrchestratorError::ForeignKeyMissing { table, ids }
            }
            StoreError::SerializationConflict(m) => OrchestratorError::Conflict(m),
            StoreError::ConnectionFailure(m) => OrchestratorError::Unavailable(m),
            StoreError::ConstraintViolation(m) => OrchestratorError::InvalidState(m),
            StoreError::NotFound(m) => OrchestratorError::NotFound(m),
            StoreError::Decode(m) | StoreError::Database(m) => OrchestratorError::Internal(m),
        }
    }
}

impl From<ValidationError> for OrchestratorError {
    fn from(err: ValidationError) -> Self {
        OrchestratorError::Validation(err.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serialization_failures_and_deadlocks_are_conflicts() {
        assert!(matches!(
            classify_sqlstate("40001", "could not serialize access"),
            StoreError::SerializationConflict(_)
        ));
        assert!(matches!(
            classify_sqlstate("40P01", "deadlock detected"),
            StoreError::SerializationConflict(_)
        ));
    }

    #[test]
    fn connection_class_codes_are_connection_failures() {
        for code in ["08000", "08003", "08006", "57P01"] {
            assert!(
                matches!(classify_sqlstate(code, "gone"), StoreError::ConnectionFailure(_)),
                "{code}"
            );
        }
    }

    #[test]
    fn integrity_codes_are_not_retryable() {
        for code in ["23503", "23505", "23514", "23502"] {
            assert!(!classify_sqlstate(code, "nope").is_retryable(), "{code}");
        }
        assert!(matches!(
            classify_sqlstate("23503", "fk"),
            StoreError::ForeignKeyMissing { .. }
        ));
    }

    #[test]
    fn only_transient_errors_are_retryable() {
        assert!(StoreError::SerializationConflict("x".into()).is_retryable());
        assert!(StoreError::ConnectionFailure("x".into()).is_retryable());
        assert!(!StoreError::NotFound("x".into()).is_retryable());
        assert!(!StoreError::foreign_key_missing("hosts", [Uuid::nil()]).is_retryable());
    }

    #[test]
    fn row_not_found_maps_to_not_found() {
        assert!(matches!(
            StoreError::from(sqlx::Error::RowNotFound),
            StoreError::NotFound(_)
        ));
        assert!(StoreError::from(sqlx::Error::PoolTimedOut).is_retryable());
    }

    #[test]
    fn foreign_key_message_lists_ids() {
        let a = Uuid::now_v7();
        let b = Uuid::now_v7();
        let err = StoreError::foreign_key_missing("hosts", [a, b]);
        assert_eq!(
            err.to_string(),
            format!("referenced hosts row(s) missing: {}, {}", a, b)
        );
    }

    #[test]
    fn store_errors_map_to_caller_taxonomy() {
        assert!(matches!(
            OrchestratorError::from(StoreError::SerializationConflict("x".into())),
            OrchestratorError::Conflict(_)
        ));
        assert!(matches!(
            OrchestratorError::from(StoreError::ConnectionFailure("x".into())),
            OrchestratorError::Unavailable(_)
        ));
        assert!(matches!(
            OrchestratorError::from(StoreError::ConstraintViolation("x".into())),
            OrchestratorError::InvalidState(_)
        ));
    }
}
