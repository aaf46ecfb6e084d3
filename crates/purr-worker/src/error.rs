//! Worker error taxonomy
//!
//! Every handler failure is caught at the coordinator's per-task boundary and
//! turned into a FAILED status. The variants say which phase failed so the log
//! line is enough to triage a stuck batch.

use thiserror::Error;

/// Result type alias for worker operations
pub type WorkerResult<T> = std::result::Result<T, WorkerError>;

#[derive(Error, Debug)]
pub enum WorkerError {
    /// Query execution against a project's source store failed
    #[error("Source query error: {0}")]
    SourceQuery(String),

    /// A chunk's upsert transaction was rolled back
    #[error("Sink transaction error ({asset}): {message}")]
    SinkTransaction { asset: String, message: String },

    /// Ambiguous prefixes, malformed directives, bad chunk size, ...
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// The task bus rejected the call because the session expired
    #[error("Session expired: {0}")]
    SessionExpired(String),

    #[error("Task bus error: {0}")]
    Bus(String),

    #[error("Asset definition error: {0}")]
    Definition(String),

    #[error("Project not found: {0}")]
    ProjectNotFound(String),

    /// A task record addressed to this worker could not be decoded
    #[error("Task decode error: {0}")]
    Decode(String),

    /// Directive handled by an external collaborator this worker does not have
    #[error("No handler for {0} tasks")]
    Unhandled(purr_common::Directive),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error(transparent)]
    Common(#[from] purr_common::PurrError),
}

impl WorkerError {
    pub fn config(message: impl Into<String>) -> Self {
        WorkerError::Configuration(message.into())
    }

    pub fn sink(asset: impl Into<String>, message: impl std::fmt::Display) -> Self {
        WorkerError::SinkTransaction {
            asset: asset.into(),
            message: message.to_string(),
        }
    }

    pub fn is_session_expired(&self) -> bool {
        matches!(self, WorkerError::SessionExpired(_))
    }

    /// Classify a control-database error, recognising expired sessions.
    ///
    /// Postgres reports revoked or expired credentials with SQLSTATE class 28;
    /// gateways that front the database with JWTs say "JWT expired".
    pub fn from_bus(err: sqlx::Error) -> Self {
        if let sqlx::Error::Database(ref db_err) = err {
            let expired = db_err.code().is_some_and(|code| code.starts_with("28"))
                || db_err.message().contains("JWT expired");
            if expired {
                return WorkerError::SessionExpired(db_err.message().to_string());
            }
        }
        WorkerError::Bus(err.to_string())
    }
}

impl From<reqwest::Error> for WorkerError {
    fn from(err: reqwest::Error) -> Self {
        WorkerError::Definition(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_expired_classification() {
        assert!(WorkerError::SessionExpired("JWT expired".into()).is_session_expired());
        assert!(!WorkerError::Bus("connection reset".into()).is_session_expired());
    }

    #[test]
    fn test_non_database_bus_error_is_not_session() {
        let err = WorkerError::from_bus(sqlx::Error::PoolTimedOut);
        assert!(matches!(err, WorkerError::Bus(_)));
    }

    #[test]
    fn test_sink_error_message() {
        let err = WorkerError::sink("well", "duplicate key");
        assert_eq!(err.to_string(), "Sink transaction error (well): duplicate key");
    }
}
