//! Error Types
//!
//! One classified taxonomy shared by the ledger store, the orchestrators and
//! the task pipeline. Storage-engine errors are converted exactly once, in
//! `From<sqlx::Error>`; nothing above the store sees a driver error.

use thiserror::Error;

/// Result alias used across the crate
pub type Result<T, E = BankError> = std::result::Result<T, E>;

/// SQLSTATE codes we classify explicitly
mod sqlstate {
    pub const UNIQUE_VIOLATION: &str = "23505";
    pub const FOREIGN_KEY_VIOLATION: &str = "23503";
    pub const SERIALIZATION_FAILURE: &str = "40001";
    pub const DEADLOCK_DETECTED: &str = "40P01";
    pub const LOCK_NOT_AVAILABLE: &str = "55P03";
    pub const QUERY_CANCELED: &str = "57014";
    pub const ADMIN_SHUTDOWN: &str = "57P01";
}

/// Classified error
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BankError {
    // === Caller errors (no transaction started) ===
    #[error("validation failed: {0}")]
    Validation(String),

    // === Storage errors ===
    #[error("not found: {0}")]
    NotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("transient storage error: {0}")]
    TransientStorage(String),

    #[error("storage error: {0}")]
    Storage(String),

    // === Task pipeline errors ===
    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("broker unavailable: {0}")]
    BrokerUnavailable(String),

    #[error("task handler failed: {0}")]
    Handler(String),

    /// Handler failure that must not be retried (bad payload, unknown type)
    #[error("task handler failed permanently: {0}")]
    PermanentHandler(String),
}

impl BankError {
    /// Stable error code for logs and API mapping
    pub fn code(&self) -> &'static str {
        match self {
            BankError::Validation(_) => "VALIDATION_ERROR",
            BankError::NotFound(_) => "NOT_FOUND",
            BankError::Conflict(_) => "CONFLICT",
            BankError::TransientStorage(_) => "TRANSIENT_STORAGE",
            BankError::Storage(_) => "STORAGE_ERROR",
            BankError::Serialization(_) => "SERIALIZATION_ERROR",
            BankError::BrokerUnavailable(_) => "BROKER_UNAVAILABLE",
            BankError::Handler(_) => "HANDLER_ERROR",
            BankError::PermanentHandler(_) => "PERMANENT_HANDLER_ERROR",
        }
    }

    /// Whether retrying the same operation may succeed
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            BankError::TransientStorage(_)
                | BankError::BrokerUnavailable(_)
                | BankError::Handler(_)
        )
    }

    pub fn validation(msg: impl Into<String>) -> Self {
        BankError::Validation(msg.into())
    }

    pub fn not_found(what: impl Into<String>) -> Self {
        BankError::NotFound(what.into())
    }

    pub fn handler(msg: impl std::fmt::Display) -> Self {
        BankError::Handler(msg.to_string())
    }
}

impl From<sqlx::Error> for BankError {
    fn from(e: sqlx::Error) -> Self {
        match &e {
            sqlx::Error::RowNotFound => BankError::NotFound("record not found".to_string()),
            sqlx::Error::Database(db) => match db.code().as_deref() {
                Some(sqlstate::UNIQUE_VIOLATION) => BankError::Conflict(db.message().to_string()),
                Some(sqlstate::FOREIGN_KEY_VIOLATION) => {
                    BankError::NotFound(db.message().to_string())
                }
                Some(
                    sqlstate::SERIALIZATION_FAILURE
                    | sqlstate::DEADLOCK_DETECTED
                    | sqlstate::LOCK_NOT_AVAILABLE
                    | sqlstate::QUERY_CANCELED
                    | sqlstate::ADMIN_SHUTDOWN,
                ) => BankError::TransientStorage(db.message().to_string()),
                _ => BankError::Storage(db.message().to_string()),
            },
            sqlx::Error::Io(_)
            | sqlx::Error::PoolTimedOut
            | sqlx::Error::PoolClosed
            | sqlx::Error::WorkerCrashed
            | sqlx::Error::Tls(_)
            | sqlx::Error::Protocol(_) => BankError::TransientStorage(e.to_string()),
            _ => BankError::Storage(e.to_string()),
        }
    }
}

impl From<serde_json::Error> for BankError {
    fn from(e: serde_json::Error) -> Self {
        BankError::Serialization(e.to_string())
    }
}

impl From<validator::ValidationErrors> for BankError {
    fn from(e: validator::ValidationErrors) -> Self {
        BankError::Validation(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes() {
        assert_eq!(BankError::validation("x").code(), "VALIDATION_ERROR");
        assert_eq!(BankError::not_found("account 1").code(), "NOT_FOUND");
        assert_eq!(BankError::Conflict("dup".into()).code(), "CONFLICT");
        assert_eq!(
            BankError::BrokerUnavailable("down".into()).code(),
            "BROKER_UNAVAILABLE"
        );
    }

    #[test]
    fn test_retryable() {
        assert!(BankError::TransientStorage("timeout".into()).is_retryable());
        assert!(BankError::Handler("smtp".into()).is_retryable());
        assert!(!BankError::PermanentHandler("bad payload".into()).is_retryable());
        assert!(!BankError::Conflict("dup".into()).is_retryable());
        assert!(!BankError::validation("amount").is_retryable());
    }

    #[test]
    fn test_sqlx_row_not_found_is_not_found() {
        let err: BankError = sqlx::Error::RowNotFound.into();
        assert!(matches!(err, BankError::NotFound(_)));
    }

    #[test]
    fn test_sqlx_pool_timeout_is_transient() {
        let err: BankError = sqlx::Error::PoolTimedOut.into();
        assert!(matches!(err, BankError::TransientStorage(_)));
        assert!(err.is_retryable());
    }

    #[test]
    fn test_serde_error_is_serialization() {
        let err: BankError = serde_json::from_str::<u32>("nope").unwrap_err().into();
        assert_eq!(err.code(), "SERIALIZATION_ERROR");
    }
}
