//! Error types for runstash-store
//!
//! Lookups that miss are not errors: they surface as `None` or `false`.
//! Everything here is a real failure the caller has to map to its own
//! transport-level signal.

use thiserror::Error;

/// Errors that can occur in store operations
#[derive(Debug, Error)]
pub enum StoreError {
    /// A uniqueness constraint (run key or id) was violated on insert
    #[error("Constraint violation: {0}")]
    ConstraintViolation(String),

    /// The underlying database is closed, corrupted or otherwise unusable
    #[error("Storage unavailable: {0}")]
    StorageUnavailable(String),

    /// The caller supplied a missing or malformed field
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Error during serialization
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Error during deserialization
    #[error("Deserialization error: {0}")]
    Deserialization(String),

    /// Invalid store configuration
    #[error("Configuration error: {0}")]
    Config(String),
}

impl StoreError {
    /// Create a new ConstraintViolation error
    pub fn constraint(message: impl Into<String>) -> Self {
        Self::ConstraintViolation(message.into())
    }

    /// Create a new StorageUnavailable error
    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::StorageUnavailable(message.into())
    }

    /// Create a new InvalidInput error
    pub fn invalid_input(message: impl Into<String>) -> Self {
        Self::InvalidInput(message.into())
    }

    /// Create a new Serialization error
    pub fn serialization(message: impl Into<String>) -> Self {
        Self::Serialization(message.into())
    }

    /// Create a new Deserialization error
    pub fn deserialization(message: impl Into<String>) -> Self {
        Self::Deserialization(message.into())
    }

    /// Create a new Config error
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }
}

/// Result type alias for store operations
pub type StoreResult<T> = Result<T, StoreError>;

impl From<std::io::Error> for StoreError {
    fn from(err: std::io::Error) -> Self {
        StoreError::StorageUnavailable(err.to_string())
    }
}

impl From<redb::Error> for StoreError {
    fn from(err: redb::Error) -> Self {
        StoreError::StorageUnavailable(err.to_string())
    }
}

impl From<redb::DatabaseError> for StoreError {
    fn from(err: redb::DatabaseError) -> Self {
        StoreError::StorageUnavailable(err.to_string())
    }
}

impl From<redb::TransactionError> for StoreError {
    fn from(err: redb::TransactionError) -> Self {
        StoreError::StorageUnavailable(err.to_string())
    }
}

impl From<redb::TableError> for StoreError {
    fn from(err: redb::TableError) -> Self {
        StoreError::StorageUnavailable(err.to_string())
    }
}

impl From<redb::StorageError> for StoreError {
    fn from(err: redb::StorageError) -> Self {
        StoreError::StorageUnavailable(err.to_string())
    }
}

impl From<redb::CommitError> for StoreError {
    fn from(err: redb::CommitError) -> Self {
        StoreError::StorageUnavailable(err.to_string())
    }
}

/// Convert from postcard Error to StoreError
impl From<postcard::Error> for StoreError {
    fn from(err: postcard::Error) -> Self {
        StoreError::Deserialization(err.to_string())
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        StoreError::Serialization(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_constraint_error() {
        let err = StoreError::constraint("run key already exists: r-1");
        assert!(matches!(err, StoreError::ConstraintViolation(_)));
        assert!(err.to_string().contains("r-1"));
    }

    #[test]
    fn test_io_error_conversion() {
        let io_err = std::io::Error::new(std::io::ErrorKind::StorageFull, "disk full");
        let store_err: StoreError = io_err.into();
        assert!(matches!(store_err, StoreError::StorageUnavailable(_)));
    }

    #[test]
    fn test_json_error_conversion() {
        let json_err = serde_json::from_str::<serde_json::Value>("{not json").unwrap_err();
        let store_err: StoreError = json_err.into();
        assert!(matches!(store_err, StoreError::Serialization(_)));
    }

    #[test]
    fn test_invalid_input_error() {
        let err = StoreError::invalid_input("run_key is required");
        assert!(matches!(err, StoreError::InvalidInput(_)));
        assert_eq!(err.to_string(), "Invalid input: run_key is required");
    }
}
