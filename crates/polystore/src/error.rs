//! Error types for the persistence layer.
//!
//! All fallible operations return [`StorageError`], which groups failures by
//! category: object state, optimistic concurrency, validation, query handling,
//! configuration, and backend transport. Callers that need to branch on the
//! outcome (for example to pick an HTTP status code) should use
//! [`StorageError::kind`] instead of matching on messages.

// Error enum variant fields are self-documenting via their #[error(...)] messages
#![allow(missing_docs)]

use std::fmt;

use serde_json::Value;
use thiserror::Error;

/// The primary error type for all storage operations.
#[derive(Error, Debug)]
pub enum StorageError {
    /// Object state errors
    #[error(transparent)]
    Resource(#[from] ResourceError),

    /// Optimistic concurrency errors
    #[error(transparent)]
    Concurrency(#[from] ConcurrencyError),

    /// Validation errors
    #[error(transparent)]
    Validation(#[from] ValidationError),

    /// Query parsing and compilation errors
    #[error(transparent)]
    Query(#[from] QueryError),

    /// Misconfiguration detected at runtime
    #[error(transparent)]
    Configuration(#[from] ConfigurationError),

    /// Backend-specific errors
    #[error(transparent)]
    Backend(#[from] BackendError),
}

/// Errors related to object state.
#[derive(Error, Debug)]
pub enum ResourceError {
    /// The requested object was not found (or is tombstoned).
    #[error("object not found: {store}/{id}")]
    NotFound { store: String, id: String },

    /// An object with the given id already exists.
    #[error("object already exists: {store}/{id}")]
    Conflict { store: String, id: String },
}

/// Errors related to optimistic concurrency control.
#[derive(Error, Debug)]
pub enum ConcurrencyError {
    /// A write condition did not hold at write time.
    #[error("update condition failed on {id}: expected {field} = {expected}")]
    UpdateConditionFailed {
        id: String,
        field: String,
        expected: Value,
    },
}

/// Errors related to object and argument validation.
#[derive(Error, Debug)]
pub enum ValidationError {
    /// The object is not acceptable (for example, not a JSON object).
    #[error("invalid object: {message}")]
    InvalidObject { message: String },

    /// The identifier cannot be used by this backend.
    #[error("invalid identifier '{id}': {message}")]
    InvalidIdentifier { id: String, message: String },

    /// The identifier in the payload disagrees with the target id.
    #[error("identifier mismatch: payload has '{payload}', target is '{target}'")]
    IdentifierMismatch { payload: String, target: String },

    /// The attribute holds a value that is not a number.
    #[error("attribute '{attribute}' is not a number")]
    NotANumber { attribute: String },

    /// Incrementing the attribute would leave the range of its number type.
    #[error("incrementing attribute '{attribute}' by {delta} overflows")]
    NumericOverflow { attribute: String, delta: i64 },

    /// The attribute holds a value that is not an array.
    #[error("attribute '{attribute}' is not a collection")]
    NotACollection { attribute: String },

    /// The collection index is outside the collection bounds.
    #[error("index {index} out of range for collection '{attribute}'")]
    IndexOutOfRange { attribute: String, index: usize },
}

/// Errors related to query construction, parsing and compilation.
#[derive(Error, Debug)]
pub enum QueryError {
    /// The expression could not be constructed.
    #[error("invalid expression: {message}")]
    InvalidExpression { message: String },

    /// The textual query could not be parsed.
    #[error("parse error at position {position}: {message}")]
    Parse { message: String, position: usize },

    /// The expression cannot be expressed by the backend, not even as residual.
    #[error("query not supported by {backend}: {message}")]
    CompilationUnsupported { backend: String, message: String },

    /// The continuation token is not one this store produced.
    #[error("invalid continuation token: {token}")]
    InvalidContinuationToken { token: String },
}

/// Backend configuration problems detected while serving a request.
#[derive(Error, Debug)]
pub enum ConfigurationError {
    /// The search index does not exist.
    #[error("unknown index: {index}")]
    UnknownIndex { index: String },

    /// The collection or table does not exist.
    #[error("unknown collection: {collection}")]
    UnknownCollection { collection: String },

    /// A configuration struct failed validation.
    #[error(transparent)]
    Invalid(#[from] crate::core::config::ConfigError),
}

/// Errors originating from the database backend.
///
/// Driver errors are kept as the `source`, so callers can downcast to the
/// client's own error type.
#[derive(Error, Debug)]
pub enum BackendError {
    /// Connection to the backend failed.
    #[error("connection failed to {backend_name}: {message}")]
    ConnectionFailed {
        backend_name: String,
        message: String,
    },

    /// Connection pool exhausted or unavailable.
    #[error("connection pool exhausted for {backend_name}")]
    PoolExhausted { backend_name: String },

    /// Schema initialization error.
    #[error("schema migration failed: {message}")]
    MigrationError { message: String },

    /// Internal backend error, usually a transport failure.
    #[error("internal error in {backend_name}: {message}")]
    Internal {
        backend_name: String,
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Serialization/deserialization error.
    #[error("serialization error: {message}")]
    SerializationError { message: String },
}

/// Stable classification of a [`StorageError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    NotFound,
    Conflict,
    UpdateConditionFailed,
    InvalidInput,
    UnknownIndex,
    UnknownCollection,
    CompilationUnsupported,
    Configuration,
    Backend,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorKind::NotFound => "not-found",
            ErrorKind::Conflict => "conflict",
            ErrorKind::UpdateConditionFailed => "update-condition-failed",
            ErrorKind::InvalidInput => "invalid-input",
            ErrorKind::UnknownIndex => "unknown-index",
            ErrorKind::UnknownCollection => "unknown-collection",
            ErrorKind::CompilationUnsupported => "compilation-unsupported",
            ErrorKind::Configuration => "configuration",
            ErrorKind::Backend => "backend",
        };
        write!(f, "{}", name)
    }
}

impl StorageError {
    /// Returns the stable kind of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            StorageError::Resource(ResourceError::NotFound { .. }) => ErrorKind::NotFound,
            StorageError::Resource(ResourceError::Conflict { .. }) => ErrorKind::Conflict,
            StorageError::Concurrency(_) => ErrorKind::UpdateConditionFailed,
            StorageError::Validation(_) => ErrorKind::InvalidInput,
            StorageError::Query(QueryError::CompilationUnsupported { .. }) => {
                ErrorKind::CompilationUnsupported
            }
            StorageError::Query(_) => ErrorKind::InvalidInput,
            StorageError::Configuration(ConfigurationError::UnknownIndex { .. }) => {
                ErrorKind::UnknownIndex
            }
            StorageError::Configuration(ConfigurationError::UnknownCollection { .. }) => {
                ErrorKind::UnknownCollection
            }
            StorageError::Configuration(ConfigurationError::Invalid(_)) => {
                ErrorKind::Configuration
            }
            StorageError::Backend(_) => ErrorKind::Backend,
        }
    }

    /// Returns true if re-reading and retrying the operation can succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, StorageError::Concurrency(_))
    }

    /// Returns true for [`ErrorKind::NotFound`].
    pub fn is_not_found(&self) -> bool {
        self.kind() == ErrorKind::NotFound
    }

    pub(crate) fn not_found(store: &str, id: &str) -> Self {
        StorageError::Resource(ResourceError::NotFound {
            store: store.to_string(),
            id: id.to_string(),
        })
    }

    pub(crate) fn conflict(store: &str, id: &str) -> Self {
        StorageError::Resource(ResourceError::Conflict {
            store: store.to_string(),
            id: id.to_string(),
        })
    }

    pub(crate) fn condition_failed(id: &str, field: &str, expected: &Value) -> Self {
        StorageError::Concurrency(ConcurrencyError::UpdateConditionFailed {
            id: id.to_string(),
            field: field.to_string(),
            expected: expected.clone(),
        })
    }
}

/// Result type alias for storage operations.
pub type StorageResult<T> = Result<T, StorageError>;

impl From<serde_json::Error> for StorageError {
    fn from(err: serde_json::Error) -> Self {
        StorageError::Backend(BackendError::SerializationError {
            message: err.to_string(),
        })
    }
}

impl From<crate::core::config::ConfigError> for StorageError {
    fn from(err: crate::core::config::ConfigError) -> Self {
        StorageError::Configuration(ConfigurationError::Invalid(err))
    }
}

#[cfg(feature = "sqlite")]
impl From<rusqlite::Error> for StorageError {
    fn from(err: rusqlite::Error) -> Self {
        StorageError::Backend(BackendError::Internal {
            backend_name: "sqlite".to_string(),
            message: err.to_string(),
            source: Some(Box::new(err)),
        })
    }
}

#[cfg(feature = "sqlite")]
impl From<r2d2::Error> for StorageError {
    fn from(_err: r2d2::Error) -> Self {
        StorageError::Backend(BackendError::PoolExhausted {
            backend_name: "sqlite".to_string(),
        })
    }
}

#[cfg(feature = "postgres")]
impl From<tokio_postgres::Error> for StorageError {
    fn from(err: tokio_postgres::Error) -> Self {
        StorageError::Backend(BackendError::Internal {
            backend_name: "postgres".to_string(),
            message: err.to_string(),
            source: Some(Box::new(err)),
        })
    }
}

#[cfg(feature = "mongodb")]
impl From<mongodb::error::Error> for StorageError {
    fn from(err: mongodb::error::Error) -> Self {
        StorageError::Backend(BackendError::Internal {
            backend_name: "mongodb".to_string(),
            message: err.to_string(),
            source: Some(Box::new(err)),
        })
    }
}

#[cfg(feature = "elasticsearch")]
impl From<elasticsearch::Error> for StorageError {
    fn from(err: elasticsearch::Error) -> Self {
        StorageError::Backend(BackendError::Internal {
            backend_name: "elasticsearch".to_string(),
            message: err.to_string(),
            source: Some(Box::new(err)),
        })
    }
}

#[cfg(feature = "filesystem")]
impl From<object_store::Error> for StorageError {
    fn from(err: object_store::Error) -> Self {
        StorageError::Backend(BackendError::Internal {
            backend_name: "filesystem".to_string(),
            message: err.to_string(),
            source: Some(Box::new(err)),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_storage_error_display() {
        let err = StorageError::not_found("users", "123");
        assert_eq!(err.to_string(), "object not found: users/123");
    }

    #[test]
    fn test_condition_failed_display() {
        let err = StorageError::condition_failed("u1", "version", &json!(3));
        assert_eq!(
            err.to_string(),
            "update condition failed on u1: expected version = 3"
        );
    }

    #[test]
    fn test_error_kinds() {
        assert_eq!(
            StorageError::not_found("s", "1").kind(),
            ErrorKind::NotFound
        );
        assert_eq!(StorageError::conflict("s", "1").kind(), ErrorKind::Conflict);
        assert_eq!(
            StorageError::condition_failed("1", "f", &Value::Null).kind(),
            ErrorKind::UpdateConditionFailed
        );
        let err: StorageError = ConfigurationError::UnknownIndex {
            index: "idx".to_string(),
        }
        .into();
        assert_eq!(err.kind(), ErrorKind::UnknownIndex);
        let err: StorageError = QueryError::InvalidContinuationToken {
            token: "x".to_string(),
        }
        .into();
        assert_eq!(err.kind(), ErrorKind::InvalidInput);
    }

    #[test]
    fn test_only_condition_failures_are_retryable() {
        assert!(StorageError::condition_failed("1", "f", &Value::Null).is_retryable());
        assert!(!StorageError::not_found("s", "1").is_retryable());
    }

    #[test]
    fn test_transport_error_keeps_source() {
        use std::error::Error;

        let io = std::io::Error::other("connection reset");
        let err = StorageError::Backend(BackendError::Internal {
            backend_name: "test".to_string(),
            message: io.to_string(),
            source: Some(Box::new(io)),
        });
        assert!(err.source().is_some());
        assert_eq!(err.kind(), ErrorKind::Backend);
    }
}
