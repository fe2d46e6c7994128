//! Error types for the instance state store.

use thiserror::Error;

/// Result type alias for state store operations.
pub type StateResult<T> = Result<T, StateError>;

/// Errors raised while loading or writing the JSON snapshot.
///
/// The in-memory operations themselves cannot fail.
#[derive(Debug, Error)]
pub enum StateError {
    #[error("snapshot io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialize(String),

    #[error("deserialization error: {0}")]
    Deserialize(String),
}
