//! Error types for source engines

/// Result type for source engine operations
pub type SourceResult<T> = Result<T, SourceError>;

/// Errors that can occur while reading from a source engine
#[derive(Debug, thiserror::Error)]
pub enum SourceError {
    /// Storage backend error
    #[error("Source backend error: {0}")]
    Backend(String),

    /// Engine clock could not be read
    #[error("Engine clock unavailable: {0}")]
    Clock(String),

    /// Stored bytes could not be decoded
    #[error("Corrupted record: {0}")]
    Corruption(String),

    /// Scan pattern could not be compiled
    #[error("Invalid scan pattern: {0}")]
    InvalidPattern(String),

    /// Key does not exist or has already expired
    #[error("Key not found: {0}")]
    KeyNotFound(String),
}
