//! Error types for migration runs

use kvport_source::{DataType, SourceError, UnknownDataType};
use thiserror::Error;

/// Result type for migration runs
pub type MigrateResult<T> = Result<T, MigrateError>;

/// Conditions that stop a migration run
///
/// Anything recoverable (one key failing to read, a sender refusing a
/// command) is logged and tallied in the run report instead.
#[derive(Debug, Error)]
pub enum MigrateError {
    /// Engine clock could not be read before migrating strings
    #[error("engine time unavailable: {0}")]
    Clock(#[source] SourceError),

    /// Configuration rejected by validation
    #[error("invalid configuration: {0}")]
    Config(String),

    /// Dispatcher built without any sender
    #[error("no senders configured")]
    NoSenders,

    /// Cursor could not advance past one position
    #[error("scan of {data_type} failed {attempts} times at key {position:?}: {source}")]
    Scan {
        /// Type being walked
        data_type: DataType,
        /// Start key of the failing page
        position: String,
        /// Attempts made at that position
        attempts: u32,
        /// Last scan error
        #[source]
        source: SourceError,
    },

    /// String snapshot could not be opened or broke while being read
    #[error("string snapshot failed: {0}")]
    Snapshot(#[source] SourceError),

    /// A coordinator task panicked or was aborted
    #[error("migration task failed: {0}")]
    Task(String),

    /// Requested data type is not one of the five known types
    #[error(transparent)]
    UnknownType(#[from] UnknownDataType),
}
