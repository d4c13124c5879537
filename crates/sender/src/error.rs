//! Error types for senders

use thiserror::Error;

/// Result type for sender operations
pub type SenderResult<T> = Result<T, SenderError>;

/// Errors that can occur while handing commands to a sender
#[derive(Debug, Error)]
pub enum SenderError {
    /// The sender has been closed or its worker has stopped
    #[error("sender closed")]
    Closed,

    /// Could not connect to the destination
    #[error("failed to connect to {addr}: {source}")]
    Connect {
        /// Address that was dialled
        addr: String,
        /// Underlying connect error
        #[source]
        source: std::io::Error,
    },

    /// IO error while writing to the destination
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
