//! Sender workers for kvport
//!
//! A sender owns the path to the destination store. The migrator only hands
//! it fully encoded commands; delivery, connection health and any retrying
//! are the sender's business.
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

mod error;
pub mod memory;
pub mod tcp;

use async_trait::async_trait;
use bytes::Bytes;

pub use error::{SenderError, SenderResult};
pub use memory::MemorySender;
pub use tcp::TcpSender;

/// A worker that accepts encoded commands for delivery
#[async_trait]
pub trait Sender: Clone + Send + Sync + 'static {
    /// Queue an encoded command
    ///
    /// Returning `Ok` means the command was accepted, not that it was delivered.
    async fn enqueue(&self, command: Bytes) -> SenderResult<()>;

    /// Stop accepting commands and flush what is queued
    async fn close(&self) -> SenderResult<()> {
        Ok(())
    }
}
