//! Sender that keeps every command in memory

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;

use crate::{Sender, SenderError, SenderResult};

/// Records commands in arrival order
#[derive(Clone, Debug, Default)]
pub struct MemorySender {
    commands: Arc<Mutex<Vec<Bytes>>>,
    closed: Arc<AtomicBool>,
}

impl MemorySender {
    /// Create an open sender with no commands
    pub fn new() -> Self {
        Self::default()
    }

    /// Every command accepted so far
    pub fn commands(&self) -> Vec<Bytes> {
        self.commands.lock().clone()
    }

    /// Number of commands accepted
    pub fn len(&self) -> usize {
        self.commands.lock().len()
    }

    /// Whether no command has been accepted
    pub fn is_empty(&self) -> bool {
        self.commands.lock().is_empty()
    }

    /// Whether [`Sender::close`] has been called
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Sender for MemorySender {
    async fn enqueue(&self, command: Bytes) -> SenderResult<()> {
        if self.is_closed() {
            return Err(SenderError::Closed);
        }
        self.commands.lock().push(command);
        Ok(())
    }

    async fn close(&self) -> SenderResult<()> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}
