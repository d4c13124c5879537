//! Routing commands to senders

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use bytes::Bytes;
use kvport_sender::Sender;
use kvport_source::display_key;
use tracing::{debug, warn};

use crate::command::WireCommand;
use crate::{MigrateError, MigrateResult};

/// A command on its way to a sender
#[derive(Clone, Debug)]
pub struct DispatchUnit {
    /// Command to hand over
    pub command: WireCommand,
    /// Key used to pick the sender; `None` (or empty) picks round-robin
    pub routing_key: Option<Bytes>,
}

/// Fixed pool of senders shared by every coordinator of a run
///
/// Commands with a routing key always land on the same sender for the same
/// key. Commands without one rotate through the pool; the rotation cursor is
/// shared by every caller.
#[derive(Debug)]
pub struct Dispatcher<S> {
    senders: Arc<[S]>,
    next: AtomicUsize,
}

impl<S: Sender> Dispatcher<S> {
    /// Build a dispatcher over a fixed set of senders
    ///
    /// # Errors
    ///
    /// Returns [`MigrateError::NoSenders`] if `senders` is empty.
    pub fn new(senders: Vec<S>) -> MigrateResult<Self> {
        if senders.is_empty() {
            return Err(MigrateError::NoSenders);
        }

        Ok(Self {
            senders: senders.into(),
            next: AtomicUsize::new(0),
        })
    }

    /// Number of senders
    pub fn len(&self) -> usize {
        self.senders.len()
    }

    /// Always false once constructed
    pub fn is_empty(&self) -> bool {
        self.senders.is_empty()
    }

    /// The senders, in index order
    pub fn senders(&self) -> &[S] {
        &self.senders
    }

    /// Sender index for a routing key, or the next round-robin index
    #[allow(clippy::cast_possible_truncation)]
    pub fn select(&self, routing_key: Option<&[u8]>) -> usize {
        let count = self.senders.len();
        match routing_key {
            Some(key) if !key.is_empty() => {
                let mut hasher = DefaultHasher::new();
                key.hash(&mut hasher);
                (hasher.finish() % count as u64) as usize
            }
            _ => self
                .next
                .fetch_update(Ordering::AcqRel, Ordering::Acquire, |i| {
                    Some((i + 1) % count)
                })
                .unwrap_or_else(|i| i),
        }
    }

    /// Hand a command to its sender
    ///
    /// Returns false when the sender refused it; the refusal is logged and the
    /// caller carries on.
    pub async fn dispatch(&self, unit: DispatchUnit) -> bool {
        let index = self.select(unit.routing_key.as_deref());
        let encoded = unit.command.encode();

        match self.senders[index].enqueue(encoded).await {
            Ok(()) => true,
            Err(e) => {
                warn!(
                    "Sender {} rejected {} for key {}: {}",
                    index,
                    unit.command.operation(),
                    display_key(unit.command.key()),
                    e
                );
                false
            }
        }
    }

    /// Close every sender, logging the ones that fail to close cleanly
    pub async fn close_all(&self) {
        for (index, sender) in self.senders.iter().enumerate() {
            match sender.close().await {
                Ok(()) => debug!("Sender {} closed", index),
                Err(e) => warn!("Sender {} did not close cleanly: {}", index, e),
            }
        }
    }
}
