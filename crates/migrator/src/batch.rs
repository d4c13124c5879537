//! Chunking collection elements into bounded commands

use std::slice;

use bytes::Bytes;
use tokio_util::sync::CancellationToken;

use crate::command::{CommandElement, Operation, WireCommand};

/// Lazily splits one key's elements into commands of at most `unit` elements
///
/// Cancellation is checked before every chunk and before every element. A
/// chunk cut short by cancellation is still yielded with what it holds; a
/// chunk that would hold nothing is never yielded.
pub struct Batches<'a, E> {
    operation: Operation,
    key: &'a Bytes,
    elements: slice::Iter<'a, E>,
    unit: usize,
    cancel: &'a CancellationToken,
    interrupted: bool,
}

impl<'a, E: CommandElement> Batches<'a, E> {
    /// Chunk `elements` of `key` into `operation` commands; a `unit` of 0 is read as 1
    pub fn new(
        operation: Operation,
        key: &'a Bytes,
        elements: &'a [E],
        unit: usize,
        cancel: &'a CancellationToken,
    ) -> Self {
        Self {
            operation,
            key,
            elements: elements.iter(),
            unit: unit.max(1),
            cancel,
            interrupted: false,
        }
    }

    /// True once cancellation stopped the batcher with elements left over
    pub const fn interrupted(&self) -> bool {
        self.interrupted
    }

    fn check_cancelled(&mut self) -> bool {
        if self.elements.len() > 0 && self.cancel.is_cancelled() {
            self.interrupted = true;
        }
        self.interrupted
    }
}

impl<E: CommandElement> Iterator for Batches<'_, E> {
    type Item = WireCommand;

    fn next(&mut self) -> Option<Self::Item> {
        if self.elements.len() == 0 || self.check_cancelled() {
            return None;
        }

        let mut command = WireCommand::new(self.operation, self.key.clone());
        let mut taken = 0;
        while taken < self.unit && self.elements.len() > 0 {
            if self.check_cancelled() {
                break;
            }
            if let Some(element) = self.elements.next() {
                element.push_args(&mut command);
                taken += 1;
            }
        }

        (taken > 0).then_some(command)
    }
}
