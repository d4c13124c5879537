//! Run progress and per-type reports

use std::fmt::{self, Display};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use kvport_source::DataType;

/// Commands handed to senders, shared by every coordinator of a run
#[derive(Clone, Debug, Default)]
pub struct MigrationCounter(Arc<AtomicU64>);

impl MigrationCounter {
    /// Create a counter at zero
    pub fn new() -> Self {
        Self::default()
    }

    /// Count one dispatched command
    pub fn increment(&self) {
        self.0.fetch_add(1, Ordering::Relaxed);
    }

    /// Commands dispatched so far
    pub fn get(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

/// How a coordinator run ended
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Outcome {
    /// Every key of the type was visited
    Completed,
    /// Cancellation stopped the run early
    Cancelled,
}

impl Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Completed => "completed",
            Self::Cancelled => "cancelled",
        })
    }
}

/// What happened to one key
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum KeyOutcome {
    /// All of the key's commands were produced
    Migrated,
    /// The key had expired or disappeared before it could be read
    Expired,
    /// Reading the key failed; anything already dispatched stays dispatched
    Failed,
    /// Cancellation cut the key short
    Interrupted,
}

/// Tally of one coordinator run
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MigrationReport {
    /// Type the run migrated
    pub data_type: DataType,
    /// How the run ended
    pub outcome: Outcome,
    /// Keys whose commands were all produced
    pub keys_migrated: u64,
    /// Keys skipped because they expired or vanished
    pub keys_expired: u64,
    /// Keys that could not be read
    pub keys_failed: u64,
    /// Keys cut short by cancellation
    pub keys_interrupted: u64,
    /// Commands accepted by a sender
    pub commands_dispatched: u64,
}

impl MigrationReport {
    /// Empty report for a run that has not ended yet
    pub const fn new(data_type: DataType) -> Self {
        Self {
            data_type,
            outcome: Outcome::Completed,
            keys_migrated: 0,
            keys_expired: 0,
            keys_failed: 0,
            keys_interrupted: 0,
            commands_dispatched: 0,
        }
    }

    /// Tally one key; an interrupted key marks the run cancelled
    pub fn record(&mut self, outcome: KeyOutcome) {
        match outcome {
            KeyOutcome::Migrated => self.keys_migrated += 1,
            KeyOutcome::Expired => self.keys_expired += 1,
            KeyOutcome::Failed => self.keys_failed += 1,
            KeyOutcome::Interrupted => {
                self.keys_interrupted += 1;
                self.outcome = Outcome::Cancelled;
            }
        }
    }

    /// Keys looked at, whatever became of them
    pub const fn keys_seen(&self) -> u64 {
        self.keys_migrated + self.keys_expired + self.keys_failed + self.keys_interrupted
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counter_is_shared() {
        let counter = MigrationCounter::new();
        let clone = counter.clone();
        counter.increment();
        clone.increment();
        assert_eq!(counter.get(), 2);
    }

    #[test]
    fn test_interrupted_key_marks_run_cancelled() {
        let mut report = MigrationReport::new(DataType::Lists);
        report.record(KeyOutcome::Migrated);
        report.record(KeyOutcome::Expired);
        assert_eq!(report.outcome, Outcome::Completed);

        report.record(KeyOutcome::Interrupted);
        assert_eq!(report.outcome, Outcome::Cancelled);
        assert_eq!(report.keys_seen(), 3);
    }
}
