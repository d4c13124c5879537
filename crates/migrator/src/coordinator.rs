//! Per-type migration procedures
//!
//! A [`Coordinator`] migrates every key of one data type. Keys are processed
//! one at a time: read, batch, dispatch, then the trailing `EXPIRE` if the key
//! has one. Cancellation is observed before each key, before each chunk and
//! before each element, never inside an engine call.

use std::sync::Arc;

use bytes::Bytes;
use kvport_sender::Sender;
use kvport_source::{
    DataType, MATCH_ALL, RawStringRecord, ScoreMember, SourceEngine, SourceError, SourceResult,
    display_key,
};
use tokio_stream::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::batch::Batches;
use crate::command::{CommandElement, Operation, WireCommand};
use crate::config::{Consistency, MigrationConfig};
use crate::cursor::KeyCursor;
use crate::dispatch::{DispatchUnit, Dispatcher};
use crate::progress::{KeyOutcome, MigrationCounter, MigrationReport, Outcome};
use crate::ttl::{StringExpiry, collection_expiry, string_expiry};
use crate::{MigrateError, MigrateResult};

/// Drives the migration of one data type to completion
pub struct Coordinator<E, S> {
    engine: E,
    dispatcher: Arc<Dispatcher<S>>,
    config: MigrationConfig,
    data_type: DataType,
    counter: MigrationCounter,
    cancel: CancellationToken,
}

impl<E: SourceEngine, S: Sender> Coordinator<E, S> {
    /// Create a coordinator for `data_type`
    ///
    /// Every command it dispatches bumps `counter`; `cancel` stops the run at
    /// the next key, chunk or element boundary.
    pub const fn new(
        engine: E,
        dispatcher: Arc<Dispatcher<S>>,
        config: MigrationConfig,
        data_type: DataType,
        counter: MigrationCounter,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            engine,
            dispatcher,
            config,
            data_type,
            counter,
            cancel,
        }
    }

    /// Migrate every key of the type
    ///
    /// Returns the report for a completed or cancelled run, or the error that
    /// stopped it.
    pub async fn run(self) -> MigrateResult<MigrationReport> {
        let mut report = MigrationReport::new(self.data_type);
        let consistency = self.config.consistency(self.data_type);

        info!(
            "Migrating {} ({} view, batch unit {}, routing {})",
            self.data_type, consistency, self.config.sync_batch_num, self.config.routing
        );

        let result = match self.config.validate() {
            Ok(()) => match (self.data_type, consistency) {
                (DataType::Strings, Consistency::Snapshot) => {
                    self.migrate_string_snapshot(&mut report).await
                }
                _ => self.migrate_by_cursor(&mut report).await,
            },
            Err(e) => Err(e),
        };

        if let Err(e) = result {
            error!(
                "Migration of {} aborted after {} keys: {}",
                self.data_type,
                report.keys_seen(),
                e
            );
            return Err(e);
        }

        match report.outcome {
            Outcome::Completed => info!(
                "All {} keys dispatched: {} migrated, {} expired, {} failed, {} commands",
                self.data_type,
                report.keys_migrated,
                report.keys_expired,
                report.keys_failed,
                report.commands_dispatched
            ),
            Outcome::Cancelled => warn!(
                "Migration of {} cancelled: {} migrated, {} interrupted, {} commands",
                self.data_type,
                report.keys_migrated,
                report.keys_interrupted,
                report.commands_dispatched
            ),
        }

        Ok(report)
    }

    fn cancelled(&self, report: &mut MigrationReport) -> bool {
        if self.cancel.is_cancelled() {
            report.outcome = Outcome::Cancelled;
            return true;
        }
        false
    }

    async fn engine_time(&self) -> MigrateResult<u64> {
        self.engine.now().await.map_err(MigrateError::Clock)
    }

    async fn migrate_string_snapshot(&self, report: &mut MigrationReport) -> MigrateResult<()> {
        let now = self.engine_time().await?;
        let mut records = self
            .engine
            .snapshot_strings()
            .await
            .map_err(MigrateError::Snapshot)?;

        loop {
            if self.cancelled(report) {
                return Ok(());
            }

            let Some(record) = records.next().await else {
                return Ok(());
            };

            let outcome = match record {
                Ok(record) => self.migrate_string(report, record, now).await,
                Err(e @ SourceError::Corruption(_)) => {
                    warn!("Skipping unreadable string record: {}", e);
                    KeyOutcome::Failed
                }
                Err(e) => return Err(MigrateError::Snapshot(e)),
            };
            report.record(outcome);
        }
    }

    async fn migrate_by_cursor(&self, report: &mut MigrationReport) -> MigrateResult<()> {
        // Only strings compare against the engine clock
        let now = match self.data_type {
            DataType::Strings => self.engine_time().await?,
            _ => 0,
        };

        let mut cursor = KeyCursor::new(
            &self.engine,
            self.data_type,
            MATCH_ALL,
            self.config.scan_page_size(),
            self.config.max_scan_retries,
        );

        loop {
            if self.cancelled(report) {
                return Ok(());
            }

            let Some(keys) = cursor.next_page().await? else {
                return Ok(());
            };

            for key in keys {
                if self.cancelled(report) {
                    return Ok(());
                }

                let outcome = match self.data_type {
                    DataType::Strings => self.migrate_live_string(report, &key, now).await,
                    DataType::Lists => self.migrate_list(report, &key).await,
                    DataType::Hashes => {
                        let fields = self.engine.hgetall(&key).await;
                        self.migrate_collection(report, &key, fields).await
                    }
                    DataType::Sets => {
                        let members = self.engine.smembers(&key).await;
                        self.migrate_collection(report, &key, members).await
                    }
                    DataType::ZSets => match self.engine.zrange_all(&key).await {
                        Ok(members) => self.migrate_sorted_set(report, &key, members).await,
                        Err(e) => {
                            self.migrate_collection::<ScoreMember>(report, &key, Err(e))
                                .await
                        }
                    },
                };
                report.record(outcome);
            }
        }
    }

    async fn dispatch(
        &self,
        report: &mut MigrationReport,
        command: WireCommand,
        key: &Bytes,
        data: bool,
    ) {
        let routing_key = self
            .config
            .routing
            .routes_by_key(self.data_type, data)
            .then(|| key.clone());

        if self
            .dispatcher
            .dispatch(DispatchUnit {
                command,
                routing_key,
            })
            .await
        {
            self.counter.increment();
            report.commands_dispatched += 1;
        }
    }

    async fn migrate_string(
        &self,
        report: &mut MigrationReport,
        record: RawStringRecord,
        now: u64,
    ) -> KeyOutcome {
        let expire_secs = match string_expiry(record.expire_at, now) {
            StringExpiry::Persistent => None,
            StringExpiry::Expires(secs) => Some(secs),
            StringExpiry::Expired => {
                debug!("Skipping expired string {}", display_key(&record.key));
                return KeyOutcome::Expired;
            }
        };

        let key = record.key.clone();
        let command = WireCommand::set(record.key, record.value, expire_secs);
        self.dispatch(report, command, &key, true).await;
        KeyOutcome::Migrated
    }

    async fn migrate_live_string(
        &self,
        report: &mut MigrationReport,
        key: &Bytes,
        now: u64,
    ) -> KeyOutcome {
        match self.engine.get_string(key).await {
            Ok(Some(record)) => self.migrate_string(report, record, now).await,
            Ok(None) => {
                debug!("String {} vanished before it was read", display_key(key));
                KeyOutcome::Expired
            }
            Err(e) => {
                warn!("Failed to read string {}: {}", display_key(key), e);
                KeyOutcome::Failed
            }
        }
    }

    /// Lists are read window by window, each window one batch unit long
    async fn migrate_list(&self, report: &mut MigrationReport, key: &Bytes) -> KeyOutcome {
        let unit = self.config.sync_batch_num;
        let mut position = 0usize;

        loop {
            if self.cancel.is_cancelled() {
                return KeyOutcome::Interrupted;
            }

            let start = i64::try_from(position).unwrap_or(i64::MAX);
            let stop = i64::try_from(position.saturating_add(unit - 1)).unwrap_or(i64::MAX);
            let window = match self.engine.lrange(key, start, stop).await {
                Ok(window) => window,
                Err(e) => {
                    warn!(
                        "Failed to read list {} at {}..={}: {}",
                        display_key(key),
                        start,
                        stop,
                        e
                    );
                    return KeyOutcome::Failed;
                }
            };

            if window.is_empty() {
                break;
            }

            let mut batches = Batches::new(Operation::RPush, key, &window, unit, &self.cancel);
            for command in batches.by_ref() {
                self.dispatch(report, command, key, true).await;
            }
            if batches.interrupted() {
                return KeyOutcome::Interrupted;
            }

            position = position.saturating_add(unit);
        }

        if position == 0 {
            debug!("List {} vanished before it was read", display_key(key));
            return KeyOutcome::Expired;
        }

        self.expire(report, key).await;
        KeyOutcome::Migrated
    }

    /// Hashes, sets and sorted sets are read whole
    async fn migrate_collection<T: CommandElement>(
        &self,
        report: &mut MigrationReport,
        key: &Bytes,
        fetched: SourceResult<Vec<T>>,
    ) -> KeyOutcome {
        let Some(operation) = Operation::for_collection(self.data_type) else {
            return KeyOutcome::Failed;
        };

        let elements = match fetched {
            Ok(elements) => elements,
            Err(e) => {
                warn!(
                    "Failed to read {} key {}: {}",
                    self.data_type,
                    display_key(key),
                    e
                );
                return KeyOutcome::Failed;
            }
        };

        if elements.is_empty() {
            debug!(
                "{} key {} vanished before it was read",
                self.data_type,
                display_key(key)
            );
            return KeyOutcome::Expired;
        }

        let unit = self.config.sync_batch_num;
        let mut batches = Batches::new(operation, key, &elements, unit, &self.cancel);
        for command in batches.by_ref() {
            self.dispatch(report, command, key, true).await;
        }
        if batches.interrupted() {
            return KeyOutcome::Interrupted;
        }

        self.expire(report, key).await;
        KeyOutcome::Migrated
    }

    /// Members with a NaN score are dropped; a set left with none of its
    /// members fails instead of passing for vanished
    async fn migrate_sorted_set(
        &self,
        report: &mut MigrationReport,
        key: &Bytes,
        members: Vec<ScoreMember>,
    ) -> KeyOutcome {
        let total = members.len();
        let members: Vec<_> = members
            .into_iter()
            .filter(|member| {
                if member.score.is_nan() {
                    warn!(
                        "Dropping member {} of zset {} with a NaN score",
                        display_key(&member.member),
                        display_key(key)
                    );
                }
                !member.score.is_nan()
            })
            .collect();

        if total > 0 && members.is_empty() {
            return KeyOutcome::Failed;
        }
        self.migrate_collection(report, key, Ok(members)).await
    }

    async fn expire(&self, report: &mut MigrationReport, key: &Bytes) {
        let ttl = self.engine.ttl(self.data_type, key).await;
        if let Err(e) = &ttl {
            debug!(
                "TTL lookup for {} key {} failed, migrating without expiry: {}",
                self.data_type,
                display_key(key),
                e
            );
        }

        if let Some(secs) = collection_expiry(&ttl) {
            self.dispatch(report, WireCommand::expire(key.clone(), secs), key, false)
                .await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use kvport_sender::MemorySender;
    use kvport_source_memory::MemorySource;
    use tracing_test::traced_test;

    fn coordinator(
        source: &MemorySource,
        sender: &MemorySender,
        data_type: DataType,
        cancel: &CancellationToken,
    ) -> Coordinator<MemorySource, MemorySender> {
        let dispatcher = Arc::new(Dispatcher::new(vec![sender.clone()]).unwrap());
        Coordinator::new(
            source.clone(),
            dispatcher,
            MigrationConfig::default(),
            data_type,
            MigrationCounter::new(),
            cancel.clone(),
        )
    }

    #[tokio::test]
    #[traced_test]
    async fn test_completed_run_logs_completion() {
        let source = MemorySource::new();
        source.set("k", "v").await;
        let sender = MemorySender::new();

        let report = coordinator(&source, &sender, DataType::Strings, &CancellationToken::new())
            .run()
            .await
            .unwrap();

        assert_eq!(report.outcome, Outcome::Completed);
        assert!(logs_contain("All strings keys dispatched"));
        assert!(!logs_contain("cancelled"));
    }

    #[tokio::test]
    #[traced_test]
    async fn test_cancelled_run_logs_cancellation() {
        let source = MemorySource::new();
        source.sadd("s", ["m"]).await;
        let sender = MemorySender::new();
        let cancel = CancellationToken::new();
        cancel.cancel();

        let report = coordinator(&source, &sender, DataType::Sets, &cancel)
            .run()
            .await
            .unwrap();

        assert_eq!(report.outcome, Outcome::Cancelled);
        assert!(sender.is_empty());
        assert!(logs_contain("Migration of sets cancelled"));
        assert!(!logs_contain("All sets keys dispatched"));
    }

    #[tokio::test]
    #[traced_test]
    async fn test_fatal_run_logs_abort() {
        let source = MemorySource::new();
        source.set("k", "v").await;
        source.fail_clock(true);
        let sender = MemorySender::new();

        let result = coordinator(&source, &sender, DataType::Strings, &CancellationToken::new())
            .run()
            .await;

        assert!(matches!(result, Err(MigrateError::Clock(_))));
        assert!(logs_contain("Migration of strings aborted"));
        assert!(sender.is_empty());
    }

    #[tokio::test]
    async fn test_rejected_commands_are_not_counted() {
        let source = MemorySource::new();
        source.set("a", "1").await;
        source.set("b", "2").await;
        let sender = MemorySender::new();
        sender.close().await.unwrap();

        let report = coordinator(&source, &sender, DataType::Strings, &CancellationToken::new())
            .run()
            .await
            .unwrap();

        assert_eq!(report.keys_migrated, 2);
        assert_eq!(report.commands_dispatched, 0);
    }

    #[tokio::test]
    #[traced_test]
    async fn test_nan_scores_are_dropped() {
        let source = MemorySource::new();
        source.zadd("z", 1.0, "one").await;
        source.zadd("z", f64::NAN, "bad").await;
        source.zadd("all-bad", f64::NAN, "x").await;
        let sender = MemorySender::new();

        let report = coordinator(&source, &sender, DataType::ZSets, &CancellationToken::new())
            .run()
            .await
            .unwrap();

        assert_eq!(
            sender.commands(),
            vec![Bytes::from_static(
                b"*4\r\n$4\r\nZADD\r\n$1\r\nz\r\n$1\r\n1\r\n$3\r\none\r\n"
            )]
        );
        assert_eq!(report.keys_migrated, 1);
        assert_eq!(report.keys_failed, 1);
        assert!(logs_contain("Dropping member bad of zset z with a NaN score"));
    }

    #[tokio::test]
    async fn test_vanished_collection_is_skipped() {
        let source = MemorySource::new();
        source.rpush("gone", ["x"]).await;
        source.del(DataType::Lists, b"gone").await;
        let sender = MemorySender::new();
        let coordinator = coordinator(&source, &sender, DataType::Lists, &CancellationToken::new());

        let mut report = MigrationReport::new(DataType::Lists);
        let outcome = coordinator
            .migrate_list(&mut report, &Bytes::from("gone"))
            .await;

        assert_eq!(outcome, KeyOutcome::Expired);
        assert!(sender.is_empty());
    }
}
