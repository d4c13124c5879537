use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use kvport_migrator::{
    Consistency, Dispatcher, MigrateError, MigrationConfig, MigrationCounter, MigrationReport,
    Outcome, RoutingPolicy, migrate_all, parse_types,
};
use kvport_sender::{MemorySender, Sender, SenderResult};
use kvport_source::DataType;
use kvport_source_memory::MemorySource;
use tokio_util::sync::CancellationToken;

const NOW: u64 = 1_700_000_000;

/// Decode RESP arrays of bulk strings back into space-joined commands
fn decode(encoded: &Bytes) -> String {
    fn line(input: &[u8]) -> (&[u8], &[u8]) {
        let end = input.windows(2).position(|w| w == b"\r\n").unwrap();
        (&input[..end], &input[end + 2..])
    }

    let (header, mut rest) = line(encoded);
    assert_eq!(header[0], b'*');
    let count: usize = std::str::from_utf8(&header[1..]).unwrap().parse().unwrap();

    let mut parts = Vec::with_capacity(count);
    for _ in 0..count {
        let (len_line, tail) = line(rest);
        assert_eq!(len_line[0], b'$');
        let len: usize = std::str::from_utf8(&len_line[1..]).unwrap().parse().unwrap();
        parts.push(String::from_utf8_lossy(&tail[..len]).into_owned());
        assert_eq!(&tail[len..len + 2], b"\r\n");
        rest = &tail[len + 2..];
    }
    assert!(rest.is_empty());
    parts.join(" ")
}

fn decoded(sender: &MemorySender) -> Vec<String> {
    sender.commands().iter().map(decode).collect()
}

fn config(unit: usize) -> MigrationConfig {
    MigrationConfig {
        sync_batch_num: unit,
        ..MigrationConfig::default()
    }
}

async fn migrate_one<S: Sender>(
    source: &MemorySource,
    senders: Vec<S>,
    config: MigrationConfig,
    data_type: DataType,
    cancel: CancellationToken,
) -> Result<MigrationReport, MigrateError> {
    let dispatcher = Arc::new(Dispatcher::new(senders).unwrap());
    let mut results = migrate_all(
        source.clone(),
        dispatcher,
        config,
        &[data_type],
        MigrationCounter::new(),
        cancel,
    )
    .await
    .unwrap();
    assert_eq!(results.len(), 1);
    let (migrated, result) = results.remove(0);
    assert_eq!(migrated, data_type);
    result
}

fn fixed_clock() -> MemorySource {
    let source = MemorySource::new();
    source.set_time(NOW);
    source
}

#[tokio::test]
async fn test_strings_expiry_rules() {
    let source = fixed_clock();
    source.set("plain", "v").await;
    source.set_with_expire_at("later", "v", NOW + 90).await;
    source.set_with_expire_at("now", "v", NOW).await;
    source.set_with_expire_at("past", "v", NOW - 10).await;

    for consistency in [Consistency::Snapshot, Consistency::Live] {
        let sender = MemorySender::new();
        let config = MigrationConfig {
            string_consistency: consistency,
            ..config(10)
        };
        let report = migrate_one(
            &source,
            vec![sender.clone()],
            config,
            DataType::Strings,
            CancellationToken::new(),
        )
        .await
        .unwrap();

        assert_eq!(decoded(&sender), vec!["SET later v EX 90", "SET plain v"]);
        assert_eq!(report.outcome, Outcome::Completed);
        assert_eq!(report.commands_dispatched, 2);

        // Live scans never surface keys the engine already treats as expired
        match consistency {
            Consistency::Snapshot => assert_eq!(report.keys_expired, 2),
            Consistency::Live => assert_eq!(report.keys_expired, 0),
        }
    }
}

#[tokio::test]
async fn test_list_chunk_boundaries() {
    let source = fixed_clock();
    source.rpush("mylist", ["a", "b", "c", "d", "e", "f", "g"]).await;

    let sender = MemorySender::new();
    let report = migrate_one(
        &source,
        vec![sender.clone()],
        config(3),
        DataType::Lists,
        CancellationToken::new(),
    )
    .await
    .unwrap();

    assert_eq!(
        decoded(&sender),
        vec![
            "RPUSH mylist a b c",
            "RPUSH mylist d e f",
            "RPUSH mylist g",
        ]
    );
    assert_eq!(report.keys_migrated, 1);
    assert_eq!(report.commands_dispatched, 3);
}

#[tokio::test]
async fn test_collection_commands_rebuild_every_element_once() {
    let source = fixed_clock();
    for i in 0..11 {
        source.hset("h", format!("f{i}"), format!("v{i}")).await;
        source.sadd("s", [format!("m{i:02}")]).await;
        source.zadd("z", f64::from(i) / 2.0, format!("z{i}")).await;
    }

    for (data_type, operation) in [
        (DataType::Hashes, "HMSET"),
        (DataType::Sets, "SADD"),
        (DataType::ZSets, "ZADD"),
    ] {
        let sender = MemorySender::new();
        migrate_one(
            &source,
            vec![sender.clone()],
            config(4),
            data_type,
            CancellationToken::new(),
        )
        .await
        .unwrap();

        let commands = decoded(&sender);
        assert_eq!(commands.len(), 3, "{data_type}");

        let mut elements = Vec::new();
        for command in &commands {
            let words: Vec<&str> = command.split(' ').collect();
            assert_eq!(words[0], operation);
            let args = &words[2..];
            match data_type {
                DataType::Sets => {
                    assert!(args.len() <= 4);
                    elements.extend(args.iter().map(|a| a.to_string()));
                }
                _ => {
                    assert!(args.len() <= 8);
                    elements.extend(args.chunks(2).map(|p| p.join("=")));
                }
            }
        }

        let expected: Vec<String> = match data_type {
            DataType::Hashes => (0..11).map(|i| format!("f{i}=v{i}")).collect(),
            DataType::Sets => (0..11).map(|i| format!("m{i:02}")).collect(),
            _ => (0..11)
                .map(|i| format!("{}=z{i}", f64::from(i) / 2.0))
                .collect(),
        };
        assert_eq!(elements, expected, "{data_type}");
    }
}

#[tokio::test]
async fn test_collection_expire_follows_data() {
    let source = fixed_clock();
    source.hset("expiring", "f", "v").await;
    source.expire_at(DataType::Hashes, b"expiring", NOW + 300).await;
    source.hset("forever", "f", "v").await;
    source.hset("broken-ttl", "f", "v").await;
    source.expire_at(DataType::Hashes, b"broken-ttl", NOW + 300).await;
    source.fail_ttl("broken-ttl");

    let sender = MemorySender::new();
    let report = migrate_one(
        &source,
        vec![sender.clone()],
        config(10),
        DataType::Hashes,
        CancellationToken::new(),
    )
    .await
    .unwrap();

    assert_eq!(
        decoded(&sender),
        vec![
            "HMSET broken-ttl f v",
            "HMSET expiring f v",
            "EXPIRE expiring 300",
            "HMSET forever f v",
        ]
    );
    assert_eq!(report.keys_migrated, 3);
}

#[tokio::test]
async fn test_read_failures_are_per_key() {
    let source = fixed_clock();
    source.sadd("a", ["1"]).await;
    source.sadd("b", ["1"]).await;
    source.sadd("c", ["1"]).await;
    source.fail_reads("b");

    let sender = MemorySender::new();
    let report = migrate_one(
        &source,
        vec![sender.clone()],
        config(10),
        DataType::Sets,
        CancellationToken::new(),
    )
    .await
    .unwrap();

    assert_eq!(decoded(&sender), vec!["SADD a 1", "SADD c 1"]);
    assert_eq!(report.keys_failed, 1);
    assert_eq!(report.keys_migrated, 2);
    assert_eq!(report.outcome, Outcome::Completed);
}

#[tokio::test]
async fn test_corrupted_snapshot_record_skips_one_key() {
    let source = fixed_clock();
    source.set("a", "1").await;
    source.set("b", "2").await;
    source.set("c", "3").await;
    source.fail_reads("b");

    let sender = MemorySender::new();
    let report = migrate_one(
        &source,
        vec![sender.clone()],
        config(10),
        DataType::Strings,
        CancellationToken::new(),
    )
    .await
    .unwrap();

    assert_eq!(decoded(&sender), vec!["SET a 1", "SET c 3"]);
    assert_eq!(report.keys_failed, 1);
    assert_eq!(report.keys_migrated, 2);
    assert_eq!(report.outcome, Outcome::Completed);
}

#[tokio::test]
async fn test_broken_snapshot_aborts_strings() {
    let source = fixed_clock();
    for key in ["a", "b", "c"] {
        source.set(key, "v").await;
    }
    source.fail_snapshot_after(1);

    let sender = MemorySender::new();
    let result = migrate_one(
        &source,
        vec![sender.clone()],
        config(10),
        DataType::Strings,
        CancellationToken::new(),
    )
    .await;

    assert!(matches!(result, Err(MigrateError::Snapshot(_))));
    assert_eq!(decoded(&sender), vec!["SET a v"]);
}

#[tokio::test]
async fn test_failed_list_window_keeps_earlier_windows() {
    let source = fixed_clock();
    source.rpush("q", ["1", "2", "3", "4", "5"]).await;
    source.expire_at(DataType::Lists, b"q", NOW + 60).await;
    source.fail_reads_after("q", 1);

    let sender = MemorySender::new();
    let report = migrate_one(
        &source,
        vec![sender.clone()],
        config(2),
        DataType::Lists,
        CancellationToken::new(),
    )
    .await
    .unwrap();

    assert_eq!(decoded(&sender), vec!["RPUSH q 1 2"]);
    assert_eq!(report.keys_failed, 1);
}

#[tokio::test]
async fn test_clock_failure_aborts_strings_only() {
    let source = fixed_clock();
    source.set("k", "v").await;
    source.sadd("s", ["m"]).await;
    source.fail_clock(true);

    let sender = MemorySender::new();
    let dispatcher = Arc::new(Dispatcher::new(vec![sender.clone()]).unwrap());
    let results = migrate_all(
        source.clone(),
        dispatcher,
        config(10),
        &[DataType::Strings, DataType::Sets],
        MigrationCounter::new(),
        CancellationToken::new(),
    )
    .await
    .unwrap();

    assert_eq!(results[0].0, DataType::Strings);
    assert!(matches!(results[0].1, Err(MigrateError::Clock(_))));
    assert_eq!(results[1].0, DataType::Sets);
    assert_eq!(results[1].1.as_ref().unwrap().keys_migrated, 1);
    assert_eq!(decoded(&sender), vec!["SADD s m"]);
}

#[tokio::test]
async fn test_scan_failures_are_retried() {
    let source = fixed_clock();
    for i in 0..30 {
        source.zadd(format!("z{i:02}"), 1.0, "m").await;
    }
    source.fail_scans(DataType::ZSets, 2);

    let sender = MemorySender::new();
    let report = migrate_one(
        &source,
        vec![sender.clone()],
        config(1),
        DataType::ZSets,
        CancellationToken::new(),
    )
    .await
    .unwrap();
    assert_eq!(report.keys_migrated, 30);
    assert_eq!(sender.len(), 30);

    source.fail_scans(DataType::ZSets, 100);
    let result = migrate_one(
        &source,
        vec![MemorySender::new()],
        config(1),
        DataType::ZSets,
        CancellationToken::new(),
    )
    .await;
    assert!(matches!(result, Err(MigrateError::Scan { .. })));
}

#[tokio::test]
async fn test_every_key_migrated_once_across_pages() {
    let source = fixed_clock();
    for i in 0..250 {
        source.rpush(format!("list:{i:03}"), ["x"]).await;
    }

    // Unit 2 gives scan pages of 20 keys
    let sender = MemorySender::new();
    let report = migrate_one(
        &source,
        vec![sender.clone()],
        config(2),
        DataType::Lists,
        CancellationToken::new(),
    )
    .await
    .unwrap();

    let expected: Vec<String> = (0..250).map(|i| format!("RPUSH list:{i:03} x")).collect();
    assert_eq!(decoded(&sender), expected);
    assert_eq!(report.keys_migrated, 250);
}

async fn routed(routing: RoutingPolicy) -> Vec<Vec<String>> {
    let source = fixed_clock();
    for i in 0..8 {
        let key = format!("k{i}");
        source.sadd(key.clone(), ["a", "b", "c"]).await;
        source
            .expire_at(DataType::Sets, key.as_bytes(), NOW + 30)
            .await;
    }

    let senders: Vec<_> = (0..3).map(|_| MemorySender::new()).collect();
    let config = MigrationConfig {
        routing,
        ..config(1)
    };
    migrate_one(
        &source,
        senders.clone(),
        config,
        DataType::Sets,
        CancellationToken::new(),
    )
    .await
    .unwrap();

    senders.iter().map(decoded).collect()
}

#[tokio::test]
async fn test_by_key_routing_keeps_a_key_on_one_sender() {
    let per_sender = routed(RoutingPolicy::ByKey).await;

    for i in 0..8 {
        let key = format!("k{i}");
        let holders: Vec<_> = per_sender
            .iter()
            .filter(|cmds| cmds.iter().any(|c| c.split(' ').nth(1) == Some(key.as_str())))
            .collect();
        assert_eq!(holders.len(), 1, "{key} spread over senders");

        let own: Vec<_> = holders[0]
            .iter()
            .filter(|c| c.split(' ').nth(1) == Some(key.as_str()))
            .cloned()
            .collect();
        assert_eq!(
            own,
            vec![
                format!("SADD {key} a"),
                format!("SADD {key} b"),
                format!("SADD {key} c"),
                format!("EXPIRE {key} 30"),
            ]
        );
    }
}

#[tokio::test]
async fn test_round_robin_routing_spreads_evenly() {
    let per_sender = routed(RoutingPolicy::RoundRobin).await;
    let counts: Vec<_> = per_sender.iter().map(Vec::len).collect();

    // 8 keys * 4 commands handed out in strict rotation
    assert_eq!(counts, vec![11, 11, 10]);
}

/// Sender that trips the cancellation token once it holds `limit` commands
#[derive(Clone)]
struct CancellingSender {
    inner: MemorySender,
    limit: usize,
    cancel: CancellationToken,
}

#[async_trait]
impl Sender for CancellingSender {
    async fn enqueue(&self, command: Bytes) -> SenderResult<()> {
        self.inner.enqueue(command).await?;
        if self.inner.len() >= self.limit {
            self.cancel.cancel();
        }
        Ok(())
    }
}

#[tokio::test]
async fn test_cancellation_after_five_of_hundred_keys() {
    let source = fixed_clock();
    for i in 0..100 {
        source.set(format!("key:{i:03}"), "v").await;
    }

    let cancel = CancellationToken::new();
    let inner = MemorySender::new();
    let sender = CancellingSender {
        inner: inner.clone(),
        limit: 5,
        cancel: cancel.clone(),
    };

    let report = migrate_one(&source, vec![sender], config(10), DataType::Strings, cancel)
        .await
        .unwrap();

    assert_eq!(report.outcome, Outcome::Cancelled);
    assert_eq!(report.keys_migrated, 5);
    assert_eq!(report.commands_dispatched, 5);
    assert_eq!(report.keys_interrupted, 0);
    assert_eq!(
        decoded(&inner),
        (0..5).map(|i| format!("SET key:{i:03} v")).collect::<Vec<_>>()
    );
}

#[tokio::test]
async fn test_cancellation_mid_key_skips_expire() {
    let source = fixed_clock();
    for i in 0..10 {
        source.hset("big", format!("f{i}"), "v").await;
    }
    source.expire_at(DataType::Hashes, b"big", NOW + 60).await;
    source.hset("next", "f", "v").await;

    let cancel = CancellationToken::new();
    let inner = MemorySender::new();
    let sender = CancellingSender {
        inner: inner.clone(),
        limit: 2,
        cancel: cancel.clone(),
    };

    let report = migrate_one(&source, vec![sender], config(3), DataType::Hashes, cancel)
        .await
        .unwrap();

    assert_eq!(
        decoded(&inner),
        vec!["HMSET big f0 v f1 v f2 v", "HMSET big f3 v f4 v f5 v"]
    );
    assert_eq!(report.outcome, Outcome::Cancelled);
    assert_eq!(report.keys_interrupted, 1);
    assert_eq!(report.keys_migrated, 0);
}

#[tokio::test]
async fn test_counter_is_shared_across_types() {
    let source = fixed_clock();
    source.set("s", "v").await;
    source.rpush("l", ["1", "2", "3"]).await;
    source.hset("h", "f", "v").await;
    source.sadd("st", ["m"]).await;
    source.zadd("z", 1.0, "m").await;

    let senders: Vec<_> = (0..4).map(|_| MemorySender::new()).collect();
    let dispatcher = Arc::new(Dispatcher::new(senders.clone()).unwrap());
    let counter = MigrationCounter::new();
    let types = parse_types(["strings", "list", "hash", "sets", "zset", "lists"]).unwrap();
    assert_eq!(types.len(), 5);

    let results = migrate_all(
        source,
        dispatcher,
        config(2),
        &types,
        counter.clone(),
        CancellationToken::new(),
    )
    .await
    .unwrap();

    let total: u64 = results
        .iter()
        .map(|(_, r)| r.as_ref().unwrap().commands_dispatched)
        .sum();
    assert_eq!(total, 6);
    assert_eq!(counter.get(), 6);
    assert_eq!(senders.iter().map(MemorySender::len).sum::<usize>(), 6);
    assert_eq!(
        results.iter().map(|(t, _)| *t).collect::<Vec<_>>(),
        DataType::ALL.to_vec()
    );
}

#[tokio::test]
async fn test_configuration_errors() {
    assert!(matches!(
        parse_types(["strings", "bitmaps"]),
        Err(MigrateError::UnknownType(_))
    ));

    let dispatcher = Arc::new(Dispatcher::new(vec![MemorySender::new()]).unwrap());
    let result = migrate_all(
        MemorySource::new(),
        dispatcher,
        config(0),
        &[DataType::Strings],
        MigrationCounter::new(),
        CancellationToken::new(),
    )
    .await;
    assert!(matches!(result, Err(MigrateError::Config(_))));

    let parsed: MigrationConfig = toml::from_str(
        r#"
        sync_batch_num = 64
        routing = "lists-only"
        string_consistency = "live"
        "#,
    )
    .unwrap();
    assert_eq!(parsed.sync_batch_num, 64);
    assert_eq!(parsed.routing, RoutingPolicy::ListsOnly);
    assert_eq!(parsed.string_consistency, Consistency::Live);
    assert_eq!(parsed.max_scan_retries, 3);
}
