//! RocksDB source engine implementation
//!
//! Stores the five key spaces in dedicated column families (see [`keys`] for
//! the layout). String snapshots are served from a RocksDB snapshot that is
//! owned by a blocking reader thread and released as soon as the returned
//! stream is dropped.
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

pub mod config;
mod keys;

use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use bytes::Bytes;
use kvport_source::{
    DataType, FieldValue, KeyMatcher, KeyTtl, RawStringRecord, ScanPage, ScoreMember,
    SourceEngine, SourceError, SourceResult, StringRecordStream, display_key, resolve_range,
};
use rocksdb::{
    BoundColumnFamily, ColumnFamilyDescriptor, DBWithThreadMode, Direction, IteratorMode,
    MultiThreaded, Options, WriteBatch,
};
use tokio::sync::{mpsc, oneshot};
use tokio_stream::wrappers::ReceiverStream;

pub use config::RocksDbSourceConfig;
use keys::{
    ALL_CFS, CF_HASHES_DATA, CF_HASHES_META, CF_LISTS_DATA, CF_LISTS_META, CF_SETS_DATA,
    CF_SETS_META, CF_STRINGS, CF_ZSETS_MEMBERS, CF_ZSETS_META, CF_ZSETS_SCORES, Meta,
};

type Db = DBWithThreadMode<MultiThreaded>;

/// Records buffered between the snapshot reader thread and the consumer
const SNAPSHOT_CHANNEL_DEPTH: usize = 1024;

/// RocksDB source engine
#[derive(Clone)]
pub struct RocksDbSource {
    db: Arc<Db>,
}

fn backend<E: std::fmt::Display>(context: &str) -> impl FnOnce(E) -> SourceError + '_ {
    move |e| SourceError::Backend(format!("{context}: {e}"))
}

fn unix_now() -> SourceResult<u64> {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .map_err(|e| SourceError::Clock(e.to_string()))
}

impl RocksDbSource {
    /// Open (or create) a database at the given path
    pub fn open(path: impl Into<std::path::PathBuf>) -> SourceResult<Self> {
        Self::open_with_config(&RocksDbSourceConfig::new(path))
    }

    /// Open a database with explicit configuration
    pub fn open_with_config(config: &RocksDbSourceConfig) -> SourceResult<Self> {
        let mut db_opts = Options::default();
        db_opts.create_if_missing(!config.read_only);
        db_opts.create_missing_column_families(!config.read_only);

        let cfs = ALL_CFS
            .iter()
            .map(|name| ColumnFamilyDescriptor::new(*name, Options::default()));

        let db = if config.read_only {
            Db::open_cf_descriptors_read_only(&db_opts, &config.path, cfs, false)
        } else {
            Db::open_cf_descriptors(&db_opts, &config.path, cfs)
        }
        .map_err(backend("Failed to open RocksDB"))?;

        tracing::info!(
            "Opened RocksDB source at {} (read_only: {})",
            config.path.display(),
            config.read_only
        );

        Ok(Self { db: Arc::new(db) })
    }

    fn cf(&self, name: &str) -> SourceResult<Arc<BoundColumnFamily<'_>>> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| SourceError::Backend(format!("Missing column family {name}")))
    }

    fn read_meta(&self, cf_name: &str, key: &[u8]) -> SourceResult<Option<Meta>> {
        let cf = self.cf(cf_name)?;
        self.db
            .get_pinned_cf(&cf, key)
            .map_err(backend("Failed to read meta"))?
            .map(|raw| Meta::decode(&raw))
            .transpose()
    }

    /// Meta for a key that exists and has not expired
    fn live_meta(&self, cf_name: &str, key: &[u8], now: u64) -> SourceResult<Option<Meta>> {
        Ok(self
            .read_meta(cf_name, key)?
            .filter(|meta| meta.is_live(now)))
    }

    /// Every `(suffix, value)` stored under a data prefix, in key order
    fn read_prefix(&self, cf_name: &str, prefix: &[u8]) -> SourceResult<Vec<(Vec<u8>, Bytes)>> {
        let cf = self.cf(cf_name)?;
        let mut entries = Vec::new();

        let iter = self
            .db
            .iterator_cf(&cf, IteratorMode::From(prefix, Direction::Forward));
        for item in iter {
            let (key, value) = item.map_err(backend("Iterator error"))?;
            if !key.starts_with(prefix) {
                break;
            }
            entries.push((key[prefix.len()..].to_vec(), Bytes::from(value.into_vec())));
        }

        Ok(entries)
    }

    fn delete_prefix(
        &self,
        batch: &mut WriteBatch,
        cf_name: &str,
        prefix: &[u8],
    ) -> SourceResult<()> {
        let cf = self.cf(cf_name)?;
        let iter = self
            .db
            .iterator_cf(&cf, IteratorMode::From(prefix, Direction::Forward));
        for item in iter {
            let (key, _) = item.map_err(backend("Iterator error"))?;
            if !key.starts_with(prefix) {
                break;
            }
            batch.delete_cf(&cf, key);
        }
        Ok(())
    }

    /// Load the meta of a collection for writing
    ///
    /// A missing or expired collection starts over empty; stale data of an
    /// expired one is queued for deletion in `batch`.
    fn writable_meta(
        &self,
        batch: &mut WriteBatch,
        data_type: DataType,
        key: &[u8],
    ) -> SourceResult<Meta> {
        let now = unix_now()?;
        match self.read_meta(keys::key_cf(data_type), key)? {
            Some(meta) if meta.is_live(now) => Ok(meta),
            Some(_) => {
                let prefix = keys::data_prefix(key)?;
                for cf_name in keys::data_cfs(data_type) {
                    self.delete_prefix(batch, cf_name, &prefix)?;
                }
                Ok(Meta::default())
            }
            None => Ok(Meta::default()),
        }
    }

    fn put_meta(
        &self,
        batch: &mut WriteBatch,
        cf_name: &str,
        key: &[u8],
        meta: Meta,
    ) -> SourceResult<()> {
        let cf = self.cf(cf_name)?;
        batch.put_cf(&cf, key, meta.encode());
        Ok(())
    }

    fn write(&self, batch: WriteBatch) -> SourceResult<()> {
        self.db
            .write(batch)
            .map_err(backend("Failed to write batch"))
    }

    /// Store a string; `expire_at` is an absolute unix time, 0 for none
    pub fn set(&self, key: &[u8], value: &[u8], expire_at: u64) -> SourceResult<()> {
        let cf = self.cf(CF_STRINGS)?;
        self.db
            .put_cf(&cf, key, keys::encode_string(expire_at, value))
            .map_err(backend("Failed to write string"))
    }

    /// Append elements to the tail of a list
    pub fn rpush(&self, key: &[u8], elements: &[&[u8]]) -> SourceResult<()> {
        let mut batch = WriteBatch::default();
        let mut meta = self.writable_meta(&mut batch, DataType::Lists, key)?;
        let prefix = keys::data_prefix(key)?;
        let cf = self.cf(CF_LISTS_DATA)?;

        for element in elements {
            batch.put_cf(&cf, keys::list_index_key(&prefix, meta.len), element);
            meta.len += 1;
        }

        self.put_meta(&mut batch, CF_LISTS_META, key, meta)?;
        self.write(batch)
    }

    /// Set one hash field
    pub fn hset(&self, key: &[u8], field: &[u8], value: &[u8]) -> SourceResult<()> {
        let mut batch = WriteBatch::default();
        let mut meta = self.writable_meta(&mut batch, DataType::Hashes, key)?;
        let data_key = keys::data_key(&keys::data_prefix(key)?, field);
        let cf = self.cf(CF_HASHES_DATA)?;

        let exists = meta.len > 0
            && self
                .db
                .get_pinned_cf(&cf, &data_key)
                .map_err(backend("Failed to read hash field"))?
                .is_some();
        if !exists {
            meta.len += 1;
        }

        batch.put_cf(&cf, data_key, value);
        self.put_meta(&mut batch, CF_HASHES_META, key, meta)?;
        self.write(batch)
    }

    /// Add members to a set
    pub fn sadd(&self, key: &[u8], members: &[&[u8]]) -> SourceResult<()> {
        let mut batch = WriteBatch::default();
        let mut meta = self.writable_meta(&mut batch, DataType::Sets, key)?;
        let prefix = keys::data_prefix(key)?;
        let cf = self.cf(CF_SETS_DATA)?;

        let mut seen = std::collections::HashSet::new();
        for member in members {
            if !seen.insert(*member) {
                continue;
            }
            let data_key = keys::data_key(&prefix, member);
            let exists = meta.len > 0
                && self
                    .db
                    .get_pinned_cf(&cf, &data_key)
                    .map_err(backend("Failed to read set member"))?
                    .is_some();
            if !exists {
                meta.len += 1;
            }
            batch.put_cf(&cf, data_key, b"");
        }

        self.put_meta(&mut batch, CF_SETS_META, key, meta)?;
        self.write(batch)
    }

    /// Add or rescore one sorted-set member
    pub fn zadd(&self, key: &[u8], score: f64, member: &[u8]) -> SourceResult<()> {
        let mut batch = WriteBatch::default();
        let mut meta = self.writable_meta(&mut batch, DataType::ZSets, key)?;
        let prefix = keys::data_prefix(key)?;
        let members_cf = self.cf(CF_ZSETS_MEMBERS)?;
        let scores_cf = self.cf(CF_ZSETS_SCORES)?;

        let member_key = keys::data_key(&prefix, member);
        let previous = if meta.len > 0 {
            self.db
                .get_pinned_cf(&members_cf, &member_key)
                .map_err(backend("Failed to read zset member"))?
                .map(|raw| keys::decode_score_bits(&raw))
                .transpose()?
        } else {
            None
        };

        match previous {
            Some(old) => batch.delete_cf(&scores_cf, keys::score_key(&prefix, old, member)),
            None => meta.len += 1,
        }

        batch.put_cf(&members_cf, member_key, score.to_bits().to_be_bytes());
        batch.put_cf(&scores_cf, keys::score_key(&prefix, score, member), b"");
        self.put_meta(&mut batch, CF_ZSETS_META, key, meta)?;
        self.write(batch)
    }

    /// Set the absolute expiration of a key; returns false if the key is absent
    pub fn expire_at(
        &self,
        data_type: DataType,
        key: &[u8],
        expire_at: u64,
    ) -> SourceResult<bool> {
        if data_type == DataType::Strings {
            let cf = self.cf(CF_STRINGS)?;
            let Some(raw) = self
                .db
                .get_cf(&cf, key)
                .map_err(backend("Failed to read string"))?
            else {
                return Ok(false);
            };
            let (_, value) = keys::decode_string(&raw)?;
            self.set(key, value, expire_at)?;
            return Ok(true);
        }

        let cf_name = keys::key_cf(data_type);
        let Some(mut meta) = self.read_meta(cf_name, key)? else {
            return Ok(false);
        };
        meta.expire_at = expire_at;

        let mut batch = WriteBatch::default();
        self.put_meta(&mut batch, cf_name, key, meta)?;
        self.write(batch)?;
        Ok(true)
    }

    /// Remove a key and its data
    pub fn del(&self, data_type: DataType, key: &[u8]) -> SourceResult<()> {
        let mut batch = WriteBatch::default();
        let cf = self.cf(keys::key_cf(data_type))?;
        batch.delete_cf(&cf, key);

        let prefix = keys::data_prefix(key)?;
        for cf_name in keys::data_cfs(data_type) {
            self.delete_prefix(&mut batch, cf_name, &prefix)?;
        }
        self.write(batch)
    }

    fn scan_cf(
        &self,
        data_type: DataType,
        start_key: &[u8],
        matcher: &KeyMatcher,
        count: usize,
        now: u64,
    ) -> SourceResult<ScanPage> {
        let cf = self.cf(keys::key_cf(data_type))?;
        let mut page = ScanPage::default();
        let mut examined = 0;

        let iter = self
            .db
            .iterator_cf(&cf, IteratorMode::From(start_key, Direction::Forward));
        for item in iter {
            let (key, value) = item.map_err(backend("Scan iterator error"))?;

            let live = if data_type == DataType::Strings {
                keys::decode_string(&value)
                    .map(|(expire_at, _)| expire_at == 0 || expire_at > now)
            } else {
                Meta::decode(&value).map(|meta| meta.is_live(now))
            };
            // Undecodable keys stay in the page; the per-key read reports them
            match live {
                Ok(true) => {}
                Ok(false) => continue,
                Err(e) => tracing::warn!(
                    "Corrupted {} key {} during scan: {}",
                    data_type,
                    display_key(&key),
                    e
                ),
            }

            if examined == count {
                page.next_key = Bytes::from(key.into_vec());
                return Ok(page);
            }
            examined += 1;

            if matcher.matches(&key) {
                page.keys.push(Bytes::from(key.into_vec()));
            }
        }

        page.finished = true;
        Ok(page)
    }
}

/// Walk the strings family under one snapshot, feeding records into `tx`
fn read_snapshot(
    db: &Db,
    ready: oneshot::Sender<SourceResult<()>>,
    tx: &mpsc::Sender<SourceResult<RawStringRecord>>,
) {
    let Some(cf) = db.cf_handle(CF_STRINGS) else {
        let _ = ready.send(Err(SourceError::Backend(format!(
            "Missing column family {CF_STRINGS}"
        ))));
        return;
    };

    let snapshot = db.snapshot();
    if ready.send(Ok(())).is_err() {
        return;
    }

    for item in snapshot.iterator_cf(&cf, IteratorMode::Start) {
        let (key, raw) = match item {
            Ok(entry) => entry,
            Err(e) => {
                let _ = tx.blocking_send(Err(SourceError::Backend(format!(
                    "Snapshot iterator error: {e}"
                ))));
                return;
            }
        };

        let record = keys::decode_string(&raw)
            .map(|(expire_at, value)| RawStringRecord {
                key: Bytes::copy_from_slice(&key),
                value: Bytes::copy_from_slice(value),
                expire_at,
            })
            .map_err(|e| {
                SourceError::Corruption(format!("string {}: {e}", display_key(&key)))
            });

        if tx.blocking_send(record).is_err() {
            tracing::debug!("String snapshot consumer went away, releasing snapshot");
            return;
        }
    }
}

#[async_trait]
impl SourceEngine for RocksDbSource {
    async fn now(&self) -> SourceResult<u64> {
        unix_now()
    }

    async fn snapshot_strings(&self) -> SourceResult<StringRecordStream> {
        let (tx, rx) = mpsc::channel(SNAPSHOT_CHANNEL_DEPTH);
        let (ready_tx, ready_rx) = oneshot::channel();
        let db = Arc::clone(&self.db);

        tokio::task::spawn_blocking(move || read_snapshot(&db, ready_tx, &tx));

        ready_rx
            .await
            .map_err(|_| SourceError::Backend("Snapshot reader exited early".to_string()))??;

        Ok(Box::new(ReceiverStream::new(rx)))
    }

    async fn scan(
        &self,
        data_type: DataType,
        start_key: &[u8],
        pattern: &str,
        count: usize,
    ) -> SourceResult<ScanPage> {
        let matcher = KeyMatcher::new(pattern)?;
        let now = unix_now()?;
        self.scan_cf(data_type, start_key, &matcher, count.max(1), now)
    }

    async fn get_string(&self, key: &[u8]) -> SourceResult<Option<RawStringRecord>> {
        let now = unix_now()?;
        let cf = self.cf(CF_STRINGS)?;
        let Some(raw) = self
            .db
            .get_pinned_cf(&cf, key)
            .map_err(backend("Failed to read string"))?
        else {
            return Ok(None);
        };

        let (expire_at, value) = keys::decode_string(&raw)?;
        if expire_at != 0 && expire_at <= now {
            return Ok(None);
        }
        Ok(Some(RawStringRecord {
            key: Bytes::copy_from_slice(key),
            value: Bytes::copy_from_slice(value),
            expire_at,
        }))
    }

    async fn lrange(&self, key: &[u8], start: i64, stop: i64) -> SourceResult<Vec<Bytes>> {
        let now = unix_now()?;
        let Some(meta) = self.live_meta(CF_LISTS_META, key, now)? else {
            return Ok(Vec::new());
        };
        let len = usize::try_from(meta.len)
            .map_err(|_| SourceError::Corruption(format!("list {} too long", display_key(key))))?;
        let Some(range) = resolve_range(len, start, stop) else {
            return Ok(Vec::new());
        };

        let prefix = keys::data_prefix(key)?;
        let cf = self.cf(CF_LISTS_DATA)?;
        let first = keys::list_index_key(&prefix, *range.start() as u64);
        let wanted = range.end() - range.start() + 1;
        let mut elements = Vec::with_capacity(wanted);

        let iter = self
            .db
            .iterator_cf(&cf, IteratorMode::From(&first, Direction::Forward));
        for item in iter.take(wanted) {
            let (data_key, value) = item.map_err(backend("Iterator error"))?;
            if !data_key.starts_with(&prefix) {
                break;
            }
            elements.push(Bytes::from(value.into_vec()));
        }

        Ok(elements)
    }

    async fn hgetall(&self, key: &[u8]) -> SourceResult<Vec<FieldValue>> {
        let now = unix_now()?;
        if self.live_meta(CF_HASHES_META, key, now)?.is_none() {
            return Ok(Vec::new());
        }

        let prefix = keys::data_prefix(key)?;
        Ok(self
            .read_prefix(CF_HASHES_DATA, &prefix)?
            .into_iter()
            .map(|(field, value)| FieldValue::new(field, value))
            .collect())
    }

    async fn smembers(&self, key: &[u8]) -> SourceResult<Vec<Bytes>> {
        let now = unix_now()?;
        if self.live_meta(CF_SETS_META, key, now)?.is_none() {
            return Ok(Vec::new());
        }

        let prefix = keys::data_prefix(key)?;
        Ok(self
            .read_prefix(CF_SETS_DATA, &prefix)?
            .into_iter()
            .map(|(member, _)| Bytes::from(member))
            .collect())
    }

    async fn zrange_all(&self, key: &[u8]) -> SourceResult<Vec<ScoreMember>> {
        let now = unix_now()?;
        if self.live_meta(CF_ZSETS_META, key, now)?.is_none() {
            return Ok(Vec::new());
        }

        let prefix = keys::data_prefix(key)?;
        self.read_prefix(CF_ZSETS_SCORES, &prefix)?
            .into_iter()
            .map(|(suffix, _)| {
                if suffix.len() < 8 {
                    return Err(SourceError::Corruption(format!(
                        "zset score entry of {} too short",
                        display_key(key)
                    )));
                }
                let (score, member) = suffix.split_at(8);
                Ok(ScoreMember::new(
                    keys::unsortable_score(score)?,
                    Bytes::copy_from_slice(member),
                ))
            })
            .collect()
    }

    async fn ttl(&self, data_type: DataType, key: &[u8]) -> SourceResult<KeyTtl> {
        let now = unix_now()?;
        let expire_at = if data_type == DataType::Strings {
            let cf = self.cf(CF_STRINGS)?;
            let raw = self
                .db
                .get_pinned_cf(&cf, key)
                .map_err(backend("Failed to read string"))?
                .ok_or_else(|| SourceError::KeyNotFound(display_key(key)))?;
            keys::decode_string(&raw)?.0
        } else {
            self.read_meta(keys::key_cf(data_type), key)?
                .ok_or_else(|| SourceError::KeyNotFound(display_key(key)))?
                .expire_at
        };

        match expire_at {
            0 => Ok(KeyTtl::Persistent),
            ts if ts > now => Ok(KeyTtl::Seconds(
                i64::try_from(ts - now).unwrap_or(i64::MAX),
            )),
            _ => Err(SourceError::KeyNotFound(display_key(key))),
        }
    }
}

impl std::fmt::Debug for RocksDbSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "RocksDbSource")
    }
}
