//! In-memory source engine implementation
//!
//! Holds the five key spaces in ordered maps behind one lock. String records
//! are kept copy-on-write so a snapshot is a reference to the map as it was
//! when the snapshot was taken; writes after that point never show up in it.
//!
//! The engine clock can be pinned with [`MemorySource::set_time`] and reads can
//! be made to fail per key, which is what the migrator's tests lean on.
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::ops::Bound;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use bytes::Bytes;
use indexmap::IndexMap;
use kvport_source::{
    DataType, FieldValue, KeyMatcher, KeyTtl, RawStringRecord, ScanPage, ScoreMember,
    SourceEngine, SourceError, SourceResult, StringRecordStream, display_key, resolve_range,
};
use parking_lot::Mutex;
use tokio::sync::RwLock;

/// A stored value with its absolute expiration (0 = never)
#[derive(Clone, Debug)]
struct Entry<T> {
    value: T,
    expire_at: u64,
}

impl<T> Entry<T> {
    const fn new(value: T) -> Self {
        Self {
            value,
            expire_at: 0,
        }
    }

    const fn is_live(&self, now: u64) -> bool {
        self.expire_at == 0 || self.expire_at > now
    }
}

type KeySpace<T> = BTreeMap<Bytes, Entry<T>>;

/// Injected failures, used to exercise error paths
#[derive(Default)]
struct Faults {
    clock: bool,
    scans: HashMap<DataType, u32>,
    reads: HashSet<Bytes>,
    read_after: HashMap<Bytes, u32>,
    ttls: HashSet<Bytes>,
    snapshot_after: Option<usize>,
}

#[derive(Default)]
struct Inner {
    strings: Arc<KeySpace<Bytes>>,
    lists: KeySpace<Vec<Bytes>>,
    hashes: KeySpace<IndexMap<Bytes, Bytes>>,
    sets: KeySpace<BTreeSet<Bytes>>,
    zsets: KeySpace<HashMap<Bytes, f64>>,
}

impl Faults {
    fn check_read(&mut self, key: &[u8]) -> SourceResult<()> {
        if self.reads.contains(key) {
            return Err(SourceError::Backend(format!(
                "injected read failure for {}",
                display_key(key)
            )));
        }

        if let Some(remaining) = self.read_after.get_mut(key) {
            if *remaining == 0 {
                return Err(SourceError::Backend(format!(
                    "injected read failure for {}",
                    display_key(key)
                )));
            }
            *remaining -= 1;
        }

        Ok(())
    }
}

impl Inner {
    fn expire_at_mut(&mut self, data_type: DataType, key: &[u8]) -> Option<&mut u64> {
        match data_type {
            DataType::Strings => Arc::make_mut(&mut self.strings)
                .get_mut(key)
                .map(|e| &mut e.expire_at),
            DataType::Lists => self.lists.get_mut(key).map(|e| &mut e.expire_at),
            DataType::Hashes => self.hashes.get_mut(key).map(|e| &mut e.expire_at),
            DataType::Sets => self.sets.get_mut(key).map(|e| &mut e.expire_at),
            DataType::ZSets => self.zsets.get_mut(key).map(|e| &mut e.expire_at),
        }
    }

    fn expire_at(&self, data_type: DataType, key: &[u8]) -> Option<u64> {
        match data_type {
            DataType::Strings => self.strings.get(key).map(|e| e.expire_at),
            DataType::Lists => self.lists.get(key).map(|e| e.expire_at),
            DataType::Hashes => self.hashes.get(key).map(|e| e.expire_at),
            DataType::Sets => self.sets.get(key).map(|e| e.expire_at),
            DataType::ZSets => self.zsets.get(key).map(|e| e.expire_at),
        }
    }
}

/// In-memory source engine
#[derive(Clone, Default)]
pub struct MemorySource {
    inner: Arc<RwLock<Inner>>,
    faults: Arc<Mutex<Faults>>,
    /// Pinned engine time in unix seconds; 0 follows the system clock
    pinned_time: Arc<AtomicU64>,
}

impl MemorySource {
    /// Create an empty engine
    pub fn new() -> Self {
        Self::default()
    }

    /// Pin the engine clock to `secs`; 0 returns to the system clock
    pub fn set_time(&self, secs: u64) {
        self.pinned_time.store(secs, Ordering::SeqCst);
    }

    fn current_time(&self) -> SourceResult<u64> {
        match self.pinned_time.load(Ordering::SeqCst) {
            0 => SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_secs())
                .map_err(|e| SourceError::Clock(e.to_string())),
            pinned => Ok(pinned),
        }
    }

    /// Time used to decide liveness; an unreadable clock treats nothing as expired
    fn liveness_time(&self) -> u64 {
        self.current_time().unwrap_or(0)
    }

    /// Store a string with no expiration
    pub async fn set(&self, key: impl Into<Bytes>, value: impl Into<Bytes>) {
        self.set_with_expire_at(key, value, 0).await;
    }

    /// Store a string expiring at the absolute unix time `expire_at`
    pub async fn set_with_expire_at(
        &self,
        key: impl Into<Bytes>,
        value: impl Into<Bytes>,
        expire_at: u64,
    ) {
        let mut inner = self.inner.write().await;
        Arc::make_mut(&mut inner.strings).insert(
            key.into(),
            Entry {
                value: value.into(),
                expire_at,
            },
        );
    }

    /// Append elements to the tail of a list
    pub async fn rpush<I, E>(&self, key: impl Into<Bytes>, elements: I)
    where
        I: IntoIterator<Item = E> + Send,
        E: Into<Bytes>,
    {
        let now = self.liveness_time();
        let mut inner = self.inner.write().await;
        let entry = inner
            .lists
            .entry(key.into())
            .or_insert_with(|| Entry::new(Vec::new()));
        if !entry.is_live(now) {
            *entry = Entry::new(Vec::new());
        }
        entry.value.extend(elements.into_iter().map(Into::into));
    }

    /// Set one hash field
    pub async fn hset(
        &self,
        key: impl Into<Bytes>,
        field: impl Into<Bytes>,
        value: impl Into<Bytes>,
    ) {
        let now = self.liveness_time();
        let mut inner = self.inner.write().await;
        let entry = inner
            .hashes
            .entry(key.into())
            .or_insert_with(|| Entry::new(IndexMap::new()));
        if !entry.is_live(now) {
            *entry = Entry::new(IndexMap::new());
        }
        entry.value.insert(field.into(), value.into());
    }

    /// Add members to a set
    pub async fn sadd<I, E>(&self, key: impl Into<Bytes>, members: I)
    where
        I: IntoIterator<Item = E> + Send,
        E: Into<Bytes>,
    {
        let now = self.liveness_time();
        let mut inner = self.inner.write().await;
        let entry = inner
            .sets
            .entry(key.into())
            .or_insert_with(|| Entry::new(BTreeSet::new()));
        if !entry.is_live(now) {
            *entry = Entry::new(BTreeSet::new());
        }
        entry.value.extend(members.into_iter().map(Into::into));
    }

    /// Add or rescore one sorted-set member
    pub async fn zadd(&self, key: impl Into<Bytes>, score: f64, member: impl Into<Bytes>) {
        let now = self.liveness_time();
        let mut inner = self.inner.write().await;
        let entry = inner
            .zsets
            .entry(key.into())
            .or_insert_with(|| Entry::new(HashMap::new()));
        if !entry.is_live(now) {
            *entry = Entry::new(HashMap::new());
        }
        entry.value.insert(member.into(), score);
    }

    /// Set the absolute expiration of a key; returns false if the key is absent
    pub async fn expire_at(&self, data_type: DataType, key: &[u8], expire_at: u64) -> bool {
        let mut inner = self.inner.write().await;
        match inner.expire_at_mut(data_type, key) {
            Some(slot) => {
                *slot = expire_at;
                true
            }
            None => false,
        }
    }

    /// Remove a key; returns false if it was absent
    pub async fn del(&self, data_type: DataType, key: &[u8]) -> bool {
        let mut inner = self.inner.write().await;
        match data_type {
            DataType::Strings => Arc::make_mut(&mut inner.strings).remove(key).is_some(),
            DataType::Lists => inner.lists.remove(key).is_some(),
            DataType::Hashes => inner.hashes.remove(key).is_some(),
            DataType::Sets => inner.sets.remove(key).is_some(),
            DataType::ZSets => inner.zsets.remove(key).is_some(),
        }
    }

    /// Make the engine clock report an error
    pub fn fail_clock(&self, fail: bool) {
        self.faults.lock().clock = fail;
    }

    /// Make the next `times` scans of `data_type` fail
    pub fn fail_scans(&self, data_type: DataType, times: u32) {
        self.faults.lock().scans.insert(data_type, times);
    }

    /// Make every data read of `key` fail
    pub fn fail_reads(&self, key: impl Into<Bytes>) {
        self.faults.lock().reads.insert(key.into());
    }

    /// Let `successes` data reads of `key` through, then fail the rest
    pub fn fail_reads_after(&self, key: impl Into<Bytes>, successes: u32) {
        self.faults.lock().read_after.insert(key.into(), successes);
    }

    /// Make TTL lookups of `key` fail
    pub fn fail_ttl(&self, key: impl Into<Bytes>) {
        self.faults.lock().ttls.insert(key.into());
    }

    /// Break snapshots opened from now on after `records` records
    ///
    /// Keys marked with [`MemorySource::fail_reads`] show up in a snapshot
    /// as corrupted records; this instead fails the walk itself.
    pub fn fail_snapshot_after(&self, records: usize) {
        self.faults.lock().snapshot_after = Some(records);
    }
}

/// Collect one page of live keys starting at `start`
fn scan_space<T>(
    space: &KeySpace<T>,
    start: &[u8],
    matcher: &KeyMatcher,
    count: usize,
    now: u64,
) -> ScanPage {
    let mut page = ScanPage::default();
    let mut examined = 0;

    let live = space
        .range::<[u8], _>((Bound::Included(start), Bound::Unbounded))
        .filter(|(_, entry)| entry.is_live(now));

    for (key, _) in live {
        if examined == count {
            page.next_key = key.clone();
            return page;
        }
        examined += 1;
        if matcher.matches(key) {
            page.keys.push(key.clone());
        }
    }

    page.finished = true;
    page
}

/// Lazy walk over a frozen copy of the string key space
struct SnapshotIter {
    snapshot: Arc<KeySpace<Bytes>>,
    after: Option<Bytes>,
    corrupt: HashSet<Bytes>,
    fail_after: Option<usize>,
    yielded: usize,
    broken: bool,
}

impl Iterator for SnapshotIter {
    type Item = SourceResult<RawStringRecord>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.broken {
            return None;
        }
        if self.fail_after == Some(self.yielded) {
            self.broken = true;
            return Some(Err(SourceError::Backend(format!(
                "injected snapshot failure after {} records",
                self.yielded
            ))));
        }

        let lower = match &self.after {
            Some(key) => Bound::Excluded(key.as_ref()),
            None => Bound::Unbounded,
        };

        let (key, entry) = self
            .snapshot
            .range::<[u8], _>((lower, Bound::Unbounded))
            .next()?;

        self.after = Some(key.clone());
        self.yielded += 1;

        if self.corrupt.contains(key) {
            return Some(Err(SourceError::Corruption(format!(
                "injected corruption in {}",
                display_key(key)
            ))));
        }

        Some(Ok(RawStringRecord {
            key: key.clone(),
            value: entry.value.clone(),
            expire_at: entry.expire_at,
        }))
    }
}

fn live_entry<'a, T>(space: &'a KeySpace<T>, key: &[u8], now: u64) -> Option<&'a Entry<T>> {
    space.get(key).filter(|entry| entry.is_live(now))
}

#[async_trait]
impl SourceEngine for MemorySource {
    async fn now(&self) -> SourceResult<u64> {
        if self.faults.lock().clock {
            return Err(SourceError::Clock("injected clock failure".to_string()));
        }
        self.current_time()
    }

    async fn snapshot_strings(&self) -> SourceResult<StringRecordStream> {
        let snapshot = Arc::clone(&self.inner.read().await.strings);
        tracing::debug!("Opened string snapshot over {} records", snapshot.len());

        let (corrupt, fail_after) = {
            let faults = self.faults.lock();
            (faults.reads.clone(), faults.snapshot_after)
        };
        let iter = SnapshotIter {
            snapshot,
            after: None,
            corrupt,
            fail_after,
            yielded: 0,
            broken: false,
        };
        Ok(Box::new(tokio_stream::iter(iter)))
    }

    async fn scan(
        &self,
        data_type: DataType,
        start_key: &[u8],
        pattern: &str,
        count: usize,
    ) -> SourceResult<ScanPage> {
        let matcher = KeyMatcher::new(pattern)?;
        let now = self.liveness_time();
        let count = count.max(1);

        if let Some(remaining) = self.faults.lock().scans.get_mut(&data_type) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(SourceError::Backend(format!(
                    "injected scan failure for {data_type}"
                )));
            }
        }

        let inner = self.inner.read().await;

        let page = match data_type {
            DataType::Strings => scan_space(&inner.strings, start_key, &matcher, count, now),
            DataType::Lists => scan_space(&inner.lists, start_key, &matcher, count, now),
            DataType::Hashes => scan_space(&inner.hashes, start_key, &matcher, count, now),
            DataType::Sets => scan_space(&inner.sets, start_key, &matcher, count, now),
            DataType::ZSets => scan_space(&inner.zsets, start_key, &matcher, count, now),
        };
        Ok(page)
    }

    async fn get_string(&self, key: &[u8]) -> SourceResult<Option<RawStringRecord>> {
        let now = self.liveness_time();
        self.faults.lock().check_read(key)?;
        let inner = self.inner.read().await;

        Ok(live_entry(&inner.strings, key, now).map(|entry| RawStringRecord {
            key: Bytes::copy_from_slice(key),
            value: entry.value.clone(),
            expire_at: entry.expire_at,
        }))
    }

    async fn lrange(&self, key: &[u8], start: i64, stop: i64) -> SourceResult<Vec<Bytes>> {
        let now = self.liveness_time();
        self.faults.lock().check_read(key)?;
        let inner = self.inner.read().await;

        let Some(entry) = live_entry(&inner.lists, key, now) else {
            return Ok(Vec::new());
        };
        Ok(resolve_range(entry.value.len(), start, stop)
            .map(|range| entry.value[range].to_vec())
            .unwrap_or_default())
    }

    async fn hgetall(&self, key: &[u8]) -> SourceResult<Vec<FieldValue>> {
        let now = self.liveness_time();
        self.faults.lock().check_read(key)?;
        let inner = self.inner.read().await;

        Ok(live_entry(&inner.hashes, key, now)
            .map(|entry| {
                entry
                    .value
                    .iter()
                    .map(|(field, value)| FieldValue::new(field.clone(), value.clone()))
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn smembers(&self, key: &[u8]) -> SourceResult<Vec<Bytes>> {
        let now = self.liveness_time();
        self.faults.lock().check_read(key)?;
        let inner = self.inner.read().await;

        Ok(live_entry(&inner.sets, key, now)
            .map(|entry| entry.value.iter().cloned().collect())
            .unwrap_or_default())
    }

    async fn zrange_all(&self, key: &[u8]) -> SourceResult<Vec<ScoreMember>> {
        let now = self.liveness_time();
        self.faults.lock().check_read(key)?;
        let inner = self.inner.read().await;

        let Some(entry) = live_entry(&inner.zsets, key, now) else {
            return Ok(Vec::new());
        };
        let mut members: Vec<_> = entry
            .value
            .iter()
            .map(|(member, score)| ScoreMember::new(*score, member.clone()))
            .collect();
        members.sort_by(|a, b| {
            a.score
                .total_cmp(&b.score)
                .then_with(|| a.member.cmp(&b.member))
        });
        Ok(members)
    }

    async fn ttl(&self, data_type: DataType, key: &[u8]) -> SourceResult<KeyTtl> {
        let now = self.current_time()?;
        if self.faults.lock().ttls.contains(key) {
            return Err(SourceError::Backend(format!(
                "injected ttl failure for {}",
                display_key(key)
            )));
        }

        let inner = self.inner.read().await;
        match inner.expire_at(data_type, key) {
            None => Err(SourceError::KeyNotFound(display_key(key))),
            Some(0) => Ok(KeyTtl::Persistent),
            Some(ts) if ts > now => Ok(KeyTtl::Seconds(
                i64::try_from(ts - now).unwrap_or(i64::MAX),
            )),
            Some(_) => Err(SourceError::KeyNotFound(display_key(key))),
        }
    }
}

impl std::fmt::Debug for MemorySource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemorySource")
            .field("inner", &"<locked>")
            .field("pinned_time", &self.pinned_time.load(Ordering::SeqCst))
            .finish()
    }
}
