//! The read surface a migration needs from a storage engine

use async_trait::async_trait;
use bytes::Bytes;
use tokio_stream::Stream;

use crate::{
    DataType, FieldValue, KeyTtl, RawStringRecord, ScanPage, ScoreMember, SourceResult,
};

/// Glob pattern that matches every key
pub const MATCH_ALL: &str = "*";

/// Lazy stream of string records read from one consistent view
///
/// The view is owned by the stream and released when the stream is dropped.
pub type StringRecordStream =
    Box<dyn Stream<Item = SourceResult<RawStringRecord>> + Send + Unpin>;

/// Read-only access to a key-value storage engine
///
/// Implementations must allow concurrent readers: several migrations (one per
/// data type) call into the same engine at once.
#[async_trait]
pub trait SourceEngine: Clone + Send + Sync + 'static {
    /// Current engine time in unix seconds
    async fn now(&self) -> SourceResult<u64>;

    /// Open a point-in-time view over every string record
    ///
    /// Records are yielded raw: expired records are included with their
    /// stored `expire_at` so callers can decide what to do with them.
    ///
    /// A record that cannot be decoded is yielded as
    /// `SourceError::Corruption` and the walk goes on past it. Any other error
    /// means the view itself failed and is the last item of the stream.
    async fn snapshot_strings(&self) -> SourceResult<StringRecordStream>;

    /// Fetch one page of keys of `data_type`
    ///
    /// Walks keys in byte order from `start_key`, examining at most `count`
    /// live keys and keeping those matching the glob `pattern`.
    async fn scan(
        &self,
        data_type: DataType,
        start_key: &[u8],
        pattern: &str,
        count: usize,
    ) -> SourceResult<ScanPage>;

    /// Read a single string record, `None` if absent or expired
    async fn get_string(&self, key: &[u8]) -> SourceResult<Option<RawStringRecord>>;

    /// Read list elements between two inclusive positions
    async fn lrange(&self, key: &[u8], start: i64, stop: i64) -> SourceResult<Vec<Bytes>>;

    /// Read every field of a hash
    async fn hgetall(&self, key: &[u8]) -> SourceResult<Vec<FieldValue>>;

    /// Read every member of a set
    async fn smembers(&self, key: &[u8]) -> SourceResult<Vec<Bytes>>;

    /// Read every member of a sorted set, lowest score first
    async fn zrange_all(&self, key: &[u8]) -> SourceResult<Vec<ScoreMember>>;

    /// Remaining lifetime of a key
    ///
    /// Missing and expired keys are reported as `SourceError::KeyNotFound`.
    async fn ttl(&self, data_type: DataType, key: &[u8]) -> SourceResult<KeyTtl>;
}

/// Implement SourceEngine for Arc<T> where T: SourceEngine
#[async_trait]
impl<T: SourceEngine> SourceEngine for std::sync::Arc<T> {
    async fn now(&self) -> SourceResult<u64> {
        (**self).now().await
    }

    async fn snapshot_strings(&self) -> SourceResult<StringRecordStream> {
        (**self).snapshot_strings().await
    }

    async fn scan(
        &self,
        data_type: DataType,
        start_key: &[u8],
        pattern: &str,
        count: usize,
    ) -> SourceResult<ScanPage> {
        (**self).scan(data_type, start_key, pattern, count).await
    }

    async fn get_string(&self, key: &[u8]) -> SourceResult<Option<RawStringRecord>> {
        (**self).get_string(key).await
    }

    async fn lrange(&self, key: &[u8], start: i64, stop: i64) -> SourceResult<Vec<Bytes>> {
        (**self).lrange(key, start, stop).await
    }

    async fn hgetall(&self, key: &[u8]) -> SourceResult<Vec<FieldValue>> {
        (**self).hgetall(key).await
    }

    async fn smembers(&self, key: &[u8]) -> SourceResult<Vec<Bytes>> {
        (**self).smembers(key).await
    }

    async fn zrange_all(&self, key: &[u8]) -> SourceResult<Vec<ScoreMember>> {
        (**self).zrange_all(key).await
    }

    async fn ttl(&self, data_type: DataType, key: &[u8]) -> SourceResult<KeyTtl> {
        (**self).ttl(data_type, key).await
    }
}
