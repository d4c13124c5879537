//! Resumable walk over one data type's key space

use std::time::Duration;

use bytes::Bytes;
use kvport_source::{DataType, SourceEngine, display_key};
use tracing::{debug, warn};

use crate::{MigrateError, MigrateResult};

const SCAN_RETRY_DELAY: Duration = Duration::from_millis(20);

/// Chains scan pages by feeding each page's `next_key` into the next call
///
/// The walk ends only on a page that is finished and empty. A finished page
/// that still has keys is returned, and the call after it ends the walk.
pub struct KeyCursor<'a, E> {
    engine: &'a E,
    data_type: DataType,
    pattern: &'a str,
    page_size: usize,
    max_retries: u32,
    start_key: Bytes,
    end_reached: bool,
    done: bool,
    pages: u64,
}

impl<'a, E: SourceEngine> KeyCursor<'a, E> {
    /// Start a walk at the beginning of `data_type`'s key space
    pub fn new(
        engine: &'a E,
        data_type: DataType,
        pattern: &'a str,
        page_size: usize,
        max_retries: u32,
    ) -> Self {
        Self {
            engine,
            data_type,
            pattern,
            page_size,
            max_retries,
            start_key: Bytes::new(),
            end_reached: false,
            done: false,
            pages: 0,
        }
    }

    /// Pages fetched so far
    pub const fn pages(&self) -> u64 {
        self.pages
    }

    /// Fetch the next page of keys, `None` once the key space is exhausted
    ///
    /// A failed fetch is retried at the same position; the cursor never moves
    /// past a page it could not read.
    pub async fn next_page(&mut self) -> MigrateResult<Option<Vec<Bytes>>> {
        if self.done {
            return Ok(None);
        }

        let mut failures = 0;
        let page = loop {
            match self
                .engine
                .scan(self.data_type, &self.start_key, self.pattern, self.page_size)
                .await
            {
                Ok(page) => break page,
                Err(e) => {
                    failures += 1;
                    if failures > self.max_retries {
                        self.done = true;
                        return Err(MigrateError::Scan {
                            data_type: self.data_type,
                            position: display_key(&self.start_key),
                            attempts: failures,
                            source: e,
                        });
                    }
                    warn!(
                        "Scan of {} at {:?} failed (attempt {}): {}",
                        self.data_type,
                        display_key(&self.start_key),
                        failures,
                        e
                    );
                    tokio::time::sleep(SCAN_RETRY_DELAY * failures).await;
                }
            }
        };

        self.pages += 1;
        debug!(
            "Scanned {} page {}: {} keys, finished={}",
            self.data_type,
            self.pages,
            page.keys.len(),
            page.finished
        );

        if page.finished {
            if page.keys.is_empty() || self.end_reached {
                self.done = true;
                return Ok(None);
            }
            // Resume from the last key; the next call will see the
            // finished, empty page that ends the walk
            self.end_reached = true;
            if let Some(last) = page.keys.last() {
                self.start_key = after(last);
            }
        } else {
            self.start_key = page.next_key;
        }

        Ok(Some(page.keys))
    }
}

/// Smallest key strictly greater than `key`
fn after(key: &[u8]) -> Bytes {
    let mut next = Vec::with_capacity(key.len() + 1);
    next.extend_from_slice(key);
    next.push(0);
    Bytes::from(next)
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::collections::BTreeSet;

    use kvport_source::MATCH_ALL;
    use kvport_source_memory::MemorySource;

    async fn collect(cursor: &mut KeyCursor<'_, MemorySource>) -> MigrateResult<Vec<Bytes>> {
        let mut keys = Vec::new();
        while let Some(page) = cursor.next_page().await? {
            keys.extend(page);
        }
        Ok(keys)
    }

    #[tokio::test]
    async fn test_every_key_exactly_once() {
        let source = MemorySource::new();
        for i in 0..53 {
            source.sadd(format!("set:{i:03}"), ["m"]).await;
        }

        for page_size in [1, 2, 7, 53, 54, 1000] {
            let mut cursor = KeyCursor::new(&source, DataType::Sets, MATCH_ALL, page_size, 0);
            let keys = collect(&mut cursor).await.unwrap();
            assert_eq!(keys.len(), 53, "page size {page_size}");
            let unique: BTreeSet<_> = keys.iter().collect();
            assert_eq!(unique.len(), 53);
            assert!(cursor.next_page().await.unwrap().is_none());
        }
    }

    #[tokio::test]
    async fn test_empty_key_space() {
        let source = MemorySource::new();
        let mut cursor = KeyCursor::new(&source, DataType::Lists, MATCH_ALL, 10, 0);
        assert!(cursor.next_page().await.unwrap().is_none());
        assert_eq!(cursor.pages(), 1);
    }

    #[tokio::test]
    async fn test_finished_page_with_keys_is_processed() {
        let source = MemorySource::new();
        source.hset("a", "f", "v").await;
        source.hset("b", "f", "v").await;

        let mut cursor = KeyCursor::new(&source, DataType::Hashes, MATCH_ALL, 100, 0);
        let first = cursor.next_page().await.unwrap().unwrap();
        assert_eq!(first, vec![Bytes::from("a"), Bytes::from("b")]);
        assert!(cursor.next_page().await.unwrap().is_none());
        assert_eq!(cursor.pages(), 2);
    }

    #[tokio::test]
    async fn test_scan_failures_retry_in_place() {
        let source = MemorySource::new();
        for key in ["a", "b", "c"] {
            source.zadd(key, 1.0, "m").await;
        }
        source.fail_scans(DataType::ZSets, 2);

        let mut cursor = KeyCursor::new(&source, DataType::ZSets, MATCH_ALL, 1, 2);
        let keys = collect(&mut cursor).await.unwrap();
        assert_eq!(keys, vec![Bytes::from("a"), Bytes::from("b"), Bytes::from("c")]);
    }

    #[tokio::test]
    async fn test_scan_gives_up_after_retries() {
        let source = MemorySource::new();
        source.zadd("a", 1.0, "m").await;
        source.fail_scans(DataType::ZSets, 10);

        let mut cursor = KeyCursor::new(&source, DataType::ZSets, MATCH_ALL, 1, 2);
        match cursor.next_page().await {
            Err(MigrateError::Scan {
                data_type,
                attempts,
                ..
            }) => {
                assert_eq!(data_type, DataType::ZSets);
                assert_eq!(attempts, 3);
            }
            other => panic!("unexpected result {other:?}"),
        }
        assert!(cursor.next_page().await.unwrap().is_none());
    }
}
