//! RocksDB source configuration

use std::path::PathBuf;

/// Configuration for the RocksDB source engine
#[derive(Debug, Clone)]
pub struct RocksDbSourceConfig {
    /// Path to the RocksDB database
    pub path: PathBuf,
    /// Open without taking the write lock; every column family must already exist
    pub read_only: bool,
}

impl RocksDbSourceConfig {
    /// Create a read-write configuration for the given path
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            read_only: false,
        }
    }

    /// Open the database read-only
    #[must_use]
    pub fn read_only(mut self) -> Self {
        self.read_only = true;
        self
    }
}
