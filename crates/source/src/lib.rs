//! Source engine traits for kvport
//!
//! This crate describes what the migrator needs from the storage engine it
//! exports from, without tying it to a particular backend. Backends live in
//! their own crates (`kvport-source-memory`, `kvport-source-rocksdb`).
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

pub mod engine;
pub mod error;
pub mod matcher;
pub mod types;

pub use engine::{MATCH_ALL, SourceEngine, StringRecordStream};
pub use error::{SourceError, SourceResult};
pub use matcher::{KeyMatcher, resolve_range};
pub use types::{
    DataType, FieldValue, KeyTtl, RawStringRecord, ScanPage, ScoreMember, UnknownDataType,
    display_key,
};
