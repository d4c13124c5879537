//! Records, pages and TTL values exchanged with a source engine

use std::fmt::{self, Display};
use std::str::FromStr;

use bytes::Bytes;
use serde::Deserialize;

/// The five key spaces a source engine stores
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Deserialize)]
#[serde(try_from = "String")]
pub enum DataType {
    /// Scalar string values
    Strings,
    /// Ordered lists
    Lists,
    /// Field/value maps
    Hashes,
    /// Unordered member sets
    Sets,
    /// Score-ordered member sets
    ZSets,
}

impl DataType {
    /// Every data type, in the order a full migration runs them
    pub const ALL: [Self; 5] = [
        Self::Strings,
        Self::Lists,
        Self::Hashes,
        Self::Sets,
        Self::ZSets,
    ];

    /// Short name used in logs and configuration
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Strings => "strings",
            Self::Lists => "lists",
            Self::Hashes => "hashes",
            Self::Sets => "sets",
            Self::ZSets => "zsets",
        }
    }
}

impl Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Returned when a data type name is not one of the five known types
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
#[error("unknown data type: {0}")]
pub struct UnknownDataType(pub String);

impl FromStr for DataType {
    type Err = UnknownDataType;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "string" | "strings" => Ok(Self::Strings),
            "list" | "lists" => Ok(Self::Lists),
            "hash" | "hashes" => Ok(Self::Hashes),
            "set" | "sets" => Ok(Self::Sets),
            "zset" | "zsets" => Ok(Self::ZSets),
            _ => Err(UnknownDataType(s.to_string())),
        }
    }
}

impl TryFrom<String> for DataType {
    type Error = UnknownDataType;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

/// A string record as stored, with its absolute expiration time
///
/// `expire_at` is a unix timestamp in seconds; zero means the key never expires.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RawStringRecord {
    /// Record key
    pub key: Bytes,
    /// Stored value
    pub value: Bytes,
    /// Absolute expiration in unix seconds, 0 for none
    pub expire_at: u64,
}

/// One hash field and its value
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FieldValue {
    /// Field name
    pub field: Bytes,
    /// Field value
    pub value: Bytes,
}

impl FieldValue {
    /// Pair a field with its value
    pub fn new(field: impl Into<Bytes>, value: impl Into<Bytes>) -> Self {
        Self {
            field: field.into(),
            value: value.into(),
        }
    }
}

/// One sorted-set member and its score
#[derive(Clone, Debug, PartialEq)]
pub struct ScoreMember {
    /// Sort score
    pub score: f64,
    /// Member bytes
    pub member: Bytes,
}

impl ScoreMember {
    /// Pair a member with its score
    pub fn new(score: f64, member: impl Into<Bytes>) -> Self {
        Self {
            score,
            member: member.into(),
        }
    }
}

/// One page of a resumable key scan
///
/// A caller keeps scanning with `next_key` as the new start key until a page
/// comes back `finished` *and* empty. A finished page that still carries keys
/// must be processed.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ScanPage {
    /// Matching keys, in byte order
    pub keys: Vec<Bytes>,
    /// Where the next page starts; empty once finished
    pub next_key: Bytes,
    /// No keys remain past this page
    pub finished: bool,
}

/// Remaining lifetime of a collection key
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum KeyTtl {
    /// The key has no expiration
    Persistent,
    /// Seconds until the key expires
    Seconds(i64),
}

/// Render a key for logs: UTF-8 when possible, hex otherwise
pub fn display_key(key: &[u8]) -> String {
    match std::str::from_utf8(key) {
        Ok(s) => s.to_string(),
        Err(_) => format!("0x{}", hex::encode(key)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_data_type_parse() {
        assert_eq!("strings".parse::<DataType>().unwrap(), DataType::Strings);
        assert_eq!("List".parse::<DataType>().unwrap(), DataType::Lists);
        assert_eq!(" zset ".parse::<DataType>().unwrap(), DataType::ZSets);
        assert_eq!(
            "bitmaps".parse::<DataType>(),
            Err(UnknownDataType("bitmaps".to_string()))
        );
    }

    #[test]
    fn test_display_key() {
        assert_eq!(display_key(b"user:1"), "user:1");
        assert_eq!(display_key(&[0xff, 0x00]), "0xff00");
    }
}
