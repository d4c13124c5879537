//! On-disk layout
//!
//! Strings live in one column family, `key -> expire_at(u64 BE) ++ value`.
//! Each collection type has a meta family, `key -> expire_at(u64 BE) ++ len(u64 BE)`,
//! and one or two data families whose keys start with `len(key)(u32 BE) ++ key`:
//!
//! - lists:  `prefix ++ index(u64 BE)` -> element
//! - hashes: `prefix ++ field` -> value
//! - sets:   `prefix ++ member` -> empty
//! - zsets:  `prefix ++ member` -> score bits, and `prefix ++ sortable(score) ++ member` -> empty

use kvport_source::{DataType, SourceError, SourceResult};

pub const CF_STRINGS: &str = "strings";
pub const CF_LISTS_META: &str = "lists_meta";
pub const CF_LISTS_DATA: &str = "lists_data";
pub const CF_HASHES_META: &str = "hashes_meta";
pub const CF_HASHES_DATA: &str = "hashes_data";
pub const CF_SETS_META: &str = "sets_meta";
pub const CF_SETS_DATA: &str = "sets_data";
pub const CF_ZSETS_META: &str = "zsets_meta";
pub const CF_ZSETS_MEMBERS: &str = "zsets_members";
pub const CF_ZSETS_SCORES: &str = "zsets_scores";

pub const ALL_CFS: [&str; 10] = [
    CF_STRINGS,
    CF_LISTS_META,
    CF_LISTS_DATA,
    CF_HASHES_META,
    CF_HASHES_DATA,
    CF_SETS_META,
    CF_SETS_DATA,
    CF_ZSETS_META,
    CF_ZSETS_MEMBERS,
    CF_ZSETS_SCORES,
];

/// Family that holds the key index for a data type
pub const fn key_cf(data_type: DataType) -> &'static str {
    match data_type {
        DataType::Strings => CF_STRINGS,
        DataType::Lists => CF_LISTS_META,
        DataType::Hashes => CF_HASHES_META,
        DataType::Sets => CF_SETS_META,
        DataType::ZSets => CF_ZSETS_META,
    }
}

/// Families holding element data for a collection type
pub const fn data_cfs(data_type: DataType) -> &'static [&'static str] {
    match data_type {
        DataType::Strings => &[],
        DataType::Lists => &[CF_LISTS_DATA],
        DataType::Hashes => &[CF_HASHES_DATA],
        DataType::Sets => &[CF_SETS_DATA],
        DataType::ZSets => &[CF_ZSETS_MEMBERS, CF_ZSETS_SCORES],
    }
}

fn read_u64(bytes: &[u8]) -> SourceResult<u64> {
    let array: [u8; 8] = bytes
        .try_into()
        .map_err(|_| SourceError::Corruption("expected 8 bytes".to_string()))?;
    Ok(u64::from_be_bytes(array))
}

pub fn encode_string(expire_at: u64, value: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(8 + value.len());
    buf.extend_from_slice(&expire_at.to_be_bytes());
    buf.extend_from_slice(value);
    buf
}

pub fn decode_string(raw: &[u8]) -> SourceResult<(u64, &[u8])> {
    if raw.len() < 8 {
        return Err(SourceError::Corruption(
            "string value shorter than its header".to_string(),
        ));
    }
    let (header, value) = raw.split_at(8);
    Ok((read_u64(header)?, value))
}

/// Collection metadata
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Meta {
    pub expire_at: u64,
    pub len: u64,
}

impl Meta {
    pub const fn is_live(&self, now: u64) -> bool {
        self.expire_at == 0 || self.expire_at > now
    }

    pub fn encode(&self) -> [u8; 16] {
        let mut buf = [0u8; 16];
        buf[..8].copy_from_slice(&self.expire_at.to_be_bytes());
        buf[8..].copy_from_slice(&self.len.to_be_bytes());
        buf
    }

    pub fn decode(raw: &[u8]) -> SourceResult<Self> {
        if raw.len() != 16 {
            return Err(SourceError::Corruption(format!(
                "meta value has {} bytes, expected 16",
                raw.len()
            )));
        }
        Ok(Self {
            expire_at: read_u64(&raw[..8])?,
            len: read_u64(&raw[8..])?,
        })
    }
}

/// Prefix shared by every data entry of one collection key
pub fn data_prefix(key: &[u8]) -> SourceResult<Vec<u8>> {
    let len = u32::try_from(key.len())
        .map_err(|_| SourceError::Backend("key longer than 4GiB".to_string()))?;
    let mut buf = Vec::with_capacity(4 + key.len() + 8);
    buf.extend_from_slice(&len.to_be_bytes());
    buf.extend_from_slice(key);
    Ok(buf)
}

pub fn data_key(prefix: &[u8], suffix: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(prefix.len() + suffix.len());
    buf.extend_from_slice(prefix);
    buf.extend_from_slice(suffix);
    buf
}

pub fn list_index_key(prefix: &[u8], index: u64) -> Vec<u8> {
    data_key(prefix, &index.to_be_bytes())
}

/// Map a score onto bytes whose lexicographic order matches numeric order
pub const fn sortable_score(score: f64) -> [u8; 8] {
    let bits = score.to_bits();
    let ordered = if bits >> 63 == 1 { !bits } else { bits ^ (1 << 63) };
    ordered.to_be_bytes()
}

pub fn unsortable_score(raw: &[u8]) -> SourceResult<f64> {
    let ordered = read_u64(raw)?;
    let bits = if ordered >> 63 == 1 {
        ordered ^ (1 << 63)
    } else {
        !ordered
    };
    Ok(f64::from_bits(bits))
}

pub fn score_key(prefix: &[u8], score: f64, member: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(prefix.len() + 8 + member.len());
    buf.extend_from_slice(prefix);
    buf.extend_from_slice(&sortable_score(score));
    buf.extend_from_slice(member);
    buf
}

pub fn decode_score_bits(raw: &[u8]) -> SourceResult<f64> {
    Ok(f64::from_bits(read_u64(raw)?))
}
