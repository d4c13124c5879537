//! Expiration rules
//!
//! Strings carry an absolute expiration timestamp that has to be turned into
//! a relative `EX` against the engine clock. Collections report a relative
//! TTL directly.

use kvport_source::{KeyTtl, SourceResult};

/// What to do with a string record's stored expiration
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StringExpiry {
    /// Never expires, no `EX`
    Persistent,
    /// Expires in this many seconds
    Expires(u64),
    /// Already expired at `now`, skip the key
    Expired,
}

/// Classify a stored absolute `expire_at` against the engine clock
pub const fn string_expiry(expire_at: u64, now: u64) -> StringExpiry {
    if expire_at == 0 {
        StringExpiry::Persistent
    } else if expire_at <= now {
        StringExpiry::Expired
    } else {
        StringExpiry::Expires(expire_at - now)
    }
}

/// Seconds for a trailing `EXPIRE`, if the collection should get one
///
/// Only a strictly positive TTL produces one. A failed lookup is read as no
/// expiration.
pub fn collection_expiry(ttl: &SourceResult<KeyTtl>) -> Option<u64> {
    match ttl {
        Ok(KeyTtl::Seconds(secs)) if *secs > 0 => u64::try_from(*secs).ok(),
        _ => None,
    }
}
