//! Helpers shared by source backends

use std::ops::RangeInclusive;

use glob::Pattern;

use crate::{SourceError, SourceResult};

/// Compiled glob pattern for key scans
#[derive(Clone, Debug)]
pub struct KeyMatcher {
    pattern: Option<Pattern>,
}

impl KeyMatcher {
    /// Compile a glob pattern; `*` short-circuits to match everything
    pub fn new(pattern: &str) -> SourceResult<Self> {
        if pattern == crate::MATCH_ALL {
            return Ok(Self { pattern: None });
        }

        let pattern =
            Pattern::new(pattern).map_err(|e| SourceError::InvalidPattern(e.to_string()))?;

        Ok(Self {
            pattern: Some(pattern),
        })
    }

    /// Whether a key matches
    pub fn matches(&self, key: &[u8]) -> bool {
        match &self.pattern {
            None => true,
            Some(pattern) => pattern.matches(&String::from_utf8_lossy(key)),
        }
    }
}

/// Resolve list positions the way `LRANGE` does
///
/// Negative positions count from the tail. Returns `None` when the range
/// selects nothing.
pub fn resolve_range(len: usize, start: i64, stop: i64) -> Option<RangeInclusive<usize>> {
    let len = i64::try_from(len).ok()?;
    if len == 0 {
        return None;
    }

    let start = if start < 0 { (len + start).max(0) } else { start };
    let stop = if stop < 0 { len + stop } else { stop.min(len - 1) };

    if start > stop || start >= len || stop < 0 {
        return None;
    }

    Some(usize::try_from(start).ok()?..=usize::try_from(stop).ok()?)
}
