//! Migration settings

use std::fmt::{self, Display};
use std::str::FromStr;

use kvport_source::DataType;
use serde::Deserialize;

use crate::{MigrateError, MigrateResult};

/// Upper bound for the scan page size derived from the batch unit
pub const MAX_SCAN_PAGE_SIZE: usize = 30_000;

/// How commands pick a sender
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RoutingPolicy {
    /// Every command carries its key, so all commands of a key share a sender
    #[default]
    ByKey,
    /// Only list data commands carry their key; everything else round-robins
    ListsOnly,
    /// No command carries a key
    RoundRobin,
}

impl RoutingPolicy {
    /// Whether a command for `data_type` should be routed by its key
    ///
    /// `data` is true for the element-carrying commands (`SET`, `RPUSH`, ...)
    /// and false for the trailing `EXPIRE`.
    pub const fn routes_by_key(self, data_type: DataType, data: bool) -> bool {
        match self {
            Self::ByKey => true,
            Self::ListsOnly => data && matches!(data_type, DataType::Lists),
            Self::RoundRobin => false,
        }
    }

    const fn as_str(self) -> &'static str {
        match self {
            Self::ByKey => "by-key",
            Self::ListsOnly => "lists-only",
            Self::RoundRobin => "round-robin",
        }
    }
}

impl Display for RoutingPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RoutingPolicy {
    type Err = MigrateError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "by-key" => Ok(Self::ByKey),
            "lists-only" => Ok(Self::ListsOnly),
            "round-robin" => Ok(Self::RoundRobin),
            other => Err(MigrateError::Config(format!(
                "unknown routing policy '{other}' (expected by-key, lists-only or round-robin)"
            ))),
        }
    }
}

/// Which view of the key space a type is read from
#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Consistency {
    /// One point-in-time view held for the whole run
    Snapshot,
    /// A resumable cursor over the live key space
    Live,
}

impl Display for Consistency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Snapshot => "snapshot",
            Self::Live => "live",
        })
    }
}

impl FromStr for Consistency {
    type Err = MigrateError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "snapshot" => Ok(Self::Snapshot),
            "live" => Ok(Self::Live),
            other => Err(MigrateError::Config(format!(
                "unknown consistency '{other}' (expected snapshot or live)"
            ))),
        }
    }
}

/// Settings shared by every coordinator of a run
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct MigrationConfig {
    /// Collection fetch window and per-command element count
    pub sync_batch_num: usize,

    /// Which commands carry a routing key
    pub routing: RoutingPolicy,

    /// View the string type is read from
    pub string_consistency: Consistency,

    /// View the four collection types are read from; only `live` is supported
    pub collection_consistency: Consistency,

    /// Consecutive failed page fetches tolerated at one cursor position
    pub max_scan_retries: u32,
}

impl Default for MigrationConfig {
    fn default() -> Self {
        Self {
            sync_batch_num: 512,
            routing: RoutingPolicy::default(),
            string_consistency: Consistency::Snapshot,
            collection_consistency: Consistency::Live,
            max_scan_retries: 3,
        }
    }
}

impl MigrationConfig {
    /// Reject settings a run cannot honour
    ///
    /// # Errors
    ///
    /// Returns [`MigrateError::Config`] for a zero batch unit or a snapshot
    /// view requested for collections.
    pub fn validate(&self) -> MigrateResult<()> {
        if self.sync_batch_num == 0 {
            return Err(MigrateError::Config(
                "sync_batch_num must be greater than zero".to_string(),
            ));
        }

        if self.collection_consistency == Consistency::Snapshot {
            return Err(MigrateError::Config(
                "snapshot consistency is only available for strings".to_string(),
            ));
        }

        Ok(())
    }

    /// Page size hint passed to every cursor scan
    pub const fn scan_page_size(&self) -> usize {
        let unit = self.sync_batch_num;
        let tenfold = unit.saturating_mul(10);
        if tenfold <= MAX_SCAN_PAGE_SIZE {
            tenfold
        } else if unit < MAX_SCAN_PAGE_SIZE {
            MAX_SCAN_PAGE_SIZE
        } else {
            unit.saturating_mul(2)
        }
    }

    /// View a data type is read from
    pub const fn consistency(&self, data_type: DataType) -> Consistency {
        match data_type {
            DataType::Strings => self.string_consistency,
            _ => self.collection_consistency,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn with_unit(unit: usize) -> MigrationConfig {
        MigrationConfig {
            sync_batch_num: unit,
            ..MigrationConfig::default()
        }
    }

    #[test]
    fn test_scan_page_size() {
        assert_eq!(with_unit(1).scan_page_size(), 10);
        assert_eq!(with_unit(512).scan_page_size(), 5120);
        assert_eq!(with_unit(3000).scan_page_size(), 30_000);
        assert_eq!(with_unit(3001).scan_page_size(), 30_000);
        assert_eq!(with_unit(29_999).scan_page_size(), 30_000);
        assert_eq!(with_unit(30_000).scan_page_size(), 60_000);
        assert_eq!(with_unit(50_000).scan_page_size(), 100_000);
    }

    #[test]
    fn test_validate() {
        assert!(MigrationConfig::default().validate().is_ok());
        assert!(matches!(
            with_unit(0).validate(),
            Err(MigrateError::Config(_))
        ));

        let config = MigrationConfig {
            collection_consistency: Consistency::Snapshot,
            ..MigrationConfig::default()
        };
        assert!(matches!(config.validate(), Err(MigrateError::Config(_))));
    }

    #[test]
    fn test_routing_policy() {
        use DataType::*;

        for data_type in DataType::ALL {
            assert!(RoutingPolicy::ByKey.routes_by_key(data_type, true));
            assert!(RoutingPolicy::ByKey.routes_by_key(data_type, false));
            assert!(!RoutingPolicy::RoundRobin.routes_by_key(data_type, true));
        }

        assert!(RoutingPolicy::ListsOnly.routes_by_key(Lists, true));
        assert!(!RoutingPolicy::ListsOnly.routes_by_key(Lists, false));
        assert!(!RoutingPolicy::ListsOnly.routes_by_key(Hashes, true));
        assert!(!RoutingPolicy::ListsOnly.routes_by_key(Strings, true));

        assert_eq!(
            "lists-only".parse::<RoutingPolicy>().unwrap(),
            RoutingPolicy::ListsOnly
        );
        assert!("sticky".parse::<RoutingPolicy>().is_err());
    }

    #[test]
    fn test_consistency_per_type() {
        let config = MigrationConfig {
            string_consistency: Consistency::Live,
            ..MigrationConfig::default()
        };
        assert_eq!(config.consistency(DataType::Strings), Consistency::Live);
        assert_eq!(config.consistency(DataType::ZSets), Consistency::Live);
        assert_eq!(
            MigrationConfig::default().consistency(DataType::Strings),
            Consistency::Snapshot
        );
    }
}
