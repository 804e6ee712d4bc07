//! Durability mode configuration
//!
//! Controls bucket and ledger sync behavior (Cache, Standard, Always).

use std::fmt;
use std::str::FromStr;
use tmstore_core::Error;

/// Durability mode for bucket appends
///
/// # Modes
///
/// | Mode | fsync | Data Loss Window |
/// |------|-------|-----------------|
/// | Cache | Never (no files) | Everything not yet indexed |
/// | Always | Every append | Zero |
/// | Standard | Periodic | Up to interval/batch |
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DurabilityMode {
    /// Buckets and ledger live in memory only.
    ///
    /// Use case: tests and throwaway stores.
    Cache,

    /// fsync after every append (slow, maximum durability)
    Always,

    /// fsync every N appends OR every T milliseconds (the default)
    Standard {
        /// Maximum time between fsyncs in milliseconds
        interval_ms: u64,
        /// Maximum appends between fsyncs
        batch_size: usize,
    },
}

impl DurabilityMode {
    /// Check if this mode keeps files on disk
    ///
    /// Returns false for Cache mode, true for all others.
    pub fn requires_files(&self) -> bool {
        !matches!(self, DurabilityMode::Cache)
    }

    /// Check if this mode requires an fsync on every append
    pub fn requires_immediate_fsync(&self) -> bool {
        matches!(self, DurabilityMode::Always)
    }

    /// Human-readable description of the mode
    pub fn description(&self) -> &'static str {
        match self {
            DurabilityMode::Cache => "Cache (fastest, buffered data lost on crash)",
            DurabilityMode::Always => "Always sync (safest, slowest)",
            DurabilityMode::Standard { .. } => "Standard (balanced speed/safety)",
        }
    }

    /// Standard mode with `interval_ms = 100` and `batch_size = 1000`
    pub fn standard_default() -> Self {
        DurabilityMode::Standard {
            interval_ms: 100,
            batch_size: 1000,
        }
    }
}

impl Default for DurabilityMode {
    fn default() -> Self {
        Self::standard_default()
    }
}

impl FromStr for DurabilityMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "standard" => Ok(DurabilityMode::standard_default()),
            "always" => Ok(DurabilityMode::Always),
            "cache" => Ok(DurabilityMode::Cache),
            other => Err(Error::config(format!(
                "invalid durability mode '{}', expected \"standard\", \"always\" or \"cache\"",
                other
            ))),
        }
    }
}

impl fmt::Display for DurabilityMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DurabilityMode::Cache => f.write_str("cache"),
            DurabilityMode::Always => f.write_str("always"),
            DurabilityMode::Standard { .. } => f.write_str("standard"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_standard() {
        assert_eq!(
            DurabilityMode::default(),
            DurabilityMode::Standard {
                interval_ms: 100,
                batch_size: 1000
            }
        );
    }

    #[test]
    fn test_mode_flags() {
        assert!(!DurabilityMode::Cache.requires_files());
        assert!(DurabilityMode::Always.requires_files());
        assert!(DurabilityMode::Always.requires_immediate_fsync());
        assert!(!DurabilityMode::standard_default().requires_immediate_fsync());
    }

    #[test]
    fn test_parse() {
        assert_eq!("always".parse::<DurabilityMode>().unwrap(), DurabilityMode::Always);
        assert_eq!("CACHE".parse::<DurabilityMode>().unwrap(), DurabilityMode::Cache);
        assert!(matches!(
            "standard".parse::<DurabilityMode>().unwrap(),
            DurabilityMode::Standard { .. }
        ));
        let err = "sometimes".parse::<DurabilityMode>().unwrap_err();
        assert!(err.to_string().contains("sometimes"));
    }
}
