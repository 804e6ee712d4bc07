//! Store configuration via `tmstore.toml`
//!
//! On first open a default `tmstore.toml` is written to the store root. To
//! change settings, edit the file and reopen the store.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::time::Duration;
use tmstore_core::{Error, Language, LanguageDirection, Result};
use tmstore_durability::{DurabilityMode, RetryPolicy};
use tmstore_search::BlendMode;

/// Config file name placed in the store root.
pub const CONFIG_FILE_NAME: &str = "tmstore.toml";

/// Alignment filter thresholds (`[alignment]` section).
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AlignmentConfig {
    /// Minimum alignment score for directions without their own threshold
    pub default_threshold: f32,
    /// Per-direction thresholds, keyed `"en-it"` or `"en-US:it"`
    pub thresholds: BTreeMap<String, f32>,
}

/// Store configuration loaded from `tmstore.toml`.
///
/// # Example
///
/// ```toml
/// durability = "standard"
/// direction_symmetric = true
/// languages = ["en-es", "en-it"]
///
/// [alignment]
/// default_threshold = 0.0
///
/// [alignment.thresholds]
/// "en-it" = 0.3
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct StoreConfig {
    /// Durability mode: `"standard"`, `"always"` or `"cache"`.
    pub durability: String,
    /// Also index every unit under the reversed direction.
    pub direction_symmetric: bool,
    /// Drop region subtags (`en-US` → `en`) when keying buckets and partitions.
    pub mask_language_region: bool,
    /// Flush a bucket once it holds this many records.
    pub max_bucket_records: usize,
    /// Flush a bucket once its records take this many bytes.
    pub max_bucket_bytes: u64,
    /// Flush a non-empty bucket once its oldest record is this old.
    pub max_bucket_age_ms: u64,
    /// Period of the flush ticker.
    pub flush_interval_ms: u64,
    /// Worker threads of the background scheduler.
    pub background_threads: usize,
    /// Capacity of the background queue.
    pub max_queue_depth: usize,
    /// Segments per direction above which an optimize is scheduled.
    pub max_segments_per_direction: usize,
    /// Minimum number of index candidates fetched per query.
    pub min_query_size: usize,
    /// Context weight of memories absent from the context vector.
    pub default_context_weight: f32,
    /// Context blend: `"linear"` or `"multiply"`.
    pub context_blend: String,
    /// Weight of the lexical score in linear blending.
    pub lexical_weight: f32,
    /// Rescore candidates with F1-BLEU before blending.
    pub f1_bleu_rescoring: bool,
    /// Served directions; `None` serves every direction.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub languages: Option<Vec<String>>,
    /// Retries of a transient bucket write.
    pub retry_attempts: usize,
    /// Base backoff between retries.
    pub retry_backoff_ms: u64,
    /// Alignment filter thresholds.
    pub alignment: AlignmentConfig,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            durability: "standard".to_string(),
            direction_symmetric: false,
            mask_language_region: true,
            max_bucket_records: 1000,
            max_bucket_bytes: 8 * 1024 * 1024,
            max_bucket_age_ms: 5_000,
            flush_interval_ms: 1_000,
            background_threads: 2,
            max_queue_depth: 1024,
            max_segments_per_direction: 16,
            min_query_size: 10,
            default_context_weight: 0.0,
            context_blend: "linear".to_string(),
            lexical_weight: 0.5,
            f1_bleu_rescoring: true,
            languages: None,
            retry_attempts: 3,
            retry_backoff_ms: 10,
            alignment: AlignmentConfig::default(),
        }
    }
}

impl StoreConfig {
    /// Parse the durability string into a `DurabilityMode`.
    pub fn durability_mode(&self) -> Result<DurabilityMode> {
        self.durability.parse()
    }

    /// Parse the context blend settings.
    pub fn blend_mode(&self) -> Result<BlendMode> {
        match self.context_blend.to_ascii_lowercase().as_str() {
            "linear" => Ok(BlendMode::Linear {
                lexical_weight: self.lexical_weight,
            }),
            "multiply" => Ok(BlendMode::Multiply),
            other => Err(Error::config(format!(
                "Invalid context_blend '{}' in {}. Expected \"linear\" or \"multiply\".",
                other, CONFIG_FILE_NAME
            ))),
        }
    }

    /// Retry policy for transient bucket writes.
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new()
            .with_max_retries(self.retry_attempts)
            .with_base_delay_ms(self.retry_backoff_ms)
    }

    /// Maximum age of a non-empty bucket.
    pub fn max_bucket_age(&self) -> Duration {
        Duration::from_millis(self.max_bucket_age_ms)
    }

    /// Period of the flush ticker.
    pub fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.flush_interval_ms)
    }

    /// Served directions, `None` when unrestricted.
    pub fn allowed_directions(&self) -> Result<Option<BTreeSet<LanguageDirection>>> {
        let Some(languages) = &self.languages else {
            return Ok(None);
        };
        let mut directions = BTreeSet::new();
        for key in languages {
            let direction = parse_direction_key(key)?;
            directions.insert(self.key_direction(&direction));
        }
        Ok(Some(directions))
    }

    /// Per-direction alignment thresholds.
    pub fn alignment_thresholds(&self) -> Result<BTreeMap<LanguageDirection, f32>> {
        self.alignment
            .thresholds
            .iter()
            .map(|(key, &threshold)| {
                let direction = parse_direction_key(key)?;
                Ok((self.key_direction(&direction), threshold))
            })
            .collect()
    }

    /// Direction used as bucket and partition key (region masking applied).
    pub fn key_direction(&self, direction: &LanguageDirection) -> LanguageDirection {
        if self.mask_language_region {
            direction.masked()
        } else {
            direction.clone()
        }
    }

    /// Check every value; called on load so mistakes surface at open.
    pub fn validate(&self) -> Result<()> {
        self.durability_mode()?;
        self.blend_mode()?;
        self.allowed_directions()?;
        self.alignment_thresholds()?;

        check_unit("lexical_weight", self.lexical_weight)?;
        check_unit("default_context_weight", self.default_context_weight)?;
        check_unit("alignment.default_threshold", self.alignment.default_threshold)?;
        for (key, &threshold) in &self.alignment.thresholds {
            check_unit(&format!("alignment.thresholds.\"{}\"", key), threshold)?;
        }

        for (name, value) in [
            ("max_bucket_records", self.max_bucket_records as u64),
            ("max_bucket_bytes", self.max_bucket_bytes),
            ("flush_interval_ms", self.flush_interval_ms),
            ("background_threads", self.background_threads as u64),
            ("max_queue_depth", self.max_queue_depth as u64),
            ("max_segments_per_direction", self.max_segments_per_direction as u64),
            ("min_query_size", self.min_query_size as u64),
        ] {
            if value == 0 {
                return Err(Error::config(format!(
                    "{} must be greater than zero in {}",
                    name, CONFIG_FILE_NAME
                )));
            }
        }
        Ok(())
    }

    /// Returns the default config file content with comments.
    pub fn default_toml() -> &'static str {
        r#"# Translation memory store configuration
#
# Durability mode: "standard" (default), "always" or "cache"
#   "standard" = periodic fsync (~100ms), may lose the last interval on crash
#   "always"   = fsync every append, zero data loss
#   "cache"    = no files at all
durability = "standard"

# Also index every unit under the reversed direction (it:en for en:it)
direction_symmetric = false

# Key buckets and index partitions by primary language only (en-US -> en)
mask_language_region = true

# A bucket is flushed into the index when any of these is crossed
max_bucket_records = 1000
max_bucket_bytes = 8388608
max_bucket_age_ms = 5000

# Flush ticker period and background workers
flush_interval_ms = 1000
background_threads = 2
max_queue_depth = 1024

# Merge a direction's segments once it has more than this many
max_segments_per_direction = 16

# Search: candidates fetched are max(min_query_size, 2 * limit)
min_query_size = 10
f1_bleu_rescoring = true

# Context blending: "linear" (lexical_weight * score + (1 - lexical_weight) * context)
# or "multiply" (score * max(context, default_context_weight))
context_blend = "linear"
lexical_weight = 0.5
default_context_weight = 0.0

# Transient I/O retries when buffering a unit
retry_attempts = 3
retry_backoff_ms = 10

# Served directions (all when absent)
# languages = ["en-es", "en-it"]

[alignment]
# Units whose alignment score is below the threshold are filtered out
default_threshold = 0.0

# [alignment.thresholds]
# "en-it" = 0.3
"#
    }

    /// Read and parse config from a file path.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            Error::config(format!(
                "Failed to read config file '{}': {}",
                path.display(),
                e
            ))
        })?;
        let config: StoreConfig = toml::from_str(&content).map_err(|e| {
            Error::config(format!(
                "Failed to parse config file '{}': {}",
                path.display(),
                e
            ))
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Write the default config file if it does not already exist.
    pub fn write_default_if_missing(path: &Path) -> Result<()> {
        if !path.exists() {
            std::fs::write(path, Self::default_toml()).map_err(|e| {
                Error::config(format!(
                    "Failed to write default config file '{}': {}",
                    path.display(),
                    e
                ))
            })?;
        }
        Ok(())
    }

    /// Serialize this config to TOML and write it to the given path.
    pub fn write_to_file(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| Error::config(format!("Failed to serialize config: {}", e)))?;
        std::fs::write(path, content).map_err(|e| {
            Error::config(format!(
                "Failed to write config file '{}': {}",
                path.display(),
                e
            ))
        })
    }
}

fn check_unit(name: &str, value: f32) -> Result<()> {
    if !(0.0..=1.0).contains(&value) {
        return Err(Error::config(format!(
            "{} must be within [0, 1], got {}",
            name, value
        )));
    }
    Ok(())
}

/// Parse a direction written as `en:it`, `en-US:it` or the shorthand `en-it`.
pub fn parse_direction_key(key: &str) -> Result<LanguageDirection> {
    if key.contains(':') {
        return key
            .parse()
            .map_err(|_| Error::config(format!("Invalid language direction '{}'", key)));
    }
    match key.split_once('-') {
        Some((source, target)) if !target.contains('-') => {
            let source: Language = source
                .parse()
                .map_err(|_| Error::config(format!("Invalid language direction '{}'", key)))?;
            let target: Language = target
                .parse()
                .map_err(|_| Error::config(format!("Invalid language direction '{}'", key)))?;
            Ok(LanguageDirection::new(source, target))
        }
        _ => Err(Error::config(format!(
            "Invalid language direction '{}': use \"src:tgt\" when a side has a region",
            key
        ))),
    }
}
