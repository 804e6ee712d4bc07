//! Ingestion-time unit filters
//!
//! An [`AlignmentFilter`] decides whether a well-formed unit is worth
//! indexing, usually from the confidence the external aligner attached to
//! it. Rejected units are counted and their offset is committed.

use std::collections::BTreeMap;
use tmstore_core::{LanguageDirection, TranslationUnit};

/// Accept/reject decision for incoming units
pub trait AlignmentFilter: Send + Sync {
    /// True if the unit should be indexed
    fn accept(&self, unit: &TranslationUnit) -> bool;

    /// Name for logging
    fn name(&self) -> &str {
        "alignment-filter"
    }
}

/// Accepts every unit
#[derive(Debug, Clone, Copy, Default)]
pub struct AcceptAll;

impl AlignmentFilter for AcceptAll {
    fn accept(&self, _unit: &TranslationUnit) -> bool {
        true
    }

    fn name(&self) -> &str {
        "accept-all"
    }
}

/// Rejects units whose alignment score is below a per-direction threshold.
///
/// Units without an alignment are accepted.
#[derive(Debug, Clone, Default)]
pub struct ThresholdAlignmentFilter {
    default_threshold: f32,
    thresholds: BTreeMap<LanguageDirection, f32>,
    mask_language_region: bool,
}

impl ThresholdAlignmentFilter {
    /// Filter with one threshold for every direction
    pub fn new(default_threshold: f32) -> Self {
        ThresholdAlignmentFilter {
            default_threshold,
            ..Self::default()
        }
    }

    /// Builder: threshold for one direction
    pub fn with_threshold(mut self, direction: LanguageDirection, threshold: f32) -> Self {
        self.thresholds.insert(direction, threshold);
        self
    }

    /// Builder: look thresholds up by primary language only
    pub fn with_region_masking(mut self, mask: bool) -> Self {
        self.mask_language_region = mask;
        self
    }

    /// Threshold applied to `direction`
    pub fn threshold_for(&self, direction: &LanguageDirection) -> f32 {
        let key = if self.mask_language_region {
            direction.masked()
        } else {
            direction.clone()
        };
        self.thresholds
            .get(&key)
            .copied()
            .unwrap_or(self.default_threshold)
    }
}

impl AlignmentFilter for ThresholdAlignmentFilter {
    fn accept(&self, unit: &TranslationUnit) -> bool {
        match &unit.alignment {
            Some(alignment) => alignment.score >= self.threshold_for(&unit.direction),
            None => true,
        }
    }

    fn name(&self) -> &str {
        "threshold"
    }
}
