//! Query-side types
//!
//! - ContextVector: caller-supplied domain weights used for rescoring
//! - ScoreEntry: one retrieved sentence pair with its score
//! - SearchResults: ranked entries plus execution metadata
//! - DumpEntry: one live sentence pair produced by a dump

use crate::types::{LanguageDirection, MemoryId};
use serde::{Deserialize, Serialize};

// ============================================================================
// ContextVector
// ============================================================================

/// Weight of one memory inside a context vector
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ContextEntry {
    /// Memory the weight applies to
    pub memory: MemoryId,
    /// Similarity of the memory to the current document, in [0, 1]
    pub weight: f32,
}

/// Ordered list of `(memory, weight)` pairs.
///
/// Produced by `context_vector_for` or supplied directly by the caller.
/// Never persisted.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ContextVector {
    entries: Vec<ContextEntry>,
    /// The scan that produced the vector stopped at its deadline
    #[serde(default)]
    truncated: bool,
}

impl ContextVector {
    /// Create an empty context vector
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from `(memory, weight)` pairs; weights are clamped to [0, 1]
    pub fn from_pairs<I>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (MemoryId, f32)>,
    {
        let entries = pairs
            .into_iter()
            .map(|(memory, weight)| ContextEntry {
                memory,
                weight: clamp_weight(weight),
            })
            .collect();
        ContextVector {
            entries,
            truncated: false,
        }
    }

    /// Builder: mark the vector as partial
    pub fn with_truncated(mut self, truncated: bool) -> Self {
        self.truncated = truncated;
        self
    }

    /// True if only part of the memories were compared
    pub fn is_truncated(&self) -> bool {
        self.truncated
    }

    /// Builder: append a weight
    pub fn with(mut self, memory: MemoryId, weight: f32) -> Self {
        self.entries.push(ContextEntry {
            memory,
            weight: clamp_weight(weight),
        });
        self
    }

    /// Weight of a memory, if present. The first entry wins on duplicates.
    pub fn weight_of(&self, memory: MemoryId) -> Option<f32> {
        self.entries
            .iter()
            .find(|e| e.memory == memory)
            .map(|e| e.weight)
    }

    /// Entries in insertion order
    pub fn entries(&self) -> &[ContextEntry] {
        &self.entries
    }

    /// Check if the vector has no entries
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Number of entries
    pub fn len(&self) -> usize {
        self.entries.len()
    }
}

fn clamp_weight(weight: f32) -> f32 {
    if weight.is_nan() {
        0.0
    } else {
        weight.clamp(0.0, 1.0)
    }
}

// ============================================================================
// ScoreEntry
// ============================================================================

/// A retrieved sentence pair.
///
/// Lists of entries are ordered by descending score, ties by insertion order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoreEntry {
    /// Memory the pair belongs to
    pub memory: MemoryId,
    /// Source sentence words
    pub source: Vec<String>,
    /// Target sentence words
    pub target: Vec<String>,
    /// Relevance score
    pub score: f32,
}

impl ScoreEntry {
    /// Create a new entry
    pub fn new(memory: MemoryId, source: Vec<String>, target: Vec<String>, score: f32) -> Self {
        ScoreEntry {
            memory,
            source,
            target,
            score,
        }
    }
}

// ============================================================================
// SearchStats
// ============================================================================

/// Execution statistics for a query
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SearchStats {
    /// Time spent in the query (microseconds)
    pub elapsed_micros: u64,

    /// Documents that matched at least one query term
    pub candidates_considered: usize,

    /// Segments fully scanned before returning
    pub segments_scanned: usize,
}

impl SearchStats {
    /// Create new SearchStats
    pub fn new(elapsed_micros: u64, candidates: usize, segments: usize) -> Self {
        SearchStats {
            elapsed_micros,
            candidates_considered: candidates,
            segments_scanned: segments,
        }
    }
}

// ============================================================================
// SearchResults
// ============================================================================

/// Ranked query results
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SearchResults {
    /// Ranked entries (highest score first)
    pub entries: Vec<ScoreEntry>,

    /// True if the deadline cut the scan short
    pub truncated: bool,

    /// Execution statistics
    pub stats: SearchStats,
}

impl SearchResults {
    /// Create an empty result
    pub fn empty() -> Self {
        Self::default()
    }

    /// Create a new result
    pub fn new(entries: Vec<ScoreEntry>, truncated: bool, stats: SearchStats) -> Self {
        SearchResults {
            entries,
            truncated,
            stats,
        }
    }

    /// Check if there are no entries
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Number of entries
    pub fn len(&self) -> usize {
        self.entries.len()
    }
}

// ============================================================================
// DumpEntry
// ============================================================================

/// One live sentence pair visited by a dump
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DumpEntry {
    /// Memory the pair belongs to
    pub memory: MemoryId,
    /// Direction the pair is indexed under
    pub direction: LanguageDirection,
    /// Source sentence
    pub source: String,
    /// Target sentence
    pub target: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_context_vector_lookup() {
        let ctx = ContextVector::new()
            .with(MemoryId(1), 0.9)
            .with(MemoryId(2), 0.1)
            .with(MemoryId(1), 0.3);

        assert_eq!(ctx.len(), 3);
        assert_eq!(ctx.weight_of(MemoryId(1)), Some(0.9));
        assert_eq!(ctx.weight_of(MemoryId(2)), Some(0.1));
        assert_eq!(ctx.weight_of(MemoryId(3)), None);
    }

    #[test]
    fn test_context_vector_clamps() {
        let ctx = ContextVector::from_pairs(vec![
            (MemoryId(1), 1.5),
            (MemoryId(2), -0.2),
            (MemoryId(3), f32::NAN),
        ]);
        assert_eq!(ctx.weight_of(MemoryId(1)), Some(1.0));
        assert_eq!(ctx.weight_of(MemoryId(2)), Some(0.0));
        assert_eq!(ctx.weight_of(MemoryId(3)), Some(0.0));
        assert!(!ctx.is_truncated());
        assert!(ctx.with_truncated(true).is_truncated());
    }

    #[test]
    fn test_search_results_empty() {
        let results = SearchResults::empty();
        assert!(results.is_empty());
        assert!(!results.truncated);
        assert_eq!(results.stats, SearchStats::default());
    }
}
