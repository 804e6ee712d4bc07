//! Scoring for retrieval and rescoring
//!
//! This module provides:
//! - Bm25Scorer: lexical scoring used by the index
//! - F1BleuRescorer: replaces raw BM25 scores with a bounded n-gram overlap
//! - ContextScorer: blends scores with a caller-supplied context vector
//! - cosine_similarity: sparse tf-idf vector similarity
//!
//! Rescorers are pure functions over `ScoreEntry` lists; none of them touch
//! the index.

use rustc_hash::FxHashMap;
use std::cmp::Ordering;
use tmstore_core::{ContextVector, ScoreEntry};

// ============================================================================
// Bm25Scorer
// ============================================================================

/// BM25 parameters
///
/// For each query term t:
/// score += IDF(t) * (tf * (k1 + 1)) / (tf + k1 * (1 - b + b * dl/avgdl))
///
/// IDF(t) = ln((N - df + 0.5) / (df + 0.5) + 1)
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Bm25Scorer {
    /// Term frequency saturation
    pub k1: f32,
    /// Length normalization strength
    pub b: f32,
}

impl Default for Bm25Scorer {
    fn default() -> Self {
        Bm25Scorer { k1: 1.2, b: 0.75 }
    }
}

impl Bm25Scorer {
    /// Smoothed inverse document frequency (always positive)
    pub fn idf(total_docs: usize, doc_freq: usize) -> f32 {
        let n = total_docs as f32;
        let df = doc_freq as f32;
        ((n - df + 0.5) / (df + 0.5) + 1.0).ln()
    }

    /// Contribution of one term to a document's score
    pub fn term_score(&self, idf: f32, tf: u32, doc_len: usize, avg_doc_len: f32) -> f32 {
        let tf = tf as f32;
        let dl = doc_len as f32;
        let avg = avg_doc_len.max(1.0);
        let norm = self.k1 * (1.0 - self.b + self.b * dl / avg);
        idf * (tf * (self.k1 + 1.0)) / (tf + norm)
    }
}

// ============================================================================
// F1BleuRescorer
// ============================================================================

/// Rescoring by F1 of smoothed n-gram precision and recall.
///
/// For orders 1..=N the clipped n-gram matches between the query and a
/// candidate's source words are smoothed as `(m + ε) / (len - n + 1 + ε)`.
/// Precision and recall are the geometric means over orders, and the
/// candidate's new score is their harmonic mean, in (0, 1].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct F1BleuRescorer {
    order: usize,
    epsilon: f64,
}

impl Default for F1BleuRescorer {
    fn default() -> Self {
        F1BleuRescorer {
            order: 4,
            epsilon: 0.1,
        }
    }
}

impl F1BleuRescorer {
    /// Create a rescorer with N = 4 and ε = 0.1
    pub fn new() -> Self {
        Self::default()
    }

    /// F1-BLEU between a query and one candidate (case-insensitive)
    pub fn score(&self, query: &[String], candidate: &[String]) -> f32 {
        let query: Vec<String> = query.iter().map(|w| w.to_lowercase()).collect();
        let candidate: Vec<String> = candidate.iter().map(|w| w.to_lowercase()).collect();
        let query_ngrams = self.ngrams(&query);
        self.score_against(&query_ngrams, query.len(), &candidate)
    }

    /// Replace every entry's score with its F1-BLEU against `query`.
    ///
    /// Does not reorder; ranking happens in [`ContextScorer::rescore`].
    pub fn rescore(&self, query: &[String], entries: &mut [ScoreEntry]) {
        let query: Vec<String> = query.iter().map(|w| w.to_lowercase()).collect();
        let query_ngrams = self.ngrams(&query);
        for entry in entries.iter_mut() {
            let candidate: Vec<String> = entry.source.iter().map(|w| w.to_lowercase()).collect();
            entry.score = self.score_against(&query_ngrams, query.len(), &candidate);
        }
    }

    fn score_against(
        &self,
        query_ngrams: &FxHashMap<&[String], u32>,
        query_len: usize,
        candidate: &[String],
    ) -> f32 {
        let candidate_ngrams = self.ngrams(candidate);

        let mut matches = vec![0u32; self.order];
        for (ngram, &count) in query_ngrams {
            let other = candidate_ngrams.get(ngram).copied().unwrap_or(0);
            matches[ngram.len() - 1] += count.min(other);
        }

        let mut precision = 0.0f64;
        let mut recall = 0.0f64;
        for n in 1..=self.order {
            let m = matches[n - 1];
            let candidate_total = (candidate.len() + 1).saturating_sub(n);
            let query_total = (query_len + 1).saturating_sub(n);
            precision += self.smooth(m, candidate_total).ln();
            recall += self.smooth(m, query_total).ln();
        }
        let precision = (precision / self.order as f64).exp();
        let recall = (recall / self.order as f64).exp();

        (2.0 * precision * recall / (precision + recall)) as f32
    }

    fn smooth(&self, num: u32, den: usize) -> f64 {
        (num as f64 + self.epsilon) / (den as f64 + self.epsilon)
    }

    fn ngrams<'a>(&self, words: &'a [String]) -> FxHashMap<&'a [String], u32> {
        let mut counts: FxHashMap<&'a [String], u32> = FxHashMap::default();
        for start in 0..words.len() {
            let max_order = self.order.min(words.len() - start);
            for n in 1..=max_order {
                *counts.entry(&words[start..start + n]).or_insert(0) += 1;
            }
        }
        counts
    }
}

// ============================================================================
// ContextScorer
// ============================================================================

/// How a raw score is combined with a context weight
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum BlendMode {
    /// `w · raw + (1 - w) · ctx`
    Linear {
        /// Weight of the raw lexical score, in [0, 1]
        lexical_weight: f32,
    },
    /// `raw · max(ctx, floor)`
    Multiply,
}

impl Default for BlendMode {
    fn default() -> Self {
        BlendMode::Linear {
            lexical_weight: 0.5,
        }
    }
}

/// Re-ranks candidates with the context vector of the current document.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ContextScorer {
    blend: BlendMode,
    default_weight: f32,
}

impl Default for ContextScorer {
    fn default() -> Self {
        ContextScorer {
            blend: BlendMode::default(),
            default_weight: 0.0,
        }
    }
}

impl ContextScorer {
    /// Create a scorer; `default_weight` applies to memories absent from the context
    pub fn new(blend: BlendMode, default_weight: f32) -> Self {
        ContextScorer {
            blend,
            default_weight,
        }
    }

    /// Blend mode in use
    pub fn blend(&self) -> BlendMode {
        self.blend
    }

    /// Blend each entry with its memory's context weight, re-sort
    /// descending (stable) and truncate to `limit`.
    ///
    /// Without a context (or with an empty one) scores are left untouched.
    pub fn rescore(
        &self,
        mut entries: Vec<ScoreEntry>,
        context: Option<&ContextVector>,
        limit: usize,
    ) -> Vec<ScoreEntry> {
        if let Some(context) = context.filter(|c| !c.is_empty()) {
            for entry in entries.iter_mut() {
                let weight = context
                    .weight_of(entry.memory)
                    .unwrap_or(self.default_weight);
                entry.score = self.combine(entry.score, weight);
            }
        }

        entries.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(Ordering::Equal));
        entries.truncate(limit);
        entries
    }

    fn combine(&self, raw: f32, weight: f32) -> f32 {
        match self.blend {
            BlendMode::Linear { lexical_weight } => {
                lexical_weight * raw + (1.0 - lexical_weight) * weight
            }
            BlendMode::Multiply => raw * weight.max(self.default_weight),
        }
    }
}

// ============================================================================
// Cosine similarity
// ============================================================================

/// Cosine similarity of two sparse vectors given by their norms and dot product.
pub fn cosine_similarity(dot: f64, norm_a: f64, norm_b: f64) -> f32 {
    if norm_a <= 0.0 || norm_b <= 0.0 {
        return 0.0;
    }
    (dot / (norm_a * norm_b)).clamp(0.0, 1.0) as f32
}
