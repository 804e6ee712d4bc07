//! Retrieval for the translation memory store
//!
//! This crate provides:
//! - Analyzer trait and per-language StandardAnalyzer
//! - Immutable segments and the index manifest (on-disk formats)
//! - TranslationIndex: BM25 search and memory similarity per direction
//! - Scorers: BM25 parameters, F1-BLEU rescoring, context blending
//!
//! # Usage
//!
//! ```ignore
//! use tmstore_search::{AnalyzerRegistry, TranslationIndex};
//!
//! let index = TranslationIndex::open(&dir.join("index"))?;
//! let analyzer = AnalyzerRegistry::new().analyzer_for(&direction.source);
//! let results = index.search(&direction, &analyzer.terms("the cat sat"), 10, None)?;
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod analyzer;
pub mod index;
pub mod manifest;
pub mod scorer;
pub mod segment;

// Re-export commonly used types
pub use analyzer::{Analyzer, AnalyzerRegistry, StandardAnalyzer};
pub use index::{IndexStats, TranslationIndex};
pub use manifest::{ManifestData, MANIFEST_FILE_NAME};
pub use scorer::{BlendMode, Bm25Scorer, ContextScorer, F1BleuRescorer};
pub use segment::{IndexedDoc, Segment, SEGMENT_EXTENSION};
