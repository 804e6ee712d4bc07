//! tmstore - Crash-recoverable translation memory and context store
//!
//! tmstore ingests an ordered, multi-channel stream of bilingual sentence
//! pairs and deletions, buffers them durably, and indexes them per language
//! direction for fuzzy-match retrieval and context vectors.
//!
//! # Quick Start
//!
//! ```ignore
//! use tmstore::{ContextVector, DataListener, MemoryId, TranslationMemoryStore, TranslationUnit};
//!
//! let store = TranslationMemoryStore::open("/data/tm")?;
//! let direction = "en:es".parse()?;
//!
//! store.gateway().on_unit(&TranslationUnit::new(
//!     0, 0, MemoryId(1), direction, "the cat sat", "el gato se sentó",
//! ))?;
//! store.flush_all()?;
//!
//! let context = store.context_vector_for(&"en:es".parse()?, "a story about a cat", 10, None)?;
//! let results = store.search(&"en:es".parse()?, "the cat sat", Some(&context), 5, None)?;
//! ```
//!
//! # Architecture
//!
//! - `tmstore-core`: domain types, errors, limits
//! - `tmstore-durability`: channel ledger and bucket files
//! - `tmstore-search`: analyzers, segmented index, scorers
//! - `tmstore-engine`: gateway, registry, scheduler, store facade

pub use tmstore_core::{
    Alignment, ChannelId, ContextEntry, ContextVector, Deletion, DumpEntry, Error, Language,
    LanguageDirection, LimitError, Limits, MemoryId, Offset, Result, ScoreEntry, SearchResults,
    SearchStats, Side, TranslationUnit,
};
pub use tmstore_durability::DurabilityMode;
pub use tmstore_engine::{
    AcceptAll, AlignmentFilter, DataListener, GatewayStats, Ingested, IngestionGateway,
    StoreBuilder, StoreConfig, StoreStats, ThresholdAlignmentFilter, TranslationMemoryStore,
};
pub use tmstore_search::{Analyzer, AnalyzerRegistry, BlendMode, StandardAnalyzer};
