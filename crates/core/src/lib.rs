//! Core types for the translation memory store
//!
//! This crate defines the foundational types used throughout the system:
//! - MemoryId / ChannelId / Offset: identifiers carried by stream records
//! - Language / LanguageDirection: partition keys
//! - TranslationUnit / Deletion: ingested records
//! - ContextVector / ScoreEntry / SearchResults: query types
//! - Limits: size limits applied at ingestion
//! - Error: error type hierarchy

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod error;
pub mod limits;
pub mod search_types;
pub mod types;

pub use error::{Error, Result};
pub use limits::{LimitError, Limits, Side};
pub use search_types::{
    ContextEntry, ContextVector, DumpEntry, ScoreEntry, SearchResults, SearchStats,
};
pub use types::{
    Alignment, ChannelId, Deletion, Language, LanguageDirection, MemoryId, Offset,
    TranslationUnit,
};
