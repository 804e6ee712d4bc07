//! Core domain types
//!
//! - `ChannelId` / `Offset`: position of a record in the upstream stream
//! - `MemoryId`: opaque identifier of a translation memory (domain)
//! - `Language` / `LanguageDirection`: partition keys for buckets and index
//! - `TranslationUnit` / `Deletion`: the two record kinds delivered by the stream

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::Error;

/// Identifier of an upstream ingestion channel
pub type ChannelId = u16;

/// Monotonic position of a record inside its channel
pub type Offset = u64;

// ============================================================================
// MemoryId
// ============================================================================

/// Opaque identifier of a memory (domain).
///
/// The store has no knowledge of the memory's owner or name; those live in
/// an external metadata store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MemoryId(pub u64);

impl MemoryId {
    /// Raw numeric value
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl From<u64> for MemoryId {
    fn from(id: u64) -> Self {
        MemoryId(id)
    }
}

impl fmt::Display for MemoryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ============================================================================
// Language
// ============================================================================

/// A language tag such as `en`, `it` or `en-US`.
///
/// Tags are normalized on construction: the primary subtag is lowercased,
/// a two-letter region is uppercased, anything else is kept lowercase.
/// `_` is accepted as a separator and rewritten to `-`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Language {
    tag: String,
}

impl Language {
    /// Create a language from a tag, normalizing its case.
    ///
    /// Panics on an empty tag; use `FromStr` for untrusted input.
    pub fn new(tag: &str) -> Self {
        match Self::parse(tag) {
            Some(lang) => lang,
            None => panic!("invalid language tag: {:?}", tag),
        }
    }

    fn parse(tag: &str) -> Option<Self> {
        let tag = tag.trim();
        if tag.is_empty() {
            return None;
        }

        let mut parts = tag.split(|c| c == '-' || c == '_');
        let primary = parts.next()?.to_ascii_lowercase();
        if primary.is_empty() || !primary.chars().all(|c| c.is_ascii_alphabetic()) {
            return None;
        }

        let mut normalized = primary;
        for part in parts {
            if part.is_empty() || !part.chars().all(|c| c.is_ascii_alphanumeric()) {
                return None;
            }
            normalized.push('-');
            if part.len() == 2 && part.chars().all(|c| c.is_ascii_alphabetic()) {
                normalized.push_str(&part.to_ascii_uppercase());
            } else {
                normalized.push_str(&part.to_ascii_lowercase());
            }
        }

        Some(Language { tag: normalized })
    }

    /// Full normalized tag (e.g. `en-US`)
    pub fn tag(&self) -> &str {
        &self.tag
    }

    /// Primary language subtag (e.g. `en` for `en-US`)
    pub fn language(&self) -> &str {
        self.tag.split('-').next().unwrap_or(&self.tag)
    }

    /// Region subtag if present (e.g. `US` for `en-US`)
    pub fn region(&self) -> Option<&str> {
        self.tag
            .split('-')
            .skip(1)
            .find(|p| p.len() == 2 && p.chars().all(|c| c.is_ascii_uppercase()))
    }

    /// The language with every subtag but the primary one removed
    pub fn masked(&self) -> Language {
        Language {
            tag: self.language().to_string(),
        }
    }
}

impl FromStr for Language {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s).ok_or_else(|| Error::invalid_input(format!("invalid language tag: {:?}", s)))
    }
}

impl TryFrom<String> for Language {
    type Error = Error;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<Language> for String {
    fn from(lang: Language) -> Self {
        lang.tag
    }
}

impl fmt::Display for Language {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.tag)
    }
}

// ============================================================================
// LanguageDirection
// ============================================================================

/// Ordered (source, target) language pair.
///
/// Displayed and parsed as `source:target`, e.g. `en:it` or `en-US:it`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct LanguageDirection {
    /// Source language
    pub source: Language,
    /// Target language
    pub target: Language,
}

impl LanguageDirection {
    /// Create a new direction
    pub fn new(source: Language, target: Language) -> Self {
        LanguageDirection { source, target }
    }

    /// The same pair in the opposite direction
    pub fn reversed(&self) -> LanguageDirection {
        LanguageDirection {
            source: self.target.clone(),
            target: self.source.clone(),
        }
    }

    /// Direction with region subtags removed from both languages
    pub fn masked(&self) -> LanguageDirection {
        LanguageDirection {
            source: self.source.masked(),
            target: self.target.masked(),
        }
    }

    /// File-system friendly name, e.g. `en-US__it`
    pub fn file_stem(&self) -> String {
        format!("{}__{}", self.source, self.target)
    }

    /// Parse a name produced by [`LanguageDirection::file_stem`]
    pub fn from_file_stem(stem: &str) -> Option<LanguageDirection> {
        let (source, target) = stem.split_once("__")?;
        Some(LanguageDirection {
            source: source.parse().ok()?,
            target: target.parse().ok()?,
        })
    }
}

impl FromStr for LanguageDirection {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (source, target) = s.split_once(':').ok_or_else(|| {
            Error::invalid_input(format!("invalid language direction {:?}, expected src:tgt", s))
        })?;
        Ok(LanguageDirection {
            source: source.parse()?,
            target: target.parse()?,
        })
    }
}

impl TryFrom<String> for LanguageDirection {
    type Error = Error;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<LanguageDirection> for String {
    fn from(dir: LanguageDirection) -> Self {
        dir.to_string()
    }
}

impl fmt::Display for LanguageDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.source, self.target)
    }
}

// ============================================================================
// Alignment
// ============================================================================

/// Word alignment produced by the external aligner.
///
/// `links` are (source word index, target word index) pairs; `score` is the
/// aligner's confidence for the whole sentence pair.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Alignment {
    /// Aligned word index pairs
    pub links: Vec<(u32, u32)>,
    /// Confidence of the alignment
    pub score: f32,
}

impl Alignment {
    /// Create a new alignment
    pub fn new(links: Vec<(u32, u32)>, score: f32) -> Self {
        Alignment { links, score }
    }

    /// True if every link points inside sentences of the given word counts
    pub fn fits(&self, source_words: usize, target_words: usize) -> bool {
        self.links
            .iter()
            .all(|&(s, t)| (s as usize) < source_words && (t as usize) < target_words)
    }

    /// The alignment with source and target sides swapped
    pub fn reversed(&self) -> Alignment {
        Alignment {
            links: self.links.iter().map(|&(s, t)| (t, s)).collect(),
            score: self.score,
        }
    }
}

// ============================================================================
// Stream records
// ============================================================================

/// One bilingual sentence pair destined for a memory.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TranslationUnit {
    /// Channel the unit was delivered on
    pub channel: ChannelId,
    /// Position inside the channel
    pub offset: Offset,
    /// Destination memory
    pub memory: MemoryId,
    /// Language direction of `source` → `target`
    pub direction: LanguageDirection,
    /// Source sentence
    pub source: String,
    /// Target sentence
    pub target: String,
    /// Optional word alignment
    pub alignment: Option<Alignment>,
}

impl TranslationUnit {
    /// Create a unit without alignment
    pub fn new(
        channel: ChannelId,
        offset: Offset,
        memory: MemoryId,
        direction: LanguageDirection,
        source: impl Into<String>,
        target: impl Into<String>,
    ) -> Self {
        TranslationUnit {
            channel,
            offset,
            memory,
            direction,
            source: source.into(),
            target: target.into(),
            alignment: None,
        }
    }

    /// Builder: attach a word alignment
    pub fn with_alignment(mut self, alignment: Alignment) -> Self {
        self.alignment = Some(alignment);
        self
    }
}

/// Request to remove every unit of a memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Deletion {
    /// Channel the deletion was delivered on
    pub channel: ChannelId,
    /// Position inside the channel
    pub offset: Offset,
    /// Memory to delete
    pub memory: MemoryId,
}

impl Deletion {
    /// Create a deletion record
    pub fn new(channel: ChannelId, offset: Offset, memory: MemoryId) -> Self {
        Deletion {
            channel,
            offset,
            memory,
        }
    }
}
