//! Size limits for ingested sentences and queries
//!
//! Units that violate these limits are treated as malformed by the
//! ingestion gateway: they are rejected, counted and their offset is
//! committed so they are never redelivered.

use thiserror::Error;

/// Size limits enforced at ingestion and query time
#[derive(Debug, Clone, PartialEq)]
pub struct Limits {
    /// Maximum sentence length in bytes (default: 64KB)
    pub max_sentence_bytes: usize,

    /// Maximum number of words in a sentence (default: 1024)
    pub max_sentence_words: usize,

    /// Maximum number of alignment links (default: 16384)
    pub max_alignment_links: usize,
}

impl Default for Limits {
    fn default() -> Self {
        Limits {
            max_sentence_bytes: 64 * 1024, // 64KB
            max_sentence_words: 1024,
            max_alignment_links: 16 * 1024,
        }
    }
}

impl Limits {
    /// Create limits with small values for testing
    pub fn with_small_limits() -> Self {
        Limits {
            max_sentence_bytes: 64,
            max_sentence_words: 8,
            max_alignment_links: 16,
        }
    }

    /// Validate a raw sentence before tokenization
    pub fn validate_sentence(&self, side: Side, text: &str) -> Result<(), LimitError> {
        if text.trim().is_empty() {
            return Err(LimitError::EmptySentence { side });
        }
        if text.len() > self.max_sentence_bytes {
            return Err(LimitError::SentenceTooLong {
                side,
                actual: text.len(),
                max: self.max_sentence_bytes,
            });
        }
        Ok(())
    }

    /// Validate the word count of a tokenized sentence
    pub fn validate_word_count(&self, side: Side, words: usize) -> Result<(), LimitError> {
        if words == 0 {
            return Err(LimitError::EmptySentence { side });
        }
        if words > self.max_sentence_words {
            return Err(LimitError::TooManyWords {
                side,
                actual: words,
                max: self.max_sentence_words,
            });
        }
        Ok(())
    }

    /// Validate the number of alignment links
    pub fn validate_alignment_len(&self, links: usize) -> Result<(), LimitError> {
        if links > self.max_alignment_links {
            return Err(LimitError::TooManyLinks {
                actual: links,
                max: self.max_alignment_links,
            });
        }
        Ok(())
    }
}

/// Which side of a sentence pair a limit applies to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    /// Source sentence
    Source,
    /// Target sentence
    Target,
}

impl std::fmt::Display for Side {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Side::Source => f.write_str("source"),
            Side::Target => f.write_str("target"),
        }
    }
}

/// Limit validation errors
#[derive(Debug, Error, PartialEq)]
pub enum LimitError {
    /// Sentence is empty or whitespace only
    #[error("Empty {side} sentence")]
    EmptySentence {
        /// Offending side
        side: Side,
    },

    /// Sentence exceeds the byte limit
    #[error("{side} sentence too long: {actual} bytes exceeds maximum {max}")]
    SentenceTooLong {
        /// Offending side
        side: Side,
        /// Actual length in bytes
        actual: usize,
        /// Maximum allowed length
        max: usize,
    },

    /// Sentence has too many words
    #[error("{side} sentence has too many words: {actual} exceeds maximum {max}")]
    TooManyWords {
        /// Offending side
        side: Side,
        /// Actual word count
        actual: usize,
        /// Maximum allowed count
        max: usize,
    },

    /// Alignment has too many links
    #[error("Alignment too large: {actual} links exceeds maximum {max}")]
    TooManyLinks {
        /// Actual number of links
        actual: usize,
        /// Maximum allowed links
        max: usize,
    },

    /// Alignment references a word outside the sentence
    #[error("Alignment link ({source_index}, {target_index}) out of range for {source_words}x{target_words} words")]
    LinkOutOfRange {
        /// Source word index of the offending link
        source_index: u32,
        /// Target word index of the offending link
        target_index: u32,
        /// Words in the source sentence
        source_words: usize,
        /// Words in the target sentence
        target_words: usize,
    },
}

impl LimitError {
    /// Short reason code, used as a structured log field
    pub fn reason_code(&self) -> &'static str {
        match self {
            LimitError::EmptySentence { .. } => "empty_sentence",
            LimitError::SentenceTooLong { .. } => "sentence_too_long",
            LimitError::TooManyWords { .. } => "too_many_words",
            LimitError::TooManyLinks { .. } => "alignment_too_large",
            LimitError::LinkOutOfRange { .. } => "alignment_out_of_range",
        }
    }
}
