//! Text analysis for indexing and querying
//!
//! Pipeline: UAX#29 word boundaries → (index terms only) keep alphanumerics
//!           → lowercase → filter short tokens → remove stopwords
//!
//! An [`Analyzer`] produces two views of a sentence:
//! - `words`: surface words, stored with the document and returned by search
//! - `terms`: normalized index terms used for BM25 and similarity

use once_cell::sync::Lazy;
use rustc_hash::{FxHashMap, FxHashSet};
use std::sync::Arc;
use tmstore_core::Language;
use unicode_segmentation::UnicodeSegmentation;

/// Per-language tokenization capability
///
/// Implementations must be deterministic: the same text always yields the
/// same words and terms, at index time and at query time.
pub trait Analyzer: Send + Sync {
    /// Split a sentence into surface words
    fn words(&self, text: &str) -> Vec<String>;

    /// Normalize a surface word into an index term; `None` drops it
    fn term(&self, word: &str) -> Option<String>;

    /// Index terms of a sentence, in order, duplicates kept
    fn terms(&self, text: &str) -> Vec<String> {
        self.words(text).iter().filter_map(|w| self.term(w)).collect()
    }

    /// Name for debugging and logging
    fn name(&self) -> &str;
}

// ============================================================================
// Stopwords
// ============================================================================

/// Lucene's default English stopword set
static EN_STOPWORDS: Lazy<FxHashSet<&'static str>> = Lazy::new(|| {
    [
        "a", "an", "and", "are", "as", "at", "be", "but", "by", "for", "if", "in", "into", "is",
        "it", "no", "not", "of", "on", "or", "such", "that", "the", "their", "then", "there",
        "these", "they", "this", "to", "was", "will", "with",
    ]
    .into_iter()
    .collect()
});

static IT_STOPWORDS: Lazy<FxHashSet<&'static str>> = Lazy::new(|| {
    [
        "il", "lo", "la", "gli", "le", "un", "uno", "una", "di", "da", "in", "con", "su", "per",
        "tra", "fra", "del", "della", "dei", "delle", "al", "alla", "ai", "nel", "nella", "che",
        "non", "si", "sono", "ed", "era", "come",
    ]
    .into_iter()
    .collect()
});

static ES_STOPWORDS: Lazy<FxHashSet<&'static str>> = Lazy::new(|| {
    [
        "el", "la", "los", "las", "un", "una", "unos", "unas", "de", "del", "en", "con", "por",
        "para", "al", "que", "se", "no", "es", "lo", "su", "sus", "como", "pero", "más", "ya",
    ]
    .into_iter()
    .collect()
});

static FR_STOPWORDS: Lazy<FxHashSet<&'static str>> = Lazy::new(|| {
    [
        "le", "la", "les", "un", "une", "des", "de", "du", "et", "en", "au", "aux", "ce", "ces",
        "dans", "par", "pour", "sur", "que", "qui", "ne", "pas", "se", "est", "il", "elle",
    ]
    .into_iter()
    .collect()
});

static DE_STOPWORDS: Lazy<FxHashSet<&'static str>> = Lazy::new(|| {
    [
        "der", "die", "das", "den", "dem", "des", "ein", "eine", "einer", "eines", "und", "oder",
        "in", "im", "zu", "mit", "von", "auf", "für", "ist", "nicht", "sich", "es", "an", "als",
    ]
    .into_iter()
    .collect()
});

/// Stopword set for a primary language subtag, if one is bundled
fn stopwords_for(language: &str) -> Option<&'static FxHashSet<&'static str>> {
    match language {
        "en" => Some(&*EN_STOPWORDS),
        "it" => Some(&*IT_STOPWORDS),
        "es" => Some(&*ES_STOPWORDS),
        "fr" => Some(&*FR_STOPWORDS),
        "de" => Some(&*DE_STOPWORDS),
        _ => None,
    }
}

// ============================================================================
// StandardAnalyzer
// ============================================================================

/// Unicode word segmentation with optional per-language stopwords
#[derive(Debug, Clone)]
pub struct StandardAnalyzer {
    name: String,
    stopwords: Option<&'static FxHashSet<&'static str>>,
    min_term_len: usize,
}

impl StandardAnalyzer {
    /// Analyzer without stopwords
    pub fn new() -> Self {
        StandardAnalyzer {
            name: "standard".to_string(),
            stopwords: None,
            min_term_len: 2,
        }
    }

    /// Analyzer with the bundled stopwords of `language` (primary subtag)
    pub fn for_language(language: &str) -> Self {
        StandardAnalyzer {
            name: format!("standard-{}", language),
            stopwords: stopwords_for(language),
            min_term_len: 2,
        }
    }

    /// Builder: minimum term length in bytes (default 2)
    pub fn with_min_term_len(mut self, len: usize) -> Self {
        self.min_term_len = len;
        self
    }

    #[inline]
    fn is_stopword(&self, term: &str) -> bool {
        self.stopwords.map_or(false, |set| set.contains(term))
    }
}

impl Default for StandardAnalyzer {
    fn default() -> Self {
        Self::new()
    }
}

impl Analyzer for StandardAnalyzer {
    fn words(&self, text: &str) -> Vec<String> {
        text.unicode_words().map(str::to_string).collect()
    }

    fn term(&self, word: &str) -> Option<String> {
        let term: String = word
            .chars()
            .filter(|c| c.is_alphanumeric())
            .flat_map(char::to_lowercase)
            .collect();
        if term.len() < self.min_term_len || self.is_stopword(&term) {
            return None;
        }
        Some(term)
    }

    fn name(&self) -> &str {
        &self.name
    }
}

// ============================================================================
// AnalyzerRegistry
// ============================================================================

/// Chooses the analyzer for a language.
///
/// Lookup order: exact tag (`en-US`), primary subtag (`en`), then a
/// [`StandardAnalyzer`] with the bundled stopwords of the primary subtag.
#[derive(Clone)]
pub struct AnalyzerRegistry {
    custom: FxHashMap<String, Arc<dyn Analyzer>>,
    standard: FxHashMap<String, Arc<dyn Analyzer>>,
    fallback: Arc<dyn Analyzer>,
}

impl AnalyzerRegistry {
    /// Registry with standard analyzers only
    pub fn new() -> Self {
        let standard = ["en", "it", "es", "fr", "de"]
            .into_iter()
            .map(|lang| {
                let analyzer: Arc<dyn Analyzer> = Arc::new(StandardAnalyzer::for_language(lang));
                (lang.to_string(), analyzer)
            })
            .collect();
        AnalyzerRegistry {
            custom: FxHashMap::default(),
            standard,
            fallback: Arc::new(StandardAnalyzer::new()),
        }
    }

    /// Builder: register an analyzer for a tag (`en`, `en-US`, ...)
    pub fn with_analyzer(mut self, tag: &str, analyzer: Arc<dyn Analyzer>) -> Self {
        let key = match tag.parse::<Language>() {
            Ok(lang) => lang.tag().to_string(),
            Err(_) => tag.to_string(),
        };
        self.custom.insert(key, analyzer);
        self
    }

    /// Analyzer for `language`
    pub fn analyzer_for(&self, language: &Language) -> Arc<dyn Analyzer> {
        if let Some(analyzer) = self.custom.get(language.tag()) {
            return Arc::clone(analyzer);
        }
        if let Some(analyzer) = self.custom.get(language.language()) {
            return Arc::clone(analyzer);
        }
        match self.standard.get(language.language()) {
            Some(analyzer) => Arc::clone(analyzer),
            None => Arc::clone(&self.fallback),
        }
    }
}

impl Default for AnalyzerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for AnalyzerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut custom: Vec<&String> = self.custom.keys().collect();
        custom.sort();
        f.debug_struct("AnalyzerRegistry")
            .field("custom", &custom)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_words_keep_surface_form() {
        let a = StandardAnalyzer::for_language("en");
        assert_eq!(a.words("The cat, sat!"), vec!["The", "cat", "sat"]);
    }

    #[test]
    fn test_terms_basic() {
        let a = StandardAnalyzer::for_language("en");
        assert_eq!(a.terms("Hello, World!"), vec!["hello", "world"]);
    }

    #[test]
    fn test_terms_drop_stopwords_and_short() {
        let a = StandardAnalyzer::for_language("en");
        assert_eq!(a.terms("the cat sat on a mat"), vec!["cat", "sat", "mat"]);
        assert!(a.terms("the a an is").is_empty());
    }

    #[test]
    fn test_terms_numbers() {
        let a = StandardAnalyzer::new();
        assert_eq!(a.terms("test123 foo456bar"), vec!["test123", "foo456bar"]);
    }

    #[test]
    fn test_terms_empty_and_punctuation() {
        let a = StandardAnalyzer::new();
        assert!(a.terms("").is_empty());
        assert!(a.terms("...---...").is_empty());
    }

    #[test]
    fn test_italian_stopwords() {
        let a = StandardAnalyzer::for_language("it");
        assert_eq!(a.terms("il gatto sedeva"), vec!["gatto", "sedeva"]);
    }

    #[test]
    fn test_unknown_language_has_no_stopwords() {
        let a = StandardAnalyzer::for_language("xx");
        assert_eq!(a.terms("the cat"), vec!["the", "cat"]);
    }

    #[test]
    fn test_registry_lookup_order() {
        struct Upper;
        impl Analyzer for Upper {
            fn words(&self, text: &str) -> Vec<String> {
                text.split_whitespace().map(str::to_uppercase).collect()
            }
            fn term(&self, word: &str) -> Option<String> {
                Some(word.to_string())
            }
            fn name(&self) -> &str {
                "upper"
            }
        }

        let registry = AnalyzerRegistry::new().with_analyzer("en-gb", Arc::new(Upper));
        assert_eq!(registry.analyzer_for(&Language::new("en-GB")).name(), "upper");
        assert_eq!(registry.analyzer_for(&Language::new("en")).name(), "standard-en");
        assert_eq!(registry.analyzer_for(&Language::new("en-US")).name(), "standard-en");
        assert_eq!(registry.analyzer_for(&Language::new("ja")).name(), "standard");
    }
}
