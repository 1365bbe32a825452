use anyhow::{Context, Result};
use std::collections::HashSet;
use std::path::Path;
use unicode_normalization::UnicodeNormalization;

const DEFAULT_SUCCESS_WORDS: &str = include_str!("../data/success_words.txt");
const DEFAULT_INTENT_WORDS: &str = include_str!("../data/intent_words.txt");

/// Locale-aware keyword sets used to classify unsubscribe pages.
///
/// The word lists are data, not code: they ship as plain text files and can
/// be overridden per deployment. All entries and probe text go through NFKC
/// normalization and lowercasing before matching, so fullwidth or composed
/// variants of a word still hit.
#[derive(Debug, Clone)]
pub struct Lexicon {
    success_words: HashSet<String>,
    intent_words: HashSet<String>,
}

fn normalize(text: &str) -> String {
    text.nfkc().collect::<String>().to_lowercase()
}

fn parse_word_list(raw: &str) -> HashSet<String> {
    raw.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(normalize)
        .collect()
}

impl Lexicon {
    pub fn new(success_words: HashSet<String>, intent_words: HashSet<String>) -> Self {
        Self {
            success_words: success_words.iter().map(|w| normalize(w)).collect(),
            intent_words: intent_words.iter().map(|w| normalize(w)).collect(),
        }
    }

    /// Load word lists from files, falling back to the embedded defaults for
    /// any path not supplied.
    pub fn load(
        success_path: Option<&Path>,
        intent_path: Option<&Path>,
    ) -> Result<Self> {
        let success_raw = match success_path {
            Some(p) => std::fs::read_to_string(p)
                .with_context(|| format!("failed to read success word list {}", p.display()))?,
            None => DEFAULT_SUCCESS_WORDS.to_string(),
        };
        let intent_raw = match intent_path {
            Some(p) => std::fs::read_to_string(p)
                .with_context(|| format!("failed to read intent word list {}", p.display()))?,
            None => DEFAULT_INTENT_WORDS.to_string(),
        };

        Ok(Self {
            success_words: parse_word_list(&success_raw),
            intent_words: parse_word_list(&intent_raw),
        })
    }

    /// True when the text contains any success keyword.
    pub fn matches_success(&self, text: &str) -> bool {
        let probe = normalize(text);
        self.success_words.iter().any(|w| probe.contains(w.as_str()))
    }

    /// True when a button or submit label carries unsubscribe intent.
    pub fn matches_intent(&self, label: &str) -> bool {
        let probe = normalize(label);
        self.intent_words.iter().any(|w| probe.contains(w.as_str()))
    }

    pub fn success_word_count(&self) -> usize {
        self.success_words.len()
    }
}

impl Default for Lexicon {
    fn default() -> Self {
        Self {
            success_words: parse_word_list(DEFAULT_SUCCESS_WORDS),
            intent_words: parse_word_list(DEFAULT_INTENT_WORDS),
        }
    }
}
