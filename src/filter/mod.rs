//! Transcript keyword filtering.
//!
//! Transcripts and keywords are normalised the same way before a plain
//! substring test, so "Structure-Fire!!" in a keyword list still matches
//! "structure fire" in speech-to-text output. Any excluded keyword that
//! appears vetoes the whole filter for that call.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::LazyLock;
use tracing::debug;

use crate::catalog::Keyword;

static NON_WORD: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\W+").expect("static pattern is valid"));

/// Lowercase, drop apostrophes (so "don't" stays one token), collapse every
/// run of non-word characters to one space, trim.
pub fn normalize(text: &str) -> String {
    let without_apostrophes: String = text
        .chars()
        .filter(|c| !matches!(c, '\'' | '\u{2019}'))
        .collect();
    let lower = without_apostrophes.to_lowercase();
    NON_WORD.replace_all(&lower, " ").trim().to_string()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeywordMatch {
    pub keyword: String,
}

/// Raw result of one pass over the keyword list.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KeywordScan {
    pub included: Vec<KeywordMatch>,
    pub excluded: Vec<String>,
}

impl KeywordScan {
    /// Exclusion wins: a single excluded hit empties the category.
    pub fn into_matches(self) -> Vec<KeywordMatch> {
        if self.excluded.is_empty() {
            self.included
        } else {
            Vec::new()
        }
    }
}

pub fn scan_transcript(keywords: &[Keyword], transcript: &str) -> KeywordScan {
    let mut scan = KeywordScan::default();

    let text = normalize(transcript);
    if text.is_empty() {
        return scan;
    }

    for kw in keywords.iter().filter(|k| k.enabled) {
        let needle = normalize(&kw.keyword);
        // An all-punctuation keyword would otherwise match every transcript.
        if needle.is_empty() || !text.contains(&needle) {
            continue;
        }
        if kw.is_excluded {
            debug!("Excluded keyword {needle:?} present");
            scan.excluded.push(needle);
        } else {
            scan.included.push(KeywordMatch { keyword: needle });
        }
    }
    scan
}

/// Matches for the filter category; empty when nothing matched or when an
/// excluded keyword was present.
pub fn match_keywords(keywords: &[Keyword], transcript: &str) -> Vec<KeywordMatch> {
    scan_transcript(keywords, transcript).into_matches()
}
