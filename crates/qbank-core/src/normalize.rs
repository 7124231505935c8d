//! Canonical text form for exam questions.
//!
//! Raw text goes through compatibility normalization, lowercasing and markup stripping until it
//! stops changing, then is split into word and formula tokens. The joined tokens form the
//! normalized text, and `normalize(normalized_text)` always yields the same tokens again.

use std::collections::BTreeSet;

use once_cell::sync::Lazy;
use regex_lite::{Captures, Regex};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use unicode_normalization::UnicodeNormalization;

use crate::BankError;

pub const DEFAULT_SHINGLE_SIZE: usize = 2;

const STOPWORDS: [&str; 7] = ["a", "an", "the", "please", "kindly", "briefly", "following"];
const FORMULA_CHARS: [char; 9] = ['=', '+', '*', '/', '^', '<', '>', '%', '\\'];
const TRAILING_PUNCTUATION: [char; 6] = ['.', ',', ';', ':', '?', '!'];

#[allow(clippy::expect_used)]
static HTML_TAG: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"</?[a-z!][^<>]*>").expect("html tag pattern is valid"));

#[allow(clippy::expect_used)]
static HTML_ENTITY: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"&(#[0-9]{1,7}|[a-z]+);").expect("html entity pattern is valid"));

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct NormalizerConfig {
    pub shingle_size: usize,
}

impl Default for NormalizerConfig {
    fn default() -> Self {
        Self { shingle_size: DEFAULT_SHINGLE_SIZE }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct NormalizedQuestion {
    pub normalized_text: String,
    pub tokens: Vec<String>,
    pub shingles: BTreeSet<String>,
}

#[derive(Debug, Clone)]
pub struct Normalizer {
    shingle_size: usize,
}

impl Normalizer {
    /// Build a normalizer for the given shingle size.
    ///
    /// # Errors
    /// Returns [`BankError::Config`] when the shingle size is zero.
    pub fn new(config: NormalizerConfig) -> Result<Self, BankError> {
        if config.shingle_size == 0 {
            return Err(BankError::Config("normalizer.shingle_size MUST be >= 1".to_string()));
        }
        Ok(Self { shingle_size: config.shingle_size })
    }

    #[must_use]
    pub fn shingle_size(&self) -> usize {
        self.shingle_size
    }

    /// Canonicalize `raw` into tokens and a shingle set.
    ///
    /// # Errors
    /// Returns [`BankError::InvalidInput`] when nothing comparable is left after normalization.
    pub fn normalize(&self, raw: &str) -> Result<NormalizedQuestion, BankError> {
        let tokens = tokenize(&canonical_text(raw));
        if tokens.is_empty() {
            return Err(BankError::InvalidInput(
                "question text is empty after normalization".to_string(),
            ));
        }

        let shingles = shingles(&tokens, self.shingle_size);
        Ok(NormalizedQuestion { normalized_text: tokens.join(" "), tokens, shingles })
    }
}

impl Default for Normalizer {
    fn default() -> Self {
        Self { shingle_size: DEFAULT_SHINGLE_SIZE }
    }
}

/// Content checksum of the raw text, used for exact-duplicate detection.
#[must_use]
pub fn checksum(raw: &str) -> String {
    format!("sha256:{:x}", Sha256::digest(raw.as_bytes()))
}

/// Jaccard index of two shingle sets. Symmetric, always in `[0, 1]`.
#[must_use]
#[allow(clippy::cast_precision_loss)]
pub fn jaccard(left: &BTreeSet<String>, right: &BTreeSet<String>) -> f64 {
    let shared = left.intersection(right).count();
    let union = left.len() + right.len() - shared;
    if union == 0 {
        return 0.0;
    }
    shared as f64 / union as f64
}

/// Fold and strip until nothing changes. A pass that changes the text consumes at least one
/// entity or tag of the input, so the input length bounds the passes.
fn canonical_text(raw: &str) -> String {
    let mut current = raw.to_string();
    for _ in 0..=raw.len() {
        let folded = current.nfkc().collect::<String>().to_lowercase();
        let next = strip_markup(&folded);
        if next == current {
            break;
        }
        current = next;
    }
    current
}

fn strip_markup(text: &str) -> String {
    let decoded = HTML_ENTITY.replace_all(text, |caps: &Captures<'_>| decode_entity(caps));
    let untagged = HTML_TAG.replace_all(&decoded, " ");
    untagged.replace("**", "").replace("__", "").replace('`', "")
}

fn decode_entity(caps: &Captures<'_>) -> String {
    let whole = caps.get(0).map_or("", |m| m.as_str());
    let name = caps.get(1).map_or("", |m| m.as_str());

    if let Some(digits) = name.strip_prefix('#') {
        return digits
            .parse::<u32>()
            .ok()
            .and_then(char::from_u32)
            .map_or_else(|| whole.to_string(), String::from);
    }

    match name {
        "nbsp" => " ".to_string(),
        "amp" => "&".to_string(),
        "lt" => "<".to_string(),
        "gt" => ">".to_string(),
        "quot" => "\"".to_string(),
        "apos" => "'".to_string(),
        _ => whole.to_string(),
    }
}

fn is_formula(token: &str) -> bool {
    token.chars().any(|ch| ch.is_ascii_digit() || FORMULA_CHARS.contains(&ch))
}

fn tokenize(canonical: &str) -> Vec<String> {
    let mut tokens = Vec::new();
    for piece in canonical.split_whitespace() {
        if is_formula(piece) {
            tokens.push(piece.trim_end_matches(&TRAILING_PUNCTUATION[..]).to_string());
            continue;
        }

        for word in piece.split(|ch: char| !ch.is_alphanumeric()) {
            if word.is_empty() || STOPWORDS.contains(&word) {
                continue;
            }
            tokens.push(word.to_string());
        }
    }
    tokens
}

fn shingles(tokens: &[String], size: usize) -> BTreeSet<String> {
    if tokens.len() < size {
        return BTreeSet::from([tokens.join(" ")]);
    }
    tokens.windows(size).map(|window| window.join(" ")).collect()
}
