//! Text tokenization for the lexical index

use regex::Regex;
use std::collections::HashMap;
use std::sync::OnceLock;

/// Word pattern, compiled once
static WORD: OnceLock<Regex> = OnceLock::new();

fn word_pattern() -> &'static Regex {
    WORD.get_or_init(|| Regex::new(r"[\p{L}\p{N}]+").expect("static word pattern"))
}

/// Lowercased alphanumeric tokens, single characters dropped
pub fn tokenize(text: &str) -> Vec<String> {
    word_pattern()
        .find_iter(text)
        .map(|m| m.as_str().to_lowercase())
        .filter(|t| t.chars().count() > 1)
        .collect()
}

/// Term -> occurrence count
pub fn term_frequencies(text: &str) -> HashMap<String, u32> {
    let mut tf = HashMap::new();
    for token in tokenize(text) {
        *tf.entry(token).or_insert(0) += 1;
    }
    tf
}

/// Distinct query terms in first-seen order
pub fn query_terms(text: &str) -> Vec<String> {
    let mut seen = std::collections::HashSet::new();
    tokenize(text)
        .into_iter()
        .filter(|t| seen.insert(t.clone()))
        .collect()
}
