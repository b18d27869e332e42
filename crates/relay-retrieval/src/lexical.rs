//! BM25 lexical scoring
//!
//! Document frequencies are corpus-wide and maintained incrementally by
//! the retriever on every insert and delete.

use std::collections::HashMap;

/// BM25 free parameters
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Bm25Params {
    /// Term frequency saturation
    pub k1: f64,
    /// Length normalization strength
    pub b: f64,
}

impl Default for Bm25Params {
    fn default() -> Self {
        Self { k1: 1.2, b: 0.75 }
    }
}

/// Corpus statistics needed for scoring
#[derive(Debug, Default, Clone)]
pub struct CorpusStats {
    pub doc_count: usize,
    pub total_length: u64,
    /// Term -> number of documents containing it
    pub doc_freq: HashMap<String, u32>,
}

impl CorpusStats {
    pub fn avg_length(&self) -> f64 {
        if self.doc_count == 0 {
            0.0
        } else {
            self.total_length as f64 / self.doc_count as f64
        }
    }

    pub fn add(&mut self, tf: &HashMap<String, u32>, length: u32) {
        self.doc_count += 1;
        self.total_length += u64::from(length);
        for term in tf.keys() {
            *self.doc_freq.entry(term.clone()).or_insert(0) += 1;
        }
    }

    pub fn remove(&mut self, tf: &HashMap<String, u32>, length: u32) {
        self.doc_count = self.doc_count.saturating_sub(1);
        self.total_length = self.total_length.saturating_sub(u64::from(length));
        for term in tf.keys() {
            if let Some(df) = self.doc_freq.get_mut(term) {
                *df = df.saturating_sub(1);
                if *df == 0 {
                    self.doc_freq.remove(term);
                }
            }
        }
    }

    /// Smoothed IDF, always positive
    pub fn idf(&self, term: &str) -> f64 {
        let n = self.doc_count as f64;
        let df = f64::from(self.doc_freq.get(term).copied().unwrap_or(0));
        (1.0 + (n - df + 0.5) / (df + 0.5)).ln()
    }
}

/// BM25 score of one document for a set of distinct query terms
pub fn bm25(
    params: Bm25Params,
    stats: &CorpusStats,
    query_terms: &[String],
    tf: &HashMap<String, u32>,
    length: u32,
) -> f64 {
    let avg = stats.avg_length();
    let norm = if avg > 0.0 {
        1.0 - params.b + params.b * f64::from(length) / avg
    } else {
        1.0
    };

    query_terms
        .iter()
        .filter_map(|term| tf.get(term).map(|&f| (term, f64::from(f))))
        .map(|(term, f)| stats.idf(term) * f * (params.k1 + 1.0) / (f + params.k1 * norm))
        .sum()
}
