//! Hybrid retriever
//!
//! Lexical statistics, term frequencies and embeddings live together in a
//! single index state behind one reader-writer lock. Insert and delete
//! take the write lock, so a document is never visible to one signal and
//! missing from the other. Searches share the read lock.

use relay_core::{ContextDocument, Document, MetadataFilter, RetrievalConfig, RetrievalQuery, RetrievalResult};
use std::collections::{BTreeMap, HashMap};
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::debug;

use crate::error::RetrievalError;
use crate::fusion::{reciprocal_rank_fusion, sort_ranked, RankedList};
use crate::lexical::{bm25, Bm25Params, CorpusStats};
use crate::semantic::cosine_similarity;
use crate::tokenizer;

/// Document plus the data derived from it at index time
#[derive(Debug, Clone)]
struct IndexedDocument {
    document: Document,
    term_frequencies: HashMap<String, u32>,
    length: u32,
}

#[derive(Debug, Default)]
struct IndexState {
    /// Ordered by id for deterministic iteration
    docs: BTreeMap<String, IndexedDocument>,
    stats: CorpusStats,
    /// Embedding length shared by every indexed document
    dimension: Option<usize>,
}

impl IndexState {
    fn insert(&mut self, indexed: IndexedDocument) -> Option<Document> {
        let previous = self.remove(&indexed.document.doc_id);
        self.stats.add(&indexed.term_frequencies, indexed.length);
        self.dimension = Some(indexed.document.embedding.len());
        self.docs.insert(indexed.document.doc_id.clone(), indexed);
        previous
    }

    fn remove(&mut self, doc_id: &str) -> Option<Document> {
        let removed = self.docs.remove(doc_id)?;
        self.stats.remove(&removed.term_frequencies, removed.length);
        if self.docs.is_empty() {
            self.dimension = None;
        }
        Some(removed.document)
    }
}

/// Summary of the index contents
#[derive(Debug, Clone, serde::Serialize)]
pub struct IndexStats {
    pub documents: usize,
    pub distinct_terms: usize,
    pub avg_length: f64,
    pub dimension: Option<usize>,
}

/// Lexical + semantic retriever fused with reciprocal rank fusion
#[derive(Debug)]
pub struct HybridRetriever {
    state: RwLock<IndexState>,
    bm25: Bm25Params,
    rrf_k: f64,
    min_similarity: Option<f64>,
    default_top_k: usize,
}

impl HybridRetriever {
    pub fn new(config: &RetrievalConfig) -> Self {
        Self {
            state: RwLock::new(IndexState::default()),
            bm25: Bm25Params {
                k1: config.bm25_k1,
                b: config.bm25_b,
            },
            rrf_k: config.rrf_k,
            min_similarity: config.min_similarity,
            default_top_k: config.default_top_k,
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, IndexState> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, IndexState> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Index a document, replacing any previous version with the same id
    ///
    /// Returns the replaced document, if any.
    pub fn index(&self, document: Document) -> Result<Option<Document>, RetrievalError> {
        if document.doc_id.trim().is_empty() {
            return Err(RetrievalError::InvalidDocument("empty doc_id".into()));
        }
        if document.embedding.is_empty() {
            return Err(RetrievalError::InvalidDocument(format!(
                "{} has an empty embedding",
                document.doc_id
            )));
        }
        if document.embedding.iter().any(|x| !x.is_finite()) {
            return Err(RetrievalError::InvalidDocument(format!(
                "{} has a non-finite embedding component",
                document.doc_id
            )));
        }

        // Tokenize outside the lock
        let term_frequencies = tokenizer::term_frequencies(&document.content);
        let length = term_frequencies.values().sum();
        let indexed = IndexedDocument {
            document,
            term_frequencies,
            length,
        };

        let mut state = self.write();
        let replacing_only_doc = state.docs.len() == 1
            && state.docs.contains_key(&indexed.document.doc_id);
        if let Some(expected) = state.dimension {
            let got = indexed.document.embedding.len();
            if got != expected && !replacing_only_doc {
                return Err(RetrievalError::DimensionMismatch { expected, got });
            }
        }

        debug!(doc_id = %indexed.document.doc_id, terms = indexed.term_frequencies.len(), "Indexing document");
        Ok(state.insert(indexed))
    }

    /// Remove a document from both indices; `None` if it was not indexed
    pub fn delete(&self, doc_id: &str) -> Option<Document> {
        let removed = self.write().remove(doc_id);
        if removed.is_some() {
            debug!(doc_id, "Deleted document");
        }
        removed
    }

    pub fn get(&self, doc_id: &str) -> Option<Document> {
        self.read().docs.get(doc_id).map(|d| d.document.clone())
    }

    pub fn len(&self) -> usize {
        self.read().docs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().docs.is_empty()
    }

    pub fn document_frequency(&self, term: &str) -> u32 {
        self.read().stats.doc_freq.get(term).copied().unwrap_or(0)
    }

    pub fn stats(&self) -> IndexStats {
        let state = self.read();
        IndexStats {
            documents: state.docs.len(),
            distinct_terms: state.stats.doc_freq.len(),
            avg_length: state.stats.avg_length(),
            dimension: state.dimension,
        }
    }

    /// Ranked retrieval
    ///
    /// Filters are applied to the candidate set before either signal is
    /// scored. `query.top_k` falls back to the configured default.
    pub fn search(&self, query: &RetrievalQuery) -> Result<Vec<RetrievalResult>, RetrievalError> {
        let state = self.read();
        self.search_locked(&state, query)
    }

    /// Search and return the matching documents in the same consistent view
    pub fn retrieve_context(
        &self,
        query: &RetrievalQuery,
    ) -> Result<(Vec<RetrievalResult>, Vec<ContextDocument>), RetrievalError> {
        let state = self.read();
        let results = self.search_locked(&state, query)?;
        let context = results
            .iter()
            .filter_map(|r| {
                state.docs.get(&r.doc_id).map(|d| ContextDocument {
                    doc_id: r.doc_id.clone(),
                    rank: r.rank,
                    fused_score: r.fused_score,
                    content: d.document.content.clone(),
                    metadata: d.document.metadata.clone(),
                })
            })
            .collect();
        Ok((results, context))
    }

    fn search_locked(
        &self,
        state: &IndexState,
        query: &RetrievalQuery,
    ) -> Result<Vec<RetrievalResult>, RetrievalError> {
        let text = query.text.as_deref().filter(|t| !t.trim().is_empty());
        if text.is_none() && query.embedding.is_none() {
            return Err(RetrievalError::EmptyQuery);
        }

        let top_k = query.top_k.unwrap_or(self.default_top_k);
        if state.docs.is_empty() || top_k == 0 {
            return Ok(Vec::new());
        }

        if let (Some(embedding), Some(expected)) = (&query.embedding, state.dimension) {
            if embedding.len() != expected {
                return Err(RetrievalError::DimensionMismatch {
                    expected,
                    got: embedding.len(),
                });
            }
        }

        let candidates: Vec<&IndexedDocument> = state
            .docs
            .values()
            .filter(|d| passes(&query.filters, d))
            .collect();

        let lexical = match text {
            Some(text) => self.lexical_ranking(state, &candidates, text),
            None => Vec::new(),
        };
        let semantic = match &query.embedding {
            Some(embedding) => self.semantic_ranking(&candidates, embedding),
            None => Vec::new(),
        };

        let results = reciprocal_rank_fusion(&lexical, &semantic, self.rrf_k)
            .into_iter()
            .take(top_k)
            .enumerate()
            .map(|(i, (doc_id, score))| RetrievalResult {
                doc_id: doc_id.to_string(),
                fused_score: score.fused,
                lexical_score: score.lexical,
                semantic_score: score.semantic,
                rank: i + 1,
            })
            .collect::<Vec<_>>();

        debug!(
            candidates = candidates.len(),
            lexical = lexical.len(),
            semantic = semantic.len(),
            returned = results.len(),
            "Hybrid search complete"
        );
        Ok(results)
    }

    fn lexical_ranking<'a>(
        &self,
        state: &IndexState,
        candidates: &[&'a IndexedDocument],
        text: &str,
    ) -> RankedList<'a> {
        let terms = tokenizer::query_terms(text);
        if terms.is_empty() {
            return Vec::new();
        }

        let mut ranked: RankedList<'a> = candidates
            .iter()
            .map(|d| {
                let score = bm25(self.bm25, &state.stats, &terms, &d.term_frequencies, d.length);
                (d.document.doc_id.as_str(), score)
            })
            .filter(|(_, score)| *score > 0.0)
            .collect();
        sort_ranked(&mut ranked);
        ranked
    }

    fn semantic_ranking<'a>(
        &self,
        candidates: &[&'a IndexedDocument],
        embedding: &[f32],
    ) -> RankedList<'a> {
        let mut ranked: RankedList<'a> = candidates
            .iter()
            .map(|d| {
                (
                    d.document.doc_id.as_str(),
                    cosine_similarity(embedding, &d.document.embedding),
                )
            })
            .filter(|(_, score)| self.min_similarity.map_or(true, |min| *score > min))
            .collect();
        sort_ranked(&mut ranked);
        ranked
    }
}

impl Default for HybridRetriever {
    fn default() -> Self {
        Self::new(&RetrievalConfig::default())
    }
}

fn passes(filters: &[MetadataFilter], doc: &IndexedDocument) -> bool {
    filters.iter().all(|f| f.matches(&doc.document.metadata))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn doc(id: &str, content: &str, embedding: Vec<f32>) -> Document {
        Document::new(id, content, embedding)
    }

    #[test]
    fn test_empty_corpus_returns_empty() {
        let retriever = HybridRetriever::default();
        let results = retriever
            .search(&RetrievalQuery::text("anything").with_embedding(vec![1.0, 0.0]))
            .unwrap();
        assert!(results.is_empty());
    }

    #[test]
    fn test_query_requires_a_signal() {
        let retriever = HybridRetriever::default();
        assert_eq!(
            retriever.search(&RetrievalQuery::default()),
            Err(RetrievalError::EmptyQuery)
        );
    }

    #[test]
    fn test_semantic_only_when_no_term_overlap() {
        let retriever = HybridRetriever::default();
        retriever.index(doc("a", "renal dosing", vec![1.0, 0.0])).unwrap();
        retriever.index(doc("b", "cardiac imaging", vec![0.0, 1.0])).unwrap();

        let results = retriever
            .search(&RetrievalQuery::text("oncology").with_embedding(vec![0.9, 0.1]))
            .unwrap();

        assert_eq!(results.len(), 2);
        assert_eq!(results[0].doc_id, "a");
        assert!(results.iter().all(|r| r.lexical_score.is_none()));
        assert!(results[0].semantic_score.is_some());
    }

    #[test]
    fn test_opposed_embedding_still_ranks_candidates() {
        let retriever = HybridRetriever::default();
        retriever.index(doc("a", "renal dosing", vec![1.0, 0.0])).unwrap();
        retriever.index(doc("b", "cardiac imaging", vec![0.0, 1.0])).unwrap();

        let results = retriever
            .search(&RetrievalQuery::text("oncology").with_embedding(vec![-1.0, -0.5]))
            .unwrap();

        assert_eq!(results.len(), 2);
        // cosine(b) = -0.447 beats cosine(a) = -0.894
        assert_eq!(results[0].doc_id, "b");
        assert!(results.iter().all(|r| r.semantic_score.is_some_and(|s| s < 0.0)));
    }

    #[test]
    fn test_min_similarity_threshold_is_opt_in() {
        let config = RetrievalConfig {
            min_similarity: Some(0.0),
            ..RetrievalConfig::default()
        };
        let retriever = HybridRetriever::new(&config);
        retriever.index(doc("a", "renal dosing", vec![1.0, 0.0])).unwrap();
        retriever.index(doc("b", "cardiac imaging", vec![-1.0, 0.0])).unwrap();

        let results = retriever
            .search(&RetrievalQuery::default().with_embedding(vec![1.0, 0.0]))
            .unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].doc_id, "a");
    }

    #[test]
    fn test_top_k_larger_than_corpus() {
        let retriever = HybridRetriever::default();
        retriever.index(doc("a", "alpha", vec![1.0])).unwrap();
        retriever.index(doc("b", "alpha beta", vec![1.0])).unwrap();

        let results = retriever
            .search(&RetrievalQuery::text("alpha").with_top_k(50))
            .unwrap();
        assert_eq!(results.len(), 2);
        assert_eq!(results.iter().map(|r| r.rank).collect::<Vec<_>>(), vec![1, 2]);
    }

    #[test]
    fn test_filters_apply_before_ranking() {
        let retriever = HybridRetriever::default();
        retriever
            .index(doc("a", "insulin insulin insulin", vec![1.0]).with_metadata("source", "forum"))
            .unwrap();
        retriever
            .index(doc("b", "insulin", vec![1.0]).with_metadata("source", "guideline"))
            .unwrap();

        let results = retriever
            .search(
                &RetrievalQuery::text("insulin")
                    .with_top_k(1)
                    .with_filter(MetadataFilter::eq("source", "guideline")),
            )
            .unwrap();

        assert_eq!(results.len(), 1);
        assert_eq!(results[0].doc_id, "b");
    }

    #[test]
    fn test_dimension_checks() {
        let retriever = HybridRetriever::default();
        retriever.index(doc("a", "alpha", vec![1.0, 0.0])).unwrap();

        assert_eq!(
            retriever.index(doc("b", "beta", vec![1.0])),
            Err(RetrievalError::DimensionMismatch { expected: 2, got: 1 })
        );
        assert!(matches!(
            retriever.search(&RetrievalQuery::default().with_embedding(vec![1.0, 0.0, 0.0])),
            Err(RetrievalError::DimensionMismatch { .. })
        ));

        // Replacing the only document may change the dimension
        retriever.index(doc("a", "alpha", vec![1.0, 0.0, 0.0])).unwrap();
        assert_eq!(retriever.stats().dimension, Some(3));
    }

    #[test]
    fn test_reindex_replaces_statistics() {
        let retriever = HybridRetriever::default();
        retriever.index(doc("a", "alpha beta", vec![1.0])).unwrap();
        let previous = retriever.index(doc("a", "gamma", vec![1.0])).unwrap();

        assert_eq!(previous.map(|d| d.content), Some("alpha beta".to_string()));
        assert_eq!(retriever.len(), 1);
        assert_eq!(retriever.document_frequency("alpha"), 0);
        assert_eq!(retriever.document_frequency("gamma"), 1);
    }

    #[test]
    fn test_delete_removes_from_both_signals() {
        let retriever = HybridRetriever::default();
        retriever.index(doc("a", "alpha", vec![1.0, 0.0])).unwrap();
        retriever.index(doc("b", "beta", vec![0.0, 1.0])).unwrap();

        assert!(retriever.delete("a").is_some());
        assert!(retriever.delete("a").is_none());

        let results = retriever
            .search(&RetrievalQuery::text("alpha").with_embedding(vec![1.0, 0.0]))
            .unwrap();
        assert!(results.iter().all(|r| r.doc_id != "a"));
        assert_eq!(retriever.document_frequency("alpha"), 0);
    }

    #[test]
    fn test_retrieve_context_carries_content() {
        let retriever = HybridRetriever::default();
        retriever
            .index(doc("a", "alpha guidance", vec![1.0]).with_metadata("year", 2023))
            .unwrap();

        let (results, context) = retriever
            .retrieve_context(&RetrievalQuery::text("alpha"))
            .unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(context[0].content, "alpha guidance");
        assert_eq!(context[0].rank, 1);
        assert_eq!(context[0].metadata["year"], 2023);
    }
}
