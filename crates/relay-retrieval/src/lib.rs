//! # relay-retrieval
//!
//! In-memory hybrid retrieval over a shared document corpus:
//! - BM25 lexical ranking with incrementally maintained corpus statistics
//! - Cosine similarity over caller-supplied embeddings
//! - Reciprocal rank fusion of both lists with deterministic tie-breaking
//!
//! Embeddings are computed outside relay. The retriever only requires that
//! every document and query embedding share one dimension.

mod error;
mod fusion;
mod lexical;
mod retriever;
mod semantic;
mod tokenizer;

pub use error::RetrievalError;
pub use fusion::{reciprocal_rank_fusion, FusedScore};
pub use lexical::{bm25, Bm25Params, CorpusStats};
pub use retriever::{HybridRetriever, IndexStats};
pub use semantic::cosine_similarity;
pub use tokenizer::{query_terms, tokenize};
