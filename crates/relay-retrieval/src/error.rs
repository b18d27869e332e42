//! Retrieval errors

use relay_core::RelayError;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum RetrievalError {
    #[error("embedding has {got} dimensions, index expects {expected}")]
    DimensionMismatch { expected: usize, got: usize },

    #[error("invalid document: {0}")]
    InvalidDocument(String),

    #[error("query has neither text nor embedding")]
    EmptyQuery,

    #[error("invalid query: {0}")]
    InvalidQuery(String),
}

impl From<RetrievalError> for RelayError {
    fn from(err: RetrievalError) -> Self {
        RelayError::Retrieval(err.to_string())
    }
}
