//! Retrieval query derivation from task payloads

use relay_core::{RetrievalNeed, RetrievalQuery};
use relay_retrieval::RetrievalError;
use serde_json::Value;

/// Build the retrieval query for a task payload
///
/// Text comes from `query`, else `text`, else every top-level string value
/// joined by spaces. A numeric `query_embedding` array adds the semantic
/// side.
pub fn retrieval_query(payload: &Value, need: &RetrievalNeed) -> Result<RetrievalQuery, RetrievalError> {
    let text = ["query", "text"]
        .iter()
        .find_map(|field| payload.get(*field).and_then(Value::as_str))
        .map(str::to_string)
        .or_else(|| joined_strings(payload));

    let embedding = match payload.get("query_embedding") {
        None | Some(Value::Null) => None,
        Some(value) => Some(embedding_from(value)?),
    };

    if text.is_none() && embedding.is_none() {
        return Err(RetrievalError::EmptyQuery);
    }

    Ok(RetrievalQuery {
        text,
        embedding,
        top_k: Some(need.top_k),
        filters: need.filters.clone(),
    })
}

fn joined_strings(payload: &Value) -> Option<String> {
    let joined = payload
        .as_object()?
        .values()
        .filter_map(Value::as_str)
        .filter(|s| !s.trim().is_empty())
        .collect::<Vec<_>>()
        .join(" ");
    (!joined.is_empty()).then_some(joined)
}

fn embedding_from(value: &Value) -> Result<Vec<f32>, RetrievalError> {
    let items = value
        .as_array()
        .ok_or_else(|| RetrievalError::InvalidQuery("query_embedding must be an array".into()))?;
    items
        .iter()
        .map(|v| {
            v.as_f64().map(|x| x as f32).ok_or_else(|| {
                RetrievalError::InvalidQuery("query_embedding must contain only numbers".into())
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use relay_core::MetadataFilter;
    use serde_json::json;

    fn need() -> RetrievalNeed {
        RetrievalNeed {
            top_k: 3,
            filters: vec![MetadataFilter::eq("source", "guideline")],
        }
    }

    #[test]
    fn test_query_field_wins() {
        let query = retrieval_query(&json!({"query": "beta blockers", "text": "ignored"}), &need()).unwrap();
        assert_eq!(query.text.as_deref(), Some("beta blockers"));
        assert_eq!(query.top_k, Some(3));
        assert_eq!(query.filters.len(), 1);
    }

    #[test]
    fn test_falls_back_to_joined_strings() {
        let query = retrieval_query(&json!({"a": "renal", "b": 4, "c": "dosing"}), &need()).unwrap();
        assert_eq!(query.text.as_deref(), Some("renal dosing"));
    }

    #[test]
    fn test_embedding_only() {
        let query = retrieval_query(&json!({"query_embedding": [0.5, 1]}), &need()).unwrap();
        assert_eq!(query.text, None);
        assert_eq!(query.embedding, Some(vec![0.5, 1.0]));
    }

    #[test]
    fn test_bad_embedding_rejected() {
        assert!(matches!(
            retrieval_query(&json!({"text": "x", "query_embedding": ["a"]}), &need()),
            Err(RetrievalError::InvalidQuery(_))
        ));
    }

    #[test]
    fn test_nothing_to_search_for() {
        assert!(matches!(
            retrieval_query(&json!({"count": 3}), &need()),
            Err(RetrievalError::EmptyQuery)
        ));
    }
}
