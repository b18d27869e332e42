//! Reciprocal rank fusion
//!
//! Lexical and semantic scores live on different scales, so lists are
//! combined by rank: `fused(d) = Σ 1 / (k + rank_in_list(d))`, with
//! 1-based ranks. A document missing from a list gets nothing from it.

use std::collections::BTreeMap;

/// Per-document scores from one ranked list, already ordered best first
pub type RankedList<'a> = Vec<(&'a str, f64)>;

/// Fused score with the raw scores that produced it
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct FusedScore {
    pub fused: f64,
    pub lexical: Option<f64>,
    pub semantic: Option<f64>,
}

/// Sort best first; ties broken by doc id
pub fn sort_ranked(list: &mut RankedList<'_>) {
    list.sort_by(|a, b| b.1.total_cmp(&a.1).then_with(|| a.0.cmp(b.0)));
}

/// Fuse a lexical and a semantic list into `(doc_id, score)` ordered by
/// descending fused score, then doc id
pub fn reciprocal_rank_fusion<'a>(
    lexical: &RankedList<'a>,
    semantic: &RankedList<'a>,
    k: f64,
) -> Vec<(&'a str, FusedScore)> {
    let mut fused: BTreeMap<&'a str, FusedScore> = BTreeMap::new();

    for (rank, (doc_id, score)) in lexical.iter().enumerate() {
        let entry = fused.entry(*doc_id).or_default();
        entry.fused += 1.0 / (k + (rank + 1) as f64);
        entry.lexical = Some(*score);
    }
    for (rank, (doc_id, score)) in semantic.iter().enumerate() {
        let entry = fused.entry(*doc_id).or_default();
        entry.fused += 1.0 / (k + (rank + 1) as f64);
        entry.semantic = Some(*score);
    }

    let mut ordered: Vec<_> = fused.into_iter().collect();
    ordered.sort_by(|a, b| b.1.fused.total_cmp(&a.1.fused).then_with(|| a.0.cmp(b.0)));
    ordered
}
