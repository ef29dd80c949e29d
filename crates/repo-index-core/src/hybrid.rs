//! Hybrid retrieval: merge dense and sparse rankings into one list.
//!
//! # Algorithm
//!
//! 1. Fetch up to `candidate_k` results from each index independently.
//! 2. Min-max normalize each result set's raw scores to `[0, 1]`. A set whose
//!    scores are all equal normalizes to `1.0`.
//! 3. Combine per chunk: `score = α · dense_norm + (1 − α) · sparse_norm`,
//!    where a chunk missing from one set contributes `0.0` for it.
//! 4. Sort by combined score descending, then by raw dense score descending
//!    (a chunk with no dense score sorts after one that has it), then by
//!    chunk id ascending.
//! 5. Truncate to `top_k`.
//!
//! Identical indices and inputs therefore always produce identical output.

use std::cmp::Ordering;
use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::dense::{DenseIndex, DenseIndexError};
use crate::sparse::SparseIndex;

/// One merged result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HybridHit {
    pub chunk_id: String,
    pub score: f64,
    pub dense_score: Option<f64>,
    pub sparse_score: Option<f64>,
}

/// Weighted merge of dense and sparse rankings.
#[derive(Debug, Clone, PartialEq)]
pub struct HybridRetriever {
    /// Weight of the dense contribution, in `[0, 1]`.
    pub alpha: f64,
    /// Per-index candidate depth before merging.
    pub candidate_k: usize,
}

impl Default for HybridRetriever {
    fn default() -> Self {
        Self {
            alpha: 0.6,
            candidate_k: 50,
        }
    }
}

/// Min-max normalize raw scores to `[0.0, 1.0]`.
pub fn normalize_scores(results: &[(String, f64)]) -> BTreeMap<&str, f64> {
    if results.is_empty() {
        return BTreeMap::new();
    }
    let min = results.iter().map(|(_, s)| *s).fold(f64::INFINITY, f64::min);
    let max = results.iter().map(|(_, s)| *s).fold(f64::NEG_INFINITY, f64::max);

    results
        .iter()
        .map(|(id, s)| {
            let norm = if (max - min).abs() < f64::EPSILON {
                1.0
            } else {
                (s - min) / (max - min)
            };
            (id.as_str(), norm)
        })
        .collect()
}

fn compare_hits(a: &HybridHit, b: &HybridHit) -> Ordering {
    let dense = |h: &HybridHit| h.dense_score.unwrap_or(f64::NEG_INFINITY);
    b.score
        .total_cmp(&a.score)
        .then_with(|| dense(b).total_cmp(&dense(a)))
        .then_with(|| a.chunk_id.cmp(&b.chunk_id))
}

impl HybridRetriever {
    pub fn new(alpha: f64, candidate_k: usize) -> Self {
        Self {
            alpha: alpha.clamp(0.0, 1.0),
            candidate_k,
        }
    }

    /// Merge two ranked result sets.
    pub fn merge(
        &self,
        dense: &[(String, f64)],
        sparse: &[(String, f64)],
        top_k: usize,
    ) -> Vec<HybridHit> {
        let dense_norm = normalize_scores(dense);
        let sparse_norm = normalize_scores(sparse);
        let dense_raw: BTreeMap<&str, f64> = dense.iter().map(|(id, s)| (id.as_str(), *s)).collect();
        let sparse_raw: BTreeMap<&str, f64> =
            sparse.iter().map(|(id, s)| (id.as_str(), *s)).collect();

        let mut ids: Vec<&str> = dense_raw.keys().chain(sparse_raw.keys()).copied().collect();
        ids.sort_unstable();
        ids.dedup();

        let mut hits: Vec<HybridHit> = ids
            .into_iter()
            .map(|id| {
                let d = dense_norm.get(id).copied().unwrap_or(0.0);
                let s = sparse_norm.get(id).copied().unwrap_or(0.0);
                HybridHit {
                    chunk_id: id.to_string(),
                    score: self.alpha * d + (1.0 - self.alpha) * s,
                    dense_score: dense_raw.get(id).copied(),
                    sparse_score: sparse_raw.get(id).copied(),
                }
            })
            .collect();

        hits.sort_by(compare_hits);
        hits.truncate(top_k);
        hits
    }

    /// Query both indices and merge.
    pub fn search(
        &self,
        dense: &DenseIndex,
        sparse: &SparseIndex,
        query_text: &str,
        query_vector: &[f32],
        top_k: usize,
    ) -> Result<Vec<HybridHit>, DenseIndexError> {
        let depth = self.candidate_k.max(top_k);
        let dense_hits = dense.search(query_vector, depth)?;
        let sparse_hits = sparse.search(query_text, depth);
        Ok(self.merge(&dense_hits, &sparse_hits, top_k))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn r(items: &[(&str, f64)]) -> Vec<(String, f64)> {
        items.iter().map(|(id, s)| (id.to_string(), *s)).collect()
    }

    fn ids(hits: &[HybridHit]) -> Vec<&str> {
        hits.iter().map(|h| h.chunk_id.as_str()).collect()
    }

    #[test]
    fn normalize_empty_single_and_range() {
        assert!(normalize_scores(&[]).is_empty());

        let single = r(&[("a", 3.3)]);
        assert_eq!(normalize_scores(&single)["a"], 1.0);

        let range = r(&[("a", 2.0), ("b", 4.0), ("c", 3.0)]);
        let n = normalize_scores(&range);
        assert_eq!(n["a"], 0.0);
        assert_eq!(n["b"], 1.0);
        assert!((n["c"] - 0.5).abs() < 1e-12);
    }

    #[test]
    fn alpha_extremes_follow_one_side() {
        let dense = r(&[("x", 0.9), ("y", 0.5), ("z", 0.1)]);
        let sparse = r(&[("z", 8.0), ("y", 4.0), ("x", 1.0)]);

        let dense_only = HybridRetriever::new(1.0, 10).merge(&dense, &sparse, 3);
        assert_eq!(ids(&dense_only), vec!["x", "y", "z"]);

        let sparse_only = HybridRetriever::new(0.0, 10).merge(&dense, &sparse, 3);
        assert_eq!(ids(&sparse_only), vec!["z", "y", "x"]);
    }

    #[test]
    fn chunks_from_one_side_still_rank() {
        let dense = r(&[("a", 0.8), ("b", 0.2)]);
        let sparse = r(&[("c", 5.0)]);
        let hits = HybridRetriever::new(0.5, 10).merge(&dense, &sparse, 10);
        assert_eq!(hits.len(), 3);
        let c = hits.iter().find(|h| h.chunk_id == "c").unwrap();
        assert_eq!(c.dense_score, None);
        assert_eq!(c.sparse_score, Some(5.0));
        assert!(hits.iter().all(|h| (0.0..=1.0).contains(&h.score)));
    }

    #[test]
    fn ties_prefer_higher_raw_dense_then_id() {
        // Both have combined score 0.5; "b" has the higher raw dense score.
        let dense = r(&[("b", 0.9), ("a", 0.3)]);
        let sparse = r(&[("a", 2.0), ("b", 1.0)]);
        let hits = HybridRetriever::new(0.5, 10).merge(&dense, &sparse, 10);
        assert_eq!(hits[0].score, hits[1].score);
        assert_eq!(ids(&hits), vec!["b", "a"]);

        // Equal everything but id.
        let dense = r(&[("k2", 0.5), ("k1", 0.5)]);
        let hits = HybridRetriever::new(1.0, 10).merge(&dense, &[], 10);
        assert_eq!(ids(&hits), vec!["k1", "k2"]);

        // A dense-scored hit beats a sparse-only hit with the same combined score.
        let dense = r(&[("d", 0.4)]);
        let sparse = r(&[("s", 3.0)]);
        let hits = HybridRetriever::new(0.5, 10).merge(&dense, &sparse, 10);
        assert_eq!(ids(&hits), vec!["d", "s"]);
    }

    #[test]
    fn merge_is_deterministic_and_truncates() {
        let dense = r(&[("a", 0.1), ("b", 0.7), ("c", 0.4), ("d", 0.4)]);
        let sparse = r(&[("d", 1.0), ("e", 2.0)]);
        let retriever = HybridRetriever::default();
        let first = retriever.merge(&dense, &sparse, 3);
        let second = retriever.merge(&dense, &sparse, 3);
        assert_eq!(first, second);
        assert_eq!(first.len(), 3);
    }

    #[test]
    fn search_queries_both_indices() {
        let mut dense = DenseIndex::new();
        dense.add("code", vec![1.0, 0.0]).unwrap();
        dense.add("docs", vec![0.0, 1.0]).unwrap();
        let mut sparse = SparseIndex::new();
        sparse.add("code", "fn parse_config");
        sparse.add("docs", "how to configure");

        let hits = HybridRetriever::default()
            .search(&dense, &sparse, "parse", &[0.9, 0.1], 2)
            .unwrap();
        assert_eq!(hits[0].chunk_id, "code");
        assert!(hits[0].sparse_score.is_some());

        assert!(HybridRetriever::default()
            .search(&dense, &sparse, "parse", &[1.0, 0.0, 0.0], 2)
            .is_err());
    }
}
