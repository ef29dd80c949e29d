//! Exact cosine-similarity index over chunk embeddings.
//!
//! At single-repository scale (thousands to low tens of thousands of chunks)
//! a brute-force scan is fast enough and keeps add/remove trivial. All
//! vectors share one dimensionality, fixed by the first insertion.
//!
//! Vectors persist as base64-encoded little-endian `f32` blobs.

use std::collections::BTreeMap;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde::{Deserialize, Serialize};

use crate::embedding::{blob_to_vec, vec_to_blob};

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum DenseIndexError {
    #[error("vector dimension mismatch: index holds {expected}-dimensional vectors, got {found}")]
    DimensionMismatch { expected: usize, found: usize },
    #[error("empty vector for {0}")]
    EmptyVector(String),
    #[error("vector for {id} is not valid base64 f32 data: {reason}")]
    Encoding { id: String, reason: String },
}

#[derive(Serialize, Deserialize)]
struct DenseIndexData {
    dims: Option<usize>,
    vectors: BTreeMap<String, String>,
}

/// Exact nearest-neighbour index keyed by chunk id.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "DenseIndexData", into = "DenseIndexData")]
pub struct DenseIndex {
    dims: Option<usize>,
    vectors: BTreeMap<String, Vec<f32>>,
}

impl TryFrom<DenseIndexData> for DenseIndex {
    type Error = DenseIndexError;

    fn try_from(data: DenseIndexData) -> Result<Self, Self::Error> {
        let mut index = DenseIndex {
            dims: data.dims,
            vectors: BTreeMap::new(),
        };
        for (id, encoded) in data.vectors {
            let bytes = BASE64.decode(&encoded).map_err(|e| DenseIndexError::Encoding {
                id: id.clone(),
                reason: e.to_string(),
            })?;
            if bytes.len() % 4 != 0 {
                return Err(DenseIndexError::Encoding {
                    id,
                    reason: format!("{} bytes is not a whole number of f32s", bytes.len()),
                });
            }
            index.add(&id, blob_to_vec(&bytes))?;
        }
        Ok(index)
    }
}

impl From<DenseIndex> for DenseIndexData {
    fn from(index: DenseIndex) -> Self {
        Self {
            dims: index.dims,
            vectors: index
                .vectors
                .into_iter()
                .map(|(id, v)| (id, BASE64.encode(vec_to_blob(&v))))
                .collect(),
        }
    }
}

impl DenseIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Dimensionality of stored vectors, once any has been added.
    pub fn dims(&self) -> Option<usize> {
        self.dims
    }

    pub fn len(&self) -> usize {
        self.vectors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vectors.is_empty()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.vectors.contains_key(id)
    }

    pub fn get(&self, id: &str) -> Option<&[f32]> {
        self.vectors.get(id).map(Vec::as_slice)
    }

    pub fn ids(&self) -> impl Iterator<Item = &str> {
        self.vectors.keys().map(String::as_str)
    }

    /// Insert or replace the vector for `id`.
    pub fn add(&mut self, id: &str, vector: Vec<f32>) -> Result<(), DenseIndexError> {
        if vector.is_empty() {
            return Err(DenseIndexError::EmptyVector(id.to_string()));
        }
        match self.dims {
            Some(expected) if expected != vector.len() => {
                return Err(DenseIndexError::DimensionMismatch {
                    expected,
                    found: vector.len(),
                })
            }
            Some(_) => {}
            None => self.dims = Some(vector.len()),
        }
        self.vectors.insert(id.to_string(), vector);
        Ok(())
    }

    /// Remove the vector for `id`. Returns whether it was present.
    ///
    /// The dimensionality is kept even when the index becomes empty.
    pub fn remove(&mut self, id: &str) -> bool {
        self.vectors.remove(id).is_some()
    }

    /// Drop every vector and forget the dimensionality.
    pub fn clear(&mut self) {
        self.vectors.clear();
        self.dims = None;
    }

    /// Rank stored vectors by cosine similarity to `query`, descending, ties
    /// by ascending id.
    pub fn search(&self, query: &[f32], top_k: usize) -> Result<Vec<(String, f64)>, DenseIndexError> {
        if top_k == 0 || self.vectors.is_empty() {
            return Ok(Vec::new());
        }
        if let Some(expected) = self.dims {
            if expected != query.len() {
                return Err(DenseIndexError::DimensionMismatch {
                    expected,
                    found: query.len(),
                });
            }
        }

        let mut ranked: Vec<(String, f64)> = self
            .vectors
            .iter()
            .map(|(id, v)| (id.clone(), f64::from(cosine_similarity(query, v))))
            .collect();
        ranked.sort_by(|a, b| b.1.total_cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        ranked.truncate(top_k);
        Ok(ranked)
    }
}

/// Cosine similarity in `[-1, 1]`; `0.0` for empty, zero or mismatched vectors.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }

    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;
    for (x, y) in a.iter().zip(b) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }

    let denom = norm_a.sqrt() * norm_b.sqrt();
    if denom < f32::EPSILON {
        return 0.0;
    }
    dot / denom
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cosine_basics() {
        let v = [1.0, 2.0, 3.0];
        assert!((cosine_similarity(&v, &v) - 1.0).abs() < 1e-6);
        assert!(cosine_similarity(&[1.0, 0.0], &[0.0, 1.0]).abs() < 1e-6);
        assert!((cosine_similarity(&[1.0, 0.0], &[-1.0, 0.0]) + 1.0).abs() < 1e-6);
        assert_eq!(cosine_similarity(&[], &[]), 0.0);
        assert_eq!(cosine_similarity(&[1.0, 2.0], &[1.0]), 0.0);
        assert_eq!(cosine_similarity(&[0.0, 0.0], &[1.0, 1.0]), 0.0);
    }

    #[test]
    fn search_orders_by_similarity() {
        let mut idx = DenseIndex::new();
        idx.add("x", vec![1.0, 0.0]).unwrap();
        idx.add("y", vec![0.0, 1.0]).unwrap();
        idx.add("z", vec![0.7, 0.7]).unwrap();

        let hits = idx.search(&[1.0, 0.1], 3).unwrap();
        let ids: Vec<&str> = hits.iter().map(|(id, _)| id.as_str()).collect();
        assert_eq!(ids, vec!["x", "z", "y"]);
        assert_eq!(idx.search(&[1.0, 0.0], 1).unwrap().len(), 1);
    }

    #[test]
    fn rejects_dimension_mismatch() {
        let mut idx = DenseIndex::new();
        idx.add("a", vec![1.0, 2.0, 3.0]).unwrap();
        assert_eq!(
            idx.add("b", vec![1.0]),
            Err(DenseIndexError::DimensionMismatch { expected: 3, found: 1 })
        );
        assert!(idx.search(&[1.0, 2.0], 5).is_err());
        assert!(idx.add("c", vec![]).is_err());
    }

    #[test]
    fn remove_is_incremental() {
        let mut idx = DenseIndex::new();
        idx.add("a", vec![1.0, 0.0]).unwrap();
        idx.add("b", vec![0.9, 0.1]).unwrap();
        assert!(idx.remove("a"));
        assert!(!idx.remove("a"));
        let hits = idx.search(&[1.0, 0.0], 5).unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].0, "b");
        assert_eq!(idx.dims(), Some(2));
    }

    #[test]
    fn ties_break_by_id() {
        let mut idx = DenseIndex::new();
        idx.add("b", vec![1.0, 0.0]).unwrap();
        idx.add("a", vec![2.0, 0.0]).unwrap();
        let hits = idx.search(&[1.0, 0.0], 2).unwrap();
        assert_eq!(hits[0].0, "a");
        assert_eq!(hits[1].0, "b");
    }

    #[test]
    fn serde_uses_base64_blobs() {
        let mut idx = DenseIndex::new();
        idx.add("a", vec![1.0, -2.5, 3.125]).unwrap();
        let json = serde_json::to_string(&idx).unwrap();
        assert!(json.contains(&BASE64.encode(vec_to_blob(&[1.0, -2.5, 3.125]))));
        let back: DenseIndex = serde_json::from_str(&json).unwrap();
        assert_eq!(back, idx);
    }

    #[test]
    fn deserialize_rejects_inconsistent_dims() {
        let json = format!(
            r#"{{"dims":2,"vectors":{{"a":"{}"}}}}"#,
            BASE64.encode(vec_to_blob(&[1.0, 2.0, 3.0]))
        );
        assert!(serde_json::from_str::<DenseIndex>(&json).is_err());
        assert!(serde_json::from_str::<DenseIndex>(r#"{"dims":2,"vectors":{"a":"!!"}}"#).is_err());
    }
}
