//! The unit of persistence: one generation of index state.
//!
//! An [`IndexSnapshot`] bundles the manifest it was built from, the chunk
//! table, and both indices. Updates clone the published snapshot, patch the
//! clone, and publish it as a whole; the published value is never mutated.
//!
//! Invariants checked by [`IndexSnapshot::validate`]:
//!
//! - every chunk's source path has a live record in the manifest;
//! - every chunk is in the sparse index, and the sparse index holds nothing else;
//! - every chunk is either in the dense index or in the stale set, never both,
//!   and neither holds ids outside the chunk table.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::dense::{DenseIndex, DenseIndexError};
use crate::digest::ContentDigest;
use crate::hybrid::{HybridHit, HybridRetriever};
use crate::manifest::Manifest;
use crate::models::{Chunk, ChunkRef};
use crate::sparse::SparseIndex;

/// Version of the snapshot layout. Bumped on any incompatible change.
pub const SNAPSHOT_SCHEMA_VERSION: u32 = 1;

/// Chunk table entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkMeta {
    pub source_path: String,
    pub start_offset: usize,
    pub end_offset: usize,
    pub content_digest: ContentDigest,
    pub text: String,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
#[error("snapshot invariant violated: {0}")]
pub struct InvariantError(pub String);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexSnapshot {
    pub schema_version: u32,
    /// Model whose vectors populate the dense index.
    pub model_id: String,
    pub manifest: Manifest,
    pub chunks: BTreeMap<String, ChunkMeta>,
    pub dense: DenseIndex,
    pub sparse: SparseIndex,
    /// Chunks indexed for sparse search but still missing a vector.
    pub stale: BTreeSet<String>,
}

impl IndexSnapshot {
    pub fn empty(model_id: impl Into<String>) -> Self {
        Self {
            schema_version: SNAPSHOT_SCHEMA_VERSION,
            model_id: model_id.into(),
            manifest: Manifest::empty(),
            chunks: BTreeMap::new(),
            dense: DenseIndex::new(),
            sparse: SparseIndex::new(),
            stale: BTreeSet::new(),
        }
    }

    pub fn chunk_count(&self) -> usize {
        self.chunks.len()
    }

    /// Ids of the chunks cut from `path`, in offset-key order.
    pub fn chunk_ids_for_path(&self, path: &str) -> Vec<String> {
        let prefix = format!("{path}#");
        self.chunks
            .range(prefix.clone()..)
            .take_while(|(id, _)| id.starts_with(&prefix))
            .filter(|(_, meta)| meta.source_path == path)
            .map(|(id, _)| id.clone())
            .collect()
    }

    /// Remove every chunk of `path` from the table and both indices.
    /// Returns how many chunks were removed.
    pub fn purge_path(&mut self, path: &str) -> usize {
        let ids = self.chunk_ids_for_path(path);
        for id in &ids {
            self.chunks.remove(id);
            self.sparse.remove(id);
            self.dense.remove(id);
            self.stale.remove(id);
        }
        ids.len()
    }

    /// Add a chunk to the table and the sparse index. It stays stale until
    /// [`attach_vector`](Self::attach_vector) is called for it.
    pub fn insert_chunk(&mut self, chunk: Chunk) {
        self.sparse.add(&chunk.chunk_id, &chunk.text);
        self.dense.remove(&chunk.chunk_id);
        self.stale.insert(chunk.chunk_id.clone());
        self.chunks.insert(
            chunk.chunk_id,
            ChunkMeta {
                source_path: chunk.source_path,
                start_offset: chunk.start_offset,
                end_offset: chunk.end_offset,
                content_digest: chunk.content_digest,
                text: chunk.text,
            },
        );
    }

    /// Store the vector for a known chunk and clear its stale mark.
    pub fn attach_vector(&mut self, chunk_id: &str, vector: Vec<f32>) -> Result<(), DenseIndexError> {
        self.dense.add(chunk_id, vector)?;
        self.stale.remove(chunk_id);
        Ok(())
    }

    /// Drop every vector and mark all chunks stale under a new model.
    pub fn reset_vectors(&mut self, model_id: impl Into<String>) {
        self.model_id = model_id.into();
        self.dense.clear();
        self.stale = self.chunks.keys().cloned().collect();
    }

    /// Rebuild a [`Chunk`] from the table.
    pub fn chunk(&self, chunk_id: &str) -> Option<Chunk> {
        self.chunks.get(chunk_id).map(|meta| Chunk {
            chunk_id: chunk_id.to_string(),
            source_path: meta.source_path.clone(),
            text: meta.text.clone(),
            start_offset: meta.start_offset,
            end_offset: meta.end_offset,
            content_digest: meta.content_digest,
        })
    }

    pub fn validate(&self) -> Result<(), InvariantError> {
        for (id, meta) in &self.chunks {
            if !self.manifest.contains(&meta.source_path) {
                return Err(InvariantError(format!(
                    "chunk {id} references {} which is not in the manifest",
                    meta.source_path
                )));
            }
            if !self.sparse.contains(id) {
                return Err(InvariantError(format!("chunk {id} missing from sparse index")));
            }
            match (self.dense.contains(id), self.stale.contains(id)) {
                (true, true) => {
                    return Err(InvariantError(format!("chunk {id} is both embedded and stale")))
                }
                (false, false) => {
                    return Err(InvariantError(format!("chunk {id} has no vector and is not stale")))
                }
                _ => {}
            }
        }
        if self.sparse.len() != self.chunks.len() {
            return Err(InvariantError(
                "sparse index holds documents outside the chunk table".to_string(),
            ));
        }
        if let Some(id) = self
            .dense
            .ids()
            .chain(self.stale.iter().map(String::as_str))
            .find(|id| !self.chunks.contains_key(*id))
        {
            return Err(InvariantError(format!("unknown chunk id {id}")));
        }
        Ok(())
    }

    /// Run a hybrid query and resolve hits to chunk references.
    pub fn search(
        &self,
        retriever: &HybridRetriever,
        query_text: &str,
        query_vector: &[f32],
        top_k: usize,
    ) -> Result<Vec<ChunkRef>, DenseIndexError> {
        let hits = retriever.search(&self.dense, &self.sparse, query_text, query_vector, top_k)?;
        Ok(self.resolve(hits))
    }

    /// Rank by the sparse index alone, for when no comparable query vector
    /// exists.
    pub fn search_sparse(
        &self,
        retriever: &HybridRetriever,
        query_text: &str,
        top_k: usize,
    ) -> Vec<ChunkRef> {
        let depth = retriever.candidate_k.max(top_k);
        let sparse = self.sparse.search(query_text, depth);
        self.resolve(retriever.merge(&[], &sparse, top_k))
    }

    fn resolve(&self, hits: Vec<HybridHit>) -> Vec<ChunkRef> {
        hits.into_iter()
            .filter_map(|hit| {
                let meta = self.chunks.get(&hit.chunk_id)?;
                Some(ChunkRef {
                    chunk_id: hit.chunk_id,
                    source_path: meta.source_path.clone(),
                    start_offset: meta.start_offset,
                    end_offset: meta.end_offset,
                    score: hit.score,
                    dense_score: hit.dense_score,
                    sparse_score: hit.sparse_score,
                    text: meta.text.clone(),
                })
            })
            .collect()
    }
}
