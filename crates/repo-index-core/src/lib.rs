//! # Repo Index Core
//!
//! Pure logic for the repository knowledge index: content digests, versioned
//! manifests and their diff, the chunker, the BM25 sparse index, the exact
//! cosine dense index, hybrid merging, the snapshot model, and the embedding
//! provider trait.
//!
//! This crate performs no filesystem, network or database I/O and has no
//! async runtime dependency. Scanning, persistence, the embedding cache and
//! the update coordinator live in the `repo-index` crate.

pub mod chunk;
pub mod dense;
pub mod digest;
pub mod embedding;
pub mod hybrid;
pub mod manifest;
pub mod models;
pub mod snapshot;
pub mod sparse;
