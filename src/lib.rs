//! # Repository Index
//!
//! An incremental, local knowledge index over one source repository.
//!
//! The repository is scanned into a content-addressed manifest, files are cut
//! into chunks, and every chunk is indexed twice: in a BM25 sparse index and,
//! through an injected embedding provider, in a dense vector index. Queries
//! merge both rankings into one deterministic list of chunk references
//! (source path plus byte offsets).
//!
//! Re-indexing is incremental: each update diffs the new manifest against
//! the previous one and only re-chunks added or modified files. Embeddings
//! are cached by chunk content digest and model, so unchanged text is never
//! sent to the provider twice.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────┐   ┌──────────┐   ┌─────────────┐   ┌──────────────┐
//! │   scan   │──▶│ manifest │──▶│ coordinator │──▶│ snapshot.json│
//! │ +ignore  │   │   diff   │   │ chunk+embed │   │ (atomic)     │
//! └──────────┘   └──────────┘   └──────┬──────┘   └──────┬───────┘
//!                                      │                 │
//!                              ┌───────▼───────┐   ┌─────▼─────┐
//!                              │ embedding     │   │  query    │
//!                              │ cache (SQLite)│   │ BM25+dense│
//!                              └───────────────┘   └───────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! rix update                          # index the current directory
//! rix query "where are retries handled" --top-k 5
//! rix status
//! rix diff                            # what would the next update change
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`ignore`] | Gitignore-style ignore rules |
//! | [`scan`] | File-tree scanning into a manifest |
//! | [`store`] | Snapshot and manifest persistence |
//! | [`lock`] | Per-index update lock |
//! | [`cache`] | SQLite embedding cache |
//! | [`embedding`] | Embedding provider construction |
//! | [`coordinator`] | Update/query state machine |
//! | [`progress`] | Update progress reporting |
//!
//! Pure index structures (digests, chunker, BM25, dense, hybrid merge,
//! snapshot model) live in the `repo-index-core` crate.

pub mod cache;
pub mod config;
pub mod coordinator;
pub mod embedding;
pub mod error;
pub mod ignore;
pub mod lock;
pub mod manifest_cmd;
pub mod progress;
pub mod scan;
pub mod search;
pub mod stats;
pub mod store;
pub mod update_cmd;
pub mod workspace;

pub use coordinator::{IndexCoordinator, IndexState, UpdateIssue, UpdateReport};
pub use error::{IndexError, Result};
