//! Index lifecycle state machine.
//!
//! ```text
//! EMPTY ──► SCANNING ──► DIFFING ──► UPDATING ──► PERSISTED
//!                                       │
//!                                       ▼
//!                                    FAILED ──► (last PERSISTED, or EMPTY)
//! ```
//!
//! An update never mutates the published snapshot. It clones it, patches the
//! clone with the manifest diff, embeds whatever is stale, publishes the
//! result atomically and only then swaps the in-memory reference. Queries
//! keep reading the old snapshot until that swap.
//!
//! Updates on one storage directory are serialized by [`IndexLock`]. Scan
//! errors, lock contention and cancellation leave the state where it was.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::{Duration, Instant};

use repo_index_core::chunk::{chunk, ChunkerConfig};
use repo_index_core::embedding::EmbeddingProvider;
use repo_index_core::hybrid::HybridRetriever;
use repo_index_core::manifest::{self, Manifest, ManifestDiff};
use repo_index_core::models::{Chunk, ChunkRef, FileRecord};
use repo_index_core::snapshot::IndexSnapshot;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::cache::{embed_uncached, CacheOptions, EmbeddingCache};
use crate::config::Config;
use crate::error::{IndexError, Result};
use crate::ignore::IgnoreRules;
use crate::lock::{IndexLock, LockOptions};
use crate::progress::{NoProgress, UpdateProgressEvent, UpdateProgressReporter};
use crate::scan::{read_indexable_text, scan, ScanOptions, ScanWarning};
use crate::store::SnapshotStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum IndexState {
    Empty,
    Scanning,
    Diffing,
    Updating,
    Persisted,
    Failed,
}

impl IndexState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Empty => "EMPTY",
            Self::Scanning => "SCANNING",
            Self::Diffing => "DIFFING",
            Self::Updating => "UPDATING",
            Self::Persisted => "PERSISTED",
            Self::Failed => "FAILED",
        }
    }
}

impl fmt::Display for IndexState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A chunk that could not be embedded. It stays searchable through the
/// sparse index and is retried on the next update.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UpdateIssue {
    pub path: String,
    pub chunk_id: Option<String>,
    pub message: String,
}

/// Outcome of a successful update.
#[derive(Debug, Clone, Default, Serialize)]
pub struct UpdateReport {
    pub added: Vec<String>,
    pub modified: Vec<String>,
    pub removed: Vec<String>,
    pub unchanged: usize,
    /// Chunks whose vector was computed by the provider in this update.
    pub chunks_reembedded: usize,
    /// Chunks that needed a vector and found it in the embedding cache.
    pub chunks_reused: usize,
    /// Chunks still without a vector after this update.
    pub stale_chunks: usize,
    pub warnings: Vec<ScanWarning>,
    pub errors: Vec<UpdateIssue>,
    /// Fingerprint of the published manifest.
    pub fingerprint: String,
    pub duration_ms: u64,
}

pub struct IndexCoordinator {
    store: SnapshotStore,
    config: Config,
    provider: Arc<dyn EmbeddingProvider>,
    cache: EmbeddingCache,
    retriever: HybridRetriever,
    progress: Box<dyn UpdateProgressReporter>,
    published: RwLock<Option<Arc<IndexSnapshot>>>,
    state: Mutex<IndexState>,
    last_failure: Mutex<Option<String>>,
}

impl IndexCoordinator {
    /// Open the index stored in `storage_dir`.
    ///
    /// Loads the published snapshot if there is one (state PERSISTED),
    /// otherwise starts EMPTY. Fails on corrupt or version-mismatched state.
    pub async fn open(
        storage_dir: impl Into<PathBuf>,
        config: Config,
        provider: Arc<dyn EmbeddingProvider>,
    ) -> Result<Self> {
        let store = SnapshotStore::new(storage_dir);
        let published = store.load()?.map(Arc::new);
        let state = if published.is_some() {
            IndexState::Persisted
        } else {
            IndexState::Empty
        };
        let cache = EmbeddingCache::open(
            &store.cache_path(),
            CacheOptions::from(&config.embedding),
        )
        .await?;
        let retriever = HybridRetriever::new(
            config.retrieval.hybrid_alpha,
            config.retrieval.candidate_k,
        );

        debug!(dir = %store.dir().display(), state = %state, model = provider.model_id(), "opened index");
        Ok(Self {
            store,
            config,
            provider,
            cache,
            retriever,
            progress: Box::new(NoProgress),
            published: RwLock::new(published),
            state: Mutex::new(state),
            last_failure: Mutex::new(None),
        })
    }

    pub fn with_progress(mut self, reporter: Box<dyn UpdateProgressReporter>) -> Self {
        self.progress = reporter;
        self
    }

    pub fn state(&self) -> IndexState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Message of the most recent failed update, cleared by a successful one.
    pub fn last_failure(&self) -> Option<String> {
        self.last_failure
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// The published snapshot, if any.
    pub fn snapshot(&self) -> Option<Arc<IndexSnapshot>> {
        self.published
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn store(&self) -> &SnapshotStore {
        &self.store
    }

    pub fn cache(&self) -> &EmbeddingCache {
        &self.cache
    }

    fn set_state(&self, state: IndexState) {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner) = state;
    }

    fn set_failure(&self, failure: Option<String>) {
        *self
            .last_failure
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = failure;
    }

    /// Return to the last persisted state.
    fn settle(&self) {
        let state = if self.snapshot().is_some() {
            IndexState::Persisted
        } else {
            IndexState::Empty
        };
        self.set_state(state);
    }

    fn lock_options(&self) -> LockOptions {
        LockOptions {
            timeout: Duration::from_millis(self.config.index.lock_timeout_ms),
        }
    }

    pub async fn update(&self, root: &Path, rules: &IgnoreRules) -> Result<UpdateReport> {
        self.update_with_cancel(root, rules, &CancellationToken::new())
            .await
    }

    /// Bring the index up to date with the tree at `root`.
    ///
    /// `cancel` is honoured after scanning, between embedding batches and
    /// right before publication.
    pub async fn update_with_cancel(
        &self,
        root: &Path,
        rules: &IgnoreRules,
        cancel: &CancellationToken,
    ) -> Result<UpdateReport> {
        let started = Instant::now();
        let _lock = IndexLock::acquire(&self.store.lock_path(), self.lock_options()).await?;
        let base = self.snapshot();

        self.set_state(IndexState::Scanning);
        self.progress.report(UpdateProgressEvent::Scanning);
        let scan_root = root.to_path_buf();
        let scan_rules = rules.clone();
        let scan_options = ScanOptions::from(&self.config.scan);
        let scanned = tokio::task::spawn_blocking(move || {
            scan(&scan_root, &scan_rules, &scan_options)
        })
        .await
        .map_err(IndexError::from)
        .and_then(|result| result);
        let scanned = match scanned {
            Ok(scanned) => scanned,
            Err(e) => {
                self.settle();
                return Err(e);
            }
        };
        if cancel.is_cancelled() {
            self.settle();
            return Err(IndexError::Cancelled);
        }

        self.set_state(IndexState::Diffing);
        let mut next = base
            .as_deref()
            .cloned()
            .unwrap_or_else(|| IndexSnapshot::empty(self.provider.model_id()));
        let diff = manifest::diff(&next.manifest, &scanned.manifest);
        self.progress.report(UpdateProgressEvent::Diffing {
            added: diff.added.len(),
            modified: diff.modified.len(),
            removed: diff.removed.len(),
        });
        info!(
            added = diff.added.len(),
            modified = diff.modified.len(),
            removed = diff.removed.len(),
            unchanged = diff.unchanged.len(),
            "manifest diff"
        );

        let mut report = UpdateReport {
            added: diff.added_paths(),
            modified: diff.modified_paths(),
            removed: diff.removed.clone(),
            unchanged: diff.unchanged.len(),
            warnings: scanned.warnings,
            ..UpdateReport::default()
        };

        self.set_state(IndexState::Updating);
        let result = match self
            .patch(&mut next, &diff, scanned.manifest, root, cancel, &mut report)
            .await
        {
            Ok(()) => self.publish(next).await,
            Err(e) => Err(e),
        };

        match result {
            Ok(published) => {
                report.stale_chunks = published.stale.len();
                report.fingerprint = published.manifest.fingerprint().to_hex();
                report.duration_ms = started.elapsed().as_millis() as u64;
                self.set_failure(None);
                self.set_state(IndexState::Persisted);
                info!(
                    reembedded = report.chunks_reembedded,
                    reused = report.chunks_reused,
                    stale = report.stale_chunks,
                    errors = report.errors.len(),
                    duration_ms = report.duration_ms,
                    "update complete"
                );
                Ok(report)
            }
            Err(IndexError::Cancelled) => {
                info!("update cancelled; previous snapshot kept");
                self.settle();
                Err(IndexError::Cancelled)
            }
            Err(e) => {
                self.set_state(IndexState::Failed);
                error!(error = %e, "update failed; rolling back to last persisted snapshot");
                self.set_failure(Some(e.to_string()));
                self.settle();
                Err(e)
            }
        }
    }

    /// Whether the provider produces vectors comparable to those in `snapshot`.
    ///
    /// A model id alone is not enough: the same model can be configured with
    /// another output width.
    fn embeds_like(&self, snapshot: &IndexSnapshot) -> bool {
        snapshot.model_id == self.provider.model_id()
            && snapshot
                .dense
                .dims()
                .is_none_or(|dims| dims == self.provider.dims())
    }

    /// Apply `diff` to `next` and embed its stale chunks.
    async fn patch(
        &self,
        next: &mut IndexSnapshot,
        diff: &ManifestDiff,
        manifest: Manifest,
        root: &Path,
        cancel: &CancellationToken,
        report: &mut UpdateReport,
    ) -> Result<()> {
        let model_id = self.provider.model_id();
        if !self.embeds_like(next) {
            info!(
                from = %next.model_id,
                to = %model_id,
                from_dims = ?next.dense.dims(),
                to_dims = self.provider.dims(),
                "embedding model changed; re-embedding all chunks"
            );
            next.reset_vectors(model_id);
        }

        let mut purged = 0;
        for path in diff.purged_paths() {
            purged += next.purge_path(path);
        }
        next.manifest = manifest;

        let changed: Vec<FileRecord> = diff.added.iter().chain(&diff.modified).cloned().collect();
        let chunk_root = root.to_path_buf();
        let options = ScanOptions::from(&self.config.scan);
        let chunker = self.config.chunking.chunker();
        let (chunks, warnings) = tokio::task::spawn_blocking(move || {
            chunk_files(&chunk_root, &changed, &options, &chunker)
        })
        .await?;
        report.warnings.extend(warnings);
        debug!(purged, inserted = chunks.len(), "patched chunk table");
        for c in chunks {
            next.insert_chunk(c);
        }

        if cancel.is_cancelled() {
            return Err(IndexError::Cancelled);
        }

        let pending: Vec<Chunk> = next.stale.iter().filter_map(|id| next.chunk(id)).collect();
        let progress = &self.progress;
        let outcome = self
            .cache
            .get_or_compute_many(
                &pending,
                Arc::clone(&self.provider),
                cancel,
                &mut |done, total| progress.report(UpdateProgressEvent::Embedding { done, total }),
            )
            .await?;

        for chunk in &pending {
            match outcome.vectors.get(&chunk.content_digest) {
                Some(vector) => {
                    next.attach_vector(&chunk.chunk_id, vector.clone())?;
                    if outcome.hits.contains(&chunk.content_digest) {
                        report.chunks_reused += 1;
                    } else {
                        report.chunks_reembedded += 1;
                    }
                }
                None => {
                    let message = outcome
                        .failures
                        .get(&chunk.content_digest)
                        .map_or_else(|| "no vector returned".to_string(), ToString::to_string);
                    report.errors.push(UpdateIssue {
                        path: chunk.source_path.clone(),
                        chunk_id: Some(chunk.chunk_id.clone()),
                        message,
                    });
                }
            }
        }

        if cancel.is_cancelled() {
            return Err(IndexError::Cancelled);
        }
        next.validate()
            .map_err(|e| IndexError::corrupt("updated snapshot", e))
    }

    async fn publish(&self, next: IndexSnapshot) -> Result<Arc<IndexSnapshot>> {
        self.progress.report(UpdateProgressEvent::Persisting);
        let next = Arc::new(next);
        let store = self.store.clone();
        let snapshot = Arc::clone(&next);
        tokio::task::spawn_blocking(move || store.publish(&snapshot)).await??;
        *self
            .published
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Some(Arc::clone(&next));
        Ok(next)
    }

    /// Rank chunks of the published snapshot against `text`.
    ///
    /// Fails with [`IndexError::NotReady`] until a snapshot has been
    /// published. A snapshot built with a different embedding model or
    /// vector width is ranked by its sparse index only.
    pub async fn query(&self, text: &str, top_k: usize) -> Result<Vec<ChunkRef>> {
        let snapshot = self.snapshot().ok_or(IndexError::NotReady)?;
        if top_k == 0 {
            return Ok(Vec::new());
        }
        if !self.embeds_like(&snapshot) {
            warn!(
                snapshot_model = %snapshot.model_id,
                provider_model = %self.provider.model_id(),
                snapshot_dims = ?snapshot.dense.dims(),
                provider_dims = self.provider.dims(),
                "snapshot was built with another embedding model; ranking by sparse index only"
            );
            return Ok(snapshot.search_sparse(&self.retriever, text, top_k));
        }
        let vector = embed_uncached(self.provider.as_ref(), text, self.cache.options()).await?;
        Ok(snapshot.search(&self.retriever, text, &vector, top_k)?)
    }
}

fn chunk_files(
    root: &Path,
    records: &[FileRecord],
    options: &ScanOptions,
    chunker: &ChunkerConfig,
) -> (Vec<Chunk>, Vec<ScanWarning>) {
    let mut chunks = Vec::new();
    let mut warnings = Vec::new();
    for record in records {
        match read_indexable_text(root, record, options) {
            Ok(text) => chunks.extend(chunk(
                &record.relative_path,
                &text,
                record.language_guess,
                chunker,
            )),
            Err(warning) => {
                debug!(path = %warning.path, reason = %warning.message, "not chunked");
                warnings.push(warning);
            }
        }
    }
    (chunks, warnings)
}
