//! SQLite-backed embedding cache.
//!
//! Vectors are keyed by `(chunk_digest, model_id)`: identical chunk text is
//! embedded once per model no matter which file or offset it comes from,
//! and switching models never mixes vector spaces.
//!
//! [`EmbeddingCache::get_or_compute_many`] resolves a set of chunks:
//!
//! 1. deduplicate by chunk digest;
//! 2. look each digest up, counting hits;
//! 3. split the misses into provider batches of `batch_size`;
//! 4. run batches on a worker pool bounded by `concurrency`;
//! 5. write every successful vector as soon as its batch returns.
//!
//! Success and failure are tracked per chunk. When a whole batch call fails,
//! or returns the wrong number of vectors, each of its chunks is retried on
//! its own, so one bad input cannot sink its neighbours. Retryable errors
//! (see [`ProviderError::is_retryable`]) are retried with exponential
//! backoff up to `max_retries` times. A call exceeding `timeout` counts as a
//! retryable failure.

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use repo_index_core::digest::ContentDigest;
use repo_index_core::embedding::{blob_to_vec, vec_to_blob, EmbeddingProvider, ProviderError};
use repo_index_core::models::{Chunk, EmbeddingRecord};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use sqlx::{Row, SqlitePool};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::EmbeddingConfig;
use crate::error::{IndexError, Result};

/// How long a writer waits on another process holding the database.
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS embeddings (
    chunk_digest TEXT NOT NULL,
    model_id TEXT NOT NULL,
    dims INTEGER NOT NULL,
    vector BLOB NOT NULL,
    created_at INTEGER NOT NULL,
    PRIMARY KEY (chunk_digest, model_id)
)
"#;

#[derive(Debug, Clone)]
pub struct CacheOptions {
    pub batch_size: usize,
    pub concurrency: usize,
    pub max_retries: u32,
    pub retry_backoff: Duration,
    /// Limit on a single provider call.
    pub timeout: Option<Duration>,
}

impl Default for CacheOptions {
    fn default() -> Self {
        CacheOptions::from(&EmbeddingConfig::default())
    }
}

impl From<&EmbeddingConfig> for CacheOptions {
    fn from(config: &EmbeddingConfig) -> Self {
        Self {
            batch_size: config.batch_size.max(1),
            concurrency: config.concurrency.max(1),
            max_retries: config.max_retries,
            retry_backoff: Duration::from_millis(config.retry_backoff_ms),
            timeout: (config.timeout_secs > 0).then(|| Duration::from_secs(config.timeout_secs)),
        }
    }
}

/// Per-digest result of resolving a set of chunks.
#[derive(Debug, Default)]
pub struct CacheOutcome {
    pub vectors: BTreeMap<ContentDigest, Vec<f32>>,
    pub failures: BTreeMap<ContentDigest, ProviderError>,
    /// Digests served from the cache.
    pub hits: BTreeSet<ContentDigest>,
    /// Digests computed by the provider in this call.
    pub computed: usize,
}

pub struct EmbeddingCache {
    pool: SqlitePool,
    options: CacheOptions,
}

impl EmbeddingCache {
    /// Open (creating if missing) the cache database at `path`.
    ///
    /// The pool gets one connection per embedding worker plus one for
    /// lookups. Several coordinators may share a file: WAL lets readers
    /// proceed during a write and writers wait up to [`BUSY_TIMEOUT`].
    pub async fn open(path: &Path, options: CacheOptions) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let connect = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .busy_timeout(BUSY_TIMEOUT);
        let pool = SqlitePoolOptions::new()
            .max_connections(options.concurrency as u32 + 1)
            .connect_with(connect)
            .await?;

        sqlx::query(SCHEMA).execute(&pool).await?;
        debug!(path = %path.display(), "opened embedding cache");
        Ok(Self { pool, options })
    }

    pub fn options(&self) -> &CacheOptions {
        &self.options
    }

    pub async fn lookup(&self, digest: &ContentDigest, model_id: &str) -> Result<Option<EmbeddingRecord>> {
        let row = sqlx::query(
            "SELECT dims, vector FROM embeddings WHERE chunk_digest = ? AND model_id = ?",
        )
        .bind(digest.to_hex())
        .bind(model_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.and_then(|row| {
            let dims: i64 = row.get("dims");
            let blob: Vec<u8> = row.get("vector");
            let vector = blob_to_vec(&blob);
            (dims > 0 && vector.len() as i64 == dims).then(|| EmbeddingRecord {
                chunk_digest: *digest,
                vector,
                model_id: model_id.to_string(),
            })
        }))
    }

    /// Upsert one record. Last writer wins.
    pub async fn store(&self, record: &EmbeddingRecord) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO embeddings (chunk_digest, model_id, dims, vector, created_at)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT(chunk_digest, model_id) DO UPDATE SET
                dims = excluded.dims,
                vector = excluded.vector,
                created_at = excluded.created_at
            "#,
        )
        .bind(record.chunk_digest.to_hex())
        .bind(&record.model_id)
        .bind(record.vector.len() as i64)
        .bind(vec_to_blob(&record.vector))
        .bind(chrono::Utc::now().timestamp())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Number of cached vectors, optionally for one model.
    pub async fn count(&self, model_id: Option<&str>) -> Result<u64> {
        let n: i64 = match model_id {
            Some(model) => {
                sqlx::query_scalar("SELECT COUNT(*) FROM embeddings WHERE model_id = ?")
                    .bind(model)
                    .fetch_one(&self.pool)
                    .await?
            }
            None => {
                sqlx::query_scalar("SELECT COUNT(*) FROM embeddings")
                    .fetch_one(&self.pool)
                    .await?
            }
        };
        Ok(n.max(0) as u64)
    }

    /// Resolve one chunk: cached vector, or a provider call with retries.
    pub async fn get_or_compute(
        &self,
        chunk: &Chunk,
        provider: &dyn EmbeddingProvider,
    ) -> Result<EmbeddingRecord> {
        let model_id = provider.model_id();
        if let Some(hit) = self.lookup(&chunk.content_digest, model_id).await? {
            if hit.vector.len() == provider.dims() {
                return Ok(hit);
            }
        }
        let vector = embed_uncached(provider, &chunk.text, &self.options).await?;
        let record = EmbeddingRecord {
            chunk_digest: chunk.content_digest,
            vector,
            model_id: model_id.to_string(),
        };
        self.store(&record).await?;
        Ok(record)
    }

    /// Resolve many chunks with batching and bounded concurrency.
    ///
    /// Provider failures are returned per digest in the outcome. Only cache
    /// I/O errors and cancellation fail the call as a whole. `on_progress`
    /// receives `(done, total)` over the cache misses after each batch.
    pub async fn get_or_compute_many(
        &self,
        chunks: &[Chunk],
        provider: Arc<dyn EmbeddingProvider>,
        cancel: &CancellationToken,
        on_progress: &mut (dyn FnMut(usize, usize) + Send),
    ) -> Result<CacheOutcome> {
        let model_id = provider.model_id().to_string();
        let dims = provider.dims();

        let mut unique: BTreeMap<ContentDigest, &str> = BTreeMap::new();
        for chunk in chunks {
            unique.entry(chunk.content_digest).or_insert(&chunk.text);
        }

        let mut outcome = CacheOutcome::default();
        let mut misses: Vec<(ContentDigest, String)> = Vec::new();
        for (digest, text) in unique {
            match self.lookup(&digest, &model_id).await? {
                Some(hit) if hit.vector.len() == dims => {
                    outcome.vectors.insert(digest, hit.vector);
                    outcome.hits.insert(digest);
                }
                _ => misses.push((digest, text.to_string())),
            }
        }

        let total = misses.len();
        debug!(model = %model_id, hits = outcome.hits.len(), misses = total, "embedding cache lookup");
        if misses.is_empty() {
            return Ok(outcome);
        }

        let semaphore = Arc::new(Semaphore::new(self.options.concurrency));
        let mut tasks = JoinSet::new();
        for batch in misses.chunks(self.options.batch_size) {
            let batch = batch.to_vec();
            let provider = Arc::clone(&provider);
            let semaphore = Arc::clone(&semaphore);
            let options = self.options.clone();
            let cancel = cancel.clone();
            tasks.spawn(async move {
                let _permit = semaphore.acquire_owned().await.ok()?;
                if cancel.is_cancelled() {
                    return None;
                }
                Some(embed_batch(provider.as_ref(), batch, dims, &options).await)
            });
        }

        let mut done = 0;
        loop {
            let joined = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    tasks.abort_all();
                    return Err(IndexError::Cancelled);
                }
                next = tasks.join_next() => next,
            };
            let Some(joined) = joined else { break };
            let Some(results) = joined? else { continue };

            for (digest, result) in results {
                match result {
                    Ok(vector) => {
                        let record = EmbeddingRecord {
                            chunk_digest: digest,
                            vector,
                            model_id: model_id.clone(),
                        };
                        self.store(&record).await?;
                        outcome.vectors.insert(digest, record.vector);
                        outcome.computed += 1;
                    }
                    Err(e) => {
                        warn!(digest = %digest, error = %e, "embedding failed after retries");
                        outcome.failures.insert(digest, e);
                    }
                }
                done += 1;
            }
            on_progress(done, total);
        }

        info!(
            model = %model_id,
            hits = outcome.hits.len(),
            computed = outcome.computed,
            failed = outcome.failures.len(),
            "embedding cache resolved"
        );
        Ok(outcome)
    }
}

/// Embed `text` directly, with the retry policy, bypassing the cache.
pub async fn embed_uncached(
    provider: &dyn EmbeddingProvider,
    text: &str,
    options: &CacheOptions,
) -> std::result::Result<Vec<f32>, ProviderError> {
    embed_single(provider, text, provider.dims(), options, 0, None).await
}

async fn call(
    provider: &dyn EmbeddingProvider,
    texts: &[String],
    timeout: Option<Duration>,
) -> std::result::Result<Vec<Vec<f32>>, ProviderError> {
    match timeout {
        Some(limit) => tokio::time::timeout(limit, provider.embed(texts))
            .await
            .unwrap_or_else(|_| Err(ProviderError::Timeout(limit))),
        None => provider.embed(texts).await,
    }
}

fn wrong_dims(dims: usize, got: usize) -> ProviderError {
    ProviderError::InvalidResponse(format!("expected {dims}-dimensional vector, got {got}"))
}

/// Embed one text. `attempt` counts calls already made for it and `last` is
/// the error of the most recent one.
async fn embed_single(
    provider: &dyn EmbeddingProvider,
    text: &str,
    dims: usize,
    options: &CacheOptions,
    mut attempt: u32,
    mut last: Option<ProviderError>,
) -> std::result::Result<Vec<f32>, ProviderError> {
    let input = [text.to_string()];
    loop {
        if let Some(err) = last.take() {
            if !err.is_retryable() || attempt > options.max_retries {
                return Err(err);
            }
            let backoff = options
                .retry_backoff
                .saturating_mul(1u32 << attempt.saturating_sub(1).min(6));
            debug!(attempt, error = %err, backoff_ms = backoff.as_millis() as u64, "retrying embedding");
            tokio::time::sleep(backoff).await;
        }

        attempt += 1;
        match call(provider, &input, options.timeout).await {
            Ok(mut vectors) if vectors.len() == 1 => match vectors.pop() {
                Some(v) if v.len() == dims => return Ok(v),
                Some(v) => last = Some(wrong_dims(dims, v.len())),
                None => last = Some(ProviderError::InvalidResponse("empty response".into())),
            },
            Ok(vectors) => {
                last = Some(ProviderError::InvalidResponse(format!(
                    "expected 1 vector, got {}",
                    vectors.len()
                )))
            }
            Err(e) => last = Some(e),
        }
    }
}

/// Embed one provider batch, falling back to per-chunk calls on failure.
async fn embed_batch(
    provider: &dyn EmbeddingProvider,
    batch: Vec<(ContentDigest, String)>,
    dims: usize,
    options: &CacheOptions,
) -> Vec<(ContentDigest, std::result::Result<Vec<f32>, ProviderError>)> {
    let texts: Vec<String> = batch.iter().map(|(_, t)| t.clone()).collect();
    let first = call(provider, &texts, options.timeout).await;
    let mut results = Vec::with_capacity(batch.len());

    match first {
        Ok(vectors) if vectors.len() == batch.len() => {
            for ((digest, text), vector) in batch.into_iter().zip(vectors) {
                let result = if vector.len() == dims {
                    Ok(vector)
                } else {
                    let err = wrong_dims(dims, vector.len());
                    embed_single(provider, &text, dims, options, 1, Some(err)).await
                };
                results.push((digest, result));
            }
        }
        outcome => {
            let err = match outcome {
                Ok(vectors) => ProviderError::InvalidResponse(format!(
                    "expected {} vectors, got {}",
                    batch.len(),
                    vectors.len()
                )),
                Err(e) => e,
            };
            if batch.len() == 1 {
                for (digest, text) in batch {
                    let result = embed_single(provider, &text, dims, options, 1, Some(err.clone())).await;
                    results.push((digest, result));
                }
            } else {
                debug!(size = batch.len(), error = %err, "batch failed; embedding chunks individually");
                for (digest, text) in batch {
                    let result = embed_single(provider, &text, dims, options, 1, None).await;
                    results.push((digest, result));
                }
            }
        }
    }
    results
}
