//! End-to-end tests of the index lifecycle against temporary repositories.

use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use repo_index::config::{Config, ScanConfig};
use repo_index::ignore::IgnoreRules;
use repo_index::lock::{IndexLock, LockOptions};
use repo_index::{IndexCoordinator, IndexError, IndexState};
use repo_index_core::embedding::{EmbeddingProvider, HashedProvider, ProviderError};
use tempfile::TempDir;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

// ============ Provider doubles ============

/// Hashed embeddings, counting texts sent. Texts containing `FAIL-EMBED`
/// fail with a retryable error while `failing` is set.
struct TestProvider {
    inner: HashedProvider,
    texts: AtomicUsize,
    failing: AtomicBool,
}

impl TestProvider {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            inner: HashedProvider::new(256),
            texts: AtomicUsize::new(0),
            failing: AtomicBool::new(true),
        })
    }

    fn texts(&self) -> usize {
        self.texts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl EmbeddingProvider for TestProvider {
    fn model_id(&self) -> &str {
        self.inner.model_id()
    }

    fn dims(&self) -> usize {
        self.inner.dims()
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, ProviderError> {
        if self.failing.load(Ordering::SeqCst) && texts.iter().any(|t| t.contains("FAIL-EMBED")) {
            return Err(ProviderError::Http {
                status: 503,
                body: "unavailable".into(),
            });
        }
        self.texts.fetch_add(texts.len(), Ordering::SeqCst);
        self.inner.embed(texts).await
    }
}

/// Blocks the first call after [`Gated::arm`] until [`Gated::release`].
struct Gated {
    inner: HashedProvider,
    armed: AtomicBool,
    entered: Notify,
    released: Notify,
}

impl Gated {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            inner: HashedProvider::new(256),
            armed: AtomicBool::new(false),
            entered: Notify::new(),
            released: Notify::new(),
        })
    }

    fn arm(&self) {
        self.armed.store(true, Ordering::SeqCst);
    }

    fn release(&self) {
        self.released.notify_one();
    }
}

#[async_trait]
impl EmbeddingProvider for Gated {
    fn model_id(&self) -> &str {
        self.inner.model_id()
    }

    fn dims(&self) -> usize {
        self.inner.dims()
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, ProviderError> {
        if self.armed.swap(false, Ordering::SeqCst) {
            self.entered.notify_one();
            self.released.notified().await;
        }
        self.inner.embed(texts).await
    }
}

// ============ Fixtures ============

struct Fixture {
    repo: TempDir,
    storage: TempDir,
}

impl Fixture {
    fn new() -> Self {
        let fixture = Self {
            repo: TempDir::new().unwrap(),
            storage: TempDir::new().unwrap(),
        };
        fixture.write("a.py", "def f(): pass");
        fixture.write("b.md", "hello world");
        fixture
    }

    fn root(&self) -> &Path {
        self.repo.path()
    }

    fn storage_dir(&self) -> std::path::PathBuf {
        self.storage.path().join("index")
    }

    fn write(&self, rel: &str, content: &str) {
        let path = self.repo.path().join(rel);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).unwrap();
        }
        fs::write(path, content).unwrap();
    }

    fn remove(&self, rel: &str) {
        fs::remove_file(self.repo.path().join(rel)).unwrap();
    }

    fn rules(&self) -> IgnoreRules {
        IgnoreRules::load(self.root(), &ScanConfig::default(), None)
    }

    async fn open(&self, provider: Arc<dyn EmbeddingProvider>) -> IndexCoordinator {
        IndexCoordinator::open(self.storage_dir(), test_config(), provider)
            .await
            .unwrap()
    }
}

fn test_config() -> Config {
    let mut config = Config::default();
    config.embedding.max_retries = 1;
    config.embedding.retry_backoff_ms = 1;
    config
}

// ============ Scenarios ============

#[tokio::test]
async fn first_update_indexes_both_files_and_ranks_code_first() {
    let fx = Fixture::new();
    let index = fx.open(TestProvider::new()).await;
    assert_eq!(index.state(), IndexState::Empty);

    let report = index.update(fx.root(), &fx.rules()).await.unwrap();
    assert_eq!(report.added, vec!["a.py".to_string(), "b.md".to_string()]);
    assert!(report.modified.is_empty());
    assert!(report.removed.is_empty());
    assert!(report.errors.is_empty());
    assert_eq!(index.state(), IndexState::Persisted);

    let snapshot = index.snapshot().unwrap();
    assert_eq!(snapshot.manifest.len(), 2);
    assert!(!snapshot.chunk_ids_for_path("a.py").is_empty());
    assert!(!snapshot.chunk_ids_for_path("b.md").is_empty());
    assert!(snapshot.stale.is_empty());
    assert_eq!(report.chunks_reembedded, snapshot.chunk_count());

    let top = index.query("function definition", 1).await.unwrap();
    assert_eq!(top.len(), 1);
    assert_eq!(top[0].source_path, "a.py");

    let both = index.query("function definition", 2).await.unwrap();
    let a = both.iter().position(|r| r.source_path == "a.py").unwrap();
    if let Some(b) = both.iter().position(|r| r.source_path == "b.md") {
        assert!(a < b);
    }
}

#[tokio::test]
async fn modified_file_replaces_its_chunks() {
    let fx = Fixture::new();
    let index = fx.open(TestProvider::new()).await;
    index.update(fx.root(), &fx.rules()).await.unwrap();
    let old_ids = index.snapshot().unwrap().chunk_ids_for_path("a.py");
    assert!(!old_ids.is_empty());

    fx.write("a.py", "def g(x):\n    return x * 2\n");
    let report = index.update(fx.root(), &fx.rules()).await.unwrap();
    assert_eq!(report.modified, vec!["a.py".to_string()]);
    assert!(report.added.is_empty());
    assert!(report.removed.is_empty());

    let snapshot = index.snapshot().unwrap();
    for id in &old_ids {
        assert!(!snapshot.sparse.contains(id), "{id} still in sparse index");
        assert!(!snapshot.dense.contains(id), "{id} still in dense index");
    }
    let new_ids = snapshot.chunk_ids_for_path("a.py");
    assert!(!new_ids.is_empty());
    assert!(new_ids.iter().all(|id| snapshot.dense.contains(id)));
    snapshot.validate().unwrap();
}

#[tokio::test]
async fn second_update_without_changes_is_a_no_op() {
    let fx = Fixture::new();
    let index = fx.open(TestProvider::new()).await;
    index.update(fx.root(), &fx.rules()).await.unwrap();
    let first = index.snapshot().unwrap();

    let report = index.update(fx.root(), &fx.rules()).await.unwrap();
    assert_eq!(report.chunks_reembedded, 0);
    assert!(report.added.is_empty() && report.modified.is_empty() && report.removed.is_empty());
    assert_eq!(report.unchanged, 2);

    let second = index.snapshot().unwrap();
    assert_eq!(first.manifest.files, second.manifest.files);
    assert_eq!(first.chunks, second.chunks);
    assert_eq!(first.dense, second.dense);
    assert_eq!(first.sparse, second.sparse);
    assert_eq!(first.stale, second.stale);
}

#[tokio::test]
async fn readded_file_reuses_cached_embeddings() {
    let fx = Fixture::new();
    let provider = TestProvider::new();
    let index = fx.open(provider.clone()).await;
    index.update(fx.root(), &fx.rules()).await.unwrap();

    fx.remove("b.md");
    let report = index.update(fx.root(), &fx.rules()).await.unwrap();
    assert_eq!(report.removed, vec!["b.md".to_string()]);
    assert!(index.snapshot().unwrap().chunk_ids_for_path("b.md").is_empty());

    let sent = provider.texts();
    fx.write("b.md", "hello world");
    let report = index.update(fx.root(), &fx.rules()).await.unwrap();
    assert_eq!(report.added, vec!["b.md".to_string()]);
    assert_eq!(report.chunks_reembedded, 0);
    assert!(report.chunks_reused >= 1);
    assert_eq!(provider.texts(), sent, "provider was called for cached text");
}

#[tokio::test]
async fn published_snapshot_survives_reopen() {
    let fx = Fixture::new();
    {
        let index = fx.open(TestProvider::new()).await;
        index.update(fx.root(), &fx.rules()).await.unwrap();
    }
    let reopened = fx.open(TestProvider::new()).await;
    assert_eq!(reopened.state(), IndexState::Persisted);
    let hits = reopened.query("hello", 5).await.unwrap();
    assert_eq!(hits[0].source_path, "b.md");
}

#[tokio::test]
async fn query_before_first_update_is_not_ready() {
    let fx = Fixture::new();
    let index = fx.open(TestProvider::new()).await;
    let err = index.query("anything", 3).await.unwrap_err();
    assert!(matches!(err, IndexError::NotReady));
}

#[tokio::test]
async fn truncated_snapshot_fails_to_open() {
    let fx = Fixture::new();
    let index = fx.open(TestProvider::new()).await;
    index.update(fx.root(), &fx.rules()).await.unwrap();
    let path = index.store().snapshot_path();
    drop(index);

    let bytes = fs::read(&path).unwrap();
    fs::write(&path, &bytes[..bytes.len() / 3]).unwrap();

    let err = IndexCoordinator::open(fx.storage_dir(), test_config(), TestProvider::new())
        .await
        .err()
        .unwrap();
    assert!(matches!(err, IndexError::Corrupt { .. }), "got {err:?}");
}

#[tokio::test]
async fn future_schema_version_is_rejected() {
    let fx = Fixture::new();
    fs::create_dir_all(fx.storage_dir()).unwrap();
    fs::write(
        fx.storage_dir().join("snapshot.json"),
        br#"{"schema_version": 999}"#,
    )
    .unwrap();

    let err = IndexCoordinator::open(fx.storage_dir(), test_config(), TestProvider::new())
        .await
        .err()
        .unwrap();
    assert!(
        matches!(err, IndexError::SchemaVersion { found: 999, .. }),
        "got {err:?}"
    );
}

#[tokio::test]
async fn failed_embeddings_stay_searchable_and_are_retried() {
    let fx = Fixture::new();
    fx.write("c.py", "flaky = True  # FAIL-EMBED\n");
    let provider = TestProvider::new();
    let index = fx.open(provider.clone()).await;

    let report = index.update(fx.root(), &fx.rules()).await.unwrap();
    assert_eq!(index.state(), IndexState::Persisted);
    assert_eq!(report.errors.len(), 1);
    assert_eq!(report.errors[0].path, "c.py");
    assert_eq!(report.stale_chunks, 1);

    let snapshot = index.snapshot().unwrap();
    let stale_id = snapshot.stale.iter().next().unwrap().clone();
    assert!(stale_id.starts_with("c.py#"));
    assert!(snapshot.sparse.contains(&stale_id));
    assert!(!snapshot.dense.contains(&stale_id));

    let hits = index.query("flaky", 3).await.unwrap();
    let hit = hits.iter().find(|h| h.chunk_id == stale_id).unwrap();
    assert!(hit.dense_score.is_none());
    assert!(hit.sparse_score.is_some());

    provider.failing.store(false, Ordering::SeqCst);
    let report = index.update(fx.root(), &fx.rules()).await.unwrap();
    assert!(report.modified.is_empty());
    assert_eq!(report.chunks_reembedded, 1);
    assert_eq!(report.stale_chunks, 0);
    assert!(report.errors.is_empty());
    assert!(index.snapshot().unwrap().dense.contains(&stale_id));
}

#[tokio::test]
async fn concurrent_update_is_busy_and_queries_see_old_snapshot() {
    let fx = Fixture::new();
    let provider = Gated::new();
    let index = Arc::new(fx.open(provider.clone()).await);
    index.update(fx.root(), &fx.rules()).await.unwrap();
    let old_digest = index.snapshot().unwrap().manifest.get("a.py").unwrap().content_digest;

    fx.write("a.py", "def changed(): return 42");
    provider.arm();
    let background = {
        let index = Arc::clone(&index);
        let root = fx.root().to_path_buf();
        let rules = fx.rules();
        tokio::spawn(async move { index.update(&root, &rules).await })
    };
    provider.entered.notified().await;
    assert_eq!(index.state(), IndexState::Updating);

    let err = index.update(fx.root(), &fx.rules()).await.unwrap_err();
    assert!(matches!(err, IndexError::IndexBusy(_)), "got {err:?}");

    let during = index.query("f pass", 5).await.unwrap();
    let a = during.iter().find(|r| r.source_path == "a.py").unwrap();
    assert_eq!(a.text, "def f(): pass");
    assert_eq!(
        index.snapshot().unwrap().manifest.get("a.py").unwrap().content_digest,
        old_digest
    );

    provider.release();
    let report = background.await.unwrap().unwrap();
    assert_eq!(report.modified, vec!["a.py".to_string()]);
    assert_ne!(
        index.snapshot().unwrap().manifest.get("a.py").unwrap().content_digest,
        old_digest
    );
}

#[tokio::test]
async fn cancelled_update_keeps_previous_snapshot() {
    let fx = Fixture::new();
    let provider = Gated::new();
    let index = Arc::new(fx.open(provider.clone()).await);
    index.update(fx.root(), &fx.rules()).await.unwrap();
    let before = index.snapshot().unwrap();

    fx.write("c.md", "# New\n\nnew document");
    provider.arm();
    let cancel = CancellationToken::new();
    let background = {
        let index = Arc::clone(&index);
        let root = fx.root().to_path_buf();
        let rules = fx.rules();
        let cancel = cancel.clone();
        tokio::spawn(async move { index.update_with_cancel(&root, &rules, &cancel).await })
    };
    provider.entered.notified().await;
    cancel.cancel();

    let err = tokio::time::timeout(Duration::from_secs(5), background)
        .await
        .unwrap()
        .unwrap()
        .unwrap_err();
    assert!(matches!(err, IndexError::Cancelled));
    assert_eq!(index.state(), IndexState::Persisted);
    assert!(Arc::ptr_eq(&before, &index.snapshot().unwrap()));
    assert!(index.last_failure().is_none());

    let on_disk = index.store().load().unwrap().unwrap();
    assert!(!on_disk.manifest.contains("c.md"));

    let report = index.update(fx.root(), &fx.rules()).await.unwrap();
    assert_eq!(report.added, vec!["c.md".to_string()]);
}

#[tokio::test]
async fn cancelled_before_start_leaves_empty_index() {
    let fx = Fixture::new();
    let index = fx.open(TestProvider::new()).await;
    let cancel = CancellationToken::new();
    cancel.cancel();

    let err = index
        .update_with_cancel(fx.root(), &fx.rules(), &cancel)
        .await
        .unwrap_err();
    assert!(matches!(err, IndexError::Cancelled));
    assert_eq!(index.state(), IndexState::Empty);
    assert!(!index.store().snapshot_path().exists());
}

#[tokio::test]
async fn persist_failure_rolls_back() {
    let fx = Fixture::new();
    let index = fx.open(TestProvider::new()).await;
    index.update(fx.root(), &fx.rules()).await.unwrap();
    let before = index.snapshot().unwrap();

    let snapshot_path = index.store().snapshot_path();
    fs::remove_file(&snapshot_path).unwrap();
    fs::create_dir_all(snapshot_path.join("blocker")).unwrap();

    fx.write("a.py", "def f(): return 1");
    let err = index.update(fx.root(), &fx.rules()).await.unwrap_err();
    assert!(matches!(err, IndexError::Persist { .. }), "got {err:?}");
    assert_eq!(index.state(), IndexState::Persisted);
    assert!(index.last_failure().is_some());
    assert!(Arc::ptr_eq(&before, &index.snapshot().unwrap()));

    let leftovers = fs::read_dir(fx.storage_dir())
        .unwrap()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_name().to_string_lossy().ends_with(".tmp"))
        .count();
    assert_eq!(leftovers, 0);

    fs::remove_dir_all(&snapshot_path).unwrap();
    let report = index.update(fx.root(), &fx.rules()).await.unwrap();
    assert_eq!(report.modified, vec!["a.py".to_string()]);
    assert!(index.last_failure().is_none());
}

#[tokio::test]
async fn unreadable_root_is_a_scan_error() {
    let fx = Fixture::new();
    let index = fx.open(TestProvider::new()).await;
    let missing = fx.root().join("does-not-exist");
    let err = index.update(&missing, &fx.rules()).await.unwrap_err();
    assert!(matches!(err, IndexError::Scan { .. }));
    assert_eq!(index.state(), IndexState::Empty);
}

#[tokio::test]
async fn queries_are_deterministic() {
    let fx = Fixture::new();
    fx.write("src/lib.rs", "pub fn hello() -> &'static str {\n    \"hello\"\n}\n");
    fx.write("docs/guide.md", "# Guide\n\nSay hello to the world.\n");
    let index = fx.open(TestProvider::new()).await;
    index.update(fx.root(), &fx.rules()).await.unwrap();

    let first = serde_json::to_string(&index.query("hello world", 10).await.unwrap()).unwrap();
    let second = serde_json::to_string(&index.query("hello world", 10).await.unwrap()).unwrap();
    assert_eq!(first, second);
}

#[tokio::test]
async fn model_switch_reembeds_everything() {
    let fx = Fixture::new();
    let old = Arc::new(HashedProvider::with_model_id("model-a", 64));
    let index = fx.open(old).await;
    index.update(fx.root(), &fx.rules()).await.unwrap();
    drop(index);

    let new = Arc::new(HashedProvider::with_model_id("model-b", 32));
    let index = fx.open(new).await;

    let sparse_only = index.query("hello", 2).await.unwrap();
    assert!(sparse_only.iter().all(|r| r.dense_score.is_none()));

    let report = index.update(fx.root(), &fx.rules()).await.unwrap();
    let snapshot = index.snapshot().unwrap();
    assert_eq!(snapshot.model_id, "model-b");
    assert_eq!(snapshot.dense.dims(), Some(32));
    assert_eq!(report.chunks_reembedded, snapshot.chunk_count());
    assert!(report.added.is_empty() && report.modified.is_empty());
}

#[tokio::test]
async fn vector_width_change_under_same_model_reembeds_everything() {
    let fx = Fixture::new();
    let index = fx.open(Arc::new(HashedProvider::new(256))).await;
    index.update(fx.root(), &fx.rules()).await.unwrap();
    let model_id = index.snapshot().unwrap().model_id.clone();
    drop(index);

    let narrow = Arc::new(HashedProvider::new(128));
    assert_eq!(narrow.model_id(), model_id);
    let index = fx.open(narrow).await;

    let sparse_only = index.query("hello", 2).await.unwrap();
    assert!(!sparse_only.is_empty());
    assert!(sparse_only.iter().all(|r| r.dense_score.is_none()));

    let report = index.update(fx.root(), &fx.rules()).await.unwrap();
    assert!(report.errors.is_empty(), "got {:?}", report.errors);
    let snapshot = index.snapshot().unwrap();
    assert_eq!(snapshot.dense.dims(), Some(128));
    assert!(snapshot.stale.is_empty());
    assert_eq!(report.chunks_reembedded, snapshot.chunk_count());
    assert_eq!(report.chunks_reused, 0);

    let hybrid = index.query("hello", 2).await.unwrap();
    assert!(hybrid.iter().any(|r| r.dense_score.is_some()));
}

#[tokio::test]
async fn held_lock_blocks_updates_however_long_it_is_held() {
    let fx = Fixture::new();
    let index = fx.open(TestProvider::new()).await;
    let held = IndexLock::acquire(&index.store().lock_path(), LockOptions::default())
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_millis(200)).await;
    let err = index.update(fx.root(), &fx.rules()).await.unwrap_err();
    assert!(matches!(err, IndexError::IndexBusy(_)), "got {err:?}");
    assert_eq!(index.state(), IndexState::Empty);

    drop(held);
    let report = index.update(fx.root(), &fx.rules()).await.unwrap();
    assert_eq!(report.added.len(), 2);
}

#[tokio::test]
async fn slow_update_keeps_lock_against_another_coordinator() {
    let fx = Fixture::new();
    let provider = Gated::new();
    let index = Arc::new(fx.open(provider.clone()).await);

    provider.arm();
    let background = {
        let index = Arc::clone(&index);
        let root = fx.root().to_path_buf();
        let rules = fx.rules();
        tokio::spawn(async move { index.update(&root, &rules).await })
    };
    provider.entered.notified().await;
    tokio::time::sleep(Duration::from_millis(200)).await;

    let mut config = test_config();
    config.index.lock_timeout_ms = 100;
    let other = IndexCoordinator::open(fx.storage_dir(), config, TestProvider::new())
        .await
        .unwrap();
    let err = other.update(fx.root(), &fx.rules()).await.unwrap_err();
    assert!(matches!(err, IndexError::IndexBusy(_)), "got {err:?}");

    provider.release();
    let report = background.await.unwrap().unwrap();
    assert_eq!(report.added.len(), 2);
    other.update(fx.root(), &fx.rules()).await.unwrap();
}

#[tokio::test]
async fn binary_files_are_recorded_but_not_chunked() {
    let fx = Fixture::new();
    fs::write(fx.root().join("logo.png"), b"\x89PNG\r\n\x1a\n\0\0\0\rIHDR").unwrap();
    let index = fx.open(TestProvider::new()).await;

    let report = index.update(fx.root(), &fx.rules()).await.unwrap();
    let snapshot = index.snapshot().unwrap();
    assert!(snapshot.manifest.contains("logo.png"));
    assert!(snapshot.chunk_ids_for_path("logo.png").is_empty());
    assert!(report
        .warnings
        .iter()
        .any(|w| w.path == "logo.png" && w.message.contains("binary")));
}

#[tokio::test]
async fn storage_inside_root_is_not_indexed() {
    let repo = TempDir::new().unwrap();
    fs::write(repo.path().join("a.py"), "def f(): pass").unwrap();
    let config = test_config();
    let storage = config.storage_dir(repo.path());
    let rules = IgnoreRules::load(repo.path(), &config.scan, Some(&storage));

    let index = IndexCoordinator::open(&storage, config, TestProvider::new())
        .await
        .unwrap();
    index.update(repo.path(), &rules).await.unwrap();
    let report = index.update(repo.path(), &rules).await.unwrap();

    assert!(report.added.is_empty() && report.modified.is_empty());
    let snapshot = index.snapshot().unwrap();
    assert_eq!(snapshot.manifest.len(), 1);
    assert!(storage.join("snapshot.json").exists());
}
