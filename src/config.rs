//! Configuration parsing and validation.
//!
//! Loaded from a TOML file. Every section is optional and every field has a
//! default, so an index can be built with no configuration file at all:
//!
//! ```toml
//! [index]
//! storage_dir = ".idea-producer/index"
//!
//! [chunking]
//! strategy = "structural"
//! max_chunk_size = 1500
//! overlap = 150
//!
//! [embedding]
//! provider = "openai"
//! model = "text-embedding-3-small"
//! dims = 1536
//!
//! [retrieval]
//! hybrid_alpha = 0.6
//! ```

use anyhow::{Context, Result};
use repo_index_core::chunk::{ChunkStrategy, ChunkerConfig};
use repo_index_core::embedding::HASHED_MODEL_ID;
use serde::Deserialize;
use std::path::{Path, PathBuf};

#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub index: IndexConfig,
    #[serde(default)]
    pub scan: ScanConfig,
    #[serde(default)]
    pub chunking: ChunkingConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub retrieval: RetrievalConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct IndexConfig {
    /// Relative paths resolve against the repository root.
    #[serde(default = "default_storage_dir")]
    pub storage_dir: PathBuf,
    /// `0` fails fast when another update holds the lock.
    #[serde(default)]
    pub lock_timeout_ms: u64,
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            storage_dir: default_storage_dir(),
            lock_timeout_ms: 0,
        }
    }
}

fn default_storage_dir() -> PathBuf {
    PathBuf::from(".idea-producer/index")
}

#[derive(Debug, Deserialize, Clone)]
pub struct ScanConfig {
    #[serde(default = "default_ignore_file")]
    pub ignore_file: String,
    #[serde(default = "default_true")]
    pub use_gitignore: bool,
    #[serde(default)]
    pub extra_ignores: Vec<String>,
    #[serde(default = "default_max_file_bytes")]
    pub max_file_bytes: u64,
    #[serde(default)]
    pub follow_symlinks: bool,
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            ignore_file: default_ignore_file(),
            use_gitignore: true,
            extra_ignores: Vec::new(),
            max_file_bytes: default_max_file_bytes(),
            follow_symlinks: false,
        }
    }
}

fn default_ignore_file() -> String {
    ".idea-agent-ignore".to_string()
}
fn default_true() -> bool {
    true
}
fn default_max_file_bytes() -> u64 {
    1024 * 1024
}

#[derive(Debug, Deserialize, Clone)]
pub struct ChunkingConfig {
    #[serde(default)]
    pub strategy: ChunkStrategy,
    #[serde(default = "default_max_chunk_size")]
    pub max_chunk_size: usize,
    #[serde(default = "default_overlap")]
    pub overlap: usize,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            strategy: ChunkStrategy::default(),
            max_chunk_size: default_max_chunk_size(),
            overlap: default_overlap(),
        }
    }
}

impl ChunkingConfig {
    pub fn chunker(&self) -> ChunkerConfig {
        ChunkerConfig {
            max_chunk_size: self.max_chunk_size,
            overlap: self.overlap,
            strategy: self.strategy,
        }
    }
}

fn default_max_chunk_size() -> usize {
    1500
}
fn default_overlap() -> usize {
    150
}

#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingConfig {
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub dims: Option<usize>,
    /// Ollama base URL.
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            model: None,
            dims: None,
            url: None,
            batch_size: default_batch_size(),
            concurrency: default_concurrency(),
            max_retries: default_max_retries(),
            retry_backoff_ms: default_retry_backoff_ms(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

impl EmbeddingConfig {
    pub fn model_id(&self) -> &str {
        self.model.as_deref().unwrap_or(HASHED_MODEL_ID)
    }

    pub fn dims(&self) -> usize {
        self.dims.unwrap_or(256)
    }

    pub fn is_network(&self) -> bool {
        matches!(self.provider.as_str(), "openai" | "ollama")
    }
}

fn default_provider() -> String {
    "hashed".to_string()
}
fn default_batch_size() -> usize {
    32
}
fn default_concurrency() -> usize {
    4
}
fn default_max_retries() -> u32 {
    3
}
fn default_retry_backoff_ms() -> u64 {
    250
}
fn default_timeout_secs() -> u64 {
    30
}

#[derive(Debug, Deserialize, Clone)]
pub struct RetrievalConfig {
    #[serde(default = "default_hybrid_alpha")]
    pub hybrid_alpha: f64,
    #[serde(default = "default_candidate_k")]
    pub candidate_k: usize,
    #[serde(default = "default_top_k")]
    pub default_top_k: usize,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            hybrid_alpha: default_hybrid_alpha(),
            candidate_k: default_candidate_k(),
            default_top_k: default_top_k(),
        }
    }
}

fn default_hybrid_alpha() -> f64 {
    0.6
}
fn default_candidate_k() -> usize {
    50
}
fn default_top_k() -> usize {
    5
}

impl Config {
    /// Storage directory for the index of `root`.
    pub fn storage_dir(&self, root: &Path) -> PathBuf {
        if self.index.storage_dir.is_absolute() {
            self.index.storage_dir.clone()
        } else {
            root.join(&self.index.storage_dir)
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.chunking.max_chunk_size == 0 {
            anyhow::bail!("chunking.max_chunk_size must be > 0");
        }
        if self.chunking.overlap >= self.chunking.max_chunk_size {
            anyhow::bail!("chunking.overlap must be < chunking.max_chunk_size");
        }

        if !(0.0..=1.0).contains(&self.retrieval.hybrid_alpha) {
            anyhow::bail!("retrieval.hybrid_alpha must be in [0.0, 1.0]");
        }
        if self.retrieval.candidate_k == 0 {
            anyhow::bail!("retrieval.candidate_k must be > 0");
        }
        if self.retrieval.default_top_k == 0 {
            anyhow::bail!("retrieval.default_top_k must be >= 1");
        }

        let embedding = &self.embedding;
        if embedding.batch_size == 0 {
            anyhow::bail!("embedding.batch_size must be > 0");
        }
        if embedding.concurrency == 0 {
            anyhow::bail!("embedding.concurrency must be > 0");
        }
        match embedding.provider.as_str() {
            "hashed" | "openai" | "ollama" => {}
            other => anyhow::bail!(
                "Unknown embedding provider: '{}'. Must be hashed, openai, or ollama.",
                other
            ),
        }
        if embedding.dims == Some(0) {
            anyhow::bail!("embedding.dims must be > 0");
        }
        if embedding.is_network() {
            if embedding.dims.is_none() {
                anyhow::bail!(
                    "embedding.dims must be specified when provider is '{}'",
                    embedding.provider
                );
            }
            if embedding.model.is_none() {
                anyhow::bail!(
                    "embedding.model must be specified when provider is '{}'",
                    embedding.provider
                );
            }
        }

        Ok(())
    }
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;
    config.validate()?;
    Ok(config)
}

/// Load `path` if given, else look for `repo-index.toml` in `root`, else use
/// defaults.
pub fn load_config_or_default(path: Option<&Path>, root: &Path) -> Result<Config> {
    if let Some(path) = path {
        return load_config(path);
    }
    let candidate = root.join("repo-index.toml");
    if candidate.is_file() {
        return load_config(&candidate);
    }
    Ok(Config::default())
}
