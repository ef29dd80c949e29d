//! Resolution of the repository root, its configuration and index location,
//! shared by every CLI command.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

use crate::config::{load_config_or_default, Config};
use crate::coordinator::IndexCoordinator;
use crate::embedding::create_provider;
use crate::ignore::IgnoreRules;
use crate::store::SnapshotStore;

#[derive(Debug, Clone)]
pub struct Workspace {
    pub root: PathBuf,
    pub config: Config,
    pub storage_dir: PathBuf,
}

impl Workspace {
    /// Resolve `root` (default: current directory) and load its config.
    pub fn load(root: Option<&Path>, config_path: Option<&Path>) -> Result<Self> {
        let root = root.unwrap_or_else(|| Path::new("."));
        let root = root
            .canonicalize()
            .with_context(|| format!("Repository root not found: {}", root.display()))?;
        let config = load_config_or_default(config_path, &root)?;
        let storage_dir = config.storage_dir(&root);
        Ok(Self {
            root,
            config,
            storage_dir,
        })
    }

    pub fn ignore_rules(&self) -> IgnoreRules {
        IgnoreRules::load(&self.root, &self.config.scan, Some(&self.storage_dir))
    }

    pub fn store(&self) -> SnapshotStore {
        SnapshotStore::new(&self.storage_dir)
    }

    /// Open the index coordinator with the configured embedding provider.
    pub async fn open(&self) -> Result<IndexCoordinator> {
        let provider = create_provider(&self.config.embedding)?;
        IndexCoordinator::open(&self.storage_dir, self.config.clone(), provider)
            .await
            .with_context(|| format!("Failed to open index at {}", self.storage_dir.display()))
    }
}
