//! On-disk persistence for snapshots and manifests.
//!
//! A storage directory holds:
//!
//! | File | Contents |
//! |------|----------|
//! | `snapshot.json` | the published [`IndexSnapshot`] |
//! | `embeddings.sqlite` | the embedding cache |
//! | `index.lock` | advisory lock file, locked while an update runs |
//! | `snapshot.json.<uuid>.tmp` | transient, during publication |
//!
//! Publication writes a uniquely named temporary file in the same directory,
//! fsyncs it, renames it over `snapshot.json`, then fsyncs the directory. A
//! reader therefore sees either the previous snapshot or the next one, never
//! a partial write.
//!
//! Loading checks `schema_version` before trusting the rest of the document.

use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};

use repo_index_core::manifest::{Manifest, MANIFEST_SCHEMA_VERSION};
use repo_index_core::snapshot::{IndexSnapshot, SNAPSHOT_SCHEMA_VERSION};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use tracing::{debug, info};

use crate::error::{IndexError, Result};

pub const SNAPSHOT_FILE: &str = "snapshot.json";
pub const CACHE_FILE: &str = "embeddings.sqlite";
pub const LOCK_FILE: &str = "index.lock";

#[derive(Deserialize)]
struct VersionProbe {
    schema_version: Option<u32>,
}

/// Parse a versioned JSON document, checking its schema version first.
fn parse_versioned<T: DeserializeOwned>(what: &str, bytes: &[u8], expected: u32) -> Result<T> {
    let probe: VersionProbe =
        serde_json::from_slice(bytes).map_err(|e| IndexError::corrupt(what, e))?;
    match probe.schema_version {
        None => return Err(IndexError::corrupt(what, "missing schema_version")),
        Some(found) if found != expected => {
            return Err(IndexError::SchemaVersion {
                what: what.to_string(),
                found,
                expected,
            })
        }
        Some(_) => {}
    }
    serde_json::from_slice(bytes).map_err(|e| IndexError::corrupt(what, e))
}

/// Write `bytes` to `path` atomically via a sibling temporary file.
fn write_atomic(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let parent = path.parent().unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(parent)?;

    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let tmp = parent.join(format!("{file_name}.{}.tmp", uuid::Uuid::new_v4()));

    let result = (|| {
        let mut file = File::create(&tmp)?;
        file.write_all(bytes)?;
        file.sync_all()?;
        fs::rename(&tmp, path)?;
        sync_dir(parent)
    })();
    if result.is_err() {
        let _ = fs::remove_file(&tmp);
    }
    result
}

#[cfg(unix)]
fn sync_dir(path: &Path) -> std::io::Result<()> {
    File::open(path)?.sync_all()
}

#[cfg(not(unix))]
fn sync_dir(_path: &Path) -> std::io::Result<()> {
    Ok(())
}

/// Snapshot storage rooted at one directory.
#[derive(Debug, Clone)]
pub struct SnapshotStore {
    dir: PathBuf,
}

impl SnapshotStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn snapshot_path(&self) -> PathBuf {
        self.dir.join(SNAPSHOT_FILE)
    }

    pub fn cache_path(&self) -> PathBuf {
        self.dir.join(CACHE_FILE)
    }

    pub fn lock_path(&self) -> PathBuf {
        self.dir.join(LOCK_FILE)
    }

    /// Load the published snapshot. `Ok(None)` means none has been published.
    pub fn load(&self) -> Result<Option<IndexSnapshot>> {
        let path = self.snapshot_path();
        let bytes = match fs::read(&path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        let what = path.display().to_string();
        let snapshot: IndexSnapshot = parse_versioned(&what, &bytes, SNAPSHOT_SCHEMA_VERSION)?;
        if snapshot.manifest.schema_version != MANIFEST_SCHEMA_VERSION {
            return Err(IndexError::SchemaVersion {
                what: format!("manifest in {what}"),
                found: snapshot.manifest.schema_version,
                expected: MANIFEST_SCHEMA_VERSION,
            });
        }
        snapshot
            .validate()
            .map_err(|e| IndexError::corrupt(&what, e))?;

        debug!(path = %what, chunks = snapshot.chunk_count(), "loaded snapshot");
        Ok(Some(snapshot))
    }

    /// Atomically replace the published snapshot.
    pub fn publish(&self, snapshot: &IndexSnapshot) -> Result<()> {
        let path = self.snapshot_path();
        let bytes = serde_json::to_vec(snapshot)?;
        write_atomic(&path, &bytes).map_err(|source| IndexError::Persist {
            path: path.clone(),
            source,
        })?;
        info!(
            path = %path.display(),
            files = snapshot.manifest.len(),
            chunks = snapshot.chunk_count(),
            bytes = bytes.len(),
            "published snapshot"
        );
        Ok(())
    }
}

/// Save a standalone manifest.
pub fn save_manifest(manifest: &Manifest, path: &Path) -> Result<()> {
    let bytes = serde_json::to_vec_pretty(manifest)?;
    write_atomic(path, &bytes).map_err(|source| IndexError::Persist {
        path: path.to_path_buf(),
        source,
    })
}

/// Load a standalone manifest, rejecting other schema versions.
pub fn load_manifest(path: &Path) -> Result<Manifest> {
    let bytes = fs::read(path)?;
    parse_versioned(&path.display().to_string(), &bytes, MANIFEST_SCHEMA_VERSION)
}
