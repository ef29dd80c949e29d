//! Versioned file manifests and manifest diffing.
//!
//! A [`Manifest`] records the content digest of every included file in a
//! tree at one point in time. Two manifests are compared with [`diff`], which
//! is a pure, path-keyed set comparison: a path only in the new manifest is
//! *added*, only in the old one is *removed*, in both with a different
//! digest is *modified*, and in both with the same digest is *unchanged*.
//!
//! Every list in a [`ManifestDiff`] is sorted by path so that reports and
//! downstream processing order are reproducible.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::digest::{self, ContentDigest};
use crate::models::FileRecord;

/// Version of the manifest layout. Bumped on any incompatible change.
pub const MANIFEST_SCHEMA_VERSION: u32 = 1;

/// The record of a file tree's content digests at one point in time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Manifest {
    pub schema_version: u32,
    pub generated_at: DateTime<Utc>,
    pub files: BTreeMap<String, FileRecord>,
}

impl Manifest {
    pub fn new(files: BTreeMap<String, FileRecord>) -> Self {
        Self {
            schema_version: MANIFEST_SCHEMA_VERSION,
            generated_at: Utc::now(),
            files,
        }
    }

    pub fn empty() -> Self {
        Self::new(BTreeMap::new())
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    pub fn get(&self, path: &str) -> Option<&FileRecord> {
        self.files.get(path)
    }

    pub fn contains(&self, path: &str) -> bool {
        self.files.contains_key(path)
    }

    /// Digest over the sorted `(path, content digest)` pairs.
    ///
    /// Independent of `generated_at`, sizes and mtimes, so two scans of an
    /// unchanged tree have the same fingerprint.
    pub fn fingerprint(&self) -> ContentDigest {
        let mut buf = Vec::with_capacity(self.files.len() * 96);
        for (path, record) in &self.files {
            buf.extend_from_slice(path.as_bytes());
            buf.push(0);
            buf.extend_from_slice(record.content_digest.as_bytes());
            buf.push(b'\n');
        }
        digest::digest(&buf)
    }
}

/// Result of comparing two manifests.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestDiff {
    /// Records present only in the new manifest.
    pub added: Vec<FileRecord>,
    /// New records for paths whose digest changed.
    pub modified: Vec<FileRecord>,
    /// Paths present only in the old manifest.
    pub removed: Vec<String>,
    /// Paths whose digest is identical in both.
    pub unchanged: Vec<String>,
}

impl ManifestDiff {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.modified.is_empty() && self.removed.is_empty()
    }

    pub fn added_paths(&self) -> Vec<String> {
        self.added.iter().map(|r| r.relative_path.clone()).collect()
    }

    pub fn modified_paths(&self) -> Vec<String> {
        self.modified.iter().map(|r| r.relative_path.clone()).collect()
    }

    /// Paths whose chunks must be dropped before the new ones are inserted.
    pub fn purged_paths(&self) -> impl Iterator<Item = &str> {
        self.removed
            .iter()
            .map(String::as_str)
            .chain(self.modified.iter().map(|r| r.relative_path.as_str()))
    }

    /// Apply this diff to `base`, producing the manifest it was computed
    /// against.
    ///
    /// Unchanged paths keep `base`'s records, which are digest-equal to the
    /// new ones by construction.
    pub fn apply(&self, base: &Manifest) -> Manifest {
        let mut files = base.files.clone();
        for path in &self.removed {
            files.remove(path);
        }
        for record in self.added.iter().chain(&self.modified) {
            files.insert(record.relative_path.clone(), record.clone());
        }
        Manifest::new(files)
    }
}

/// Compare two manifests keyed by path, tie-broken by content digest.
pub fn diff(old: &Manifest, new: &Manifest) -> ManifestDiff {
    let mut out = ManifestDiff::default();

    for (path, record) in &new.files {
        match old.files.get(path) {
            None => out.added.push(record.clone()),
            Some(prev) if prev.content_digest != record.content_digest => {
                out.modified.push(record.clone())
            }
            Some(_) => out.unchanged.push(path.clone()),
        }
    }

    out.removed = old
        .files
        .keys()
        .filter(|path| !new.files.contains_key(*path))
        .cloned()
        .collect();

    out
}
