//! File-tree scanning into a [`Manifest`].
//!
//! Walks the root in file-name order with [`IgnoreRules::walker`], pruning
//! ignored directories, and computes a [`FileRecord`] for every remaining
//! regular file. Only an
//! unreadable root is an error. A file or directory that cannot be read is
//! skipped and reported as a [`ScanWarning`].

use std::collections::BTreeMap;
use std::fs::File;
use std::io::Read;
use std::path::Path;

use chrono::{DateTime, Utc};
use repo_index_core::digest::{self, digest_reader};
use repo_index_core::manifest::Manifest;
use repo_index_core::models::{FileRecord, Language};
use serde::Serialize;
use tracing::{debug, info};

use crate::config::ScanConfig;
use crate::error::{IndexError, Result};
use crate::ignore::IgnoreRules;

/// Bytes inspected for a NUL when deciding whether a file is binary.
const BINARY_SNIFF_LEN: usize = 8 * 1024;

/// A file skipped or degraded during scanning or reading.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ScanWarning {
    pub path: String,
    pub message: String,
}

impl ScanWarning {
    fn new(path: impl Into<String>, message: impl ToString) -> Self {
        Self {
            path: path.into(),
            message: message.to_string(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ScanOutcome {
    pub manifest: Manifest,
    pub warnings: Vec<ScanWarning>,
}

#[derive(Debug, Clone)]
pub struct ScanOptions {
    /// Files larger than this are recorded but not chunked.
    pub max_file_bytes: u64,
    pub follow_symlinks: bool,
}

impl Default for ScanOptions {
    fn default() -> Self {
        ScanOptions::from(&ScanConfig::default())
    }
}

impl From<&ScanConfig> for ScanOptions {
    fn from(config: &ScanConfig) -> Self {
        Self {
            max_file_bytes: config.max_file_bytes,
            follow_symlinks: config.follow_symlinks,
        }
    }
}

fn relative_path(root: &Path, path: &Path) -> Option<String> {
    let rel = path.strip_prefix(root).ok()?;
    let parts: Option<Vec<&str>> = rel.components().map(|c| c.as_os_str().to_str()).collect();
    Some(parts?.join("/"))
}

/// Scan `root` into a manifest.
pub fn scan(root: &Path, rules: &IgnoreRules, options: &ScanOptions) -> Result<ScanOutcome> {
    std::fs::read_dir(root).map_err(|source| IndexError::Scan {
        path: root.to_path_buf(),
        source,
    })?;

    let mut files = BTreeMap::new();
    let mut warnings = Vec::new();

    let walker = rules.walker(root, options.follow_symlinks).map_err(|e| IndexError::Scan {
        path: root.to_path_buf(),
        source: std::io::Error::new(std::io::ErrorKind::InvalidInput, e),
    })?;

    for entry in walker {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                let path = error_path(&e)
                    .and_then(|p| relative_path(root, p))
                    .unwrap_or_default();
                debug!(path = %path, error = %e, "walk error");
                warnings.push(ScanWarning::new(path, &e));
                continue;
            }
        };
        if !entry.file_type().is_some_and(|t| t.is_file()) {
            continue;
        }

        let Some(rel) = relative_path(root, entry.path()) else {
            warnings.push(ScanWarning::new(
                entry.path().to_string_lossy(),
                "path is not valid UTF-8",
            ));
            continue;
        };

        match file_record(entry.path(), &rel) {
            Ok(record) => {
                files.insert(rel, record);
            }
            Err(e) => warnings.push(ScanWarning::new(rel, e)),
        }
    }

    info!(
        root = %root.display(),
        files = files.len(),
        warnings = warnings.len(),
        "scan complete"
    );

    Ok(ScanOutcome {
        manifest: Manifest::new(files),
        warnings,
    })
}

fn error_path(err: &::ignore::Error) -> Option<&Path> {
    match err {
        ::ignore::Error::WithPath { path, .. } => Some(path.as_path()),
        ::ignore::Error::WithDepth { err, .. } | ::ignore::Error::WithLineNumber { err, .. } => {
            error_path(err)
        }
        _ => None,
    }
}

fn file_record(path: &Path, rel: &str) -> std::io::Result<FileRecord> {
    let metadata = std::fs::metadata(path)?;
    let modified: DateTime<Utc> = metadata
        .modified()
        .map(DateTime::<Utc>::from)
        .unwrap_or_else(|_| DateTime::<Utc>::from(std::time::UNIX_EPOCH));
    let content_digest = digest_reader(File::open(path)?)?;

    Ok(FileRecord {
        relative_path: rel.to_string(),
        content_digest,
        byte_size: metadata.len(),
        last_modified: modified,
        language_guess: Language::from_path(rel),
    })
}

/// Read the text of a scanned file for chunking.
///
/// Returns `Err` with a warning when the file is too large, looks binary,
/// is not UTF-8, cannot be read, or no longer matches its recorded digest.
pub fn read_indexable_text(
    root: &Path,
    record: &FileRecord,
    options: &ScanOptions,
) -> std::result::Result<String, ScanWarning> {
    let path = &record.relative_path;
    if record.byte_size > options.max_file_bytes {
        return Err(ScanWarning::new(
            path.as_str(),
            format!(
                "{} bytes exceeds max_file_bytes ({}); recorded but not indexed",
                record.byte_size, options.max_file_bytes
            ),
        ));
    }

    let mut bytes = Vec::with_capacity(record.byte_size as usize);
    File::open(root.join(path))
        .and_then(|mut f| f.read_to_end(&mut bytes))
        .map_err(|e| ScanWarning::new(path.as_str(), e))?;

    if digest::digest(&bytes) != record.content_digest {
        return Err(ScanWarning::new(
            path.as_str(),
            "file changed during update; will be re-indexed on the next run",
        ));
    }
    if bytes[..bytes.len().min(BINARY_SNIFF_LEN)].contains(&0) {
        return Err(ScanWarning::new(path.as_str(), "binary file; recorded but not indexed"));
    }
    String::from_utf8(bytes)
        .map_err(|_| ScanWarning::new(path.as_str(), "not valid UTF-8; recorded but not indexed"))
}
