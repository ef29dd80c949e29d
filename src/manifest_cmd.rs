//! `rix scan` and `rix diff`: read-only views of the file tree.
//!
//! Neither command touches the index. `scan` can save the manifest for a
//! later `diff --against`.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use repo_index_core::manifest::{self, Manifest};
use serde::Serialize;

use crate::scan::{scan, ScanOptions, ScanOutcome};
use crate::store::{load_manifest, save_manifest};
use crate::workspace::Workspace;

async fn scan_workspace(workspace: &Workspace) -> Result<ScanOutcome> {
    let root = workspace.root.clone();
    let rules = workspace.ignore_rules();
    let options = ScanOptions::from(&workspace.config.scan);
    let outcome = tokio::task::spawn_blocking(move || scan(&root, &rules, &options)).await??;
    Ok(outcome)
}

pub async fn run_scan(workspace: &Workspace, out: Option<&Path>, json: bool) -> Result<()> {
    let outcome = scan_workspace(workspace).await?;

    if let Some(out) = out {
        save_manifest(&outcome.manifest, out)
            .with_context(|| format!("Failed to save manifest to {}", out.display()))?;
    }

    if json {
        println!("{}", serde_json::to_string_pretty(&outcome.manifest)?);
        return Ok(());
    }

    for (path, record) in &outcome.manifest.files {
        println!(
            "  {}  {:>10}  {}",
            &record.content_digest.to_hex()[..12],
            record.byte_size,
            path
        );
    }
    println!();
    println!(
        "Scanned {} files ({} warnings)",
        outcome.manifest.len(),
        outcome.warnings.len()
    );
    println!("Fingerprint: {}", outcome.manifest.fingerprint());
    for w in &outcome.warnings {
        println!("  warning: {}: {}", w.path, w.message);
    }
    if let Some(out) = out {
        println!("Manifest saved to {}", out.display());
    }
    Ok(())
}

#[derive(Debug, Serialize)]
struct DiffSummary {
    base: String,
    added: Vec<String>,
    modified: Vec<String>,
    removed: Vec<String>,
    unchanged: usize,
}

pub async fn run_diff(workspace: &Workspace, against: Option<PathBuf>, json: bool) -> Result<()> {
    let (base_label, base) = match against {
        Some(path) => {
            let manifest = load_manifest(&path)
                .with_context(|| format!("Failed to load manifest {}", path.display()))?;
            (path.display().to_string(), manifest)
        }
        None => {
            let store = workspace.store();
            let manifest = store
                .load()?
                .map(|s| s.manifest)
                .unwrap_or_else(Manifest::empty);
            (store.snapshot_path().display().to_string(), manifest)
        }
    };

    let current = scan_workspace(workspace).await?;
    let diff = manifest::diff(&base, &current.manifest);
    let summary = DiffSummary {
        base: base_label,
        added: diff.added_paths(),
        modified: diff.modified_paths(),
        removed: diff.removed.clone(),
        unchanged: diff.unchanged.len(),
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&summary)?);
        return Ok(());
    }

    for path in &summary.added {
        println!("+ {}", path);
    }
    for path in &summary.modified {
        println!("~ {}", path);
    }
    for path in &summary.removed {
        println!("- {}", path);
    }
    println!(
        "{} added, {} modified, {} removed, {} unchanged (against {})",
        summary.added.len(),
        summary.modified.len(),
        summary.removed.len(),
        summary.unchanged,
        summary.base
    );
    Ok(())
}
