//! Index statistics and health overview.
//!
//! Provides a quick summary of what's indexed: file and chunk counts,
//! embedding coverage, stale chunks and a per-language breakdown. Used by
//! `rix status` to confirm that updates are working as expected.

use std::collections::BTreeMap;

use anyhow::Result;
use chrono::{DateTime, Utc};
use repo_index_core::snapshot::IndexSnapshot;
use serde::Serialize;

use crate::cache::{CacheOptions, EmbeddingCache};
use crate::workspace::Workspace;

/// Per-language breakdown of file and chunk counts.
#[derive(Debug, Default, Serialize)]
struct LanguageStats {
    files: usize,
    chunks: usize,
    bytes: u64,
}

#[derive(Debug, Serialize)]
struct StatusReport {
    root: String,
    storage_dir: String,
    state: &'static str,
    model_id: Option<String>,
    dims: Option<usize>,
    files: usize,
    chunks: usize,
    embedded: usize,
    stale: usize,
    cached_vectors: u64,
    snapshot_bytes: u64,
    generated_at: Option<DateTime<Utc>>,
    fingerprint: Option<String>,
    languages: BTreeMap<String, LanguageStats>,
}

fn language_stats(snapshot: &IndexSnapshot) -> BTreeMap<String, LanguageStats> {
    let mut stats: BTreeMap<String, LanguageStats> = BTreeMap::new();
    let label = |path: &str| {
        snapshot
            .manifest
            .get(path)
            .and_then(|r| r.language_guess)
            .map_or("other", |l| l.as_str())
            .to_string()
    };
    for (path, record) in &snapshot.manifest.files {
        let entry = stats.entry(label(path)).or_default();
        entry.files += 1;
        entry.bytes += record.byte_size;
    }
    for meta in snapshot.chunks.values() {
        stats.entry(label(&meta.source_path)).or_default().chunks += 1;
    }
    stats
}

/// Run the status command: load the published snapshot and print a summary.
pub async fn run_status(workspace: &Workspace, json: bool) -> Result<()> {
    let store = workspace.store();
    let snapshot = store.load()?;

    let cached_vectors = if store.cache_path().exists() {
        let cache = EmbeddingCache::open(
            &store.cache_path(),
            CacheOptions::from(&workspace.config.embedding),
        )
        .await?;
        cache.count(None).await?
    } else {
        0
    };
    let snapshot_bytes = std::fs::metadata(store.snapshot_path())
        .map(|m| m.len())
        .unwrap_or(0);

    let report = match &snapshot {
        Some(s) => StatusReport {
            root: workspace.root.display().to_string(),
            storage_dir: workspace.storage_dir.display().to_string(),
            state: "PERSISTED",
            model_id: Some(s.model_id.clone()),
            dims: s.dense.dims(),
            files: s.manifest.len(),
            chunks: s.chunk_count(),
            embedded: s.dense.len(),
            stale: s.stale.len(),
            cached_vectors,
            snapshot_bytes,
            generated_at: Some(s.manifest.generated_at),
            fingerprint: Some(s.manifest.fingerprint().to_hex()),
            languages: language_stats(s),
        },
        None => StatusReport {
            root: workspace.root.display().to_string(),
            storage_dir: workspace.storage_dir.display().to_string(),
            state: "EMPTY",
            model_id: None,
            dims: None,
            files: 0,
            chunks: 0,
            embedded: 0,
            stale: 0,
            cached_vectors,
            snapshot_bytes,
            generated_at: None,
            fingerprint: None,
            languages: BTreeMap::new(),
        },
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    println!("Repository Index — Status");
    println!("=========================");
    println!();
    println!("  Root:        {}", report.root);
    println!("  Storage:     {}", report.storage_dir);
    println!("  State:       {}", report.state);

    let (Some(model), Some(generated_at)) = (&report.model_id, report.generated_at) else {
        println!();
        println!("  No snapshot published yet. Run `rix update` first.");
        println!();
        return Ok(());
    };

    println!(
        "  Snapshot:    {}, generated {}",
        format_bytes(report.snapshot_bytes),
        format_ts_relative(generated_at.timestamp())
    );
    match report.dims {
        Some(dims) => println!("  Model:       {} ({} dims)", model, dims),
        None => println!("  Model:       {}", model),
    }
    println!();
    println!("  Files:       {}", report.files);
    println!("  Chunks:      {}", report.chunks);
    println!(
        "  Embedded:    {} / {} ({}%)",
        report.embedded,
        report.chunks,
        if report.chunks > 0 {
            (report.embedded * 100) / report.chunks
        } else {
            0
        }
    );
    println!("  Stale:       {}", report.stale);
    println!("  Cached:      {} vectors", report.cached_vectors);
    if let Some(fingerprint) = &report.fingerprint {
        println!("  Fingerprint: {}", fingerprint);
    }

    if !report.languages.is_empty() {
        println!();
        println!("  By language:");
        println!(
            "  {:<20} {:>6} {:>8} {:>10}",
            "LANGUAGE", "FILES", "CHUNKS", "SIZE"
        );
        println!("  {}", "-".repeat(48));
        for (language, s) in &report.languages {
            println!(
                "  {:<20} {:>6} {:>8} {:>10}",
                language,
                s.files,
                s.chunks,
                format_bytes(s.bytes)
            );
        }
    }

    println!();
    Ok(())
}

/// Format a byte count as a human-readable string.
fn format_bytes(bytes: u64) -> String {
    if bytes < 1024 {
        format!("{} B", bytes)
    } else if bytes < 1024 * 1024 {
        format!("{:.1} KB", bytes as f64 / 1024.0)
    } else if bytes < 1024 * 1024 * 1024 {
        format!("{:.1} MB", bytes as f64 / (1024.0 * 1024.0))
    } else {
        format!("{:.2} GB", bytes as f64 / (1024.0 * 1024.0 * 1024.0))
    }
}

/// Format a Unix timestamp as a relative time string (e.g. "3 hours ago").
fn format_ts_relative(ts: i64) -> String {
    let delta = Utc::now().timestamp() - ts;
    if delta < 0 {
        return format_ts_iso(ts);
    }

    if delta < 60 {
        "just now".to_string()
    } else if delta < 3600 {
        let mins = delta / 60;
        format!("{} min{} ago", mins, if mins == 1 { "" } else { "s" })
    } else if delta < 86400 {
        let hours = delta / 3600;
        format!("{} hour{} ago", hours, if hours == 1 { "" } else { "s" })
    } else if delta < 86400 * 30 {
        let days = delta / 86400;
        format!("{} day{} ago", days, if days == 1 { "" } else { "s" })
    } else {
        format_ts_iso(ts)
    }
}

fn format_ts_iso(ts: i64) -> String {
    DateTime::from_timestamp(ts, 0)
        .map(|dt| dt.format("%Y-%m-%d %H:%M").to_string())
        .unwrap_or_else(|| ts.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bytes_are_humanized() {
        assert_eq!(format_bytes(512), "512 B");
        assert_eq!(format_bytes(2048), "2.0 KB");
        assert_eq!(format_bytes(3 * 1024 * 1024), "3.0 MB");
    }

    #[test]
    fn recent_timestamps_are_relative() {
        let now = Utc::now().timestamp();
        assert_eq!(format_ts_relative(now), "just now");
        assert_eq!(format_ts_relative(now - 120), "2 mins ago");
        assert_eq!(format_ts_relative(now - 3600), "1 hour ago");
    }
}
