//! `rix query`: rank indexed chunks against a text query.
//!
//! Results come from the published snapshot through
//! [`IndexCoordinator::query`](crate::coordinator::IndexCoordinator::query):
//! hybrid dense + BM25 scores, deterministic for an unchanged index.

use anyhow::Result;
use repo_index_core::models::ChunkRef;

use crate::workspace::Workspace;

const EXCERPT_CHARS: usize = 160;

pub async fn run_query(
    workspace: &Workspace,
    text: &str,
    top_k: Option<usize>,
    json: bool,
) -> Result<()> {
    if text.trim().is_empty() {
        println!("No results.");
        return Ok(());
    }

    let coordinator = workspace.open().await?;
    let top_k = top_k.unwrap_or(workspace.config.retrieval.default_top_k);
    let results = coordinator.query(text, top_k).await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&results)?);
        return Ok(());
    }
    if results.is_empty() {
        println!("No results.");
        return Ok(());
    }
    for (i, result) in results.iter().enumerate() {
        print_result(i + 1, result);
    }
    Ok(())
}

fn print_result(rank: usize, result: &ChunkRef) {
    println!(
        "{}. [{:.3}] {}:{}-{}",
        rank, result.score, result.source_path, result.start_offset, result.end_offset
    );
    let dense = result
        .dense_score
        .map_or_else(|| "-".to_string(), |s| format!("{:.3}", s));
    let sparse = result
        .sparse_score
        .map_or_else(|| "-".to_string(), |s| format!("{:.3}", s));
    println!("    dense: {}  sparse: {}", dense, sparse);
    println!("    excerpt: \"{}\"", excerpt(&result.text));
    println!("    id: {}", result.chunk_id);
    println!();
}

/// First [`EXCERPT_CHARS`] characters of `text` on one line.
fn excerpt(text: &str) -> String {
    let flat = text.split_whitespace().collect::<Vec<_>>().join(" ");
    match flat.char_indices().nth(EXCERPT_CHARS) {
        Some((cut, _)) => format!("{}...", &flat[..cut]),
        None => flat,
    }
}
