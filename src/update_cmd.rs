//! `rix update`: bring the index of a repository up to date.
//!
//! Ctrl-C cancels the update between embedding batches; the previously
//! published snapshot stays in place.

use anyhow::Result;
use tokio_util::sync::CancellationToken;

use crate::coordinator::UpdateReport;
use crate::progress::ProgressMode;
use crate::workspace::Workspace;

pub async fn run_update(workspace: &Workspace, progress: ProgressMode, json: bool) -> Result<()> {
    let coordinator = workspace.open().await?.with_progress(progress.reporter());
    let rules = workspace.ignore_rules();

    let cancel = CancellationToken::new();
    let ctrl_c = {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                cancel.cancel();
            }
        })
    };
    let result = coordinator
        .update_with_cancel(&workspace.root, &rules, &cancel)
        .await;
    ctrl_c.abort();
    let report = result?;

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print_report(workspace, &report);
    }
    Ok(())
}

fn print_report(workspace: &Workspace, report: &UpdateReport) {
    println!("Index updated: {}", workspace.storage_dir.display());
    println!();
    println!("  Added:        {}", report.added.len());
    println!("  Modified:     {}", report.modified.len());
    println!("  Removed:      {}", report.removed.len());
    println!("  Unchanged:    {}", report.unchanged);
    println!("  Re-embedded:  {} chunks", report.chunks_reembedded);
    println!("  Reused:       {} chunks", report.chunks_reused);
    println!("  Stale:        {} chunks", report.stale_chunks);
    println!("  Fingerprint:  {}", report.fingerprint);
    println!("  Took:         {} ms", report.duration_ms);

    let changes = report
        .added
        .iter()
        .map(|p| ('+', p))
        .chain(report.modified.iter().map(|p| ('~', p)))
        .chain(report.removed.iter().map(|p| ('-', p)));
    let mut printed_header = false;
    for (mark, path) in changes {
        if !printed_header {
            println!();
            println!("  Changes:");
            printed_header = true;
        }
        println!("    {} {}", mark, path);
    }

    if !report.warnings.is_empty() {
        println!();
        println!("  Warnings:");
        for w in &report.warnings {
            println!("    {}: {}", w.path, w.message);
        }
    }
    if !report.errors.is_empty() {
        println!();
        println!("  Embedding failures (kept for keyword search, retried next update):");
        for e in &report.errors {
            println!(
                "    {}: {}",
                e.chunk_id.as_deref().unwrap_or(&e.path),
                e.message
            );
        }
    }
}
