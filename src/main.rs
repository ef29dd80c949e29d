//! # Repository Index CLI (`rix`)
//!
//! The `rix` binary builds and queries the knowledge index of a local
//! repository.
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `rix update [ROOT]` | Scan, diff and incrementally re-index the repository |
//! | `rix query "<text>"` | Hybrid (dense + BM25) search over indexed chunks |
//! | `rix status [ROOT]` | Summary of the published snapshot |
//! | `rix scan [ROOT]` | Scan only; optionally save the manifest |
//! | `rix diff [ROOT]` | Show what the next update would change |
//!
//! ## Examples
//!
//! ```bash
//! # Index the current directory with the offline embedder
//! rix update
//!
//! # Use a config file and JSON output
//! rix --config ./repo-index.toml update --json
//!
//! # Top 3 chunks for a question
//! rix query "how are embeddings cached" --top-k 3
//! ```

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use repo_index::progress::ProgressMode;
use repo_index::workspace::Workspace;
use repo_index::{manifest_cmd, search, stats, update_cmd};
use tracing_subscriber::EnvFilter;

/// Repository Index CLI: an incremental hybrid search index over a local
/// repository.
///
/// Configuration is read from `--config`, else `<ROOT>/repo-index.toml`,
/// else built-in defaults.
#[derive(Parser)]
#[command(
    name = "rix",
    about = "Repository Index: incremental hybrid (dense + BM25) search over a local repository",
    version
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Progress output on stderr. Defaults to `human` on a terminal, `off` otherwise.
    #[arg(long, global = true, value_enum)]
    progress: Option<ProgressMode>,

    /// Emit logs as JSON lines on stderr.
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Commands,
}

/// Top-level CLI commands.
#[derive(Subcommand)]
enum Commands {
    /// Bring the index up to date with the file tree.
    ///
    /// Only added and modified files are re-chunked, and only chunks whose
    /// text is not in the embedding cache are sent to the provider.
    Update {
        /// Repository root (default: current directory).
        root: Option<PathBuf>,

        /// Print the update report as JSON.
        #[arg(long)]
        json: bool,
    },

    /// Search indexed chunks.
    Query {
        /// The query text.
        text: String,

        /// Repository root (default: current directory).
        #[arg(long)]
        root: Option<PathBuf>,

        /// Number of results (default: `retrieval.default_top_k`).
        #[arg(long)]
        top_k: Option<usize>,

        /// Print results as JSON.
        #[arg(long)]
        json: bool,
    },

    /// Show a summary of the published snapshot.
    Status {
        /// Repository root (default: current directory).
        root: Option<PathBuf>,

        #[arg(long)]
        json: bool,
    },

    /// Scan the file tree without indexing.
    Scan {
        /// Repository root (default: current directory).
        root: Option<PathBuf>,

        /// Save the manifest to this file.
        #[arg(long)]
        out: Option<PathBuf>,

        /// Print the manifest as JSON.
        #[arg(long)]
        json: bool,
    },

    /// Diff the file tree against the indexed manifest (or a saved one).
    Diff {
        /// Repository root (default: current directory).
        root: Option<PathBuf>,

        /// Compare against a manifest saved by `rix scan --out`.
        #[arg(long)]
        against: Option<PathBuf>,

        #[arg(long)]
        json: bool,
    },
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("warn,repo_index=info,repo_index_core=info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_json);
    let config = cli.config.as_deref();

    match cli.command {
        Commands::Update { root, json } => {
            let workspace = Workspace::load(root.as_deref(), config)?;
            let progress = cli.progress.unwrap_or_else(ProgressMode::default_for_tty);
            update_cmd::run_update(&workspace, progress, json).await?;
        }
        Commands::Query {
            text,
            root,
            top_k,
            json,
        } => {
            let workspace = Workspace::load(root.as_deref(), config)?;
            search::run_query(&workspace, &text, top_k, json).await?;
        }
        Commands::Status { root, json } => {
            let workspace = Workspace::load(root.as_deref(), config)?;
            stats::run_status(&workspace, json).await?;
        }
        Commands::Scan { root, out, json } => {
            let workspace = Workspace::load(root.as_deref(), config)?;
            manifest_cmd::run_scan(&workspace, out.as_deref(), json).await?;
        }
        Commands::Diff {
            root,
            against,
            json,
        } => {
            let workspace = Workspace::load(root.as_deref(), config)?;
            manifest_cmd::run_diff(&workspace, against, json).await?;
        }
    }

    Ok(())
}
