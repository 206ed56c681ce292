//! # Sentinel CLI (`sentinel`)
//!
//! ## Usage
//!
//! ```bash
//! sentinel --config ./config/sentinel.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `sentinel init` | Create the SQLite database and schema |
//! | `sentinel ingest <path>` | Ingest a file or directory under the corpus root |
//! | `sentinel rebuild [--reset]` | Rebuild the whole index from the corpus |
//! | `sentinel query "<question>"` | Answer a question with citations |
//! | `sentinel serve` | Start the HTTP API |
//! | `sentinel stats` | Print index size and health |
//! | `sentinel eval <cases.json>` | Measure retrieval precision@k |
//!
//! ## Examples
//!
//! ```bash
//! export SENTINEL_CORPUS_ROOT=/data/corpus
//! sentinel init
//! sentinel ingest pojk/
//! sentinel query "Apa itu transaksi afiliasi?"
//! SENTINEL_API_KEYS=dev-key sentinel serve
//! ```

use clap::{Parser, Subcommand};
use std::path::PathBuf;

use sentinel_rag::config::{self, LoggingConfig};
use sentinel_rag::{commands, logging, server};

/// Sentinel: citation-grounded question answering over a regulatory corpus.
///
/// All commands read a TOML configuration file. The corpus root may be
/// overridden with `SENTINEL_CORPUS_ROOT`.
#[derive(Parser)]
#[command(name = "sentinel", version, about)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/sentinel.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create the database schema. Idempotent.
    Init,

    /// Ingest a file or a directory, relative to the corpus root.
    ///
    /// Directories are walked with the configured include/exclude globs.
    /// Paths that resolve outside the corpus root are rejected.
    Ingest {
        path: String,

        /// Document version for a single file. Lower than the indexed
        /// version is skipped.
        #[arg(long)]
        version: Option<u32>,
    },

    /// Rebuild the index from every file in the corpus in one swap.
    Rebuild {
        /// Clear the store first. Required when the index is unhealthy.
        #[arg(long)]
        reset: bool,
    },

    /// Answer a question from the indexed corpus.
    Query {
        text: String,

        /// Print the answer and sources as JSON.
        #[arg(long)]
        json: bool,
    },

    /// Start the HTTP API on `[server].bind`.
    Serve,

    /// Show index statistics and health.
    Stats,

    /// Evaluate retrieval precision@k.
    ///
    /// The file is a JSON array of `{"query", "expected_source_ids"}`.
    Eval {
        cases: PathBuf,

        #[arg(long)]
        json: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let cfg = match config::load_config(&cli.config) {
        Ok(cfg) => cfg,
        Err(e) => {
            logging::init_logging(&LoggingConfig::default());
            return Err(e);
        }
    };
    logging::init_logging(&cfg.logging);

    match cli.command {
        Commands::Init => commands::run_init(&cfg).await?,
        Commands::Ingest { path, version } => commands::run_ingest(&cfg, &path, version).await?,
        Commands::Rebuild { reset } => commands::run_rebuild(&cfg, reset).await?,
        Commands::Query { text, json } => commands::run_query(&cfg, &text, json).await?,
        Commands::Serve => server::run_server(&cfg).await?,
        Commands::Stats => commands::run_stats(&cfg).await?,
        Commands::Eval { cases, json } => commands::run_eval(&cfg, &cases, json).await?,
    }

    Ok(())
}
