//! # scip-ingest CLI
//!
//! ## Usage
//!
//! ```bash
//! scip-ingest --config ./config/scip-ingest.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `scip-ingest init` | Create the SQLite database and run schema migrations |
//! | `scip-ingest enqueue <file>` | Store an index file and queue it for processing |
//! | `scip-ingest process <id>` | Process one queued upload now |
//! | `scip-ingest worker` | Poll for queued uploads and process them |
//! | `scip-ingest status` | List uploads and their states |

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

use scip_ingest::enqueue::EnqueueRequest;
use scip_ingest::{config, enqueue, migrate, status, worker};

/// scip-ingest: processes uploaded SCIP indexes into durable code
/// intelligence data.
#[derive(Parser)]
#[command(
    name = "scip-ingest",
    about = "Processing pipeline for uploaded SCIP indexes",
    version
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/scip-ingest.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema.
    ///
    /// Idempotent: running it multiple times is safe.
    Init,

    /// Queue a SCIP index for processing.
    ///
    /// Accepts a raw or gzip-compressed index. The artifact is stored
    /// compressed in the blob store with both sizes recorded.
    Enqueue {
        /// Path to the index file.
        file: PathBuf,

        /// Repository name, e.g. `github.com/acme/api`.
        #[arg(long)]
        repository: String,

        /// Full 40-character commit SHA the index was built at.
        #[arg(long)]
        commit: String,

        /// Directory of the repository the index covers.
        #[arg(long, default_value = "")]
        root: String,

        /// Indexer name. Defaults to the tool name in the index metadata.
        #[arg(long)]
        indexer: Option<String>,

        /// Indexer version. Defaults to the tool version in the index metadata.
        #[arg(long)]
        indexer_version: Option<String>,

        /// Mark the upload as legacy LSIF. Such uploads are rejected by the
        /// worker.
        #[arg(long)]
        lsif: bool,
    },

    /// Process one queued upload immediately.
    Process {
        /// Upload id.
        id: i64,
    },

    /// Run the worker loop.
    Worker {
        /// Process every ready upload once and exit.
        #[arg(long)]
        once: bool,
    },

    /// List uploads and their states.
    Status,
}

fn init_tracing(default_level: &str) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let cfg = config::load_config(&cli.config)?;
    init_tracing(&cfg.log.level);

    match cli.command {
        Commands::Init => {
            migrate::run_migrations(&cfg).await?;
            println!("Database initialized successfully.");
        }
        Commands::Enqueue {
            file,
            repository,
            commit,
            root,
            indexer,
            indexer_version,
            lsif,
        } => {
            let request = EnqueueRequest {
                file,
                repository,
                commit,
                root,
                indexer,
                indexer_version,
                lsif,
            };
            enqueue::enqueue(&cfg, &request).await?;
        }
        Commands::Process { id } => {
            worker::run_process(&cfg, id).await?;
        }
        Commands::Worker { once } => {
            worker::run_worker(&cfg, once).await?;
        }
        Commands::Status => {
            status::run_status(&cfg).await?;
        }
    }

    Ok(())
}
