//! # docchunk CLI
//!
//! Converts documents fetched by URL to markdown, splits them into
//! page-annotated chunks and optionally enriches the chunks.
//!
//! ## Usage
//!
//! ```bash
//! docchunk --config ./config/docchunk.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `docchunk init` | Create the SQLite database and seed default prompts |
//! | `docchunk serve` | Start the HTTP API |
//! | `docchunk task create <url>` | Queue a document (`--wait` processes it inline) |
//! | `docchunk task show <id>` | Print a task and its document |
//! | `docchunk task cancel <id>` | Cancel a task |
//! | `docchunk task delete <id>` | Delete a task and its data |
//! | `docchunk task chunks <id>` | Print a task's chunks |
//! | `docchunk process-pending` | Run pending tasks through the pipeline |
//! | `docchunk purge` | Delete expired tasks |
//! | `docchunk chunk <file>` | Chunk a local markdown file (no database) |
//! | `docchunk stats` | Print database statistics |
//!
//! Logging is controlled by `RUST_LOG` (default `info`) and written to stderr.

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

use docchunk::config::{self, Config};
use docchunk::models::ChunkingMethod;
use docchunk::tasks::NewTask;
use docchunk::{migrate, server, stats, task_cmd};

/// docchunk: document conversion and chunking pipeline.
#[derive(Parser)]
#[command(
    name = "docchunk",
    about = "docchunk: convert documents to markdown and split them into page-annotated chunks",
    version
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/docchunk.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema and seed the default prompts.
    ///
    /// Idempotent.
    Init,

    /// Start the HTTP API on `[server].bind`.
    Serve,

    /// Create and inspect tasks.
    Task {
        #[command(subcommand)]
        action: TaskAction,
    },

    /// Run pending tasks, oldest first.
    ProcessPending {
        /// Maximum number of tasks to pick up.
        #[arg(long, default_value_t = 50)]
        limit: i64,

        /// Only list the tasks that would run.
        #[arg(long)]
        dry_run: bool,
    },

    /// Delete tasks whose deletion or expiry time has passed.
    Purge {
        /// Also delete tasks with neither a deletion nor an expiry time.
        #[arg(long)]
        include_null_dates: bool,
    },

    /// Chunk a local markdown file and print the chunk records as JSON.
    Chunk {
        file: PathBuf,
        #[arg(long)]
        method: Option<ChunkingMethod>,
        #[arg(long)]
        chunk_size: Option<usize>,
        #[arg(long)]
        chunk_overlap: Option<usize>,
    },

    /// Print database statistics.
    Stats,
}

#[derive(Subcommand)]
enum TaskAction {
    /// Queue a document for processing.
    Create {
        /// http(s) URL of the document.
        url: String,
        #[arg(long)]
        method: Option<ChunkingMethod>,
        #[arg(long)]
        chunk_size: Option<usize>,
        #[arg(long)]
        chunk_overlap: Option<usize>,
        /// Minutes after which the task may be purged.
        #[arg(long)]
        delete_after: Option<i64>,
        /// Process the task now and print the final state.
        #[arg(long)]
        wait: bool,
    },
    Show {
        id: String,
    },
    Cancel {
        id: String,
    },
    Delete {
        id: String,
    },
    /// Print the task's chunks in order.
    Chunks {
        id: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    // `chunk` works without a config file
    if let Commands::Chunk {
        file,
        method,
        chunk_size,
        chunk_overlap,
    } = &cli.command
    {
        let cfg = if cli.config.exists() {
            config::load_config(&cli.config)?
        } else {
            Config::with_db_path("./data/docchunk.sqlite")
        };
        task_cmd::run_chunk_file(&cfg, file, *method, *chunk_size, *chunk_overlap).await?;
        return Ok(());
    }

    let cfg = config::load_config(&cli.config)?;

    match cli.command {
        Commands::Init => {
            migrate::run_migrations(&cfg).await?;
            println!("Database initialized successfully.");
        }
        Commands::Serve => {
            server::run_server(&cfg).await?;
        }
        Commands::Task { action } => match action {
            TaskAction::Create {
                url,
                method,
                chunk_size,
                chunk_overlap,
                delete_after,
                wait,
            } => {
                let request = NewTask {
                    url,
                    chunking_method: method,
                    chunk_size,
                    chunk_overlap,
                    delete_after_minutes: delete_after,
                };
                task_cmd::run_task_create(&cfg, request, wait).await?;
            }
            TaskAction::Show { id } => task_cmd::run_task_show(&cfg, &id).await?,
            TaskAction::Cancel { id } => task_cmd::run_task_cancel(&cfg, &id).await?,
            TaskAction::Delete { id } => task_cmd::run_task_delete(&cfg, &id).await?,
            TaskAction::Chunks { id } => task_cmd::run_task_chunks(&cfg, &id).await?,
        },
        Commands::ProcessPending { limit, dry_run } => {
            task_cmd::run_process_pending(&cfg, limit, dry_run).await?;
        }
        Commands::Purge { include_null_dates } => {
            task_cmd::run_purge(&cfg, include_null_dates).await?;
        }
        Commands::Stats => {
            stats::run_stats(&cfg).await?;
        }
        Commands::Chunk { .. } => {}
    }

    Ok(())
}
