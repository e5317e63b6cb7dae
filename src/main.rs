//! # repo-context CLI (`repoctx`)
//!
//! Indexes a local repository checkout and answers questions about it.
//!
//! ## Usage
//!
//! ```bash
//! repoctx --config ./repoctx.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `repoctx init` | Create the storage directory, database and empty vector index |
//! | `repoctx ingest` | Crawl the repository and update both stores |
//! | `repoctx search "<query>"` | Print ranked chunks for a query |
//! | `repoctx get <chunk-id>` | Print one chunk and its metadata |
//! | `repoctx stats` | Summarize what is indexed |
//! | `repoctx ask "<question>"` | Answer a question from retrieved context |
//!
//! ## Examples
//!
//! ```bash
//! repoctx init
//! repoctx ingest --root ~/src/project
//! repoctx search "where is the connection pool configured" --kind code
//! repoctx ask "which environment variables does the server read?"
//! ```
//!
//! Logging goes to stderr and is controlled by `RUST_LOG` (default `warn`)
//! or `-v` / `-vv`.

use anyhow::Result;
use clap::{Parser, Subcommand, ValueEnum};
use std::path::{Path, PathBuf};
use tracing_subscriber::EnvFilter;

use repo_context::config::{self, Config};
use repo_context::engine::Engine;
use repo_context::ingest::IngestMode;
use repo_context::metadata_store::MetadataFilter;
use repo_context::models::ArtifactKind;
use repo_context::progress::ProgressMode;
use repo_context::{ask, get, search, stats};

/// Default config file looked up in the working directory.
const DEFAULT_CONFIG: &str = "repoctx.toml";

/// repo-context: repository ingestion and context retrieval.
///
/// Every command reads a TOML configuration file. Without `--config`,
/// `./repoctx.toml` is used when present and built-in defaults otherwise.
#[derive(Parser)]
#[command(name = "repoctx", version, about)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Override `storage.root`.
    #[arg(long, global = true)]
    data: Option<PathBuf>,

    /// Increase log verbosity (-v info, -vv debug, -vvv trace).
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize storage.
    ///
    /// Creates the storage directory, the SQLite schema and an empty vector
    /// index. Idempotent.
    Init,

    /// Crawl the repository and update the stores.
    ///
    /// Incremental by default: only new or changed files are reprocessed.
    /// Files removed from the repository are always removed from the index.
    Ingest {
        /// Reprocess every file and re-embed chunks whose vector is missing.
        #[arg(long)]
        full: bool,

        /// Repository to ingest (defaults to `repository.root`).
        #[arg(long)]
        root: Option<PathBuf>,

        /// Progress output on stderr.
        #[arg(long, value_enum)]
        progress: Option<ProgressArg>,
    },

    /// Search indexed chunks.
    Search {
        query: String,

        #[command(flatten)]
        filters: FilterArgs,

        /// Print the result as JSON.
        #[arg(long)]
        json: bool,
    },

    /// Print one chunk by id.
    Get {
        chunk_id: String,

        #[arg(long)]
        json: bool,
    },

    /// Summarize the index.
    Stats {
        #[arg(long)]
        json: bool,
    },

    /// Answer a question using retrieved context.
    ///
    /// Requires a `[completion]` provider. With no relevant context the
    /// answer says so without calling the provider.
    Ask {
        question: String,

        #[command(flatten)]
        filters: FilterArgs,

        #[arg(long)]
        json: bool,
    },
}

#[derive(clap::Args)]
struct FilterArgs {
    /// Maximum number of chunks (defaults to `retrieval.top_k`).
    #[arg(long)]
    top_k: Option<usize>,

    /// Only chunks of this artifact kind.
    #[arg(long, value_enum)]
    kind: Option<KindArg>,

    /// Only chunks in this language (e.g. `rust`, `markdown`).
    #[arg(long)]
    language: Option<String>,

    /// Only chunks whose path starts with this prefix.
    #[arg(long)]
    path_prefix: Option<String>,

    /// Only chunks defining this symbol.
    #[arg(long)]
    symbol: Option<String>,

    /// Only chunks referencing this environment variable.
    #[arg(long)]
    env_var: Option<String>,
}

impl FilterArgs {
    fn to_filter(&self) -> MetadataFilter {
        MetadataFilter {
            kind: self.kind.map(ArtifactKind::from),
            language: self.language.clone(),
            path_prefix: self.path_prefix.clone(),
            symbol: self.symbol.clone(),
            env_var: self.env_var.clone(),
            ..Default::default()
        }
    }
}

#[derive(Clone, Copy, ValueEnum)]
enum KindArg {
    Code,
    Doc,
    Config,
    Unknown,
}

impl From<KindArg> for ArtifactKind {
    fn from(kind: KindArg) -> Self {
        match kind {
            KindArg::Code => ArtifactKind::Code,
            KindArg::Doc => ArtifactKind::Doc,
            KindArg::Config => ArtifactKind::Config,
            KindArg::Unknown => ArtifactKind::Unknown,
        }
    }
}

#[derive(Clone, Copy, ValueEnum)]
enum ProgressArg {
    Off,
    Human,
    Json,
}

impl From<ProgressArg> for ProgressMode {
    fn from(p: ProgressArg) -> Self {
        match p {
            ProgressArg::Off => ProgressMode::Off,
            ProgressArg::Human => ProgressMode::Human,
            ProgressArg::Json => ProgressMode::Json,
        }
    }
}

fn init_tracing(verbose: u8) {
    let filter = match verbose {
        0 => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        1 => EnvFilter::new("info"),
        2 => EnvFilter::new("debug"),
        _ => EnvFilter::new("trace"),
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

fn resolve_config(cli: &Cli) -> Result<Config> {
    let mut cfg = match &cli.config {
        Some(path) => config::load_config(path)?,
        None if Path::new(DEFAULT_CONFIG).exists() => config::load_config(Path::new(DEFAULT_CONFIG))?,
        None => Config::default(),
    };
    if let Some(data) = &cli.data {
        cfg.storage.root = data.clone();
    }
    cfg.validate()?;
    Ok(cfg)
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let cfg = resolve_config(&cli)?;
    let engine = Engine::open_with_config(cfg).await?;

    let result = run(&engine, cli.command).await;
    engine.close().await?;
    result
}

async fn run(engine: &Engine, command: Commands) -> Result<()> {
    let default_top_k = engine.config().retrieval.top_k;

    match command {
        Commands::Init => {
            engine.vectors().flush().await?;
            println!(
                "Storage initialized at {}",
                engine.config().storage.root.display()
            );
        }
        Commands::Ingest {
            full,
            root,
            progress,
        } => {
            let root = root.unwrap_or_else(|| engine.config().repository.root.clone());
            let mode = if full {
                IngestMode::Full
            } else {
                IngestMode::Incremental
            };
            let progress = progress
                .map(ProgressMode::from)
                .unwrap_or_else(ProgressMode::default_for_tty);
            let report = engine
                .ingestor()
                .with_progress(progress.reporter())
                .ingest(&root, mode)
                .await?;

            println!("ingest {} ({:?})", root.display(), mode);
            println!("  artifacts seen: {}", report.artifacts_seen);
            println!("  artifacts processed: {}", report.artifacts_processed);
            println!("  artifacts unchanged: {}", report.artifacts_unchanged);
            println!("  artifacts removed: {}", report.artifacts_removed);
            println!("  chunks added: {}", report.chunks_added);
            println!("  chunks removed: {}", report.chunks_removed);
            println!("  chunks unchanged: {}", report.chunks_unchanged);
            if mode == IngestMode::Full {
                println!("  embeddings repaired: {}", report.embeddings_repaired);
                println!("  orphaned vectors removed: {}", report.orphans_removed);
            }
            if !report.failures.is_empty() {
                println!("  failures: {}", report.failures.len());
                for failure in &report.failures {
                    println!("    {}", failure);
                }
            }
            println!("ok");
        }
        Commands::Search {
            query,
            filters,
            json,
        } => {
            let top_k = filters.top_k.unwrap_or(default_top_k);
            search::run_search(engine, &query, top_k, &filters.to_filter(), json).await?;
        }
        Commands::Get { chunk_id, json } => {
            get::run_get(engine, &chunk_id, json).await?;
        }
        Commands::Stats { json } => {
            if json {
                let stats = stats::collect(engine).await?;
                println!("{}", serde_json::to_string_pretty(&stats)?);
            } else {
                stats::run_stats(engine).await?;
            }
        }
        Commands::Ask {
            question,
            filters,
            json,
        } => {
            let top_k = filters.top_k.unwrap_or(default_top_k);
            ask::run_ask(engine, &question, top_k, &filters.to_filter(), json).await?;
        }
    }

    Ok(())
}
