//! # finsight CLI (`fin`)
//!
//! ## Usage
//!
//! ```bash
//! fin --config ./config/finsight.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `fin init` | Create the SQLite database and schema |
//! | `fin submit <file>` | Register a document and enqueue its parse task |
//! | `fin worker` | Run the ingestion worker pool |
//! | `fin status <id>` | Show a document's ingestion status |
//! | `fin queue stats` | Queue depth by task type and status |
//! | `fin search "<query>"` | One hybrid retrieval, with scores |
//! | `fin ask "<query>"` | Full query turn, JSON answer |
//! | `fin chunk <file>` | Chunk a content list offline |

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Args, Parser, Subcommand};
use finsight::ingest::{self, SubmitRequest};
use finsight::queue::SqliteTaskQueue;
use finsight::worker::{self, WorkerPool};
use finsight::{app, ask, chunk_cmd, config, db, logging, migrate, search, stats};
use finsight_core::filter::{SearchFilter, YearFilter};
use finsight_core::models::ChunkType;

/// finsight: question answering over financial filings.
///
/// All commands accept `--config` pointing to a TOML file. See
/// `config/finsight.example.toml`.
#[derive(Parser)]
#[command(
    name = "fin",
    about = "finsight: ingest financial filings and answer questions over them",
    version
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/finsight.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create the database and all tables. Idempotent.
    Init,

    /// Register a document and enqueue it for ingestion.
    ///
    /// FILE is either a content-list JSON (already extracted) or a source
    /// document whose extraction output will appear under
    /// `[extraction] output_dir`.
    Submit {
        file: PathBuf,

        #[arg(long)]
        owner: String,

        /// Reuse an id to re-ingest; defaults to a new UUID.
        #[arg(long)]
        document_id: Option<String>,

        #[arg(long)]
        company: Option<String>,

        #[arg(long)]
        ticker: Option<String>,

        #[arg(long)]
        year: Option<i32>,

        #[arg(long)]
        quarter: Option<u8>,

        /// e.g. `10-K`, `10-Q`, `annual_report`.
        #[arg(long)]
        doc_type: Option<String>,

        #[arg(long)]
        sector: Option<String>,

        /// Page count, if known, to size the extraction wait.
        #[arg(long)]
        pages: Option<u32>,
    },

    /// Run the ingestion worker pool until Ctrl-C.
    Worker {
        #[arg(long)]
        pool_size: Option<usize>,

        /// Exit once no task is claimable instead of polling.
        #[arg(long)]
        drain: bool,
    },

    /// Show a document's ingestion status.
    Status { document_id: String },

    /// Inspect the processing queue.
    Queue {
        #[command(subcommand)]
        action: QueueAction,
    },

    /// Run one hybrid retrieval and print scored chunks.
    Search {
        query: String,

        #[command(flatten)]
        filter: FilterArgs,

        #[arg(long)]
        top_k: Option<usize>,
    },

    /// Answer a question; prints the answer as JSON.
    Ask {
        query: String,

        #[command(flatten)]
        filter: FilterArgs,

        /// Continue an existing conversation.
        #[arg(long)]
        session: Option<String>,
    },

    /// Chunk a content-list JSON file and print the chunks.
    Chunk {
        file: PathBuf,

        #[arg(long, default_value = "local")]
        document_id: String,

        /// Print full chunks as JSON.
        #[arg(long)]
        json: bool,
    },
}

#[derive(Subcommand)]
enum QueueAction {
    /// Task counts by type and status.
    Stats,
}

/// Metadata filter flags shared by `search` and `ask`.
#[derive(Args)]
struct FilterArgs {
    /// Owner whose documents are searched. Required.
    #[arg(long)]
    owner: String,

    /// Restrict to a company; repeat for several.
    #[arg(long = "company")]
    companies: Vec<String>,

    /// `2023` or an inclusive range `2021-2023`.
    #[arg(long, value_parser = parse_year)]
    year: Option<YearFilter>,

    #[arg(long)]
    quarter: Option<u8>,

    #[arg(long)]
    doc_type: Option<String>,

    #[arg(long)]
    sector: Option<String>,

    /// One of `heading`, `table`, `code`, `list`, `paragraph`.
    #[arg(long)]
    chunk_type: Option<ChunkType>,

    /// Only chunks containing a table.
    #[arg(long)]
    tables_only: bool,
}

impl FilterArgs {
    fn into_filter(self) -> SearchFilter {
        SearchFilter {
            owner_id: self.owner,
            companies: self.companies,
            fiscal_year: self.year,
            document_type: self.doc_type,
            fiscal_quarter: self.quarter,
            sector: self.sector,
            chunk_type: self.chunk_type,
            has_table: self.tables_only.then_some(true),
        }
    }
}

fn parse_year(s: &str) -> Result<YearFilter, String> {
    let parse = |v: &str| v.trim().parse::<i32>().map_err(|_| format!("invalid year '{}'", v));
    match s.split_once('-') {
        Some((start, end)) => {
            let (start, end) = (parse(start)?, parse(end)?);
            if start > end {
                return Err(format!("year range {}-{} is reversed", start, end));
            }
            Ok(YearFilter::Range { start, end })
        }
        None => Ok(YearFilter::Exact(parse(s)?)),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let cfg = config::load_config(&cli.config)?;

    let default_level = if matches!(cli.command, Commands::Worker { .. }) {
        "info"
    } else {
        "warn"
    };
    logging::init(cfg.logging.json, default_level);

    match cli.command {
        Commands::Init => {
            migrate::run_migrations(&cfg).await?;
            println!("Database initialized successfully.");
        }
        Commands::Submit {
            file,
            owner,
            document_id,
            company,
            ticker,
            year,
            quarter,
            doc_type,
            sector,
            pages,
        } => {
            let pool = db::connect(&cfg).await?;
            let queue = SqliteTaskQueue::new(pool.clone());
            let req = SubmitRequest {
                source: file,
                owner_id: owner,
                document_id,
                company,
                ticker,
                sector,
                fiscal_year: year,
                fiscal_quarter: quarter,
                document_type: doc_type,
                pages,
            };
            let submitted = ingest::submit(&pool, &queue, req, cfg.worker.max_attempts).await?;
            println!("submitted {} (task {})", submitted.document_id, submitted.task_id);
            pool.close().await;
        }
        Commands::Worker { pool_size, drain } => {
            let pool = db::connect(&cfg).await?;
            let ingestor = Arc::new(app::ingestor(&cfg, &pool)?);
            let mut workers = WorkerPool::new(ingestor, &cfg.worker);
            if let Some(n) = pool_size {
                workers = workers.with_pool_size(n);
            }

            let report = if drain {
                workers.drain().await?
            } else {
                let (tx, rx) = tokio::sync::watch::channel(false);
                worker::shutdown_on_ctrl_c(tx);
                workers.run(rx).await?
            };
            println!("completed: {}, failed: {}", report.completed, report.failed);
            if report.lost > 0 {
                println!("lost leases: {}", report.lost);
            }
            pool.close().await;
        }
        Commands::Status { document_id } => {
            let pool = db::connect(&cfg).await?;
            match ingest::document_status(&pool, &document_id).await? {
                Some(doc) => {
                    println!("{}: {} ({} pages)", doc.id, doc.status, doc.page_count);
                    if let Some(err) = doc.error_message {
                        println!("  error: {}", err);
                    }
                }
                None => anyhow::bail!("unknown document {}", document_id),
            }
            pool.close().await;
        }
        Commands::Queue { action } => match action {
            QueueAction::Stats => stats::run_queue_stats(&cfg).await?,
        },
        Commands::Search { query, filter, top_k } => {
            search::run_search(&cfg, &query, filter.into_filter(), top_k).await?;
        }
        Commands::Ask {
            query,
            filter,
            session,
        } => {
            ask::run_ask(&cfg, &query, filter.into_filter(), session).await?;
        }
        Commands::Chunk {
            file,
            document_id,
            json,
        } => {
            chunk_cmd::run_chunk(&cfg, &file, &document_id, json)?;
        }
    }

    Ok(())
}
