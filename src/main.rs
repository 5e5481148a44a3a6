//! # TableTalk CLI (`tabletalk`)
//!
//! Commands for database initialization, CSV ingestion, asking questions,
//! and inspecting stored chunks.
//!
//! ## Usage
//!
//! ```bash
//! tabletalk --config ./config/tabletalk.toml <command>
//! ```
//!
//! | Command | Description |
//! |---------|-------------|
//! | `tabletalk init` | Create the SQLite database and run schema migrations |
//! | `tabletalk ingest <file>` | Chunk, embed, and store a CSV dataset |
//! | `tabletalk ask "<question>" --source <id>` | Answer a question about a dataset |
//! | `tabletalk stats` | Show chunk counts per dataset and chunk type |

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use sha2::{Digest, Sha256};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

use tabletalk::config::{self, Config};
use tabletalk::csv_store::DirCsvStore;
use tabletalk::ingest::IngestionAgent;
use tabletalk::memory::{MemoryStore, SqliteMemoryStore};
use tabletalk::processor::HybridProcessor;
use tabletalk::session::SessionFacade;
use tabletalk::vector_store::{SqliteVectorStore, VectorStore};
use tabletalk::{db, embedding, llm, migrate};

/// TableTalk CLI — a hybrid query core for exploratory data analysis over
/// CSV files.
#[derive(Parser)]
#[command(
    name = "tabletalk",
    about = "TableTalk — answer natural-language questions about CSV datasets",
    version,
    long_about = "TableTalk ingests CSV files into analytical, row-window, and per-column \
    chunks in a vector store, then answers questions by retrieving summaries when they \
    suffice and consulting the raw table (whole or fragmented) when they do not."
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/tabletalk.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema.
    ///
    /// Creates the SQLite database file and all required tables
    /// (embeddings, sessions, interactions, contexts). Idempotent.
    Init,

    /// Ingest a CSV file.
    ///
    /// Parses the file, produces the analytical, row-window, and column
    /// chunk streams, embeds everything, and stores the vectors. Re-running
    /// with the same source id replaces the prior ingestion.
    Ingest {
        /// Path to the CSV file.
        file: PathBuf,

        /// Source id to register the dataset under. Defaults to
        /// `<file-stem>_<hash8>` derived from the file contents.
        #[arg(long)]
        source_id: Option<String>,
    },

    /// Ask a question about an ingested dataset.
    Ask {
        /// The question, in natural language.
        question: String,

        /// Source id of the dataset to query.
        #[arg(long)]
        source: String,

        /// Continue an existing session instead of starting a new one.
        #[arg(long)]
        session: Option<String>,

        /// Skip the summary-only path and analyze the raw table.
        #[arg(long)]
        force_csv: bool,

        /// Print the full answer object as JSON.
        #[arg(long)]
        json: bool,
    },

    /// Show chunk counts per dataset and per chunk type.
    Stats,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "warn".into()))
        .init();

    let cli = Cli::parse();
    let cfg = config::load_config(&cli.config)?;

    match cli.command {
        Commands::Init => {
            let pool = db::connect(&cfg.db, cfg.processor.store_timeout_ms).await?;
            migrate::run_migrations(&pool).await?;
            println!("Database initialized successfully.");
        }
        Commands::Ingest { file, source_id } => {
            let raw = std::fs::read_to_string(&file)
                .with_context(|| format!("Failed to read {}", file.display()))?;
            let source_id = source_id.unwrap_or_else(|| derive_source_id(&file, &raw));

            let (vector_store, _, csv_store) = build_stores(&cfg).await?;
            let provider = embedding::create_provider(&cfg.embedding)
                .map_err(|e| anyhow::anyhow!(e.to_string()))?;
            let agent = IngestionAgent::new(
                vector_store,
                provider,
                csv_store,
                cfg.chunking.clone(),
                cfg.embedding.clone(),
            );
            let stats = agent
                .ingest(&source_id, &raw)
                .await
                .map_err(|e| anyhow::anyhow!(e.to_string()))?;
            println!("{}", serde_json::to_string_pretty(&stats)?);
        }
        Commands::Ask {
            question,
            source,
            session,
            force_csv,
            json,
        } => {
            let (vector_store, memory, csv_store) = build_stores(&cfg).await?;
            let provider = embedding::create_provider(&cfg.embedding)
                .map_err(|e| anyhow::anyhow!(e.to_string()))?;
            let llm = llm::create_provider(&cfg.llm).map_err(|e| anyhow::anyhow!(e.to_string()))?;

            let processor = Arc::new(HybridProcessor::new(
                vector_store,
                Arc::clone(&memory),
                provider,
                llm,
                csv_store,
                cfg.processor.clone(),
            ));
            let facade = SessionFacade::new(processor, memory);
            let answer = facade
                .ask_with_options(&question, &source, session.as_deref(), force_csv)
                .await;

            if json {
                println!("{}", serde_json::to_string_pretty(&answer)?);
            } else {
                println!("[{} | {}{}]", answer.strategy.as_str(),
                    if answer.from_cache { "cached" } else { "fresh" },
                    if answer.csv_accessed { " | csv" } else { "" });
                println!("{}", answer.content);
                println!("(session: {})", answer.session_id);
            }
        }
        Commands::Stats => {
            let (vector_store, _, _) = build_stores(&cfg).await?;
            let stats = vector_store
                .stats()
                .await
                .map_err(|e| anyhow::anyhow!(e.to_string()))?;
            println!("Total chunks: {}", stats.total_records);
            let mut sources: Vec<_> = stats.by_source.iter().collect();
            sources.sort();
            println!("\nBy dataset:");
            for (source, count) in sources {
                println!("  {}: {}", source, count);
            }
            let mut types: Vec<_> = stats.by_chunk_type.iter().collect();
            types.sort();
            println!("\nBy chunk type:");
            for (chunk_type, count) in types {
                println!("  {}: {}", chunk_type, count);
            }
        }
    }

    Ok(())
}

async fn build_stores(
    cfg: &Config,
) -> Result<(
    Arc<dyn VectorStore>,
    Arc<dyn MemoryStore>,
    Arc<DirCsvStore>,
)> {
    let pool = db::connect(&cfg.db, cfg.processor.store_timeout_ms).await?;
    migrate::run_migrations(&pool).await?;
    let vector_store = Arc::new(SqliteVectorStore::new(
        pool.clone(),
        Duration::from_millis(cfg.processor.store_timeout_ms),
    ));
    let memory = Arc::new(SqliteMemoryStore::new(pool));
    let csv_store = Arc::new(DirCsvStore::new(cfg.csv.dir.clone()));
    Ok((vector_store, memory, csv_store))
}

/// `<file-stem>_<hash8>`: stable as long as the bytes do not change.
fn derive_source_id(file: &PathBuf, raw: &str) -> String {
    let stem = file
        .file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_else(|| "dataset".to_string());
    let digest = Sha256::digest(raw.as_bytes());
    let hash8: String = digest.iter().take(4).map(|b| format!("{:02x}", b)).collect();
    format!("{}_{}", stem, hash8)
}
