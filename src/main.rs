//! # paper-harvest
//!
//! Turns a research question into a RAGFlow knowledge base:
//! 1. a RAGFlow agent turns the question into search keywords
//! 2. ScienceDirect is searched with those keywords
//! 3. full texts are downloaded into a local cache directory
//! 4. the files are uploaded to a dataset and parsed
//!
//! ## Quick Start
//! ```bash
//! cargo run -- run "What are the latest advancements in LLM template-based code generation?"
//! ```

/// Configuration management
mod config;

/// RAGFlow response envelope
mod envelope;

/// SSE transcript reading and answer extraction
mod stream;

/// RAGFlow agent client
mod agent;

/// Elsevier search and full-text retrieval
mod literature;

/// On-disk full-text cache
mod download;

/// RAGFlow dataset sync
mod knowledge_base;

/// Stage orchestration
mod pipeline;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::time::Duration;
use tracing::{error, info};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use crate::agent::{AgentClient, KeywordSource};
use crate::config::Config;
use crate::download::Downloader;
use crate::knowledge_base::{RagflowKnowledgeBase, SyncReport};
use crate::literature::ElsevierClient;
use crate::pipeline::{knowledge_base_name, Outcome, Pipeline};

// =============================================================================
// CLI ARGUMENTS
// =============================================================================
#[derive(Parser, Debug)]
#[command(
    name = "paper-harvest",
    version,
    about = "Build a RAGFlow knowledge base from ScienceDirect papers matching a research question",
    long_about = r#"
paper-harvest asks a RAGFlow agent for search keywords, searches ScienceDirect,
downloads full texts and uploads them into a RAGFlow knowledge base.

Configuration is read from a JSON file (config.json by default). The API keys
may instead come from RAGFLOW_API_KEY / ELSEVIER_API_KEY or a .env file.

EXAMPLES:
  # Whole pipeline
  paper-harvest run "Find papers about transformer models for plasma control"

  # Only ask the agent for keywords
  paper-harvest keywords "LLM template-based code generation"

  # Upload everything already downloaded
  paper-harvest sync --kb-name my_papers_KB
"#
)]
struct Args {
    /// Path to the JSON configuration file
    #[arg(
        short = 'c',
        long = "config",
        env = "PAPER_HARVEST_CONFIG",
        default_value = "config.json",
        global = true
    )]
    config: PathBuf,

    /// Verbose output (debug logging)
    #[arg(short = 'v', long = "verbose", global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the whole pipeline for a research question
    Run {
        #[arg(value_name = "QUERY")]
        query: String,

        /// Knowledge base to sync into (derived from the query when omitted)
        #[arg(long = "kb-name")]
        kb_name: Option<String>,
    },

    /// Ask the agent for keywords only
    Keywords {
        #[arg(value_name = "QUERY")]
        query: String,
    },

    /// Search ScienceDirect with the given keywords
    Search {
        #[arg(value_name = "KEYWORD", required = true)]
        keywords: Vec<String>,
    },

    /// Upload every downloaded JSON file into a knowledge base
    Sync {
        /// Directory to upload from (defaults to download_directory)
        #[arg(short = 'd', long = "dir")]
        dir: Option<PathBuf>,

        #[arg(long = "kb-name")]
        kb_name: String,
    },
}

// =============================================================================
// MAIN FUNCTION
// =============================================================================
#[tokio::main]
async fn main() -> Result<ExitCode> {
    let args = Args::parse();

    init_logging(args.verbose)?;

    let config = Config::load(&args.config)?;
    config.validate()?;

    info!(
        ragflow = %config.ragflow_root(),
        elsevier = %config.elsevier_root(),
        "Configuration loaded"
    );

    let result = match args.command {
        Command::Run { query, kb_name } => run(&config, &query, kb_name).await,
        Command::Keywords { query } => keywords(&config, &query).await,
        Command::Search { keywords } => search(&config, &keywords).await,
        Command::Sync { dir, kb_name } => sync(&config, dir, &kb_name).await,
    };

    match result {
        Ok(code) => Ok(code),
        Err(e) => {
            error!(error = %e, "Run failed");
            eprintln!("\nRun failed: {:#}", e);
            Err(e)
        }
    }
}

// =============================================================================
// COMMANDS
// =============================================================================
async fn run(config: &Config, query: &str, kb_name: Option<String>) -> Result<ExitCode> {
    let query = non_empty_query(query)?;
    config.prepare_download_dir()?;

    let kb_name = kb_name.unwrap_or_else(|| knowledge_base_name(query));
    let elsevier = ElsevierClient::new(config)?;
    let pipeline = Pipeline::new(
        AgentClient::new(config)?,
        elsevier.clone(),
        Downloader::new(
            elsevier,
            config.download_directory.clone(),
            Duration::from_millis(config.download_delay_ms),
        ),
        RagflowKnowledgeBase::new(config)?,
    );

    match pipeline.run(query, &kb_name).await? {
        Outcome::Completed(summary) => {
            print_banner("PIPELINE RESULTS");
            println!("Keywords: {}", summary.keywords.join(", "));
            println!("Downloaded files: {}", summary.downloaded.len());
            print_sync_report(&summary.sync);
            println!(
                "\nCheck the RAGFlow UI for the knowledge base '{}'.",
                summary.kb_name
            );
            Ok(ExitCode::SUCCESS)
        }
        Outcome::Halted(reason) => {
            eprintln!("\nWorkflow halted: {}", reason);
            Ok(ExitCode::FAILURE)
        }
    }
}

async fn keywords(config: &Config, query: &str) -> Result<ExitCode> {
    let query = non_empty_query(query)?;
    let agent = AgentClient::new(config)?;

    match agent.keywords(query).await? {
        Some(keywords) if !keywords.is_empty() => {
            for keyword in keywords {
                println!("{}", keyword);
            }
            Ok(ExitCode::SUCCESS)
        }
        _ => {
            eprintln!("No keywords extracted");
            Ok(ExitCode::FAILURE)
        }
    }
}

async fn search(config: &Config, keywords: &[String]) -> Result<ExitCode> {
    let client = ElsevierClient::new(config)?;
    let records = client.search_papers(keywords).await?;

    if records.is_empty() {
        eprintln!("No papers found");
        return Ok(ExitCode::FAILURE);
    }

    for (i, record) in records.iter().enumerate() {
        println!(
            "{}. {}\n   DOI: {}",
            i + 1,
            record.display_title(),
            record.doi.as_deref().unwrap_or("-")
        );
    }
    Ok(ExitCode::SUCCESS)
}

async fn sync(config: &Config, dir: Option<PathBuf>, kb_name: &str) -> Result<ExitCode> {
    let dir = dir.unwrap_or_else(|| config.download_directory.clone());
    let files = json_files(&dir)?;

    if files.is_empty() {
        eprintln!("No .json files found in '{}' to upload", dir.display());
        return Ok(ExitCode::FAILURE);
    }

    let kb = RagflowKnowledgeBase::new(config)?;
    let report = kb.sync_files(&files, kb_name).await?;

    print_banner("SYNC RESULTS");
    print_sync_report(&report);
    Ok(ExitCode::SUCCESS)
}

// =============================================================================
// HELPERS
// =============================================================================
fn non_empty_query(query: &str) -> Result<&str> {
    let query = query.trim();
    if query.is_empty() {
        anyhow::bail!("query cannot be empty");
    }
    Ok(query)
}

/// `*.json` files directly inside `dir`, sorted by name.
fn json_files(dir: &Path) -> Result<Vec<PathBuf>> {
    let entries = std::fs::read_dir(dir)
        .with_context(|| format!("failed to read directory {}", dir.display()))?;

    let mut files = Vec::new();
    for entry in entries {
        let path = entry?.path();
        if path.is_file() && path.extension().is_some_and(|ext| ext == "json") {
            files.push(path);
        }
    }
    files.sort();
    Ok(files)
}

fn print_banner(title: &str) {
    println!("\n{}", "=".repeat(60));
    println!("{}", title);
    println!("{}\n", "=".repeat(60));
}

fn print_sync_report(report: &SyncReport) {
    if let Some(dataset) = &report.dataset {
        println!("Knowledge base: {} (ID: {})", dataset.name, dataset.id);
    }
    println!("Documents in knowledge base: {}", report.total_documents);
    for name in &report.uploaded {
        println!("  uploaded: {}", name);
    }
    for name in &report.parsed {
        println!("  parsed:   {}", name);
    }
    for name in &report.failed {
        println!("  FAILED:   {}", name);
    }
}

// =============================================================================
// LOGGING INITIALIZATION
// =============================================================================
/// `RUST_LOG` wins when set; otherwise `info`, or `debug` with `--verbose`.
fn init_logging(verbose: bool) -> Result<()> {
    let default_level = if verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_names(false)
        .with_file(false)
        .with_line_number(false)
        .finish();

    tracing::subscriber::set_global_default(subscriber)
        .map_err(|e| anyhow::anyhow!("Failed to set logging subscriber: {}", e))?;

    Ok(())
}
