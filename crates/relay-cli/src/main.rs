//! Relay CLI - agent dispatch and hybrid retrieval
//!
//! Usage:
//!   relay init                      Write a default relay.toml
//!   relay validate                  Check a configuration file
//!   relay serve                     Run the HTTP server and health loop
//!   relay dispatch <task.json>      Dispatch one task against configured agents
//!   relay retrieve --corpus <file>  Query a JSONL corpus offline

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use relay_agent::HttpTransport;
use relay_core::{Document, MetadataFilter, RelayConfig, RetrievalQuery, TaskRequest};
use relay_retrieval::HybridRetriever;
use relay_server::AppState;
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser)]
#[command(name = "relay")]
#[command(author, version, about = "Agent dispatch and hybrid retrieval core")]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Configuration file
    #[arg(short, long, global = true, default_value = "relay.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a default configuration file
    Init {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },

    /// Load and validate the configuration
    Validate,

    /// Run the HTTP server
    Serve {
        /// Override `server.bind`
        #[arg(long)]
        bind: Option<String>,

        /// JSONL file of documents to index before serving
        #[arg(long, value_name = "FILE")]
        corpus: Option<PathBuf>,
    },

    /// Dispatch a single task read from a JSON file
    Dispatch {
        /// TaskRequest JSON; `request_id` is generated when missing
        file: PathBuf,

        /// Print the fallback chain instead of calling agents
        #[arg(long)]
        dry_run: bool,

        /// JSONL corpus for task types that need retrieval context
        #[arg(long, value_name = "FILE")]
        corpus: Option<PathBuf>,
    },

    /// Query a JSONL corpus without a server
    Retrieve {
        /// JSONL file, one document per line
        #[arg(long, value_name = "FILE")]
        corpus: PathBuf,

        /// Query text
        #[arg(short, long)]
        text: Option<String>,

        /// Comma-separated query embedding
        #[arg(short, long)]
        embedding: Option<String>,

        /// Number of results
        #[arg(short = 'k', long)]
        top_k: Option<usize>,

        /// Metadata equality filter, `key=value` (repeatable)
        #[arg(short, long = "filter", value_name = "KEY=VALUE")]
        filters: Vec<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(filter)
        .init();

    match cli.command {
        Commands::Init { force } => cmd_init(&cli.config, force),
        Commands::Validate => cmd_validate(&cli.config),
        Commands::Serve { bind, corpus } => cmd_serve(&cli.config, bind, corpus).await,
        Commands::Dispatch {
            file,
            dry_run,
            corpus,
        } => cmd_dispatch(&cli.config, &file, dry_run, corpus).await,
        Commands::Retrieve {
            corpus,
            text,
            embedding,
            top_k,
            filters,
        } => cmd_retrieve(&cli.config, &corpus, text, embedding, top_k, &filters),
    }
}

fn load_config(path: &Path) -> Result<RelayConfig> {
    RelayConfig::load_or_default(path)
        .with_context(|| format!("Failed to load configuration from {}", path.display()))
}

fn cmd_init(path: &Path, force: bool) -> Result<()> {
    if path.exists() && !force {
        bail!("{} already exists (use --force to overwrite)", path.display());
    }
    RelayConfig::write_default(path)?;
    println!("Wrote default configuration to {}", path.display());
    Ok(())
}

fn cmd_validate(path: &Path) -> Result<()> {
    if !path.exists() {
        bail!("{} not found (run 'relay init' first)", path.display());
    }
    let config = RelayConfig::load(path)
        .with_context(|| format!("{} is invalid", path.display()))?;

    println!("{} is valid", path.display());
    println!("  Agents:     {}", config.agents.len());
    for agent in &config.agents {
        println!(
            "    {} (tier {}, up to {}) -> {}",
            agent.id,
            agent.tier,
            agent.max_risk_tier,
            agent.capabilities.join(", ")
        );
    }
    println!("  Task types: {}", config.task_types.len());
    println!("  Bind:       {}", config.server.bind);
    Ok(())
}

async fn cmd_serve(path: &Path, bind: Option<String>, corpus: Option<PathBuf>) -> Result<()> {
    let config = load_config(path)?;
    let addr = bind.unwrap_or_else(|| config.server.bind.clone());
    let health = config.health.clone();

    if config.agents.is_empty() {
        warn!("No agents configured; every dispatch will fail");
    }

    let state = AppState::from_config(config, Arc::new(HttpTransport::new()))?;
    if let Some(corpus) = corpus {
        let count = load_corpus(&corpus, &state.retriever)?;
        info!("Indexed {} documents from {}", count, corpus.display());
    }

    let state = state.shared();
    let _health_loop = health
        .enabled
        .then(|| state.health.clone().spawn(Duration::from_secs(health.interval_secs.max(1))));

    relay_server::serve(state, &addr).await
}

async fn cmd_dispatch(
    path: &Path,
    file: &Path,
    dry_run: bool,
    corpus: Option<PathBuf>,
) -> Result<()> {
    let config = load_config(path)?;
    let raw = std::fs::read_to_string(file)
        .with_context(|| format!("Failed to read {}", file.display()))?;
    let request = parse_task(&raw)?;

    let state = AppState::from_config(config, Arc::new(HttpTransport::new()))?;
    if let Some(corpus) = corpus {
        load_corpus(&corpus, &state.retriever)?;
    }

    if dry_run {
        let plan = state.dispatcher.plan(&request).await?;
        println!("{}", serde_json::to_string_pretty(&plan)?);
        return Ok(());
    }

    let outcome = state.dispatcher.dispatch(request).await;
    println!("{}", serde_json::to_string_pretty(&outcome)?);
    if !outcome.is_success() {
        bail!("dispatch failed");
    }
    Ok(())
}

fn cmd_retrieve(
    path: &Path,
    corpus: &Path,
    text: Option<String>,
    embedding: Option<String>,
    top_k: Option<usize>,
    filters: &[String],
) -> Result<()> {
    let config = load_config(path)?;
    let retriever = HybridRetriever::new(&config.retrieval);
    load_corpus(corpus, &retriever)?;

    let query = RetrievalQuery {
        text,
        embedding: embedding.as_deref().map(parse_embedding).transpose()?,
        top_k,
        filters: filters
            .iter()
            .map(|f| parse_filter(f))
            .collect::<Result<Vec<_>>>()?,
    };

    let (results, documents) = retriever.retrieve_context(&query)?;
    if results.is_empty() {
        println!("No matching documents");
        return Ok(());
    }
    for (result, document) in results.iter().zip(&documents) {
        println!(
            "{:>2}. {}  fused={:.4} lexical={} semantic={}",
            result.rank,
            result.doc_id,
            result.fused_score,
            fmt_score(result.lexical_score),
            fmt_score(result.semantic_score),
        );
        println!("    {}", preview(&document.content, 80));
    }
    Ok(())
}

/// Parse a TaskRequest, generating a request id when the file has none
fn parse_task(raw: &str) -> Result<TaskRequest> {
    let mut value: Value = serde_json::from_str(raw).context("Task file is not valid JSON")?;
    let object = value
        .as_object_mut()
        .context("Task file must contain a JSON object")?;
    if !object.contains_key("request_id") {
        object.insert(
            "request_id".to_string(),
            Value::String(uuid::Uuid::new_v4().to_string()),
        );
    }
    serde_json::from_value(value).context("Task file is not a valid TaskRequest")
}

/// Index every document of a JSONL file, skipping blank lines
fn load_corpus(path: &Path, retriever: &HybridRetriever) -> Result<usize> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read corpus {}", path.display()))?;

    let mut count = 0;
    for (line_no, line) in content.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        let document: Document = serde_json::from_str(line)
            .with_context(|| format!("{}:{}: invalid document", path.display(), line_no + 1))?;
        retriever
            .index(document)
            .with_context(|| format!("{}:{}: rejected", path.display(), line_no + 1))?;
        count += 1;
    }
    Ok(count)
}

fn parse_embedding(raw: &str) -> Result<Vec<f32>> {
    raw.split(',')
        .map(|part| {
            part.trim()
                .parse::<f32>()
                .with_context(|| format!("Invalid embedding component '{}'", part.trim()))
        })
        .collect()
}

/// `key=value`; the value is read as JSON when it parses, else as a string
fn parse_filter(raw: &str) -> Result<MetadataFilter> {
    let Some((key, value)) = raw.split_once('=') else {
        bail!("Filter '{}' must look like key=value", raw);
    };
    let value = serde_json::from_str(value).unwrap_or_else(|_| Value::String(value.to_string()));
    Ok(MetadataFilter::eq(key.trim(), value))
}

fn fmt_score(score: Option<f64>) -> String {
    score.map_or_else(|| "-".to_string(), |s| format!("{:.4}", s))
}

fn preview(content: &str, max_chars: usize) -> String {
    if content.chars().count() <= max_chars {
        return content.to_string();
    }
    let cut: String = content.chars().take(max_chars).collect();
    format!("{}...", cut)
}
