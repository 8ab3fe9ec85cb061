use anyhow::Context;
use clap::{Parser, Subcommand};
use quarry_embed::Embedder;
use quarry_retriever::{
    config::QuarryConfig,
    index::HttpIndexClient,
    retrieval::{
        ingestion::{CancellationFlag, IngestionPipeline, IngestionReport},
        search::{RetrievalPipeline, SearchResponse},
    },
    storage::{DocumentStore, SqliteDocumentStore},
};
use serde::Serialize;
use std::path::PathBuf;
use std::process;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

/// Semantic search over a directory of text documents.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Configuration file (defaults to ./quarry.toml when present)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Vector index service URL, overriding the configuration
    #[arg(long, global = true)]
    index_url: Option<String>,

    /// Document store database, overriding the configuration
    #[arg(long, global = true)]
    database: Option<PathBuf>,

    /// Log debug output (RUST_LOG takes precedence)
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Chunk, embed and index every document under the data directory
    Ingest {
        /// Directory containing the documents
        #[arg(long)]
        data_dir: Option<PathBuf>,
        /// Output format
        #[arg(short, long, default_value = "summary")]
        format: OutputFormat,
    },
    /// Find the chunks most similar to a query
    Search {
        /// Query text
        #[arg(required = true, num_args = 1..)]
        query: Vec<String>,
        /// Number of results
        #[arg(short)]
        k: Option<usize>,
        /// Drop results scoring below this
        #[arg(long)]
        min_similarity: Option<f32>,
        /// Output format
        #[arg(short, long, default_value = "summary")]
        format: OutputFormat,
    },
    /// Check that the index service is reachable
    Health,
    /// Show document store statistics
    Stats {
        /// Output format
        #[arg(short, long, default_value = "summary")]
        format: OutputFormat,
    },
}

#[derive(Debug, Clone, PartialEq)]
enum OutputFormat {
    Summary,
    Json,
}

impl std::str::FromStr for OutputFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "summary" => Ok(OutputFormat::Summary),
            "json" => Ok(OutputFormat::Json),
            _ => Err(format!("Invalid format: {s}")),
        }
    }
}

#[derive(Serialize)]
struct StoreStats {
    database: PathBuf,
    entries: usize,
    embedding_model: Option<String>,
}

#[tokio::main]
async fn main() {
    let args = Args::parse();
    init_tracing(args.verbose);

    match run(args).await {
        Ok(code) => process::exit(code),
        Err(e) => {
            eprintln!("Error: {e:#}");
            process::exit(1);
        }
    }
}

fn init_tracing(verbose: bool) {
    let default_level = if verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn load_config(args: &Args) -> anyhow::Result<QuarryConfig> {
    let mut config = QuarryConfig::load(args.config.as_deref())?;
    if let Some(url) = &args.index_url {
        config.index.url = url.clone();
    }
    if let Some(database) = &args.database {
        config.storage.database = database.clone();
    }
    match &args.command {
        Commands::Ingest {
            data_dir: Some(dir),
            ..
        } => config.ingestion.data_dir = dir.clone(),
        Commands::Search {
            min_similarity: Some(threshold),
            ..
        } => config.search.min_similarity = Some(*threshold),
        _ => {}
    }
    config.validate()?;
    Ok(config)
}

async fn connect_index(config: &QuarryConfig) -> anyhow::Result<HttpIndexClient> {
    let client = HttpIndexClient::new(&config.index.url, config.index_timeout())?;
    client
        .health()
        .await
        .with_context(|| format!("index service at {} is not healthy", client.base_url()))?;
    Ok(client)
}

async fn run(args: Args) -> anyhow::Result<i32> {
    let config = load_config(&args)?;

    match args.command {
        Commands::Ingest { format, .. } => {
            let client = connect_index(&config).await?;
            let embedder = Arc::new(Embedder::from_config(&config.embedding).await?);
            let store = Arc::new(SqliteDocumentStore::open(&config.storage.database).await?);
            let pipeline = IngestionPipeline::new(
                embedder,
                Arc::new(client),
                store,
                config.index_spec(),
                config.ingestion_config(),
            )?;
            pipeline.ensure_index().await?;

            let documents = config.file_source().into_stream()?;
            let cancel = CancellationFlag::new();
            let watcher = {
                let cancel = cancel.clone();
                tokio::spawn(async move {
                    if tokio::signal::ctrl_c().await.is_ok() {
                        tracing::warn!("Interrupted, finishing documents in flight");
                        cancel.cancel();
                    }
                })
            };
            let report = pipeline.ingest(documents, &cancel).await?;
            watcher.abort();

            print_report(&report, &format)?;
            Ok(if report.is_clean() { 0 } else { 1 })
        }
        Commands::Search {
            query, k, format, ..
        } => {
            let query = query.join(" ");
            let k = k.unwrap_or(config.search.default_k);

            let client = connect_index(&config).await?;
            let embedder = Arc::new(Embedder::from_config(&config.embedding).await?);
            let store = Arc::new(SqliteDocumentStore::open(&config.storage.database).await?);
            let mut pipeline =
                RetrievalPipeline::new(embedder, Arc::new(client), store, config.index_spec())?;
            if let Some(threshold) = config.search.min_similarity {
                pipeline = pipeline.with_min_similarity(threshold);
            }

            let response = pipeline.search_with_report(&query, k).await?;
            print_results(&response, &format)?;
            Ok(0)
        }
        Commands::Health => {
            connect_index(&config).await?;
            println!("Index service at {} is healthy", config.index.url);
            Ok(0)
        }
        Commands::Stats { format } => {
            let store = SqliteDocumentStore::open(&config.storage.database).await?;
            let stats = StoreStats {
                database: config.storage.database.clone(),
                entries: store.count().await?,
                embedding_model: store.embedding_model().await?,
            };
            match format {
                OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&stats)?),
                OutputFormat::Summary => {
                    println!("Document Store Statistics:");
                    println!("  Database: {}", stats.database.display());
                    println!("  Entries: {}", stats.entries);
                    println!(
                        "  Embedding model: {}",
                        stats.embedding_model.as_deref().unwrap_or("(none yet)")
                    );
                }
            }
            Ok(0)
        }
    }
}

fn print_report(report: &IngestionReport, format: &OutputFormat) -> anyhow::Result<()> {
    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(report)?),
        OutputFormat::Summary => {
            println!("{}", report.summary());
            for failure in &report.failures {
                println!(
                    "  {} [{}]: {} ({} chunks)",
                    failure.source_id,
                    failure.kind,
                    failure.message,
                    failure.external_ids.len()
                );
            }
        }
    }
    Ok(())
}

fn preview(text: &str, max_chars: usize) -> String {
    let flat: String = text.split_whitespace().collect::<Vec<_>>().join(" ");
    if flat.chars().count() <= max_chars {
        flat
    } else {
        let cut: String = flat.chars().take(max_chars).collect();
        format!("{cut}...")
    }
}

fn print_results(response: &SearchResponse, format: &OutputFormat) -> anyhow::Result<()> {
    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(response)?),
        OutputFormat::Summary => {
            if response.results.is_empty() {
                println!("No matching documents.");
            }
            for result in &response.results {
                println!(
                    "{:>2}. [{:.4}] {} ({}..{})",
                    result.rank, result.score, result.source_id, result.char_start, result.char_end
                );
                println!("    {}", preview(&result.text, 160));
            }
            if response.omitted_inconsistent > 0 {
                println!(
                    "({} results omitted: missing from the document store)",
                    response.omitted_inconsistent
                );
            }
        }
    }
    Ok(())
}
