//! # Quarry CLI (`quarry`)
//!
//! The `quarry` binary is the interface to a Quarry knowledge base. It
//! provides commands for database initialization, crawling and
//! uploading sources, searching, and corpus management.
//!
//! ## Usage
//!
//! ```bash
//! quarry --config ./quarry.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `quarry init` | Create the SQLite database and run schema migrations |
//! | `quarry crawl <url>` | Crawl a site, sitemap, or text file and index it |
//! | `quarry upload <path>` | Ingest a local markdown, text, PDF, or DOCX file |
//! | `quarry search "<query>"` | Search indexed content |
//! | `quarry sources` | List indexed sources and their status |
//! | `quarry delete <source_id>` | Delete a source and everything it owns |
//! | `quarry stats` | Show corpus totals and per-source breakdown |
//!
//! ## Examples
//!
//! ```bash
//! # Initialize the database
//! quarry init --config ./quarry.toml
//!
//! # Crawl documentation two levels deep
//! quarry crawl https://docs.example.com --depth 2
//!
//! # Expand a sitemap and fetch every page
//! quarry crawl https://docs.example.com/sitemap.xml
//!
//! # Ingest a local file with classification
//! quarry upload ./rfc.pdf --knowledge-type technical --tags rfc,networking
//!
//! # Search, restricted to one source
//! quarry search "connection pooling" --source https://docs.example.com
//!
//! # Search stored code examples (requires the agentic RAG flag)
//! quarry search "spawn a task" --code
//! ```

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use quarry::config::{self, Config};
use quarry::db;
use quarry::embedding::EmbeddingClient;
use quarry::ingest::{self, CrawlRequest, IngestReport, UploadRequest};
use quarry::migrate;
use quarry::models::SearchResult;
use quarry::progress::ProgressMode;
use quarry::registry::SourceRegistry;
use quarry::reranker::create_reranker;
use quarry::search::{SearchEngine, SearchOptions};
use quarry::stats;
use quarry::store::sqlite::SqliteStore;
use quarry::store::{SearchFilter, VectorStore};

/// Quarry — a web-crawling knowledge engine with hybrid retrieval.
///
/// All commands accept a `--config` flag pointing to a TOML
/// configuration file. See `quarry.example.toml` for a full example.
#[derive(Parser)]
#[command(
    name = "quarry",
    about = "Quarry — a web-crawling knowledge engine with hybrid retrieval",
    version,
    long_about = "Quarry crawls documentation sites (and ingests local files) into a SQLite \
    knowledge base: pages are fetched in parallel, chunked with code-fence awareness, embedded \
    in batches, and indexed for hybrid vector + keyword search with optional reranking."
)]
struct Cli {
    /// Path to configuration file (TOML).
    ///
    /// Defaults to `./quarry.toml`. Database, crawl, chunking,
    /// embedding, reranker, and feature flag settings are read from
    /// this file.
    #[arg(long, global = true, default_value = "./quarry.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

/// Top-level CLI commands.
#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema.
    ///
    /// Creates the SQLite database file and all required tables
    /// (sources, chunks, code_examples, and their FTS5 mirrors). This
    /// command is idempotent — running it multiple times is safe.
    Init,

    /// Crawl a URL and index its content.
    ///
    /// The fetch strategy depends on the URL: sitemap URLs are expanded
    /// and every page fetched in parallel, `.txt` URLs are ingested
    /// verbatim as a single document, and ordinary pages are crawled
    /// breadth-first following same-host links up to the given depth.
    /// Re-crawling a URL is incremental: unchanged chunks are skipped.
    Crawl {
        /// The URL to crawl. Doubles as the source id.
        url: String,

        /// Link-following depth. 1 fetches only the given page.
        #[arg(long)]
        depth: Option<usize>,

        /// Maximum concurrent page fetches.
        #[arg(long)]
        concurrency: Option<usize>,

        /// Classification label stored on the source (e.g. `technical`).
        #[arg(long = "knowledge-type")]
        knowledge_type: Option<String>,

        /// Comma-separated tags stored on the source.
        #[arg(long, value_delimiter = ',')]
        tags: Vec<String>,

        /// Progress output: auto, off, human, or json.
        #[arg(long, default_value = "auto")]
        progress: String,
    },

    /// Ingest a local file.
    ///
    /// Supported formats: markdown, plain text, PDF, and DOCX, decided
    /// by file extension. The canonical path doubles as the source id.
    Upload {
        /// Path to the file.
        path: PathBuf,

        /// Classification label stored on the source.
        #[arg(long = "knowledge-type")]
        knowledge_type: Option<String>,

        /// Comma-separated tags stored on the source.
        #[arg(long, value_delimiter = ',')]
        tags: Vec<String>,

        /// Progress output: auto, off, human, or json.
        #[arg(long, default_value = "auto")]
        progress: String,
    },

    /// Search indexed content.
    ///
    /// Runs the search the feature flags select: plain vector search by
    /// default, hybrid vector + keyword when `use_hybrid_search` is on,
    /// reranked when `use_reranking` is on. Prints ranked results with
    /// scores and excerpts.
    Search {
        /// The search query string.
        query: String,

        /// Search stored code examples instead of documentation chunks.
        /// Requires the `use_agentic_rag` feature flag.
        #[arg(long)]
        code: bool,

        /// Restrict results to one source id.
        #[arg(long)]
        source: Option<String>,

        /// Maximum number of results to return.
        #[arg(long)]
        limit: Option<usize>,
    },

    /// List indexed sources with status and counts.
    Sources,

    /// Delete a source and everything it owns.
    ///
    /// Removes the source record, its chunks, and its code examples.
    Delete {
        /// Source id (the URL or file path it was ingested under).
        source_id: String,
    },

    /// Show knowledge base statistics.
    Stats,
}

fn parse_progress(value: &str) -> anyhow::Result<ProgressMode> {
    match value {
        "auto" => Ok(ProgressMode::default_for_tty()),
        "off" => Ok(ProgressMode::Off),
        "human" => Ok(ProgressMode::Human),
        "json" => Ok(ProgressMode::Json),
        other => anyhow::bail!("unknown progress mode: {other}. Use auto, off, human, or json."),
    }
}

/// Cancellation token that trips on Ctrl-C, checked between crawl
/// windows so an interrupted run stops cleanly.
fn cancel_on_ctrl_c() -> CancellationToken {
    let cancel = CancellationToken::new();
    let trip = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("interrupt received, finishing current window");
            trip.cancel();
        }
    });
    cancel
}

async fn open_store(cfg: &Config) -> anyhow::Result<Arc<SqliteStore>> {
    let pool = db::connect(cfg).await?;
    Ok(Arc::new(SqliteStore::new(pool)))
}

fn print_report(verb: &str, target: &str, report: &IngestReport) {
    println!("{verb} {target}");
    println!("  pages fetched:  {}", report.pages_fetched);
    if report.pages_failed > 0 {
        println!("  pages failed:   {}", report.pages_failed);
    }
    println!("  chunks stored:  {}", report.chunks_stored);
    println!("  chunks skipped: {}", report.chunks_skipped);
    if report.code_examples_stored > 0 {
        println!("  code examples:  {}", report.code_examples_stored);
    }
    println!("  words:          {}", report.word_count);
    println!("ok");
}

fn print_results(results: &[SearchResult]) {
    if results.is_empty() {
        println!("No results.");
        return;
    }
    for (i, result) in results.iter().enumerate() {
        let score = result.effective_score();
        println!("{}. [{:.3}] {}", i + 1, score, result.metadata.url);
        let excerpt: String = result.content.chars().take(200).collect();
        for line in excerpt.lines().take(3) {
            println!("   {}", line);
        }
        println!();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("quarry=info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let cfg = config::load_config(&cli.config)?;

    match cli.command {
        Commands::Init => {
            migrate::run_migrations(&cfg).await?;
            println!("Database initialized successfully.");
        }
        Commands::Crawl {
            url,
            depth,
            concurrency,
            knowledge_type,
            tags,
            progress,
        } => {
            let mode = parse_progress(&progress)?;
            let reporter = mode.reporter();
            let store = open_store(&cfg).await?;
            let registry = SourceRegistry::new(store.clone());
            let cancel = cancel_on_ctrl_c();

            let request = CrawlRequest {
                url: url.clone(),
                max_depth: depth.unwrap_or(cfg.crawl.max_depth),
                max_concurrent: concurrency.unwrap_or(cfg.crawl.max_concurrent),
                knowledge_type,
                tags,
            };
            let report = ingest::run_crawl(
                &cfg,
                store as Arc<dyn VectorStore>,
                &registry,
                request,
                reporter.as_ref(),
                &cancel,
            )
            .await?;
            print_report("crawl", &url, &report);
        }
        Commands::Upload {
            path,
            knowledge_type,
            tags,
            progress,
        } => {
            let mode = parse_progress(&progress)?;
            let reporter = mode.reporter();
            let store = open_store(&cfg).await?;
            let registry = SourceRegistry::new(store.clone());

            let request = UploadRequest {
                path: path.clone(),
                knowledge_type,
                tags,
            };
            let report = ingest::run_upload(
                &cfg,
                store as Arc<dyn VectorStore>,
                &registry,
                request,
                reporter.as_ref(),
            )
            .await?;
            print_report("upload", &path.display().to_string(), &report);
        }
        Commands::Search {
            query,
            code,
            source,
            limit,
        } => {
            let store = open_store(&cfg).await?;
            let embedder = EmbeddingClient::from_config(&cfg.embedding)?;
            let reranker = create_reranker(&cfg.reranker)?;
            let engine = SearchEngine::new(store as Arc<dyn VectorStore>, embedder, reranker);

            let opts = SearchOptions {
                filter: SearchFilter {
                    source_id: source,
                    ..SearchFilter::default()
                },
                match_count: limit.unwrap_or(cfg.search.match_count),
                vector_weight: cfg.search.vector_weight,
                keyword_weight: cfg.search.keyword_weight,
                code,
            };
            let results = engine.search(&query, &opts, &cfg.flags).await?;
            print_results(&results);
        }
        Commands::Sources => {
            let store = open_store(&cfg).await?;
            let registry = SourceRegistry::new(store);
            let sources = registry.list().await?;
            if sources.is_empty() {
                println!("No sources indexed.");
            } else {
                println!(
                    "{:<44} {:<12} {:>9}   {}",
                    "SOURCE", "STATUS", "WORDS", "TITLE"
                );
                println!("{}", "-".repeat(90));
                for source in sources {
                    println!(
                        "{:<44} {:<12} {:>9}   {}",
                        source.id,
                        source.crawl_status.as_str(),
                        source.word_count,
                        source.title
                    );
                }
            }
        }
        Commands::Delete { source_id } => {
            let store = open_store(&cfg).await?;
            let registry = SourceRegistry::new(store);
            let report = registry.delete(&source_id).await?;
            println!("delete {source_id}");
            println!("  chunks removed:        {}", report.chunks);
            println!("  code examples removed: {}", report.code_examples);
            println!("ok");
        }
        Commands::Stats => {
            stats::run_stats(&cfg).await?;
        }
    }

    Ok(())
}
