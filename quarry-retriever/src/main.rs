use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use quarry_retriever::config::{EngineConfig, SearchStrategy};
use quarry_retriever::engine::{Engine, IndexOptions};
use quarry_retriever::ipc::run_child;
use quarry_retriever::logging::init_tracing;
use quarry_retriever::search::SearchOptions;
use quarry_retriever::supervisor::{RestartStrategy, Supervisor, SupervisorConfig};
use quarry_retriever::sync::SyncOptions;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::process;

/// Index and search the documents in a directory.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Workspace root; the index lives in <root>/.quarry
    #[arg(short, long, default_value = ".", global = true)]
    base_dir: PathBuf,

    /// Config file to use instead of <root>/.quarry/config.toml
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Keyword search only; no embedding model is loaded
    #[arg(long, global = true)]
    no_embeddings: bool,

    /// Skip OCR of images
    #[arg(long, global = true)]
    no_ocr: bool,

    /// Debug logging (RUST_LOG takes precedence)
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Write a default config file
    Init {
        /// Overwrite an existing config
        #[arg(long)]
        force: bool,
    },
    /// Sync with disk and index everything that changed
    Index {
        /// Where the engine runs: in-process or child-process
        #[arg(long, default_value = "in-process")]
        strategy: RestartStrategy,
        /// Documents between engine restarts (0 disables)
        #[arg(long)]
        restart_threshold: Option<u64>,
        /// Resident memory that forces a restart (0 disables)
        #[arg(long)]
        memory_threshold_mb: Option<u64>,
        /// Drain the queue without syncing first
        #[arg(long)]
        no_sync: bool,
        #[arg(short, long, default_value = "text")]
        format: OutputFormat,
    },
    /// Search the index
    Search {
        query: String,
        /// keyword, semantic or hybrid
        #[arg(short, long)]
        strategy: Option<SearchStrategy>,
        #[arg(short, long)]
        limit: Option<usize>,
        /// AND the raw terms instead of parsing web-search syntax
        #[arg(long)]
        raw: bool,
        #[arg(short, long, default_value = "text")]
        format: OutputFormat,
    },
    /// Show index statistics
    Stats {
        #[arg(short, long, default_value = "text")]
        format: OutputFormat,
    },
    /// Show the indexing queue
    Queue {
        #[arg(short, long, default_value = "text")]
        format: OutputFormat,
    },
    /// Reconcile the index with the files on disk
    Sync {
        /// Report changes without queueing or deleting anything
        #[arg(long)]
        dry_run: bool,
        #[arg(short, long, default_value = "text")]
        format: OutputFormat,
    },
    /// Re-index one file now
    Reindex { path: PathBuf },
    /// Index changes as they happen until Ctrl-C
    Watch,
    /// Show OCR job counts and failures
    OcrStatus {
        #[arg(short, long, default_value = "text")]
        format: OutputFormat,
    },
    /// Serve the supervisor protocol on stdin/stdout
    #[command(hide = true)]
    Child,
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum OutputFormat {
    Text,
    Json,
}

impl std::str::FromStr for OutputFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "text" => Ok(OutputFormat::Text),
            "json" => Ok(OutputFormat::Json),
            _ => Err(format!("Invalid format: {s}")),
        }
    }
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[tokio::main]
async fn main() {
    let args = Args::parse();
    init_tracing(args.verbose);
    if let Err(e) = run(args).await {
        eprintln!("Error: {e:#}");
        process::exit(1);
    }
}

async fn load_config(args: &Args) -> Result<EngineConfig> {
    let mut config = match &args.config {
        Some(path) => EngineConfig::load_from(path).await?,
        None => EngineConfig::load(&args.base_dir).await?,
    };
    if args.no_embeddings {
        config = config.with_embeddings_enabled(false);
    }
    if args.no_ocr {
        config = config.with_ocr_enabled(false);
    }
    Ok(config)
}

async fn open_engine(args: &Args) -> Result<Engine> {
    Engine::initialize(&args.base_dir, load_config(args).await?).await
}

async fn run(args: Args) -> Result<()> {
    match &args.command {
        Commands::Child => run_child(tokio::io::stdin(), tokio::io::stdout()).await,
        Commands::Init { force } => init(&args.base_dir, *force).await,
        Commands::Index {
            strategy,
            restart_threshold,
            memory_threshold_mb,
            no_sync,
            format,
        } => {
            let mut supervisor_config = SupervisorConfig::default().with_strategy(*strategy);
            if let Some(documents) = restart_threshold {
                supervisor_config = supervisor_config.with_restart_threshold(*documents);
            }
            if let Some(megabytes) = memory_threshold_mb {
                supervisor_config = supervisor_config.with_memory_threshold_mb(*megabytes);
            }
            if args.verbose {
                supervisor_config.child_args = vec!["--verbose".into(), "child".into()];
            }
            let root = tokio::fs::canonicalize(&args.base_dir)
                .await
                .with_context(|| format!("Workspace root {} is not accessible", args.base_dir.display()))?;
            let config = load_config(&args).await?;
            let mut supervisor = Supervisor::new(root, config, supervisor_config);
            let options = IndexOptions {
                sync: !no_sync,
                ..Default::default()
            };
            let result = supervisor.index_all(&options).await;
            let state = supervisor.state();
            supervisor.stop().await?;
            let summary = result?;
            match format {
                OutputFormat::Json => print_json(&summary),
                OutputFormat::Text => {
                    println!(
                        "Indexed {} files ({} failed) in {} ms",
                        summary.indexed, summary.failed, summary.duration_ms
                    );
                    if state.restart_count > 0 {
                        println!("Engine restarted {} times", state.restart_count);
                    }
                    Ok(())
                }
            }
        }
        Commands::Search {
            query,
            strategy,
            limit,
            raw,
            format,
        } => {
            let engine = open_engine(&args).await?;
            let mut options = SearchOptions::from_config(&engine.config().search);
            if let Some(strategy) = strategy {
                options = options.with_strategy(*strategy);
            }
            if let Some(limit) = limit {
                options = options.with_limit(*limit);
            }
            if *raw {
                options.web_search_syntax = false;
            }
            let response = engine.search(query, &options).await;
            engine.close().await?;
            let response = response?;
            match format {
                OutputFormat::Json => print_json(&response),
                OutputFormat::Text => {
                    println!(
                        "{} results in {} ms ({:?}, query: {})",
                        response.results.len(),
                        response.took_ms,
                        response.strategy,
                        response.fts_query
                    );
                    for (rank, hit) in response.results.iter().enumerate() {
                        let location = match (&hit.section, hit.page) {
                            (Some(section), _) => format!(" § {section}"),
                            (None, Some(page)) => format!(" p.{page}"),
                            (None, None) => String::new(),
                        };
                        println!("{:>3}. [{:.3}] {}{}", rank + 1, hit.score, hit.file_path, location);
                        let preview = hit.snippet.as_deref().unwrap_or(&hit.text);
                        let preview: String = preview.chars().take(200).collect();
                        println!("     {}", preview.replace('\n', " "));
                    }
                    Ok(())
                }
            }
        }
        Commands::Stats { format } => {
            let engine = open_engine(&args).await?;
            let stats = engine.get_stats().await;
            engine.close().await?;
            let stats = stats?;
            match format {
                OutputFormat::Json => print_json(&stats),
                OutputFormat::Text => {
                    println!("Documents: {} ({} indexed)", stats.total_documents, stats.indexed_documents);
                    println!("Chunks: {}", stats.total_chunks);
                    println!("Tags: {}", stats.total_tags);
                    println!("Database size: {} bytes", stats.database_size);
                    Ok(())
                }
            }
        }
        Commands::Queue { format } => {
            let engine = open_engine(&args).await?;
            let queue = engine.get_queue_status().await;
            engine.close().await?;
            let queue = queue?;
            match format {
                OutputFormat::Json => print_json(&queue),
                OutputFormat::Text => {
                    let s = &queue.summary;
                    println!("Pending: {} | Processing: {}", s.pending, s.processing);
                    println!(
                        "High: {} | Normal: {} | Low: {} | OCR deferred: {}",
                        s.high, s.normal, s.low, s.ocr_deferred
                    );
                    for item in &queue.items {
                        let error = item.last_error.as_deref().unwrap_or("");
                        println!(
                            "  [{}] {} ({} attempts) {}",
                            item.priority, item.file_path, item.attempts, error
                        );
                    }
                    Ok(())
                }
            }
        }
        Commands::Sync { dry_run, format } => {
            let engine = open_engine(&args).await?;
            let options = SyncOptions {
                dry_run: *dry_run,
                ..Default::default()
            };
            let report = engine.sync(&options).await;
            engine.close().await?;
            let report = report?;
            match format {
                OutputFormat::Json => print_json(&report),
                OutputFormat::Text => {
                    println!(
                        "Added: {} | Modified: {} | Deleted: {} | Unchanged: {}{}",
                        report.added.len(),
                        report.modified.len(),
                        report.deleted.len(),
                        report.unchanged,
                        if *dry_run { " (dry run)" } else { "" }
                    );
                    Ok(())
                }
            }
        }
        Commands::Reindex { path } => {
            let engine = open_engine(&args).await?;
            let indexed = engine.reindex_file(path).await;
            engine.close().await?;
            if indexed? {
                println!("Re-indexed {}", path.display());
            } else {
                println!("{} is not indexable; removed from the index", path.display());
            }
            Ok(())
        }
        Commands::Watch => watch(&args).await,
        Commands::OcrStatus { format } => {
            let engine = open_engine(&args).await?;
            let report = engine.ocr_status().await;
            engine.close().await?;
            let report = report?;
            match format {
                OutputFormat::Json => print_json(&report),
                OutputFormat::Text => {
                    let s = &report.summary;
                    println!(
                        "OCR {} ({}) | pending {} | processing {} | completed {} | failed {}",
                        if report.enabled { "enabled" } else { "disabled" },
                        report.state,
                        s.pending,
                        s.processing,
                        s.completed,
                        s.failed
                    );
                    for job in &report.failed_jobs {
                        println!(
                            "  job {} {} after {} attempts: {}",
                            job.id,
                            job.file_path,
                            job.attempts,
                            job.last_error.as_deref().unwrap_or("")
                        );
                    }
                    Ok(())
                }
            }
        }
    }
}

async fn init(root: &Path, force: bool) -> Result<()> {
    let path = EngineConfig::config_path(root);
    if tokio::fs::try_exists(&path).await? && !force {
        println!("Config already exists at {}", path.display());
        return Ok(());
    }
    EngineConfig::default().save(&path).await?;
    println!("Wrote default config to {}", path.display());
    Ok(())
}

async fn watch(args: &Args) -> Result<()> {
    let engine = open_engine(args).await?;
    let summary = engine.index_all(&IndexOptions::default()).await?;
    println!("Initial index: {} indexed, {} failed", summary.indexed, summary.failed);
    if let Some(ocr) = engine.ocr() {
        ocr.start().await;
    }

    let watcher = engine.watch()?;
    let flushed = watcher.flushed();
    println!("Watching {} (Ctrl-C to stop)", engine.root().display());
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            _ = flushed.notified() => {
                loop {
                    let report = engine.process_batch().await?;
                    if report.is_empty() {
                        break;
                    }
                    println!("Indexed {} files ({} failed)", report.indexed, report.failed);
                }
            }
        }
    }
    watcher.stop().await;
    engine.close().await
}
