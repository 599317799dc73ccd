use clap::{Parser, Subcommand};
use magpie_index::{
    config::IngestConfig,
    embed::NoEmbeddingProvider,
    scanner::ChangeDetector,
    service::{IngestService, ProcessingHandle},
    store::JobStore,
};
use magpie_parse::HttpParseProvider;
use std::path::PathBuf;
use std::process;
use std::sync::Arc;
use std::time::Duration;

/// Inspect and drive the magpie document ingestion store.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Base directory containing the .magpie.db database file
    #[arg(short, long, default_value = ".")]
    base_dir: PathBuf,

    /// Optional TOML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Scan a directory and report new / modified / removed documents
    Scan {
        /// Directory to scan
        dir: PathBuf,
        /// Knowledge base code
        #[arg(short, long, default_value = "default")]
        kb: String,
    },
    /// Submit files for processing and wait for terminal states
    Process {
        /// Files to process
        paths: Vec<PathBuf>,
        /// Knowledge base code
        #[arg(short, long, default_value = "default")]
        kb: String,
        /// Per-file timeout in seconds
        #[arg(short, long, default_value_t = 600)]
        timeout: u64,
    },
    /// Show processing state for a document path
    Status {
        /// Document path as it was submitted
        path: String,
        /// Knowledge base code
        #[arg(short, long, default_value = "default")]
        kb: String,
    },
    /// Query stored chunks (lexical ranking unless an embedder is wired)
    Query {
        /// Query text
        text: String,
        /// Number of results
        #[arg(short, long, default_value_t = 5)]
        k: usize,
        /// Knowledge base code scope
        #[arg(long)]
        kb: Option<String>,
    },
    /// Remove documents and their chunks
    Remove {
        /// Document paths to remove
        paths: Vec<PathBuf>,
        /// Knowledge base code
        #[arg(short, long, default_value = "default")]
        kb: String,
    },
    /// Show store statistics
    Stats,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .init();

    if let Err(e) = run().await {
        eprintln!("Error: {e:#}");
        process::exit(1);
    }
}

async fn run() -> anyhow::Result<()> {
    let args = Args::parse();

    let config = match &args.config {
        Some(path) => {
            let text = tokio::fs::read_to_string(path).await?;
            IngestConfig::from_toml_str(&text)?
        }
        None => IngestConfig::default().with_result_dir(args.base_dir.join("parsed_results")),
    };

    let store = JobStore::open(&args.base_dir).await?;

    match args.command {
        Commands::Scan { dir, kb } => {
            let detector = ChangeDetector::new(dir, kb);
            let outcome = detector.scan(&store).await?;
            println!(
                "new: {}  modified: {}  removed: {}  unchanged: {}",
                outcome.new.len(),
                outcome.modified.len(),
                outcome.removed.len(),
                outcome.unchanged
            );
            for file in &outcome.new {
                println!("  + {}", file.relative_path);
            }
            for file in &outcome.modified {
                println!("  ~ {}", file.relative_path);
            }
            for doc in &outcome.removed {
                println!("  - {}", doc.path);
            }
        }
        Commands::Process { paths, kb, timeout } => {
            let service = build_service(store, &config).await?;
            let (scheduler, shutdown) = service.spawn_scheduler();

            let handle = service
                .request_processing(paths, &kb, Duration::from_secs(timeout))
                .await?;
            println!("handle: {}", handle.0);
            wait_for_request(&service, &handle).await;

            let _ = shutdown.send(());
            let _ = scheduler.await;
        }
        Commands::Status { path, kb } => {
            match store.document_state(&path, &kb).await? {
                None => println!("not tracked: {path}"),
                Some((document, batch, job)) => {
                    println!("document: {} [{}]", document.path, document.status.as_str());
                    if let Some(batch) = batch {
                        println!(
                            "batch:    {} [{}]{}",
                            batch.provider_batch_id,
                            batch.status.as_str(),
                            batch
                                .error
                                .map(|e| format!(" error: {e}"))
                                .unwrap_or_default()
                        );
                    }
                    if let Some(job) = job {
                        println!(
                            "job:      attempt {}/{} [{}] next_run {}",
                            job.attempt,
                            job.max_attempts,
                            job.status.as_str(),
                            job.next_run
                        );
                    }
                }
            }
        }
        Commands::Query { text, k, kb } => {
            let service = build_service(store, &config).await?;
            let hits = service.query(&text, k, kb.as_deref()).await?;
            if hits.is_empty() {
                println!("no results");
            }
            for (i, hit) in hits.iter().enumerate() {
                println!(
                    "{}. [{}] {} (score {:.6})",
                    i + 1,
                    hit.chunk_id,
                    hit.document_path,
                    hit.score
                );
                let preview: String = hit.content.chars().take(160).collect();
                println!("   {}", preview.replace('\n', " "));
            }
        }
        Commands::Remove { paths, kb } => {
            let service = build_service(store, &config).await?;
            for result in service.remove_documents(&paths, &kb).await? {
                match result.error {
                    None => println!(
                        "removed {} ({} chunks)",
                        result.path, result.chunks_deleted
                    ),
                    Some(e) => println!("failed {}: {e}", result.path),
                }
            }
        }
        Commands::Stats => {
            let stats = store.stats().await?;
            println!("{}", serde_json::to_string_pretty(&stats)?);
        }
    }

    Ok(())
}

async fn build_service(store: JobStore, config: &IngestConfig) -> anyhow::Result<IngestService> {
    let provider = Arc::new(HttpParseProvider::new(config.parser.clone())?);
    // The CLI runs without an embedding service; ingestion stores chunks
    // lexically and queries degrade to keyword ranking.
    IngestService::new(store, provider, Arc::new(NoEmbeddingProvider), config.clone()).await
}

async fn wait_for_request(service: &IngestService, handle: &ProcessingHandle) {
    loop {
        tokio::time::sleep(Duration::from_secs(1)).await;
        let Some(progress) = service.get_status(handle).await else {
            return;
        };
        if progress.in_progress == 0 {
            println!(
                "done: {} completed, {} failed of {}",
                progress.completed, progress.failed, progress.total
            );
            for file in progress.files {
                if let Some(error) = file.error {
                    println!("  {} failed: {error}", file.path);
                }
            }
            return;
        }
    }
}
