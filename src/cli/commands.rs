//! CLI command definitions for lyricforge.
//!
//! Two commands: `run` drives a batch of songs through the queue and stores
//! the fetched lyrics; `stats` inspects the result store.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use serde_json::json;
use tracing::warn;

use crate::audit::AuditLog;
use crate::config::AppConfig;
use crate::fetcher::GeniusClient;
use crate::pool::WorkerPool;
use crate::queue::{Song, TaskHandle, TaskQueue, TaskStore};
use crate::resilience::ResilienceManager;
use crate::storage::LyricsStore;

/// Length of the lyrics excerpt shown by `stats --sample`.
const SAMPLE_EXCERPT_LEN: u32 = 2000;

/// Resilient lyrics fetcher.
#[derive(Parser)]
#[command(name = "lyricforge")]
#[command(about = "Fetch song lyrics through a resilient task queue")]
#[command(version)]
#[command(
    long_about = "lyricforge drives a list of songs through a durable task queue with a bounded\nworker pool, automatic retries and checkpointed progress, and stores the\nfetched lyrics in a local SQLite database.\n\nExample usage:\n  lyricforge run --songs songs.json\n  lyricforge stats --sample"
)]
pub struct Cli {
    /// The subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,

    /// Log level (trace, debug, info, warn, error).
    #[arg(short, long, default_value = "info", global = true)]
    pub log_level: String,
}

/// Available CLI subcommands.
#[derive(clap::Subcommand)]
pub enum Commands {
    /// Fetch lyrics for every song in a JSON file.
    Run(RunArgs),

    /// Show statistics about the stored lyrics.
    Stats(StatsArgs),
}

/// Arguments for `lyricforge run`.
#[derive(Parser, Debug)]
pub struct RunArgs {
    /// JSON file holding an array of {"title": ..., "artist": ...} objects.
    #[arg(short, long)]
    pub songs: PathBuf,

    /// Genius API key.
    #[arg(long, env = "GENIUS_API_KEY", hide_env_values = true)]
    pub api_key: Option<String>,

    /// Worker pool size (overrides LYRICFORGE_WORKER_COUNT).
    #[arg(short = 'w', long)]
    pub workers: Option<usize>,

    /// Data directory (overrides LYRICFORGE_DATA_DIR).
    #[arg(long)]
    pub data_dir: Option<PathBuf>,
}

/// Arguments for `lyricforge stats`.
#[derive(Parser, Debug)]
pub struct StatsArgs {
    /// Data directory (overrides LYRICFORGE_DATA_DIR).
    #[arg(long)]
    pub data_dir: Option<PathBuf>,

    /// Also print a random stored lyrics excerpt.
    #[arg(long)]
    pub sample: bool,
}

/// Parses CLI arguments.
pub fn parse_cli() -> Cli {
    Cli::parse()
}

/// Parses CLI arguments and runs the selected command.
pub async fn run() -> anyhow::Result<()> {
    run_with_cli(parse_cli()).await
}

/// Runs the selected command with already-parsed arguments.
pub async fn run_with_cli(cli: Cli) -> anyhow::Result<()> {
    match cli.command {
        Commands::Run(args) => run_batch(args).await,
        Commands::Stats(args) => show_stats(args).await,
    }
}

/// Builds the pipeline, submits every song, and stores the results.
async fn run_batch(args: RunArgs) -> anyhow::Result<()> {
    let mut config = AppConfig::from_env()?;
    if let Some(dir) = args.data_dir {
        config = config.with_data_dir(dir);
    }
    if let Some(workers) = args.workers {
        config = config.with_worker_count(workers);
    }
    if let Some(key) = args.api_key {
        config = config.with_genius_api_key(key);
    }
    config.validate()?;

    let api_key = config
        .genius_api_key
        .clone()
        .context("a Genius API key is required (set GENIUS_API_KEY or pass --api-key)")?;

    let raw = tokio::fs::read_to_string(&args.songs)
        .await
        .with_context(|| format!("failed to read song list {}", args.songs.display()))?;
    let songs: Vec<Song> = serde_json::from_str(&raw)
        .context("song list must be a JSON array of {\"title\", \"artist\"} objects")?;
    anyhow::ensure!(!songs.is_empty(), "song list is empty");

    tokio::fs::create_dir_all(&config.data_dir).await?;

    let audit = AuditLog::new(config.log_dir());
    audit.initialize().await?;

    let resilience = Arc::new(ResilienceManager::new(
        config.checkpoint_dir(),
        config.checkpoint_interval,
        config.error_threshold,
    ));
    resilience.initialize().await?;

    let fetcher = Arc::new(GeniusClient::new(
        api_key,
        config.rate_limit_requests,
        config.rate_limit_window,
    )?);
    let pool = Arc::new(WorkerPool::new(config.worker_count, fetcher));
    let store = TaskStore::open(&config.task_db_path()).await?;
    let queue = TaskQueue::start(&config, pool, Arc::clone(&resilience), store).await?;

    let audit_handle = audit.spawn_subscriber(queue.subscribe());
    audit
        .append(
            "info",
            "queue system initialized",
            json!({ "workers": config.worker_count, "songs": songs.len() }),
        )
        .await?;

    let lyrics = LyricsStore::open(&config.lyrics_db_path()).await?;

    // A shutdown signal takes the graceful path: checkpoint, bounded drain,
    // forced termination.
    {
        let queue = queue.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("shutdown signal received");
                queue.shutdown().await;
                std::process::exit(0);
            }
        });
    }

    println!("Fetching lyrics for {} songs", songs.len());
    let mut handles = Vec::with_capacity(songs.len());
    for song in songs {
        handles.push(queue.submit(song).await?);
    }

    let results = futures::future::join_all(handles.into_iter().map(TaskHandle::wait)).await;

    let mut completed = 0usize;
    for result in results {
        match result {
            Ok(payload) => {
                lyrics.upsert(&payload).await?;
                completed += 1;
                if completed % 10 == 0 {
                    println!("Progress: {completed} songs processed");
                }
            }
            Err(failure) => eprintln!("{failure}"),
        }
    }

    let stats = resilience.stats();
    println!(
        "Completed {completed} songs ({} unique processed, {} failure events)",
        stats.processed, stats.failed
    );
    match stats.success_rate {
        Some(rate) => println!("Success rate: {rate:.1}%"),
        None => println!("Success rate: n/a"),
    }

    queue.shutdown().await;
    audit_handle.abort();
    lyrics.close().await;
    Ok(())
}

/// Prints result-store statistics.
async fn show_stats(args: StatsArgs) -> anyhow::Result<()> {
    let mut config = AppConfig::from_env()?;
    if let Some(dir) = args.data_dir {
        config = config.with_data_dir(dir);
    }

    let path = config.lyrics_db_path();
    anyhow::ensure!(
        path.exists(),
        "no lyrics database found at {}",
        path.display()
    );

    let store = LyricsStore::open_readonly(&path).await?;

    println!("Database statistics:\n");
    println!("Total songs: {}", store.count().await?);

    let counts = store.count_by_artist().await?;
    if !counts.is_empty() {
        println!("\nSongs per artist:");
        for count in &counts {
            println!("{}: {} songs", count.artist, count.songs);
        }
    }

    if args.sample {
        if let Some(sample) = store.random_sample(SAMPLE_EXCERPT_LEN).await? {
            println!("\nRandom lyrics sample:");
            println!("{} - {}", sample.title, sample.artist);
            println!("{}...", sample.excerpt);
        }
    }

    store.close().await;
    Ok(())
}
