#![forbid(unsafe_code)]

//! Bulk crawler: reads a dataset of video ids, skips everything the ledger
//! already settled, and fetches video, audio and metadata for the rest.

use anyhow::{Context, Result};
use clap::Parser;
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::warn;
use tracing_subscriber::EnvFilter;
use ytcrawl_tools::config::{LedgerBackend, SettingsOverrides, resolve_settings};
use ytcrawl_tools::dataset::load_dataset;
use ytcrawl_tools::fetcher::{Fetches, YtDlp};
use ytcrawl_tools::ledger::open_ledger;
use ytcrawl_tools::pipeline::{PipelineContext, PipelineKind, WorkerCounts, plan, run_pipeline};
use ytcrawl_tools::progress::{Progress, ProgressWriter};

#[derive(Debug, Parser)]
#[command(
    name = "crawl",
    about = "Download video, audio and metadata for every id in a dataset"
)]
struct CrawlArgs {
    /// JSON array of objects with a `video_id` field.
    #[arg(long)]
    dataset: Option<PathBuf>,
    #[arg(long)]
    download_root: Option<PathBuf>,
    /// `queue` (download stage feeding a post-processing stage) or `pool`.
    #[arg(long, default_value = "queue")]
    pipeline: PipelineKind,
    #[arg(long)]
    download_workers: Option<usize>,
    #[arg(long)]
    post_workers: Option<usize>,
    /// Pool size for `--pipeline pool`.
    #[arg(long)]
    workers: Option<usize>,
    /// Netscape cookie file handed to yt-dlp.
    #[arg(long)]
    cookies: Option<PathBuf>,
    #[arg(long)]
    failed_log: Option<PathBuf>,
    #[arg(long)]
    completed_log: Option<PathBuf>,
    /// `files` or `sqlite`.
    #[arg(long)]
    ledger: Option<LedgerBackend>,
    #[arg(long)]
    ledger_db: Option<PathBuf>,
    #[arg(long)]
    progress_file: Option<PathBuf>,
    #[arg(long)]
    env_file: Option<PathBuf>,
    /// Only report what would be dispatched.
    #[arg(long)]
    dry_run: bool,
}

impl CrawlArgs {
    fn overrides(&self) -> SettingsOverrides {
        SettingsOverrides {
            dataset: self.dataset.clone(),
            download_root: self.download_root.clone(),
            failed_log: self.failed_log.clone(),
            completed_log: self.completed_log.clone(),
            cookies: self.cookies.clone(),
            download_workers: self.download_workers,
            post_workers: self.post_workers,
            pool_workers: self.workers,
            ledger: self.ledger,
            ledger_db: self.ledger_db.clone(),
            env_path: self.env_file.clone(),
        }
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

/// Spawns a listener that trips `cancel` on Ctrl-C. In-flight fetches run to
/// completion; nothing new is started.
fn cancel_on_interrupt(cancel: CancellationToken) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received, letting in-flight downloads finish");
            cancel.cancel();
        }
    });
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let args = CrawlArgs::parse();
    let settings = resolve_settings(args.overrides())?;

    println!("===================================");
    println!("Video Dataset Crawler");
    println!("===================================");
    println!("Dataset: {}", settings.dataset.display());
    println!("Download root: {}", settings.download_root.display());
    match settings.ledger {
        LedgerBackend::Files => {
            println!("Completed log: {}", settings.completed_log.display());
            println!("Failed log: {}", settings.failed_log.display());
        }
        LedgerBackend::Sqlite => println!("Ledger DB: {}", settings.ledger_db.display()),
    }
    println!();

    let ids = load_dataset(&settings.dataset)?;
    let ledger = open_ledger(&settings).await?;
    let crawl_plan = plan(ledger.as_ref(), &ids).await?;

    println!("Dataset entries: {}", crawl_plan.total);
    println!("Already completed: {}", crawl_plan.already_completed);
    println!("Previously failed: {}", crawl_plan.already_failed);
    println!("Pending: {}", crawl_plan.pending.len());
    println!();

    if args.dry_run {
        return Ok(());
    }
    if crawl_plan.pending.is_empty() {
        println!("Nothing to do.");
        return Ok(());
    }

    let ytdlp = YtDlp::new(
        settings.ytdlp_bin.clone(),
        settings.cookies.clone(),
        settings.concurrent_fragments,
    );
    ytdlp.ensure_available().await?;
    if let Some(cookies) = &settings.cookies
        && !cookies.exists()
    {
        warn!(path = %cookies.display(), "cookie file not found, continuing without it");
    }

    fs::create_dir_all(&settings.download_root)
        .with_context(|| format!("creating {}", settings.download_root.display()))?;

    let progress = Arc::new(Progress::new(
        crawl_plan.pending.len(),
        args.progress_file.clone().map(ProgressWriter::new),
    ));
    progress.start();

    let cancel = CancellationToken::new();
    cancel_on_interrupt(cancel.clone());

    let ctx = PipelineContext {
        fetches: Fetches::new(Arc::new(ytdlp), settings.download_root.clone()),
        ledger,
        progress: Arc::clone(&progress),
        cancel,
    };
    let workers = WorkerCounts {
        download: settings.download_workers,
        post: settings.post_workers,
        pool: settings.pool_workers,
    };

    let summary = run_pipeline(args.pipeline, &ctx, crawl_plan.pending, workers).await;

    let finished = if summary.cancelled > 0 {
        "Crawl interrupted"
    } else {
        "Crawl complete"
    };
    progress.finish(finished);

    println!();
    println!("===================================");
    println!("{finished}!");
    println!("===================================");
    println!("Dispatched: {}", summary.dispatched);
    println!("Completed: {}", summary.completed);
    println!("Failed: {}", summary.failed);
    if summary.unrecorded > 0 {
        println!("Not recorded (ledger errors): {}", summary.unrecorded);
    }
    if summary.cancelled > 0 {
        println!("Left for the next run: {}", summary.cancelled);
    }

    Ok(())
}
