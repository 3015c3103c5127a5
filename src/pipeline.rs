//! Worker coordination for a crawl run.
//!
//! Two shapes share the same fetch operations and ledger:
//!
//! * **queue**: download workers pull identifiers from a shared queue and
//!   fetch the video. Successful ids move to a second queue drained by a
//!   smaller group of post-processing workers that fetch audio and metadata
//!   and record the final outcome.
//! * **pool**: a flat pool where each unit of work runs all three fetches for
//!   one identifier and records the outcome.
//!
//! Shutdown happens by closing channels once all work is enqueued. A
//! cancellation token stops workers from taking new identifiers; whatever is
//! still queued stays unrecorded and is picked up by the next run.

use anyhow::{Result, bail};
use futures::StreamExt;
use std::str::FromStr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::fetcher::{FetchOutcome, Fetches};
use crate::ledger::{Ledger, pending_ids};
use crate::progress::Progress;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum PipelineKind {
    #[default]
    Queue,
    Pool,
}

impl FromStr for PipelineKind {
    type Err = anyhow::Error;

    fn from_str(value: &str) -> Result<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "queue" => Ok(PipelineKind::Queue),
            "pool" | "pool-map" => Ok(PipelineKind::Pool),
            _ => bail!("unknown pipeline: {value}"),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct WorkerCounts {
    pub download: usize,
    pub post: usize,
    pub pool: usize,
}

/// Everything a worker needs. Cheap to clone.
#[derive(Clone)]
pub struct PipelineContext {
    pub fetches: Fetches,
    pub ledger: Arc<dyn Ledger>,
    pub progress: Arc<Progress>,
    pub cancel: CancellationToken,
}

/// The dataset split against the ledger, computed once at start-up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CrawlPlan {
    pub total: usize,
    pub already_completed: usize,
    pub already_failed: usize,
    pub pending: Vec<String>,
}

pub async fn plan(ledger: &dyn Ledger, ids: &[String]) -> Result<CrawlPlan> {
    let snapshot = ledger.snapshot().await?;
    let already_completed = ids
        .iter()
        .filter(|id| snapshot.completed.contains(id.as_str()))
        .count();
    let already_failed = ids
        .iter()
        .filter(|id| {
            snapshot.failed.contains(id.as_str()) && !snapshot.completed.contains(id.as_str())
        })
        .count();
    Ok(CrawlPlan {
        total: ids.len(),
        already_completed,
        already_failed,
        pending: pending_ids(ids, &snapshot),
    })
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunSummary {
    pub dispatched: usize,
    pub completed: usize,
    pub failed: usize,
    /// Finished identifiers whose ledger write failed.
    pub unrecorded: usize,
    /// Dispatched identifiers left unprocessed because the run was cancelled.
    pub cancelled: usize,
}

#[derive(Default)]
struct Tally {
    completed: AtomicUsize,
    failed: AtomicUsize,
    unrecorded: AtomicUsize,
}

impl Tally {
    fn summary(&self, dispatched: usize) -> RunSummary {
        let completed = self.completed.load(Ordering::Relaxed);
        let failed = self.failed.load(Ordering::Relaxed);
        let unrecorded = self.unrecorded.load(Ordering::Relaxed);
        RunSummary {
            dispatched,
            completed,
            failed,
            unrecorded,
            cancelled: dispatched.saturating_sub(completed + failed + unrecorded),
        }
    }
}

pub async fn run_pipeline(
    kind: PipelineKind,
    ctx: &PipelineContext,
    ids: Vec<String>,
    workers: WorkerCounts,
) -> RunSummary {
    match kind {
        PipelineKind::Queue => run_queue_pipeline(ctx, ids, workers.download, workers.post).await,
        PipelineKind::Pool => run_pool_pipeline(ctx, ids, workers.pool).await,
    }
}

/// Records exactly one ledger entry for `video_id`: completed iff all three
/// artifacts exist, failed otherwise. A failure seen after cancellation stays
/// unrecorded so the next run picks the identifier up again.
async fn settle(ctx: &PipelineContext, tally: &Tally, video_id: &str, failure: Option<String>) {
    let artifacts = ctx.fetches.artifacts(video_id);
    let missing = artifacts.missing();

    let (result, counter) = if missing.is_empty() {
        (ctx.ledger.record_completed(video_id).await, &tally.completed)
    } else if ctx.cancel.is_cancelled() {
        info!(video_id, "run cancelled, leaving for the next run");
        return;
    } else {
        let message = failure.unwrap_or_else(|| {
            let labels: Vec<&str> = missing.iter().map(|kind| kind.label()).collect();
            format!("missing after fetch: {}", labels.join(", "))
        });
        warn!(video_id, %message, "recording failure");
        (
            ctx.ledger.record_failed(video_id, Some(&message)).await,
            &tally.failed,
        )
    };

    match result {
        Ok(()) => {
            counter.fetch_add(1, Ordering::Relaxed);
        }
        Err(err) => {
            tally.unrecorded.fetch_add(1, Ordering::Relaxed);
            error!(video_id, error = %format!("{err:#}"), "could not update ledger");
        }
    }
    ctx.progress.advance(video_id).await;
}

fn first_failure(outcomes: &[FetchOutcome]) -> Option<String> {
    outcomes
        .iter()
        .find_map(|outcome| outcome.failure().map(str::to_owned))
}

/// Pulls the next identifier unless the run was cancelled. Returns `None`
/// once the channel is closed and drained.
async fn next_id(
    queue: &Mutex<mpsc::UnboundedReceiver<String>>,
    cancel: &CancellationToken,
) -> Option<String> {
    let mut receiver = queue.lock().await;
    tokio::select! {
        biased;
        _ = cancel.cancelled() => None,
        id = receiver.recv() => id,
    }
}

pub async fn run_queue_pipeline(
    ctx: &PipelineContext,
    ids: Vec<String>,
    download_workers: usize,
    post_workers: usize,
) -> RunSummary {
    let dispatched = ids.len();
    let tally = Arc::new(Tally::default());
    let (id_tx, id_rx) = mpsc::unbounded_channel::<String>();
    let (done_tx, done_rx) = mpsc::unbounded_channel::<String>();
    let id_rx = Arc::new(Mutex::new(id_rx));
    let done_rx = Arc::new(Mutex::new(done_rx));

    let downloaders: Vec<JoinHandle<()>> = (0..download_workers.max(1))
        .map(|worker| {
            let ctx = ctx.clone();
            let tally = Arc::clone(&tally);
            let queue = Arc::clone(&id_rx);
            let forward = done_tx.clone();
            tokio::spawn(async move {
                while let Some(video_id) = next_id(&queue, &ctx.cancel).await {
                    info!(worker, video_id = %video_id, "downloading video");
                    let outcome = ctx.fetches.fetch_video(&video_id).await;
                    match outcome {
                        FetchOutcome::Failed(message) => {
                            settle(&ctx, &tally, &video_id, Some(message)).await;
                        }
                        FetchOutcome::Existing(_) | FetchOutcome::Fetched(_) => {
                            if let Err(err) = forward.send(video_id) {
                                error!(video_id = %err.0, "post-processing queue closed early");
                            }
                        }
                    }
                }
            })
        })
        .collect();
    // Workers hold the only remaining senders; the queue closes when they exit.
    drop(done_tx);

    let postprocessors: Vec<JoinHandle<()>> = (0..post_workers.max(1))
        .map(|worker| {
            let ctx = ctx.clone();
            let tally = Arc::clone(&tally);
            let queue = Arc::clone(&done_rx);
            tokio::spawn(async move {
                while let Some(video_id) = next_id(&queue, &ctx.cancel).await {
                    info!(worker, video_id = %video_id, "fetching audio and metadata");
                    let audio = ctx.fetches.fetch_audio(&video_id).await;
                    let metadata = ctx.fetches.fetch_metadata(&video_id).await;
                    settle(&ctx, &tally, &video_id, first_failure(&[audio, metadata])).await;
                }
            })
        })
        .collect();

    for video_id in ids {
        if id_tx.send(video_id).is_err() {
            break;
        }
    }
    drop(id_tx);

    join_group("download", downloaders).await;
    join_group("post-processing", postprocessors).await;

    tally.summary(dispatched)
}

pub async fn run_pool_pipeline(
    ctx: &PipelineContext,
    ids: Vec<String>,
    workers: usize,
) -> RunSummary {
    let dispatched = ids.len();
    let tally = Tally::default();

    futures::stream::iter(ids)
        .take_until(ctx.cancel.cancelled())
        .for_each_concurrent(workers.max(1), |video_id| {
            let tally = &tally;
            async move {
                info!(video_id = %video_id, "fetching artifacts");
                let video = ctx.fetches.fetch_video(&video_id).await;
                let audio = ctx.fetches.fetch_audio(&video_id).await;
                let metadata = ctx.fetches.fetch_metadata(&video_id).await;
                settle(ctx, tally, &video_id, first_failure(&[video, audio, metadata])).await;
            }
        })
        .await;

    tally.summary(dispatched)
}

async fn join_group(label: &str, handles: Vec<JoinHandle<()>>) {
    for handle in handles {
        if let Err(err) = handle.await {
            error!(group = label, error = %err, "worker task panicked");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::artifacts::{ArtifactKind, ArtifactSet};
    use crate::fetcher::Fetcher;
    use crate::fetcher::stub::StubFetcher;
    use crate::ledger::{FileLedger, LedgerSnapshot};
    use crate::ledger_db::SqliteLedger;
    use async_trait::async_trait;
    use std::collections::HashSet;
    use std::fs;
    use std::path::Path;
    use tempfile::{TempDir, tempdir};

    const WORKERS: WorkerCounts = WorkerCounts {
        download: 4,
        post: 2,
        pool: 3,
    };

    struct Harness {
        dir: TempDir,
        ledger: Arc<FileLedger>,
    }

    impl Harness {
        fn new() -> Self {
            let dir = tempdir().unwrap();
            let ledger = Arc::new(FileLedger::new(
                dir.path().join("complete_folders.txt"),
                dir.path().join("failed_ids.txt"),
            ));
            Self { dir, ledger }
        }

        fn root(&self) -> std::path::PathBuf {
            self.dir.path().join("downloads")
        }

        fn context(&self, fetcher: Arc<dyn Fetcher>, total: usize) -> PipelineContext {
            context_with(self.root(), self.ledger.clone(), fetcher, total)
        }

        fn log(&self, path: &Path) -> Vec<String> {
            fs::read_to_string(path)
                .unwrap_or_default()
                .lines()
                .map(|line| line.split('\t').next().unwrap_or_default().to_string())
                .collect()
        }

        fn completed(&self) -> Vec<String> {
            self.log(self.ledger.completed_log())
        }

        fn failed(&self) -> Vec<String> {
            self.log(self.ledger.failed_log())
        }

        fn seed_complete(&self, video_id: &str) {
            let set = ArtifactSet::new(&self.root(), video_id);
            set.prepare().unwrap();
            for kind in ArtifactKind::ALL {
                fs::write(set.path(kind), "existing").unwrap();
            }
        }
    }

    fn context_with(
        root: std::path::PathBuf,
        ledger: Arc<dyn Ledger>,
        fetcher: Arc<dyn Fetcher>,
        total: usize,
    ) -> PipelineContext {
        PipelineContext {
            fetches: Fetches::new(fetcher, root),
            ledger,
            progress: Arc::new(Progress::new(total, None)),
            cancel: CancellationToken::new(),
        }
    }

    /// Accepts nothing: every write fails.
    struct BrokenLedger;

    #[async_trait]
    impl Ledger for BrokenLedger {
        async fn snapshot(&self) -> Result<LedgerSnapshot> {
            Ok(LedgerSnapshot::default())
        }

        async fn record_completed(&self, video_id: &str) -> Result<()> {
            bail!("disk full while recording {video_id}")
        }

        async fn record_failed(&self, video_id: &str, _message: Option<&str>) -> Result<()> {
            bail!("disk full while recording {video_id}")
        }
    }

    fn ids(values: &[&str]) -> Vec<String> {
        values.iter().map(|value| value.to_string()).collect()
    }

    async fn run(kind: PipelineKind, ctx: &PipelineContext, ids: Vec<String>) -> RunSummary {
        run_pipeline(kind, ctx, ids, WORKERS).await
    }

    #[tokio::test]
    async fn failing_collaborator_records_failure_only() {
        for kind in [PipelineKind::Queue, PipelineKind::Pool] {
            let harness = Harness::new();
            let stub = Arc::new(StubFetcher::failing());
            let ctx = harness.context(stub.clone(), 1);

            let summary = run(kind, &ctx, ids(&["vid1"])).await;

            assert_eq!(
                summary,
                RunSummary {
                    dispatched: 1,
                    completed: 0,
                    failed: 1,
                    unrecorded: 0,
                    cancelled: 0
                }
            );
            assert_eq!(harness.failed(), vec!["vid1"]);
            assert!(harness.completed().is_empty());
            let video_dir = harness.root().join("vid1");
            assert!(video_dir.is_dir());
            assert_eq!(fs::read_dir(&video_dir).unwrap().count(), 0);
            assert_eq!(ctx.progress.done(), 1);
        }
    }

    #[tokio::test]
    async fn queue_pipeline_stops_after_video_failure() {
        let harness = Harness::new();
        let stub = Arc::new(StubFetcher::failing());
        let ctx = harness.context(stub.clone(), 1);
        run(PipelineKind::Queue, &ctx, ids(&["vid1"])).await;
        assert_eq!(stub.calls(), vec![("vid1".to_string(), ArtifactKind::Video)]);

        let raw = fs::read_to_string(harness.ledger.failed_log()).unwrap();
        assert!(raw.starts_with("vid1\tvideo fetch failed"));
    }

    #[tokio::test]
    async fn succeeding_collaborator_records_completion_with_three_files() {
        for kind in [PipelineKind::Queue, PipelineKind::Pool] {
            let harness = Harness::new();
            let ctx = harness.context(Arc::new(StubFetcher::succeeding()), 1);

            let summary = run(kind, &ctx, ids(&["vid1"])).await;

            assert_eq!(summary.completed, 1);
            assert_eq!(summary.failed, 0);
            assert_eq!(harness.completed(), vec!["vid1"]);
            assert!(harness.failed().is_empty());
            let set = ArtifactSet::new(&harness.root(), "vid1");
            assert!(set.is_complete());
            assert_eq!(fs::read_dir(set.dir()).unwrap().count(), 3);
        }
    }

    #[tokio::test]
    async fn existing_artifacts_complete_without_the_collaborator() {
        for kind in [PipelineKind::Queue, PipelineKind::Pool] {
            let harness = Harness::new();
            harness.seed_complete("vid1");
            let stub = Arc::new(StubFetcher::failing());
            let ctx = harness.context(stub.clone(), 1);

            let summary = run(kind, &ctx, ids(&["vid1"])).await;

            assert_eq!(summary.completed, 1);
            assert!(stub.calls().is_empty());
            assert_eq!(harness.completed(), vec!["vid1"]);
        }
    }

    #[tokio::test]
    async fn every_dispatched_id_lands_in_exactly_one_log() {
        let all: Vec<String> = (0..25).map(|i| format!("vid{i:02}")).collect();
        for kind in [PipelineKind::Queue, PipelineKind::Pool] {
            let harness = Harness::new();
            let stub = StubFetcher::succeeding()
                .failing_on("vid03", ArtifactKind::Video)
                .failing_on("vid07", ArtifactKind::Audio)
                .failing_on("vid11", ArtifactKind::Metadata);
            let ctx = harness.context(Arc::new(stub), all.len());

            let summary = run(kind, &ctx, all.clone()).await;

            assert_eq!(summary.dispatched, 25);
            assert_eq!(summary.completed, 22);
            assert_eq!(summary.failed, 3);
            assert_eq!(summary.cancelled, 0);

            let completed: HashSet<String> = harness.completed().into_iter().collect();
            let failed: HashSet<String> = harness.failed().into_iter().collect();
            assert_eq!(completed.len() + failed.len(), 25);
            assert!(completed.is_disjoint(&failed));
            assert_eq!(
                failed,
                HashSet::from(["vid03", "vid07", "vid11"].map(String::from))
            );
            assert_eq!(ctx.progress.done(), 25);
        }
    }

    #[tokio::test]
    async fn failure_message_names_the_failing_artifact() {
        let harness = Harness::new();
        let stub = StubFetcher::succeeding().failing_on("vid1", ArtifactKind::Audio);
        let ctx = harness.context(Arc::new(stub), 1);
        run(PipelineKind::Pool, &ctx, ids(&["vid1"])).await;

        let raw = fs::read_to_string(harness.ledger.failed_log()).unwrap();
        assert!(raw.starts_with("vid1\taudio fetch failed"));
        // The other artifacts were still fetched.
        let set = ArtifactSet::new(&harness.root(), "vid1");
        assert_eq!(set.missing(), vec![ArtifactKind::Audio]);
    }

    #[tokio::test]
    async fn cancelled_runs_leave_work_unrecorded() {
        for kind in [PipelineKind::Queue, PipelineKind::Pool] {
            let harness = Harness::new();
            let stub = Arc::new(StubFetcher::succeeding());
            let ctx = harness.context(stub.clone(), 3);
            ctx.cancel.cancel();

            let summary = run(kind, &ctx, ids(&["a", "b", "c"])).await;

            assert_eq!(summary.dispatched, 3);
            assert_eq!(summary.completed + summary.failed, 0);
            assert_eq!(summary.cancelled, 3);
            assert!(stub.calls().is_empty());
            assert!(harness.completed().is_empty() && harness.failed().is_empty());
        }
    }

    #[tokio::test]
    async fn interrupted_fetches_stay_pending_for_the_next_run() -> Result<()> {
        for kind in [PipelineKind::Queue, PipelineKind::Pool] {
            let harness = Harness::new();
            let cancel = CancellationToken::new();
            let stub = Arc::new(StubFetcher::interrupted(cancel.clone()));
            let mut ctx = harness.context(stub.clone(), 1);
            ctx.cancel = cancel;

            let summary = run(kind, &ctx, ids(&["vid1"])).await;

            assert_eq!(
                summary,
                RunSummary {
                    dispatched: 1,
                    cancelled: 1,
                    ..RunSummary::default()
                }
            );
            assert!(!stub.calls().is_empty());
            assert!(harness.completed().is_empty());
            assert!(harness.failed().is_empty());
            assert_eq!(ctx.progress.done(), 0);

            let next = plan(harness.ledger.as_ref(), &ids(&["vid1"])).await?;
            assert_eq!(next.pending, vec!["vid1"]);
        }
        Ok(())
    }

    #[tokio::test]
    async fn ledger_errors_are_not_counted_as_settled() {
        for kind in [PipelineKind::Queue, PipelineKind::Pool] {
            let dir = tempdir().unwrap();
            let stub = StubFetcher::succeeding().failing_on("vid2", ArtifactKind::Video);
            let ctx = context_with(
                dir.path().join("downloads"),
                Arc::new(BrokenLedger),
                Arc::new(stub),
                2,
            );

            let summary = run(kind, &ctx, ids(&["vid1", "vid2"])).await;

            assert_eq!(
                summary,
                RunSummary {
                    dispatched: 2,
                    unrecorded: 2,
                    ..RunSummary::default()
                }
            );
            assert_eq!(ctx.progress.done(), 2);
        }
    }

    #[tokio::test]
    async fn sqlite_ledger_settles_each_id_once_and_skips_on_rerun() -> Result<()> {
        let dataset: Vec<String> = (0..12).map(|i| format!("vid{i:02}")).collect();
        for kind in [PipelineKind::Queue, PipelineKind::Pool] {
            let dir = tempdir()?;
            let ledger: Arc<dyn Ledger> =
                Arc::new(SqliteLedger::open(&dir.path().join("ledger.db")).await?);
            let stub = StubFetcher::succeeding()
                .failing_on("vid02", ArtifactKind::Video)
                .failing_on("vid05", ArtifactKind::Metadata);
            let ctx = context_with(
                dir.path().join("downloads"),
                Arc::clone(&ledger),
                Arc::new(stub),
                dataset.len(),
            );

            let first = plan(ledger.as_ref(), &dataset).await?;
            assert_eq!(first.pending, dataset);
            let summary = run(kind, &ctx, first.pending).await;
            assert_eq!(summary.completed, 10);
            assert_eq!(summary.failed, 2);
            assert_eq!(summary.cancelled, 0);

            let snapshot = ledger.snapshot().await?;
            assert_eq!(snapshot.completed.len() + snapshot.failed.len(), 12);
            assert!(snapshot.completed.is_disjoint(&snapshot.failed));
            assert_eq!(
                snapshot.failed,
                HashSet::from(["vid02", "vid05"].map(String::from))
            );

            let second = plan(ledger.as_ref(), &dataset).await?;
            assert_eq!(
                second,
                CrawlPlan {
                    total: 12,
                    already_completed: 10,
                    already_failed: 2,
                    pending: Vec::new(),
                }
            );
        }
        Ok(())
    }

    #[tokio::test]
    async fn rerun_skips_completed_and_failed_ids() -> Result<()> {
        let harness = Harness::new();
        let dataset = ids(&["ok1", "bad1", "ok2"]);
        let first = StubFetcher::succeeding().failing_on("bad1", ArtifactKind::Video);
        let ctx = harness.context(Arc::new(first), 3);
        let first_plan = plan(harness.ledger.as_ref(), &dataset).await?;
        assert_eq!(first_plan.pending, dataset);
        run(PipelineKind::Queue, &ctx, first_plan.pending).await;

        let second_plan = plan(harness.ledger.as_ref(), &dataset).await?;
        assert_eq!(
            second_plan,
            CrawlPlan {
                total: 3,
                already_completed: 2,
                already_failed: 1,
                pending: Vec::new(),
            }
        );

        let stub = Arc::new(StubFetcher::succeeding());
        let ctx = harness.context(stub.clone(), 0);
        let summary = run(PipelineKind::Queue, &ctx, second_plan.pending).await;
        assert_eq!(summary, RunSummary::default());
        assert!(stub.calls().is_empty());
        Ok(())
    }

    #[test]
    fn pipeline_kind_parses() {
        assert_eq!("queue".parse::<PipelineKind>().unwrap(), PipelineKind::Queue);
        assert_eq!("Pool-Map".parse::<PipelineKind>().unwrap(), PipelineKind::Pool);
        assert!("mapreduce".parse::<PipelineKind>().is_err());
    }
}
