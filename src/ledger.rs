//! Persistent record of which identifiers already finished, successfully or
//! not, so repeated runs never redo settled work.
//!
//! The default backend is a pair of append-only text files with one
//! identifier per line. Several crawler processes may share the same files,
//! so every append takes an exclusive advisory lock for the duration of the
//! write.

use anyhow::{Context, Result, anyhow};
use async_trait::async_trait;
use nix::fcntl::{Flock, FlockArg};
use std::collections::HashSet;
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::config::{CrawlSettings, LedgerBackend};
use crate::ledger_db::SqliteLedger;

/// Identifiers recorded by earlier runs, read once at start-up.
#[derive(Debug, Clone, Default)]
pub struct LedgerSnapshot {
    pub completed: HashSet<String>,
    pub failed: HashSet<String>,
}

impl LedgerSnapshot {
    pub fn is_settled(&self, video_id: &str) -> bool {
        self.completed.contains(video_id) || self.failed.contains(video_id)
    }
}

/// Keeps every identifier that appears in neither set, preserving input order.
pub fn pending_ids(ids: &[String], snapshot: &LedgerSnapshot) -> Vec<String> {
    ids.iter()
        .filter(|id| !snapshot.is_settled(id))
        .cloned()
        .collect()
}

/// Idempotency store shared by every worker of a run.
#[async_trait]
pub trait Ledger: Send + Sync {
    async fn snapshot(&self) -> Result<LedgerSnapshot>;

    async fn record_completed(&self, video_id: &str) -> Result<()>;

    /// `message` is free text kept for the operator; it never affects skipping.
    async fn record_failed(&self, video_id: &str, message: Option<&str>) -> Result<()>;
}

/// Opens whichever backend the settings select.
pub async fn open_ledger(settings: &CrawlSettings) -> Result<Arc<dyn Ledger>> {
    let ledger: Arc<dyn Ledger> = match settings.ledger {
        LedgerBackend::Files => Arc::new(FileLedger::new(
            settings.completed_log.clone(),
            settings.failed_log.clone(),
        )),
        LedgerBackend::Sqlite => Arc::new(SqliteLedger::open(&settings.ledger_db).await?),
    };
    Ok(ledger)
}

/// The completion and failure logs as two flat text files.
#[derive(Debug, Clone)]
pub struct FileLedger {
    completed_log: PathBuf,
    failed_log: PathBuf,
}

impl FileLedger {
    pub fn new(completed_log: PathBuf, failed_log: PathBuf) -> Self {
        Self {
            completed_log,
            failed_log,
        }
    }

    pub fn completed_log(&self) -> &Path {
        &self.completed_log
    }

    pub fn failed_log(&self) -> &Path {
        &self.failed_log
    }
}

#[async_trait]
impl Ledger for FileLedger {
    async fn snapshot(&self) -> Result<LedgerSnapshot> {
        let completed_log = self.completed_log.clone();
        let failed_log = self.failed_log.clone();
        tokio::task::spawn_blocking(move || -> Result<LedgerSnapshot> {
            Ok(LedgerSnapshot {
                completed: load_ids(&completed_log)?,
                failed: load_ids(&failed_log)?,
            })
        })
        .await
        .context("reading ledger files")?
    }

    async fn record_completed(&self, video_id: &str) -> Result<()> {
        append_entry(self.completed_log.clone(), video_id.to_owned()).await
    }

    async fn record_failed(&self, video_id: &str, message: Option<&str>) -> Result<()> {
        let line = match message.map(flatten_message).filter(|msg| !msg.is_empty()) {
            Some(message) => format!("{video_id}\t{message}"),
            None => video_id.to_owned(),
        };
        append_entry(self.failed_log.clone(), line).await
    }
}

/// Reads one log file into a set. The identifier is the first TAB-separated
/// field of each line; blank lines are skipped and a missing file is empty.
pub fn load_ids(path: &Path) -> Result<HashSet<String>> {
    if !path.exists() {
        return Ok(HashSet::new());
    }

    let file = File::open(path).with_context(|| format!("opening {}", path.display()))?;
    let mut ids = HashSet::new();
    for line in BufReader::new(file).lines() {
        let line = line.with_context(|| format!("reading {}", path.display()))?;
        if let Some(id) = line.split('\t').next().map(str::trim)
            && !id.is_empty()
        {
            ids.insert(id.to_owned());
        }
    }
    Ok(ids)
}

async fn append_entry(path: PathBuf, line: String) -> Result<()> {
    tokio::task::spawn_blocking(move || append_line(&path, &line))
        .await
        .context("joining ledger append")?
}

fn append_line(path: &Path, line: &str) -> Result<()> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        fs::create_dir_all(parent).with_context(|| format!("creating {}", parent.display()))?;
    }

    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("opening {}", path.display()))?;
    let mut locked = Flock::lock(file, FlockArg::LockExclusive)
        .map_err(|(_, errno)| anyhow!("locking {}: {errno}", path.display()))?;
    locked
        .write_all(format!("{line}\n").as_bytes())
        .with_context(|| format!("appending to {}", path.display()))?;
    locked
        .flush()
        .with_context(|| format!("flushing {}", path.display()))?;
    Ok(())
}

/// Keeps a failure message on a single line of the log.
fn flatten_message(message: &str) -> String {
    message
        .split(['\n', '\r', '\t'])
        .map(str::trim)
        .filter(|part| !part.is_empty())
        .collect::<Vec<_>>()
        .join(" ")
}
