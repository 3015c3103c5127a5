//! Run progress, advanced once per finished identifier whatever the outcome.

use parking_lot::Mutex;
use serde::Serialize;
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tracing::{info, warn};

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ProgressReport {
    progress: u8,
    message: String,
}

/// Mirrors progress into a small JSON file so other tools can poll it.
#[derive(Debug, Clone)]
pub struct ProgressWriter {
    path: PathBuf,
}

impl ProgressWriter {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    /// Writes through a temporary file and a rename so readers never observe a
    /// half-written report. Errors are only logged.
    pub fn write(&self, progress: u8, message: &str) {
        let report = ProgressReport {
            progress: progress.min(100),
            message: message.to_string(),
        };

        if let Some(parent) = self.path.parent()
            && !parent.as_os_str().is_empty()
            && let Err(err) = fs::create_dir_all(parent)
        {
            warn!(error = %err, "could not create progress dir");
            return;
        }

        let tmp_path = self.path.with_extension("tmp");
        let payload = match serde_json::to_vec(&report) {
            Ok(payload) => payload,
            Err(err) => {
                warn!(error = %err, "could not serialize progress report");
                return;
            }
        };
        if let Err(err) = fs::write(&tmp_path, payload) {
            warn!(error = %err, "could not write progress file");
            return;
        }
        if let Err(err) = fs::rename(&tmp_path, &self.path) {
            warn!(error = %err, "could not finalize progress file");
        }
    }
}

/// Shared counter of finished identifiers.
#[derive(Debug)]
pub struct Progress {
    total: usize,
    done: Arc<AtomicUsize>,
    writer: Option<Arc<Mutex<ProgressWriter>>>,
}

impl Progress {
    pub fn new(total: usize, writer: Option<ProgressWriter>) -> Self {
        Self {
            total,
            done: Arc::new(AtomicUsize::new(0)),
            writer: writer.map(|writer| Arc::new(Mutex::new(writer))),
        }
    }

    pub fn done(&self) -> usize {
        self.done.load(Ordering::Relaxed)
    }

    pub fn start(&self) {
        self.report(0, &format!("Queued {} videos", self.total));
    }

    /// Counts one more finished identifier and returns the new count. The
    /// report file is rewritten on the blocking pool.
    pub async fn advance(&self, video_id: &str) -> usize {
        let done = self.done.fetch_add(1, Ordering::Relaxed) + 1;
        info!(video_id, done, total = self.total, "finished");

        if let Some(writer) = &self.writer {
            let writer = Arc::clone(writer);
            let counter = Arc::clone(&self.done);
            let total = self.total;
            let write = tokio::task::spawn_blocking(move || {
                // Re-read under the lock so the last write always carries the
                // highest count.
                let writer = writer.lock();
                let current = counter.load(Ordering::Relaxed);
                writer.write(
                    percent(current, total),
                    &format!("Processed {current}/{total}"),
                );
            });
            if let Err(err) = write.await {
                warn!(error = %err, "progress writer task failed");
            }
        }
        done
    }

    pub fn finish(&self, message: &str) {
        self.report(100, message);
    }

    fn report(&self, progress: u8, message: &str) {
        if let Some(writer) = &self.writer {
            writer.lock().write(progress, message);
        }
    }
}

fn percent(done: usize, total: usize) -> u8 {
    if total == 0 {
        return 100;
    }
    ((done.min(total) * 100) / total) as u8
}
