//! Everything that talks to yt-dlp.
//!
//! The crawler never downloads or transcodes media itself. It builds one
//! yt-dlp invocation per artifact, runs it, and afterwards only looks at which
//! files exist. The [`Fetcher`] trait is the seam that lets the pipelines run
//! against a stub in tests.

use anyhow::{Result, bail};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use thiserror::Error;
use tokio::process::Command;
use tracing::{debug, warn};

use crate::artifacts::{ArtifactKind, ArtifactSet};

const VIDEO_FORMAT: &str = "bestvideo[ext=mp4]+bestaudio[ext=m4a]/mp4";
const AUDIO_FORMAT: &str = "bestaudio/best";
const AUDIO_CODEC: &str = "mp3";
const AUDIO_QUALITY: &str = "192K";
const HTTP_CHUNK_SIZE: &str = "1M";
const STDERR_TAIL_LINES: usize = 5;

pub fn watch_url(video_id: &str) -> String {
    format!("https://www.youtube.com/watch?v={video_id}")
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("could not launch {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },
    #[error("{program} exited with status {}: {stderr}", describe_code(.code))]
    Exit {
        program: String,
        code: Option<i32>,
        stderr: String,
    },
}

fn describe_code(code: &Option<i32>) -> String {
    code.map_or_else(|| "signal".to_string(), |code| code.to_string())
}

/// One artifact to produce for one identifier.
#[derive(Debug, Clone, Copy)]
pub struct FetchRequest<'a> {
    pub kind: ArtifactKind,
    pub artifacts: &'a ArtifactSet,
}

impl FetchRequest<'_> {
    pub fn video_id(&self) -> &str {
        self.artifacts.video_id()
    }

    pub fn output(&self) -> PathBuf {
        self.artifacts.path(self.kind)
    }
}

#[async_trait]
pub trait Fetcher: Send + Sync {
    /// Produces `request.output()`. Success only means the collaborator
    /// reported success; callers still check the file afterwards.
    async fn fetch(&self, request: &FetchRequest<'_>) -> Result<(), FetchError>;
}

/// Runs the `yt-dlp` program once per artifact.
#[derive(Debug, Clone)]
pub struct YtDlp {
    program: PathBuf,
    cookies: Option<PathBuf>,
    concurrent_fragments: u32,
}

impl YtDlp {
    pub fn new(program: PathBuf, cookies: Option<PathBuf>, concurrent_fragments: u32) -> Self {
        Self {
            program,
            cookies,
            concurrent_fragments,
        }
    }

    fn program_name(&self) -> String {
        self.program.to_string_lossy().into_owned()
    }

    /// Runs `yt-dlp --version` so a missing install fails before any work is
    /// dispatched.
    pub async fn ensure_available(&self) -> Result<()> {
        let status = Command::new(&self.program)
            .arg("--version")
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await;

        match status {
            Ok(status) if status.success() => Ok(()),
            Ok(_) => bail!(
                "{} is installed but returned a failure status",
                self.program_name()
            ),
            Err(err) => bail!(
                "{} is not installed or not in PATH: {}",
                self.program_name(),
                err
            ),
        }
    }

    /// Command-line arguments for one artifact, URL last.
    pub fn build_args(&self, request: &FetchRequest<'_>) -> Vec<String> {
        let video_id = request.video_id();
        let dir = request.artifacts.dir();
        let mut args: Vec<String> = ["--quiet", "--no-warnings", "--no-playlist", "--no-progress"]
            .into_iter()
            .map(String::from)
            .collect();

        if let Some(cookies) = &self.cookies
            && cookies.exists()
        {
            args.push("--cookies".into());
            args.push(cookies.to_string_lossy().into_owned());
        }

        match request.kind {
            ArtifactKind::Video => {
                args.extend(
                    ["--format", VIDEO_FORMAT, "--merge-output-format", "mp4"].map(String::from),
                );
                args.push("--concurrent-fragments".into());
                args.push(self.concurrent_fragments.to_string());
                args.extend(["--http-chunk-size", HTTP_CHUNK_SIZE].map(String::from));
                args.push("--output".into());
                args.push(output_template(dir, &format!("{video_id}.mp4")));
            }
            ArtifactKind::Audio => {
                args.extend(
                    [
                        "--format",
                        AUDIO_FORMAT,
                        "--extract-audio",
                        "--audio-format",
                        AUDIO_CODEC,
                        "--audio-quality",
                        AUDIO_QUALITY,
                    ]
                    .map(String::from),
                );
                args.push("--output".into());
                args.push(output_template(dir, &format!("{video_id}_audio.%(ext)s")));
            }
            ArtifactKind::Metadata => {
                args.extend(["--skip-download", "--write-info-json"].map(String::from));
                args.push("--output".into());
                args.push(output_template(dir, &format!("{video_id}.%(ext)s")));
            }
        }

        args.push(watch_url(video_id));
        args
    }
}

fn output_template(dir: &Path, file_name: &str) -> String {
    dir.join(file_name).to_string_lossy().into_owned()
}

/// Keeps the last few non-empty stderr lines; yt-dlp puts the actual error
/// at the end.
fn stderr_tail(raw: &[u8]) -> String {
    let text = String::from_utf8_lossy(raw);
    let lines: Vec<&str> = text
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .collect();
    let start = lines.len().saturating_sub(STDERR_TAIL_LINES);
    lines[start..].join(" | ")
}

#[async_trait]
impl Fetcher for YtDlp {
    async fn fetch(&self, request: &FetchRequest<'_>) -> Result<(), FetchError> {
        let args = self.build_args(request);
        debug!(
            video_id = request.video_id(),
            artifact = request.kind.label(),
            ?args,
            "running yt-dlp"
        );

        let mut command = Command::new(&self.program);
        command
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped());
        // Own process group: a terminal Ctrl-C reaches the crawler only, and
        // in-flight downloads run to completion.
        #[cfg(unix)]
        command.process_group(0);

        let output = command
            .output()
            .await
            .map_err(|source| FetchError::Spawn {
                program: self.program_name(),
                source,
            })?;

        if output.status.success() {
            Ok(())
        } else {
            Err(FetchError::Exit {
                program: self.program_name(),
                code: output.status.code(),
                stderr: stderr_tail(&output.stderr),
            })
        }
    }
}

/// Result of one fetch operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchOutcome {
    /// The artifact was already on disk; yt-dlp was not invoked.
    Existing(PathBuf),
    /// yt-dlp reported success.
    Fetched(PathBuf),
    /// yt-dlp (or preparing its directory) failed. Never retried in-run.
    Failed(String),
}

impl FetchOutcome {
    pub fn failure(&self) -> Option<&str> {
        match self {
            FetchOutcome::Failed(message) => Some(message),
            _ => None,
        }
    }
}

/// The three idempotent fetch operations, rooted at the download directory.
#[derive(Clone)]
pub struct Fetches {
    fetcher: Arc<dyn Fetcher>,
    download_root: PathBuf,
}

impl Fetches {
    pub fn new(fetcher: Arc<dyn Fetcher>, download_root: PathBuf) -> Self {
        Self {
            fetcher,
            download_root,
        }
    }

    pub fn artifacts(&self, video_id: &str) -> ArtifactSet {
        ArtifactSet::new(&self.download_root, video_id)
    }

    pub async fn fetch_video(&self, video_id: &str) -> FetchOutcome {
        self.fetch_artifact(video_id, ArtifactKind::Video).await
    }

    pub async fn fetch_audio(&self, video_id: &str) -> FetchOutcome {
        self.fetch_artifact(video_id, ArtifactKind::Audio).await
    }

    pub async fn fetch_metadata(&self, video_id: &str) -> FetchOutcome {
        self.fetch_artifact(video_id, ArtifactKind::Metadata).await
    }

    async fn fetch_artifact(&self, video_id: &str, kind: ArtifactKind) -> FetchOutcome {
        let artifacts = self.artifacts(video_id);
        if let Err(err) = artifacts.prepare() {
            warn!(video_id, artifact = kind.label(), error = %err, "could not prepare directory");
            return FetchOutcome::Failed(format!("{err:#}"));
        }

        let path = artifacts.path(kind);
        if path.is_file() {
            debug!(video_id, artifact = kind.label(), "already present, skipping");
            return FetchOutcome::Existing(path);
        }

        let request = FetchRequest {
            kind,
            artifacts: &artifacts,
        };
        match self.fetcher.fetch(&request).await {
            Ok(()) => FetchOutcome::Fetched(path),
            Err(err) => {
                warn!(video_id, artifact = kind.label(), error = %err, "fetch failed");
                FetchOutcome::Failed(format!("{} fetch failed: {err}", kind.label()))
            }
        }
    }
}
