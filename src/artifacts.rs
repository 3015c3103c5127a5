//! On-disk layout of the three artifacts produced for every video.

use anyhow::{Context, Result};
use std::fs;
use std::path::{Path, PathBuf};

const VIDEO_SUFFIX: &str = ".mp4";
const AUDIO_SUFFIX: &str = "_audio.mp3";
const METADATA_SUFFIX: &str = ".info.json";

/// The three files every identifier must end up with.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ArtifactKind {
    Video,
    Audio,
    Metadata,
}

impl ArtifactKind {
    pub const ALL: [ArtifactKind; 3] = [
        ArtifactKind::Video,
        ArtifactKind::Audio,
        ArtifactKind::Metadata,
    ];

    pub fn label(self) -> &'static str {
        match self {
            ArtifactKind::Video => "video",
            ArtifactKind::Audio => "audio",
            ArtifactKind::Metadata => "metadata",
        }
    }

    fn suffix(self) -> &'static str {
        match self {
            ArtifactKind::Video => VIDEO_SUFFIX,
            ArtifactKind::Audio => AUDIO_SUFFIX,
            ArtifactKind::Metadata => METADATA_SUFFIX,
        }
    }
}

/// Paths of every artifact for one identifier: `<root>/<id>/<id>.mp4`,
/// `<root>/<id>/<id>_audio.mp3` and `<root>/<id>/<id>.info.json`.
#[derive(Debug, Clone)]
pub struct ArtifactSet {
    video_id: String,
    dir: PathBuf,
}

impl ArtifactSet {
    pub fn new(download_root: &Path, video_id: &str) -> Self {
        Self {
            video_id: video_id.to_owned(),
            dir: download_root.join(video_id),
        }
    }

    pub fn video_id(&self) -> &str {
        &self.video_id
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path(&self, kind: ArtifactKind) -> PathBuf {
        self.dir.join(format!("{}{}", self.video_id, kind.suffix()))
    }

    pub fn exists(&self, kind: ArtifactKind) -> bool {
        self.path(kind).is_file()
    }

    pub fn missing(&self) -> Vec<ArtifactKind> {
        ArtifactKind::ALL
            .into_iter()
            .filter(|kind| !self.exists(*kind))
            .collect()
    }

    pub fn is_complete(&self) -> bool {
        ArtifactKind::ALL.iter().all(|kind| self.exists(*kind))
    }

    /// Creates the per-identifier directory so fetches can assume it exists.
    pub fn prepare(&self) -> Result<()> {
        fs::create_dir_all(&self.dir).with_context(|| format!("creating {}", self.dir.display()))
    }
}
