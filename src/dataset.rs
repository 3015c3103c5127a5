//! Reads the dataset description that lists every video to crawl.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::collections::HashSet;
use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use tracing::warn;

/// One entry of the dataset array. Everything except `video_id` is ignored.
#[derive(Debug, Deserialize)]
struct DatasetEntry {
    video_id: String,
}

/// Loads the identifiers listed in a JSON array of `{"video_id": ...}` objects.
///
/// Order is preserved, duplicates keep their first position and blank ids are
/// dropped. Failing to read or parse the file is fatal for the whole run.
pub fn load_dataset(path: &Path) -> Result<Vec<String>> {
    let file = File::open(path).with_context(|| format!("opening dataset {}", path.display()))?;
    let entries: Vec<DatasetEntry> = serde_json::from_reader(BufReader::new(file))
        .with_context(|| format!("parsing dataset {}", path.display()))?;

    let mut seen = HashSet::new();
    let mut ids = Vec::with_capacity(entries.len());
    for (index, entry) in entries.into_iter().enumerate() {
        let id = entry.video_id.trim();
        if id.is_empty() {
            warn!(index, "skipping dataset entry with a blank video_id");
            continue;
        }
        if seen.insert(id.to_owned()) {
            ids.push(id.to_owned());
        }
    }
    Ok(ids)
}
