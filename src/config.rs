#![forbid(unsafe_code)]

use anyhow::{Context, Result, anyhow, bail};
use std::{
    collections::HashMap,
    env, fs,
    path::{Path, PathBuf},
    str::FromStr,
};

pub const DEFAULT_ENV_PATH: &str = ".env";
pub const DEFAULT_FAILED_LOG: &str = "failed_ids.txt";
pub const DEFAULT_COMPLETED_LOG: &str = "complete_folders.txt";
pub const DEFAULT_LEDGER_DB_FILE: &str = "ledger.db";
pub const DEFAULT_YTDLP_BIN: &str = "yt-dlp";
pub const DEFAULT_DOWNLOAD_WORKERS: usize = 4;
pub const DEFAULT_POST_WORKERS: usize = 2;
pub const DEFAULT_POOL_WORKERS: usize = 8;
pub const DEFAULT_CONCURRENT_FRAGMENTS: u32 = 3;

/// Where completion and failure records are persisted between runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LedgerBackend {
    /// Two flat text files, one identifier per line.
    #[default]
    Files,
    /// A single SQLite table keyed by identifier.
    Sqlite,
}

impl FromStr for LedgerBackend {
    type Err = anyhow::Error;

    fn from_str(value: &str) -> Result<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "files" | "file" | "text" => Ok(LedgerBackend::Files),
            "sqlite" | "db" => Ok(LedgerBackend::Sqlite),
            _ => bail!("unknown ledger backend: {value}"),
        }
    }
}

/// Fully resolved settings for one crawl run.
#[derive(Debug, Clone)]
pub struct CrawlSettings {
    pub dataset: PathBuf,
    pub download_root: PathBuf,
    pub failed_log: PathBuf,
    pub completed_log: PathBuf,
    pub cookies: Option<PathBuf>,
    pub download_workers: usize,
    pub post_workers: usize,
    pub pool_workers: usize,
    pub concurrent_fragments: u32,
    pub ledger: LedgerBackend,
    pub ledger_db: PathBuf,
    pub ytdlp_bin: PathBuf,
}

/// Values supplied on the command line. Anything left as `None` is looked up
/// in the process environment, then in the `.env` file, then defaulted.
#[derive(Debug, Clone, Default)]
pub struct SettingsOverrides {
    pub dataset: Option<PathBuf>,
    pub download_root: Option<PathBuf>,
    pub failed_log: Option<PathBuf>,
    pub completed_log: Option<PathBuf>,
    pub cookies: Option<PathBuf>,
    pub download_workers: Option<usize>,
    pub post_workers: Option<usize>,
    pub pool_workers: Option<usize>,
    pub ledger: Option<LedgerBackend>,
    pub ledger_db: Option<PathBuf>,
    pub env_path: Option<PathBuf>,
}

pub fn resolve_settings(overrides: SettingsOverrides) -> Result<CrawlSettings> {
    let env_path = overrides
        .env_path
        .clone()
        .unwrap_or_else(|| PathBuf::from(DEFAULT_ENV_PATH));
    let file_vars = read_env_file(&env_path)?;
    build_settings(&file_vars, env_var_string, overrides)
}

fn build_settings(
    file_vars: &HashMap<String, String>,
    env_lookup: impl Fn(&str) -> Option<String>,
    overrides: SettingsOverrides,
) -> Result<CrawlSettings> {
    let lookup = |key: &str| lookup_value(key, file_vars, &env_lookup);
    let lookup_path = |key: &str| lookup(key).map(PathBuf::from);

    let dataset = overrides
        .dataset
        .or_else(|| lookup_path("CRAWL_DATASET"))
        .ok_or_else(|| anyhow!("CRAWL_DATASET not set"))?;
    let download_root = overrides
        .download_root
        .or_else(|| lookup_path("DOWNLOAD_ROOT"))
        .ok_or_else(|| anyhow!("DOWNLOAD_ROOT not set"))?;
    let failed_log = overrides
        .failed_log
        .or_else(|| lookup_path("FAILED_LOG"))
        .unwrap_or_else(|| PathBuf::from(DEFAULT_FAILED_LOG));
    let completed_log = overrides
        .completed_log
        .or_else(|| lookup_path("COMPLETED_LOG"))
        .unwrap_or_else(|| PathBuf::from(DEFAULT_COMPLETED_LOG));
    let cookies = overrides.cookies.or_else(|| lookup_path("COOKIES_FILE"));

    let download_workers = worker_count(
        "DOWNLOAD_WORKERS",
        overrides.download_workers,
        lookup("DOWNLOAD_WORKERS"),
        DEFAULT_DOWNLOAD_WORKERS,
    )?;
    let post_workers = worker_count(
        "POST_WORKERS",
        overrides.post_workers,
        lookup("POST_WORKERS"),
        DEFAULT_POST_WORKERS,
    )?;
    let pool_workers = worker_count(
        "POOL_WORKERS",
        overrides.pool_workers,
        lookup("POOL_WORKERS"),
        DEFAULT_POOL_WORKERS,
    )?;
    let concurrent_fragments = lookup("CONCURRENT_FRAGMENTS")
        .and_then(|value| value.parse::<u32>().ok())
        .filter(|value| *value > 0)
        .unwrap_or(DEFAULT_CONCURRENT_FRAGMENTS);

    let ledger = match overrides.ledger {
        Some(backend) => backend,
        None => lookup("LEDGER_BACKEND")
            .map(|value| value.parse::<LedgerBackend>())
            .transpose()?
            .unwrap_or_default(),
    };
    let ledger_db = overrides
        .ledger_db
        .or_else(|| lookup_path("LEDGER_DB"))
        .unwrap_or_else(|| download_root.join(DEFAULT_LEDGER_DB_FILE));
    let ytdlp_bin = lookup_path("YTDLP_BIN").unwrap_or_else(|| PathBuf::from(DEFAULT_YTDLP_BIN));

    Ok(CrawlSettings {
        dataset,
        download_root,
        failed_log,
        completed_log,
        cookies,
        download_workers,
        post_workers,
        pool_workers,
        concurrent_fragments,
        ledger,
        ledger_db,
        ytdlp_bin,
    })
}

/// Overrides must be positive. Unparseable environment values fall back to the
/// default, an explicit zero is rejected.
fn worker_count(
    key: &str,
    override_value: Option<usize>,
    raw: Option<String>,
    default: usize,
) -> Result<usize> {
    let count = override_value
        .or_else(|| raw.and_then(|value| value.parse::<usize>().ok()))
        .unwrap_or(default);
    if count == 0 {
        bail!("{key} must be at least 1");
    }
    Ok(count)
}

fn env_var_string(key: &str) -> Option<String> {
    env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn lookup_value(
    key: &str,
    file_vars: &HashMap<String, String>,
    env_lookup: &impl Fn(&str) -> Option<String>,
) -> Option<String> {
    env_lookup(key)
        .or_else(|| file_vars.get(key).cloned())
        .filter(|value| !value.trim().is_empty())
}

/// Parses a dotenv-style file. A missing file yields an empty map.
pub fn read_env_file(path: &Path) -> Result<HashMap<String, String>> {
    let mut vars = HashMap::new();
    if !path.exists() {
        return Ok(vars);
    }
    let content =
        fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    for line in content.lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }
        let entry = trimmed.strip_prefix("export ").unwrap_or(trimmed);
        let Some((key, raw_value)) = entry.split_once('=') else {
            continue;
        };
        let key = key.trim();
        if key.is_empty() {
            continue;
        }
        vars.insert(key.to_string(), unquote(raw_value.trim()).to_string());
    }
    Ok(vars)
}

fn unquote(value: &str) -> &str {
    for quote in ['"', '\''] {
        if let Some(inner) = value
            .strip_prefix(quote)
            .and_then(|rest| rest.strip_suffix(quote))
        {
            return inner;
        }
    }
    value
}
