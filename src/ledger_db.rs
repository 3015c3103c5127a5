//! SQLite-backed ledger. One row per identifier, so the completed and failed
//! states can never both be recorded for the same video.

use std::path::Path;

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use chrono::Utc;
use libsql::{Builder, Connection, params};
use tokio::sync::Mutex;

use crate::ledger::{Ledger, LedgerSnapshot};

const STATUS_COMPLETED: &str = "completed";
const STATUS_FAILED: &str = "failed";

async fn configure_connection(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"
        PRAGMA journal_mode=WAL;
        PRAGMA synchronous=NORMAL;
        PRAGMA busy_timeout=5000;
        "#,
    )
    .await?;
    Ok(())
}

async fn ensure_schema(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS ledger (
            video_id TEXT PRIMARY KEY,
            status TEXT NOT NULL CHECK (status IN ('completed', 'failed')),
            message TEXT,
            recorded_at TEXT NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_ledger_status ON ledger(status);
        "#,
    )
    .await?;
    Ok(())
}

/// A row as stored in the `ledger` table.
#[cfg(test)]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LedgerEntry {
    pub video_id: String,
    pub status: String,
    pub message: Option<String>,
    pub recorded_at: String,
}

pub struct SqliteLedger {
    conn: Mutex<Connection>,
}

impl SqliteLedger {
    /// Opens (and if necessary creates) the ledger DB and its schema.
    pub async fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("creating ledger directory {}", parent.display()))?;
        }

        let db = Builder::new_local(path)
            .build()
            .await
            .with_context(|| format!("opening ledger DB {}", path.display()))?;
        let conn = db.connect()?;
        configure_connection(&conn).await?;
        ensure_schema(&conn).await?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    async fn record(&self, video_id: &str, status: &str, message: Option<&str>) -> Result<()> {
        let recorded_at = Utc::now().to_rfc3339();
        let conn = self.conn.lock().await;
        conn.execute(
            r#"
            INSERT INTO ledger (video_id, status, message, recorded_at)
            VALUES (?1, ?2, ?3, ?4)
            ON CONFLICT(video_id) DO UPDATE SET
                status = excluded.status,
                message = excluded.message,
                recorded_at = excluded.recorded_at
            "#,
            params![video_id, status, message, recorded_at],
        )
        .await
        .with_context(|| format!("recording {status} for {video_id}"))?;
        Ok(())
    }

    #[cfg(test)]
    pub async fn get(&self, video_id: &str) -> Result<Option<LedgerEntry>> {
        let conn = self.conn.lock().await;
        let mut rows = conn
            .query(
                "SELECT video_id, status, message, recorded_at FROM ledger WHERE video_id = ?1",
                params![video_id],
            )
            .await?;
        let Some(row) = rows.next().await? else {
            return Ok(None);
        };
        Ok(Some(LedgerEntry {
            video_id: row.get(0)?,
            status: row.get(1)?,
            message: match row.get_value(2)? {
                libsql::Value::Text(text) => Some(text),
                _ => None,
            },
            recorded_at: row.get(3)?,
        }))
    }
}

#[async_trait]
impl Ledger for SqliteLedger {
    async fn snapshot(&self) -> Result<LedgerSnapshot> {
        let conn = self.conn.lock().await;
        let mut rows = conn
            .query("SELECT video_id, status FROM ledger", params![])
            .await?;
        let mut snapshot = LedgerSnapshot::default();
        while let Some(row) = rows.next().await? {
            let video_id: String = row.get(0)?;
            let status: String = row.get(1)?;
            match status.as_str() {
                STATUS_COMPLETED => snapshot.completed.insert(video_id),
                STATUS_FAILED => snapshot.failed.insert(video_id),
                other => bail!("unexpected ledger status {other} for {video_id}"),
            };
        }
        Ok(snapshot)
    }

    async fn record_completed(&self, video_id: &str) -> Result<()> {
        self.record(video_id, STATUS_COMPLETED, None).await
    }

    async fn record_failed(&self, video_id: &str, message: Option<&str>) -> Result<()> {
        self.record(video_id, STATUS_FAILED, message).await
    }
}
