use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use rusqlite::Connection;
use tokio::sync::Mutex;
use tracing::{debug, info};

use super::DedupStore;

/// Seen-set persisted in SQLite so admissions survive a restart.
#[derive(Clone)]
pub struct SqliteDedupStore {
    conn: Arc<Mutex<Connection>>,
    retention: Duration,
}

impl SqliteDedupStore {
    /// Open or create the database at the given path.
    pub fn open(path: &Path, retention: Duration) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open dedup database: {}", path.display()))?;

        // journal_mode PRAGMA always returns the resulting mode, so use query_row
        let _: String = conn.query_row("PRAGMA journal_mode=WAL", [], |row| row.get(0))?;

        Self::run_migrations(&conn)?;

        info!("Dedup store initialized at: {}", path.display());
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            retention,
        })
    }

    #[cfg(test)]
    pub fn open_in_memory(retention: Duration) -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        Self::run_migrations(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            retention,
        })
    }

    fn run_migrations(conn: &Connection) -> Result<()> {
        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS seen_updates (
                update_id INTEGER PRIMARY KEY,
                seen_at INTEGER NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_seen_updates_seen_at
                ON seen_updates(seen_at);
            ",
        )
        .context("Failed to run dedup migrations")?;
        Ok(())
    }

    fn retention_ms(&self) -> i64 {
        i64::try_from(self.retention.as_millis()).unwrap_or(i64::MAX)
    }

    async fn admit_at(&self, update_id: i64, now_ms: i64) -> Result<bool> {
        let cutoff = now_ms.saturating_sub(self.retention_ms());
        let conn = self.conn.lock().await;
        // A fresh row, or a row whose window has closed, counts as one change.
        let changed = conn
            .execute(
                "INSERT INTO seen_updates (update_id, seen_at) VALUES (?1, ?2)
                 ON CONFLICT(update_id) DO UPDATE SET seen_at = excluded.seen_at
                 WHERE seen_updates.seen_at <= ?3",
                rusqlite::params![update_id, now_ms, cutoff],
            )
            .context("Failed to record update id")?;
        Ok(changed == 1)
    }

    async fn prune_at(&self, now_ms: i64) -> Result<usize> {
        let cutoff = now_ms.saturating_sub(self.retention_ms());
        let conn = self.conn.lock().await;
        let removed = conn
            .execute(
                "DELETE FROM seen_updates WHERE seen_at <= ?1",
                rusqlite::params![cutoff],
            )
            .context("Failed to prune dedup records")?;
        Ok(removed)
    }
}

#[async_trait]
impl DedupStore for SqliteDedupStore {
    async fn admit(&self, update_id: i64) -> Result<bool> {
        self.admit_at(update_id, Utc::now().timestamp_millis()).await
    }

    async fn prune(&self) -> Result<usize> {
        let removed = self.prune_at(Utc::now().timestamp_millis()).await?;
        debug!(removed, "Pruned persisted dedup records");
        Ok(removed)
    }
}
