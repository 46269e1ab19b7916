use async_trait::async_trait;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Row, SqlitePool};
use tracing::warn;

use super::TaskRecord;
use crate::traits::TaskStore;

/// SQLite-backed task store. One row per task, JSON record column,
/// last-write-wins upsert.
pub struct SqliteTaskStore {
    pool: SqlitePool,
}

impl SqliteTaskStore {
    pub async fn new(db_path: &str) -> anyhow::Result<Self> {
        let opts = SqliteConnectOptions::new()
            .filename(db_path)
            .create_if_missing(true)
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal);

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(opts)
            .await?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS tasks (
                id TEXT PRIMARY KEY,
                status TEXT NOT NULL,
                record TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )",
        )
        .execute(&pool)
        .await?;

        Ok(Self { pool })
    }
}

#[async_trait]
impl TaskStore for SqliteTaskStore {
    async fn persist(&self, record: &TaskRecord) -> anyhow::Result<()> {
        let json = serde_json::to_string(record)?;
        sqlx::query(
            "INSERT INTO tasks (id, status, record, updated_at) VALUES (?, ?, ?, ?)
             ON CONFLICT(id) DO UPDATE SET status = excluded.status,
                 record = excluded.record, updated_at = excluded.updated_at",
        )
        .bind(&record.id)
        .bind(&record.status)
        .bind(&json)
        .bind(chrono::Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn restore_all(&self) -> anyhow::Result<Vec<TaskRecord>> {
        let rows = sqlx::query("SELECT record FROM tasks")
            .fetch_all(&self.pool)
            .await?;

        let mut records = Vec::with_capacity(rows.len());
        for row in rows {
            let json: String = row.get("record");
            match serde_json::from_str::<TaskRecord>(&json) {
                Ok(record) => records.push(record),
                // A corrupt row must not block recovery of the rest.
                Err(e) => warn!(error = %e, "Skipping unparseable task record"),
            }
        }
        Ok(records)
    }

    async fn remove(&self, task_id: &str) -> anyhow::Result<()> {
        sqlx::query("DELETE FROM tasks WHERE id = ?")
            .bind(task_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}
