use crate::models::{CollectionHistoryEntry, TriggerSource};
use crate::store::StoreError;
use serde::Serialize;
use sqlx::{Row, SqlitePool};
use tracing::debug;

/// Append-only log of collection attempts. One entry per attempted device
/// per cycle, success or failure, never both.
#[derive(Clone)]
pub struct HistoryStore {
    pool: SqlitePool,
}

/// Success-rate summary over a window. `rate` is `None` when nothing was
/// attempted, which is not the same thing as a rate of zero.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct SuccessRate {
    pub attempts: i64,
    pub successes: i64,
    pub rate: Option<f64>,
}

impl HistoryStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn append(&self, entry: &CollectionHistoryEntry) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO collection_history
                (device_id, success, error, duration_ms, trigger_source, timestamp)
            VALUES (?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&entry.device_id)
        .bind(entry.success)
        .bind(&entry.error)
        .bind(entry.duration_ms)
        .bind(entry.trigger.as_str())
        .bind(entry.timestamp)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Most recent entries for a device, newest first.
    pub async fn recent(
        &self,
        device_id: &str,
        limit: u32,
    ) -> Result<Vec<CollectionHistoryEntry>, StoreError> {
        let rows = sqlx::query(
            "SELECT * FROM collection_history WHERE device_id = ?
             ORDER BY timestamp DESC, id DESC LIMIT ?",
        )
        .bind(device_id)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(row_to_entry).collect())
    }

    pub async fn prune_older_than(&self, cutoff: i64) -> Result<u64, StoreError> {
        let result = sqlx::query("DELETE FROM collection_history WHERE timestamp < ?")
            .bind(cutoff)
            .execute(&self.pool)
            .await?;
        let deleted = result.rows_affected();
        if deleted > 0 {
            debug!("pruned {deleted} history entries older than {cutoff}");
        }
        Ok(deleted)
    }

    pub async fn success_rate(
        &self,
        device_id: &str,
        since: i64,
    ) -> Result<SuccessRate, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT COUNT(*) AS attempts,
                   COALESCE(SUM(success), 0) AS successes
            FROM collection_history
            WHERE device_id = ? AND timestamp >= ?
            "#,
        )
        .bind(device_id)
        .bind(since)
        .fetch_one(&self.pool)
        .await?;

        let attempts: i64 = row.get("attempts");
        let successes: i64 = row.get("successes");
        let rate = if attempts > 0 { Some(successes as f64 / attempts as f64) } else { None };
        Ok(SuccessRate { attempts, successes, rate })
    }
}

fn row_to_entry(row: sqlx::sqlite::SqliteRow) -> CollectionHistoryEntry {
    let trigger: String = row.get("trigger_source");
    CollectionHistoryEntry {
        device_id: row.get("device_id"),
        success: row.get("success"),
        error: row.get("error"),
        duration_ms: row.get("duration_ms"),
        trigger: TriggerSource::parse(&trigger),
        timestamp: row.get("timestamp"),
    }
}
