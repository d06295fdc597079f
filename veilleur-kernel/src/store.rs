/**
 * SAMPLE STORE - Persistance time-series des métriques en SQLite
 *
 * RÔLE :
 * Stockage durable des échantillons de métriques + moteur d'agrégation.
 * Résolution adaptative (brut / horaire / journalier) selon la fenêtre
 * demandée, intégration trapézoïdale de l'énergie, statistiques puissance.
 *
 * FONCTIONNEMENT :
 * - Pool SQLite en mode WAL (lecteurs concurrents pendant la collecte)
 * - Schéma versionné (table schema_version)
 * - Rétention par suppression dure, déclenchée par la maintenance
 */
use crate::models::MetricsSample;
use serde::Serialize;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use sqlx::Row;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, info, warn};

const SCHEMA_VERSION: i64 = 1;

/// Spans at or below this return raw samples (48 h).
const RAW_SPAN_MAX_SECS: i64 = 48 * 3600;
/// Spans at or below this (and above the raw bound) return hourly buckets (30 d).
const HOURLY_SPAN_MAX_SECS: i64 = 30 * 86400;

const HOUR_SECS: i64 = 3600;
const DAY_SECS: i64 = 86400;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("invalid database path: {0}")]
    InvalidPath(String),
}

/// Durable time-series store for metrics samples.
#[derive(Clone)]
pub struct SampleStore {
    pool: SqlitePool,
}

/// One per-hour bucket: arithmetic mean of every numeric field.
#[derive(Debug, Clone, Serialize)]
pub struct HourlyBucket {
    pub bucket_ts: i64,
    pub cpu_percent: Option<f64>,
    pub ram_used_gb: Option<f64>,
    pub ram_total_gb: Option<f64>,
    pub ram_percent: Option<f64>,
    pub gpu_percent: Option<f64>,
    pub gpu_memory_used_mb: Option<f64>,
    pub gpu_memory_total_mb: Option<f64>,
    pub network_rx_mbps: Option<f64>,
    pub network_tx_mbps: Option<f64>,
    pub power_consumption_w: Option<f64>,
    pub sample_count: i64,
}

/// Mean and max of one field over a day.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct FieldStats {
    pub avg: Option<f64>,
    pub max: Option<f64>,
}

/// One per-day bucket: mean and max per field, plus the day's energy total.
#[derive(Debug, Clone, Serialize)]
pub struct DailyBucket {
    pub bucket_ts: i64,
    pub cpu_percent: FieldStats,
    pub ram_used_gb: FieldStats,
    pub ram_total_gb: FieldStats,
    pub ram_percent: FieldStats,
    pub gpu_percent: FieldStats,
    pub gpu_memory_used_mb: FieldStats,
    pub gpu_memory_total_mb: FieldStats,
    pub network_rx_mbps: FieldStats,
    pub network_tx_mbps: FieldStats,
    pub power_consumption_w: FieldStats,
    pub energy_kwh: f64,
    pub sample_count: i64,
}

/// Result of an adaptive-resolution query.
#[derive(Debug, Serialize)]
#[serde(tag = "resolution", content = "points", rename_all = "lowercase")]
pub enum AdaptiveSeries {
    Raw(Vec<MetricsSample>),
    Hourly(Vec<HourlyBucket>),
    Daily(Vec<DailyBucket>),
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct EnergySummary {
    pub kwh: f64,
    pub sample_count: i64,
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct PowerStats {
    pub avg: Option<f64>,
    pub max: Option<f64>,
    pub min: Option<f64>,
    pub sample_count: i64,
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct CheckpointReport {
    pub frames_checkpointed: i64,
    pub frames_remaining: i64,
}

/// Trapezoidal integration of a power series, in kWh.
/// Fewer than two points integrate to zero; that is data absence, not an error.
pub fn trapezoid_kwh(series: &[(i64, f64)]) -> f64 {
    let mut wh = 0.0;
    for pair in series.windows(2) {
        let (t1, p1) = pair[0];
        let (t2, p2) = pair[1];
        if t2 <= t1 {
            continue;
        }
        wh += ((p1 + p2) / 2.0) * ((t2 - t1) as f64 / 3600.0);
    }
    wh / 1000.0
}

impl SampleStore {
    /// Open (or create) the store at `db_path` and bootstrap the schema.
    pub async fn open(db_path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let db_path = db_path.as_ref();

        if db_path != Path::new(":memory:") {
            if let Some(parent) = db_path.parent() {
                tokio::fs::create_dir_all(parent)
                    .await
                    .map_err(|e| StoreError::InvalidPath(format!("{}: {e}", parent.display())))?;
            }
        }

        let path_str = db_path
            .to_str()
            .ok_or_else(|| StoreError::InvalidPath(format!("{db_path:?}")))?;

        let options = SqliteConnectOptions::from_str(path_str)?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(5))
            .foreign_keys(true);

        let max_connections = if path_str == ":memory:" { 1 } else { 5 };
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect_with(options)
            .await?;

        let store = Self { pool };
        store.run_migrations().await?;
        info!("sample store ready at {path_str}");
        Ok(store)
    }

    /// In-memory store for tests. Single connection: every `:memory:`
    /// connection is its own database.
    pub async fn new_in_memory() -> Result<Self, StoreError> {
        Self::open(":memory:").await
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    async fn run_migrations(&self) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS schema_version (
                version INTEGER PRIMARY KEY
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        let current: Option<i64> = sqlx::query_scalar("SELECT version FROM schema_version LIMIT 1")
            .fetch_optional(&self.pool)
            .await?;
        let current = current.unwrap_or(0);

        if current >= SCHEMA_VERSION {
            debug!("schema up to date (version {current})");
            return Ok(());
        }

        info!("migrating schema from version {current} to {SCHEMA_VERSION}");
        if current < 1 {
            self.migrate_to_v1().await?;
        }

        sqlx::query("DELETE FROM schema_version").execute(&self.pool).await?;
        sqlx::query("INSERT INTO schema_version (version) VALUES (?)")
            .bind(SCHEMA_VERSION)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn migrate_to_v1(&self) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS devices (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                address TEXT,
                mac TEXT,
                ssh_user TEXT,
                ssh_password TEXT,
                ssh_port INTEGER NOT NULL DEFAULT 22,
                power_idle_w REAL NOT NULL DEFAULT 5.0,
                power_max_w REAL NOT NULL DEFAULT 150.0,
                power_alert_w REAL,
                created_at INTEGER NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        // Pas de contrainte d'unicité sur (device_id, timestamp) : deux
        // échantillons au même instant sont tolérés et comptés tous les deux.
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS metrics_samples (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                device_id TEXT NOT NULL,
                timestamp INTEGER NOT NULL,
                cpu_percent REAL,
                ram_used_gb REAL,
                ram_total_gb REAL,
                ram_percent REAL,
                gpu_percent REAL,
                gpu_memory_used_mb REAL,
                gpu_memory_total_mb REAL,
                network_rx_mbps REAL,
                network_tx_mbps REAL,
                power_consumption_w REAL,
                power_estimated INTEGER NOT NULL DEFAULT 1
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_samples_device_ts
             ON metrics_samples (device_id, timestamp)",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS collection_history (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                device_id TEXT NOT NULL,
                success INTEGER NOT NULL,
                error TEXT,
                duration_ms INTEGER NOT NULL,
                trigger_source TEXT NOT NULL,
                timestamp INTEGER NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_history_device_ts
             ON collection_history (device_id, timestamp)",
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    // ========================
    // Writes
    // ========================

    pub async fn insert(&self, sample: &MetricsSample) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO metrics_samples (
                device_id, timestamp,
                cpu_percent, ram_used_gb, ram_total_gb, ram_percent,
                gpu_percent, gpu_memory_used_mb, gpu_memory_total_mb,
                network_rx_mbps, network_tx_mbps,
                power_consumption_w, power_estimated
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&sample.device_id)
        .bind(sample.timestamp)
        .bind(sample.cpu_percent)
        .bind(sample.ram_used_gb)
        .bind(sample.ram_total_gb)
        .bind(sample.ram_percent)
        .bind(sample.gpu_percent)
        .bind(sample.gpu_memory_used_mb)
        .bind(sample.gpu_memory_total_mb)
        .bind(sample.network_rx_mbps)
        .bind(sample.network_tx_mbps)
        .bind(sample.power_consumption_w)
        .bind(sample.power_estimated)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Hard delete of every sample strictly older than `cutoff`.
    pub async fn delete_older_than(&self, cutoff: i64) -> Result<u64, StoreError> {
        let result = sqlx::query("DELETE FROM metrics_samples WHERE timestamp < ?")
            .bind(cutoff)
            .execute(&self.pool)
            .await?;
        let deleted = result.rows_affected();
        if deleted > 0 {
            debug!("pruned {deleted} samples older than {cutoff}");
        }
        Ok(deleted)
    }

    // ========================
    // Queries
    // ========================

    pub async fn latest(&self, device_id: &str) -> Result<Option<MetricsSample>, StoreError> {
        let row = sqlx::query(
            "SELECT * FROM metrics_samples WHERE device_id = ?
             ORDER BY timestamp DESC, id DESC LIMIT 1",
        )
        .bind(device_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(row_to_sample))
    }

    pub async fn range_raw(
        &self,
        device_id: &str,
        start: i64,
        end: i64,
    ) -> Result<Vec<MetricsSample>, StoreError> {
        let rows = sqlx::query(
            "SELECT * FROM metrics_samples
             WHERE device_id = ? AND timestamp >= ? AND timestamp <= ?
             ORDER BY timestamp ASC",
        )
        .bind(device_id)
        .bind(start)
        .bind(end)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(row_to_sample).collect())
    }

    /// Per-hour buckets (timestamp floored to the hour), mean per field.
    pub async fn range_hourly(
        &self,
        device_id: &str,
        start: i64,
        end: i64,
    ) -> Result<Vec<HourlyBucket>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT
                (timestamp / ?) * ? AS bucket_ts,
                AVG(cpu_percent) AS cpu_percent,
                AVG(ram_used_gb) AS ram_used_gb,
                AVG(ram_total_gb) AS ram_total_gb,
                AVG(ram_percent) AS ram_percent,
                AVG(gpu_percent) AS gpu_percent,
                AVG(gpu_memory_used_mb) AS gpu_memory_used_mb,
                AVG(gpu_memory_total_mb) AS gpu_memory_total_mb,
                AVG(network_rx_mbps) AS network_rx_mbps,
                AVG(network_tx_mbps) AS network_tx_mbps,
                AVG(power_consumption_w) AS power_consumption_w,
                COUNT(*) AS sample_count
            FROM metrics_samples
            WHERE device_id = ? AND timestamp >= ? AND timestamp <= ?
            GROUP BY bucket_ts
            ORDER BY bucket_ts
            "#,
        )
        .bind(HOUR_SECS)
        .bind(HOUR_SECS)
        .bind(device_id)
        .bind(start)
        .bind(end)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| HourlyBucket {
                bucket_ts: row.get("bucket_ts"),
                cpu_percent: row.get("cpu_percent"),
                ram_used_gb: row.get("ram_used_gb"),
                ram_total_gb: row.get("ram_total_gb"),
                ram_percent: row.get("ram_percent"),
                gpu_percent: row.get("gpu_percent"),
                gpu_memory_used_mb: row.get("gpu_memory_used_mb"),
                gpu_memory_total_mb: row.get("gpu_memory_total_mb"),
                network_rx_mbps: row.get("network_rx_mbps"),
                network_tx_mbps: row.get("network_tx_mbps"),
                power_consumption_w: row.get("power_consumption_w"),
                sample_count: row.get("sample_count"),
            })
            .collect())
    }

    /// Per-day buckets with mean and max per field, plus the day's energy.
    ///
    /// The power series for the whole span is fetched once and integrated
    /// per day in a single pass; only sample pairs falling inside the same
    /// day contribute to that day's total.
    pub async fn range_daily(
        &self,
        device_id: &str,
        start: i64,
        end: i64,
    ) -> Result<Vec<DailyBucket>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT
                (timestamp / ?) * ? AS bucket_ts,
                AVG(cpu_percent) AS cpu_avg, MAX(cpu_percent) AS cpu_max,
                AVG(ram_used_gb) AS ram_used_avg, MAX(ram_used_gb) AS ram_used_max,
                AVG(ram_total_gb) AS ram_total_avg, MAX(ram_total_gb) AS ram_total_max,
                AVG(ram_percent) AS ram_pct_avg, MAX(ram_percent) AS ram_pct_max,
                AVG(gpu_percent) AS gpu_avg, MAX(gpu_percent) AS gpu_max,
                AVG(gpu_memory_used_mb) AS gpu_mem_used_avg, MAX(gpu_memory_used_mb) AS gpu_mem_used_max,
                AVG(gpu_memory_total_mb) AS gpu_mem_total_avg, MAX(gpu_memory_total_mb) AS gpu_mem_total_max,
                AVG(network_rx_mbps) AS net_rx_avg, MAX(network_rx_mbps) AS net_rx_max,
                AVG(network_tx_mbps) AS net_tx_avg, MAX(network_tx_mbps) AS net_tx_max,
                AVG(power_consumption_w) AS power_avg, MAX(power_consumption_w) AS power_max,
                COUNT(*) AS sample_count
            FROM metrics_samples
            WHERE device_id = ? AND timestamp >= ? AND timestamp <= ?
            GROUP BY bucket_ts
            ORDER BY bucket_ts
            "#,
        )
        .bind(DAY_SECS)
        .bind(DAY_SECS)
        .bind(device_id)
        .bind(start)
        .bind(end)
        .fetch_all(&self.pool)
        .await?;

        let power_series = self.power_series(device_id, start, end).await?;
        let energy_by_day = energy_per_day(&power_series);

        Ok(rows
            .into_iter()
            .map(|row| {
                let bucket_ts: i64 = row.get("bucket_ts");
                DailyBucket {
                    bucket_ts,
                    cpu_percent: stats(&row, "cpu_avg", "cpu_max"),
                    ram_used_gb: stats(&row, "ram_used_avg", "ram_used_max"),
                    ram_total_gb: stats(&row, "ram_total_avg", "ram_total_max"),
                    ram_percent: stats(&row, "ram_pct_avg", "ram_pct_max"),
                    gpu_percent: stats(&row, "gpu_avg", "gpu_max"),
                    gpu_memory_used_mb: stats(&row, "gpu_mem_used_avg", "gpu_mem_used_max"),
                    gpu_memory_total_mb: stats(&row, "gpu_mem_total_avg", "gpu_mem_total_max"),
                    network_rx_mbps: stats(&row, "net_rx_avg", "net_rx_max"),
                    network_tx_mbps: stats(&row, "net_tx_avg", "net_tx_max"),
                    power_consumption_w: stats(&row, "power_avg", "power_max"),
                    energy_kwh: energy_by_day
                        .iter()
                        .find(|(day, _)| *day == bucket_ts)
                        .map(|(_, kwh)| *kwh)
                        .unwrap_or(0.0),
                    sample_count: row.get("sample_count"),
                }
            })
            .collect())
    }

    /// Resolution chosen from the span, inclusive at the lower tier:
    /// exactly 48 h stays raw, exactly 30 d stays hourly.
    pub async fn adaptive_range(
        &self,
        device_id: &str,
        start: i64,
        end: i64,
    ) -> Result<AdaptiveSeries, StoreError> {
        let span = end - start;
        if span <= RAW_SPAN_MAX_SECS {
            Ok(AdaptiveSeries::Raw(self.range_raw(device_id, start, end).await?))
        } else if span <= HOURLY_SPAN_MAX_SECS {
            Ok(AdaptiveSeries::Hourly(self.range_hourly(device_id, start, end).await?))
        } else {
            Ok(AdaptiveSeries::Daily(self.range_daily(device_id, start, end).await?))
        }
    }

    /// Total energy over the window, trapezoidal rule over the power series.
    pub async fn energy_consumption(
        &self,
        device_id: &str,
        start: i64,
        end: i64,
    ) -> Result<EnergySummary, StoreError> {
        let series = self.power_series(device_id, start, end).await?;
        Ok(EnergySummary {
            kwh: trapezoid_kwh(&series),
            sample_count: series.len() as i64,
        })
    }

    pub async fn power_stats(
        &self,
        device_id: &str,
        start: i64,
        end: i64,
    ) -> Result<PowerStats, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT
                AVG(power_consumption_w) AS avg_w,
                MAX(power_consumption_w) AS max_w,
                MIN(power_consumption_w) AS min_w,
                COUNT(power_consumption_w) AS sample_count
            FROM metrics_samples
            WHERE device_id = ? AND timestamp >= ? AND timestamp <= ?
            "#,
        )
        .bind(device_id)
        .bind(start)
        .bind(end)
        .fetch_one(&self.pool)
        .await?;

        Ok(PowerStats {
            avg: row.get("avg_w"),
            max: row.get("max_w"),
            min: row.get("min_w"),
            sample_count: row.get("sample_count"),
        })
    }

    async fn power_series(
        &self,
        device_id: &str,
        start: i64,
        end: i64,
    ) -> Result<Vec<(i64, f64)>, StoreError> {
        let rows = sqlx::query(
            "SELECT timestamp, power_consumption_w FROM metrics_samples
             WHERE device_id = ? AND timestamp >= ? AND timestamp <= ?
               AND power_consumption_w IS NOT NULL
             ORDER BY timestamp ASC",
        )
        .bind(device_id)
        .bind(start)
        .bind(end)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| (row.get::<i64, _>("timestamp"), row.get::<f64, _>("power_consumption_w")))
            .collect())
    }

    // ========================
    // Maintenance primitives
    // ========================

    /// Flush WAL content into the main database file.
    pub async fn wal_checkpoint(&self) -> Result<CheckpointReport, StoreError> {
        let row = sqlx::query("PRAGMA wal_checkpoint(TRUNCATE)").fetch_one(&self.pool).await?;
        // Colonnes: busy, log (frames dans le WAL), checkpointed.
        let busy: i64 = row.get(0);
        let log: i64 = row.get(1);
        let checkpointed: i64 = row.get(2);

        if busy != 0 {
            warn!("wal checkpoint returned busy, a reader held the log");
        }

        let frames_checkpointed = checkpointed.max(0);
        let frames_remaining = (log.max(0) - frames_checkpointed).max(0);
        Ok(CheckpointReport { frames_checkpointed, frames_remaining })
    }

    /// Refresh the query planner's statistics. Intentionally no VACUUM:
    /// reclaiming space takes an exclusive lock and would stall readers.
    pub async fn optimize(&self) -> Result<(), StoreError> {
        sqlx::query("PRAGMA optimize").execute(&self.pool).await?;
        sqlx::query("ANALYZE").execute(&self.pool).await?;
        Ok(())
    }
}

fn stats(row: &sqlx::sqlite::SqliteRow, avg_col: &str, max_col: &str) -> FieldStats {
    FieldStats { avg: row.get(avg_col), max: row.get(max_col) }
}

fn row_to_sample(row: sqlx::sqlite::SqliteRow) -> MetricsSample {
    MetricsSample {
        device_id: row.get("device_id"),
        timestamp: row.get("timestamp"),
        cpu_percent: row.get("cpu_percent"),
        ram_used_gb: row.get("ram_used_gb"),
        ram_total_gb: row.get("ram_total_gb"),
        ram_percent: row.get("ram_percent"),
        gpu_percent: row.get("gpu_percent"),
        gpu_memory_used_mb: row.get("gpu_memory_used_mb"),
        gpu_memory_total_mb: row.get("gpu_memory_total_mb"),
        network_rx_mbps: row.get("network_rx_mbps"),
        network_tx_mbps: row.get("network_tx_mbps"),
        power_consumption_w: row.get("power_consumption_w"),
        power_estimated: row.get("power_estimated"),
    }
}

/// Groups consecutive power-sample pairs by day of the earlier sample.
/// A pair straddling midnight contributes to neither day, matching the
/// day-window-scoped integration.
fn energy_per_day(series: &[(i64, f64)]) -> Vec<(i64, f64)> {
    let mut days: Vec<(i64, f64)> = Vec::new();
    for pair in series.windows(2) {
        let (t1, p1) = pair[0];
        let (t2, p2) = pair[1];
        if t2 <= t1 {
            continue;
        }
        let day1 = (t1 / DAY_SECS) * DAY_SECS;
        let day2 = (t2 / DAY_SECS) * DAY_SECS;
        if day1 != day2 {
            continue;
        }
        let wh = ((p1 + p2) / 2.0) * ((t2 - t1) as f64 / 3600.0);
        match days.last_mut() {
            Some((day, total)) if *day == day1 => *total += wh / 1000.0,
            _ => days.push((day1, wh / 1000.0)),
        }
    }
    days
}
