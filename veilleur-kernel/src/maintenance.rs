/**
 * MAINTENANCE SERVICE - Entretien périodique du store SQLite
 *
 * RÔLE :
 * Deux cadences volontairement découplées : le checkpoint WAL est bon
 * marché et tourne souvent pour borner la croissance du log ; l'optimize
 * (stats du query planner + rétention) est plus lourd et plus rare.
 * Pas de VACUUM : récupérer l'espace exigerait un verrou exclusif qui
 * bloquerait lecteurs et collecte sur un service au long cours.
 *
 * Tout échec de maintenance est loggé et non fatal : la prochaine
 * échéance repart proprement.
 */
use crate::config::MaintenanceConf;
use crate::history::HistoryStore;
use crate::state::{new_state, Shared};
use crate::store::{CheckpointReport, SampleStore, StoreError};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use time::OffsetDateTime;
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Above this many frames left in the WAL after a checkpoint, the
/// checkpoint interval is probably too long.
const WAL_FRAME_HIGH_WATER: i64 = 10_000;

#[derive(Clone)]
pub struct MaintenanceService {
    store: Arc<SampleStore>,
    history: Arc<HistoryStore>,
    conf: MaintenanceConf,
    active: Arc<AtomicBool>,
    stop_tx: Shared<Option<watch::Sender<bool>>>,
}

impl MaintenanceService {
    pub fn new(store: Arc<SampleStore>, history: Arc<HistoryStore>, conf: MaintenanceConf) -> Self {
        Self {
            store,
            history,
            conf,
            active: Arc::new(AtomicBool::new(false)),
            stop_tx: new_state(None),
        }
    }

    /// Checkpoints once immediately, then arms the two independent timers.
    pub async fn start(&self, checkpoint_hours: u64, optimize_hours: u64) {
        if self.active.swap(true, Ordering::SeqCst) {
            debug!("maintenance already active");
            return;
        }

        match self.trigger_checkpoint().await {
            Ok(report) => info!(
                "startup checkpoint: {} frames flushed, {} left in log",
                report.frames_checkpointed, report.frames_remaining
            ),
            Err(e) => warn!("startup checkpoint failed: {e}"),
        }

        let (tx, rx) = watch::channel(false);
        *self.stop_tx.lock() = Some(tx);

        let checkpoint_period = Duration::from_secs(checkpoint_hours.max(1) * 3600);
        let optimize_period = Duration::from_secs(optimize_hours.max(1) * 3600);
        info!(
            "maintenance armed (checkpoint every {checkpoint_hours}h, optimize every {optimize_hours}h)"
        );

        {
            let service = self.clone();
            let mut rx = rx.clone();
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(checkpoint_period);
                ticker.tick().await; // le tick immédiat, déjà fait au start
                loop {
                    tokio::select! {
                        _ = ticker.tick() => {
                            match service.trigger_checkpoint().await {
                                Ok(report) => debug!(
                                    "checkpoint: {} frames flushed, {} left",
                                    report.frames_checkpointed, report.frames_remaining
                                ),
                                Err(e) => warn!("scheduled checkpoint failed: {e}"),
                            }
                        }
                        _ = rx.changed() => break,
                    }
                }
            });
        }

        {
            let service = self.clone();
            let mut rx = rx;
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(optimize_period);
                ticker.tick().await;
                loop {
                    tokio::select! {
                        _ = ticker.tick() => {
                            if let Err(e) = service.trigger_optimize().await {
                                warn!("scheduled optimize failed: {e}");
                            }
                        }
                        _ = rx.changed() => break,
                    }
                }
            });
        }
    }

    pub fn stop(&self) {
        let tx = self.stop_tx.lock().take();
        if let Some(tx) = tx {
            let _ = tx.send(true);
        }
        if self.active.swap(false, Ordering::SeqCst) {
            info!("maintenance stopped");
        }
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    /// One WAL checkpoint. A large leftover log is a warning, not an error.
    pub async fn trigger_checkpoint(&self) -> Result<CheckpointReport, StoreError> {
        let report = self.store.wal_checkpoint().await?;
        if report.frames_remaining > WAL_FRAME_HIGH_WATER {
            warn!(
                "{} frames still in the WAL after checkpoint, consider a shorter checkpoint interval",
                report.frames_remaining
            );
        }
        Ok(report)
    }

    /// Statistics refresh plus retention pruning of samples and history.
    pub async fn trigger_optimize(&self) -> Result<(), StoreError> {
        self.store.optimize().await?;

        let now = OffsetDateTime::now_utc().unix_timestamp();
        let sample_cutoff = now - (self.conf.sample_retention_days as i64) * 86_400;
        let history_cutoff = now - (self.conf.history_retention_days as i64) * 86_400;

        let samples = self.store.delete_older_than(sample_cutoff).await?;
        let entries = self.history.prune_older_than(history_cutoff).await?;
        info!("optimize done: pruned {samples} samples and {entries} history entries");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{CollectionHistoryEntry, MetricsSample, TriggerSource};

    async fn service_with_file_store() -> (MaintenanceService, Arc<SampleStore>, tempfile::TempDir)
    {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(SampleStore::open(dir.path().join("test.db")).await.unwrap());
        let history = Arc::new(HistoryStore::new(store.pool().clone()));
        let conf = MaintenanceConf {
            checkpoint_hours: 6,
            optimize_hours: 24,
            sample_retention_days: 1,
            history_retention_days: 1,
        };
        (MaintenanceService::new(store.clone(), history, conf), store, dir)
    }

    #[tokio::test]
    async fn checkpoint_reports_flushed_frames() {
        let (service, store, _dir) = service_with_file_store().await;
        for ts in 0..20 {
            store.insert(&MetricsSample::empty("d1", ts)).await.unwrap();
        }

        let report = service.trigger_checkpoint().await.unwrap();
        assert!(report.frames_checkpointed >= 0);
        // TRUNCATE leaves an empty log when no reader blocks it.
        assert_eq!(report.frames_remaining, 0);
    }

    #[tokio::test]
    async fn optimize_prunes_by_retention() {
        let (service, store, _dir) = service_with_file_store().await;
        let history = HistoryStore::new(store.pool().clone());
        let now = OffsetDateTime::now_utc().unix_timestamp();

        store.insert(&MetricsSample::empty("d1", now - 3 * 86_400)).await.unwrap();
        store.insert(&MetricsSample::empty("d1", now)).await.unwrap();
        history
            .append(&CollectionHistoryEntry {
                device_id: "d1".into(),
                success: true,
                error: None,
                duration_ms: 1,
                trigger: TriggerSource::Scheduler,
                timestamp: now - 3 * 86_400,
            })
            .await
            .unwrap();

        service.trigger_optimize().await.unwrap();

        let remaining = store.range_raw("d1", 0, now + 1).await.unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].timestamp, now);
        assert!(history.recent("d1", 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn start_and_stop_toggle_activity() {
        let (service, _store, _dir) = service_with_file_store().await;
        assert!(!service.is_active());

        service.start(6, 24).await;
        assert!(service.is_active());

        // Reentrant start is a no-op.
        service.start(6, 24).await;
        assert!(service.is_active());

        service.stop();
        assert!(!service.is_active());
        // Idempotent.
        service.stop();
        assert!(!service.is_active());
    }
}
