/**
 * METRICS SCHEDULER - Orchestration des cycles de collecte
 *
 * RÔLE :
 * Cadence la collecte : sélection des appareils éligibles, sonde de
 * vivacité en parallèle, collecte par batchs bornés, écriture store +
 * historique, notification best-effort.
 *
 * FONCTIONNEMENT :
 * - Timer auto-réarmé (sleep + canal watch d'arrêt) : le prochain tick
 *   n'est armé qu'après la fin du cycle, le recouvrement est impossible
 * - Garde anti-réentrance : un AtomicBool en compare-and-swap, l'unique
 *   exclusion mutuelle du système (grain cycle entier)
 * - stop() n'interrompt jamais un cycle en cours, il empêche les suivants
 */
use crate::collector::MetricsCollector;
use crate::config::CollectionConf;
use crate::history::HistoryStore;
use crate::models::{CollectionHistoryEntry, Device, MetricsSample, TriggerSource};
use crate::notify::Notifier;
use crate::probe::LivenessProbe;
use crate::registry::DeviceRegistry;
use crate::state::{new_state, SchedulerState, Shared};
use crate::store::SampleStore;
use futures::future::join_all;
use serde::Deserialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use time::OffsetDateTime;
use tokio::sync::watch;
use tracing::{debug, info, warn};

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub enabled: bool,
    pub interval: Duration,
    pub max_concurrent: usize,
}

impl From<&CollectionConf> for SchedulerConfig {
    fn from(c: &CollectionConf) -> Self {
        Self {
            enabled: c.enabled,
            interval: Duration::from_secs(c.interval_secs),
            max_concurrent: c.max_concurrent,
        }
    }
}

/// Partial configuration merge; absent fields keep their current value.
/// Values are clamped to the same bounds as the configuration boundary.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SchedulerConfigPatch {
    pub enabled: Option<bool>,
    pub interval_secs: Option<u64>,
    pub max_concurrent: Option<usize>,
}

#[derive(Clone)]
pub struct MetricsScheduler {
    registry: Arc<DeviceRegistry>,
    store: Arc<SampleStore>,
    history: Arc<HistoryStore>,
    collector: Arc<dyn MetricsCollector>,
    probe: Arc<dyn LivenessProbe>,
    notifier: Option<Arc<Notifier>>,
    config: Shared<SchedulerConfig>,
    state: Shared<SchedulerState>,
    /// Reentrancy guard: at most one cycle body executes at a time.
    cycle_guard: Arc<AtomicBool>,
    stop_tx: Shared<Option<watch::Sender<bool>>>,
}

impl MetricsScheduler {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        registry: Arc<DeviceRegistry>,
        store: Arc<SampleStore>,
        history: Arc<HistoryStore>,
        collector: Arc<dyn MetricsCollector>,
        probe: Arc<dyn LivenessProbe>,
        notifier: Option<Arc<Notifier>>,
        config: SchedulerConfig,
    ) -> Self {
        Self {
            registry,
            store,
            history,
            collector,
            probe,
            notifier,
            config: new_state(config),
            state: new_state(SchedulerState::new()),
            cycle_guard: Arc::new(AtomicBool::new(false)),
            stop_tx: new_state(None),
        }
    }

    /// No-op when already running or disabled; otherwise arms the timer.
    pub fn start(&self) {
        {
            let cfg = self.config.lock();
            let mut st = self.state.lock();
            if st.running {
                debug!("scheduler already running");
                return;
            }
            if !cfg.enabled {
                info!("collection disabled, scheduler not started");
                return;
            }
            st.running = true;
        }

        let (tx, mut rx) = watch::channel(false);
        *self.stop_tx.lock() = Some(tx);

        let scheduler = self.clone();
        tokio::spawn(async move {
            info!(
                "scheduler started (interval {}s)",
                scheduler.config.lock().interval.as_secs()
            );
            loop {
                let interval = scheduler.config.lock().interval;
                {
                    let mut st = scheduler.state.lock();
                    if !st.running {
                        break;
                    }
                    st.next_run =
                        Some(OffsetDateTime::now_utc().unix_timestamp() + interval.as_secs() as i64);
                }

                tokio::select! {
                    _ = tokio::time::sleep(interval) => {
                        scheduler.run_now(TriggerSource::Scheduler).await;
                    }
                    _ = rx.changed() => break,
                }
            }
            debug!("scheduler timer task exited");
        });
    }

    /// Prevents future cycles. An in-progress cycle runs to completion.
    /// Idempotent.
    pub fn stop(&self) {
        let tx = self.stop_tx.lock().take();
        if let Some(tx) = tx {
            let _ = tx.send(true);
        }
        let mut st = self.state.lock();
        if st.running {
            info!("scheduler stopped");
        }
        st.running = false;
        st.next_run = None;
    }

    /// Stops, merges the patch, and restarts only if the scheduler was
    /// running and collection remains enabled.
    pub fn update_config(&self, patch: SchedulerConfigPatch) {
        let was_running = self.state.lock().running;
        self.stop();

        let enabled = {
            let mut cfg = self.config.lock();
            if let Some(enabled) = patch.enabled {
                cfg.enabled = enabled;
            }
            if let Some(secs) = patch.interval_secs {
                cfg.interval = Duration::from_secs(secs.clamp(60, 3600));
            }
            if let Some(mc) = patch.max_concurrent {
                cfg.max_concurrent = mc.clamp(1, 10);
            }
            info!(
                "scheduler config updated (enabled={}, interval={}s, max_concurrent={})",
                cfg.enabled,
                cfg.interval.as_secs(),
                cfg.max_concurrent
            );
            cfg.enabled
        };

        if was_running && enabled {
            self.start();
        }
    }

    pub fn state(&self) -> SchedulerState {
        self.state.lock().clone()
    }

    pub fn config(&self) -> SchedulerConfig {
        self.config.lock().clone()
    }

    /// Runs one cycle immediately, independent of the timer. A reentrant
    /// trigger is dropped, not queued: the guard guarantees at most one
    /// concurrent cycle.
    pub async fn run_now(&self, trigger: TriggerSource) {
        if self
            .cycle_guard
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            info!("collection cycle already in flight, {} trigger dropped", trigger.as_str());
            return;
        }

        self.run_cycle(trigger).await;

        self.state.lock().in_flight.clear();
        self.cycle_guard.store(false, Ordering::SeqCst);
    }

    async fn run_cycle(&self, trigger: TriggerSource) {
        {
            let mut st = self.state.lock();
            st.last_run = Some(OffsetDateTime::now_utc().unix_timestamp());
            st.total_collections += 1;
        }

        let devices = match self.registry.list_eligible().await {
            Ok(devices) => devices,
            Err(e) => {
                warn!("eligible-device query failed, cycle abandoned: {e}");
                return;
            }
        };
        if devices.is_empty() {
            debug!("no eligible devices, nothing to collect");
            return;
        }

        // Sonde de vivacité en parallèle. Toute erreur = offline.
        let checks = join_all(devices.iter().map(|device| async {
            let address = device.address.as_deref().unwrap_or_default();
            match self.probe.check(address).await {
                Ok(alive) => alive,
                Err(e) => {
                    debug!("liveness probe for {} failed, treated as offline: {e}", device.id);
                    false
                }
            }
        }))
        .await;

        let online: Vec<Device> = devices
            .into_iter()
            .zip(checks)
            .filter_map(|(device, alive)| alive.then_some(device))
            .collect();
        if online.is_empty() {
            debug!("no device online this cycle");
            return;
        }

        let max_concurrent = self.config.lock().max_concurrent.max(1);
        info!(
            "collecting from {} device(s) in batches of {} ({})",
            online.len(),
            max_concurrent,
            trigger.as_str()
        );

        // Batchs consécutifs : le batch N+1 attend que le batch N soit
        // entièrement retombé. Plafond dur de sessions SSH ouvertes.
        for batch in online.chunks(max_concurrent) {
            join_all(batch.iter().map(|device| self.collect_device(device, trigger))).await;
        }
    }

    async fn collect_device(&self, device: &Device, trigger: TriggerSource) {
        self.state.lock().in_flight.insert(device.id.clone());

        let started = Instant::now();
        let collected = self.collector.collect(device).await;
        let duration_ms = started.elapsed().as_millis() as i64;
        let timestamp = OffsetDateTime::now_utc().unix_timestamp();

        // Un insert raté convertit la tentative en échec : il y a toujours
        // exactement une entrée d'historique par appareil tenté.
        let outcome: Result<MetricsSample, String> = match collected {
            Ok(sample) => match self.store.insert(&sample).await {
                Ok(()) => Ok(sample),
                Err(e) => Err(format!("sample persistence failed: {e}")),
            },
            Err(e) => Err(e.to_string()),
        };

        let entry = CollectionHistoryEntry {
            device_id: device.id.clone(),
            success: outcome.is_ok(),
            error: outcome.as_ref().err().cloned(),
            duration_ms,
            trigger,
            timestamp,
        };
        if let Err(e) = self.history.append(&entry).await {
            warn!("history append failed for {}: {e}", device.id);
        }

        match outcome {
            Ok(sample) => {
                self.state.lock().success_count += 1;
                debug!("collected {} in {duration_ms}ms", device.name);
                self.maybe_notify(device, &sample).await;
            }
            Err(msg) => {
                self.state.lock().failure_count += 1;
                warn!("collection failed for {} ({}): {msg}", device.name, device.id);
            }
        }

        self.state.lock().in_flight.remove(&device.id);
    }

    /// Try, log, ignore: a notification failure never fails the collection
    /// that produced it, but it stays visible in the logs.
    async fn maybe_notify(&self, device: &Device, sample: &MetricsSample) {
        let Some(notifier) = &self.notifier else { return };
        let (Some(watts), Some(threshold)) = (sample.power_consumption_w, device.power_alert_w)
        else {
            return;
        };
        if watts <= threshold {
            return;
        }
        if let Err(e) = notifier.power_alert(&device.id, &device.name, watts, threshold).await {
            warn!("power alert for {} dropped: {e}", device.id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collector::CollectorError;
    use crate::registry::DeviceSpec;
    use async_trait::async_trait;
    use std::collections::HashSet;
    use std::sync::atomic::AtomicUsize;

    struct FakeCollector {
        delay: Duration,
        fail_devices: HashSet<String>,
        calls: AtomicUsize,
        current: AtomicUsize,
        max_seen: AtomicUsize,
    }

    impl FakeCollector {
        fn new(delay: Duration, fail_devices: &[&str]) -> Arc<Self> {
            Arc::new(Self {
                delay,
                fail_devices: fail_devices.iter().map(|s| s.to_string()).collect(),
                calls: AtomicUsize::new(0),
                current: AtomicUsize::new(0),
                max_seen: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl MetricsCollector for FakeCollector {
        async fn collect(&self, device: &Device) -> Result<MetricsSample, CollectorError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_seen.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            self.current.fetch_sub(1, Ordering::SeqCst);

            if self.fail_devices.contains(&device.name) {
                return Err(CollectorError::Connection("simulated handshake failure".into()));
            }
            let mut sample = MetricsSample::empty(&device.id, 1000);
            sample.cpu_percent = Some(10.0);
            sample.power_consumption_w = Some(20.0);
            Ok(sample)
        }
    }

    struct FakeProbe {
        offline: HashSet<String>,
        erroring: bool,
    }

    impl FakeProbe {
        fn all_online() -> Arc<Self> {
            Arc::new(Self { offline: HashSet::new(), erroring: false })
        }

        fn with_offline(addresses: &[&str]) -> Arc<Self> {
            Arc::new(Self {
                offline: addresses.iter().map(|s| s.to_string()).collect(),
                erroring: false,
            })
        }

        fn erroring() -> Arc<Self> {
            Arc::new(Self { offline: HashSet::new(), erroring: true })
        }
    }

    #[async_trait]
    impl LivenessProbe for FakeProbe {
        async fn check(&self, address: &str) -> anyhow::Result<bool> {
            if self.erroring {
                anyhow::bail!("probe exploded");
            }
            Ok(!self.offline.contains(address))
        }
    }

    struct Harness {
        scheduler: MetricsScheduler,
        registry: Arc<DeviceRegistry>,
        history: Arc<HistoryStore>,
        collector: Arc<FakeCollector>,
    }

    async fn harness(
        collector: Arc<FakeCollector>,
        probe: Arc<dyn LivenessProbe>,
        max_concurrent: usize,
    ) -> Harness {
        let store = Arc::new(SampleStore::new_in_memory().await.unwrap());
        let registry = Arc::new(DeviceRegistry::new(store.pool().clone()));
        let history = Arc::new(HistoryStore::new(store.pool().clone()));
        let config = SchedulerConfig {
            enabled: true,
            interval: Duration::from_secs(300),
            max_concurrent,
        };
        let scheduler = MetricsScheduler::new(
            registry.clone(),
            store,
            history.clone(),
            collector.clone(),
            probe,
            None,
            config,
        );
        Harness { scheduler, registry, history, collector }
    }

    async fn add_device(registry: &DeviceRegistry, name: &str, address: &str) -> Device {
        registry
            .create(DeviceSpec {
                name: name.to_string(),
                address: Some(address.to_string()),
                ssh_user: Some("admin".into()),
                ssh_password: Some("pw".into()),
                ..DeviceSpec::default()
            })
            .await
            .unwrap()
    }

    async fn add_ineligible_device(registry: &DeviceRegistry, name: &str) -> Device {
        registry
            .create(DeviceSpec {
                name: name.to_string(),
                address: Some("10.0.0.9".into()),
                ssh_user: Some("admin".into()),
                ssh_password: None,
                ..DeviceSpec::default()
            })
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn one_history_entry_per_online_device() {
        let collector = FakeCollector::new(Duration::from_millis(5), &["flaky"]);
        let h = harness(collector, FakeProbe::with_offline(&["10.0.0.3"]), 4).await;

        let ok = add_device(&h.registry, "steady", "10.0.0.1").await;
        let failing = add_device(&h.registry, "flaky", "10.0.0.2").await;
        let offline = add_device(&h.registry, "asleep", "10.0.0.3").await;
        let ineligible = add_ineligible_device(&h.registry, "no-creds").await;

        h.scheduler.run_now(TriggerSource::Manual).await;

        // Exactly one entry for each attempted device, success xor failure.
        let ok_entries = h.history.recent(&ok.id, 10).await.unwrap();
        assert_eq!(ok_entries.len(), 1);
        assert!(ok_entries[0].success);
        assert_eq!(ok_entries[0].trigger, TriggerSource::Manual);

        let failed_entries = h.history.recent(&failing.id, 10).await.unwrap();
        assert_eq!(failed_entries.len(), 1);
        assert!(!failed_entries[0].success);
        assert!(failed_entries[0].error.as_deref().unwrap().contains("handshake"));

        // Offline and ineligible devices are never attempted.
        assert!(h.history.recent(&offline.id, 10).await.unwrap().is_empty());
        assert!(h.history.recent(&ineligible.id, 10).await.unwrap().is_empty());
        assert_eq!(h.collector.calls.load(Ordering::SeqCst), 2);

        let state = h.scheduler.state();
        assert_eq!(state.total_collections, 1);
        assert_eq!(state.success_count, 1);
        assert_eq!(state.failure_count, 1);
        assert!(state.in_flight.is_empty());
    }

    #[tokio::test]
    async fn concurrent_sessions_never_exceed_max_concurrent() {
        let collector = FakeCollector::new(Duration::from_millis(30), &[]);
        let h = harness(collector, FakeProbe::all_online(), 2).await;
        for i in 0..5 {
            add_device(&h.registry, &format!("dev-{i}"), &format!("10.0.1.{i}")).await;
        }

        h.scheduler.run_now(TriggerSource::Manual).await;

        assert_eq!(h.collector.calls.load(Ordering::SeqCst), 5);
        assert!(h.collector.max_seen.load(Ordering::SeqCst) <= 2);
    }

    #[tokio::test]
    async fn reentrant_run_now_is_dropped() {
        let collector = FakeCollector::new(Duration::from_millis(150), &[]);
        let h = harness(collector, FakeProbe::all_online(), 4).await;
        let device = add_device(&h.registry, "only", "10.0.2.1").await;

        let first = {
            let scheduler = h.scheduler.clone();
            tokio::spawn(async move { scheduler.run_now(TriggerSource::Scheduler).await })
        };
        // Let the first cycle reach the collector.
        tokio::time::sleep(Duration::from_millis(40)).await;

        let before = h.scheduler.state();
        h.scheduler.run_now(TriggerSource::Ui).await;
        let after = h.scheduler.state();

        // The dropped trigger changed no counters.
        assert_eq!(before.success_count, after.success_count);
        assert_eq!(before.failure_count, after.failure_count);

        first.await.unwrap();

        // And produced no extra history entries.
        let entries = h.history.recent(&device.id, 10).await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(h.scheduler.state().total_collections, 1);
        assert_eq!(h.collector.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn probe_errors_fail_closed() {
        let collector = FakeCollector::new(Duration::from_millis(1), &[]);
        let h = harness(collector, FakeProbe::erroring(), 4).await;
        let device = add_device(&h.registry, "unlucky", "10.0.3.1").await;

        h.scheduler.run_now(TriggerSource::Manual).await;

        assert_eq!(h.collector.calls.load(Ordering::SeqCst), 0);
        assert!(h.history.recent(&device.id, 10).await.unwrap().is_empty());
        // The cycle itself still ran.
        assert_eq!(h.scheduler.state().total_collections, 1);
    }

    #[tokio::test]
    async fn start_is_noop_when_disabled_and_stop_is_idempotent() {
        let collector = FakeCollector::new(Duration::from_millis(1), &[]);
        let h = harness(collector, FakeProbe::all_online(), 2).await;

        h.scheduler.update_config(SchedulerConfigPatch {
            enabled: Some(false),
            ..SchedulerConfigPatch::default()
        });
        h.scheduler.start();
        assert!(!h.scheduler.state().running);

        h.scheduler.stop();
        h.scheduler.stop();
        assert!(!h.scheduler.state().running);
        assert!(h.scheduler.state().next_run.is_none());
    }

    #[tokio::test]
    async fn update_config_restarts_only_a_running_scheduler() {
        let collector = FakeCollector::new(Duration::from_millis(1), &[]);
        let h = harness(collector, FakeProbe::all_online(), 2).await;

        h.scheduler.start();
        assert!(h.scheduler.state().running);

        h.scheduler.update_config(SchedulerConfigPatch {
            interval_secs: Some(120),
            ..SchedulerConfigPatch::default()
        });
        assert!(h.scheduler.state().running);
        assert_eq!(h.scheduler.config().interval, Duration::from_secs(120));

        h.scheduler.stop();
        h.scheduler.update_config(SchedulerConfigPatch {
            interval_secs: Some(180),
            ..SchedulerConfigPatch::default()
        });
        assert!(!h.scheduler.state().running);

        // Patch values are clamped to the configuration bounds.
        h.scheduler.update_config(SchedulerConfigPatch {
            interval_secs: Some(5),
            max_concurrent: Some(99),
            ..SchedulerConfigPatch::default()
        });
        assert_eq!(h.scheduler.config().interval, Duration::from_secs(60));
        assert_eq!(h.scheduler.config().max_concurrent, 10);
    }
}
