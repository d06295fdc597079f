/**
 * METRICS COLLECTOR - Extraction des métriques d'un hôte via SSH
 *
 * RÔLE :
 * Une session SSH par appel, quatre commandes d'extraction lancées en
 * parallèle (CPU, RAM, GPU, compteurs réseau), chacune bornée dans le
 * temps. L'échec d'une métrique dégrade son champ à null sans faire
 * échouer la collecte de l'appareil.
 *
 * FONCTIONNEMENT :
 * - Débit réseau : delta des compteurs cumulés entre deux collectes
 *   (le premier échantillon après démarrage n'a pas de débit)
 * - Puissance : estimation linéaire depuis la charge CPU du modèle
 *   idle_w / max_w de l'appareil
 */
use crate::models::{Device, MetricsSample};
use crate::ssh::SshSession;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::Duration;
use time::OffsetDateTime;
use tracing::debug;

/// Single float percentage since boot, from the aggregate /proc/stat line.
const CPU_COMMAND: &str =
    "grep 'cpu ' /proc/stat | awk '{usage=($2+$4)*100/($2+$4+$5)} END {print usage}'";

/// used-GB,total-GB,percent
const RAM_COMMAND: &str = "free -b | awk '/^Mem:/ {printf \"%.3f,%.3f,%.1f\", $3/1073741824, $2/1073741824, ($3/$2)*100}'";

/// percent,mem-used-MB,mem-total-MB, or the noGPU sentinel.
const GPU_COMMAND: &str = "command -v nvidia-smi >/dev/null 2>&1 && nvidia-smi --query-gpu=utilization.gpu,memory.used,memory.total --format=csv,noheader,nounits || echo noGPU";

/// Cumulative "rx_bytes tx_bytes" summed over every interface.
const NET_COMMAND: &str = "awk '/:/ {sub(/^[^:]*:/, \"\"); rx += $1; tx += $9} END {printf \"%d %d\", rx, tx}' /proc/net/dev";

#[derive(Debug, thiserror::Error)]
pub enum CollectorError {
    #[error("device {0} has no address configured")]
    MissingAddress(String),
    #[error("device {0} has no SSH credentials configured")]
    MissingCredentials(String),
    #[error("ssh connection failed: {0}")]
    Connection(String),
}

/// Seam between the scheduler and the SSH plumbing; tests substitute fakes.
#[async_trait]
pub trait MetricsCollector: Send + Sync {
    async fn collect(&self, device: &Device) -> Result<MetricsSample, CollectorError>;
}

/// Production collector: one SSH session per call.
pub struct SshCollector {
    connect_timeout: Duration,
    command_timeout: Duration,
    rates: NetRateTracker,
}

impl Default for SshCollector {
    fn default() -> Self {
        Self::new(Duration::from_secs(10), Duration::from_secs(5))
    }
}

impl SshCollector {
    pub fn new(connect_timeout: Duration, command_timeout: Duration) -> Self {
        Self { connect_timeout, command_timeout, rates: NetRateTracker::new() }
    }

    /// Assembles a sample from the four raw command outputs (`None` when a
    /// command failed or timed out). Pure apart from the rate tracker.
    fn build_sample(
        &self,
        device: &Device,
        timestamp: i64,
        cpu_out: Option<String>,
        ram_out: Option<String>,
        gpu_out: Option<String>,
        net_out: Option<String>,
    ) -> MetricsSample {
        let mut sample = MetricsSample::empty(&device.id, timestamp);

        sample.cpu_percent = cpu_out.as_deref().and_then(parse_cpu);

        if let Some((used, total, percent)) = ram_out.as_deref().and_then(parse_ram) {
            sample.ram_used_gb = Some(used);
            sample.ram_total_gb = Some(total);
            sample.ram_percent = Some(percent);
        }

        if let Some((percent, mem_used, mem_total)) = gpu_out.as_deref().and_then(parse_gpu) {
            sample.gpu_percent = Some(percent);
            sample.gpu_memory_used_mb = Some(mem_used);
            sample.gpu_memory_total_mb = Some(mem_total);
        }

        if let Some((rx_bytes, tx_bytes)) = net_out.as_deref().and_then(parse_net) {
            let (rx_mbps, tx_mbps) = self.rates.rates(&device.id, rx_bytes, tx_bytes, timestamp);
            sample.network_rx_mbps = rx_mbps;
            sample.network_tx_mbps = tx_mbps;
        }

        sample.power_consumption_w =
            estimate_power(sample.cpu_percent, device.power_idle_w, device.power_max_w);
        sample.power_estimated = true;

        sample
    }
}

#[async_trait]
impl MetricsCollector for SshCollector {
    async fn collect(&self, device: &Device) -> Result<MetricsSample, CollectorError> {
        let address = device
            .address
            .as_deref()
            .filter(|a| !a.is_empty())
            .ok_or_else(|| CollectorError::MissingAddress(device.id.clone()))?;
        let (user, password) = device
            .ssh_credentials()
            .ok_or_else(|| CollectorError::MissingCredentials(device.id.clone()))?;

        let session =
            SshSession::connect(address, device.ssh_port, user, password, self.connect_timeout)
                .await
                .map_err(|e| CollectorError::Connection(e.to_string()))?;

        // Les quatre extractions en parallèle, chacune bornée individuellement.
        let (cpu, ram, gpu, net) = tokio::join!(
            session.execute(CPU_COMMAND, self.command_timeout),
            session.execute(RAM_COMMAND, self.command_timeout),
            session.execute(GPU_COMMAND, self.command_timeout),
            session.execute(NET_COMMAND, self.command_timeout),
        );

        // Toujours refermer la session avant d'assembler, succès ou non.
        session.disconnect().await;

        let timestamp = OffsetDateTime::now_utc().unix_timestamp();
        Ok(self.build_sample(
            device,
            timestamp,
            metric_output(&device.id, "cpu", cpu),
            metric_output(&device.id, "ram", ram),
            metric_output(&device.id, "gpu", gpu),
            metric_output(&device.id, "net", net),
        ))
    }
}

/// A failed metric command only costs that metric, and a debug line.
fn metric_output(
    device_id: &str,
    metric: &str,
    result: Result<String, crate::ssh::SshError>,
) -> Option<String> {
    match result {
        Ok(out) => Some(out),
        Err(e) => {
            debug!("device {device_id}: {metric} extraction degraded to null: {e}");
            None
        }
    }
}

// ========================
// Parsing contracts
// ========================

fn parse_cpu(out: &str) -> Option<f64> {
    out.trim().parse::<f64>().ok().filter(|v| v.is_finite())
}

/// "used,total,percent" — any non-numeric field invalidates the triple.
fn parse_ram(out: &str) -> Option<(f64, f64, f64)> {
    parse_triple(out)
}

/// The `noGPU` sentinel means "no compatible GPU", mapped to null.
fn parse_gpu(out: &str) -> Option<(f64, f64, f64)> {
    if out.trim() == "noGPU" {
        return None;
    }
    parse_triple(out)
}

fn parse_triple(out: &str) -> Option<(f64, f64, f64)> {
    let mut parts = out.trim().split(',');
    let a = parts.next()?.trim().parse::<f64>().ok()?;
    let b = parts.next()?.trim().parse::<f64>().ok()?;
    let c = parts.next()?.trim().parse::<f64>().ok()?;
    if parts.next().is_some() {
        return None;
    }
    Some((a, b, c))
}

/// "rx_bytes tx_bytes" cumulative counters.
fn parse_net(out: &str) -> Option<(u64, u64)> {
    let mut parts = out.split_whitespace();
    let rx = parts.next()?.parse::<u64>().ok()?;
    let tx = parts.next()?.parse::<u64>().ok()?;
    if parts.next().is_some() {
        return None;
    }
    Some((rx, tx))
}

/// Linear estimate from CPU load; a null CPU reading yields a null power
/// reading (and therefore no threshold evaluation downstream).
fn estimate_power(cpu_percent: Option<f64>, idle_w: f64, max_w: f64) -> Option<f64> {
    let cpu = cpu_percent?;
    let load = (cpu / 100.0).clamp(0.0, 1.0);
    Some(idle_w + (max_w - idle_w) * load)
}

/// Converts cumulative byte counters into Mbps using the previous
/// observation per device. A point sample cannot yield a rate: the first
/// observation, and any counter reset (reboot), re-prime the tracker and
/// report null for that sample.
pub struct NetRateTracker {
    prev: Mutex<HashMap<String, NetCounters>>,
}

#[derive(Clone, Copy)]
struct NetCounters {
    rx_bytes: u64,
    tx_bytes: u64,
    at: i64,
}

impl NetRateTracker {
    pub fn new() -> Self {
        Self { prev: Mutex::new(HashMap::new()) }
    }

    fn rates(
        &self,
        device_id: &str,
        rx_bytes: u64,
        tx_bytes: u64,
        at: i64,
    ) -> (Option<f64>, Option<f64>) {
        let mut prev = self.prev.lock();
        let out = match prev.get(device_id) {
            Some(p) if at > p.at && rx_bytes >= p.rx_bytes && tx_bytes >= p.tx_bytes => {
                let dt = (at - p.at) as f64;
                (
                    Some((rx_bytes - p.rx_bytes) as f64 * 8.0 / dt / 1e6),
                    Some((tx_bytes - p.tx_bytes) as f64 * 8.0 / dt / 1e6),
                )
            }
            _ => (None, None),
        };
        prev.insert(device_id.to_string(), NetCounters { rx_bytes, tx_bytes, at });
        out
    }
}

impl Default for NetRateTracker {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn device() -> Device {
        Device {
            id: "d1".into(),
            name: "nas".into(),
            address: Some("192.168.1.40".into()),
            mac: None,
            ssh_user: Some("admin".into()),
            ssh_password: Some("secret".into()),
            ssh_port: 22,
            power_idle_w: 10.0,
            power_max_w: 110.0,
            power_alert_w: None,
            created_at: 0,
        }
    }

    #[test]
    fn cpu_parses_a_single_float() {
        assert_eq!(parse_cpu("42.5\n"), Some(42.5));
        assert_eq!(parse_cpu("  7 "), Some(7.0));
        assert_eq!(parse_cpu("n/a"), None);
        assert_eq!(parse_cpu(""), None);
    }

    #[test]
    fn ram_triple_all_or_nothing() {
        assert_eq!(parse_ram("3.215,15.500,20.7"), Some((3.215, 15.5, 20.7)));
        assert_eq!(parse_ram("3.2,abc,20.7"), None);
        assert_eq!(parse_ram("3.2,15.5"), None);
        assert_eq!(parse_ram("3.2,15.5,20.7,9"), None);
    }

    #[test]
    fn gpu_sentinel_maps_to_none() {
        assert_eq!(parse_gpu("noGPU\n"), None);
        assert_eq!(parse_gpu("45, 2048, 8192"), Some((45.0, 2048.0, 8192.0)));
        assert_eq!(parse_gpu("garbage"), None);
    }

    #[test]
    fn net_counters_parse() {
        assert_eq!(parse_net("123456 654321"), Some((123_456, 654_321)));
        assert_eq!(parse_net("123456"), None);
        assert_eq!(parse_net("a b"), None);
    }

    #[test]
    fn power_model_is_linear_in_cpu() {
        assert_eq!(estimate_power(Some(0.0), 10.0, 110.0), Some(10.0));
        assert_eq!(estimate_power(Some(50.0), 10.0, 110.0), Some(60.0));
        assert_eq!(estimate_power(Some(100.0), 10.0, 110.0), Some(110.0));
        // Hors bornes: la charge est écrêtée.
        assert_eq!(estimate_power(Some(250.0), 10.0, 110.0), Some(110.0));
        assert_eq!(estimate_power(None, 10.0, 110.0), None);
    }

    #[test]
    fn rate_tracker_primes_then_computes_deltas() {
        let tracker = NetRateTracker::new();
        // First observation: no rate.
        assert_eq!(tracker.rates("d1", 1_000_000, 500_000, 100), (None, None));
        // 1 MB received over 8 s -> 1 Mbps.
        let (rx, tx) = tracker.rates("d1", 2_000_000, 500_000, 108);
        assert!((rx.unwrap() - 1.0).abs() < 1e-9);
        assert!((tx.unwrap() - 0.0).abs() < 1e-9);
        // Counter reset (reboot): re-prime, no rate for this sample.
        assert_eq!(tracker.rates("d1", 10_000, 2_000, 120), (None, None));
        // Devices do not share counters.
        assert_eq!(tracker.rates("d2", 5_000, 5_000, 120), (None, None));
    }

    #[test]
    fn gpu_failure_degrades_without_failing_the_sample() {
        let collector = SshCollector::default();
        let sample = collector.build_sample(
            &device(),
            1000,
            Some("42.5".into()),
            Some("3.215,15.500,20.7".into()),
            None, // GPU command timed out
            Some("1000 2000".into()),
        );

        assert_eq!(sample.cpu_percent, Some(42.5));
        assert_eq!(sample.ram_used_gb, Some(3.215));
        assert_eq!(sample.ram_percent, Some(20.7));
        assert!(sample.gpu_percent.is_none());
        assert!(sample.gpu_memory_used_mb.is_none());
        // Power still estimated from CPU.
        assert!((sample.power_consumption_w.unwrap() - 52.5).abs() < 1e-9);
        assert!(sample.power_estimated);
    }

    #[test]
    fn all_commands_failing_still_yields_an_empty_sample() {
        let collector = SshCollector::default();
        let sample = collector.build_sample(&device(), 1000, None, None, None, None);
        assert!(sample.cpu_percent.is_none());
        assert!(sample.ram_used_gb.is_none());
        assert!(sample.power_consumption_w.is_none());
        assert_eq!(sample.timestamp, 1000);
    }
}
