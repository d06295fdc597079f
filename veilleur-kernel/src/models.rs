use serde::{Deserialize, Serialize};

/// A supervised machine from the device registry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Device {
    pub id: String,                      // UUID v4
    pub name: String,
    pub address: Option<String>,         // IP ou hostname sur le LAN
    pub mac: Option<String>,             // requis seulement pour le Wake-on-LAN
    pub ssh_user: Option<String>,
    pub ssh_password: Option<String>,
    pub ssh_port: u16,
    /// Linear power model: watts drawn at 0% / 100% CPU.
    pub power_idle_w: f64,
    pub power_max_w: f64,
    /// Alert threshold in watts; `None` disables power notifications.
    pub power_alert_w: Option<f64>,
    pub created_at: i64,
}

impl Device {
    /// A device is eligible for metrics collection only when its address
    /// and both SSH credential fields are present and non-empty.
    pub fn is_eligible(&self) -> bool {
        self.ssh_credentials().is_some()
            && self.address.as_deref().is_some_and(|a| !a.is_empty())
    }

    /// Both credential fields, or `None` when either is missing/empty.
    pub fn ssh_credentials(&self) -> Option<(&str, &str)> {
        match (self.ssh_user.as_deref(), self.ssh_password.as_deref()) {
            (Some(u), Some(p)) if !u.is_empty() && !p.is_empty() => Some((u, p)),
            _ => None,
        }
    }
}

/// One utilization sample pulled from a device. Every numeric field is
/// nullable: a metric command that timed out or failed to parse degrades
/// to `None` without invalidating the rest of the sample.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsSample {
    pub device_id: String,
    pub timestamp: i64,                  // unix seconds
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
    pub power_estimated: bool,
}

impl MetricsSample {
    /// Empty sample for a device at a given instant.
    pub fn empty(device_id: &str, timestamp: i64) -> Self {
        Self {
            device_id: device_id.to_string(),
            timestamp,
            cpu_percent: None,
            ram_used_gb: None,
            ram_total_gb: None,
            ram_percent: None,
            gpu_percent: None,
            gpu_memory_used_mb: None,
            gpu_memory_total_mb: None,
            network_rx_mbps: None,
            network_tx_mbps: None,
            power_consumption_w: None,
            power_estimated: true,
        }
    }
}

/// What triggered a collection attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TriggerSource {
    Scheduler,
    Manual,
    Ui,
}

impl TriggerSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            TriggerSource::Scheduler => "scheduler",
            TriggerSource::Manual => "manual",
            TriggerSource::Ui => "ui",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "manual" => TriggerSource::Manual,
            "ui" => TriggerSource::Ui,
            _ => TriggerSource::Scheduler,
        }
    }
}

/// Append-only record of one collection attempt, success or failure.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CollectionHistoryEntry {
    pub device_id: String,
    pub success: bool,
    pub error: Option<String>,
    pub duration_ms: i64,
    pub trigger: TriggerSource,
    pub timestamp: i64,
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
            power_idle_w: 5.0,
            power_max_w: 150.0,
            power_alert_w: None,
            created_at: 0,
        }
    }

    #[test]
    fn eligibility_requires_address_and_both_credentials() {
        assert!(device().is_eligible());

        let mut d = device();
        d.address = None;
        assert!(!d.is_eligible());

        let mut d = device();
        d.ssh_user = None;
        assert!(!d.is_eligible());

        let mut d = device();
        d.ssh_password = Some(String::new());
        assert!(!d.is_eligible());
    }

    #[test]
    fn trigger_source_roundtrip() {
        assert_eq!(TriggerSource::parse("ui"), TriggerSource::Ui);
        assert_eq!(TriggerSource::parse("manual"), TriggerSource::Manual);
        assert_eq!(TriggerSource::parse("anything"), TriggerSource::Scheduler);
        assert_eq!(TriggerSource::Ui.as_str(), "ui");
    }
}
