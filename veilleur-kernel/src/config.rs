use serde::{Deserialize, Serialize};
use std::path::Path;
use tokio::fs;
use tracing::warn;

/// Bounds enforced at the configuration boundary. The core trusts the
/// values it receives.
const INTERVAL_SECS_MIN: u64 = 60;
const INTERVAL_SECS_MAX: u64 = 3600;
const MAX_CONCURRENT_MIN: usize = 1;
const MAX_CONCURRENT_MAX: usize = 10;

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct KernelConfig {
    #[serde(default = "default_http_port")]
    pub http_port: u16,
    #[serde(default = "default_database_path")]
    pub database_path: String,
    #[serde(default)]
    pub collection: CollectionConf,
    #[serde(default)]
    pub maintenance: MaintenanceConf,
    pub mqtt: Option<MqttConf>,
    pub wol: Option<WolConf>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct CollectionConf {
    pub enabled: bool,
    pub interval_secs: u64,
    pub max_concurrent: usize,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct MaintenanceConf {
    pub checkpoint_hours: u64,
    pub optimize_hours: u64,
    pub sample_retention_days: u64,
    pub history_retention_days: u64,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct MqttConf {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct WolConf {
    /// Commande externe optionnelle, ex: "/usr/local/bin/wake.sh {id} {mac}"
    pub command: String,
}

impl Default for CollectionConf {
    fn default() -> Self {
        Self { enabled: true, interval_secs: 300, max_concurrent: 3 }
    }
}

impl Default for MaintenanceConf {
    fn default() -> Self {
        Self {
            checkpoint_hours: 6,
            optimize_hours: 24,
            sample_retention_days: 90,
            history_retention_days: 30,
        }
    }
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self {
            http_port: default_http_port(),
            database_path: default_database_path(),
            collection: CollectionConf::default(),
            maintenance: MaintenanceConf::default(),
            mqtt: None,
            wol: None,
        }
    }
}

fn default_http_port() -> u16 {
    8080
}

fn default_database_path() -> String {
    "./data/veilleur.db".into()
}

impl KernelConfig {
    /// Clamps every tunable into its supported range. Out-of-range values
    /// are operator mistakes, not fatal errors.
    pub fn validate(&mut self) {
        let c = &mut self.collection;
        if !(INTERVAL_SECS_MIN..=INTERVAL_SECS_MAX).contains(&c.interval_secs) {
            let clamped = c.interval_secs.clamp(INTERVAL_SECS_MIN, INTERVAL_SECS_MAX);
            warn!(
                "collection.interval_secs {} hors bornes, ramené à {}",
                c.interval_secs, clamped
            );
            c.interval_secs = clamped;
        }
        if !(MAX_CONCURRENT_MIN..=MAX_CONCURRENT_MAX).contains(&c.max_concurrent) {
            let clamped = c.max_concurrent.clamp(MAX_CONCURRENT_MIN, MAX_CONCURRENT_MAX);
            warn!(
                "collection.max_concurrent {} hors bornes, ramené à {}",
                c.max_concurrent, clamped
            );
            c.max_concurrent = clamped;
        }

        let m = &mut self.maintenance;
        m.checkpoint_hours = m.checkpoint_hours.max(1);
        m.optimize_hours = m.optimize_hours.max(1);
        m.sample_retention_days = m.sample_retention_days.max(1);
        m.history_retention_days = m.history_retention_days.max(1);
    }

    /// Environment variables win over the yaml file (container deployments).
    fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("VEILLEUR_COLLECTION_ENABLED") {
            if let Ok(b) = v.parse::<bool>() {
                self.collection.enabled = b;
            }
        }
        if let Ok(v) = std::env::var("VEILLEUR_COLLECTION_INTERVAL_SECS") {
            if let Ok(n) = v.parse::<u64>() {
                self.collection.interval_secs = n;
            }
        }
        if let Ok(v) = std::env::var("VEILLEUR_COLLECTION_MAX_CONCURRENT") {
            if let Ok(n) = v.parse::<usize>() {
                self.collection.max_concurrent = n;
            }
        }
        if let Ok(v) = std::env::var("VEILLEUR_DATABASE_PATH") {
            self.database_path = v;
        }
        if let Ok(v) = std::env::var("VEILLEUR_HTTP_PORT") {
            if let Ok(p) = v.parse::<u16>() {
                self.http_port = p;
            }
        }
    }
}

pub async fn load_config() -> KernelConfig {
    let path = std::env::var("VEILLEUR_CONFIG").unwrap_or_else(|_| "kernel.yaml".into());
    let mut cfg = if Path::new(&path).exists() {
        let txt = fs::read_to_string(&path).await.unwrap_or_default();
        if txt.trim().is_empty() {
            KernelConfig::default()
        } else {
            serde_yaml::from_str(&txt).unwrap_or_else(|e| {
                warn!("config invalide ({path}): {e}, usage config par défaut");
                KernelConfig::default()
            })
        }
    } else {
        warn!("pas de {path}, usage config par défaut");
        KernelConfig::default()
    };

    cfg.apply_env_overrides();
    cfg.validate();
    cfg
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validate_clamps_collection_bounds() {
        let mut cfg = KernelConfig::default();
        cfg.collection.interval_secs = 5;
        cfg.collection.max_concurrent = 50;
        cfg.validate();
        assert_eq!(cfg.collection.interval_secs, 60);
        assert_eq!(cfg.collection.max_concurrent, 10);

        cfg.collection.interval_secs = 10_000;
        cfg.collection.max_concurrent = 0;
        cfg.validate();
        assert_eq!(cfg.collection.interval_secs, 3600);
        assert_eq!(cfg.collection.max_concurrent, 1);
    }

    #[test]
    fn validate_keeps_in_range_values() {
        let mut cfg = KernelConfig::default();
        cfg.collection.interval_secs = 120;
        cfg.collection.max_concurrent = 4;
        cfg.validate();
        assert_eq!(cfg.collection.interval_secs, 120);
        assert_eq!(cfg.collection.max_concurrent, 4);
    }

    #[test]
    fn yaml_roundtrip_with_partial_file() {
        let yaml = "collection:\n  enabled: false\n  interval_secs: 600\n  max_concurrent: 2\n";
        let cfg: KernelConfig = serde_yaml::from_str(yaml).unwrap();
        assert!(!cfg.collection.enabled);
        assert_eq!(cfg.collection.interval_secs, 600);
        assert_eq!(cfg.http_port, 8080);
        assert!(cfg.mqtt.is_none());
    }
}
