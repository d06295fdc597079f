//! Best-effort alert publication over MQTT.
//!
//! The home-automation side subscribes to `veilleur/alerts/power@v1`; the
//! kernel only publishes. A publish failure must never fail the collection
//! that produced it, but it must be visible in the logs.

use crate::config::MqttConf;
use rumqttc::{AsyncClient, MqttOptions, QoS};
use serde::Serialize;
use std::time::Duration;
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;
use tracing::{debug, warn};

const POWER_ALERT_TOPIC: &str = "veilleur/alerts/power@v1";

#[derive(Debug, Serialize)]
struct PowerAlert<'a> {
    device_id: &'a str,
    device_name: &'a str,
    watts: f64,
    threshold_w: f64,
    timestamp: String,
}

pub struct Notifier {
    client: AsyncClient,
}

impl Notifier {
    /// Builds the client and spawns its event loop. Connection problems are
    /// retried forever in the background; publishing stays available.
    pub fn start(cfg: &MqttConf) -> Self {
        let mut opts = MqttOptions::new("veilleur-kernel", &cfg.host, cfg.port);
        opts.set_keep_alive(Duration::from_secs(15));

        let (client, mut eventloop) = AsyncClient::new(opts, 10);

        tokio::spawn(async move {
            loop {
                match eventloop.poll().await {
                    Ok(_) => {}
                    Err(e) => {
                        warn!("mqtt event loop error: {e:?}");
                        tokio::time::sleep(Duration::from_secs(2)).await;
                    }
                }
            }
        });

        Self { client }
    }

    /// Publishes one power-threshold alert. Errors propagate to the caller,
    /// which logs and ignores them (best-effort contract).
    pub async fn power_alert(
        &self,
        device_id: &str,
        device_name: &str,
        watts: f64,
        threshold_w: f64,
    ) -> anyhow::Result<()> {
        let alert = PowerAlert {
            device_id,
            device_name,
            watts,
            threshold_w,
            timestamp: OffsetDateTime::now_utc().format(&Rfc3339)?,
        };
        let payload = serde_json::to_string(&alert)?;
        self.client.publish(POWER_ALERT_TOPIC, QoS::AtLeastOnce, false, payload).await?;
        debug!("published power alert for {device_id} ({watts:.1} W > {threshold_w:.1} W)");
        Ok(())
    }
}
