//! Liveness probing. Fail-closed: the scheduler treats any probe error as
//! "offline" and spends no SSH attempt on the device.

use anyhow::{Context, Result};
use async_trait::async_trait;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tracing::debug;

#[async_trait]
pub trait LivenessProbe: Send + Sync {
    /// `Ok(true)` when the address answered. Errors are probe plumbing
    /// failures; the caller decides what they mean (offline, here).
    async fn check(&self, address: &str) -> Result<bool>;
}

/// Shells out to the system `ping`, one echo request with a short deadline.
pub struct PingProbe {
    deadline: Duration,
}

impl PingProbe {
    pub fn new(deadline: Duration) -> Self {
        Self { deadline }
    }
}

impl Default for PingProbe {
    fn default() -> Self {
        Self::new(Duration::from_secs(2))
    }
}

#[async_trait]
impl LivenessProbe for PingProbe {
    async fn check(&self, address: &str) -> Result<bool> {
        let deadline_secs = self.deadline.as_secs().max(1);
        let child = Command::new("ping")
            .arg("-c")
            .arg("1")
            .arg("-W")
            .arg(deadline_secs.to_string())
            .arg(address)
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .output();

        // Marge au-dessus du deadline de ping lui-même.
        let output = tokio::time::timeout(self.deadline + Duration::from_secs(1), child)
            .await
            .map_err(|_| anyhow::anyhow!("ping to {address} did not return"))?
            .context("failed to spawn ping")?;

        let alive = output.status.success();
        if !alive {
            debug!("{address} did not answer ping");
        }
        Ok(alive)
    }
}
