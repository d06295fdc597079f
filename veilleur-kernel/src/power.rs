//! Remote shutdown and sleep, one-shot SSH commands through the same
//! session layer as the collector.

use crate::models::Device;
use crate::ssh::{SshError, SshSession};
use std::time::Duration;
use tracing::{info, warn};

#[derive(Debug, thiserror::Error)]
pub enum PowerError {
    #[error("device {0} has no address or SSH credentials configured")]
    NotEligible(String),
    #[error(transparent)]
    Ssh(#[from] SshError),
}

pub struct PowerController {
    connect_timeout: Duration,
    command_timeout: Duration,
}

impl Default for PowerController {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            command_timeout: Duration::from_secs(10),
        }
    }
}

impl PowerController {
    pub async fn shutdown(&self, device: &Device) -> Result<(), PowerError> {
        self.run(device, "systemctl poweroff").await
    }

    pub async fn sleep(&self, device: &Device) -> Result<(), PowerError> {
        self.run(device, "systemctl suspend").await
    }

    async fn run(&self, device: &Device, command: &str) -> Result<(), PowerError> {
        let address = device
            .address
            .as_deref()
            .filter(|a| !a.is_empty())
            .ok_or_else(|| PowerError::NotEligible(device.id.clone()))?;
        let (user, password) =
            device.ssh_credentials().ok_or_else(|| PowerError::NotEligible(device.id.clone()))?;

        let session =
            SshSession::connect(address, device.ssh_port, user, password, self.connect_timeout)
                .await?;
        let result = session.execute(command, self.command_timeout).await;
        session.disconnect().await;

        // L'hôte coupe la session en exécutant la commande : l'absence de
        // statut de sortie vaut envoi réussi.
        match result {
            Ok(_) => {
                info!("'{command}' dispatched to {} ({address})", device.name);
                Ok(())
            }
            Err(SshError::CommandTimeout { .. }) => {
                warn!("'{command}' on {} returned no exit status, assuming dispatched", device.name);
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }
}
