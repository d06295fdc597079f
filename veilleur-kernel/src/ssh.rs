//! Remote shell session layer.
//!
//! One short-lived session per call site: connect with a hard timeout,
//! run commands with individual timeouts, always tear down. Shared by the
//! metrics collector and the remote power senders.

use async_ssh2_tokio::client::{AuthMethod, Client, ServerCheckMethod};
use std::time::Duration;
use tokio::time::timeout;
use tracing::debug;

#[derive(Debug, thiserror::Error)]
pub enum SshError {
    #[error("connection to {address} timed out after {seconds}s")]
    ConnectTimeout { address: String, seconds: u64 },
    #[error("connection to {address} failed: {source}")]
    Connect {
        address: String,
        #[source]
        source: async_ssh2_tokio::Error,
    },
    #[error("command timed out after {seconds}s")]
    CommandTimeout { seconds: u64 },
    #[error("command failed: {0}")]
    Command(#[source] async_ssh2_tokio::Error),
    #[error("command exited with status {status}: {stderr}")]
    NonZeroExit { status: u32, stderr: String },
}

/// An authenticated SSH session to one host.
pub struct SshSession {
    client: Client,
    address: String,
}

impl SshSession {
    /// Opens a password-authenticated session, bounded by `connect_timeout`
    /// (covers TCP, handshake and auth together).
    pub async fn connect(
        address: &str,
        port: u16,
        user: &str,
        password: &str,
        connect_timeout: Duration,
    ) -> Result<Self, SshError> {
        let auth = AuthMethod::with_password(password);
        let fut = Client::connect((address, port), user, auth, ServerCheckMethod::NoCheck);

        match timeout(connect_timeout, fut).await {
            Ok(Ok(client)) => {
                debug!("ssh session opened to {address}:{port}");
                Ok(Self { client, address: address.to_string() })
            }
            Ok(Err(source)) => Err(SshError::Connect { address: address.to_string(), source }),
            Err(_) => Err(SshError::ConnectTimeout {
                address: address.to_string(),
                seconds: connect_timeout.as_secs(),
            }),
        }
    }

    /// Runs one command, racing it against `cap`. Returns stdout on a zero
    /// exit status.
    pub async fn execute(&self, command: &str, cap: Duration) -> Result<String, SshError> {
        match timeout(cap, self.client.execute(command)).await {
            Err(_) => Err(SshError::CommandTimeout { seconds: cap.as_secs() }),
            Ok(Err(e)) => Err(SshError::Command(e)),
            Ok(Ok(result)) => {
                if result.exit_status == 0 {
                    Ok(result.stdout)
                } else {
                    Err(SshError::NonZeroExit {
                        status: result.exit_status,
                        stderr: result.stderr.trim().to_string(),
                    })
                }
            }
        }
    }

    /// Best-effort teardown; a failed close is only worth a debug line.
    pub async fn disconnect(self) {
        if let Err(e) = self.client.disconnect().await {
            debug!("ssh disconnect from {} failed: {e}", self.address);
        }
    }
}
