//! Secure tunnel collaborator used by database sources behind a bastion.

use crate::types::SshSettings;
use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::oneshot;

/// What the tunnel must forward: `ssh` jump host to `remote_host:remote_port`.
#[derive(Clone, Debug)]
pub struct TunnelRequest {
    pub ssh: SshSettings,
    pub remote_host: String,
    pub remote_port: u16,
}

/// Local end of an open tunnel.
///
/// Dropping the handle closes the tunnel as well.
#[derive(Debug)]
pub struct TunnelHandle {
    pub local_host: String,
    pub local_port: u16,
    shutdown: Option<oneshot::Sender<()>>,
}

impl TunnelHandle {
    /// `shutdown` fires once when the handle is closed or dropped.
    pub fn new(
        local_host: impl Into<String>,
        local_port: u16,
        shutdown: oneshot::Sender<()>,
    ) -> Self {
        Self {
            local_host: local_host.into(),
            local_port,
            shutdown: Some(shutdown),
        }
    }

    /// Safe to call more than once.
    pub fn close(&mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
    }

    pub fn is_open(&self) -> bool {
        self.shutdown.as_ref().is_some_and(|tx| !tx.is_closed())
    }
}

impl Drop for TunnelHandle {
    fn drop(&mut self) {
        self.close();
    }
}

/// Opens SSH port forwards on behalf of providers.
#[async_trait]
pub trait TunnelProvider: Send + Sync {
    async fn open_tunnel(&self, request: &TunnelRequest) -> Result<TunnelHandle>;
}
