//! Connection factory seam.
//!
//! The registry, the tunnel runtime and the status poller never call russh
//! directly; they go through a [`Connector`] so the whole orchestration layer
//! can run against scripted connections.

use std::time::Duration;

use async_trait::async_trait;

use super::client::{ForwardedSender, SshClient};
use super::config::HostConfig;
use super::error::SshError;
use super::handle_owner::{spawn_handle_owner_task, HandleController};

#[async_trait]
pub trait Connector: Send + Sync {
    /// Open and authenticate a connection, returning the controller of its
    /// owner task. `forwarded_tx` receives server-initiated forward channels.
    async fn connect(
        &self,
        config: &HostConfig,
        label: &str,
        forwarded_tx: Option<ForwardedSender>,
    ) -> Result<HandleController, SshError>;
}

/// Real connector backed by russh
pub struct RusshConnector {
    connect_timeout: Duration,
}

impl RusshConnector {
    pub fn new(connect_timeout: Duration) -> Self {
        Self { connect_timeout }
    }
}

#[async_trait]
impl Connector for RusshConnector {
    async fn connect(
        &self,
        config: &HostConfig,
        label: &str,
        forwarded_tx: Option<ForwardedSender>,
    ) -> Result<HandleController, SshError> {
        let mut client = SshClient::new(config.clone(), self.connect_timeout);
        if let Some(tx) = forwarded_tx {
            client = client.with_forwarding(tx);
        }
        let handle = client.connect().await?;
        Ok(spawn_handle_owner_task(handle, label.to_string()))
    }
}
