//! Connection Handle
//!
//! One authenticated SSH connection to one host. Wraps the owner-task
//! controller with identity, transport state and activity timestamps.

use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use russh::client::Msg;
use russh::{Channel, ChannelMsg};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use super::client::ForwardedSender;
use super::config::HostConfig;
use super::connector::Connector;
use super::error::SshError;
use super::handle_owner::{HandleController, PingResult};

/// Exec output is truncated beyond this many bytes.
const MAX_EXEC_OUTPUT: usize = 64 * 1024;

/// Transport state of a connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportState {
    Connecting,
    Ready,
    Closed,
    Failed,
}

/// Terminal dimensions negotiated for a PTY
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PtySize {
    pub cols: u32,
    pub rows: u32,
    #[serde(default)]
    pub width_px: u32,
    #[serde(default)]
    pub height_px: u32,
}

impl PtySize {
    pub fn new(cols: u32, rows: u32) -> Self {
        Self {
            cols,
            rows,
            width_px: 0,
            height_px: 0,
        }
    }
}

/// Result of a one-shot remote command
#[derive(Debug, Clone, Default)]
pub struct ExecOutput {
    pub stdout: Vec<u8>,
    pub exit_status: Option<u32>,
}

pub struct ConnectionHandle {
    id: String,
    label: String,
    config: HostConfig,
    controller: HandleController,
    state: RwLock<TransportState>,
    created_at: DateTime<Utc>,
    last_active: AtomicI64,
}

impl ConnectionHandle {
    /// Establish a new connection through `connector`.
    pub async fn connect(
        connector: &dyn Connector,
        config: &HostConfig,
        label: &str,
        forwarded_tx: Option<ForwardedSender>,
    ) -> Result<Self, SshError> {
        let controller = connector.connect(config, label, forwarded_tx).await?;
        let handle = Self::from_controller(config.clone(), label, controller);
        info!("Connection {} ready ({})", handle.id, handle.label);
        Ok(handle)
    }

    /// Wrap an already running owner task.
    pub fn from_controller(config: HostConfig, label: &str, controller: HandleController) -> Self {
        let now = Utc::now();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            label: label.to_string(),
            config,
            controller,
            state: RwLock::new(TransportState::Ready),
            created_at: now,
            last_active: AtomicI64::new(now.timestamp_millis()),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn config(&self) -> &HostConfig {
        &self.config
    }

    pub fn controller(&self) -> &HandleController {
        &self.controller
    }

    pub fn state(&self) -> TransportState {
        *self.state.read()
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Last activity as unix milliseconds
    pub fn last_active(&self) -> i64 {
        self.last_active.load(Ordering::SeqCst)
    }

    pub fn touch(&self) {
        self.last_active
            .store(Utc::now().timestamp_millis(), Ordering::SeqCst);
    }

    pub fn subscribe_disconnect(&self) -> broadcast::Receiver<()> {
        self.controller.subscribe_disconnect()
    }

    /// Cheap liveness check: one keepalive round trip.
    ///
    /// A timed-out keepalive counts as not alive without marking the handle
    /// failed; an I/O failure marks it failed for good.
    pub async fn is_alive(&self) -> bool {
        match self.state() {
            TransportState::Closed | TransportState::Failed => return false,
            TransportState::Connecting | TransportState::Ready => {}
        }
        if !self.controller.is_connected() {
            *self.state.write() = TransportState::Failed;
            return false;
        }
        match self.controller.ping().await {
            PingResult::Ok => {
                self.touch();
                true
            }
            PingResult::Timeout => {
                warn!("Connection {} keepalive timed out", self.id);
                false
            }
            PingResult::IoError => {
                warn!("Connection {} transport lost", self.id);
                *self.state.write() = TransportState::Failed;
                false
            }
        }
    }

    /// Open a PTY shell channel sized to `size`
    pub async fn open_shell(&self, size: PtySize) -> Result<Channel<Msg>, SshError> {
        let mut channel = self.controller.open_session_channel().await?;
        self.touch();

        channel
            .request_pty(
                false,
                "xterm-256color",
                size.cols,
                size.rows,
                size.width_px,
                size.height_px,
                &[],
            )
            .await
            .map_err(|e| SshError::ChannelError(format!("PTY request failed: {}", e)))?;

        channel
            .request_shell(false)
            .await
            .map_err(|e| SshError::ChannelError(format!("Shell request failed: {}", e)))?;

        debug!(
            "Shell opened on {} at {}x{}",
            self.id, size.cols, size.rows
        );
        Ok(channel)
    }

    /// Run a one-shot command and collect stdout until the channel closes.
    pub async fn exec(&self, command: &str, timeout: Duration) -> Result<ExecOutput, SshError> {
        let mut channel = self.controller.open_session_channel().await?;
        self.touch();

        channel
            .exec(true, command)
            .await
            .map_err(|e| SshError::ChannelError(format!("Failed to exec: {}", e)))?;

        let mut output = ExecOutput::default();
        let drain = tokio::time::timeout(timeout, async {
            loop {
                match channel.wait().await {
                    Some(ChannelMsg::Data { data }) => {
                        let room = MAX_EXEC_OUTPUT.saturating_sub(output.stdout.len());
                        output.stdout.extend_from_slice(&data[..data.len().min(room)]);
                    }
                    Some(ChannelMsg::ExitStatus { exit_status }) => {
                        output.exit_status = Some(exit_status);
                    }
                    Some(ChannelMsg::Close) | None => break,
                    _ => {}
                }
            }
        })
        .await;

        if drain.is_err() {
            let _ = channel.close().await;
            return Err(SshError::Timeout(format!(
                "exec on {} exceeded {}ms",
                self.id,
                timeout.as_millis()
            )));
        }

        Ok(output)
    }

    /// Close the connection. Idempotent.
    pub async fn close(&self) {
        {
            let mut state = self.state.write();
            if *state == TransportState::Closed {
                return;
            }
            *state = TransportState::Closed;
        }
        info!("Closing connection {} ({})", self.id, self.label);
        self.controller.disconnect().await;
    }
}

impl std::fmt::Debug for ConnectionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionHandle")
            .field("id", &self.id)
            .field("label", &self.label)
            .field("state", &self.state())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ssh::testing::{host, FakeConnector};

    #[tokio::test]
    async fn test_alive_then_severed() {
        let connector = FakeConnector::new();
        let handle = ConnectionHandle::connect(&connector, &host("web"), "test", None)
            .await
            .unwrap();
        assert_eq!(handle.state(), TransportState::Ready);
        assert!(handle.is_alive().await);

        connector.sever_all();
        assert!(!handle.is_alive().await);
        assert_eq!(handle.state(), TransportState::Failed);
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let connector = FakeConnector::new();
        let handle = ConnectionHandle::connect(&connector, &host("web"), "test", None)
            .await
            .unwrap();
        let mut disconnect_rx = handle.subscribe_disconnect();

        handle.close().await;
        handle.close().await;

        assert_eq!(handle.state(), TransportState::Closed);
        assert!(!handle.is_alive().await);
        assert!(disconnect_rx.recv().await.is_ok());
    }

    #[tokio::test]
    async fn test_connect_error_passes_through() {
        let connector = FakeConnector::new();
        connector.set_unreachable("web", true);
        let err = ConnectionHandle::connect(&connector, &host("web"), "test", None)
            .await
            .unwrap_err();
        assert!(matches!(err, SshError::ConnectTimeout(_)));
    }
}
