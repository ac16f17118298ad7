//! Handle Owner Task
//!
//! Only one task owns the `Handle<ClientHandler>`. Everything else talks to it
//! through a cloneable [`HandleController`] that sends commands over an mpsc
//! channel and waits for a oneshot reply.
//!
//! Because the owner task processes one command at a time, channel creation
//! on a connection is serialized without any lock held across `.await`.
//! Established channels are handed back to the caller and run independently.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use russh::client::{Handle, Msg};
use russh::Channel;
use tokio::sync::{broadcast, mpsc, oneshot};
use tracing::{debug, info, warn};

use super::client::ClientHandler;
use super::error::SshError;

/// Upper bound on channel opens queued against one connection.
pub const MAX_PENDING_CHANNEL_OPENS: usize = 16;

const KEEPALIVE_TIMEOUT: Duration = Duration::from_secs(5);

/// Outcome of a keepalive round trip
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PingResult {
    Ok,
    /// No reply in time; the link may just be slow
    Timeout,
    /// The transport is gone
    IoError,
}

/// Commands sent to the Handle Owner Task
pub enum HandleCommand {
    /// Open a session channel (shell, SFTP subsystem, exec)
    ChannelOpenSession {
        reply_tx: oneshot::Sender<Result<Channel<Msg>, russh::Error>>,
    },

    /// Open a direct-tcpip channel
    ChannelOpenDirectTcpip {
        host: String,
        port: u32,
        originator_host: String,
        originator_port: u32,
        reply_tx: oneshot::Sender<Result<Channel<Msg>, russh::Error>>,
    },

    /// Open and immediately close a direct-tcpip channel to check that the
    /// far side accepts connections
    ProbeDirectTcpip {
        host: String,
        port: u32,
        reply_tx: oneshot::Sender<Result<(), russh::Error>>,
    },

    /// Request remote forward (tcpip-forward)
    TcpipForward {
        address: String,
        port: u32,
        reply_tx: oneshot::Sender<Result<u32, russh::Error>>,
    },

    /// Cancel remote forward
    CancelTcpipForward {
        address: String,
        port: u32,
        reply_tx: oneshot::Sender<Result<(), russh::Error>>,
    },

    /// Keepalive round trip
    Ping {
        reply_tx: oneshot::Sender<PingResult>,
    },

    /// Disconnect the SSH connection
    Disconnect,
}

/// Controller for sending commands to the Handle Owner Task
///
/// Cloning is cheap (a sender plus two `Arc`s). Any holder has full control
/// over the connection, so controllers never leave the process.
#[derive(Clone)]
pub struct HandleController {
    cmd_tx: mpsc::Sender<HandleCommand>,
    disconnect_tx: broadcast::Sender<()>,
    pending_opens: Arc<AtomicUsize>,
}

/// Reserved slot in the pending channel-open budget, returned on drop.
struct OpenSlot(Arc<AtomicUsize>);

impl Drop for OpenSlot {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl HandleController {
    /// Build a controller around an existing command channel.
    ///
    /// Production code goes through [`spawn_handle_owner_task`]; tests use this
    /// to drive a scripted owner.
    pub fn new(cmd_tx: mpsc::Sender<HandleCommand>, disconnect_tx: broadcast::Sender<()>) -> Self {
        Self {
            cmd_tx,
            disconnect_tx,
            pending_opens: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Subscribe to SSH disconnect notifications.
    ///
    /// The receiver yields once the owner task has exited.
    pub fn subscribe_disconnect(&self) -> broadcast::Receiver<()> {
        self.disconnect_tx.subscribe()
    }

    fn reserve_open_slot(&self) -> Result<OpenSlot, SshError> {
        let prev = self.pending_opens.fetch_add(1, Ordering::SeqCst);
        if prev >= MAX_PENDING_CHANNEL_OPENS {
            self.pending_opens.fetch_sub(1, Ordering::SeqCst);
            return Err(SshError::ResourceExhausted(format!(
                "{} channel opens already in flight, retry after they complete",
                prev
            )));
        }
        Ok(OpenSlot(self.pending_opens.clone()))
    }

    /// Open a session channel
    pub async fn open_session_channel(&self) -> Result<Channel<Msg>, SshError> {
        let _slot = self.reserve_open_slot()?;
        let (reply_tx, reply_rx) = oneshot::channel();
        self.cmd_tx
            .send(HandleCommand::ChannelOpenSession { reply_tx })
            .await
            .map_err(|_| SshError::Disconnected)?;
        reply_rx
            .await
            .map_err(|_| SshError::Disconnected)?
            .map_err(|e| SshError::ChannelError(e.to_string()))
    }

    /// Open a direct-tcpip channel
    pub async fn open_direct_tcpip(
        &self,
        host: &str,
        port: u32,
        originator_host: &str,
        originator_port: u32,
    ) -> Result<Channel<Msg>, SshError> {
        let _slot = self.reserve_open_slot()?;
        let (reply_tx, reply_rx) = oneshot::channel();
        self.cmd_tx
            .send(HandleCommand::ChannelOpenDirectTcpip {
                host: host.to_string(),
                port,
                originator_host: originator_host.to_string(),
                originator_port,
                reply_tx,
            })
            .await
            .map_err(|_| SshError::Disconnected)?;
        reply_rx
            .await
            .map_err(|_| SshError::Disconnected)?
            .map_err(|e| SshError::ChannelError(e.to_string()))
    }

    /// Check that `host:port` accepts a direct-tcpip connection
    pub async fn probe_direct_tcpip(&self, host: &str, port: u32) -> Result<(), SshError> {
        let _slot = self.reserve_open_slot()?;
        let (reply_tx, reply_rx) = oneshot::channel();
        self.cmd_tx
            .send(HandleCommand::ProbeDirectTcpip {
                host: host.to_string(),
                port,
                reply_tx,
            })
            .await
            .map_err(|_| SshError::Disconnected)?;
        reply_rx
            .await
            .map_err(|_| SshError::Disconnected)?
            .map_err(|e| SshError::ChannelError(format!("{}:{} unreachable: {}", host, port, e)))
    }

    /// Request remote port forward (tcpip-forward)
    ///
    /// Returns the actual bound port (may differ if requested port was 0)
    pub async fn tcpip_forward(&self, address: &str, port: u32) -> Result<u32, SshError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.cmd_tx
            .send(HandleCommand::TcpipForward {
                address: address.to_string(),
                port,
                reply_tx,
            })
            .await
            .map_err(|_| SshError::Disconnected)?;
        reply_rx
            .await
            .map_err(|_| SshError::Disconnected)?
            .map_err(|e| SshError::ChannelError(format!("tcpip-forward rejected: {}", e)))
    }

    /// Cancel a remote port forward
    pub async fn cancel_tcpip_forward(&self, address: &str, port: u32) -> Result<(), SshError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.cmd_tx
            .send(HandleCommand::CancelTcpipForward {
                address: address.to_string(),
                port,
                reply_tx,
            })
            .await
            .map_err(|_| SshError::Disconnected)?;
        reply_rx
            .await
            .map_err(|_| SshError::Disconnected)?
            .map_err(|e| SshError::ChannelError(e.to_string()))
    }

    /// Ask the owner task to disconnect and exit
    pub async fn disconnect(&self) {
        let _ = self.cmd_tx.send(HandleCommand::Disconnect).await;
    }

    /// Keepalive round trip
    pub async fn ping(&self) -> PingResult {
        let (reply_tx, reply_rx) = oneshot::channel();
        if self.cmd_tx.send(HandleCommand::Ping { reply_tx }).await.is_err() {
            return PingResult::IoError;
        }
        reply_rx.await.unwrap_or(PingResult::IoError)
    }

    /// Check if the Handle Owner Task is still running
    pub fn is_connected(&self) -> bool {
        !self.cmd_tx.is_closed()
    }
}

/// Spawn the Handle Owner Task
///
/// Consumes the Handle and returns a controller. `label` only feeds log lines.
pub fn spawn_handle_owner_task(handle: Handle<ClientHandler>, label: String) -> HandleController {
    let (cmd_tx, mut cmd_rx) = mpsc::channel::<HandleCommand>(64);
    let (disconnect_tx, _) = broadcast::channel::<()>(1);
    let disconnect_tx_clone = disconnect_tx.clone();

    tokio::spawn(async move {
        let mut handle = handle;

        info!("Handle owner task started for {}", label);

        while let Some(cmd) = cmd_rx.recv().await {
            match cmd {
                HandleCommand::ChannelOpenSession { reply_tx } => {
                    let result = handle.channel_open_session().await;
                    if reply_tx.send(result).is_err() {
                        warn!("Caller dropped before receiving channel_open_session result");
                    }
                }

                HandleCommand::ChannelOpenDirectTcpip {
                    host,
                    port,
                    originator_host,
                    originator_port,
                    reply_tx,
                } => {
                    let result = handle
                        .channel_open_direct_tcpip(&host, port, &originator_host, originator_port)
                        .await;
                    if reply_tx.send(result).is_err() {
                        warn!("Caller dropped before receiving direct_tcpip result");
                    }
                }

                HandleCommand::ProbeDirectTcpip {
                    host,
                    port,
                    reply_tx,
                } => {
                    let result = match handle
                        .channel_open_direct_tcpip(&host, port, "127.0.0.1", 0)
                        .await
                    {
                        Ok(channel) => {
                            let _ = channel.close().await;
                            Ok(())
                        }
                        Err(e) => Err(e),
                    };
                    debug!("direct-tcpip probe {}:{} on {}: {:?}", host, port, label, result.is_ok());
                    let _ = reply_tx.send(result);
                }

                HandleCommand::TcpipForward {
                    address,
                    port,
                    reply_tx,
                } => {
                    let result = handle.tcpip_forward(&address, port).await;
                    match &result {
                        Ok(bound_port) => {
                            let bound_port = *bound_port;
                            if reply_tx.send(result).is_err() {
                                // Nobody will ever cancel it otherwise
                                warn!(
                                    "Caller dropped after tcpip_forward succeeded. \
                                     Cancelling orphaned forward {}:{}",
                                    address, bound_port
                                );
                                let _ = handle.cancel_tcpip_forward(&address, bound_port).await;
                            }
                        }
                        Err(_) => {
                            let _ = reply_tx.send(result);
                        }
                    }
                }

                HandleCommand::CancelTcpipForward {
                    address,
                    port,
                    reply_tx,
                } => {
                    let result = handle.cancel_tcpip_forward(&address, port).await;
                    if reply_tx.send(result).is_err() {
                        debug!("Caller dropped before receiving cancel_tcpip_forward result");
                    }
                }

                HandleCommand::Ping { reply_tx } => {
                    let result = match tokio::time::timeout(
                        KEEPALIVE_TIMEOUT,
                        handle.send_keepalive(true),
                    )
                    .await
                    {
                        Ok(Ok(())) => PingResult::Ok,
                        Ok(Err(e)) => {
                            let error_str = format!("{:?}", e);
                            if error_str.contains("Disconnect")
                                || error_str.contains("disconnect")
                            {
                                warn!("Keepalive SSH disconnect for {}: {:?}", label, e);
                                PingResult::IoError
                            } else {
                                warn!("Keepalive SSH error for {} (soft failure): {:?}", label, e);
                                PingResult::Timeout
                            }
                        }
                        Err(_) => {
                            warn!("Keepalive timeout for {} ({}s)", label, KEEPALIVE_TIMEOUT.as_secs());
                            PingResult::Timeout
                        }
                    };
                    let _ = reply_tx.send(result);
                }

                HandleCommand::Disconnect => {
                    info!("Disconnect requested for {}", label);
                    break;
                }
            }
        }

        let _ = disconnect_tx_clone.send(());

        drain_pending_commands(&mut cmd_rx);

        let _ = handle
            .disconnect(russh::Disconnect::ByApplication, "Session closed", "en")
            .await;
        info!("Handle owner task terminated for {}", label);
    });

    HandleController::new(cmd_tx, disconnect_tx)
}

/// Fail every queued command with `Disconnect` after the loop has exited.
pub(crate) fn drain_pending_commands(cmd_rx: &mut mpsc::Receiver<HandleCommand>) {
    cmd_rx.close();

    while let Ok(cmd) = cmd_rx.try_recv() {
        match cmd {
            HandleCommand::ChannelOpenSession { reply_tx } => {
                let _ = reply_tx.send(Err(russh::Error::Disconnect));
            }
            HandleCommand::ChannelOpenDirectTcpip { reply_tx, .. } => {
                let _ = reply_tx.send(Err(russh::Error::Disconnect));
            }
            HandleCommand::ProbeDirectTcpip { reply_tx, .. } => {
                let _ = reply_tx.send(Err(russh::Error::Disconnect));
            }
            HandleCommand::TcpipForward { reply_tx, .. } => {
                let _ = reply_tx.send(Err(russh::Error::Disconnect));
            }
            HandleCommand::CancelTcpipForward { reply_tx, .. } => {
                let _ = reply_tx.send(Err(russh::Error::Disconnect));
            }
            HandleCommand::Ping { reply_tx } => {
                let _ = reply_tx.send(PingResult::IoError);
            }
            HandleCommand::Disconnect => {}
        }
    }
}
