//! Scripted connections for tests.
//!
//! `FakeConnector` hands out controllers backed by a small owner task that
//! answers keepalives, forwards and probes without any network. Connections
//! can be made unreachable, rejected or severed per host name, and connections
//! that asked for forwarding can be handed in-memory forwarded channels.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::io::{duplex, DuplexStream};
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;

use super::client::{ForwardedChannel, ForwardedSender};
use super::config::{AuthMethod, HostConfig};
use super::connector::Connector;
use super::error::SshError;
use super::handle_owner::{drain_pending_commands, HandleCommand, HandleController, PingResult};

/// Password-auth host config whose `host` is `name`.
pub(crate) fn host(name: &str) -> HostConfig {
    HostConfig {
        host: name.to_string(),
        port: 22,
        username: "tester".to_string(),
        auth: AuthMethod::Password {
            password: "secret".to_string(),
        },
        timeout_secs: None,
        host_key_fingerprint: None,
    }
}

#[derive(Default)]
struct FakeInner {
    connects: AtomicUsize,
    per_host: Mutex<HashMap<String, usize>>,
    unreachable: Mutex<HashSet<String>>,
    auth_rejected: Mutex<HashSet<String>>,
    probe_fails: Mutex<HashSet<String>>,
    connect_delay: Mutex<Duration>,
    live: Mutex<Vec<LiveConnection>>,
    open: Mutex<HashMap<String, usize>>,
    pings: Mutex<HashMap<String, usize>>,
}

struct LiveConnection {
    id: usize,
    host: String,
    kill: CancellationToken,
    forwarded_tx: Option<ForwardedSender>,
}

/// In-memory forwarded channel as the server would open it for `port`
fn forwarded_channel(port: u32) -> (ForwardedChannel, DuplexStream) {
    let (near, far) = duplex(4096);
    let channel = ForwardedChannel {
        stream: Box::new(near),
        connected_address: "127.0.0.1".to_string(),
        connected_port: port,
        originator_address: "127.0.0.1".to_string(),
        originator_port: 50_000,
    };
    (channel, far)
}

#[derive(Clone, Default)]
pub(crate) struct FakeConnector {
    inner: Arc<FakeInner>,
}

impl FakeConnector {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn total_connects(&self) -> usize {
        self.inner.connects.load(Ordering::SeqCst)
    }

    pub(crate) fn connects_to(&self, name: &str) -> usize {
        self.inner.per_host.lock().get(name).copied().unwrap_or(0)
    }

    pub(crate) fn set_unreachable(&self, name: &str, unreachable: bool) {
        let mut set = self.inner.unreachable.lock();
        if unreachable {
            set.insert(name.to_string());
        } else {
            set.remove(name);
        }
    }

    pub(crate) fn reject_auth(&self, name: &str) {
        self.inner.auth_rejected.lock().insert(name.to_string());
    }

    pub(crate) fn fail_probes(&self, name: &str, fail: bool) {
        let mut set = self.inner.probe_fails.lock();
        if fail {
            set.insert(name.to_string());
        } else {
            set.remove(name);
        }
    }

    pub(crate) fn set_connect_delay(&self, delay: Duration) {
        *self.inner.connect_delay.lock() = delay;
    }

    /// Keepalive round trips answered for `name`
    pub(crate) fn pings_to(&self, name: &str) -> usize {
        self.inner.pings.lock().get(name).copied().unwrap_or(0)
    }

    /// Connections to `name` whose owner task is still running
    pub(crate) fn open_connections(&self, name: &str) -> usize {
        self.inner.open.lock().get(name).copied().unwrap_or(0)
    }

    /// Deliver a forwarded channel on the newest forwarding connection to
    /// `name`. Returns the client end, or None if nothing is listening.
    pub(crate) fn forward(&self, name: &str, port: u32) -> Option<DuplexStream> {
        let tx = self
            .inner
            .live
            .lock()
            .iter()
            .rev()
            .filter(|conn| conn.host == name)
            .find_map(|conn| conn.forwarded_tx.clone())?;
        let (channel, client) = forwarded_channel(port);
        tx.try_send(channel).ok()?;
        Some(client)
    }

    /// Drop every live connection to `name`, as if the network went away.
    pub(crate) fn sever(&self, name: &str) {
        let mut live = self.inner.live.lock();
        live.retain(|conn| {
            if conn.host == name {
                conn.kill.cancel();
                false
            } else {
                true
            }
        });
    }

    pub(crate) fn sever_all(&self) {
        for conn in self.inner.live.lock().drain(..) {
            conn.kill.cancel();
        }
    }
}

#[async_trait]
impl Connector for FakeConnector {
    async fn connect(
        &self,
        config: &HostConfig,
        _label: &str,
        forwarded_tx: Option<ForwardedSender>,
    ) -> Result<HandleController, SshError> {
        let id = self.inner.connects.fetch_add(1, Ordering::SeqCst);
        *self
            .inner
            .per_host
            .lock()
            .entry(config.host.clone())
            .or_insert(0) += 1;

        let delay = *self.inner.connect_delay.lock();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        if self.inner.unreachable.lock().contains(&config.host) {
            return Err(SshError::ConnectTimeout(format!("{} unreachable", config.host)));
        }
        if self.inner.auth_rejected.lock().contains(&config.host) {
            return Err(SshError::AuthenticationFailed(
                "Authentication rejected by server".into(),
            ));
        }

        let token = CancellationToken::new();
        self.inner.live.lock().push(LiveConnection {
            id,
            host: config.host.clone(),
            kill: token.clone(),
            forwarded_tx: forwarded_tx.clone(),
        });

        Ok(spawn_fake_owner(
            id,
            config.host.clone(),
            self.inner.clone(),
            token,
            forwarded_tx,
        ))
    }
}

fn spawn_fake_owner(
    id: usize,
    name: String,
    inner: Arc<FakeInner>,
    kill: CancellationToken,
    forwarded_tx: Option<ForwardedSender>,
) -> HandleController {
    let (cmd_tx, mut cmd_rx) = mpsc::channel::<HandleCommand>(64);
    let (disconnect_tx, _) = broadcast::channel::<()>(1);
    let disconnect_tx_clone = disconnect_tx.clone();
    *inner.open.lock().entry(name.clone()).or_insert(0) += 1;

    tokio::spawn(async move {
        let mut bound = HashSet::new();
        loop {
            let cmd = tokio::select! {
                biased;
                _ = kill.cancelled() => break,
                cmd = cmd_rx.recv() => match cmd {
                    Some(cmd) => cmd,
                    None => break,
                },
            };
            match cmd {
                HandleCommand::ChannelOpenSession { reply_tx } => {
                    let _ = reply_tx.send(Err(russh::Error::Disconnect));
                }
                HandleCommand::ChannelOpenDirectTcpip { reply_tx, .. } => {
                    let _ = reply_tx.send(Err(russh::Error::Disconnect));
                }
                HandleCommand::ProbeDirectTcpip { port, reply_tx, .. } => {
                    let result = if inner.probe_fails.lock().contains(&name) {
                        Err(russh::Error::Disconnect)
                    } else {
                        Ok(())
                    };
                    // Connecting to our own forwarded port comes back as a
                    // forwarded channel, like a real server does
                    if result.is_ok() && bound.contains(&port) {
                        if let Some(tx) = &forwarded_tx {
                            let (channel, _client) = forwarded_channel(port);
                            let _ = tx.try_send(channel);
                        }
                    }
                    let _ = reply_tx.send(result);
                }
                HandleCommand::TcpipForward { port, reply_tx, .. } => {
                    let port = if port == 0 { 40_000 } else { port };
                    bound.insert(port);
                    let _ = reply_tx.send(Ok(port));
                }
                HandleCommand::CancelTcpipForward { port, reply_tx, .. } => {
                    bound.remove(&port);
                    let _ = reply_tx.send(Ok(()));
                }
                HandleCommand::Ping { reply_tx } => {
                    *inner.pings.lock().entry(name.clone()).or_insert(0) += 1;
                    let _ = reply_tx.send(PingResult::Ok);
                }
                HandleCommand::Disconnect => break,
            }
        }

        inner.live.lock().retain(|conn| conn.id != id);
        if let Some(count) = inner.open.lock().get_mut(&name) {
            *count = count.saturating_sub(1);
        }
        let _ = disconnect_tx_clone.send(());
        drain_pending_commands(&mut cmd_rx);
    });

    HandleController::new(cmd_tx, disconnect_tx)
}
