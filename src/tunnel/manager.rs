//! Tunnel Manager
//!
//! Owns the runtimes of all started tunnels. Tunnel definitions come from the
//! [`TunnelStore`]; the manager only ever writes their connection state.
//! Failures never surface as errors from the runtime: they end up as the
//! FAILED state plus a reason in the snapshot.

use std::sync::Arc;
use std::time::Duration;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures_util::future::join_all;
use thiserror::Error;
use tokio::sync::broadcast;
use tracing::{info, warn};

use super::events::{TunnelEvent, TunnelEventEmitter};
use super::runtime::{RuntimeContext, TunnelRuntime};
use super::types::{TunnelSnapshot, TunnelState, TunnelStats};
use crate::config::{HostStore, ServerConfig};
use crate::ssh::{Connector, ErrorKind};
use crate::state::{StateError, TunnelRecord, TunnelStore};

/// How long a stop waits for the runtime task before aborting it
const STOP_JOIN_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Error, Debug)]
pub enum TunnelError {
    #[error("Tunnel not found: {0}")]
    NotFound(String),

    #[error("Tunnel {id} is already running ({state})")]
    AlreadyActive { id: String, state: TunnelState },

    #[error(transparent)]
    State(#[from] StateError),
}

impl TunnelError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            TunnelError::NotFound(_) => ErrorKind::NotFound,
            TunnelError::AlreadyActive { .. } => ErrorKind::Internal,
            TunnelError::State(e) => e.kind(),
        }
    }
}

/// Timing knobs for tunnel runtimes
#[derive(Debug, Clone, Copy)]
pub struct TunnelSettings {
    pub heartbeat_interval: Duration,
    pub verify_timeout: Duration,
}

impl From<&ServerConfig> for TunnelSettings {
    fn from(config: &ServerConfig) -> Self {
        Self {
            heartbeat_interval: config.tunnel_heartbeat(),
            verify_timeout: config.tunnel_verify_timeout(),
        }
    }
}

impl Default for TunnelSettings {
    fn default() -> Self {
        Self::from(&ServerConfig::default())
    }
}

pub struct TunnelManager {
    ctx: Arc<RuntimeContext>,
    runtimes: DashMap<String, Arc<TunnelRuntime>>,
}

impl TunnelManager {
    pub fn new(
        connector: Arc<dyn Connector>,
        hosts: Arc<dyn HostStore>,
        store: Arc<dyn TunnelStore>,
        settings: TunnelSettings,
    ) -> Self {
        Self {
            ctx: Arc::new(RuntimeContext {
                connector,
                hosts,
                store,
                events: TunnelEventEmitter::new(),
                heartbeat_interval: settings.heartbeat_interval,
                verify_timeout: settings.verify_timeout,
            }),
            runtimes: DashMap::new(),
        }
    }

    /// Subscribe to state changes of every tunnel
    pub fn subscribe(&self) -> broadcast::Receiver<TunnelEvent> {
        self.ctx.events.subscribe()
    }

    /// Start a tunnel from DISCONNECTED or FAILED.
    pub async fn start(&self, tunnel_id: &str) -> Result<TunnelSnapshot, TunnelError> {
        let record = self
            .ctx
            .store
            .get(tunnel_id)
            .await?
            .ok_or_else(|| TunnelError::NotFound(tunnel_id.to_string()))?;

        let runtime = Arc::new(TunnelRuntime::new(record.config));
        // Spawned while the entry is held so a concurrent start sees the task
        match self.runtimes.entry(tunnel_id.to_string()) {
            Entry::Occupied(mut occupied) => {
                let current = occupied.get();
                if current.is_claimed() {
                    return Err(TunnelError::AlreadyActive {
                        id: tunnel_id.to_string(),
                        state: current.state(),
                    });
                }
                info!("Starting tunnel {} ({})", runtime.config().name, tunnel_id);
                runtime.spawn(self.ctx.clone());
                occupied.insert(runtime.clone());
            }
            Entry::Vacant(vacant) => {
                info!("Starting tunnel {} ({})", runtime.config().name, tunnel_id);
                runtime.spawn(self.ctx.clone());
                vacant.insert(runtime.clone());
            }
        }

        Ok(runtime.snapshot())
    }

    /// Stop a tunnel from any state. Stopping a DISCONNECTED tunnel is a no-op.
    pub async fn stop(&self, tunnel_id: &str) -> Result<(), TunnelError> {
        let runtime = self.runtimes.get(tunnel_id).map(|r| r.value().clone());
        match runtime {
            Some(runtime) => {
                if runtime.stop(&self.ctx, STOP_JOIN_TIMEOUT).await {
                    info!("Tunnel {} stopped", tunnel_id);
                }
                Ok(())
            }
            None => {
                // Known but never started in this process
                self.ctx
                    .store
                    .get(tunnel_id)
                    .await?
                    .map(|_| ())
                    .ok_or_else(|| TunnelError::NotFound(tunnel_id.to_string()))
            }
        }
    }

    pub async fn restart(&self, tunnel_id: &str) -> Result<TunnelSnapshot, TunnelError> {
        self.stop(tunnel_id).await?;
        self.start(tunnel_id).await
    }

    pub async fn state(&self, tunnel_id: &str) -> Result<TunnelSnapshot, TunnelError> {
        if let Some(runtime) = self.runtimes.get(tunnel_id) {
            return Ok(runtime.snapshot());
        }
        let record = self
            .ctx
            .store
            .get(tunnel_id)
            .await?
            .ok_or_else(|| TunnelError::NotFound(tunnel_id.to_string()))?;
        Ok(idle_snapshot(&record))
    }

    /// Snapshots of every stored tunnel
    pub async fn list(&self) -> Result<Vec<TunnelSnapshot>, TunnelError> {
        let records = self.ctx.store.list().await?;
        Ok(records
            .iter()
            .map(|record| match self.runtimes.get(&record.config.id) {
                Some(runtime) => runtime.snapshot(),
                None => idle_snapshot(record),
            })
            .collect())
    }

    /// Launch every `auto_start` tunnel once. Returns how many were started.
    ///
    /// Persisted states left over from a previous process are reset first.
    pub async fn start_auto(&self) -> Result<usize, TunnelError> {
        let records = self.ctx.store.list().await?;
        let mut started = 0;

        for record in records {
            let id = record.config.id.clone();
            if record.connection_state.is_active() && !self.runtimes.contains_key(&id) {
                if let Err(e) = self
                    .ctx
                    .store
                    .set_connection_state(&id, TunnelState::Disconnected)
                    .await
                {
                    warn!("Failed to reset stale state of tunnel {}: {}", id, e);
                }
            }

            if !record.config.auto_start {
                continue;
            }
            match self.start(&id).await {
                Ok(_) => started += 1,
                Err(e) => warn!("Auto-start of tunnel {} skipped: {}", id, e),
            }
        }

        if started > 0 {
            info!("Auto-started {} tunnel(s)", started);
        }
        Ok(started)
    }

    /// Stop every runtime concurrently.
    pub async fn shutdown(&self) {
        let runtimes: Vec<_> = self.runtimes.iter().map(|r| r.value().clone()).collect();
        info!("Shutting down {} tunnel runtime(s)", runtimes.len());
        join_all(
            runtimes
                .iter()
                .map(|runtime| runtime.stop(&self.ctx, STOP_JOIN_TIMEOUT)),
        )
        .await;
    }
}

fn idle_snapshot(record: &TunnelRecord) -> TunnelSnapshot {
    // Only FAILED is meaningful without a live runtime
    let state = match record.connection_state {
        TunnelState::Failed => TunnelState::Failed,
        _ => TunnelState::Disconnected,
    };
    TunnelSnapshot {
        id: record.config.id.clone(),
        name: record.config.name.clone(),
        state,
        attempt: 0,
        last_error: None,
        bound_port: None,
        stats: TunnelStats::default(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MemoryHostStore;
    use crate::ssh::testing::{host, FakeConnector};
    use crate::state::MemoryTunnelStore;
    use crate::tunnel::{TunnelConfig, TunnelEndpoint};
    use TunnelState::*;

    struct Fixture {
        connector: FakeConnector,
        store: Arc<MemoryTunnelStore>,
        manager: TunnelManager,
    }

    fn tunnel(id: &str, max_retries: u32, auto_start: bool) -> TunnelConfig {
        TunnelConfig {
            id: id.into(),
            name: format!("{}-name", id),
            source: TunnelEndpoint {
                host_id: "bastion".into(),
                address: "localhost".into(),
                port: 15432,
            },
            destination: TunnelEndpoint {
                host_id: "db".into(),
                address: "localhost".into(),
                port: 5432,
            },
            max_retries,
            retry_interval_ms: 100,
            auto_start,
            pinned: false,
        }
    }

    async fn fixture(tunnels: Vec<TunnelConfig>, heartbeat: Duration) -> Fixture {
        let connector = FakeConnector::new();
        let hosts = Arc::new(MemoryHostStore::new());
        hosts.insert("bastion", host("bastion-host"));
        hosts.insert("db", host("db-host"));

        let store = Arc::new(MemoryTunnelStore::new());
        for config in tunnels {
            store.put(config).await.unwrap();
        }

        let manager = TunnelManager::new(
            Arc::new(connector.clone()),
            hosts,
            store.clone(),
            TunnelSettings {
                heartbeat_interval: heartbeat,
                verify_timeout: Duration::from_secs(1),
            },
        );
        Fixture {
            connector,
            store,
            manager,
        }
    }

    /// Collect states until `until` is seen.
    async fn states_until(
        rx: &mut broadcast::Receiver<TunnelEvent>,
        until: TunnelState,
    ) -> Vec<TunnelState> {
        let collect = async {
            let mut seen = Vec::new();
            loop {
                let event = rx.recv().await.unwrap();
                seen.push(event.state);
                if event.state == until {
                    return seen;
                }
            }
        };
        tokio::time::timeout(Duration::from_secs(5), collect)
            .await
            .unwrap_or_else(|_| panic!("tunnel never reached {}", until))
    }

    #[tokio::test]
    async fn test_unreachable_destination_exhausts_retries() {
        let f = fixture(vec![tunnel("t1", 3, false)], Duration::from_secs(10)).await;
        f.connector.set_unreachable("db-host", true);
        let mut rx = f.manager.subscribe();

        f.manager.start("t1").await.unwrap();

        let seen = states_until(&mut rx, Failed).await;
        assert_eq!(
            seen,
            vec![Connecting, Retrying, Connecting, Retrying, Connecting, Failed]
        );
        assert_eq!(f.connector.connects_to("db-host"), 3);

        // FAILED is sticky
        tokio::time::sleep(Duration::from_millis(350)).await;
        assert!(rx.try_recv().is_err());
        assert_eq!(f.connector.connects_to("db-host"), 3);

        let snapshot = f.manager.state("t1").await.unwrap();
        assert_eq!(snapshot.state, Failed);
        assert!(snapshot.last_error.unwrap().contains("destination"));
        let record = f.store.get("t1").await.unwrap().unwrap();
        assert_eq!(record.connection_state, Failed);
    }

    #[tokio::test]
    async fn test_zero_retries_attempts_once() {
        let f = fixture(vec![tunnel("t1", 0, false)], Duration::from_secs(10)).await;
        f.connector.set_unreachable("db-host", true);
        let mut rx = f.manager.subscribe();

        f.manager.start("t1").await.unwrap();
        assert_eq!(states_until(&mut rx, Failed).await, vec![Connecting, Failed]);
    }

    #[tokio::test]
    async fn test_verification_failure_retries() {
        let f = fixture(vec![tunnel("t1", 2, false)], Duration::from_secs(10)).await;
        f.connector.fail_probes("db-host", true);
        let mut rx = f.manager.subscribe();

        f.manager.start("t1").await.unwrap();
        let seen = states_until(&mut rx, Failed).await;
        assert_eq!(
            seen,
            vec![Connecting, Verifying, Retrying, Connecting, Verifying, Failed]
        );
    }

    #[tokio::test]
    async fn test_connect_then_stop() {
        let f = fixture(vec![tunnel("t1", 3, false)], Duration::from_secs(10)).await;
        let mut rx = f.manager.subscribe();

        f.manager.start("t1").await.unwrap();
        assert_eq!(
            states_until(&mut rx, Connected).await,
            vec![Connecting, Verifying, Connected]
        );

        let snapshot = f.manager.state("t1").await.unwrap();
        assert_eq!(snapshot.bound_port, Some(15432));

        f.manager.stop("t1").await.unwrap();
        assert_eq!(
            states_until(&mut rx, Disconnected).await,
            vec![Disconnecting, Disconnected]
        );
        assert_eq!(f.manager.state("t1").await.unwrap().state, Disconnected);

        // Second stop is a no-op
        f.manager.stop("t1").await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_start_while_active_is_rejected() {
        let f = fixture(vec![tunnel("t1", 3, false)], Duration::from_secs(10)).await;
        let mut rx = f.manager.subscribe();

        f.manager.start("t1").await.unwrap();
        states_until(&mut rx, Connected).await;

        let err = f.manager.start("t1").await.unwrap_err();
        assert!(matches!(err, TunnelError::AlreadyActive { state: Connected, .. }));
        f.manager.shutdown().await;
    }

    #[tokio::test]
    async fn test_broken_link_goes_unstable_then_retries() {
        let f = fixture(vec![tunnel("t1", 3, false)], Duration::from_secs(10)).await;
        let mut rx = f.manager.subscribe();

        f.manager.start("t1").await.unwrap();
        states_until(&mut rx, Connected).await;

        f.connector.sever("db-host");
        assert_eq!(
            states_until(&mut rx, Connected).await,
            vec![Unstable, Retrying, Connecting, Verifying, Connected]
        );
        f.manager.shutdown().await;
    }

    #[tokio::test]
    async fn test_restart_from_failed() {
        let f = fixture(vec![tunnel("t1", 1, false)], Duration::from_secs(10)).await;
        f.connector.set_unreachable("db-host", true);
        let mut rx = f.manager.subscribe();

        f.manager.start("t1").await.unwrap();
        states_until(&mut rx, Failed).await;

        f.connector.set_unreachable("db-host", false);
        f.manager.restart("t1").await.unwrap();
        let seen = states_until(&mut rx, Connected).await;
        assert_eq!(
            seen,
            vec![Disconnecting, Disconnected, Connecting, Verifying, Connected]
        );
        f.manager.shutdown().await;
    }

    #[tokio::test]
    async fn test_start_auto_only_launches_flagged() {
        let f = fixture(
            vec![tunnel("auto", 3, true), tunnel("manual", 3, false)],
            Duration::from_secs(10),
        )
        .await;
        f.store
            .set_connection_state("manual", Connected)
            .await
            .unwrap();

        assert_eq!(f.manager.start_auto().await.unwrap(), 1);

        // Stale state from a previous run is cleared
        let manual = f.store.get("manual").await.unwrap().unwrap();
        assert_eq!(manual.connection_state, Disconnected);

        let list = f.manager.list().await.unwrap();
        assert_eq!(list.len(), 2);
        f.manager.shutdown().await;
    }

    async fn eventually(check: impl Fn() -> bool) {
        for _ in 0..100 {
            if check() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition never held");
    }

    #[tokio::test]
    async fn test_concurrent_starts_spawn_one_runtime() {
        let f = fixture(vec![tunnel("t1", 3, false)], Duration::from_secs(10)).await;
        let mut rx = f.manager.subscribe();

        let (a, b) = tokio::join!(f.manager.start("t1"), f.manager.start("t1"));
        let rejected = [&a, &b]
            .iter()
            .filter(|r| matches!(r, Err(TunnelError::AlreadyActive { .. })))
            .count();
        assert_eq!(rejected, 1);
        assert!(a.is_ok() || b.is_ok());

        states_until(&mut rx, Connected).await;
        assert_eq!(f.connector.connects_to("bastion-host"), 1);
        assert_eq!(f.connector.connects_to("db-host"), 1);

        f.manager.shutdown().await;
        eventually(|| f.connector.open_connections("bastion-host") == 0).await;
        eventually(|| f.connector.open_connections("db-host") == 0).await;
    }

    #[tokio::test]
    async fn test_abandoned_stop_still_finishes() {
        let Fixture {
            connector, manager, ..
        } = fixture(vec![tunnel("t1", 3, false)], Duration::from_secs(10)).await;
        let manager = Arc::new(manager);
        let mut rx = manager.subscribe();

        manager.start("t1").await.unwrap();
        states_until(&mut rx, Connected).await;

        let stopper = {
            let manager = manager.clone();
            tokio::spawn(async move { manager.stop("t1").await })
        };
        // The requester goes away mid-stop
        states_until(&mut rx, Disconnecting).await;
        stopper.abort();

        assert_eq!(states_until(&mut rx, Disconnected).await, vec![Disconnected]);
        eventually(|| connector.open_connections("bastion-host") == 0).await;

        manager.start("t1").await.unwrap();
        states_until(&mut rx, Connected).await;
        manager.shutdown().await;
    }

    #[tokio::test]
    async fn test_stop_while_retrying_cancels_retry() {
        let mut config = tunnel("t1", 5, false);
        config.retry_interval_ms = 300;
        let f = fixture(vec![config], Duration::from_secs(10)).await;
        f.connector.set_unreachable("db-host", true);
        let mut rx = f.manager.subscribe();

        f.manager.start("t1").await.unwrap();
        states_until(&mut rx, Retrying).await;

        f.manager.stop("t1").await.unwrap();
        assert_eq!(
            states_until(&mut rx, Disconnected).await,
            vec![Disconnecting, Disconnected]
        );
        let connects = f.connector.total_connects();

        // The pending retry never fires
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert!(rx.try_recv().is_err());
        assert_eq!(f.connector.total_connects(), connects);
        assert_eq!(f.connector.open_connections("bastion-host"), 0);
        assert_eq!(f.manager.state("t1").await.unwrap().state, Disconnected);
    }

    #[tokio::test]
    async fn test_stop_while_connecting_closes_opened_side() {
        let f = fixture(vec![tunnel("t1", 3, false)], Duration::from_secs(10)).await;
        f.connector.set_connect_delay(Duration::from_millis(200));
        let mut rx = f.manager.subscribe();

        f.manager.start("t1").await.unwrap();
        states_until(&mut rx, Connecting).await;

        // Source is up, destination still dialing
        eventually(|| f.connector.open_connections("bastion-host") == 1).await;
        eventually(|| f.connector.connects_to("db-host") == 1).await;
        assert_eq!(f.connector.open_connections("db-host"), 0);

        f.manager.stop("t1").await.unwrap();
        assert_eq!(
            states_until(&mut rx, Disconnected).await,
            vec![Disconnecting, Disconnected]
        );
        eventually(|| f.connector.open_connections("bastion-host") == 0).await;

        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(f.connector.open_connections("db-host"), 0);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_listener_check_channel_is_not_relayed() {
        let f = fixture(vec![tunnel("t1", 3, false)], Duration::from_secs(10)).await;
        let mut rx = f.manager.subscribe();

        f.manager.start("t1").await.unwrap();
        states_until(&mut rx, Connected).await;
        tokio::time::sleep(Duration::from_millis(50)).await;

        let stats = f.manager.state("t1").await.unwrap().stats;
        assert_eq!(stats.connections_total, 0);
        f.manager.shutdown().await;
    }

    #[tokio::test]
    async fn test_forwarded_connection_reaches_dispatcher() {
        let f = fixture(vec![tunnel("t1", 3, false)], Duration::from_secs(10)).await;
        let mut rx = f.manager.subscribe();

        f.manager.start("t1").await.unwrap();
        states_until(&mut rx, Connected).await;

        let _client = f.connector.forward("bastion-host", 15432).unwrap();
        let mut stats = TunnelStats::default();
        for _ in 0..100 {
            stats = f.manager.state("t1").await.unwrap().stats;
            if stats.connections_total == 1 && stats.connections_active == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        // The scripted destination refuses direct-tcpip, so the slot is freed
        assert_eq!(stats.connections_total, 1);
        assert_eq!(stats.connections_active, 0);
        assert_eq!(f.manager.state("t1").await.unwrap().state, Connected);
        f.manager.shutdown().await;
    }

    #[tokio::test]
    async fn test_unknown_tunnel() {
        let f = fixture(vec![], Duration::from_secs(10)).await;
        assert_eq!(
            f.manager.start("ghost").await.unwrap_err().kind(),
            ErrorKind::NotFound
        );
        assert_eq!(
            f.manager.stop("ghost").await.unwrap_err().kind(),
            ErrorKind::NotFound
        );
    }
}
