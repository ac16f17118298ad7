//! Tunnel Runtime
//!
//! One task per started tunnel drives the reconnect state machine. The task
//! owns nothing the manager cannot reach: both connection handles live in
//! `handles` so a stop can close them whatever the task is doing.
//!
//! Transitions are serialized by `transition_lock` and persisted before the
//! event goes out, so subscribers and the store agree on the order. Once a
//! stop has begun only DISCONNECTING and DISCONNECTED may be written. The
//! stop sequence runs in its own task so it completes even when the caller
//! that asked for it goes away.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::events::TunnelEventEmitter;
use super::relay::{run_dispatcher, DestinationDialer, TunnelStatsAtomic};
use super::types::{TunnelConfig, TunnelSnapshot, TunnelState};
use crate::config::HostStore;
use crate::ssh::{ConnectionHandle, Connector, ForwardedChannel, PingResult};
use crate::state::TunnelStore;

/// Forwarded channels queued before the dispatcher picks them up
const FORWARDED_QUEUE: usize = 64;

/// Consecutive failed heartbeats that count as a broken link
const HEARTBEAT_FAILURE_LIMIT: u32 = 2;

/// How long the listener check's own forwarded channel may take to arrive
const LISTENER_ECHO_WINDOW: Duration = Duration::from_millis(500);

/// Dependencies shared by every runtime of one manager
pub(crate) struct RuntimeContext {
    pub connector: Arc<dyn Connector>,
    pub hosts: Arc<dyn HostStore>,
    pub store: Arc<dyn TunnelStore>,
    pub events: TunnelEventEmitter,
    pub heartbeat_interval: Duration,
    pub verify_timeout: Duration,
}

#[derive(Debug, Clone)]
struct RuntimeStatus {
    state: TunnelState,
    attempt: u32,
    last_error: Option<String>,
    bound_port: Option<u32>,
}

/// Both sides of an established tunnel
struct Link {
    source: Arc<ConnectionHandle>,
    destination: Arc<ConnectionHandle>,
    source_disconnect: broadcast::Receiver<()>,
    destination_disconnect: broadcast::Receiver<()>,
    /// Stops the dispatcher and its relays
    relays: CancellationToken,
}

pub struct TunnelRuntime {
    config: TunnelConfig,
    status: RwLock<RuntimeStatus>,
    stats: Arc<TunnelStatsAtomic>,
    handles: Mutex<Vec<Arc<ConnectionHandle>>>,
    cancel: CancellationToken,
    stopping: AtomicBool,
    /// Fires once the stop sequence has finished
    stopped: CancellationToken,
    transition_lock: tokio::sync::Mutex<()>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl TunnelRuntime {
    pub(crate) fn new(config: TunnelConfig) -> Self {
        Self {
            config,
            status: RwLock::new(RuntimeStatus {
                state: TunnelState::Disconnected,
                attempt: 0,
                last_error: None,
                bound_port: None,
            }),
            stats: Arc::new(TunnelStatsAtomic::new()),
            handles: Mutex::new(Vec::new()),
            cancel: CancellationToken::new(),
            stopping: AtomicBool::new(false),
            stopped: CancellationToken::new(),
            transition_lock: tokio::sync::Mutex::new(()),
            task: Mutex::new(None),
        }
    }

    pub fn id(&self) -> &str {
        &self.config.id
    }

    pub fn config(&self) -> &TunnelConfig {
        &self.config
    }

    pub fn state(&self) -> TunnelState {
        self.status.read().state
    }

    pub fn snapshot(&self) -> TunnelSnapshot {
        let status = self.status.read().clone();
        TunnelSnapshot {
            id: self.config.id.clone(),
            name: self.config.name.clone(),
            state: status.state,
            attempt: status.attempt,
            last_error: status.last_error,
            bound_port: status.bound_port,
            stats: self.stats.to_stats(),
        }
    }

    /// Whether this runtime still owns its tunnel id.
    ///
    /// A freshly spawned runtime reads DISCONNECTED until its task makes the
    /// first transition, so a live task counts as well.
    pub(crate) fn is_claimed(&self) -> bool {
        if self.stopping.load(Ordering::SeqCst) {
            return !self.stopped.is_cancelled();
        }
        match self.state() {
            TunnelState::Failed => false,
            state if state.is_active() => true,
            _ => self
                .task
                .lock()
                .as_ref()
                .is_some_and(|task| !task.is_finished()),
        }
    }

    /// Spawn the state machine task.
    pub(crate) fn spawn(self: &Arc<Self>, ctx: Arc<RuntimeContext>) {
        let runtime = self.clone();
        let handle = tokio::spawn(async move { runtime.run(ctx).await });
        *self.task.lock() = Some(handle);
    }

    /// Apply a transition, persist it and publish it.
    ///
    /// Returns false when the transition was refused, either because a stop
    /// is in progress or because it is not a legal edge.
    async fn transition(
        &self,
        ctx: &RuntimeContext,
        next: TunnelState,
        attempt: u32,
        reason: Option<String>,
    ) -> bool {
        let _guard = self.transition_lock.lock().await;

        let stop_edge = matches!(
            next,
            TunnelState::Disconnecting | TunnelState::Disconnected
        );
        if self.stopping.load(Ordering::SeqCst) && !stop_edge {
            debug!(
                "Tunnel {} is stopping, dropping transition to {}",
                self.config.id, next
            );
            return false;
        }

        {
            let mut status = self.status.write();
            if !status.state.can_transition_to(next) {
                warn!(
                    "Tunnel {}: refusing transition {} -> {}",
                    self.config.id, status.state, next
                );
                return false;
            }
            status.state = next;
            status.attempt = attempt;
            if reason.is_some() {
                status.last_error = reason.clone();
            }
        }

        info!(
            "Tunnel {} ({}) -> {} (attempt {}){}",
            self.config.name,
            self.config.id,
            next,
            attempt,
            reason
                .as_deref()
                .map(|r| format!(": {}", r))
                .unwrap_or_default()
        );

        if let Err(e) = ctx.store.set_connection_state(&self.config.id, next).await {
            warn!(
                "Failed to persist state {} for tunnel {}: {}",
                next, self.config.id, e
            );
        }
        ctx.events.emit(&self.config.id, next, attempt, reason);
        true
    }

    async fn run(self: Arc<Self>, ctx: Arc<RuntimeContext>) {
        let budget = self.config.attempt_budget();
        let mut attempt = 0u32;

        loop {
            attempt += 1;
            if !self
                .transition(&ctx, TunnelState::Connecting, attempt, None)
                .await
            {
                return;
            }

            let established = tokio::select! {
                _ = self.cancel.cancelled() => return,
                result = self.establish(&ctx, attempt) => result,
            };

            match established {
                Ok(link) => {
                    let broken = tokio::select! {
                        _ = self.cancel.cancelled() => return,
                        reason = self.hold(&ctx, link, attempt) => reason,
                    };
                    let Some(reason) = broken else {
                        return;
                    };

                    self.close_handles().await;
                    if !self
                        .transition(&ctx, TunnelState::Unstable, 0, Some(reason.clone()))
                        .await
                    {
                        return;
                    }
                    if !self
                        .transition(&ctx, TunnelState::Retrying, 0, Some(reason))
                        .await
                    {
                        return;
                    }
                    // A link that worked gets a fresh budget
                    attempt = 0;
                }
                Err(reason) => {
                    self.close_handles().await;
                    if attempt >= budget {
                        error!(
                            "Tunnel {} failed after {} attempt(s): {}",
                            self.config.id, attempt, reason
                        );
                        self.transition(&ctx, TunnelState::Failed, attempt, Some(reason))
                            .await;
                        return;
                    }
                    if !self
                        .transition(&ctx, TunnelState::Retrying, attempt, Some(reason))
                        .await
                    {
                        return;
                    }
                }
            }

            tokio::select! {
                _ = self.cancel.cancelled() => return,
                _ = tokio::time::sleep(self.config.retry_interval()) => {}
            }
        }
    }

    /// CONNECTING and VERIFYING. On error the caller closes whatever was opened.
    async fn establish(&self, ctx: &RuntimeContext, attempt: u32) -> Result<Link, String> {
        let source_config = ctx
            .hosts
            .get_host(&self.config.source.host_id)
            .await
            .map_err(|e| format!("Source host: {}", e))?;
        let destination_config = ctx
            .hosts
            .get_host(&self.config.destination.host_id)
            .await
            .map_err(|e| format!("Destination host: {}", e))?;

        let (forwarded_tx, mut forwarded_rx) = mpsc::channel::<ForwardedChannel>(FORWARDED_QUEUE);

        let source = ConnectionHandle::connect(
            ctx.connector.as_ref(),
            &source_config,
            &format!("tunnel {} source", self.config.name),
            Some(forwarded_tx),
        )
        .await
        .map_err(|e| format!("Failed to connect to source {}: {}", source_config.label(), e))?;
        let source = Arc::new(source);
        let source_disconnect = source.subscribe_disconnect();
        self.handles.lock().push(source.clone());

        let destination = ConnectionHandle::connect(
            ctx.connector.as_ref(),
            &destination_config,
            &format!("tunnel {} destination", self.config.name),
            None,
        )
        .await
        .map_err(|e| {
            format!(
                "Failed to connect to destination {}: {}",
                destination_config.label(),
                e
            )
        })?;
        let destination = Arc::new(destination);
        let destination_disconnect = destination.subscribe_disconnect();
        self.handles.lock().push(destination.clone());

        let bound_port = source
            .controller()
            .tcpip_forward(&self.config.source.address, self.config.source.port as u32)
            .await
            .map_err(|e| {
                format!(
                    "Failed to bind {}:{} on source: {}",
                    self.config.source.address, self.config.source.port, e
                )
            })?;
        self.status.write().bound_port = Some(bound_port);

        if !self
            .transition(ctx, TunnelState::Verifying, attempt, None)
            .await
        {
            return Err("Stopped".to_string());
        }

        let target = &self.config.destination;
        self.probe(ctx, &destination, &target.address, target.port as u32)
            .await
            .map_err(|e| format!("Destination check failed: {}", e))?;

        let listener = loopback_probe_address(&self.config.source.address);
        self.probe(ctx, &source, listener, bound_port)
            .await
            .map_err(|e| format!("Source listener check failed: {}", e))?;

        // The check connected to our own listener; that connection comes back
        // as a forwarded channel and must not reach the destination
        match tokio::time::timeout(LISTENER_ECHO_WINDOW, forwarded_rx.recv()).await {
            Ok(Some(echo)) => debug!(
                "Tunnel {} dropped listener check channel from {}:{}",
                self.config.id, echo.originator_address, echo.originator_port
            ),
            Ok(None) => return Err("Source connection lost".to_string()),
            Err(_) => debug!(
                "Tunnel {} saw no listener check channel within {}ms",
                self.config.id,
                LISTENER_ECHO_WINDOW.as_millis()
            ),
        }

        let dialer: Arc<dyn DestinationDialer> = Arc::new(destination.controller().clone());
        let relays = self.cancel.child_token();
        tokio::spawn(run_dispatcher(
            self.config.id.clone(),
            forwarded_rx,
            dialer,
            self.config.destination.clone(),
            self.stats.clone(),
            relays.clone(),
        ));

        Ok(Link {
            source,
            destination,
            source_disconnect,
            destination_disconnect,
            relays,
        })
    }

    async fn probe(
        &self,
        ctx: &RuntimeContext,
        handle: &ConnectionHandle,
        host: &str,
        port: u32,
    ) -> Result<(), String> {
        match tokio::time::timeout(
            ctx.verify_timeout,
            handle.controller().probe_direct_tcpip(host, port),
        )
        .await
        {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(e.to_string()),
            Err(_) => Err(format!(
                "{}:{} did not answer within {}s",
                host,
                port,
                ctx.verify_timeout.as_secs()
            )),
        }
    }

    /// CONNECTED. Returns the reason once the link breaks.
    async fn hold(&self, ctx: &RuntimeContext, mut link: Link, attempt: u32) -> Option<String> {
        if !self
            .transition(ctx, TunnelState::Connected, attempt, None)
            .await
        {
            link.relays.cancel();
            return None;
        }

        let mut heartbeat = tokio::time::interval(ctx.heartbeat_interval);
        heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // First tick fires immediately
        heartbeat.tick().await;
        let mut failures = 0u32;

        let reason = loop {
            tokio::select! {
                _ = link.source_disconnect.recv() => {
                    break "Source connection lost".to_string();
                }
                _ = link.destination_disconnect.recv() => {
                    break "Destination connection lost".to_string();
                }
                _ = heartbeat.tick() => {
                    let source = link.source.controller().ping().await;
                    let destination = link.destination.controller().ping().await;
                    if source == PingResult::Ok && destination == PingResult::Ok {
                        failures = 0;
                        continue;
                    }
                    failures += 1;
                    warn!(
                        "Tunnel {} heartbeat failed ({}/{}): source {:?}, destination {:?}",
                        self.config.id, failures, HEARTBEAT_FAILURE_LIMIT, source, destination
                    );
                    if failures >= HEARTBEAT_FAILURE_LIMIT {
                        break "Keepalive failed".to_string();
                    }
                }
            }
        };

        link.relays.cancel();
        Some(reason)
    }

    /// Close every connection this runtime opened.
    async fn close_handles(&self) {
        let handles: Vec<_> = self.handles.lock().drain(..).collect();
        self.status.write().bound_port = None;
        for handle in handles {
            handle.close().await;
        }
    }

    /// DISCONNECTING -> DISCONNECTED. Returns false if a stop already ran.
    ///
    /// A second caller waits for the first stop to finish.
    pub(crate) async fn stop(
        self: &Arc<Self>,
        ctx: &Arc<RuntimeContext>,
        join_timeout: Duration,
    ) -> bool {
        if self.stopping.swap(true, Ordering::SeqCst) {
            self.stopped.cancelled().await;
            return false;
        }

        let runtime = self.clone();
        let ctx = ctx.clone();
        let sequence =
            tokio::spawn(async move { runtime.stop_sequence(&ctx, join_timeout).await });
        if let Err(e) = sequence.await {
            error!("Tunnel {} stop sequence failed: {}", self.config.id, e);
        }
        true
    }

    async fn stop_sequence(&self, ctx: &RuntimeContext, join_timeout: Duration) {
        let _done = self.stopped.clone().drop_guard();

        if self.state() == TunnelState::Disconnected {
            self.cancel.cancel();
            return;
        }

        self.transition(ctx, TunnelState::Disconnecting, 0, None)
            .await;
        self.cancel.cancel();

        let task = self.task.lock().take();
        if let Some(mut task) = task {
            if tokio::time::timeout(join_timeout, &mut task).await.is_err() {
                warn!(
                    "Tunnel {} task did not stop within {}s, aborting",
                    self.config.id,
                    join_timeout.as_secs()
                );
                task.abort();
            }
        }

        let bound_port = self.status.read().bound_port;
        if let Some(port) = bound_port {
            let source = self.handles.lock().first().cloned();
            if let Some(source) = source {
                let _ = source
                    .controller()
                    .cancel_tcpip_forward(&self.config.source.address, port)
                    .await;
            }
        }
        self.close_handles().await;

        self.transition(ctx, TunnelState::Disconnected, 0, None)
            .await;
    }
}

/// Address that reaches a remote listener bound on `bind_address`
fn loopback_probe_address(bind_address: &str) -> &str {
    match bind_address {
        "" | "*" | "0.0.0.0" | "localhost" => "127.0.0.1",
        "::" => "::1",
        other => other,
    }
}
