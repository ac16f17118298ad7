//! Session Registry
//!
//! Maps a caller-chosen session id to one shared [`ConnectionHandle`].
//!
//! # Lanes
//!
//! ```text
//! session "tab-1" ──┬── Shared lane ── terminal + file leases ── handle A
//!                   └── Status lane ── status leases ─────────── handle B
//! ```
//!
//! Terminal and file operations on one tab share a connection. Status
//! polling gets its own so a failed probe never tears down a terminal.
//!
//! # Grace period
//!
//! - Ref count drops to zero: a grace timer starts (default 10 s)
//! - Acquire before it fires: timer cancelled, connection reused
//! - Timer fires with ref count still zero: entry removed, handle closed,
//!   close hooks told the session id

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicI64, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::ssh::{ConnectionHandle, Connector, ErrorKind, HostConfig, SshError, TransportState};

/// Default idle grace period before an unused connection is closed
pub const DEFAULT_GRACE_PERIOD: Duration = Duration::from_secs(10);

/// Why a caller holds a connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Purpose {
    Terminal,
    File,
    Status,
}

impl Purpose {
    pub fn lane(self) -> Lane {
        match self {
            Purpose::Terminal | Purpose::File => Lane::Shared,
            Purpose::Status => Lane::Status,
        }
    }
}

/// Which handle of a session a purpose maps onto
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Lane {
    Shared,
    Status,
}

impl fmt::Display for Lane {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Lane::Shared => write!(f, "shared"),
            Lane::Status => write!(f, "status"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct SessionKey {
    session_id: String,
    lane: Lane,
}

impl SessionKey {
    fn new(session_id: &str, lane: Lane) -> Self {
        Self {
            session_id: session_id.to_string(),
            lane,
        }
    }
}

#[derive(Error, Debug)]
pub enum RegistryError {
    #[error(transparent)]
    Ssh(#[from] SshError),

    #[error("Session not found: {0}")]
    NotFound(String),

    #[error("Session {session_id} holds no {purpose:?} lease")]
    LeaseNotHeld { session_id: String, purpose: Purpose },
}

impl RegistryError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            RegistryError::Ssh(e) => e.kind(),
            RegistryError::NotFound(_) => ErrorKind::NotFound,
            RegistryError::LeaseNotHeld { .. } => ErrorKind::Internal,
        }
    }
}

impl Serialize for RegistryError {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}

/// Connectivity answer for `status`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SessionStatus {
    pub connected: bool,
}

/// Snapshot of one session lane
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionInfo {
    pub session_id: String,
    pub lane: Lane,
    pub host: String,
    pub handle_id: Option<String>,
    pub state: Option<TransportState>,
    pub ref_count: u32,
    pub leases: HashMap<Purpose, u32>,
    pub created_at: DateTime<Utc>,
    pub last_active: i64,
}

/// One session lane: stored config, current handle, lease accounting.
///
/// `connect_gate` is held across connection establishment so concurrent
/// acquires single-flight onto one connection. `handle` is the snapshot
/// readers look at without waiting on the gate.
struct SessionEntry {
    key: SessionKey,
    config: HostConfig,
    connect_gate: tokio::sync::Mutex<()>,
    handle: RwLock<Option<Arc<ConnectionHandle>>>,
    ref_count: AtomicU32,
    leases: Mutex<HashMap<Purpose, u32>>,
    grace_timer: Mutex<Option<JoinHandle<()>>>,
    created_at: DateTime<Utc>,
    last_active: AtomicI64,
}

impl SessionEntry {
    fn new(key: SessionKey, config: HostConfig) -> Self {
        let now = Utc::now();
        Self {
            key,
            config,
            connect_gate: tokio::sync::Mutex::new(()),
            handle: RwLock::new(None),
            ref_count: AtomicU32::new(0),
            leases: Mutex::new(HashMap::new()),
            grace_timer: Mutex::new(None),
            created_at: now,
            last_active: AtomicI64::new(now.timestamp_millis()),
        }
    }

    fn label(&self) -> String {
        format!("{}#{}", self.key.session_id, self.key.lane)
    }

    fn touch(&self) {
        self.last_active
            .store(Utc::now().timestamp_millis(), Ordering::SeqCst);
    }

    fn ref_count(&self) -> u32 {
        self.ref_count.load(Ordering::SeqCst)
    }

    fn add_lease(&self, purpose: Purpose) -> u32 {
        *self.leases.lock().entry(purpose).or_insert(0) += 1;
        let count = self.ref_count.fetch_add(1, Ordering::SeqCst) + 1;
        self.touch();
        debug!("Session {} ref count increased to {}", self.label(), count);
        count
    }

    /// Drop one lease for `purpose`; `None` when none was held.
    fn remove_lease(&self, purpose: Purpose) -> Option<u32> {
        {
            let mut leases = self.leases.lock();
            let held = leases.get_mut(&purpose)?;
            if *held == 0 {
                return None;
            }
            *held -= 1;
            if *held == 0 {
                leases.remove(&purpose);
            }
        }
        let count = self.ref_count.fetch_sub(1, Ordering::SeqCst).saturating_sub(1);
        self.touch();
        debug!("Session {} ref count decreased to {}", self.label(), count);
        Some(count)
    }

    fn holds(&self, purpose: Purpose) -> bool {
        self.leases.lock().get(&purpose).copied().unwrap_or(0) > 0
    }

    fn current(&self) -> Option<Arc<ConnectionHandle>> {
        self.handle.read().clone()
    }

    fn cancel_grace_timer(&self) {
        if let Some(timer) = self.grace_timer.lock().take() {
            timer.abort();
            debug!("Session {} grace timer cancelled", self.label());
        }
    }

    fn set_grace_timer(&self, timer: JoinHandle<()>) {
        if let Some(previous) = self.grace_timer.lock().replace(timer) {
            previous.abort();
        }
    }

    async fn close_handle(&self) {
        let handle = self.handle.write().take();
        if let Some(handle) = handle {
            handle.close().await;
        }
    }

    fn info(&self) -> SessionInfo {
        let handle = self.current();
        SessionInfo {
            session_id: self.key.session_id.clone(),
            lane: self.key.lane,
            host: self.config.label(),
            handle_id: handle.as_ref().map(|h| h.id().to_string()),
            state: handle.as_ref().map(|h| h.state()),
            ref_count: self.ref_count(),
            leases: self.leases.lock().clone(),
            created_at: self.created_at,
            last_active: self.last_active.load(Ordering::SeqCst),
        }
    }
}

/// Called with the session id once a session's shared connection is gone
pub type CloseHook = Arc<dyn Fn(&str) + Send + Sync>;

#[derive(Clone, Default)]
struct CloseHooks(Arc<RwLock<Vec<CloseHook>>>);

impl CloseHooks {
    fn fire(&self, key: &SessionKey) {
        if key.lane != Lane::Shared {
            return;
        }
        for hook in self.0.read().iter() {
            hook(&key.session_id);
        }
    }
}

/// Reference-counted connection registry keyed by session id and lane
pub struct SessionRegistry {
    sessions: Arc<DashMap<SessionKey, Arc<SessionEntry>>>,
    connector: Arc<dyn Connector>,
    grace_period: Duration,
    close_hooks: CloseHooks,
}

impl SessionRegistry {
    pub fn new(connector: Arc<dyn Connector>) -> Self {
        Self::with_grace_period(connector, DEFAULT_GRACE_PERIOD)
    }

    pub fn with_grace_period(connector: Arc<dyn Connector>, grace_period: Duration) -> Self {
        Self {
            sessions: Arc::new(DashMap::new()),
            connector,
            grace_period,
            close_hooks: CloseHooks::default(),
        }
    }

    /// Run `hook` whenever a session is removed from the registry.
    pub fn on_close(&self, hook: impl Fn(&str) + Send + Sync + 'static) {
        self.close_hooks.0.write().push(Arc::new(hook));
    }

    /// Take a lease on the session's connection, creating or repairing it.
    ///
    /// `config` is only used when the session does not exist yet; reconnects
    /// always use the config stored at creation. Every successful call must
    /// be paired with [`release`](Self::release).
    pub async fn acquire(
        &self,
        session_id: &str,
        config: &HostConfig,
        purpose: Purpose,
    ) -> Result<Arc<ConnectionHandle>, RegistryError> {
        let key = SessionKey::new(session_id, purpose.lane());

        // Lease taken under the map guard so a firing grace timer either
        // sees it or has already removed the entry.
        let entry = {
            let slot = self
                .sessions
                .entry(key.clone())
                .or_insert_with(|| Arc::new(SessionEntry::new(key.clone(), config.clone())));
            slot.add_lease(purpose);
            slot.value().clone()
        };
        entry.cancel_grace_timer();

        match self.ensure_connected(&entry).await {
            Ok(handle) => Ok(handle),
            Err(e) => {
                warn!("Session {} acquire failed: {}", entry.label(), e);
                if let Some(0) = entry.remove_lease(purpose) {
                    self.on_idle(&entry);
                }
                Err(e)
            }
        }
    }

    /// Give back one lease. At zero the grace timer starts.
    pub fn release(&self, session_id: &str, purpose: Purpose) -> Result<(), RegistryError> {
        let key = SessionKey::new(session_id, purpose.lane());
        let entry = self
            .sessions
            .get(&key)
            .map(|e| e.value().clone())
            .ok_or_else(|| RegistryError::NotFound(session_id.to_string()))?;

        match entry.remove_lease(purpose) {
            None => Err(RegistryError::LeaseNotHeld {
                session_id: session_id.to_string(),
                purpose,
            }),
            Some(0) => {
                self.on_idle(&entry);
                Ok(())
            }
            Some(_) => Ok(()),
        }
    }

    /// Re-check the connection behind an already held lease and reconnect
    /// it if stale. Returns the (possibly new) handle.
    pub async fn refresh(
        &self,
        session_id: &str,
        purpose: Purpose,
    ) -> Result<Arc<ConnectionHandle>, RegistryError> {
        let key = SessionKey::new(session_id, purpose.lane());
        let entry = self
            .sessions
            .get(&key)
            .map(|e| e.value().clone())
            .ok_or_else(|| RegistryError::NotFound(session_id.to_string()))?;

        if !entry.holds(purpose) {
            return Err(RegistryError::LeaseNotHeld {
                session_id: session_id.to_string(),
                purpose,
            });
        }
        self.ensure_connected(&entry).await
    }

    /// Liveness of the session's shared connection. Never connects.
    pub async fn status(&self, session_id: &str) -> SessionStatus {
        let key = SessionKey::new(session_id, Lane::Shared);
        let handle = self.sessions.get(&key).and_then(|e| e.current());
        let connected = match handle {
            Some(handle) => handle.is_alive().await,
            None => false,
        };
        SessionStatus { connected }
    }

    /// Snapshots of every lane of `session_id`
    pub fn info(&self, session_id: &str) -> Vec<SessionInfo> {
        [Lane::Shared, Lane::Status]
            .into_iter()
            .filter_map(|lane| {
                self.sessions
                    .get(&SessionKey::new(session_id, lane))
                    .map(|e| e.info())
            })
            .collect()
    }

    pub fn list(&self) -> Vec<SessionInfo> {
        self.sessions.iter().map(|e| e.value().info()).collect()
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Close every connection and forget every session.
    pub async fn disconnect_all(&self) {
        let keys: Vec<SessionKey> = self.sessions.iter().map(|e| e.key().clone()).collect();
        info!("Disconnecting {} sessions", keys.len());
        for key in keys {
            if let Some((_, entry)) = self.sessions.remove(&key) {
                entry.cancel_grace_timer();
                entry.close_handle().await;
                self.close_hooks.fire(&key);
            }
        }
    }

    async fn ensure_connected(
        &self,
        entry: &Arc<SessionEntry>,
    ) -> Result<Arc<ConnectionHandle>, RegistryError> {
        let _gate = entry.connect_gate.lock().await;

        if let Some(handle) = entry.current() {
            if handle.is_alive().await {
                entry.touch();
                return Ok(handle);
            }
            warn!(
                "Session {} connection {} is stale, reconnecting",
                entry.label(),
                handle.id()
            );
            entry.close_handle().await;
        }

        let handle = Arc::new(
            ConnectionHandle::connect(self.connector.as_ref(), &entry.config, &entry.label(), None)
                .await?,
        );
        *entry.handle.write() = Some(handle.clone());
        entry.touch();
        info!(
            "Session {} bound to connection {} ({})",
            entry.label(),
            handle.id(),
            entry.config.label()
        );
        Ok(handle)
    }

    /// Ref count reached zero.
    fn on_idle(&self, entry: &Arc<SessionEntry>) {
        let sessions = self.sessions.clone();
        let key = entry.key.clone();

        // Nothing to keep warm
        if entry.current().is_none() {
            if sessions
                .remove_if(&key, |_, v| Arc::ptr_eq(v, entry) && v.ref_count() == 0)
                .is_some()
            {
                self.close_hooks.fire(&key);
            }
            return;
        }

        let grace = self.grace_period;
        info!(
            "Session {} idle, closing in {}ms unless reused",
            entry.label(),
            grace.as_millis()
        );

        let entry_clone = entry.clone();
        let hooks = self.close_hooks.clone();
        let timer = tokio::spawn(async move {
            tokio::time::sleep(grace).await;

            let removed = sessions.remove_if(&key, |_, v| {
                Arc::ptr_eq(v, &entry_clone) && v.ref_count() == 0
            });
            if removed.is_some() {
                info!("Session {} grace period expired, disconnecting", entry_clone.label());
                entry_clone.close_handle().await;
                hooks.fire(&key);
            } else {
                debug!(
                    "Session {} grace timer fired but session is in use",
                    entry_clone.label()
                );
            }
        });
        entry.set_grace_timer(timer);
    }
}
