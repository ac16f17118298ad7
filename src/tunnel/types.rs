//! Tunnel types
//!
//! A tunnel binds `source.port` on the source host (remote forward) and
//! delivers every connection accepted there to `destination.address:port`
//! as seen from the destination host. Each side has its own connection.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

fn default_address() -> String {
    "localhost".to_string()
}

fn default_max_retries() -> u32 {
    3
}

fn default_retry_interval_ms() -> u64 {
    5000
}

/// One side of a tunnel
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TunnelEndpoint {
    /// Host store id of the SSH host for this side
    pub host_id: String,
    /// Bind address (source) or target address (destination)
    #[serde(default = "default_address")]
    pub address: String,
    pub port: u16,
}

/// Persisted tunnel definition
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TunnelConfig {
    pub id: String,
    pub name: String,
    pub source: TunnelEndpoint,
    pub destination: TunnelEndpoint,
    /// Connect attempts before giving up; 0 behaves like 1
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_retry_interval_ms")]
    pub retry_interval_ms: u64,
    #[serde(default)]
    pub auto_start: bool,
    #[serde(default)]
    pub pinned: bool,
}

impl TunnelConfig {
    /// Number of CONNECTING attempts allowed per run
    pub fn attempt_budget(&self) -> u32 {
        self.max_retries.max(1)
    }

    pub fn retry_interval(&self) -> Duration {
        Duration::from_millis(self.retry_interval_ms)
    }
}

/// Tunnel lifecycle
///
/// ```text
/// DISCONNECTED ─start─▶ CONNECTING ─▶ VERIFYING ─▶ CONNECTED
///                          ▲   │          │            │ link lost
///                          │   ▼          ▼            ▼
///                        RETRYING ◀──────────────── UNSTABLE
///                              │ budget spent
///                              ▼
///                            FAILED
/// any state ─stop─▶ DISCONNECTING ─▶ DISCONNECTED
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TunnelState {
    Disconnected,
    Connecting,
    Verifying,
    Connected,
    Unstable,
    Retrying,
    Failed,
    Disconnecting,
}

impl TunnelState {
    pub fn can_transition_to(self, next: TunnelState) -> bool {
        use TunnelState::*;
        match (self, next) {
            (_, Disconnecting) => self != Disconnected && self != Disconnecting,
            (Disconnected, Connecting) | (Failed, Connecting) => true,
            (Connecting, Verifying) | (Connecting, Retrying) | (Connecting, Failed) => true,
            (Verifying, Connected) | (Verifying, Retrying) | (Verifying, Failed) => true,
            (Connected, Unstable) => true,
            (Unstable, Retrying) => true,
            (Retrying, Connecting) => true,
            (Disconnecting, Disconnected) => true,
            _ => false,
        }
    }

    /// Whether a runtime task is (or should be) running
    pub fn is_active(self) -> bool {
        !matches!(self, TunnelState::Disconnected | TunnelState::Failed)
    }
}

impl fmt::Display for TunnelState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TunnelState::Disconnected => "DISCONNECTED",
            TunnelState::Connecting => "CONNECTING",
            TunnelState::Verifying => "VERIFYING",
            TunnelState::Connected => "CONNECTED",
            TunnelState::Unstable => "UNSTABLE",
            TunnelState::Retrying => "RETRYING",
            TunnelState::Failed => "FAILED",
            TunnelState::Disconnecting => "DISCONNECTING",
        };
        f.write_str(s)
    }
}

/// Relay counters for one tunnel run
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TunnelStats {
    pub connections_total: u64,
    pub connections_active: u64,
    pub bytes_to_destination: u64,
    pub bytes_to_source: u64,
}

/// Point-in-time view of a tunnel
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TunnelSnapshot {
    pub id: String,
    pub name: String,
    pub state: TunnelState,
    pub attempt: u32,
    pub last_error: Option<String>,
    /// Port actually bound on the source host
    pub bound_port: Option<u32>,
    pub stats: TunnelStats,
}
