//! Service settings (`config.json`)

use std::net::SocketAddr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

fn default_listen_addr() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 7681))
}

fn default_connect_timeout_secs() -> u64 {
    30
}

fn default_session_grace_ms() -> u64 {
    10_000
}

fn default_resize_debounce_ms() -> u64 {
    30
}

fn default_status_ttl_secs() -> u64 {
    30
}

fn default_status_exec_timeout_secs() -> u64 {
    8
}

fn default_tunnel_heartbeat_secs() -> u64 {
    15
}

fn default_tunnel_verify_timeout_secs() -> u64 {
    10
}

/// Runtime settings. Every field has a default so a partial file is valid.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerConfig {
    /// WebSocket listen address
    #[serde(default = "default_listen_addr")]
    pub listen_addr: SocketAddr,

    /// Upper bound on resolve + handshake + auth
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,

    /// How long an unused session connection is kept
    #[serde(default = "default_session_grace_ms")]
    pub session_grace_ms: u64,

    #[serde(default = "default_resize_debounce_ms")]
    pub resize_debounce_ms: u64,

    #[serde(default = "default_status_ttl_secs")]
    pub status_ttl_secs: u64,

    #[serde(default = "default_status_exec_timeout_secs")]
    pub status_exec_timeout_secs: u64,

    /// Keepalive period for connected tunnels
    #[serde(default = "default_tunnel_heartbeat_secs")]
    pub tunnel_heartbeat_secs: u64,

    /// Bound on each verification probe
    #[serde(default = "default_tunnel_verify_timeout_secs")]
    pub tunnel_verify_timeout_secs: u64,

    /// Shared token required on WebSocket upgrade (`?token=`), if set
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth_token: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            connect_timeout_secs: default_connect_timeout_secs(),
            session_grace_ms: default_session_grace_ms(),
            resize_debounce_ms: default_resize_debounce_ms(),
            status_ttl_secs: default_status_ttl_secs(),
            status_exec_timeout_secs: default_status_exec_timeout_secs(),
            tunnel_heartbeat_secs: default_tunnel_heartbeat_secs(),
            tunnel_verify_timeout_secs: default_tunnel_verify_timeout_secs(),
            auth_token: None,
        }
    }
}

impl ServerConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn session_grace(&self) -> Duration {
        Duration::from_millis(self.session_grace_ms)
    }

    pub fn resize_debounce(&self) -> Duration {
        Duration::from_millis(self.resize_debounce_ms)
    }

    pub fn status_ttl(&self) -> Duration {
        Duration::from_secs(self.status_ttl_secs)
    }

    pub fn status_exec_timeout(&self) -> Duration {
        Duration::from_secs(self.status_exec_timeout_secs)
    }

    pub fn tunnel_heartbeat(&self) -> Duration {
        Duration::from_secs(self.tunnel_heartbeat_secs)
    }

    pub fn tunnel_verify_timeout(&self) -> Duration {
        Duration::from_secs(self.tunnel_verify_timeout_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_file_uses_defaults() {
        let config: ServerConfig =
            serde_json::from_str(r#"{"listenAddr":"0.0.0.0:9000","authToken":"s3cret"}"#).unwrap();
        assert_eq!(config.listen_addr.port(), 9000);
        assert_eq!(config.auth_token.as_deref(), Some("s3cret"));
        assert_eq!(config.connect_timeout(), Duration::from_secs(30));
        assert_eq!(config.session_grace(), Duration::from_secs(10));
        assert_eq!(config.resize_debounce(), Duration::from_millis(30));
        assert_eq!(config.status_exec_timeout(), Duration::from_secs(8));
    }

    #[test]
    fn test_empty_object_equals_default() {
        let config: ServerConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(config, ServerConfig::default());
    }
}
