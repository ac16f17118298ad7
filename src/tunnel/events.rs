//! Tunnel Event System
//!
//! Every state transition of a tunnel runtime is published on a broadcast
//! channel. Subscribers that fall behind lose old events, never block the
//! runtime.

use serde::Serialize;
use tokio::sync::broadcast;
use tracing::trace;

use super::types::TunnelState;

/// Buffered events per subscriber
const EVENT_CAPACITY: usize = 256;

/// State change of one tunnel
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TunnelEvent {
    pub tunnel_id: String,
    pub state: TunnelState,
    /// CONNECTING attempt within the current run (0 outside of attempts)
    pub attempt: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    /// Unix millis
    pub timestamp: i64,
}

/// Event emitter shared by the manager and all runtimes
#[derive(Clone)]
pub struct TunnelEventEmitter {
    tx: broadcast::Sender<TunnelEvent>,
}

impl TunnelEventEmitter {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(EVENT_CAPACITY);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TunnelEvent> {
        self.tx.subscribe()
    }

    pub fn emit(&self, tunnel_id: &str, state: TunnelState, attempt: u32, reason: Option<String>) {
        let event = TunnelEvent {
            tunnel_id: tunnel_id.to_string(),
            state,
            attempt,
            reason,
            timestamp: chrono::Utc::now().timestamp_millis(),
        };
        // No subscribers is fine
        if self.tx.send(event).is_err() {
            trace!("No listeners for tunnel event {} -> {}", tunnel_id, state);
        }
    }
}

impl Default for TunnelEventEmitter {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_subscribers_see_events_in_order() {
        let emitter = TunnelEventEmitter::new();
        let mut rx = emitter.subscribe();

        emitter.emit("t1", TunnelState::Connecting, 1, None);
        emitter.emit("t1", TunnelState::Failed, 1, Some("refused".into()));

        assert_eq!(rx.recv().await.unwrap().state, TunnelState::Connecting);
        let failed = rx.recv().await.unwrap();
        assert_eq!(failed.state, TunnelState::Failed);
        assert_eq!(failed.reason.as_deref(), Some("refused"));
    }

    #[test]
    fn test_event_shape() {
        let event = TunnelEvent {
            tunnel_id: "t1".into(),
            state: TunnelState::Retrying,
            attempt: 2,
            reason: None,
            timestamp: 0,
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["tunnelId"], "t1");
        assert_eq!(json["state"], "RETRYING");
        assert!(json.get("reason").is_none());
    }
}
