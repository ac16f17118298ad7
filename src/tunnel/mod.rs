//! Tunnel Manager
//!
//! Persistent remote forwards between two SSH hosts with their own
//! connections, driven by a reconnect state machine.

pub mod events;
pub mod manager;
mod relay;
mod runtime;
pub mod types;

pub use events::{TunnelEvent, TunnelEventEmitter};
pub use manager::{TunnelError, TunnelManager, TunnelSettings};
pub use runtime::TunnelRuntime;
pub use types::{TunnelConfig, TunnelEndpoint, TunnelSnapshot, TunnelState, TunnelStats};
