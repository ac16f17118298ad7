//! State persistence using redb + MessagePack (rmp-serde)

pub mod tunnels;

pub use tunnels::{MemoryTunnelStore, RedbTunnelStore, StateError, TunnelRecord, TunnelStore};
