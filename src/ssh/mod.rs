//! SSH module - owns live connections to remote hosts
//!
//! # Features
//! - Password, in-memory key and key-file authentication
//! - Optional SHA256 host-key pinning
//! - One owner task per connection; channel creation serialized through it
//! - Per-connection routing of server-initiated `forwarded-tcpip` channels

mod client;
mod config;
mod connector;
mod error;
mod handle;
mod handle_owner;

#[cfg(test)]
pub(crate) mod testing;

pub use client::{
    fingerprint, ChannelIo, ChannelStream, ClientHandler, ForwardedChannel, ForwardedSender,
    SshClient,
};
pub use config::{AuthMethod, HostConfig};
pub use connector::{Connector, RusshConnector};
pub use error::{ErrorKind, SshError};
pub use handle::{ConnectionHandle, ExecOutput, PtySize, TransportState};
pub use handle_owner::{
    spawn_handle_owner_task, HandleCommand, HandleController, PingResult,
    MAX_PENDING_CHANNEL_OPENS,
};
