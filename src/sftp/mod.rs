//! SFTP module - remote file operations bound to sessions
//!
//! [`FileBridge`] is the entry point; it leases the session's connection,
//! caches one SFTP channel per connection and retries a transport failure
//! once.

mod bridge;
mod error;
mod session;
pub mod types;

#[cfg(test)]
pub(crate) mod testing;

pub use bridge::{FileBridge, RemoteFsOpener, SftpOpener};
pub use error::SftpError;
pub use session::{RemoteFs, RemoteReader, SftpSession};
pub use types::{DirEntry, EntryType};
