//! SFTP Session
//!
//! File operations over one SFTP subsystem channel of a connection.

use async_trait::async_trait;
use russh_sftp::client::SftpSession as RusshSftpSession;
use russh_sftp::protocol::OpenFlags;
use tokio::io::{AsyncRead, AsyncWriteExt};
use tracing::{debug, info};

use super::error::SftpError;
use super::types::{join_remote_path, sort_entries, DirEntry, EntryType};
use crate::ssh::ConnectionHandle;

/// Streaming reader over a remote file
pub type RemoteReader = Box<dyn AsyncRead + Send + Unpin>;

/// Remote filesystem primitives used by the file bridge
#[async_trait]
pub trait RemoteFs: Send + Sync {
    async fn list(&self, path: &str) -> Result<Vec<DirEntry>, SftpError>;

    async fn rename(&self, from: &str, to: &str) -> Result<(), SftpError>;

    /// Returns the number of entries removed
    async fn delete(&self, path: &str, recursive: bool) -> Result<u64, SftpError>;

    async fn read(&self, path: &str) -> Result<RemoteReader, SftpError>;

    /// Create or truncate `path` and fill it from `source`
    async fn write(
        &self,
        path: &str,
        source: &mut (dyn AsyncRead + Send + Unpin),
    ) -> Result<u64, SftpError>;
}

/// SFTP Session wrapper
pub struct SftpSession {
    sftp: RusshSftpSession,
    label: String,
}

impl SftpSession {
    /// Open the SFTP subsystem on a new channel of `handle`
    pub async fn open(handle: &ConnectionHandle) -> Result<Self, SftpError> {
        let label = handle.label().to_string();
        info!("Opening SFTP subsystem on connection {} ({})", handle.id(), label);

        let channel = handle
            .controller()
            .open_session_channel()
            .await
            .map_err(|e| SftpError::ChannelError(e.to_string()))?;

        channel.request_subsystem(true, "sftp").await.map_err(|e| {
            SftpError::SubsystemNotAvailable(format!("Failed to request SFTP subsystem: {}", e))
        })?;

        let sftp = RusshSftpSession::new(channel.into_stream())
            .await
            .map_err(|e| SftpError::SubsystemNotAvailable(e.to_string()))?;

        handle.touch();
        info!("SFTP subsystem opened for {}", label);
        Ok(Self { sftp, label })
    }

    async fn delete_recursive_inner(&self, path: &str) -> Result<u64, SftpError> {
        let attrs = self
            .sftp
            .symlink_metadata(path)
            .await
            .map_err(|e| SftpError::from_sftp(e, path))?;

        if !attrs.is_dir() {
            self.sftp
                .remove_file(path)
                .await
                .map_err(|e| SftpError::from_sftp(e, path))?;
            return Ok(1);
        }

        let mut deleted = 0u64;
        for entry in self.list(path).await? {
            let child = join_remote_path(path, &entry.name);
            // Boxed to keep the future size finite
            deleted += Box::pin(self.delete_recursive_inner(&child)).await?;
        }

        self.sftp
            .remove_dir(path)
            .await
            .map_err(|e| SftpError::from_sftp(e, path))?;
        Ok(deleted + 1)
    }
}

#[async_trait]
impl RemoteFs for SftpSession {
    async fn list(&self, path: &str) -> Result<Vec<DirEntry>, SftpError> {
        debug!("Listing directory {} on {}", path, self.label);

        let read_dir = self
            .sftp
            .read_dir(path)
            .await
            .map_err(|e| SftpError::from_sftp(e, path))?;

        let mut entries = Vec::new();
        for entry in read_dir {
            let name = entry.file_name();
            if name == "." || name == ".." {
                continue;
            }

            let metadata = entry.metadata();
            let entry_type = if metadata.is_symlink() {
                EntryType::Link
            } else if metadata.is_dir() {
                EntryType::Directory
            } else {
                EntryType::File
            };

            entries.push(DirEntry {
                name,
                entry_type,
                size: metadata.size.unwrap_or(0),
                modified: metadata.mtime.map(|t| t as i64).unwrap_or(0),
            });
        }

        sort_entries(&mut entries);
        debug!("Listed {} entries in {}", entries.len(), path);
        Ok(entries)
    }

    async fn rename(&self, from: &str, to: &str) -> Result<(), SftpError> {
        info!("Renaming {} to {} on {}", from, to, self.label);
        self.sftp
            .rename(from, to)
            .await
            .map_err(|e| SftpError::from_sftp(e, from))
    }

    async fn delete(&self, path: &str, recursive: bool) -> Result<u64, SftpError> {
        info!(
            "Deleting {}{} on {}",
            path,
            if recursive { " (recursive)" } else { "" },
            self.label
        );

        if recursive {
            return self.delete_recursive_inner(path).await;
        }

        let attrs = self
            .sftp
            .symlink_metadata(path)
            .await
            .map_err(|e| SftpError::from_sftp(e, path))?;
        if attrs.is_dir() {
            self.sftp
                .remove_dir(path)
                .await
                .map_err(|e| SftpError::from_sftp(e, path))?;
        } else {
            self.sftp
                .remove_file(path)
                .await
                .map_err(|e| SftpError::from_sftp(e, path))?;
        }
        Ok(1)
    }

    async fn read(&self, path: &str) -> Result<RemoteReader, SftpError> {
        debug!("Opening {} for read on {}", path, self.label);
        let file = self
            .sftp
            .open(path)
            .await
            .map_err(|e| SftpError::from_sftp(e, path))?;
        Ok(Box::new(file))
    }

    async fn write(
        &self,
        path: &str,
        source: &mut (dyn AsyncRead + Send + Unpin),
    ) -> Result<u64, SftpError> {
        let mut file = self
            .sftp
            .open_with_flags(
                path,
                OpenFlags::CREATE | OpenFlags::TRUNCATE | OpenFlags::WRITE,
            )
            .await
            .map_err(|e| SftpError::from_sftp(e, path))?;

        let written = tokio::io::copy(source, &mut file)
            .await
            .map_err(|e| SftpError::WriteError(format!("Failed to write {}: {}", path, e)))?;

        file.flush()
            .await
            .map_err(|e| SftpError::WriteError(format!("Failed to flush file: {}", e)))?;
        file.shutdown()
            .await
            .map_err(|e| SftpError::WriteError(format!("Failed to close file: {}", e)))?;

        info!("Wrote {} bytes to {} on {}", written, path, self.label);
        Ok(written)
    }
}
