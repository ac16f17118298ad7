//! File Operations Bridge
//!
//! Session-scoped file operations. Each call:
//!
//! 1. takes a `file` lease for the duration of the operation, which checks
//!    the session's connection and reconnects it if needed
//! 2. reuses the SFTP channel cached for the current connection
//! 3. on a transport failure, opening the channel included, drops the
//!    channel, revalidates the connection and retries once
//!
//! Cached channels are dropped when the registry removes their session.

use std::future::Future;
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::io::{AsyncRead, ReadBuf};
use tracing::{debug, info, warn};

use super::error::SftpError;
use super::session::{RemoteFs, RemoteReader, SftpSession};
use super::types::{rename_target, DirEntry};
use crate::session::{Purpose, SessionRegistry};
use crate::ssh::{ConnectionHandle, HostConfig};

/// Opens the remote filesystem for a connection
#[async_trait]
pub trait RemoteFsOpener: Send + Sync {
    async fn open(&self, handle: &ConnectionHandle) -> Result<Arc<dyn RemoteFs>, SftpError>;
}

/// SFTP subsystem opener
pub struct SftpOpener;

#[async_trait]
impl RemoteFsOpener for SftpOpener {
    async fn open(&self, handle: &ConnectionHandle) -> Result<Arc<dyn RemoteFs>, SftpError> {
        Ok(Arc::new(SftpSession::open(handle).await?))
    }
}

struct CachedFs {
    handle_id: String,
    fs: Arc<dyn RemoteFs>,
}

/// Releases the `file` lease when dropped
struct FileLease {
    registry: Arc<SessionRegistry>,
    session_id: String,
}

impl Drop for FileLease {
    fn drop(&mut self) {
        if let Err(e) = self.registry.release(&self.session_id, Purpose::File) {
            warn!("File lease release for {} failed: {}", self.session_id, e);
        }
    }
}

/// Reader that keeps the session lease alive until the download is dropped
struct LeasedReader {
    inner: RemoteReader,
    _lease: FileLease,
}

impl AsyncRead for LeasedReader {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

/// Tracks how many bytes have been pulled out of an upload source
struct CountingReader<R> {
    inner: R,
    consumed: u64,
}

impl<R: AsyncRead + Unpin> AsyncRead for CountingReader<R> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let before = buf.filled().len();
        let result = Pin::new(&mut self.inner).poll_read(cx, buf);
        if let Poll::Ready(Ok(())) = &result {
            self.consumed += (buf.filled().len() - before) as u64;
        }
        result
    }
}

pub struct FileBridge {
    registry: Arc<SessionRegistry>,
    opener: Arc<dyn RemoteFsOpener>,
    channels: Arc<DashMap<String, CachedFs>>,
}

impl FileBridge {
    pub fn new(registry: Arc<SessionRegistry>, opener: Arc<dyn RemoteFsOpener>) -> Self {
        let channels: Arc<DashMap<String, CachedFs>> = Arc::new(DashMap::new());
        let cache = channels.clone();
        registry.on_close(move |session_id| {
            if cache.remove(session_id).is_some() {
                debug!("Dropped cached SFTP channel of session {}", session_id);
            }
        });
        Self {
            registry,
            opener,
            channels,
        }
    }

    pub async fn list(
        &self,
        session_id: &str,
        config: &HostConfig,
        path: &str,
    ) -> Result<Vec<DirEntry>, SftpError> {
        let path = path.to_string();
        self.run(session_id, config, "list", move |fs| {
            let path = path.clone();
            async move { fs.list(&path).await }
        })
        .await
    }

    pub async fn rename(
        &self,
        session_id: &str,
        config: &HostConfig,
        path: &str,
        new_name: &str,
    ) -> Result<String, SftpError> {
        let from = path.to_string();
        let to = rename_target(path, new_name);
        let target = to.clone();
        self.run(session_id, config, "rename", move |fs| {
            let (from, to) = (from.clone(), to.clone());
            async move { fs.rename(&from, &to).await }
        })
        .await?;
        Ok(target)
    }

    pub async fn delete(
        &self,
        session_id: &str,
        config: &HostConfig,
        path: &str,
        recursive: bool,
    ) -> Result<u64, SftpError> {
        let path = path.to_string();
        self.run(session_id, config, "delete", move |fs| {
            let path = path.clone();
            async move { fs.delete(&path, recursive).await }
        })
        .await
    }

    /// Open `path` for streaming. The session stays leased until the reader
    /// is dropped.
    pub async fn read(
        &self,
        session_id: &str,
        config: &HostConfig,
        path: &str,
    ) -> Result<Box<dyn AsyncRead + Send + Unpin>, SftpError> {
        let (lease, handle) = self.lease(session_id, config).await?;

        let first = match self.fs_for(session_id, &handle).await {
            Ok(fs) => fs.read(path).await,
            Err(e) => Err(e),
        };
        let reader = match first {
            Err(e) if e.is_transport() => {
                let fs = self.recover(session_id, "read", &e).await?;
                fs.read(path).await?
            }
            other => other?,
        };

        Ok(Box::new(LeasedReader {
            inner: reader,
            _lease: lease,
        }))
    }

    /// Upload `source` into `path`. A failed attempt is retried only when it
    /// had not consumed any bytes from `source` yet.
    pub async fn write<R>(
        &self,
        session_id: &str,
        config: &HostConfig,
        path: &str,
        source: R,
    ) -> Result<u64, SftpError>
    where
        R: AsyncRead + Send + Unpin,
    {
        let (_lease, handle) = self.lease(session_id, config).await?;
        let mut source = CountingReader {
            inner: source,
            consumed: 0,
        };

        let first = match self.fs_for(session_id, &handle).await {
            Ok(fs) => fs.write(path, &mut source).await,
            Err(e) => Err(e),
        };
        match first {
            Err(e) if e.is_transport() && source.consumed == 0 => {
                let fs = self.recover(session_id, "write", &e).await?;
                fs.write(path, &mut source).await
            }
            Err(e) if e.is_transport() => {
                warn!(
                    "write {} on {} failed after {} bytes, not retrying: {}",
                    path, session_id, source.consumed, e
                );
                Err(e)
            }
            other => other,
        }
    }

    async fn run<T, F, Fut>(
        &self,
        session_id: &str,
        config: &HostConfig,
        op: &str,
        call: F,
    ) -> Result<T, SftpError>
    where
        F: Fn(Arc<dyn RemoteFs>) -> Fut,
        Fut: Future<Output = Result<T, SftpError>>,
    {
        let (_lease, handle) = self.lease(session_id, config).await?;

        let first = match self.fs_for(session_id, &handle).await {
            Ok(fs) => call(fs).await,
            Err(e) => Err(e),
        };
        match first {
            Err(e) if e.is_transport() => {
                let fs = self.recover(session_id, op, &e).await?;
                call(fs).await
            }
            other => other,
        }
    }

    /// `acquire` runs the same keepalive check as `status` and reconnects a
    /// dead session, so one round trip covers both.
    async fn lease(
        &self,
        session_id: &str,
        config: &HostConfig,
    ) -> Result<(FileLease, Arc<ConnectionHandle>), SftpError> {
        let handle = self
            .registry
            .acquire(session_id, config, Purpose::File)
            .await?;
        let lease = FileLease {
            registry: self.registry.clone(),
            session_id: session_id.to_string(),
        };
        Ok((lease, handle))
    }

    async fn fs_for(
        &self,
        session_id: &str,
        handle: &ConnectionHandle,
    ) -> Result<Arc<dyn RemoteFs>, SftpError> {
        if let Some(cached) = self.channels.get(session_id) {
            if cached.handle_id == handle.id() {
                return Ok(cached.fs.clone());
            }
        }

        let fs = self.opener.open(handle).await?;
        self.channels.insert(
            session_id.to_string(),
            CachedFs {
                handle_id: handle.id().to_string(),
                fs: fs.clone(),
            },
        );
        Ok(fs)
    }

    async fn recover(
        &self,
        session_id: &str,
        op: &str,
        cause: &SftpError,
    ) -> Result<Arc<dyn RemoteFs>, SftpError> {
        info!(
            "{} on {} hit a transport error ({}), reopening once",
            op, session_id, cause
        );
        self.channels.remove(session_id);
        let handle = self.registry.refresh(session_id, Purpose::File).await?;
        self.fs_for(session_id, &handle).await
    }
}
