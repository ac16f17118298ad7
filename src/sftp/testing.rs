//! In-memory remote filesystem for tests.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncReadExt};

use super::bridge::RemoteFsOpener;
use super::error::SftpError;
use super::session::{RemoteFs, RemoteReader};
use super::types::{remote_parent, DirEntry, EntryType};
use crate::ssh::ConnectionHandle;

/// In-memory filesystem with injectable transport failures
#[derive(Default)]
pub(crate) struct MemoryFs {
    pub(crate) files: Mutex<BTreeMap<String, Vec<u8>>>,
    pub(crate) transport_failures: AtomicUsize,
    pub(crate) fail_mid_write: AtomicBool,
}

impl MemoryFs {
    pub(crate) fn with_files(files: &[(&str, &str)]) -> Self {
        let fs = Self::default();
        for (path, content) in files {
            fs.files
                .lock()
                .insert(path.to_string(), content.as_bytes().to_vec());
        }
        fs
    }

    fn trip(&self) -> Result<(), SftpError> {
        let left = self.transport_failures.load(Ordering::SeqCst);
        if left > 0 {
            self.transport_failures.store(left - 1, Ordering::SeqCst);
            return Err(SftpError::ChannelError("channel closed".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl RemoteFs for MemoryFs {
    async fn list(&self, path: &str) -> Result<Vec<DirEntry>, SftpError> {
        self.trip()?;
        let files = self.files.lock();
        if !files.keys().any(|p| remote_parent(p) == path) {
            return Err(SftpError::FileNotFound(path.to_string()));
        }
        Ok(files
            .iter()
            .filter(|(p, _)| remote_parent(p) == path)
            .map(|(p, content)| DirEntry {
                name: p.rsplit('/').next().unwrap_or_default().to_string(),
                entry_type: EntryType::File,
                size: content.len() as u64,
                modified: 0,
            })
            .collect())
    }

    async fn rename(&self, from: &str, to: &str) -> Result<(), SftpError> {
        self.trip()?;
        let mut files = self.files.lock();
        let content = files
            .remove(from)
            .ok_or_else(|| SftpError::FileNotFound(from.to_string()))?;
        files.insert(to.to_string(), content);
        Ok(())
    }

    async fn delete(&self, path: &str, _recursive: bool) -> Result<u64, SftpError> {
        self.trip()?;
        self.files
            .lock()
            .remove(path)
            .map(|_| 1)
            .ok_or_else(|| SftpError::FileNotFound(path.to_string()))
    }

    async fn read(&self, path: &str) -> Result<RemoteReader, SftpError> {
        self.trip()?;
        let content = self
            .files
            .lock()
            .get(path)
            .cloned()
            .ok_or_else(|| SftpError::FileNotFound(path.to_string()))?;
        Ok(Box::new(std::io::Cursor::new(content)))
    }

    async fn write(
        &self,
        path: &str,
        source: &mut (dyn AsyncRead + Send + Unpin),
    ) -> Result<u64, SftpError> {
        self.trip()?;
        let mut content = Vec::new();
        if self.fail_mid_write.swap(false, Ordering::SeqCst) {
            let mut chunk = [0u8; 2];
            source.read_exact(&mut chunk).await?;
            return Err(SftpError::WriteError("connection reset".into()));
        }
        source.read_to_end(&mut content).await?;
        let written = content.len() as u64;
        self.files.lock().insert(path.to_string(), content);
        Ok(written)
    }
}

pub(crate) struct MemoryOpener {
    pub(crate) fs: Arc<MemoryFs>,
    /// Open attempts, failed ones included
    pub(crate) opens: AtomicUsize,
    /// Opens left to fail as if the subsystem channel broke
    pub(crate) open_failures: AtomicUsize,
}

impl MemoryOpener {
    pub(crate) fn new(fs: MemoryFs) -> Self {
        Self {
            fs: Arc::new(fs),
            opens: AtomicUsize::new(0),
            open_failures: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl RemoteFsOpener for MemoryOpener {
    async fn open(&self, _handle: &ConnectionHandle) -> Result<Arc<dyn RemoteFs>, SftpError> {
        self.opens.fetch_add(1, Ordering::SeqCst);
        let left = self.open_failures.load(Ordering::SeqCst);
        if left > 0 {
            self.open_failures.store(left - 1, Ordering::SeqCst);
            return Err(SftpError::ChannelError("subsystem request failed".into()));
        }
        Ok(self.fs.clone())
    }
}
