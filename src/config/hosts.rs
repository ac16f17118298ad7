//! Host configuration lookup
//!
//! Host CRUD lives outside this service; we only read. `hosts.json` is an
//! array of host configs with an extra `id` field and is read on every
//! lookup so edits apply without a restart.

use std::collections::HashMap;
use std::path::PathBuf;

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::fs;

use super::storage::StorageError;
use crate::ssh::HostConfig;

/// One row of `hosts.json`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HostRecord {
    pub id: String,
    #[serde(flatten)]
    pub config: HostConfig,
}

#[async_trait]
pub trait HostStore: Send + Sync {
    async fn get_host(&self, host_id: &str) -> Result<HostConfig, StorageError>;
}

pub struct JsonHostStore {
    path: PathBuf,
}

impl JsonHostStore {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    async fn load(&self) -> Result<Vec<HostRecord>, StorageError> {
        match fs::read_to_string(&self.path).await {
            Ok(contents) => Ok(serde_json::from_str(&contents)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
            Err(e) => Err(StorageError::Io(e)),
        }
    }
}

#[async_trait]
impl HostStore for JsonHostStore {
    async fn get_host(&self, host_id: &str) -> Result<HostConfig, StorageError> {
        self.load()
            .await?
            .into_iter()
            .find(|record| record.id == host_id)
            .map(|record| record.config)
            .ok_or_else(|| StorageError::HostNotFound(host_id.to_string()))
    }
}

/// In-memory host table
#[derive(Default)]
pub struct MemoryHostStore {
    hosts: RwLock<HashMap<String, HostConfig>>,
}

impl MemoryHostStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, host_id: &str, config: HostConfig) {
        self.hosts.write().insert(host_id.to_string(), config);
    }
}

#[async_trait]
impl HostStore for MemoryHostStore {
    async fn get_host(&self, host_id: &str) -> Result<HostConfig, StorageError> {
        self.hosts
            .read()
            .get(host_id)
            .cloned()
            .ok_or_else(|| StorageError::HostNotFound(host_id.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ssh::AuthMethod;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_json_store_reads_on_demand() {
        let temp = tempdir().unwrap();
        let path = temp.path().join("hosts.json");
        let store = JsonHostStore::new(path.clone());

        assert!(matches!(
            store.get_host("web").await,
            Err(StorageError::HostNotFound(_))
        ));

        fs::write(
            &path,
            r#"[{"id":"web","host":"10.0.0.5","username":"deploy",
                 "auth":{"type":"password","password":"pw"}}]"#,
        )
        .await
        .unwrap();

        let config = store.get_host("web").await.unwrap();
        assert_eq!(config.host, "10.0.0.5");
        assert_eq!(config.port, 22);
        assert!(matches!(config.auth, AuthMethod::Password { .. }));
    }

    #[tokio::test]
    async fn test_memory_store() {
        let store = MemoryHostStore::new();
        store.insert("db", crate::ssh::testing::host("db"));
        assert_eq!(store.get_host("db").await.unwrap().host, "db");
        assert_eq!(
            store.get_host("nope").await.unwrap_err().kind(),
            crate::ssh::ErrorKind::NotFound
        );
    }
}
