//! Tunnel persistence using redb
//!
//! Database: state.redb
//! Tables:
//!   - tunnels: tunnel id -> TunnelRecord (MessagePack)
//!
//! The orchestration layer only ever writes `connection_state`; configs
//! are written by the import path.

#![allow(clippy::result_large_err)]

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use redb::{Database, ReadableTable, TableDefinition};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::ssh::ErrorKind;
use crate::tunnel::{TunnelConfig, TunnelState};

/// Table: tunnels (key: tunnel id, value: MessagePack bytes)
const TUNNELS_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("tunnels");

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TunnelRecord {
    pub config: TunnelConfig,
    pub connection_state: TunnelState,
    /// Unix millis of the last write
    pub updated_at: i64,
}

impl TunnelRecord {
    pub fn new(config: TunnelConfig) -> Self {
        Self {
            config,
            connection_state: TunnelState::Disconnected,
            updated_at: chrono::Utc::now().timestamp_millis(),
        }
    }
}

#[derive(Debug, Error)]
#[allow(clippy::result_large_err)]
pub enum StateError {
    #[error("Database error: {0}")]
    Database(#[from] redb::DatabaseError),

    #[error("Transaction error: {0}")]
    Transaction(#[from] redb::TransactionError),

    #[error("Table error: {0}")]
    Table(#[from] redb::TableError),

    #[error("Storage error: {0}")]
    Storage(#[from] redb::StorageError),

    #[error("Commit error: {0}")]
    Commit(#[from] redb::CommitError),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Tunnel not found: {0}")]
    NotFound(String),
}

impl StateError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            StateError::NotFound(_) => ErrorKind::NotFound,
            _ => ErrorKind::Internal,
        }
    }
}

impl From<rmp_serde::encode::Error> for StateError {
    fn from(e: rmp_serde::encode::Error) -> Self {
        StateError::Serialization(e.to_string())
    }
}

impl From<rmp_serde::decode::Error> for StateError {
    fn from(e: rmp_serde::decode::Error) -> Self {
        StateError::Serialization(e.to_string())
    }
}

#[async_trait]
pub trait TunnelStore: Send + Sync {
    async fn list(&self) -> Result<Vec<TunnelRecord>, StateError>;

    async fn get(&self, tunnel_id: &str) -> Result<Option<TunnelRecord>, StateError>;

    /// Insert or replace a tunnel config. An existing row keeps its state.
    async fn put(&self, config: TunnelConfig) -> Result<(), StateError>;

    async fn set_connection_state(
        &self,
        tunnel_id: &str,
        state: TunnelState,
    ) -> Result<(), StateError>;
}

pub struct RedbTunnelStore {
    db: Arc<Database>,
}

impl RedbTunnelStore {
    pub fn new(path: &Path) -> Result<Self, StateError> {
        if let Some(parent) = path.parent() {
            if let Err(e) = std::fs::create_dir_all(parent) {
                warn!("Failed to create state directory {:?}: {}", parent, e);
            }
        }

        let db = match Database::create(path) {
            Ok(db) => {
                info!("State database opened at {:?}", path);
                db
            }
            Err(e) => {
                warn!("Failed to open state database: {:?}, attempting recovery", e);

                let backup_path = path.with_extension("redb.backup");
                if let Err(e) = std::fs::rename(path, &backup_path) {
                    error!("Failed to backup corrupted state database: {:?}", e);
                } else {
                    info!("Backed up corrupted state database to {:?}", backup_path);
                }

                Database::create(path)?
            }
        };

        let store = Self { db: Arc::new(db) };
        store.initialize()?;
        Ok(store)
    }

    fn initialize(&self) -> Result<(), StateError> {
        let write_txn = self.db.begin_write()?;
        {
            let _ = write_txn.open_table(TUNNELS_TABLE)?;
        }
        write_txn.commit()?;
        Ok(())
    }

    fn write_record(&self, record: &TunnelRecord) -> Result<(), StateError> {
        let bytes = rmp_serde::to_vec_named(record)?;
        let write_txn = self.db.begin_write()?;
        {
            let mut table = write_txn.open_table(TUNNELS_TABLE)?;
            table.insert(record.config.id.as_str(), bytes.as_slice())?;
        }
        write_txn.commit()?;
        Ok(())
    }
}

#[async_trait]
impl TunnelStore for RedbTunnelStore {
    async fn list(&self) -> Result<Vec<TunnelRecord>, StateError> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(TUNNELS_TABLE)?;

        let mut records = Vec::new();
        for result in table.iter()? {
            let (_, value) = result?;
            let record: TunnelRecord = rmp_serde::from_slice(value.value())?;
            records.push(record);
        }
        records.sort_by(|a, b| a.config.name.cmp(&b.config.name));
        Ok(records)
    }

    async fn get(&self, tunnel_id: &str) -> Result<Option<TunnelRecord>, StateError> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(TUNNELS_TABLE)?;

        match table.get(tunnel_id)? {
            Some(value) => Ok(Some(rmp_serde::from_slice(value.value())?)),
            None => Ok(None),
        }
    }

    async fn put(&self, config: TunnelConfig) -> Result<(), StateError> {
        let record = match self.get(&config.id).await? {
            Some(existing) => TunnelRecord {
                config,
                connection_state: existing.connection_state,
                updated_at: chrono::Utc::now().timestamp_millis(),
            },
            None => TunnelRecord::new(config),
        };
        debug!("Storing tunnel {} ({})", record.config.id, record.config.name);
        self.write_record(&record)
    }

    async fn set_connection_state(
        &self,
        tunnel_id: &str,
        state: TunnelState,
    ) -> Result<(), StateError> {
        let mut record = self
            .get(tunnel_id)
            .await?
            .ok_or_else(|| StateError::NotFound(tunnel_id.to_string()))?;
        record.connection_state = state;
        record.updated_at = chrono::Utc::now().timestamp_millis();
        self.write_record(&record)
    }
}

/// Process-local store
#[derive(Default)]
pub struct MemoryTunnelStore {
    records: RwLock<HashMap<String, TunnelRecord>>,
}

impl MemoryTunnelStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl TunnelStore for MemoryTunnelStore {
    async fn list(&self) -> Result<Vec<TunnelRecord>, StateError> {
        let mut records: Vec<_> = self.records.read().values().cloned().collect();
        records.sort_by(|a, b| a.config.name.cmp(&b.config.name));
        Ok(records)
    }

    async fn get(&self, tunnel_id: &str) -> Result<Option<TunnelRecord>, StateError> {
        Ok(self.records.read().get(tunnel_id).cloned())
    }

    async fn put(&self, config: TunnelConfig) -> Result<(), StateError> {
        let mut records = self.records.write();
        let state = records
            .get(&config.id)
            .map(|r| r.connection_state)
            .unwrap_or(TunnelState::Disconnected);
        let mut record = TunnelRecord::new(config);
        record.connection_state = state;
        records.insert(record.config.id.clone(), record);
        Ok(())
    }

    async fn set_connection_state(
        &self,
        tunnel_id: &str,
        state: TunnelState,
    ) -> Result<(), StateError> {
        let mut records = self.records.write();
        let record = records
            .get_mut(tunnel_id)
            .ok_or_else(|| StateError::NotFound(tunnel_id.to_string()))?;
        record.connection_state = state;
        record.updated_at = chrono::Utc::now().timestamp_millis();
        Ok(())
    }
}
