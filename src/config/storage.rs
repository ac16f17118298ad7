//! Configuration Storage
//!
//! Data directory layout (default `~/.sshdeck`):
//!
//! ```text
//! ~/.sshdeck/
//! ├── config.json     service settings
//! ├── hosts.json      host configurations
//! ├── state.redb      tunnel configs and connection state
//! └── logs/
//! ```

use std::path::{Path, PathBuf};

use tokio::fs;
use tokio::io::AsyncWriteExt;

use super::settings::ServerConfig;
use crate::ssh::ErrorKind;

/// Configuration storage errors
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("Failed to determine data directory")]
    NoDataDir,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Host not found: {0}")]
    HostNotFound(String),
}

impl StorageError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            StorageError::HostNotFound(_) => ErrorKind::NotFound,
            _ => ErrorKind::Internal,
        }
    }
}

/// Default data directory: `~/.sshdeck`
pub fn data_dir() -> Result<PathBuf, StorageError> {
    dirs::home_dir()
        .map(|home| home.join(".sshdeck"))
        .ok_or(StorageError::NoDataDir)
}

pub fn log_dir(base: &Path) -> PathBuf {
    base.join("logs")
}

pub fn config_file(base: &Path) -> PathBuf {
    base.join("config.json")
}

pub fn hosts_file(base: &Path) -> PathBuf {
    base.join("hosts.json")
}

pub fn state_file(base: &Path) -> PathBuf {
    base.join("state.redb")
}

/// Reads and writes `config.json`
pub struct ConfigStorage {
    path: PathBuf,
}

impl ConfigStorage {
    pub fn with_path(path: PathBuf) -> Self {
        Self { path }
    }

    async fn ensure_dir(&self) -> Result<(), StorageError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).await?;
        }
        Ok(())
    }

    /// Load settings. A missing file yields defaults; a corrupted file is
    /// backed up and defaults are used.
    pub async fn load(&self) -> Result<ServerConfig, StorageError> {
        match fs::read_to_string(&self.path).await {
            Ok(contents) => match serde_json::from_str::<ServerConfig>(&contents) {
                Ok(config) => Ok(config),
                Err(e) => {
                    tracing::warn!("Config file corrupted: {}", e);
                    match self.backup().await {
                        Ok(backup_path) => {
                            tracing::warn!(
                                "Corrupted config backed up to {:?}, using defaults",
                                backup_path
                            );
                        }
                        Err(backup_err) => {
                            tracing::error!("Failed to backup corrupted config: {}", backup_err);
                        }
                    }
                    Ok(ServerConfig::default())
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(ServerConfig::default()),
            Err(e) => Err(StorageError::Io(e)),
        }
    }

    /// Write settings atomically (temp file + rename)
    pub async fn save(&self, config: &ServerConfig) -> Result<(), StorageError> {
        self.ensure_dir().await?;

        let temp_path = self.path.with_extension("json.tmp");
        let json = serde_json::to_string_pretty(config)?;

        let mut file = fs::File::create(&temp_path).await?;
        file.write_all(json.as_bytes()).await?;
        file.sync_all().await?;

        fs::rename(&temp_path, &self.path).await?;
        Ok(())
    }

    pub async fn exists(&self) -> bool {
        fs::metadata(&self.path).await.is_ok()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn backup(&self) -> Result<PathBuf, StorageError> {
        let backup_path = self.path.with_extension(format!(
            "json.backup.{}",
            chrono::Utc::now().format("%Y%m%d_%H%M%S")
        ));

        if self.exists().await {
            fs::copy(&self.path, &backup_path).await?;
        }

        Ok(backup_path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_load_nonexistent() {
        let temp = tempdir().unwrap();
        let storage = ConfigStorage::with_path(temp.path().join("config.json"));

        let config = storage.load().await.unwrap();
        assert_eq!(config, ServerConfig::default());
    }

    #[tokio::test]
    async fn test_save_and_load() {
        let temp = tempdir().unwrap();
        let storage = ConfigStorage::with_path(temp.path().join("nested").join("config.json"));

        let config = ServerConfig {
            session_grace_ms: 2500,
            auth_token: Some("token".into()),
            ..Default::default()
        };
        storage.save(&config).await.unwrap();

        let loaded = storage.load().await.unwrap();
        assert_eq!(loaded, config);
    }

    #[tokio::test]
    async fn test_corrupted_config_backed_up() {
        let temp = tempdir().unwrap();
        let path = temp.path().join("config.json");
        fs::write(&path, "{ not json").await.unwrap();
        let storage = ConfigStorage::with_path(path);

        let config = storage.load().await.unwrap();
        assert_eq!(config, ServerConfig::default());

        let mut backups = 0;
        let mut dir = fs::read_dir(temp.path()).await.unwrap();
        while let Some(entry) = dir.next_entry().await.unwrap() {
            if entry.file_name().to_string_lossy().contains("json.backup.") {
                backups += 1;
            }
        }
        assert_eq!(backups, 1);
    }
}
