//! Configuration: data directory, service settings and host lookup

pub mod hosts;
pub mod settings;
pub mod storage;

pub use hosts::{HostRecord, HostStore, JsonHostStore, MemoryHostStore};
pub use settings::ServerConfig;
pub use storage::{config_file, data_dir, hosts_file, log_dir, state_file, ConfigStorage, StorageError};
