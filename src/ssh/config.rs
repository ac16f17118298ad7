//! SSH Configuration

use std::fmt;

use serde::{Deserialize, Serialize};

/// Connection parameters for one remote host.
///
/// Supplied by the host store (or inline by a terminal client) and never
/// mutated by this crate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HostConfig {
    /// Remote host address
    #[serde(alias = "address")]
    pub host: String,

    /// SSH port (default: 22)
    #[serde(default = "default_port")]
    pub port: u16,

    /// Username for authentication
    pub username: String,

    /// Authentication method
    pub auth: AuthMethod,

    /// Per-host connect timeout override in seconds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,

    /// Pinned SHA256 host key fingerprint (`SHA256:...`).
    /// When set, any other server key is rejected.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host_key_fingerprint: Option<String>,
}

/// Authentication methods supported
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AuthMethod {
    /// Password authentication
    Password { password: String },

    /// Private key material held in memory (OpenSSH or PEM text)
    Key {
        private_key: String,
        passphrase: Option<String>,
    },

    /// Private key read from a file on the server running this service
    KeyFile {
        key_path: String,
        passphrase: Option<String>,
    },
}

impl fmt::Debug for AuthMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AuthMethod::Password { .. } => f.write_str("Password { .. }"),
            AuthMethod::Key { passphrase, .. } => f
                .debug_struct("Key")
                .field("encrypted", &passphrase.is_some())
                .finish_non_exhaustive(),
            AuthMethod::KeyFile {
                key_path,
                passphrase,
            } => f
                .debug_struct("KeyFile")
                .field("key_path", key_path)
                .field("encrypted", &passphrase.is_some())
                .finish(),
        }
    }
}

impl HostConfig {
    /// `user@host:port`, used in log lines and handle labels.
    pub fn label(&self) -> String {
        format!("{}@{}:{}", self.username, self.host, self.port)
    }
}

fn default_port() -> u16 {
    22
}
