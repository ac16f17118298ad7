//! SSH Error types

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Error classification surfaced to clients.
///
/// Every module error maps onto one of these so the boundary can report a
/// stable kind next to the human-readable message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorKind {
    /// Bad credentials or rejected host key. Never retried automatically.
    AuthenticationFailed,
    /// Network unreachable or slow. Only the tunnel manager retries these.
    ConnectTimeout,
    /// Shell/SFTP/exec failure on an otherwise-live connection.
    ChannelError,
    /// Malformed client-facing control frame.
    ProtocolViolation,
    /// Too many concurrent channel-creation attempts on one handle.
    ResourceExhausted,
    /// Remote path or local record does not exist.
    NotFound,
    /// Remote filesystem refused the operation.
    PermissionDenied,
    Internal,
}

#[derive(Error, Debug)]
pub enum SshError {
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Connection timed out: {0}")]
    ConnectTimeout(String),

    #[error("Authentication failed: {0}")]
    AuthenticationFailed(String),

    #[error("Host key mismatch: expected {expected}, got {actual}")]
    HostKeyMismatch { expected: String, actual: String },

    #[error("Key error: {0}")]
    KeyError(String),

    #[error("Channel error: {0}")]
    ChannelError(String),

    #[error("Too many pending channel opens: {0}")]
    ResourceExhausted(String),

    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("SSH protocol error: {0}")]
    ProtocolError(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Disconnected")]
    Disconnected,
}

impl SshError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            SshError::AuthenticationFailed(_)
            | SshError::HostKeyMismatch { .. }
            | SshError::KeyError(_) => ErrorKind::AuthenticationFailed,
            SshError::ConnectionFailed(_) | SshError::ConnectTimeout(_) => ErrorKind::ConnectTimeout,
            SshError::ResourceExhausted(_) => ErrorKind::ResourceExhausted,
            SshError::ChannelError(_)
            | SshError::Timeout(_)
            | SshError::ProtocolError(_)
            | SshError::IoError(_)
            | SshError::Disconnected => ErrorKind::ChannelError,
        }
    }

    /// Whether the failure happened on the wire rather than in credentials
    /// or local resource limits.
    pub fn is_transport(&self) -> bool {
        self.kind() == ErrorKind::ChannelError
    }
}

impl From<russh::Error> for SshError {
    fn from(err: russh::Error) -> Self {
        SshError::ProtocolError(err.to_string())
    }
}

impl From<russh::keys::Error> for SshError {
    fn from(err: russh::keys::Error) -> Self {
        SshError::KeyError(err.to_string())
    }
}

impl serde::Serialize for SshError {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_mapping() {
        assert_eq!(
            SshError::AuthenticationFailed("nope".into()).kind(),
            ErrorKind::AuthenticationFailed
        );
        assert_eq!(
            SshError::ConnectTimeout("slow".into()).kind(),
            ErrorKind::ConnectTimeout
        );
        assert_eq!(SshError::Disconnected.kind(), ErrorKind::ChannelError);
        assert_eq!(
            SshError::ResourceExhausted("busy".into()).kind(),
            ErrorKind::ResourceExhausted
        );
        assert!(SshError::ChannelError("eof".into()).is_transport());
        assert!(!SshError::KeyError("bad pem".into()).is_transport());
    }

    #[test]
    fn test_kind_serializes_as_variant_name() {
        let json = serde_json::to_string(&ErrorKind::ConnectTimeout).unwrap();
        assert_eq!(json, "\"ConnectTimeout\"");
    }
}
