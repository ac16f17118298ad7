//! SFTP Error types

use russh_sftp::client::error::Error as SftpErrorInner;
use thiserror::Error;

use crate::session::RegistryError;
use crate::ssh::{ErrorKind, SshError};

#[derive(Error, Debug)]
pub enum SftpError {
    #[error("File not found: {0}")]
    FileNotFound(String),

    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    #[error("Channel error: {0}")]
    ChannelError(String),

    #[error("SFTP subsystem not available: {0}")]
    SubsystemNotAvailable(String),

    #[error("Protocol error: {0}")]
    ProtocolError(String),

    #[error("Write error: {0}")]
    WriteError(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error(transparent)]
    Session(#[from] RegistryError),
}

impl SftpError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            SftpError::FileNotFound(_) => ErrorKind::NotFound,
            SftpError::PermissionDenied(_) => ErrorKind::PermissionDenied,
            SftpError::ChannelError(_)
            | SftpError::SubsystemNotAvailable(_)
            | SftpError::WriteError(_)
            | SftpError::IoError(_) => ErrorKind::ChannelError,
            SftpError::ProtocolError(_) => ErrorKind::Internal,
            SftpError::Session(e) => e.kind(),
        }
    }

    /// Failures that a fresh channel (and maybe connection) could fix
    pub fn is_transport(&self) -> bool {
        match self {
            SftpError::Session(RegistryError::Ssh(e)) => e.is_transport(),
            other => other.kind() == ErrorKind::ChannelError,
        }
    }

    /// Map a russh-sftp error raised while operating on `path`
    pub fn from_sftp(err: SftpErrorInner, path: &str) -> Self {
        let err_str = err.to_string();
        if err_str.contains("No such file") || err_str.contains("not found") {
            SftpError::FileNotFound(path.to_string())
        } else if err_str.contains("Permission denied") {
            SftpError::PermissionDenied(path.to_string())
        } else if matches!(err, SftpErrorInner::Status(_)) {
            SftpError::ProtocolError(format!("{}: {}", path, err_str))
        } else {
            SftpError::ChannelError(err_str)
        }
    }
}

impl From<SshError> for SftpError {
    fn from(err: SshError) -> Self {
        SftpError::Session(RegistryError::Ssh(err))
    }
}

impl serde::Serialize for SftpError {
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
    fn test_transport_classification() {
        assert!(SftpError::ChannelError("eof".into()).is_transport());
        assert!(SftpError::WriteError("broken pipe".into()).is_transport());
        assert!(!SftpError::FileNotFound("/x".into()).is_transport());
        assert!(!SftpError::PermissionDenied("/x".into()).is_transport());
        assert!(!SftpError::ProtocolError("dir not empty".into()).is_transport());

        let auth = SftpError::from(SshError::AuthenticationFailed("nope".into()));
        assert!(!auth.is_transport());
        assert_eq!(auth.kind(), ErrorKind::AuthenticationFailed);

        let gone = SftpError::from(SshError::Disconnected);
        assert!(gone.is_transport());
    }

    #[test]
    fn test_kinds_are_distinct() {
        assert_eq!(SftpError::FileNotFound("/a".into()).kind(), ErrorKind::NotFound);
        assert_eq!(
            SftpError::PermissionDenied("/a".into()).kind(),
            ErrorKind::PermissionDenied
        );
        assert_eq!(SftpError::ChannelError("x".into()).kind(), ErrorKind::ChannelError);
    }
}
