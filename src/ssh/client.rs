//! SSH Client implementation using russh

use std::sync::Arc;
use std::time::Duration;

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use russh::client::{self, Handle, Msg};
use russh::keys::key::PrivateKeyWithHashAlg;
use russh::keys::{PrivateKey, PublicKey, PublicKeyBase64};
use russh::Channel;
use sha2::{Digest, Sha256};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::config::{AuthMethod, HostConfig};
use super::error::SshError;

/// Byte stream of an SSH channel
pub trait ChannelIo: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> ChannelIo for T {}

pub type ChannelStream = Box<dyn ChannelIo>;

/// A `forwarded-tcpip` channel opened by the server for one of our remote
/// forwards, together with the addresses the server reported.
pub struct ForwardedChannel {
    pub stream: ChannelStream,
    pub connected_address: String,
    pub connected_port: u32,
    pub originator_address: String,
    pub originator_port: u32,
}

/// Sender half used by a connection's handler to hand forwarded channels to
/// whoever requested the forward on that same connection.
pub type ForwardedSender = mpsc::Sender<ForwardedChannel>;

/// Establishes and authenticates one SSH connection.
pub struct SshClient {
    config: HostConfig,
    timeout: Duration,
    forwarded_tx: Option<ForwardedSender>,
}

impl SshClient {
    /// `timeout` bounds resolution, handshake and authentication together
    /// unless the host config carries its own override.
    pub fn new(config: HostConfig, timeout: Duration) -> Self {
        Self {
            config,
            timeout,
            forwarded_tx: None,
        }
    }

    /// Route server-initiated `forwarded-tcpip` channels to `tx`.
    pub fn with_forwarding(mut self, tx: ForwardedSender) -> Self {
        self.forwarded_tx = Some(tx);
        self
    }

    /// Connect to the SSH server and return the authenticated handle
    pub async fn connect(self) -> Result<Handle<ClientHandler>, SshError> {
        let timeout = self
            .config
            .timeout_secs
            .map(Duration::from_secs)
            .unwrap_or(self.timeout);
        let label = self.config.label();

        tokio::time::timeout(timeout, self.establish())
            .await
            .map_err(|_| {
                SshError::ConnectTimeout(format!("{} after {}s", label, timeout.as_secs()))
            })?
    }

    async fn establish(self) -> Result<Handle<ClientHandler>, SshError> {
        let label = self.config.label();
        info!("Connecting to SSH server {}", label);

        let socket_addr = tokio::net::lookup_host((self.config.host.as_str(), self.config.port))
            .await
            .map_err(|e| SshError::ConnectionFailed(format!("Failed to resolve address: {}", e)))?
            .next()
            .ok_or_else(|| SshError::ConnectionFailed("No address found".to_string()))?;

        let ssh_config = client::Config {
            inactivity_timeout: None,
            keepalive_interval: Some(Duration::from_secs(30)),
            keepalive_max: 3,
            ..Default::default()
        };

        let handler = ClientHandler::new(
            self.config.host.clone(),
            self.config.port,
            self.config.host_key_fingerprint.clone(),
            self.forwarded_tx,
        );

        let mut handle = client::connect(Arc::new(ssh_config), socket_addr, handler)
            .await
            .map_err(|e| match e {
                SshError::HostKeyMismatch { .. } => e,
                other => SshError::ConnectionFailed(other.to_string()),
            })?;

        debug!("SSH handshake completed for {}", label);

        let username = self.config.username.as_str();
        let authenticated = match &self.config.auth {
            AuthMethod::Password { password } => handle
                .authenticate_password(username, password)
                .await
                .map_err(|e| SshError::AuthenticationFailed(e.to_string()))?,
            AuthMethod::Key {
                private_key,
                passphrase,
            } => {
                let key = russh::keys::decode_secret_key(private_key, passphrase.as_deref())
                    .map_err(|e| SshError::KeyError(e.to_string()))?;
                authenticate_key(&mut handle, username, key).await?
            }
            AuthMethod::KeyFile {
                key_path,
                passphrase,
            } => {
                let key = russh::keys::load_secret_key(key_path, passphrase.as_deref())
                    .map_err(|e| SshError::KeyError(e.to_string()))?;
                authenticate_key(&mut handle, username, key).await?
            }
        };

        if !authenticated.success() {
            return Err(SshError::AuthenticationFailed(
                "Authentication rejected by server".to_string(),
            ));
        }

        info!("SSH authentication successful for {}", label);
        Ok(handle)
    }
}

async fn authenticate_key(
    handle: &mut Handle<ClientHandler>,
    username: &str,
    key: PrivateKey,
) -> Result<client::AuthResult, SshError> {
    let key_with_hash = PrivateKeyWithHashAlg::new(Arc::new(key), None);
    handle
        .authenticate_publickey(username, key_with_hash)
        .await
        .map_err(|e| SshError::AuthenticationFailed(e.to_string()))
}

/// SHA256 fingerprint in OpenSSH notation (`SHA256:<unpadded base64>`)
pub fn fingerprint(key: &PublicKey) -> String {
    let mut hasher = Sha256::new();
    hasher.update(key.public_key_bytes());
    let hash = hasher.finalize();
    format!("SHA256:{}", BASE64.encode(hash).trim_end_matches('='))
}

/// Client handler for russh callbacks
///
/// - Server key check: logs the fingerprint, enforces the pin if one is set
/// - `forwarded-tcpip` channels: handed to this connection's forward owner
pub struct ClientHandler {
    host: String,
    port: u16,
    pinned_fingerprint: Option<String>,
    forwarded_tx: Option<ForwardedSender>,
}

impl ClientHandler {
    pub fn new(
        host: String,
        port: u16,
        pinned_fingerprint: Option<String>,
        forwarded_tx: Option<ForwardedSender>,
    ) -> Self {
        Self {
            host,
            port,
            pinned_fingerprint,
            forwarded_tx,
        }
    }
}

impl client::Handler for ClientHandler {
    type Error = SshError;

    async fn check_server_key(
        &mut self,
        server_public_key: &PublicKey,
    ) -> Result<bool, Self::Error> {
        let actual = fingerprint(server_public_key);
        match &self.pinned_fingerprint {
            Some(expected) if expected != &actual => {
                warn!(
                    "HOST KEY MISMATCH for {}:{}! Expected {}, got {}",
                    self.host, self.port, expected, actual
                );
                Err(SshError::HostKeyMismatch {
                    expected: expected.clone(),
                    actual,
                })
            }
            Some(_) => {
                info!("Host key verified for {}:{}", self.host, self.port);
                Ok(true)
            }
            None => {
                info!(
                    "Accepting host key for {}:{} (fingerprint: {})",
                    self.host, self.port, actual
                );
                Ok(true)
            }
        }
    }

    async fn server_channel_open_forwarded_tcpip(
        &mut self,
        channel: Channel<Msg>,
        connected_address: &str,
        connected_port: u32,
        originator_address: &str,
        originator_port: u32,
        _session: &mut client::Session,
    ) -> Result<(), Self::Error> {
        debug!(
            "Server opened forwarded-tcpip channel: {}:{} from {}:{}",
            connected_address, connected_port, originator_address, originator_port
        );

        let Some(tx) = &self.forwarded_tx else {
            warn!(
                "forwarded-tcpip for {}:{} on a connection without forwards, dropping",
                connected_address, connected_port
            );
            return Ok(());
        };

        // Never block the SSH event loop here
        let forwarded = ForwardedChannel {
            stream: Box::new(channel.into_stream()),
            connected_address: connected_address.to_string(),
            connected_port,
            originator_address: originator_address.to_string(),
            originator_port,
        };
        if tx.try_send(forwarded).is_err() {
            warn!(
                "Forward dispatcher for {}:{} is busy or gone, dropping connection",
                connected_address, connected_port
            );
        }

        Ok(())
    }
}
