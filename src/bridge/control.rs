//! Control API
//!
//! Request/response dispatch for the `/api` endpoint. Every request runs in
//! its own task so a slow download never holds up a tunnel command. Upload
//! chunks are the exception: they are fed to their upload in arrival order
//! from the reader loop.
//!
//! All tasks of a connection live in one `JoinSet` and are aborted when the
//! client goes away.

use std::collections::HashMap;
use std::io;
use std::sync::Arc;

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use bytes::Bytes;
use serde_json::{json, Value};
use thiserror::Error;
use tokio::io::AsyncReadExt;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinSet;
use tokio_util::io::StreamReader;
use tracing::{debug, warn};

use super::protocol::{parse_api_request, salvage_request_id, ApiAction, ApiMessage, ProtocolError};
use crate::config::{HostStore, StorageError};
use crate::session::SessionRegistry;
use crate::sftp::{FileBridge, SftpError};
use crate::ssh::ErrorKind;
use crate::status::StatusPoller;
use crate::tunnel::{TunnelError, TunnelManager};

/// Raw bytes per `fileChunk` push (before base64)
pub const READ_CHUNK_SIZE: usize = 32 * 1024;

/// Decoded upload chunks buffered ahead of the SFTP writer
const UPLOAD_QUEUE: usize = 16;

#[derive(Error, Debug)]
pub enum ControlError {
    #[error(transparent)]
    Tunnel(#[from] TunnelError),

    #[error(transparent)]
    File(#[from] SftpError),

    #[error(transparent)]
    Host(#[from] StorageError),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error("Failed to encode result: {0}")]
    Encode(#[from] serde_json::Error),
}

impl ControlError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ControlError::Tunnel(e) => e.kind(),
            ControlError::File(e) => e.kind(),
            ControlError::Host(e) => e.kind(),
            ControlError::Protocol(e) => e.kind(),
            ControlError::Encode(_) => ErrorKind::Internal,
        }
    }
}

/// The client side of one control connection
pub struct ControlChannel {
    /// JSON text frames from the client
    pub inbound: mpsc::Receiver<String>,
    pub outbound: mpsc::Sender<ApiMessage>,
}

type UploadSender = mpsc::Sender<io::Result<Bytes>>;

pub struct ControlApi {
    tunnels: Arc<TunnelManager>,
    files: Arc<FileBridge>,
    status: Arc<StatusPoller>,
    registry: Arc<SessionRegistry>,
    hosts: Arc<dyn HostStore>,
}

impl ControlApi {
    pub fn new(
        tunnels: Arc<TunnelManager>,
        files: Arc<FileBridge>,
        status: Arc<StatusPoller>,
        registry: Arc<SessionRegistry>,
        hosts: Arc<dyn HostStore>,
    ) -> Self {
        Self {
            tunnels,
            files,
            status,
            registry,
            hosts,
        }
    }

    /// Serve one control connection until the client goes away.
    pub async fn serve(self: Arc<Self>, channel: ControlChannel) {
        let ControlChannel {
            mut inbound,
            outbound,
        } = channel;
        let mut events = self.tunnels.subscribe();
        let mut uploads: HashMap<String, UploadSender> = HashMap::new();
        let mut tasks = JoinSet::new();

        loop {
            tokio::select! {
                frame = inbound.recv() => match frame {
                    Some(text) => self.handle_frame(&text, &outbound, &mut uploads, &mut tasks).await,
                    None => break,
                },

                event = events.recv() => match event {
                    Ok(event) => {
                        if outbound.send(ApiMessage::TunnelEvent(event)).await.is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!("Control client lagged behind, {} tunnel events dropped", n);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },

                Some(joined) = tasks.join_next(), if !tasks.is_empty() => {
                    if let Err(e) = joined {
                        if e.is_panic() {
                            warn!("Control request task panicked: {}", e);
                        }
                    }
                }
            }
        }

        debug!(
            "Control connection closed, aborting {} in-flight request(s)",
            tasks.len()
        );
        tasks.shutdown().await;
    }

    async fn handle_frame(
        self: &Arc<Self>,
        text: &str,
        outbound: &mpsc::Sender<ApiMessage>,
        uploads: &mut HashMap<String, UploadSender>,
        tasks: &mut JoinSet<()>,
    ) {
        let request = match parse_api_request(text) {
            Ok(request) => request,
            Err(e) => {
                warn!("Dropping control frame: {}", e);
                let request_id = salvage_request_id(text);
                let _ = outbound
                    .send(ApiMessage::err(request_id.as_deref(), e.to_string(), e.kind()))
                    .await;
                return;
            }
        };
        let request_id = request.request_id;

        match request.action {
            ApiAction::FileWrite {
                session_id,
                host_id,
                path,
            } => {
                let (tx, rx) = mpsc::channel(UPLOAD_QUEUE);
                uploads.insert(request_id.clone(), tx);

                let api = self.clone();
                let outbound = outbound.clone();
                tasks.spawn(async move {
                    let message = match api.upload(&session_id, &host_id, &path, rx).await {
                        Ok(written) => ApiMessage::ok(&request_id, json!({ "bytesWritten": written })),
                        Err(e) => ApiMessage::err(Some(&request_id), e.to_string(), e.kind()),
                    };
                    let _ = outbound.send(message).await;
                });
            }

            ApiAction::FileWriteChunk { data } => {
                let Some(tx) = uploads.get(&request_id) else {
                    let e = ProtocolError::Malformed(format!("No upload open for {}", request_id));
                    let _ = outbound
                        .send(ApiMessage::err(Some(&request_id), e.to_string(), e.kind()))
                        .await;
                    return;
                };

                let chunk = BASE64.decode(data.as_bytes()).map(Bytes::from).map_err(|e| {
                    io::Error::new(io::ErrorKind::InvalidData, format!("Bad upload chunk: {}", e))
                });
                let failed = chunk.is_err();
                // Writer already finished (usually with an error it reported)
                if tx.send(chunk).await.is_err() || failed {
                    uploads.remove(&request_id);
                }
            }

            ApiAction::FileWriteEnd => {
                // Dropping the sender ends the source stream
                if uploads.remove(&request_id).is_none() {
                    debug!("fileWriteEnd for unknown upload {}", request_id);
                }
            }

            action => {
                let api = self.clone();
                let outbound = outbound.clone();
                tasks.spawn(async move {
                    let message = match api.execute(&request_id, action, &outbound).await {
                        Ok(result) => ApiMessage::ok(&request_id, result),
                        Err(e) => {
                            debug!("Request {} failed: {}", request_id, e);
                            ApiMessage::err(Some(&request_id), e.to_string(), e.kind())
                        }
                    };
                    let _ = outbound.send(message).await;
                });
            }
        }
    }

    async fn execute(
        &self,
        request_id: &str,
        action: ApiAction,
        outbound: &mpsc::Sender<ApiMessage>,
    ) -> Result<Value, ControlError> {
        let result = match action {
            ApiAction::TunnelStart { tunnel_id } => {
                serde_json::to_value(self.tunnels.start(&tunnel_id).await?)?
            }
            ApiAction::TunnelStop { tunnel_id } => {
                self.tunnels.stop(&tunnel_id).await?;
                serde_json::to_value(self.tunnels.state(&tunnel_id).await?)?
            }
            ApiAction::TunnelRestart { tunnel_id } => {
                serde_json::to_value(self.tunnels.restart(&tunnel_id).await?)?
            }
            ApiAction::TunnelState { tunnel_id } => {
                serde_json::to_value(self.tunnels.state(&tunnel_id).await?)?
            }
            ApiAction::TunnelList => serde_json::to_value(self.tunnels.list().await?)?,

            ApiAction::FileList {
                session_id,
                host_id,
                path,
            } => {
                let config = self.hosts.get_host(&host_id).await?;
                serde_json::to_value(self.files.list(&session_id, &config, &path).await?)?
            }
            ApiAction::FileRename {
                session_id,
                host_id,
                path,
                new_name,
            } => {
                let config = self.hosts.get_host(&host_id).await?;
                let target = self
                    .files
                    .rename(&session_id, &config, &path, &new_name)
                    .await?;
                json!({ "path": target })
            }
            ApiAction::FileDelete {
                session_id,
                host_id,
                path,
                recursive,
            } => {
                let config = self.hosts.get_host(&host_id).await?;
                let deleted = self
                    .files
                    .delete(&session_id, &config, &path, recursive)
                    .await?;
                json!({ "deleted": deleted })
            }
            ApiAction::FileRead {
                session_id,
                host_id,
                path,
            } => {
                let config = self.hosts.get_host(&host_id).await?;
                let read = self
                    .download(request_id, &session_id, &config, &path, outbound)
                    .await?;
                json!({ "bytesRead": read })
            }

            ApiAction::HostStatus { host_id } => {
                let status = self.status.get_status(&host_id).await;
                json!({ "hostId": host_id, "status": status })
            }
            ApiAction::HostMetrics { host_id } => {
                serde_json::to_value(self.status.get_metrics(&host_id).await)?
            }
            ApiAction::SessionStatus { session_id } => {
                serde_json::to_value(self.registry.status(&session_id).await)?
            }

            ApiAction::FileWrite { .. } | ApiAction::FileWriteChunk { .. } | ApiAction::FileWriteEnd => {
                return Err(ProtocolError::Malformed("Upload frames are not requests".into()).into())
            }
        };
        Ok(result)
    }

    /// Push the file as base64 `fileChunk` messages. Returns bytes read.
    async fn download(
        &self,
        request_id: &str,
        session_id: &str,
        config: &crate::ssh::HostConfig,
        path: &str,
        outbound: &mpsc::Sender<ApiMessage>,
    ) -> Result<u64, ControlError> {
        let mut reader = self.files.read(session_id, config, path).await?;
        let mut buf = vec![0u8; READ_CHUNK_SIZE];
        let mut offset = 0u64;

        loop {
            let n = reader.read(&mut buf).await.map_err(SftpError::from)?;
            if n == 0 {
                break;
            }
            let chunk = ApiMessage::FileChunk {
                request_id: request_id.to_string(),
                offset,
                data: BASE64.encode(&buf[..n]),
            };
            if outbound.send(chunk).await.is_err() {
                debug!("Client left during download of {}", path);
                break;
            }
            offset += n as u64;
        }
        Ok(offset)
    }

    async fn upload(
        &self,
        session_id: &str,
        host_id: &str,
        path: &str,
        chunks: mpsc::Receiver<io::Result<Bytes>>,
    ) -> Result<u64, ControlError> {
        let config = self.hosts.get_host(host_id).await?;
        let stream = futures_util::stream::unfold(chunks, |mut rx| async move {
            rx.recv().await.map(|chunk| (chunk, rx))
        });
        let source = StreamReader::new(Box::pin(stream));
        Ok(self.files.write(session_id, &config, path, source).await?)
    }
}
