//! Terminal Bridge
//!
//! Two concurrent relays per terminal: shell output goes to the client as
//! raw bytes, client input goes to the shell. A blocked shell write never
//! holds up output or `ping`, which is answered locally. Resize requests are
//! debounced on the input side.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use russh::client::Msg;
use russh::{ChannelMsg, ChannelReadHalf, ChannelWriteHalf};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::protocol::ServerMessage;
use super::resize::{ResizeCoalescer, DEFAULT_RESIZE_WINDOW};
use crate::session::{Purpose, RegistryError, SessionRegistry};
use crate::ssh::{ConnectionHandle, HostConfig, PtySize, SshError};

/// Client input chunks waiting for the shell to accept them
const INPUT_QUEUE: usize = 64;

/// Something the shell produced
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShellEvent {
    Output(Bytes),
    Exit(u32),
    Eof,
}

/// Output side of an interactive shell
#[async_trait]
pub trait ShellReader: Send {
    /// Next event; `None` once the channel is gone
    async fn recv(&mut self) -> Option<ShellEvent>;
}

/// Input side of an interactive shell
#[async_trait]
pub trait ShellWriter: Send + Sync {
    async fn send(&self, data: &[u8]) -> Result<(), SshError>;
    async fn resize(&self, size: PtySize) -> Result<(), SshError>;
    /// Tear the shell down without waiting for pending output
    async fn close(&self);
}

/// An open shell split into halves that make progress independently
pub struct Shell {
    pub reader: Box<dyn ShellReader>,
    pub writer: Arc<dyn ShellWriter>,
}

#[async_trait]
impl ShellReader for ChannelReadHalf {
    async fn recv(&mut self) -> Option<ShellEvent> {
        loop {
            match self.wait().await {
                Some(ChannelMsg::Data { data }) => {
                    return Some(ShellEvent::Output(Bytes::copy_from_slice(&data)))
                }
                // stderr is interleaved into the terminal stream
                Some(ChannelMsg::ExtendedData { data, .. }) => {
                    return Some(ShellEvent::Output(Bytes::copy_from_slice(&data)))
                }
                Some(ChannelMsg::ExitStatus { exit_status }) => {
                    return Some(ShellEvent::Exit(exit_status))
                }
                Some(ChannelMsg::Eof) => return Some(ShellEvent::Eof),
                Some(ChannelMsg::Close) | None => return None,
                Some(_) => continue,
            }
        }
    }
}

#[async_trait]
impl ShellWriter for ChannelWriteHalf<Msg> {
    async fn send(&self, data: &[u8]) -> Result<(), SshError> {
        self.data(data)
            .await
            .map_err(|e| SshError::ChannelError(format!("Failed to write to shell: {}", e)))
    }

    async fn resize(&self, size: PtySize) -> Result<(), SshError> {
        self.window_change(size.cols, size.rows, size.width_px, size.height_px)
            .await
            .map_err(|e| SshError::ChannelError(format!("Window change failed: {}", e)))
    }

    async fn close(&self) {
        let _ = self.eof().await;
        let _ = ChannelWriteHalf::close(self).await;
    }
}

/// Opens the shell for a terminal on an acquired connection
#[async_trait]
pub trait ShellOpener: Send + Sync {
    async fn open_shell(&self, handle: &ConnectionHandle, size: PtySize)
        -> Result<Shell, SshError>;
}

/// PTY shell over a real SSH session channel
pub struct PtyShellOpener;

#[async_trait]
impl ShellOpener for PtyShellOpener {
    async fn open_shell(
        &self,
        handle: &ConnectionHandle,
        size: PtySize,
    ) -> Result<Shell, SshError> {
        let (reader, writer) = handle.open_shell(size).await?.split();
        Ok(Shell {
            reader: Box::new(reader),
            writer: Arc::new(writer),
        })
    }
}

/// Client-to-terminal input, already decoded from the wire
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TerminalInput {
    Data(Bytes),
    Resize(PtySize),
    Ping,
    Close,
}

/// Terminal-to-client output
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TerminalEvent {
    Output(Bytes),
    Notice(ServerMessage),
}

/// The client side of one terminal. Dropping `inbound`'s sender counts as
/// the client closing.
pub struct ClientChannel {
    pub inbound: mpsc::Receiver<TerminalInput>,
    pub outbound: mpsc::Sender<TerminalEvent>,
}

pub struct TerminalBridge {
    registry: Arc<SessionRegistry>,
    opener: Arc<dyn ShellOpener>,
    resize_window: Duration,
}

impl TerminalBridge {
    pub fn new(registry: Arc<SessionRegistry>, opener: Arc<dyn ShellOpener>) -> Self {
        Self {
            registry,
            opener,
            resize_window: DEFAULT_RESIZE_WINDOW,
        }
    }

    pub fn with_resize_window(mut self, window: Duration) -> Self {
        self.resize_window = window;
        self
    }

    /// Acquire a terminal lease, open a shell sized `cols`×`rows`, announce
    /// `connected` and start relaying. Errors before the relay starts are
    /// returned; afterwards the client only ever sees `disconnected`.
    pub async fn open(
        &self,
        session_id: &str,
        config: &HostConfig,
        cols: u32,
        rows: u32,
        client: ClientChannel,
    ) -> Result<JoinHandle<()>, RegistryError> {
        let handle = self
            .registry
            .acquire(session_id, config, Purpose::Terminal)
            .await?;

        let shell = match self.opener.open_shell(&handle, PtySize::new(cols, rows)).await {
            Ok(shell) => shell,
            Err(e) => {
                warn!("Terminal {} failed to open shell: {}", session_id, e);
                let _ = self.registry.release(session_id, Purpose::Terminal);
                return Err(e.into());
            }
        };

        let connected = TerminalEvent::Notice(ServerMessage::Connected {
            session_id: session_id.to_string(),
        });
        if client.outbound.send(connected).await.is_err() {
            debug!("Terminal {} client left before connected", session_id);
        }

        info!(
            "Terminal {} opened on connection {} ({}x{})",
            session_id,
            handle.id(),
            cols,
            rows
        );

        let relay = Relay {
            session_id: session_id.to_string(),
            handle,
            shell,
            client,
            resize: ResizeCoalescer::new(self.resize_window),
        };
        let registry = self.registry.clone();
        let session_id = session_id.to_string();
        Ok(tokio::spawn(async move {
            relay.run().await;
            if let Err(e) = registry.release(&session_id, Purpose::Terminal) {
                warn!("Terminal {} lease release failed: {}", session_id, e);
            }
        }))
    }
}

/// Why a relay half stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RelayEnd {
    RemoteClosed,
    ClientClosed,
    WriteFailed,
}

struct Relay {
    session_id: String,
    handle: Arc<ConnectionHandle>,
    shell: Shell,
    client: ClientChannel,
    resize: ResizeCoalescer,
}

async fn until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

async fn notify(outbound: &mpsc::Sender<TerminalEvent>, session_id: &str, message: ServerMessage) {
    if outbound.send(TerminalEvent::Notice(message)).await.is_err() {
        debug!("Terminal {} client gone", session_id);
    }
}

impl Relay {
    async fn run(self) {
        let Relay {
            session_id,
            handle,
            shell,
            client,
            resize,
        } = self;
        let (data_tx, data_rx) = mpsc::channel(INPUT_QUEUE);

        let mut output = tokio::spawn(relay_output(
            session_id.clone(),
            handle.clone(),
            shell.reader,
            client.outbound.clone(),
        ));
        let mut input = tokio::spawn(relay_input(
            session_id.clone(),
            client.inbound,
            client.outbound.clone(),
            shell.writer.clone(),
            resize,
            data_tx,
        ));
        let mut writer = tokio::spawn(relay_writes(
            session_id.clone(),
            handle,
            shell.writer.clone(),
            client.outbound,
            data_rx,
        ));

        let ended = tokio::select! {
            ended = &mut output => ended,
            ended = &mut input => ended,
            ended = &mut writer => ended,
        };
        output.abort();
        input.abort();
        writer.abort();

        match ended {
            Ok(RelayEnd::ClientClosed) => {
                info!("Terminal {} closed by client", session_id);
                shell.writer.close().await;
            }
            Ok(end) => debug!("Terminal {} relay ended: {:?}", session_id, end),
            Err(e) => warn!("Terminal {} relay task failed: {}", session_id, e),
        }
    }
}

/// Shell to client
async fn relay_output(
    session_id: String,
    handle: Arc<ConnectionHandle>,
    mut reader: Box<dyn ShellReader>,
    outbound: mpsc::Sender<TerminalEvent>,
) -> RelayEnd {
    let mut exit_status = None;
    loop {
        match reader.recv().await {
            Some(ShellEvent::Output(bytes)) => {
                handle.touch();
                if outbound.send(TerminalEvent::Output(bytes)).await.is_err() {
                    debug!("Terminal {} client gone, closing shell", session_id);
                    return RelayEnd::ClientClosed;
                }
            }
            Some(ShellEvent::Exit(code)) => {
                debug!("Terminal {} shell exited with {}", session_id, code);
                exit_status = Some(code);
            }
            Some(ShellEvent::Eof) | None => {
                let reason = match exit_status {
                    Some(code) => format!("Shell exited with status {}", code),
                    None => "Remote closed the shell".to_string(),
                };
                info!("Terminal {} ended: {}", session_id, reason);
                notify(&outbound, &session_id, ServerMessage::Disconnected { reason }).await;
                return RelayEnd::RemoteClosed;
            }
        }
    }
}

/// Client to shell. Data is queued for `relay_writes`; everything else is
/// handled here so it never waits on the remote window.
async fn relay_input(
    session_id: String,
    mut inbound: mpsc::Receiver<TerminalInput>,
    outbound: mpsc::Sender<TerminalEvent>,
    writer: Arc<dyn ShellWriter>,
    mut resize: ResizeCoalescer,
    data_tx: mpsc::Sender<Bytes>,
) -> RelayEnd {
    loop {
        let deadline = resize.deadline();
        tokio::select! {
            input = inbound.recv() => match input {
                Some(TerminalInput::Data(bytes)) => {
                    if data_tx.send(bytes).await.is_err() {
                        return RelayEnd::WriteFailed;
                    }
                }
                Some(TerminalInput::Resize(size)) => {
                    resize.push(size, Instant::now());
                }
                Some(TerminalInput::Ping) => {
                    notify(&outbound, &session_id, ServerMessage::Pong).await;
                }
                Some(TerminalInput::Close) | None => return RelayEnd::ClientClosed,
            },

            _ = until(deadline) => {
                if let Some(size) = resize.take_due(Instant::now()) {
                    debug!("Terminal {} resize to {}x{}", session_id, size.cols, size.rows);
                    if let Err(e) = writer.resize(size).await {
                        warn!("Terminal {} resize failed: {}", session_id, e);
                    }
                }
            }
        }
    }
}

/// Drains queued client input into the shell
async fn relay_writes(
    session_id: String,
    handle: Arc<ConnectionHandle>,
    writer: Arc<dyn ShellWriter>,
    outbound: mpsc::Sender<TerminalEvent>,
    mut data_rx: mpsc::Receiver<Bytes>,
) -> RelayEnd {
    while let Some(bytes) = data_rx.recv().await {
        if let Err(e) = writer.send(&bytes).await {
            warn!("Terminal {} input failed: {}", session_id, e);
            notify(
                &outbound,
                &session_id,
                ServerMessage::Disconnected {
                    reason: e.to_string(),
                },
            )
            .await;
            return RelayEnd::WriteFailed;
        }
        handle.touch();
    }
    RelayEnd::ClientClosed
}
