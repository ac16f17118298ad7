//! WebSocket Server
//!
//! One listener serves two endpoints:
//! - `/ssh`: interactive terminals. The first text frame must be
//!   `connectToHost`; afterwards shell output goes out as `data` messages
//!   (binary frames if the client asked for them) and notices as JSON text.
//! - `/api`: the control API (tunnels, files, status).
//!
//! When a token is configured the upgrade request must carry `?token=`.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use subtle::ConstantTimeEq;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{accept_hdr_async, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::control::ControlChannel;
use super::protocol::{parse_client_message, ClientMessage, ServerMessage, Utf8Decoder};
use super::terminal::{ClientChannel, TerminalEvent, TerminalInput};
use crate::services::Services;
use crate::ssh::{ErrorKind, HostConfig, PtySize};

/// Frames buffered towards one client
const FRAME_CHANNEL_CAPACITY: usize = 4096;
/// Client input frames buffered towards one terminal
const INPUT_CHANNEL_CAPACITY: usize = 256;
/// A client that cannot take a frame for this long is dropped
const SEND_TIMEOUT: Duration = Duration::from_secs(5);
/// Time allowed between upgrade and `connectToHost`
const CONNECT_FRAME_TIMEOUT: Duration = Duration::from_secs(30);
/// How long a closed terminal gets to release its lease
const RELAY_JOIN_TIMEOUT: Duration = Duration::from_secs(5);

type WsSender = SplitSink<WebSocketStream<TcpStream>, Message>;
type WsReceiver = SplitStream<WebSocketStream<TcpStream>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Route {
    Terminal,
    Control,
}

pub struct BridgeServer {
    services: Arc<Services>,
    auth_token: Option<String>,
}

impl BridgeServer {
    pub fn new(services: Arc<Services>, auth_token: Option<String>) -> Self {
        Self {
            services,
            auth_token,
        }
    }

    /// Accept connections until `shutdown` fires.
    pub async fn run(self: Arc<Self>, listener: TcpListener, shutdown: CancellationToken) {
        match listener.local_addr() {
            Ok(addr) => info!("WebSocket bridge listening on {}", addr),
            Err(e) => warn!("WebSocket bridge listening (address unknown: {})", e),
        }

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        if let Err(e) = stream.set_nodelay(true) {
                            debug!("Failed to set TCP_NODELAY for {}: {}", peer, e);
                        }
                        let server = self.clone();
                        tokio::spawn(async move { server.handle_connection(stream, peer).await });
                    }
                    Err(e) => {
                        error!("Accept failed: {}", e);
                    }
                },
            }
        }
        info!("WebSocket bridge stopped accepting connections");
    }

    fn token_matches(&self, query: Option<&str>) -> bool {
        let Some(expected) = self.auth_token.as_deref() else {
            return true;
        };
        let received = query
            .unwrap_or_default()
            .split('&')
            .find_map(|pair| pair.strip_prefix("token="))
            .unwrap_or_default();
        // Length check leaks only the length
        received.len() == expected.len()
            && bool::from(received.as_bytes().ct_eq(expected.as_bytes()))
    }

    async fn handle_connection(self: Arc<Self>, stream: TcpStream, peer: SocketAddr) {
        let mut route = None;
        let callback = |request: &Request, response: Response| -> Result<Response, ErrorResponse> {
            let uri = request.uri();
            route = match uri.path() {
                "/ssh" => Some(Route::Terminal),
                "/api" => Some(Route::Control),
                _ => return Err(reject(StatusCode::NOT_FOUND, "Unknown endpoint")),
            };
            if !self.token_matches(uri.query()) {
                return Err(reject(StatusCode::UNAUTHORIZED, "Invalid token"));
            }
            Ok(response)
        };

        let ws_stream = match accept_hdr_async(stream, callback).await {
            Ok(ws) => ws,
            Err(e) => {
                warn!("WebSocket handshake with {} failed: {}", peer, e);
                return;
            }
        };

        match route {
            Some(Route::Terminal) => self.serve_terminal(ws_stream, peer).await,
            Some(Route::Control) => self.serve_control(ws_stream, peer).await,
            None => {}
        }
    }

    // ========================================================================
    // /ssh
    // ========================================================================

    async fn serve_terminal(&self, ws_stream: WebSocketStream<TcpStream>, peer: SocketAddr) {
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();

        let connect = match tokio::time::timeout(
            CONNECT_FRAME_TIMEOUT,
            wait_for_connect(&mut ws_receiver),
        )
        .await
        {
            Ok(Some(connect)) => connect,
            Ok(None) => return,
            Err(_) => {
                warn!("{} sent no connectToHost in time", peer);
                let _ = ws_sender.close().await;
                return;
            }
        };

        let ConnectRequest {
            cols,
            rows,
            session_id,
            host,
            binary,
        } = connect;

        let config = match self.resolve_host(host).await {
            Ok(config) => config,
            Err((message, kind)) => {
                send_notice(&mut ws_sender, ServerMessage::Error { message, kind }).await;
                let _ = ws_sender.close().await;
                return;
            }
        };
        let session_id = session_id.unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

        let (input_tx, input_rx) = mpsc::channel::<TerminalInput>(INPUT_CHANNEL_CAPACITY);
        let (event_tx, mut event_rx) = mpsc::channel::<TerminalEvent>(FRAME_CHANNEL_CAPACITY);

        let relay = match self
            .services
            .terminals
            .open(
                &session_id,
                &config,
                cols,
                rows,
                ClientChannel {
                    inbound: input_rx,
                    outbound: event_tx,
                },
            )
            .await
        {
            Ok(relay) => relay,
            Err(e) => {
                warn!("Terminal {} for {} failed to open: {}", session_id, peer, e);
                send_notice(
                    &mut ws_sender,
                    ServerMessage::Error {
                        message: e.to_string(),
                        kind: e.kind(),
                    },
                )
                .await;
                let _ = ws_sender.close().await;
                return;
            }
        };

        // Task: frame sender - terminal output and notices
        let mut sender_task = tokio::spawn(async move {
            let mut decoder = (!binary).then(Utf8Decoder::new);
            while let Some(event) = event_rx.recv().await {
                let Some(message) = encode_event(event, decoder.as_mut()) else {
                    continue;
                };
                if !send_with_timeout(&mut ws_sender, message).await {
                    break;
                }
            }
            let _ = ws_sender.close().await;
            debug!("Terminal frame sender stopped");
        });

        let sid = session_id.clone();
        let input_loop = async move {
            while let Some(msg) = ws_receiver.next().await {
                let input = match msg {
                    Ok(Message::Text(text)) => match parse_client_message(&text) {
                        Ok(ClientMessage::Input { data }) => {
                            TerminalInput::Data(Bytes::from(data.into_bytes()))
                        }
                        Ok(ClientMessage::Resize {
                            cols,
                            rows,
                            width,
                            height,
                        }) => TerminalInput::Resize(PtySize {
                            cols,
                            rows,
                            width_px: width,
                            height_px: height,
                        }),
                        Ok(ClientMessage::Ping) => TerminalInput::Ping,
                        Ok(ClientMessage::Disconnect) => {
                            let _ = input_tx.send(TerminalInput::Close).await;
                            break;
                        }
                        Ok(ClientMessage::ConnectToHost { .. }) => {
                            warn!("Terminal {}: repeated connectToHost dropped", sid);
                            continue;
                        }
                        Err(e) => {
                            warn!("Terminal {}: {}", sid, e);
                            continue;
                        }
                    },
                    Ok(Message::Binary(data)) => TerminalInput::Data(Bytes::from(data)),
                    Ok(Message::Close(_)) => {
                        info!("WebSocket close received for terminal {}", sid);
                        break;
                    }
                    Ok(_) => continue,
                    Err(e) => {
                        warn!("WebSocket receive error on terminal {}: {}", sid, e);
                        break;
                    }
                };
                if input_tx.send(input).await.is_err() {
                    debug!("Terminal {} relay gone", sid);
                    break;
                }
            }
            // input_tx dropped here: the relay treats it as the client closing
        };

        tokio::select! {
            _ = &mut sender_task => {
                debug!("Terminal {} output side finished", session_id);
            }
            _ = input_loop => {
                debug!("Terminal {} input side finished", session_id);
            }
        }

        if tokio::time::timeout(RELAY_JOIN_TIMEOUT, relay).await.is_err() {
            warn!("Terminal {} relay did not stop in time", session_id);
        }
        sender_task.abort();
        info!("Terminal {} for {} closed", session_id, peer);
    }

    async fn resolve_host(&self, host: HostSource) -> Result<HostConfig, (String, ErrorKind)> {
        match host {
            HostSource::Id(host_id) => self
                .services
                .hosts
                .get_host(&host_id)
                .await
                .map_err(|e| (e.to_string(), e.kind())),
            HostSource::Inline(config) => Ok(*config),
            HostSource::Missing => Err((
                "connectToHost needs hostId or hostConfig".to_string(),
                ErrorKind::ProtocolViolation,
            )),
        }
    }

    // ========================================================================
    // /api
    // ========================================================================

    async fn serve_control(&self, ws_stream: WebSocketStream<TcpStream>, peer: SocketAddr) {
        info!("Control connection from {}", peer);
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();

        let (inbound_tx, inbound_rx) = mpsc::channel::<String>(INPUT_CHANNEL_CAPACITY);
        let (outbound_tx, mut outbound_rx) = mpsc::channel(FRAME_CHANNEL_CAPACITY);

        let api = Arc::new(self.services.control_api());
        let api_task = tokio::spawn(api.serve(ControlChannel {
            inbound: inbound_rx,
            outbound: outbound_tx,
        }));

        let mut sender_task = tokio::spawn(async move {
            while let Some(message) = outbound_rx.recv().await {
                let text = match serde_json::to_string(&message) {
                    Ok(text) => text,
                    Err(e) => {
                        warn!("Failed to encode control message: {}", e);
                        continue;
                    }
                };
                if !send_with_timeout(&mut ws_sender, Message::Text(text)).await {
                    break;
                }
            }
            let _ = ws_sender.close().await;
        });

        let input_loop = async move {
            while let Some(msg) = ws_receiver.next().await {
                match msg {
                    Ok(Message::Text(text)) => {
                        if inbound_tx.send(text).await.is_err() {
                            break;
                        }
                    }
                    Ok(Message::Binary(_)) => {
                        warn!("Control endpoint got a binary frame, dropped");
                    }
                    Ok(Message::Close(_)) => break,
                    Ok(_) => {}
                    Err(e) => {
                        warn!("WebSocket receive error on control connection: {}", e);
                        break;
                    }
                }
            }
        };

        tokio::select! {
            _ = &mut sender_task => {}
            _ = input_loop => {}
        }

        // The api task ends once its inbound side is gone
        if tokio::time::timeout(RELAY_JOIN_TIMEOUT, api_task).await.is_err() {
            warn!("Control connection from {} did not wind down in time", peer);
        }
        sender_task.abort();
        info!("Control connection from {} closed", peer);
    }
}

enum HostSource {
    Id(String),
    Inline(Box<HostConfig>),
    Missing,
}

struct ConnectRequest {
    cols: u32,
    rows: u32,
    session_id: Option<String>,
    host: HostSource,
    binary: bool,
}

/// Read frames until `connectToHost`. `None` if the client left first.
async fn wait_for_connect(ws_receiver: &mut WsReceiver) -> Option<ConnectRequest> {
    while let Some(msg) = ws_receiver.next().await {
        match msg {
            Ok(Message::Text(text)) => match parse_client_message(&text) {
                Ok(ClientMessage::ConnectToHost {
                    cols,
                    rows,
                    session_id,
                    host_id,
                    host_config,
                    binary,
                }) => {
                    let host = match (host_id, host_config) {
                        (Some(id), _) => HostSource::Id(id),
                        (None, Some(config)) => HostSource::Inline(Box::new(config)),
                        (None, None) => HostSource::Missing,
                    };
                    return Some(ConnectRequest {
                        cols,
                        rows,
                        session_id,
                        host,
                        binary,
                    });
                }
                Ok(_) => warn!("Frame before connectToHost dropped"),
                Err(e) => warn!("{}", e),
            },
            Ok(Message::Binary(_)) => warn!("Binary frame before connectToHost dropped"),
            Ok(Message::Close(_)) | Err(_) => return None,
            Ok(_) => {}
        }
    }
    None
}

/// Frame for one terminal event. Output is a `data` message when a decoder
/// is given, a binary frame otherwise.
fn encode_event(event: TerminalEvent, decoder: Option<&mut Utf8Decoder>) -> Option<Message> {
    let notice = match (event, decoder) {
        (TerminalEvent::Output(bytes), None) => return Some(Message::Binary(bytes.to_vec())),
        (TerminalEvent::Output(bytes), Some(decoder)) => {
            let data = decoder.decode(&bytes);
            if data.is_empty() {
                return None;
            }
            ServerMessage::Data { data }
        }
        (TerminalEvent::Notice(notice), _) => notice,
    };
    match serde_json::to_string(&notice) {
        Ok(text) => Some(Message::Text(text)),
        Err(e) => {
            warn!("Failed to encode notice: {}", e);
            None
        }
    }
}

async fn send_with_timeout(ws_sender: &mut WsSender, message: Message) -> bool {
    match tokio::time::timeout(SEND_TIMEOUT, ws_sender.send(message)).await {
        Ok(Ok(())) => true,
        Ok(Err(e)) => {
            debug!("WebSocket send failed: {:?}", e);
            false
        }
        Err(_) => {
            warn!(
                "WebSocket send timeout after {}s - client unresponsive, disconnecting",
                SEND_TIMEOUT.as_secs()
            );
            false
        }
    }
}

async fn send_notice(ws_sender: &mut WsSender, notice: ServerMessage) {
    match serde_json::to_string(&notice) {
        Ok(text) => {
            send_with_timeout(ws_sender, Message::Text(text)).await;
        }
        Err(e) => warn!("Failed to encode notice: {}", e),
    }
}

fn reject(status: StatusCode, reason: &str) -> ErrorResponse {
    let mut response = ErrorResponse::new(Some(reason.to_string()));
    *response.status_mut() = status;
    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::{PtyShellOpener, Shell, ShellEvent, ShellOpener, ShellReader, ShellWriter};
    use crate::ssh::{ConnectionHandle, SshError};
    use async_trait::async_trait;
    use crate::config::{MemoryHostStore, ServerConfig};
    use crate::sftp::SftpOpener;
    use crate::ssh::testing::{host, FakeConnector};
    use crate::state::MemoryTunnelStore;
    use serde_json::Value;
    use tokio_tungstenite::connect_async;

    /// Shell that prints back whatever it is sent
    struct EchoShell;

    struct EchoReader(mpsc::UnboundedReceiver<ShellEvent>);

    struct EchoWriter(mpsc::UnboundedSender<ShellEvent>);

    #[async_trait]
    impl ShellReader for EchoReader {
        async fn recv(&mut self) -> Option<ShellEvent> {
            self.0.recv().await
        }
    }

    #[async_trait]
    impl ShellWriter for EchoWriter {
        async fn send(&self, data: &[u8]) -> Result<(), SshError> {
            let _ = self.0.send(ShellEvent::Output(Bytes::copy_from_slice(data)));
            Ok(())
        }

        async fn resize(&self, _size: PtySize) -> Result<(), SshError> {
            Ok(())
        }

        async fn close(&self) {}
    }

    #[async_trait]
    impl ShellOpener for EchoShell {
        async fn open_shell(
            &self,
            _handle: &ConnectionHandle,
            _size: PtySize,
        ) -> Result<Shell, SshError> {
            let (tx, rx) = mpsc::unbounded_channel();
            Ok(Shell {
                reader: Box::new(EchoReader(rx)),
                writer: Arc::new(EchoWriter(tx)),
            })
        }
    }

    async fn start(token: Option<&str>) -> (SocketAddr, CancellationToken) {
        start_with(token, Arc::new(PtyShellOpener)).await
    }

    async fn start_with(
        token: Option<&str>,
        shells: Arc<dyn ShellOpener>,
    ) -> (SocketAddr, CancellationToken) {
        let hosts = Arc::new(MemoryHostStore::new());
        hosts.insert("web", host("web-host"));
        let services = Arc::new(Services::with_parts(
            &ServerConfig::default(),
            Arc::new(FakeConnector::new()),
            hosts,
            Arc::new(MemoryTunnelStore::new()),
            shells,
            Arc::new(SftpOpener),
        ));
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let shutdown = CancellationToken::new();
        let server = Arc::new(BridgeServer::new(services, token.map(str::to_string)));
        tokio::spawn(server.run(listener, shutdown.clone()));
        (addr, shutdown)
    }

    async fn next_text<S>(ws: &mut S) -> Value
    where
        S: futures_util::Stream<Item = Result<Message, tokio_tungstenite::tungstenite::Error>> + Unpin,
    {
        loop {
            let msg = tokio::time::timeout(Duration::from_secs(5), ws.next())
                .await
                .unwrap()
                .unwrap()
                .unwrap();
            if let Message::Text(text) = msg {
                return serde_json::from_str(&text).unwrap();
            }
        }
    }

    #[tokio::test]
    async fn test_token_query_parsing() {
        let server = BridgeServer {
            services: Arc::new(Services::with_parts(
                &ServerConfig::default(),
                Arc::new(FakeConnector::new()),
                Arc::new(MemoryHostStore::new()),
                Arc::new(MemoryTunnelStore::new()),
                Arc::new(PtyShellOpener),
                Arc::new(SftpOpener),
            )),
            auth_token: Some("s3cret".into()),
        };
        assert!(server.token_matches(Some("token=s3cret")));
        assert!(server.token_matches(Some("a=1&token=s3cret")));
        assert!(!server.token_matches(Some("token=s3cre")));
        assert!(!server.token_matches(None));
    }

    #[tokio::test]
    async fn test_control_round_trip() {
        let (addr, shutdown) = start(Some("s3cret")).await;

        let (mut ws, _) = connect_async(format!("ws://{}/api?token=s3cret", addr))
            .await
            .unwrap();
        ws.send(Message::Text(
            r#"{"requestId":"r1","action":"sessionStatus","sessionId":"tab-1"}"#.into(),
        ))
        .await
        .unwrap();

        let reply = next_text(&mut ws).await;
        assert_eq!(reply["requestId"], "r1");
        assert_eq!(reply["result"]["connected"], false);
        shutdown.cancel();
    }

    #[tokio::test]
    async fn test_bad_token_and_unknown_path_rejected() {
        let (addr, shutdown) = start(Some("s3cret")).await;

        assert!(connect_async(format!("ws://{}/api?token=nope", addr))
            .await
            .is_err());
        assert!(connect_async(format!("ws://{}/elsewhere?token=s3cret", addr))
            .await
            .is_err());
        shutdown.cancel();
    }

    #[tokio::test]
    async fn test_terminal_reports_open_failure() {
        let (addr, shutdown) = start(None).await;

        let (mut ws, _) = connect_async(format!("ws://{}/ssh", addr)).await.unwrap();
        // Dropped with a warning, the connection stays up
        ws.send(Message::Text("{not json".into())).await.unwrap();
        ws.send(Message::Text(
            r#"{"type":"connectToHost","cols":80,"rows":24,"hostId":"web"}"#.into(),
        ))
        .await
        .unwrap();

        // Scripted connections refuse shell channels
        let notice = next_text(&mut ws).await;
        assert_eq!(notice["type"], "error");
        assert_eq!(notice["kind"], "ChannelError");
        shutdown.cancel();
    }

    #[tokio::test]
    async fn test_terminal_output_arrives_as_data() {
        let (addr, shutdown) = start_with(None, Arc::new(EchoShell)).await;

        let (mut ws, _) = connect_async(format!("ws://{}/ssh", addr)).await.unwrap();
        ws.send(Message::Text(
            r#"{"type":"connectToHost","cols":80,"rows":24,"hostId":"web"}"#.into(),
        ))
        .await
        .unwrap();
        assert_eq!(next_text(&mut ws).await["type"], "connected");

        ws.send(Message::Text(r#"{"type":"input","data":"ls\n"}"#.into()))
            .await
            .unwrap();
        let reply = next_text(&mut ws).await;
        assert_eq!(reply["type"], "data");
        assert_eq!(reply["data"], "ls\n");
        shutdown.cancel();
    }

    #[test]
    fn test_output_encoding() {
        let bytes = Bytes::from_static("é".as_bytes());

        let frame = encode_event(TerminalEvent::Output(bytes.clone()), None);
        assert_eq!(frame, Some(Message::Binary(bytes.to_vec())));

        let mut decoder = Utf8Decoder::new();
        let first = encode_event(
            TerminalEvent::Output(bytes.slice(..1)),
            Some(&mut decoder),
        );
        assert_eq!(first, None);
        let second = encode_event(
            TerminalEvent::Output(bytes.slice(1..)),
            Some(&mut decoder),
        );
        assert_eq!(
            second,
            Some(Message::Text(r#"{"type":"data","data":"é"}"#.to_string()))
        );
    }

    #[tokio::test]
    async fn test_terminal_unknown_host() {
        let (addr, shutdown) = start(None).await;

        let (mut ws, _) = connect_async(format!("ws://{}/ssh", addr)).await.unwrap();
        ws.send(Message::Text(
            r#"{"type":"connectToHost","cols":80,"rows":24,"hostId":"nope"}"#.into(),
        ))
        .await
        .unwrap();

        let notice = next_text(&mut ws).await;
        assert_eq!(notice["type"], "error");
        assert_eq!(notice["kind"], "NotFound");
        shutdown.cancel();
    }
}
