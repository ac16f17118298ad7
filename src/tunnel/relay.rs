//! Forwarded connection relay
//!
//! The source connection delivers one `forwarded-tcpip` channel per client
//! that connects to the bound port. Each one gets a `direct-tcpip` channel
//! on the destination connection and a task copying bytes both ways.

use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::types::{TunnelEndpoint, TunnelStats};
use crate::ssh::{ChannelStream, ForwardedChannel, HandleController, SshError};

/// Atomic counters updated from relay tasks
#[derive(Debug, Default)]
pub struct TunnelStatsAtomic {
    pub connections_total: AtomicU64,
    pub connections_active: AtomicU64,
    pub bytes_to_destination: AtomicU64,
    pub bytes_to_source: AtomicU64,
}

impl TunnelStatsAtomic {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn to_stats(&self) -> TunnelStats {
        TunnelStats {
            connections_total: self.connections_total.load(Ordering::Relaxed),
            connections_active: self.connections_active.load(Ordering::Relaxed),
            bytes_to_destination: self.bytes_to_destination.load(Ordering::Relaxed),
            bytes_to_source: self.bytes_to_source.load(Ordering::Relaxed),
        }
    }
}

/// Decrements the active counter when a relay ends, however it ends.
struct ActiveGuard(Arc<TunnelStatsAtomic>);

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        self.0.connections_active.fetch_sub(1, Ordering::Relaxed);
    }
}

/// Opens the destination side of one forwarded connection
#[async_trait]
pub(crate) trait DestinationDialer: Send + Sync {
    async fn dial(
        &self,
        target: &TunnelEndpoint,
        originator_address: &str,
        originator_port: u32,
    ) -> Result<ChannelStream, SshError>;
}

#[async_trait]
impl DestinationDialer for HandleController {
    async fn dial(
        &self,
        target: &TunnelEndpoint,
        originator_address: &str,
        originator_port: u32,
    ) -> Result<ChannelStream, SshError> {
        let channel = self
            .open_direct_tcpip(
                &target.address,
                target.port as u32,
                originator_address,
                originator_port,
            )
            .await?;
        Ok(Box::new(channel.into_stream()))
    }
}

/// Accept forwarded channels until `cancel` fires or the source goes away.
pub(crate) async fn run_dispatcher(
    tunnel_id: String,
    mut forwarded_rx: mpsc::Receiver<ForwardedChannel>,
    destination: Arc<dyn DestinationDialer>,
    target: TunnelEndpoint,
    stats: Arc<TunnelStatsAtomic>,
    cancel: CancellationToken,
) {
    loop {
        let forwarded = tokio::select! {
            _ = cancel.cancelled() => break,
            next = forwarded_rx.recv() => match next {
                Some(forwarded) => forwarded,
                None => break,
            },
        };

        stats.connections_total.fetch_add(1, Ordering::Relaxed);
        stats.connections_active.fetch_add(1, Ordering::Relaxed);

        let destination = destination.clone();
        let target = target.clone();
        let guard = ActiveGuard(stats.clone());
        let cancel = cancel.child_token();
        let tunnel_id = tunnel_id.clone();

        tokio::spawn(async move {
            let result = relay_connection(
                &tunnel_id,
                forwarded,
                destination.as_ref(),
                &target,
                &guard.0,
                cancel,
            )
            .await;
            if let Err(e) = result {
                warn!("Tunnel {} relay ended with error: {}", tunnel_id, e);
            }
            drop(guard);
        });
    }
    debug!("Tunnel {} dispatcher stopped", tunnel_id);
}

async fn relay_connection(
    tunnel_id: &str,
    forwarded: ForwardedChannel,
    destination: &dyn DestinationDialer,
    target: &TunnelEndpoint,
    stats: &TunnelStatsAtomic,
    cancel: CancellationToken,
) -> Result<(), SshError> {
    let ForwardedChannel {
        stream,
        originator_address,
        originator_port,
        ..
    } = forwarded;

    let outbound = destination
        .dial(target, &originator_address, originator_port)
        .await?;

    info!(
        "Tunnel {}: relaying {}:{} -> {}:{}",
        tunnel_id, originator_address, originator_port, target.address, target.port
    );

    // Counted on read so cancelled and failed relays still report traffic
    let mut source_stream = Counted {
        inner: stream,
        counter: &stats.bytes_to_destination,
    };
    let mut destination_stream = Counted {
        inner: outbound,
        counter: &stats.bytes_to_source,
    };

    tokio::select! {
        _ = cancel.cancelled() => {
            debug!("Tunnel {} relay cancelled", tunnel_id);
        }
        result = tokio::io::copy_bidirectional(&mut source_stream, &mut destination_stream) => {
            let (to_destination, to_source) = result.map_err(SshError::IoError)?;
            debug!(
                "Tunnel {} relay closed ({} bytes out, {} bytes back)",
                tunnel_id, to_destination, to_source
            );
        }
    }
    Ok(())
}

/// Adds every byte read from `inner` to `counter`
struct Counted<'a, S> {
    inner: S,
    counter: &'a AtomicU64,
}

impl<S: AsyncRead + Unpin> AsyncRead for Counted<'_, S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        let this = self.get_mut();
        let before = buf.filled().len();
        let result = Pin::new(&mut this.inner).poll_read(cx, buf);
        if let Poll::Ready(Ok(())) = result {
            let read = (buf.filled().len() - before) as u64;
            this.counter.fetch_add(read, Ordering::Relaxed);
        }
        result
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for Counted<'_, S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        Pin::new(&mut self.get_mut().inner).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::time::Duration;
    use tokio::io::{duplex, AsyncReadExt, AsyncWriteExt, DuplexStream};

    /// Hands out in-memory destination streams and keeps the far ends.
    #[derive(Default)]
    struct MemoryDialer {
        far_ends: Mutex<Vec<DuplexStream>>,
        refuse: bool,
    }

    #[async_trait]
    impl DestinationDialer for MemoryDialer {
        async fn dial(
            &self,
            _target: &TunnelEndpoint,
            _originator_address: &str,
            _originator_port: u32,
        ) -> Result<ChannelStream, SshError> {
            if self.refuse {
                return Err(SshError::ChannelError("Connection refused".into()));
            }
            let (near, far) = duplex(1024);
            self.far_ends.lock().push(far);
            Ok(Box::new(near))
        }
    }

    fn target() -> TunnelEndpoint {
        TunnelEndpoint {
            host_id: "db".into(),
            address: "localhost".into(),
            port: 5432,
        }
    }

    fn forwarded() -> (ForwardedChannel, DuplexStream) {
        let (near, far) = duplex(1024);
        (
            ForwardedChannel {
                stream: Box::new(near),
                connected_address: "localhost".into(),
                connected_port: 15432,
                originator_address: "203.0.113.7".into(),
                originator_port: 50123,
            },
            far,
        )
    }

    async fn wait_for(check: impl Fn() -> bool) {
        for _ in 0..100 {
            if check() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition never held");
    }

    #[test]
    fn test_active_guard_decrements() {
        let stats = Arc::new(TunnelStatsAtomic::new());
        stats.connections_total.fetch_add(1, Ordering::Relaxed);
        stats.connections_active.fetch_add(1, Ordering::Relaxed);
        {
            let _guard = ActiveGuard(stats.clone());
        }
        let snapshot = stats.to_stats();
        assert_eq!(snapshot.connections_total, 1);
        assert_eq!(snapshot.connections_active, 0);
    }

    #[tokio::test]
    async fn test_forwarded_connection_is_relayed_and_counted() {
        let dialer = Arc::new(MemoryDialer::default());
        let stats = Arc::new(TunnelStatsAtomic::new());
        let cancel = CancellationToken::new();
        let (tx, rx) = mpsc::channel(4);

        tokio::spawn(run_dispatcher(
            "t1".into(),
            rx,
            dialer.clone(),
            target(),
            stats.clone(),
            cancel.clone(),
        ));

        let (channel, mut client) = forwarded();
        tx.send(channel).await.unwrap();
        wait_for(|| dialer.far_ends.lock().len() == 1).await;
        let mut server = dialer.far_ends.lock().pop().unwrap();

        client.write_all(b"SELECT 1").await.unwrap();
        let mut buf = [0u8; 8];
        server.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"SELECT 1");

        server.write_all(b"ok").await.unwrap();
        let mut buf = [0u8; 2];
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ok");

        // Bytes show up while the relay is still open
        let live = stats.to_stats();
        assert_eq!(live.connections_total, 1);
        assert_eq!(live.connections_active, 1);
        assert_eq!(live.bytes_to_destination, 8);
        assert_eq!(live.bytes_to_source, 2);

        cancel.cancel();
        wait_for(|| stats.to_stats().connections_active == 0).await;
        let done = stats.to_stats();
        assert_eq!(done.bytes_to_destination, 8);
        assert_eq!(done.bytes_to_source, 2);
    }

    #[tokio::test]
    async fn test_refused_destination_releases_slot() {
        let dialer = Arc::new(MemoryDialer {
            refuse: true,
            ..Default::default()
        });
        let stats = Arc::new(TunnelStatsAtomic::new());
        let (tx, rx) = mpsc::channel(4);

        let dispatcher = tokio::spawn(run_dispatcher(
            "t1".into(),
            rx,
            dialer,
            target(),
            stats.clone(),
            CancellationToken::new(),
        ));

        let (channel, _client) = forwarded();
        tx.send(channel).await.unwrap();
        wait_for(|| {
            let s = stats.to_stats();
            s.connections_total == 1 && s.connections_active == 0
        })
        .await;

        // Source gone ends the dispatcher
        drop(tx);
        tokio::time::timeout(Duration::from_secs(1), dispatcher)
            .await
            .unwrap()
            .unwrap();
    }
}
