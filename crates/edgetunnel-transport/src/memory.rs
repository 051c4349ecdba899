//! In-memory transport
//!
//! Connections are pairs of handles sharing a cancellation token; each
//! control stream is a `tokio::io::duplex` pipe. Used to run the supervisor
//! against a scripted edge without sockets.

use crate::{
    ConnectionStats, ControlStream, FramedReceiver, FramedSender, TransportConnection,
    TransportConnector, TransportError, TransportResult,
};
use async_trait::async_trait;
use edgetunnel_proto::Protocol;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Instant;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::debug;

const PIPE_CAPACITY: usize = 64 * 1024;

#[derive(Debug, Default)]
struct Shared {
    token: CancellationToken,
    reason: StdMutex<Option<String>>,
}

impl Shared {
    fn close(&self, reason: String) {
        if let Ok(mut slot) = self.reason.lock() {
            slot.get_or_insert(reason);
        }
        self.token.cancel();
    }

    fn reason(&self) -> String {
        self.reason
            .lock()
            .ok()
            .and_then(|r| r.clone())
            .unwrap_or_else(|| "closed".to_string())
    }
}

fn split_pipe(stream: tokio::io::DuplexStream, stream_id: u64) -> ControlStream {
    let (read, write) = tokio::io::split(stream);
    ControlStream {
        stream_id,
        sender: Box::new(FramedSender::new(write, stream_id)),
        receiver: Box::new(FramedReceiver::new(read, stream_id)),
    }
}

/// Create a connected client/edge pair
pub fn memory_pair(protocol: Protocol, remote: SocketAddr) -> (MemoryConnection, MemoryPeer) {
    let shared = Arc::new(Shared::default());
    let (stream_tx, stream_rx) = mpsc::unbounded_channel();
    let connection_id = format!("mem-{}-{}", protocol, uuid::Uuid::new_v4());

    let connection = MemoryConnection {
        connection_id: connection_id.clone(),
        protocol,
        remote,
        shared: shared.clone(),
        stream_tx,
        next_stream_id: AtomicU64::new(0),
        created_at: Instant::now(),
    };
    let peer = MemoryPeer {
        connection_id,
        protocol,
        shared,
        stream_rx: Mutex::new(stream_rx),
    };
    (connection, peer)
}

/// Client side of an in-memory connection
pub struct MemoryConnection {
    connection_id: String,
    protocol: Protocol,
    remote: SocketAddr,
    shared: Arc<Shared>,
    stream_tx: mpsc::UnboundedSender<ControlStream>,
    next_stream_id: AtomicU64,
    created_at: Instant,
}

impl std::fmt::Debug for MemoryConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryConnection")
            .field("connection_id", &self.connection_id)
            .field("remote", &self.remote)
            .finish()
    }
}

#[async_trait]
impl TransportConnection for MemoryConnection {
    async fn open_control_stream(&self) -> TransportResult<ControlStream> {
        if self.shared.token.is_cancelled() {
            return Err(TransportError::ConnectionClosed(self.shared.reason()));
        }

        let stream_id = self.next_stream_id.fetch_add(4, Ordering::Relaxed);
        let (local, remote) = tokio::io::duplex(PIPE_CAPACITY);

        self.stream_tx
            .send(split_pipe(remote, stream_id))
            .map_err(|_| TransportError::ConnectionClosed("peer gone".to_string()))?;

        debug!("[{}] Opened control stream {}", self.connection_id, stream_id);
        Ok(split_pipe(local, stream_id))
    }

    async fn closed(&self) -> TransportError {
        self.shared.token.cancelled().await;
        TransportError::ConnectionClosed(self.shared.reason())
    }

    async fn close(&self, error_code: u32, reason: &str) {
        debug!(
            "[{}] Closing connection: {} (code: {})",
            self.connection_id, reason, error_code
        );
        self.shared.close(format!("closed locally: {}", reason));
    }

    fn is_closed(&self) -> bool {
        self.shared.token.is_cancelled()
    }

    fn remote_address(&self) -> SocketAddr {
        self.remote
    }

    fn protocol(&self) -> Protocol {
        self.protocol
    }

    fn stats(&self) -> ConnectionStats {
        ConnectionStats {
            uptime_secs: self.created_at.elapsed().as_secs(),
            ..Default::default()
        }
    }

    fn connection_id(&self) -> String {
        self.connection_id.clone()
    }
}

/// Edge side of an in-memory connection
pub struct MemoryPeer {
    connection_id: String,
    protocol: Protocol,
    shared: Arc<Shared>,
    stream_rx: Mutex<mpsc::UnboundedReceiver<ControlStream>>,
}

impl std::fmt::Debug for MemoryPeer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryPeer")
            .field("connection_id", &self.connection_id)
            .finish()
    }
}

impl MemoryPeer {
    /// Wait for the client to open its control stream
    ///
    /// Returns `None` once the connection is closed.
    pub async fn accept_control_stream(&self) -> Option<ControlStream> {
        let mut rx = self.stream_rx.lock().await;
        tokio::select! {
            _ = self.shared.token.cancelled() => None,
            stream = rx.recv() => stream,
        }
    }

    /// Drop the connection from the edge side
    pub fn close(&self, reason: &str) {
        debug!("[{}] Edge closing connection: {}", self.connection_id, reason);
        self.shared.close(format!("closed by peer: {}", reason));
    }

    /// Resolves once either side closed the connection
    pub async fn closed(&self) {
        self.shared.token.cancelled().await
    }

    pub fn is_closed(&self) -> bool {
        self.shared.token.is_cancelled()
    }

    pub fn protocol(&self) -> Protocol {
        self.protocol
    }

    pub fn connection_id(&self) -> &str {
        &self.connection_id
    }
}

impl Drop for MemoryPeer {
    fn drop(&mut self) {
        self.shared.close("peer dropped".to_string());
    }
}

/// Connector that hands the edge side of every connection to a [`MemoryAcceptor`]
#[derive(Debug, Clone)]
pub struct MemoryConnector {
    protocol: Protocol,
    peers: mpsc::UnboundedSender<(MemoryPeer, SocketAddr)>,
}

/// Receives the edge side of connections made through a [`MemoryConnector`]
#[derive(Debug)]
pub struct MemoryAcceptor {
    peers: mpsc::UnboundedReceiver<(MemoryPeer, SocketAddr)>,
}

impl MemoryConnector {
    pub fn new(protocol: Protocol) -> (Self, MemoryAcceptor) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                protocol,
                peers: tx,
            },
            MemoryAcceptor { peers: rx },
        )
    }
}

impl MemoryAcceptor {
    /// Next incoming connection and the address the client dialed
    pub async fn accept(&mut self) -> Option<(MemoryPeer, SocketAddr)> {
        self.peers.recv().await
    }
}

#[async_trait]
impl TransportConnector for MemoryConnector {
    async fn connect(
        &self,
        addr: SocketAddr,
        server_name: &str,
    ) -> TransportResult<Box<dyn TransportConnection>> {
        let (connection, peer) = memory_pair(self.protocol, addr);

        self.peers.send((peer, addr)).map_err(|_| {
            TransportError::ConnectionError(format!("{} ({}): connection refused", server_name, addr))
        })?;

        Ok(Box::new(connection))
    }

    fn protocol(&self) -> Protocol {
        self.protocol
    }
}
