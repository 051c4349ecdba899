//! HTTP/2 connector and connection

use async_trait::async_trait;
use bytes::Bytes;
use edgetunnel_proto::Protocol;
use edgetunnel_transport::{
    ConnectionStats, ControlStream, TransportConfig, TransportConnection, TransportConnector,
    TransportError, TransportResult,
};
use h2::client::SendRequest;
use rustls::pki_types::ServerName;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::{watch, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::config::H2Config;
use crate::stream::{H2FrameReceiver, H2FrameSender};
use crate::CONTROL_STREAM_PATH;

/// Client-side HTTP/2 connection
pub struct H2Connection {
    connection_id: String,
    remote_addr: SocketAddr,
    server_name: String,
    /// Send request handle for opening streams
    send_request: Mutex<SendRequest<Bytes>>,
    /// Set by the connection driver when the session ends
    closed_rx: watch::Receiver<Option<String>>,
    shutdown: CancellationToken,
    created_at: Instant,
}

impl std::fmt::Debug for H2Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("H2Connection")
            .field("connection_id", &self.connection_id)
            .field("remote_addr", &self.remote_addr)
            .finish()
    }
}

impl H2Connection {
    pub async fn new<T>(
        io: T,
        remote_addr: SocketAddr,
        server_name: &str,
        config: &H2Config,
    ) -> TransportResult<Self>
    where
        T: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let connection_id = format!("h2-{}", uuid::Uuid::new_v4());

        let (send_request, h2_conn) = config
            .session_builder()
            .handshake::<_, Bytes>(io)
            .await
            .map_err(|e| TransportError::ConnectionError(format!("H2 handshake failed: {}", e)))?;

        let (closed_tx, closed_rx) = watch::channel(None);
        let shutdown = CancellationToken::new();

        // Spawn connection driver
        let conn_id = connection_id.clone();
        let driver_shutdown = shutdown.clone();
        tokio::spawn(async move {
            let reason = tokio::select! {
                result = h2_conn => match result {
                    Ok(()) => "closed by edge".to_string(),
                    Err(e) => {
                        if !e.is_go_away() && !e.is_io() {
                            error!("[{}] H2 connection error: {}", conn_id, e);
                        }
                        e.to_string()
                    }
                },
                _ = driver_shutdown.cancelled() => "closed locally".to_string(),
            };
            debug!("[{}] H2 connection closed: {}", conn_id, reason);
            let _ = closed_tx.send(Some(reason));
        });

        Ok(Self {
            connection_id,
            remote_addr,
            server_name: server_name.to_string(),
            send_request: Mutex::new(send_request),
            closed_rx,
            shutdown,
            created_at: Instant::now(),
        })
    }
}

#[async_trait]
impl TransportConnection for H2Connection {
    async fn open_control_stream(&self) -> TransportResult<ControlStream> {
        if self.is_closed() {
            return Err(TransportError::ConnectionClosed(
                "Connection closed".to_string(),
            ));
        }

        // SendRequest is Clone; take a handle and release the lock
        let send_request = self.send_request.lock().await.clone();

        let mut ready_request = send_request.ready().await.map_err(|e| {
            TransportError::ConnectionError(format!("H2 connection not ready: {}", e))
        })?;

        let request = http::Request::builder()
            .method("POST")
            .uri(format!("https://{}{}", self.server_name, CONTROL_STREAM_PATH))
            .body(())
            .map_err(|e| TransportError::ProtocolError(e.to_string()))?;

        let (response, send_stream) = ready_request.send_request(request, false).map_err(|e| {
            TransportError::ConnectionError(format!("Failed to open stream: {}", e))
        })?;

        let stream_id = u64::from(send_stream.stream_id().as_u32());

        let response = response.await.map_err(|e| {
            TransportError::ConnectionError(format!("Failed to get response: {}", e))
        })?;

        if !response.status().is_success() {
            return Err(TransportError::ProtocolError(format!(
                "Edge returned {} for control stream",
                response.status()
            )));
        }

        debug!("[{}] Opened control stream {}", self.connection_id, stream_id);

        Ok(ControlStream {
            stream_id,
            sender: Box::new(H2FrameSender::new(send_stream, stream_id)),
            receiver: Box::new(H2FrameReceiver::new(response.into_body(), stream_id)),
        })
    }

    async fn closed(&self) -> TransportError {
        let mut rx = self.closed_rx.clone();
        let reason = match rx.wait_for(|r| r.is_some()).await {
            Ok(reason) => reason.clone().unwrap_or_default(),
            Err(_) => "connection driver stopped".to_string(),
        };
        TransportError::ConnectionClosed(reason)
    }

    async fn close(&self, error_code: u32, reason: &str) {
        debug!(
            "[{}] Closing connection: {} (code: {})",
            self.connection_id, reason, error_code
        );
        self.shutdown.cancel();
    }

    fn is_closed(&self) -> bool {
        self.shutdown.is_cancelled() || self.closed_rx.borrow().is_some()
    }

    fn remote_address(&self) -> SocketAddr {
        self.remote_addr
    }

    fn protocol(&self) -> Protocol {
        Protocol::Http2
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

impl Drop for H2Connection {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

/// HTTP/2 connector for establishing outgoing connections
pub struct H2Connector {
    tls_connector: tokio_rustls::TlsConnector,
    config: Arc<H2Config>,
}

impl std::fmt::Debug for H2Connector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("H2Connector").finish()
    }
}

impl H2Connector {
    pub fn new(config: Arc<H2Config>) -> TransportResult<Self> {
        TransportConfig::validate(&*config)?;

        let tls_connector = config.build_tls_connector()?;

        debug!("HTTP/2 connector created");

        Ok(Self {
            tls_connector,
            config,
        })
    }

    async fn establish(
        &self,
        addr: SocketAddr,
        server_name: &str,
    ) -> TransportResult<tokio_rustls::client::TlsStream<TcpStream>> {
        let tcp_stream = TcpStream::connect(addr)
            .await
            .map_err(|e| TransportError::ConnectionError(format!("TCP connect failed: {}", e)))?;
        let _ = tcp_stream.set_nodelay(true);

        let dns_name = ServerName::try_from(server_name.to_string())
            .map_err(|e| TransportError::TlsError(format!("Invalid server name: {}", e)))?;

        let tls_stream = self
            .tls_connector
            .connect(dns_name, tcp_stream)
            .await
            .map_err(|e| TransportError::TlsError(format!("TLS handshake failed: {}", e)))?;

        let (_, session) = tls_stream.get_ref();
        if session.alpn_protocol() != Some(b"h2".as_slice()) {
            return Err(TransportError::ProtocolError(
                "Edge did not negotiate h2".to_string(),
            ));
        }

        Ok(tls_stream)
    }
}

#[async_trait]
impl TransportConnector for H2Connector {
    async fn connect(
        &self,
        addr: SocketAddr,
        server_name: &str,
    ) -> TransportResult<Box<dyn TransportConnection>> {
        debug!("Connecting to HTTP/2 server: {} ({})", server_name, addr);

        let tls_stream = tokio::time::timeout(
            self.config.connect_timeout,
            self.establish(addr, server_name),
        )
        .await
        .map_err(|_| TransportError::Timeout)??;

        let conn = H2Connection::new(tls_stream, addr, server_name, &self.config).await?;

        info!(
            "HTTP/2 connection established to {} ({})",
            server_name, addr
        );

        Ok(Box::new(conn))
    }

    fn protocol(&self) -> Protocol {
        Protocol::Http2
    }
}
