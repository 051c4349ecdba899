//! QUIC connector and connection

use async_trait::async_trait;
use edgetunnel_proto::Protocol;
use edgetunnel_transport::{
    ConnectionStats, ControlStream, FramedReceiver, FramedSender, TransportConfig,
    TransportConnection, TransportConnector, TransportError, TransportResult,
};
use quinn::{Connection, Endpoint};
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, trace};

use crate::config::QuicConfig;

/// QUIC connection wrapper
///
/// Owns the endpoint it was dialed from, so the UDP socket lives exactly as
/// long as the connection.
#[derive(Debug)]
pub struct QuicConnection {
    inner: Connection,
    endpoint: Endpoint,
    connection_id: String,
    created_at: Instant,
}

impl QuicConnection {
    fn new(connection: Connection, endpoint: Endpoint) -> Self {
        let connection_id = format!("quic-{}", connection.stable_id());

        Self {
            inner: connection,
            endpoint,
            connection_id,
            created_at: Instant::now(),
        }
    }

    /// Get the underlying quinn connection
    pub fn inner(&self) -> &Connection {
        &self.inner
    }
}

fn describe_close(e: &quinn::ConnectionError) -> TransportError {
    match e {
        quinn::ConnectionError::TimedOut => TransportError::Timeout,
        quinn::ConnectionError::LocallyClosed => {
            TransportError::ConnectionClosed("closed locally".to_string())
        }
        quinn::ConnectionError::ApplicationClosed(close) => TransportError::ConnectionClosed(
            format!("closed by edge: {}", String::from_utf8_lossy(&close.reason)),
        ),
        other => TransportError::ConnectionError(other.to_string()),
    }
}

#[async_trait]
impl TransportConnection for QuicConnection {
    async fn open_control_stream(&self) -> TransportResult<ControlStream> {
        let (send, recv) = self
            .inner
            .open_bi()
            .await
            .map_err(|e| describe_close(&e))?;

        let stream_id = send.id().index();
        trace!("Opened bidirectional stream: {}", stream_id);

        Ok(ControlStream {
            stream_id,
            sender: Box::new(FramedSender::new(send, stream_id)),
            receiver: Box::new(FramedReceiver::new(recv, stream_id)),
        })
    }

    async fn closed(&self) -> TransportError {
        let e = self.inner.closed().await;
        describe_close(&e)
    }

    async fn close(&self, error_code: u32, reason: &str) {
        self.inner
            .close(quinn::VarInt::from_u32(error_code), reason.as_bytes());
        self.endpoint.close(quinn::VarInt::from_u32(error_code), b"");

        debug!(
            "QUIC connection {} closed: {} (code: {})",
            self.connection_id, reason, error_code
        );
    }

    fn is_closed(&self) -> bool {
        self.inner.close_reason().is_some()
    }

    fn remote_address(&self) -> SocketAddr {
        self.inner.remote_address()
    }

    fn protocol(&self) -> Protocol {
        Protocol::Quic
    }

    fn stats(&self) -> ConnectionStats {
        let quinn_stats = self.inner.stats();

        ConnectionStats {
            bytes_sent: quinn_stats.udp_tx.bytes,
            bytes_received: quinn_stats.udp_rx.bytes,
            rtt_ms: Some(quinn_stats.path.rtt.as_millis() as u32),
            uptime_secs: self.created_at.elapsed().as_secs(),
        }
    }

    fn connection_id(&self) -> String {
        self.connection_id.clone()
    }
}

/// QUIC connector for establishing outgoing connections
#[derive(Debug)]
pub struct QuicConnector {
    client_config: quinn::ClientConfig,
    _config: Arc<QuicConfig>,
}

impl QuicConnector {
    pub fn new(config: Arc<QuicConfig>) -> TransportResult<Self> {
        TransportConfig::validate(&*config)?;

        let client_config = config.build_client_config()?;

        debug!("QUIC connector created");

        Ok(Self {
            client_config,
            _config: config,
        })
    }

    // One UDP socket per connection, bound to the edge address's family
    fn bind_endpoint(&self, remote: SocketAddr) -> TransportResult<Endpoint> {
        let local: SocketAddr = match remote {
            SocketAddr::V4(_) => (Ipv4Addr::UNSPECIFIED, 0).into(),
            SocketAddr::V6(_) => (Ipv6Addr::UNSPECIFIED, 0).into(),
        };

        let mut endpoint = Endpoint::client(local)?;
        endpoint.set_default_client_config(self.client_config.clone());
        Ok(endpoint)
    }
}

#[async_trait]
impl TransportConnector for QuicConnector {
    async fn connect(
        &self,
        addr: SocketAddr,
        server_name: &str,
    ) -> TransportResult<Box<dyn TransportConnection>> {
        debug!("Connecting to QUIC server: {} ({})", server_name, addr);

        let endpoint = self.bind_endpoint(addr)?;

        let connecting = endpoint
            .connect(addr, server_name)
            .map_err(|e| TransportError::ConnectionError(e.to_string()))?;

        let connection = connecting.await.map_err(|e| {
            endpoint.close(0u32.into(), b"");
            TransportError::ConnectionError(e.to_string())
        })?;

        info!("QUIC connection established to {} ({})", server_name, addr);

        Ok(Box::new(QuicConnection::new(connection, endpoint)))
    }

    fn protocol(&self) -> Protocol {
        Protocol::Quic
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_close_reasons() {
        assert_eq!(
            describe_close(&quinn::ConnectionError::TimedOut),
            TransportError::Timeout
        );
        assert!(matches!(
            describe_close(&quinn::ConnectionError::LocallyClosed),
            TransportError::ConnectionClosed(_)
        ));
    }

    #[tokio::test]
    async fn test_connector_binds_matching_family() {
        let connector = QuicConnector::new(Arc::new(QuicConfig::client_insecure())).unwrap();

        let v4 = connector
            .bind_endpoint("127.0.0.1:7844".parse().unwrap())
            .unwrap();
        assert!(v4.local_addr().unwrap().is_ipv4());
    }
}
