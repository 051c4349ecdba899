//! Protocol to transport connector mapping

use async_trait::async_trait;
use edgetunnel_proto::Protocol;
use edgetunnel_transport::{
    TransportConnection, TransportConnector, TransportError, TransportResult,
};
use edgetunnel_transport_h2::{H2Config, H2Connector};
use edgetunnel_transport_quic::{QuicConfig, QuicConnector};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::debug;

/// Opens a transport connection to an edge address
#[async_trait]
pub trait EdgeDialer: Send + Sync {
    async fn dial(
        &self,
        protocol: Protocol,
        addr: SocketAddr,
    ) -> TransportResult<Box<dyn TransportConnection>>;
}

/// Dials through one connector per protocol
#[derive(Debug, Default, Clone)]
pub struct TransportDialer {
    connectors: HashMap<Protocol, Arc<dyn TransportConnector>>,
}

impl TransportDialer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_connector(mut self, connector: Arc<dyn TransportConnector>) -> Self {
        self.connectors.insert(connector.protocol(), connector);
        self
    }

    /// QUIC and HTTP/2 connectors with the edge's TLS settings
    pub fn edge_default(insecure: bool, root_certs: Vec<Vec<u8>>) -> TransportResult<Self> {
        let mut quic = QuicConfig::client_default();
        let mut h2 = H2Config::client_default();
        if insecure {
            quic = quic.with_insecure_skip_verify();
            h2 = h2.with_insecure_skip_verify();
        }
        if !root_certs.is_empty() {
            quic = quic.with_root_certs(root_certs.clone());
            h2 = h2.with_root_certs(root_certs);
        }

        Ok(Self::new()
            .with_connector(Arc::new(QuicConnector::new(Arc::new(quic))?))
            .with_connector(Arc::new(H2Connector::new(Arc::new(h2))?)))
    }

    pub fn protocols(&self) -> Vec<Protocol> {
        let mut protocols: Vec<Protocol> = self.connectors.keys().copied().collect();
        protocols.sort_by_key(|p| p.name());
        protocols
    }
}

#[async_trait]
impl EdgeDialer for TransportDialer {
    async fn dial(
        &self,
        protocol: Protocol,
        addr: SocketAddr,
    ) -> TransportResult<Box<dyn TransportConnection>> {
        let connector = self.connectors.get(&protocol).ok_or_else(|| {
            TransportError::ConfigurationError(format!("no connector for {}", protocol))
        })?;

        let server_name = protocol.tls_settings().server_name;
        debug!(%addr, %protocol, server_name, "Dialing edge");
        connector.connect(addr, server_name).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use edgetunnel_transport::MemoryConnector;

    #[tokio::test]
    async fn test_dial_routes_by_protocol() {
        let (connector, mut acceptor) = MemoryConnector::new(Protocol::Http2);
        let dialer = TransportDialer::new().with_connector(Arc::new(connector));
        let addr: SocketAddr = "198.51.100.1:7844".parse().unwrap();

        let connection = dialer.dial(Protocol::Http2, addr).await.unwrap();
        assert_eq!(connection.protocol(), Protocol::Http2);

        let (_peer, dialed) = acceptor.accept().await.unwrap();
        assert_eq!(dialed, addr);
    }

    #[tokio::test]
    async fn test_missing_connector() {
        let (connector, _acceptor) = MemoryConnector::new(Protocol::Http2);
        let dialer = TransportDialer::new().with_connector(Arc::new(connector));

        let err = dialer
            .dial(Protocol::Quic, "198.51.100.1:7844".parse().unwrap())
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::ConfigurationError(_)));
        assert_eq!(dialer.protocols(), vec![Protocol::Http2]);
    }
}
