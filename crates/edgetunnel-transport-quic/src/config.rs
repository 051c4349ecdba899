//! QUIC transport configuration

use edgetunnel_proto::{FlowControl, Protocol};
use edgetunnel_transport::tls::build_client_crypto;
use edgetunnel_transport::{
    TransportConfig, TransportError, TransportResult, TransportSecurityConfig,
};
use std::sync::Arc;
use std::time::Duration;

/// QUIC-specific configuration
#[derive(Debug, Clone)]
pub struct QuicConfig {
    /// Security configuration
    security: TransportSecurityConfig,

    /// Keep-alive interval
    pub keep_alive_interval: Duration,

    /// Maximum idle timeout
    pub max_idle_timeout: Duration,

    /// Maximum number of concurrent bidirectional streams the edge may open
    pub max_concurrent_streams: u64,

    /// Initial MTU and receive windows
    pub flow_control: FlowControl,
}

impl QuicConfig {
    /// Create a client configuration with defaults
    ///
    /// Uses webpki root CAs for certificate verification.
    pub fn client_default() -> Self {
        Self {
            security: TransportSecurityConfig::for_protocol(Protocol::Quic),
            keep_alive_interval: Duration::from_secs(1),
            max_idle_timeout: Duration::from_secs(5),
            max_concurrent_streams: 1 << 16,
            flow_control: Protocol::Quic.flow_control(),
        }
    }

    /// Create a client configuration that skips certificate verification
    ///
    /// **INSECURE**: only for testing against a local edge.
    pub fn client_insecure() -> Self {
        Self::client_default().with_insecure_skip_verify()
    }

    /// Set custom keep-alive interval
    pub fn with_keep_alive(mut self, interval: Duration) -> Self {
        self.keep_alive_interval = interval;
        self
    }

    /// Set custom idle timeout
    pub fn with_idle_timeout(mut self, timeout: Duration) -> Self {
        self.max_idle_timeout = timeout;
        self
    }

    /// Disable server certificate verification (INSECURE - only for testing!)
    pub fn with_insecure_skip_verify(mut self) -> Self {
        self.security.verify_server_cert = false;
        self
    }

    /// Trust these DER certificates instead of the webpki roots
    pub fn with_root_certs(mut self, certs: Vec<Vec<u8>>) -> Self {
        self.security.root_certs = certs;
        self
    }

    /// Build quinn ClientConfig
    pub(crate) fn build_client_config(&self) -> TransportResult<quinn::ClientConfig> {
        let client_crypto = build_client_crypto(&self.security)?;

        // Convert to QUIC crypto config (quinn expects owned ClientConfig, not Arc)
        let mut client_config = quinn::ClientConfig::new(Arc::new(
            quinn::crypto::rustls::QuicClientConfig::try_from(client_crypto)
                .map_err(|e| TransportError::TlsError(e.to_string()))?,
        ));

        let idle_timeout = quinn::IdleTimeout::try_from(self.max_idle_timeout)
            .map_err(|e| TransportError::ConfigurationError(e.to_string()))?;
        let max_streams = quinn::VarInt::from_u64(self.max_concurrent_streams)
            .map_err(|e| TransportError::ConfigurationError(e.to_string()))?;

        let mut transport = quinn::TransportConfig::default();
        transport.keep_alive_interval(Some(self.keep_alive_interval));
        transport.max_idle_timeout(Some(idle_timeout));
        transport.max_concurrent_bidi_streams(max_streams);
        transport.initial_mtu(self.flow_control.initial_mtu);
        transport.stream_receive_window(quinn::VarInt::from_u32(self.flow_control.stream_window));
        transport.receive_window(quinn::VarInt::from_u32(self.flow_control.connection_window));

        client_config.transport_config(Arc::new(transport));

        Ok(client_config)
    }
}

impl TransportConfig for QuicConfig {
    fn security_config(&self) -> &TransportSecurityConfig {
        &self.security
    }

    fn validate(&self) -> TransportResult<()> {
        if self.keep_alive_interval.is_zero() {
            return Err(TransportError::ConfigurationError(
                "Keep-alive interval must be > 0".to_string(),
            ));
        }

        if self.max_idle_timeout < self.keep_alive_interval * 2 {
            return Err(TransportError::ConfigurationError(
                "Idle timeout must be at least 2x keep-alive interval".to_string(),
            ));
        }

        if self.flow_control.initial_mtu < 1200 {
            return Err(TransportError::ConfigurationError(
                "Initial MTU must be at least 1200 bytes".to_string(),
            ));
        }

        Ok(())
    }
}
