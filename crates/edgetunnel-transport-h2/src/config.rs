//! HTTP/2 transport configuration

use edgetunnel_proto::{FlowControl, Protocol};
use edgetunnel_transport::tls::build_client_crypto;
use edgetunnel_transport::{
    TransportConfig, TransportError, TransportResult, TransportSecurityConfig,
};
use std::sync::Arc;
use std::time::Duration;

/// HTTP/2-specific configuration
#[derive(Debug, Clone)]
pub struct H2Config {
    /// Security configuration
    security: TransportSecurityConfig,

    /// TCP connect + TLS handshake budget
    pub connect_timeout: Duration,

    /// Frame size and window sizes
    pub flow_control: FlowControl,
}

impl H2Config {
    /// Create a client configuration with defaults
    pub fn client_default() -> Self {
        Self {
            security: TransportSecurityConfig::for_protocol(Protocol::Http2),
            connect_timeout: Duration::from_secs(15),
            flow_control: Protocol::Http2.flow_control(),
        }
    }

    /// Create a client configuration for local development (skip cert verification)
    pub fn client_insecure() -> Self {
        Self::client_default().with_insecure_skip_verify()
    }

    /// Disable server certificate verification (INSECURE)
    pub fn with_insecure_skip_verify(mut self) -> Self {
        self.security.verify_server_cert = false;
        self
    }

    /// Trust these DER certificates instead of the webpki roots
    pub fn with_root_certs(mut self, certs: Vec<Vec<u8>>) -> Self {
        self.security.root_certs = certs;
        self
    }

    /// Build rustls TlsConnector for client
    pub(crate) fn build_tls_connector(&self) -> TransportResult<tokio_rustls::TlsConnector> {
        let client_crypto = build_client_crypto(&self.security)?;
        Ok(tokio_rustls::TlsConnector::from(Arc::new(client_crypto)))
    }

    /// HTTP/2 session builder with this config's windows and frame size
    pub(crate) fn session_builder(&self) -> h2::client::Builder {
        let mut builder = h2::client::Builder::new();
        builder
            .initial_window_size(self.flow_control.stream_window)
            .initial_connection_window_size(self.flow_control.connection_window)
            .max_frame_size(u32::from(self.flow_control.initial_mtu).max(MIN_FRAME_SIZE))
            .enable_push(false);
        builder
    }
}

// RFC 9113 floor for SETTINGS_MAX_FRAME_SIZE
const MIN_FRAME_SIZE: u32 = 16 * 1024;

impl TransportConfig for H2Config {
    fn security_config(&self) -> &TransportSecurityConfig {
        &self.security
    }

    fn validate(&self) -> TransportResult<()> {
        if self.flow_control.stream_window == 0 {
            return Err(TransportError::ConfigurationError(
                "Initial window size must be > 0".to_string(),
            ));
        }
        if self.flow_control.connection_window < self.flow_control.stream_window {
            return Err(TransportError::ConfigurationError(
                "Connection window must be >= stream window".to_string(),
            ));
        }
        if !self.security.alpn_protocols.iter().any(|p| p == "h2") {
            return Err(TransportError::ConfigurationError(
                "ALPN must offer h2".to_string(),
            ));
        }
        Ok(())
    }
}
