//! Transport abstraction layer for HA connections
//!
//! This crate provides the transport-agnostic traits the supervisor dials
//! through, so a connection slot can switch between QUIC and HTTP/2 at runtime
//! without knowing which one it holds.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │           edgetunnel-client (supervisor, slots)          │
//! └─────────────────────────────────────────────────────────┘
//!                           │
//!                           │ Box<dyn TransportConnection>
//!                           ↓
//! ┌─────────────────────────────────────────────────────────┐
//! │           edgetunnel-transport (this crate)              │
//! │  - TransportConnector   - TransportConnection            │
//! │  - ControlStream        - in-memory transport            │
//! └─────────────────────────────────────────────────────────┘
//!                           │
//!                           │ Implemented by
//!                           ↓
//! ┌───────────────────────────┬─────────────────────────────┐
//! │ edgetunnel-transport-quic │ edgetunnel-transport-h2     │
//! └───────────────────────────┴─────────────────────────────┘
//! ```
//!
//! The traits are object safe: the protocol is chosen per dial, so the
//! supervisor holds connections as trait objects.

pub mod framed;
pub mod memory;
pub mod tls;

use async_trait::async_trait;
use edgetunnel_proto::{Protocol, RpcFrame};
use std::fmt::Debug;
use std::net::SocketAddr;
use thiserror::Error;

pub use framed::{FramedReceiver, FramedSender};
pub use memory::{memory_pair, MemoryAcceptor, MemoryConnection, MemoryConnector, MemoryPeer};

/// Transport-level errors
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("Connection error: {0}")]
    ConnectionError(String),

    #[error("IO error: {0}")]
    IoError(String),

    #[error("Stream closed")]
    StreamClosed,

    #[error("Connection closed: {0}")]
    ConnectionClosed(String),

    #[error("Protocol error: {0}")]
    ProtocolError(String),

    #[error("Timeout")]
    Timeout,

    #[error("TLS error: {0}")]
    TlsError(String),

    #[error("Configuration error: {0}")]
    ConfigurationError(String),
}

impl From<std::io::Error> for TransportError {
    fn from(e: std::io::Error) -> Self {
        TransportError::IoError(e.to_string())
    }
}

impl From<edgetunnel_proto::CodecError> for TransportError {
    fn from(e: edgetunnel_proto::CodecError) -> Self {
        TransportError::ProtocolError(e.to_string())
    }
}

/// Result type for transport operations
pub type TransportResult<T> = Result<T, TransportError>;

/// Sending half of a control stream
#[async_trait]
pub trait FrameSender: Send {
    /// Send one RPC frame
    async fn send_frame(&mut self, frame: &RpcFrame) -> TransportResult<()>;

    /// Close the sending side of the stream
    async fn finish(&mut self) -> TransportResult<()>;
}

/// Receiving half of a control stream
#[async_trait]
pub trait FrameReceiver: Send {
    /// Receive one RPC frame
    ///
    /// Returns `None` if the stream has been closed gracefully by the remote peer.
    async fn recv_frame(&mut self) -> TransportResult<Option<RpcFrame>>;
}

/// The RPC control stream of a connection, already split so reads and
/// writes can proceed from different tasks.
pub struct ControlStream {
    pub stream_id: u64,
    pub sender: Box<dyn FrameSender>,
    pub receiver: Box<dyn FrameReceiver>,
}

impl Debug for ControlStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ControlStream")
            .field("stream_id", &self.stream_id)
            .finish()
    }
}

/// A live transport connection to one edge address
#[async_trait]
pub trait TransportConnection: Send + Sync + Debug {
    /// Open the RPC control stream used for registration
    async fn open_control_stream(&self) -> TransportResult<ControlStream>;

    /// Resolves once the connection is gone, with the reason
    async fn closed(&self) -> TransportError;

    /// Close the connection gracefully
    ///
    /// # Arguments
    /// * `error_code` - Application-specific error code (0 for normal closure)
    /// * `reason` - Human-readable reason for closure
    async fn close(&self, error_code: u32, reason: &str);

    /// Check if the connection is closed
    fn is_closed(&self) -> bool;

    /// Get the remote edge address
    fn remote_address(&self) -> SocketAddr;

    /// Protocol this connection speaks
    fn protocol(&self) -> Protocol;

    /// Get connection statistics
    fn stats(&self) -> ConnectionStats;

    /// Get a unique stable identifier for this connection, for logs
    fn connection_id(&self) -> String;
}

/// Statistics about a connection
#[derive(Debug, Clone, Default)]
pub struct ConnectionStats {
    /// Number of bytes sent
    pub bytes_sent: u64,

    /// Number of bytes received
    pub bytes_received: u64,

    /// Round-trip time estimate (milliseconds)
    pub rtt_ms: Option<u32>,

    /// Connection uptime (seconds)
    pub uptime_secs: u64,
}

/// Establishes outgoing transport connections
#[async_trait]
pub trait TransportConnector: Send + Sync + Debug {
    /// Connect to an edge address
    ///
    /// # Arguments
    /// * `addr` - The socket address to connect to
    /// * `server_name` - The server name for TLS verification
    async fn connect(
        &self,
        addr: SocketAddr,
        server_name: &str,
    ) -> TransportResult<Box<dyn TransportConnection>>;

    /// Protocol of the connections this connector creates
    fn protocol(&self) -> Protocol;
}

/// Configuration for transport security
#[derive(Debug, Clone)]
pub struct TransportSecurityConfig {
    /// Whether to verify the server's TLS certificate
    pub verify_server_cert: bool,

    /// Custom root CA certificates, DER encoded (if not using webpki roots)
    pub root_certs: Vec<Vec<u8>>,

    /// Application-Layer Protocol Negotiation (ALPN) protocols
    pub alpn_protocols: Vec<String>,
}

impl TransportSecurityConfig {
    /// Security settings with the ALPN identifiers a protocol requires
    pub fn for_protocol(protocol: Protocol) -> Self {
        Self {
            verify_server_cert: true,
            root_certs: Vec::new(),
            alpn_protocols: protocol
                .tls_settings()
                .next_protos
                .iter()
                .map(|p| p.to_string())
                .collect(),
        }
    }
}

impl Default for TransportSecurityConfig {
    fn default() -> Self {
        Self::for_protocol(Protocol::Quic)
    }
}

/// Transport-specific configuration
pub trait TransportConfig: Send + Sync + Debug {
    /// Get the security configuration
    fn security_config(&self) -> &TransportSecurityConfig;

    /// Validate the configuration
    fn validate(&self) -> TransportResult<()>;
}
