//! QUIC transport implementation using quinn
//!
//! The datagram-multiplexed transport, tried first in the fallback order.
//! TLS 1.3 is mandatory; the connection offers the `edgetunnel` ALPN
//! identifier and sizes its initial packet and receive windows from
//! [`Protocol::flow_control`](edgetunnel_proto::Protocol::flow_control).
//!
//! # Example
//!
//! ```no_run
//! use edgetunnel_transport_quic::{QuicConfig, QuicConnector};
//! use edgetunnel_transport::TransportConnector;
//! use std::sync::Arc;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let connector = QuicConnector::new(Arc::new(QuicConfig::client_default()))?;
//! let conn = connector
//!     .connect("198.51.100.7:7844".parse()?, "quic.edgetunnel.net")
//!     .await?;
//! let control = conn.open_control_stream().await?;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod connection;

pub use config::QuicConfig;
pub use connection::{QuicConnection, QuicConnector};
