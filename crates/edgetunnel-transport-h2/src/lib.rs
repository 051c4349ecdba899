//! HTTP/2 transport implementation
//!
//! The stream-multiplexed-over-TLS fallback used when QUIC is unavailable
//! (UDP blocked, or rolled back by the edge). A connection is
//! TCP, then TLS with the `h2` ALPN identifier, then an HTTP/2 client session.
//! The RPC control stream is a long-lived `POST` whose request and response
//! bodies carry length-prefixed frames.

pub mod config;
pub mod connection;
pub mod stream;

pub use config::H2Config;
pub use connection::{H2Connection, H2Connector};
pub use stream::{H2FrameReceiver, H2FrameSender};

/// Path of the control stream request
pub const CONTROL_STREAM_PATH: &str = "/rpc";
