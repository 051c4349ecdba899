//! Transport protocol catalogue
//!
//! Every protocol an HA connection can be dialed with declares its TLS
//! identity (server name + ALPN identifiers) and the flow-control policy the
//! transport applies. The fallback order is fixed and total:
//! `quic -> http2`.

use serde::{Deserialize, Serialize};

/// Transport protocol used to reach the edge
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    /// QUIC transport (UDP-based, datagram multiplexed)
    Quic,
    /// HTTP/2 over TLS (TCP, stream multiplexed)
    Http2,
}

/// All protocols, most capable first. This is the fallback order.
pub const PROTOCOL_LIST: [Protocol; 2] = [Protocol::Quic, Protocol::Http2];

/// TLS identity a protocol presents to the edge
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TlsSettings {
    /// SNI sent during the handshake
    pub server_name: &'static str,
    /// ALPN identifiers offered to the edge
    pub next_protos: &'static [&'static str],
}

/// Flow-control / MTU policy of a transport
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlowControl {
    /// Initial packet size (QUIC) or maximum frame size (HTTP/2)
    pub initial_mtu: u16,
    /// Per-stream receive window in bytes
    pub stream_window: u32,
    /// Per-connection receive window in bytes
    pub connection_window: u32,
}

impl Protocol {
    /// Wire name, as accepted on the command line
    pub fn name(&self) -> &'static str {
        match self {
            Protocol::Quic => "quic",
            Protocol::Http2 => "http2",
        }
    }

    /// Next protocol in the fallback order
    pub fn fallback(&self) -> Option<Protocol> {
        match self {
            Protocol::Quic => Some(Protocol::Http2),
            Protocol::Http2 => None,
        }
    }

    /// TLS server name and ALPN identifiers required by the edge
    pub fn tls_settings(&self) -> TlsSettings {
        match self {
            Protocol::Quic => TlsSettings {
                server_name: "quic.edgetunnel.net",
                next_protos: &["edgetunnel"],
            },
            Protocol::Http2 => TlsSettings {
                server_name: "h2.edgetunnel.net",
                next_protos: &["h2"],
            },
        }
    }

    /// Flow-control policy for this transport
    pub fn flow_control(&self) -> FlowControl {
        match self {
            Protocol::Quic => FlowControl {
                initial_mtu: 1252,
                stream_window: 2 * 1024 * 1024,
                connection_window: 30 * 1024 * 1024,
            },
            Protocol::Http2 => FlowControl {
                initial_mtu: 16 * 1024,
                stream_window: 1024 * 1024,
                connection_window: 4 * 1024 * 1024,
            },
        }
    }

    /// Returns whether this protocol uses UDP
    pub fn is_udp(&self) -> bool {
        matches!(self, Protocol::Quic)
    }
}

impl std::fmt::Display for Protocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

impl std::str::FromStr for Protocol {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "quic" => Ok(Protocol::Quic),
            "http2" | "h2" => Ok(Protocol::Http2),
            _ => Err(format!("Unknown transport protocol: {}", s)),
        }
    }
}
