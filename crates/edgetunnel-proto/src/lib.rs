//! Edge tunnel wire definitions
//!
//! This crate defines the RPC records exchanged with the edge over each HA
//! connection's control stream, the frame codec that carries them, and the
//! catalogue of transport protocols a connection can be dialed with.

pub mod codec;
pub mod protocol;
pub mod rpc;

pub use codec::{CodecError, RpcCodec};
pub use protocol::{FlowControl, Protocol, TlsSettings, PROTOCOL_LIST};
pub use rpc::*;

/// RPC schema version spoken on the control stream
pub const PROTOCOL_VERSION: u32 = 1;

/// Maximum frame size (16MB)
pub const MAX_FRAME_SIZE: u32 = 16 * 1024 * 1024;
