//! Registration RPC records
//!
//! These records are the one hard compatibility boundary with the edge. Field
//! order and widths are part of the wire format:
//!
//! - account tag and tunnel secret are length-prefixed byte strings
//! - UUIDs are 16 raw bytes (no length prefix)
//! - IP addresses are raw bytes (4 or 16)
//! - `conn_index` is a single byte
//! - `retry_after` is a fixed-width i64 count of nanoseconds

use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::time::Duration;
use uuid::Uuid;

/// A single RPC frame on the control stream
///
/// Requests and responses share the `id`; the side that issued the request
/// picks it, the other side echoes it back.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RpcFrame {
    pub id: u64,
    pub body: RpcBody,
}

/// RPC call or result
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum RpcBody {
    // Client -> edge
    RegisterConnection(RegisterConnectionRequest),
    RegisterConnectionResult(ConnectionResponse),
    UnregisterConnection,
    UnregisterConnectionResult,
    UpdateLocalConfiguration {
        #[serde(with = "serde_bytes")]
        config: Vec<u8>,
    },
    UpdateLocalConfigurationResult {
        err: String,
    },

    // Edge -> client
    UpdateConfiguration(UpdateConfigurationRequest),
    UpdateConfigurationResult(UpdateConfigurationResponse),

    /// The peer could not handle the call at all (unknown method, decode error)
    Failed {
        message: String,
    },
}

impl RpcBody {
    /// Method name used in logs
    pub fn method(&self) -> &'static str {
        match self {
            RpcBody::RegisterConnection(_) | RpcBody::RegisterConnectionResult(_) => {
                "registerConnection"
            }
            RpcBody::UnregisterConnection | RpcBody::UnregisterConnectionResult => {
                "unregisterConnection"
            }
            RpcBody::UpdateLocalConfiguration { .. }
            | RpcBody::UpdateLocalConfigurationResult { .. } => "updateLocalConfiguration",
            RpcBody::UpdateConfiguration(_) | RpcBody::UpdateConfigurationResult(_) => {
                "updateConfiguration"
            }
            RpcBody::Failed { .. } => "failed",
        }
    }

    /// Whether this body starts a call (as opposed to answering one)
    pub fn is_request(&self) -> bool {
        matches!(
            self,
            RpcBody::RegisterConnection(_)
                | RpcBody::UnregisterConnection
                | RpcBody::UpdateLocalConfiguration { .. }
                | RpcBody::UpdateConfiguration(_)
        )
    }
}

/// Account credentials presented with every registration
#[derive(Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TunnelAuth {
    pub account_tag: String,
    #[serde(with = "serde_bytes")]
    pub tunnel_secret: Vec<u8>,
}

// The secret never goes to logs
impl std::fmt::Debug for TunnelAuth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TunnelAuth")
            .field("account_tag", &self.account_tag)
            .field("tunnel_secret", &"<redacted>")
            .finish()
    }
}

/// Identity of this client build
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct ClientInfo {
    #[serde(with = "serde_bytes")]
    pub client_id: Vec<u8>,
    pub features: Vec<String>,
    pub version: String,
    pub arch: String,
}

/// Options sent alongside a registration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct ConnectionOptions {
    pub client: ClientInfo,
    #[serde(with = "serde_bytes_option")]
    pub origin_local_ip: Option<Vec<u8>>,
    pub replace_existing: bool,
    pub compression_quality: u8,
    pub num_previous_attempts: u8,
}

impl ConnectionOptions {
    /// Set the origin local IP as raw bytes
    pub fn with_origin_local_ip(mut self, ip: IpAddr) -> Self {
        self.origin_local_ip = Some(match ip {
            IpAddr::V4(v4) => v4.octets().to_vec(),
            IpAddr::V6(v6) => v6.octets().to_vec(),
        });
        self
    }
}

/// `registerConnection` parameters
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RegisterConnectionRequest {
    pub auth: TunnelAuth,
    pub tunnel_id: [u8; 16],
    pub conn_index: u8,
    pub options: ConnectionOptions,
}

/// Details of a registered connection
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ConnectionDetails {
    pub uuid: [u8; 16],
    pub location_name: String,
    pub tunnel_is_remotely_managed: bool,
}

impl ConnectionDetails {
    pub fn new(uuid: Uuid, location_name: impl Into<String>, remotely_managed: bool) -> Self {
        Self {
            uuid: *uuid.as_bytes(),
            location_name: location_name.into(),
            tunnel_is_remotely_managed: remotely_managed,
        }
    }

    /// UUID assigned by the edge to this session
    pub fn uuid(&self) -> Uuid {
        Uuid::from_bytes(self.uuid)
    }
}

/// Registration rejected by the edge
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ConnectionError {
    pub cause: String,
    /// Nanoseconds to wait before retrying; 0 when unset
    pub retry_after: i64,
    pub should_retry: bool,
}

impl ConnectionError {
    /// Non-retryable error
    pub fn fatal(cause: impl Into<String>) -> Self {
        Self {
            cause: cause.into(),
            retry_after: 0,
            should_retry: false,
        }
    }

    /// Retryable error with an optional server-provided delay
    pub fn retry(cause: impl Into<String>, retry_after: Option<Duration>) -> Self {
        Self {
            cause: cause.into(),
            retry_after: retry_after
                .map(|d| i64::try_from(d.as_nanos()).unwrap_or(i64::MAX))
                .unwrap_or(0),
            should_retry: true,
        }
    }

    /// Server-provided retry delay, if any
    pub fn retry_after(&self) -> Option<Duration> {
        if self.retry_after > 0 {
            Some(Duration::from_nanos(self.retry_after as u64))
        } else {
            None
        }
    }
}

/// `registerConnection` result union
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum ConnectionResponse {
    Error(ConnectionError),
    ConnectionDetails(ConnectionDetails),
}

/// `updateConfiguration` parameters (edge -> client)
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct UpdateConfigurationRequest {
    pub version: i32,
    #[serde(with = "serde_bytes")]
    pub config: Vec<u8>,
}

/// `updateConfiguration` result
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct UpdateConfigurationResponse {
    pub latest_applied_version: i32,
    /// Empty when the update was applied (or ignored as stale)
    pub err: String,
}

impl UpdateConfigurationResponse {
    pub fn applied(version: i32) -> Self {
        Self {
            latest_applied_version: version,
            err: String::new(),
        }
    }

    pub fn rejected(version: i32, err: impl std::fmt::Display) -> Self {
        Self {
            latest_applied_version: version,
            err: err.to_string(),
        }
    }

    pub fn error(&self) -> Option<&str> {
        if self.err.is_empty() {
            None
        } else {
            Some(&self.err)
        }
    }
}

// Custom serde helpers for bytes
mod serde_bytes {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(data: &[u8], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_bytes(data)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<u8>, D::Error>
    where
        D: Deserializer<'de>,
    {
        Vec::<u8>::deserialize(deserializer)
    }
}

mod serde_bytes_option {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(data: &Option<Vec<u8>>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match data {
            Some(bytes) => serializer.serialize_some(&bytes),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Vec<u8>>, D::Error>
    where
        D: Deserializer<'de>,
    {
        Option::<Vec<u8>>::deserialize(deserializer)
    }
}
