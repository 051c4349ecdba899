//! Registration RPC client
//!
//! One [`RpcSession`] runs per control stream: a reader task routes results
//! to pending calls and answers the edge's own calls (configuration pushes),
//! while callers share the writer. [`RegistrationClient`] layers the typed
//! registration calls on top.

use async_trait::async_trait;
use edgetunnel_proto::{
    ConnectionDetails, ConnectionOptions, ConnectionResponse, RegisterConnectionRequest, RpcBody,
    RpcFrame, TunnelAuth, UpdateConfigurationResponse,
};
use edgetunnel_transport::{ControlStream, FrameReceiver, FrameSender, TransportError};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{oneshot, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::pending::PendingCalls;

/// Receives configuration pushed by the edge
#[async_trait]
pub trait ConfigurationManager: Send + Sync {
    async fn update_configuration(&self, version: i32, config: &[u8]) -> UpdateConfigurationResponse;
}

/// RPC errors
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RpcError {
    #[error("{method} timed out")]
    Timeout { method: &'static str },

    #[error("RPC session closed")]
    SessionClosed,

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Edge failed the call: {0}")]
    Remote(String),

    #[error("Unexpected response to {method}")]
    UnexpectedResponse { method: &'static str },
}

/// Registration errors
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RegistrationError {
    #[error("Registration failed (retryable): {cause}")]
    Retryable {
        cause: String,
        retry_after: Option<Duration>,
    },

    #[error("Registration failed: {cause}")]
    Permanent { cause: String },

    #[error(transparent)]
    Rpc(#[from] RpcError),
}

impl RegistrationError {
    /// Whether the edge rejected our credentials
    ///
    /// Only permanent rejections count; the edge marks bad credentials as
    /// non-retryable.
    pub fn is_auth_failure(&self) -> bool {
        let RegistrationError::Permanent { cause } = self else {
            return false;
        };
        let cause = cause.to_lowercase();
        ["unauthorized", "authentication", "credential", "invalid token"]
            .iter()
            .any(|needle| cause.contains(needle))
    }

    pub fn is_retryable(&self) -> bool {
        !matches!(self, RegistrationError::Permanent { .. })
    }
}

/// Request/response session over one control stream
pub struct RpcSession {
    stream_id: u64,
    writer: Arc<Mutex<Box<dyn FrameSender>>>,
    pending: PendingCalls,
    next_id: AtomicU64,
    reader: JoinHandle<()>,
    /// Cancelled once the stream can no longer carry calls
    closed: CancellationToken,
}

impl std::fmt::Debug for RpcSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RpcSession")
            .field("stream_id", &self.stream_id)
            .field("pending", &self.pending.count())
            .finish()
    }
}

impl RpcSession {
    /// Start serving a control stream
    pub fn start(stream: ControlStream, manager: Arc<dyn ConfigurationManager>) -> Self {
        let ControlStream {
            stream_id,
            sender,
            receiver,
        } = stream;
        let writer = Arc::new(Mutex::new(sender));
        let pending = PendingCalls::new();
        let closed = CancellationToken::new();

        let reader = tokio::spawn(read_loop(
            stream_id,
            receiver,
            writer.clone(),
            pending.clone(),
            manager,
            closed.clone(),
        ));

        Self {
            stream_id,
            writer,
            pending,
            next_id: AtomicU64::new(1),
            reader,
            closed,
        }
    }

    /// Issue a call and wait for its result
    pub async fn call(&self, body: RpcBody, timeout: Duration) -> Result<RpcBody, RpcError> {
        let method = body.method();
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let rx = self.pending.register(id).ok_or(RpcError::SessionClosed)?;

        match tokio::time::timeout(timeout, self.round_trip(id, body, rx)).await {
            Ok(result) => result,
            Err(_) => {
                self.pending.cancel(id);
                Err(RpcError::Timeout { method })
            }
        }
    }

    async fn round_trip(
        &self,
        id: u64,
        body: RpcBody,
        rx: oneshot::Receiver<RpcBody>,
    ) -> Result<RpcBody, RpcError> {
        let sent = {
            let mut writer = self.writer.lock().await;
            writer.send_frame(&RpcFrame { id, body }).await
        };
        if let Err(e) = sent {
            self.pending.cancel(id);
            return Err(e.into());
        }

        match rx.await {
            Ok(RpcBody::Failed { message }) => Err(RpcError::Remote(message)),
            Ok(body) => Ok(body),
            Err(_) => Err(RpcError::SessionClosed),
        }
    }

    /// Whether the stream has ended
    pub fn is_closed(&self) -> bool {
        self.pending.is_closed()
    }

    /// Resolves once the edge ended the stream or the session was closed
    pub async fn closed(&self) {
        self.closed.cancelled().await
    }

    /// Finish our side of the stream and stop reading
    pub async fn close(&self) {
        if let Err(e) = self.writer.lock().await.finish().await {
            debug!(stream_id = self.stream_id, "Failed to finish control stream: {}", e);
        }
        self.reader.abort();
        self.pending.close_all();
        self.closed.cancel();
    }
}

impl Drop for RpcSession {
    fn drop(&mut self) {
        self.reader.abort();
        self.closed.cancel();
    }
}

async fn read_loop(
    stream_id: u64,
    mut receiver: Box<dyn FrameReceiver>,
    writer: Arc<Mutex<Box<dyn FrameSender>>>,
    pending: PendingCalls,
    manager: Arc<dyn ConfigurationManager>,
    closed: CancellationToken,
) {
    loop {
        let frame = match receiver.recv_frame().await {
            Ok(Some(frame)) => frame,
            Ok(None) => {
                debug!(stream_id, "Control stream closed by edge");
                break;
            }
            Err(e) => {
                debug!(stream_id, "Control stream read failed: {}", e);
                break;
            }
        };

        if !frame.body.is_request() {
            pending.respond(frame.id, frame.body);
            continue;
        }

        let reply = match frame.body {
            RpcBody::UpdateConfiguration(request) => {
                let response = manager
                    .update_configuration(request.version, &request.config)
                    .await;
                RpcBody::UpdateConfigurationResult(response)
            }
            other => {
                warn!(stream_id, "Edge called unsupported method {}", other.method());
                RpcBody::Failed {
                    message: format!("unsupported method {}", other.method()),
                }
            }
        };

        let mut writer = writer.lock().await;
        if let Err(e) = writer.send_frame(&RpcFrame { id: frame.id, body: reply }).await {
            debug!(stream_id, "Failed to answer edge call {}: {}", frame.id, e);
            break;
        }
    }

    pending.close_all();
    closed.cancel();
}

/// Typed registration calls over an [`RpcSession`]
#[derive(Debug)]
pub struct RegistrationClient {
    session: RpcSession,
    rpc_timeout: Duration,
}

impl RegistrationClient {
    pub fn new(
        stream: ControlStream,
        manager: Arc<dyn ConfigurationManager>,
        rpc_timeout: Duration,
    ) -> Self {
        Self {
            session: RpcSession::start(stream, manager),
            rpc_timeout,
        }
    }

    /// Authenticate this connection and receive its routing assignment
    pub async fn register_connection(
        &self,
        auth: &TunnelAuth,
        tunnel_id: Uuid,
        conn_index: u8,
        options: &ConnectionOptions,
    ) -> Result<ConnectionDetails, RegistrationError> {
        let request = RegisterConnectionRequest {
            auth: auth.clone(),
            tunnel_id: *tunnel_id.as_bytes(),
            conn_index,
            options: options.clone(),
        };

        let response = self
            .session
            .call(RpcBody::RegisterConnection(request), self.rpc_timeout)
            .await?;

        match response {
            RpcBody::RegisterConnectionResult(ConnectionResponse::ConnectionDetails(details)) => {
                info!(
                    conn_index,
                    connection_id = %details.uuid(),
                    location = %details.location_name,
                    "Registered tunnel connection"
                );
                Ok(details)
            }
            RpcBody::RegisterConnectionResult(ConnectionResponse::Error(e)) if e.should_retry => {
                Err(RegistrationError::Retryable {
                    retry_after: e.retry_after(),
                    cause: e.cause,
                })
            }
            RpcBody::RegisterConnectionResult(ConnectionResponse::Error(e)) => {
                Err(RegistrationError::Permanent { cause: e.cause })
            }
            _ => Err(RpcError::UnexpectedResponse {
                method: "registerConnection",
            }
            .into()),
        }
    }

    /// Tell the edge this connection is going away
    pub async fn unregister_connection(&self, timeout: Duration) -> Result<(), RpcError> {
        match self
            .session
            .call(RpcBody::UnregisterConnection, timeout)
            .await
        {
            Ok(RpcBody::UnregisterConnectionResult) => Ok(()),
            Ok(_) => Err(RpcError::UnexpectedResponse {
                method: "unregisterConnection",
            }),
            Err(e) => {
                warn!("Failed to unregister connection: {}", e);
                Err(e)
            }
        }
    }

    /// Report the locally resolved configuration to the edge
    pub async fn update_local_configuration(&self, config: Vec<u8>) -> Result<(), RpcError> {
        let result = match self
            .session
            .call(
                RpcBody::UpdateLocalConfiguration { config },
                self.rpc_timeout,
            )
            .await
        {
            Ok(RpcBody::UpdateLocalConfigurationResult { err }) if err.is_empty() => Ok(()),
            Ok(RpcBody::UpdateLocalConfigurationResult { err }) => Err(RpcError::Remote(err)),
            Ok(_) => Err(RpcError::UnexpectedResponse {
                method: "updateLocalConfiguration",
            }),
            Err(e) => Err(e),
        };

        if let Err(e) = &result {
            warn!("Failed to push local configuration: {}", e);
        }
        result
    }

    pub fn is_closed(&self) -> bool {
        self.session.is_closed()
    }

    /// Resolves once the control stream can no longer carry calls
    pub async fn closed(&self) {
        self.session.closed().await
    }

    pub async fn close(&self) {
        self.session.close().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_auth_failure_classification() {
        let auth = RegistrationError::Permanent {
            cause: "Unauthorized: invalid tunnel credentials".to_string(),
        };
        assert!(auth.is_auth_failure());
        assert!(!auth.is_retryable());

        let duplicate = RegistrationError::Permanent {
            cause: "duplicate connection".to_string(),
        };
        assert!(!duplicate.is_auth_failure());

        let retryable = RegistrationError::Retryable {
            cause: "authentication backend unavailable".to_string(),
            retry_after: None,
        };
        assert!(!retryable.is_auth_failure());
        assert!(retryable.is_retryable());

        assert!(RegistrationError::Rpc(RpcError::SessionClosed).is_retryable());
    }
}
