//! One HA connection slot
//!
//! A slot owns at most one transport at a time and walks
//! `Idle -> Resolving -> Dialing -> Negotiating -> Registering -> Serving ->
//! Disconnecting -> Idle` until shutdown, or ends in `Fatal`.

use edgetunnel_proto::{ConnectionDetails, ConnectionOptions, Protocol, TunnelAuth};
use edgetunnel_transport::{ControlStream, TransportConnection, TransportError, TransportResult};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::backoff::{BackoffError, BackoffHandler};
use crate::config::SupervisorConfig;
use crate::dialer::EdgeDialer;
use crate::edge_discovery::{AddrCursor, CursorStep, EdgeDiscovery, EdgeError};
use crate::metrics::MetricsSink;
use crate::orchestrator::Orchestrator;
use crate::protocol_selector::{ProtocolExhausted, ProtocolFallback, ProtocolSelector};
use crate::registration::{RegistrationClient, RegistrationError};
use crate::signal::{ConnectedSignal, ReconnectSignal};
use crate::tunnels_for_ha::TunnelsForHA;

/// Lifecycle state of a slot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SlotState {
    #[default]
    Idle,
    Resolving,
    Dialing,
    Negotiating,
    Registering,
    Serving,
    Disconnecting,
    Fatal,
}

/// Read-only view of a slot, published on every state change
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SlotStatus {
    pub state: SlotState,
    pub protocol: Option<Protocol>,
    /// Retries consumed since the slot last reached Serving
    pub retries: u32,
    /// Connection ID assigned by the edge while registered
    pub tunnel_id: Option<Uuid>,
}

/// Why a slot gave up
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SlotError {
    #[error("Edge discovery failed: {0}")]
    Discovery(EdgeError),

    #[error(transparent)]
    ProtocolExhausted(#[from] ProtocolExhausted),

    #[error(transparent)]
    Registration(RegistrationError),

    #[error("Retry budget exhausted, last error: {last}")]
    RetriesExhausted { last: String },
}

impl SlotError {
    pub fn is_auth_failure(&self) -> bool {
        matches!(self, SlotError::Registration(e) if e.is_auth_failure())
    }
}

/// How a slot task ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SlotExit {
    Shutdown,
    Fatal(SlotError),
}

/// Everything slots share, read-only or internally synchronized
pub(crate) struct SlotShared {
    pub config: SupervisorConfig,
    pub auth: TunnelAuth,
    pub tunnel_id: Uuid,
    pub options: ConnectionOptions,
    pub discovery: Arc<EdgeDiscovery>,
    pub selector: Arc<ProtocolSelector>,
    pub dialer: Arc<dyn EdgeDialer>,
    pub orchestrator: Arc<Orchestrator>,
    pub metrics: Arc<dyn MetricsSink>,
    pub tunnels: Arc<TunnelsForHA>,
    pub connected: ConnectedSignal,
    pub serving: AtomicUsize,
}

enum ServeEnd {
    Lost(TransportError),
    Reconnect(Duration),
    Shutdown,
}

pub(crate) struct Slot {
    index: u8,
    shared: Arc<SlotShared>,
    status: watch::Sender<SlotStatus>,
    reconnects: mpsc::Receiver<ReconnectSignal>,
    graceful: CancellationToken,
    force: CancellationToken,
    backoff: BackoffHandler,
    previous_attempts: u8,
}

impl Slot {
    pub(crate) fn new(
        index: u8,
        shared: Arc<SlotShared>,
        status: watch::Sender<SlotStatus>,
        reconnects: mpsc::Receiver<ReconnectSignal>,
        graceful: CancellationToken,
        force: CancellationToken,
    ) -> Self {
        let backoff = BackoffHandler::new(shared.config.backoff.clone(), shared.config.retries);
        Self {
            index,
            shared,
            status,
            reconnects,
            graceful,
            force,
            backoff,
            previous_attempts: 0,
        }
    }

    pub(crate) async fn run(mut self) -> SlotExit {
        let mut fallback = tokio::select! {
            f = ProtocolFallback::new(self.shared.selector.clone()) => f,
            _ = self.graceful.cancelled() => return SlotExit::Shutdown,
        };
        let mut cursor: Option<AddrCursor> = None;
        let mut dial_failures: u32 = 0;

        loop {
            self.set_state(SlotState::Idle);
            if self.graceful.is_cancelled() {
                return SlotExit::Shutdown;
            }

            // Resolving
            self.set_state(SlotState::Resolving);
            let config = &self.shared.config;
            let resolved = tokio::select! {
                r = self.shared.discovery.resolve_edge(config.region.as_deref(), config.edge_ip_version) => r,
                _ = self.graceful.cancelled() => return SlotExit::Shutdown,
            };
            let addrs = match resolved {
                Ok(addrs) => addrs,
                Err(e) => {
                    warn!("Failed to resolve edge addresses: {}", e);
                    match self.backoff.wait(&self.graceful).await {
                        Ok(()) => continue,
                        Err(BackoffError::Cancelled) => return SlotExit::Shutdown,
                        Err(BackoffError::MaxAttemptsReached(_)) => {
                            return self.fatal(SlotError::Discovery(e))
                        }
                    }
                }
            };

            let max_failures = self.shared.config.max_edge_addr_retries;
            let addr_cursor = match cursor.take() {
                Some(c) if c.len() == addrs.len() => cursor.insert(c),
                _ => cursor.insert(AddrCursor::new(self.index, addrs.len(), max_failures)),
            };
            let addr = addrs[addr_cursor.position() % addrs.len()].addr;
            let protocol = fallback.current();

            // Dialing + Negotiating
            self.set_protocol(protocol);
            let dialed = tokio::select! {
                r = tokio::time::timeout(self.shared.config.dial_timeout, self.connect(protocol, addr)) => {
                    r.map_err(|_| TransportError::Timeout).and_then(|r| r)
                }
                _ = self.graceful.cancelled() => return SlotExit::Shutdown,
            };
            let (connection, stream) = match dialed {
                Ok(pair) => pair,
                Err(e) => {
                    dial_failures += 1;
                    warn!(%protocol, edge_addr = %addr, "Failed to dial edge: {}", e);

                    if addr_cursor.record_failure() == CursorStep::Fallback {
                        match fallback.fallback() {
                            Ok(next) => info!("Switching from {} to {}", protocol, next),
                            Err(exhausted) => return self.fatal(exhausted.into()),
                        }
                    }

                    let delay = self.backoff.config().delay_for(dial_failures);
                    if !self.sleep(delay).await {
                        return SlotExit::Shutdown;
                    }
                    continue;
                }
            };
            dial_failures = 0;
            addr_cursor.record_success();

            // Registering
            self.set_state(SlotState::Registering);
            let client = RegistrationClient::new(
                stream,
                self.shared.orchestrator.clone(),
                self.shared.config.rpc_timeout,
            );
            let options = ConnectionOptions {
                num_previous_attempts: self.previous_attempts,
                ..self.shared.options.clone()
            };
            self.shared.metrics.registration_attempt(self.index, protocol);

            let registered = tokio::select! {
                r = client.register_connection(&self.shared.auth, self.shared.tunnel_id, self.index, &options) => r,
                _ = self.force.cancelled() => {
                    client.close().await;
                    connection.close(0, "shutdown").await;
                    return SlotExit::Shutdown;
                }
            };
            self.previous_attempts = self.previous_attempts.saturating_add(1);

            let details = match registered {
                Ok(details) => details,
                Err(e) => {
                    client.close().await;
                    connection.close(0, "registration failed").await;

                    if !e.is_retryable() {
                        error!(%protocol, "Registration rejected: {}", e);
                        return self.fatal(SlotError::Registration(e));
                    }

                    let retry_after = match &e {
                        RegistrationError::Retryable { retry_after, .. } => *retry_after,
                        _ => None,
                    };
                    warn!(%protocol, "Registration failed: {}", e);
                    match self.backoff.wait_at_least(retry_after, &self.graceful).await {
                        Ok(()) => continue,
                        Err(BackoffError::Cancelled) => return SlotExit::Shutdown,
                        Err(BackoffError::MaxAttemptsReached(_)) => {
                            return self.fatal(SlotError::RetriesExhausted {
                                last: e.to_string(),
                            })
                        }
                    }
                }
            };

            // Serving
            self.enter_serving(&details, protocol);
            tokio::select! {
                _ = fallback.reset() => {}
                _ = self.graceful.cancelled() => {}
            }
            if self.index == 0 && !details.tunnel_is_remotely_managed {
                self.push_local_config(&client).await;
            }

            let end = tokio::select! {
                reason = connection.closed() => ServeEnd::Lost(reason),
                _ = client.closed() => {
                    ServeEnd::Lost(TransportError::ConnectionClosed("control stream ended".to_string()))
                }
                Some(signal) = self.reconnects.recv() => ServeEnd::Reconnect(signal.delay),
                _ = self.graceful.cancelled() => ServeEnd::Shutdown,
            };

            // Disconnecting
            self.set_state(SlotState::Disconnecting);
            self.leave_serving();

            match end {
                ServeEnd::Shutdown => {
                    if !self.force.is_cancelled() {
                        tokio::select! {
                            _ = client.unregister_connection(self.shared.config.unregister_timeout) => {}
                            _ = self.force.cancelled() => debug!("Unregister cut short by forced shutdown"),
                        }
                    }
                    client.close().await;
                    connection.close(0, "shutdown").await;
                    info!("Connection unregistered");
                    return SlotExit::Shutdown;
                }
                ServeEnd::Reconnect(delay) => {
                    info!("Reconnecting in {:?} on request", delay);
                    client.close().await;
                    connection.close(0, "reconnect requested").await;
                    if !self.sleep(delay).await {
                        return SlotExit::Shutdown;
                    }
                }
                ServeEnd::Lost(reason) => {
                    warn!(%protocol, "Connection to edge lost: {}", reason);
                    client.close().await;
                    connection.close(0, "connection lost").await;
                    match self.backoff.wait(&self.graceful).await {
                        Ok(()) => {}
                        Err(BackoffError::Cancelled) => return SlotExit::Shutdown,
                        Err(BackoffError::MaxAttemptsReached(_)) => {
                            return self.fatal(SlotError::RetriesExhausted {
                                last: reason.to_string(),
                            })
                        }
                    }
                }
            }
        }
    }

    async fn connect(
        &self,
        protocol: Protocol,
        addr: SocketAddr,
    ) -> TransportResult<(Box<dyn TransportConnection>, ControlStream)> {
        self.set_state(SlotState::Dialing);
        let connection = self.shared.dialer.dial(protocol, addr).await?;

        self.set_state(SlotState::Negotiating);
        match connection.open_control_stream().await {
            Ok(stream) => {
                debug!(
                    edge_addr = %addr,
                    connection = %connection.connection_id(),
                    "Control stream {} open",
                    stream.stream_id
                );
                Ok((connection, stream))
            }
            Err(e) => {
                connection.close(0, "control stream failed").await;
                Err(e)
            }
        }
    }

    async fn push_local_config(&self, client: &RegistrationClient) {
        let config = match self.shared.orchestrator.local_config_json() {
            Ok(config) => config,
            Err(e) => {
                warn!("Failed to serialize local configuration: {}", e);
                return;
            }
        };
        tokio::select! {
            // Failures are logged by the client
            _ = client.update_local_configuration(config) => {}
            _ = self.force.cancelled() => {}
        }
    }

    fn enter_serving(&mut self, details: &ConnectionDetails, protocol: Protocol) {
        let connection_id = details.uuid();
        self.shared.tunnels.add_tunnel_id(self.index, connection_id);

        self.backoff.reset();
        self.previous_attempts = 0;
        self.status.send_modify(|status| {
            status.state = SlotState::Serving;
            status.protocol = Some(protocol);
            status.retries = 0;
            status.tunnel_id = Some(connection_id);
        });

        let serving = self.shared.serving.fetch_add(1, Ordering::SeqCst) + 1;
        self.shared.metrics.set_ha_connections(serving);

        info!(
            %protocol,
            connection_id = %connection_id,
            location = %details.location_name,
            "Connection registered"
        );
        self.shared.connected.notify();
    }

    fn leave_serving(&self) {
        let serving = self.shared.serving.fetch_sub(1, Ordering::SeqCst).saturating_sub(1);
        self.shared.metrics.set_ha_connections(serving);
    }

    /// Sleep unless shutdown starts first; false when interrupted
    async fn sleep(&self, delay: Duration) -> bool {
        tokio::select! {
            _ = tokio::time::sleep(delay) => true,
            _ = self.graceful.cancelled() => false,
        }
    }

    fn set_state(&self, state: SlotState) {
        let retries = self.backoff.retries();
        self.status.send_modify(|status| {
            status.state = state;
            status.retries = retries;
            if state != SlotState::Serving && state != SlotState::Disconnecting {
                status.tunnel_id = None;
            }
        });
    }

    fn set_protocol(&self, protocol: Protocol) {
        self.status.send_modify(|status| status.protocol = Some(protocol));
    }

    fn fatal(&self, error: SlotError) -> SlotExit {
        error!("Connection failed permanently: {}", error);
        self.set_state(SlotState::Fatal);
        SlotExit::Fatal(error)
    }
}
