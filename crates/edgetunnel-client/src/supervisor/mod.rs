//! HA connection supervision
//!
//! The supervisor runs one task per slot and owns the shutdown sequence:
//! cancelling the caller's token stops slots at their next checkpoint (serving
//! slots unregister first); once the grace period runs out the force token
//! interrupts whatever is still in flight.

mod slot;

#[cfg(test)]
mod tests;

pub use slot::{SlotError, SlotExit, SlotState, SlotStatus};

use edgetunnel_proto::{ConnectionOptions, TunnelAuth};
use rand::Rng;
use std::sync::atomic::AtomicUsize;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinSet;
use tokio::time::{sleep_until, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::config::SupervisorConfig;
use crate::dialer::EdgeDialer;
use crate::edge_discovery::EdgeDiscovery;
use crate::metrics::MetricsSink;
use crate::orchestrator::Orchestrator;
use crate::protocol_selector::ProtocolSelector;
use crate::signal::{
    reconnect_queue, ConnectedSignal, ConnectedWaiter, ReconnectSender, ReconnectSignal,
};
use crate::tunnels_for_ha::TunnelsForHA;
use slot::{Slot, SlotShared};

/// Supervisor errors
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SupervisorError {
    #[error("Authentication failed: {0}")]
    AuthenticationFailed(String),

    #[error("All {count} connections failed, first error: {first}")]
    AllConnectionsFailed { count: u8, first: String },

    #[error("Invalid supervisor configuration: {0}")]
    InvalidConfig(String),

    #[error("Connection task failed: {0}")]
    TaskFailed(String),
}

/// Collaborators the supervisor runs with
pub struct SupervisorParams {
    pub config: SupervisorConfig,
    pub auth: TunnelAuth,
    pub tunnel_id: Uuid,
    /// Sent with every registration; the attempt counter is filled per slot
    pub options: ConnectionOptions,
    pub discovery: Arc<EdgeDiscovery>,
    pub selector: Arc<ProtocolSelector>,
    pub dialer: Arc<dyn EdgeDialer>,
    pub orchestrator: Arc<Orchestrator>,
    pub metrics: Arc<dyn MetricsSink>,
}

pub struct Supervisor {
    shared: Arc<SlotShared>,
    status_txs: Vec<watch::Sender<SlotStatus>>,
    statuses: Vec<watch::Receiver<SlotStatus>>,
    reconnect_tx: ReconnectSender,
    reconnect_rx: mpsc::Receiver<ReconnectSignal>,
}

impl Supervisor {
    pub fn new(params: SupervisorParams) -> Result<Self, SupervisorError> {
        params
            .config
            .validate()
            .map_err(SupervisorError::InvalidConfig)?;

        let (status_txs, statuses): (Vec<_>, Vec<_>) = (0..params.config.ha_connections)
            .map(|_| watch::channel(SlotStatus::default()))
            .unzip();
        let (reconnect_tx, reconnect_rx) = reconnect_queue(params.config.reconnect_queue_capacity);

        let shared = Arc::new(SlotShared {
            config: params.config,
            auth: params.auth,
            tunnel_id: params.tunnel_id,
            options: params.options,
            discovery: params.discovery,
            selector: params.selector,
            dialer: params.dialer,
            orchestrator: params.orchestrator,
            metrics: params.metrics,
            tunnels: Arc::new(TunnelsForHA::new()),
            connected: ConnectedSignal::new(),
            serving: AtomicUsize::new(0),
        });

        Ok(Self {
            shared,
            status_txs,
            statuses,
            reconnect_tx,
            reconnect_rx,
        })
    }

    /// Queue for asking slots to reconnect
    pub fn reconnect_sender(&self) -> ReconnectSender {
        self.reconnect_tx.clone()
    }

    /// Fires once, when the first slot reaches Serving
    pub fn connected_signal(&self) -> ConnectedWaiter {
        self.shared.connected.subscribe()
    }

    pub fn tunnels_for_ha(&self) -> Arc<TunnelsForHA> {
        self.shared.tunnels.clone()
    }

    /// One status receiver per slot, by index
    pub fn slot_statuses(&self) -> Vec<watch::Receiver<SlotStatus>> {
        self.statuses.clone()
    }

    /// Run all slots until `shutdown` is cancelled or the tunnel cannot continue
    ///
    /// Returns `Ok` after a requested shutdown, otherwise the first terminal
    /// error.
    pub async fn run(self, shutdown: CancellationToken) -> Result<(), SupervisorError> {
        let Supervisor {
            shared,
            status_txs,
            statuses,
            reconnect_tx: _reconnect_tx,
            mut reconnect_rx,
        } = self;

        let graceful = shutdown.child_token();
        let force = CancellationToken::new();
        let count = status_txs.len();

        let mut slots = JoinSet::new();
        let mut slot_reconnects = Vec::with_capacity(count);
        for (index, status_tx) in status_txs.into_iter().enumerate() {
            let (tx, rx) = mpsc::channel(1);
            slot_reconnects.push(tx);

            let index = index as u8;
            let slot = Slot::new(
                index,
                shared.clone(),
                status_tx,
                rx,
                graceful.clone(),
                force.clone(),
            );
            slots.spawn(slot.run().instrument(info_span!("slot", conn_index = index)));
        }
        info!("Started {} tunnel connections", count);

        let mut first_error: Option<SupervisorError> = None;
        let mut first_fatal: Option<String> = None;
        let mut force_at: Option<Instant> = None;

        loop {
            let force_timer = async move {
                match force_at {
                    Some(deadline) => sleep_until(deadline).await,
                    None => std::future::pending().await,
                }
            };

            tokio::select! {
                joined = slots.join_next() => match joined {
                    None => break,
                    Some(Ok(SlotExit::Shutdown)) => {}
                    Some(Ok(SlotExit::Fatal(e))) if e.is_auth_failure() => {
                        error!("Stopping tunnel: {}", e);
                        first_error.get_or_insert(SupervisorError::AuthenticationFailed(e.to_string()));
                        graceful.cancel();
                    }
                    Some(Ok(SlotExit::Fatal(e))) => {
                        first_fatal.get_or_insert(e.to_string());
                    }
                    Some(Err(e)) => {
                        error!("Connection task failed: {}", e);
                        first_error.get_or_insert(SupervisorError::TaskFailed(e.to_string()));
                        graceful.cancel();
                    }
                },
                Some(signal) = reconnect_rx.recv(), if !graceful.is_cancelled() => {
                    route_reconnect(signal, &slot_reconnects);
                }
                _ = graceful.cancelled(), if force_at.is_none() => {
                    let grace = shared.config.grace_period;
                    info!("Shutting down connections, grace period {:?}", grace);
                    if grace.is_zero() {
                        force.cancel();
                    }
                    force_at = Some(Instant::now() + grace);
                }
                _ = force_timer, if !force.is_cancelled() => {
                    warn!("Grace period elapsed, forcing shutdown");
                    force.cancel();
                }
            }
        }

        if let Some(e) = first_error {
            return Err(e);
        }

        let all_fatal = statuses
            .iter()
            .all(|status| status.borrow().state == SlotState::Fatal);
        if all_fatal {
            return Err(SupervisorError::AllConnectionsFailed {
                count: count as u8,
                first: first_fatal.unwrap_or_default(),
            });
        }

        info!("All tunnel connections stopped");
        Ok(())
    }
}

fn route_reconnect(signal: ReconnectSignal, slots: &[mpsc::Sender<ReconnectSignal>]) {
    let index = match signal.conn_index {
        Some(index) => index as usize,
        None => rand::thread_rng().gen_range(0..slots.len()),
    };
    let Some(slot) = slots.get(index) else {
        warn!("Ignoring reconnect for unknown connection {}", index);
        return;
    };
    match slot.try_send(signal) {
        Ok(()) => debug!("Reconnect routed to connection {}", index),
        Err(_) => warn!("Connection {} already has a pending reconnect", index),
    }
}
