//! HA tunnel connection supervision
//!
//! Keeps a fleet of registered connections between this node and the edge:
//! each slot resolves an edge address, dials it over the selected transport,
//! registers over the control stream, and serves until the connection fails
//! or the tunnel shuts down. Configuration pushed by the edge lands in the
//! [`Orchestrator`], which the proxy layer reads.
//!
//! # Example
//!
//! ```ignore
//! let supervisor = Supervisor::new(params)?;
//! let mut connected = supervisor.connected_signal();
//! let shutdown = CancellationToken::new();
//!
//! tokio::spawn(async move { connected.wait().await; });
//! supervisor.run(shutdown).await?;
//! ```

pub mod backoff;
pub mod config;
pub mod credentials;
pub mod dialer;
pub mod edge_discovery;
pub mod identity;
pub mod ingress;
pub mod metrics;
pub mod orchestrator;
pub mod pending;
pub mod protocol_selector;
pub mod registration;
pub mod signal;
pub mod supervisor;
pub mod tunnels_for_ha;

pub use backoff::{BackoffConfig, BackoffError, BackoffHandler};
pub use config::SupervisorConfig;
pub use credentials::{CredentialsError, TunnelToken};
pub use dialer::{EdgeDialer, TransportDialer};
pub use edge_discovery::{
    AddrCursor, DnsResolver, EdgeAddr, EdgeDiscovery, EdgeError, EdgeIpVersion, EdgeResolver,
    StaticResolver,
};
pub use ingress::{Ingress, IngressError, IngressRule, IngressService, UnvalidatedConfig};
pub use metrics::{MetricsSink, NoopMetrics};
pub use orchestrator::{ConfigurationFlags, Orchestrator, Snapshot};
pub use protocol_selector::{
    PercentageFetcher, ProtocolChoice, ProtocolExhausted, ProtocolFallback, ProtocolPercent,
    ProtocolSelector, StaticPercentages,
};
pub use registration::{
    ConfigurationManager, RegistrationClient, RegistrationError, RpcError, RpcSession,
};
pub use signal::{ConnectedSignal, ConnectedWaiter, ReconnectSender, ReconnectSignal};
pub use supervisor::{
    SlotError, SlotExit, SlotState, SlotStatus, Supervisor, SupervisorError, SupervisorParams,
};
pub use tunnels_for_ha::TunnelsForHA;

// Re-export for convenience
pub use edgetunnel_proto::{ConnectionOptions, Protocol, TunnelAuth};
