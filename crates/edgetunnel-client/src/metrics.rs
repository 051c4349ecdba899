//! Metrics sink
//!
//! Emission is not implemented; the sink is passed explicitly so a real
//! exporter can be plugged in without process-wide state.

use edgetunnel_proto::Protocol;

pub trait MetricsSink: Send + Sync {
    /// Number of slots currently Serving
    fn set_ha_connections(&self, count: usize);

    /// Version of the applied remote configuration
    fn set_config_version(&self, version: i32);

    /// A registration attempt was made on `conn_index` over `protocol`
    fn registration_attempt(&self, conn_index: u8, protocol: Protocol);
}

/// Sink that drops everything
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopMetrics;

impl MetricsSink for NoopMetrics {
    fn set_ha_connections(&self, _count: usize) {}

    fn set_config_version(&self, _version: i32) {}

    fn registration_attempt(&self, _conn_index: u8, _protocol: Protocol) {}
}
