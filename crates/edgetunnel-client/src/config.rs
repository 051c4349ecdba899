//! Supervisor configuration

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::backoff::BackoffConfig;
use crate::edge_discovery::EdgeIpVersion;

/// Connection supervision settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SupervisorConfig {
    /// Number of HA connections to maintain
    pub ha_connections: u8,
    /// Retry budget per slot, reset whenever the slot reaches Serving
    pub retries: u32,
    /// Consecutive dial failures on one protocol before falling back
    pub max_edge_addr_retries: u8,
    /// How long in-flight work may drain after shutdown is requested
    #[serde(with = "duration_secs")]
    pub grace_period: Duration,
    /// Transport dial + control stream handshake budget
    #[serde(with = "duration_secs")]
    pub dial_timeout: Duration,
    /// Budget for every RPC round-trip
    #[serde(with = "duration_secs")]
    pub rpc_timeout: Duration,
    /// Budget for the best-effort unregister on shutdown
    #[serde(with = "duration_secs")]
    pub unregister_timeout: Duration,
    /// Edge region; `None` uses the global region
    pub region: Option<String>,
    pub edge_ip_version: EdgeIpVersion,
    /// Capacity of the shared reconnect queue
    pub reconnect_queue_capacity: usize,
    pub backoff: BackoffConfig,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            ha_connections: 4,
            retries: 5,
            max_edge_addr_retries: 8,
            grace_period: Duration::from_secs(30),
            dial_timeout: Duration::from_secs(15),
            rpc_timeout: Duration::from_secs(5),
            unregister_timeout: Duration::from_secs(5),
            region: None,
            edge_ip_version: EdgeIpVersion::Auto,
            reconnect_queue_capacity: 16,
            backoff: BackoffConfig::default(),
        }
    }
}

impl SupervisorConfig {
    pub fn with_ha_connections(mut self, count: u8) -> Self {
        self.ha_connections = count;
        self
    }

    pub fn with_retries(mut self, retries: u32) -> Self {
        self.retries = retries;
        self
    }

    pub fn with_grace_period(mut self, grace_period: Duration) -> Self {
        self.grace_period = grace_period;
        self
    }

    pub fn with_region(mut self, region: Option<String>) -> Self {
        self.region = region;
        self
    }

    pub fn with_edge_ip_version(mut self, version: EdgeIpVersion) -> Self {
        self.edge_ip_version = version;
        self
    }

    pub fn with_backoff(mut self, backoff: BackoffConfig) -> Self {
        self.backoff = backoff;
        self
    }

    /// Check the settings before starting any slot
    pub fn validate(&self) -> Result<(), String> {
        if self.ha_connections == 0 {
            return Err("ha_connections must be at least 1".to_string());
        }
        if self.max_edge_addr_retries == 0 {
            return Err("max_edge_addr_retries must be at least 1".to_string());
        }
        if self.dial_timeout.is_zero() || self.rpc_timeout.is_zero() {
            return Err("dial and rpc timeouts must be > 0".to_string());
        }
        if self.backoff.multiplier < 1.0 {
            return Err("backoff multiplier must be >= 1".to_string());
        }
        Ok(())
    }
}

/// Helper module for serializing Duration as seconds
pub(crate) mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_secs())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs = u64::deserialize(deserializer)?;
        Ok(Duration::from_secs(secs))
    }
}
