//! Versioned configuration for the proxy layer
//!
//! The orchestrator owns the current ingress snapshot. Updates arrive as raw
//! JSON with a version number over any slot's RPC session; only strictly newer
//! versions that validate are applied, and readers always see a whole
//! snapshot.

use async_trait::async_trait;
use edgetunnel_proto::UpdateConfigurationResponse;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::{watch, Mutex};
use tracing::{debug, info, warn};

use crate::ingress::{
    Ingress, IngressError, OriginRequestConfig, UnvalidatedConfig, WarpRoutingConfig,
};
use crate::metrics::MetricsSink;
use crate::registration::ConfigurationManager;

/// Version of the configuration loaded locally, before any remote push
pub const LOCAL_CONFIG_VERSION: i32 = -1;

/// One applied configuration
#[derive(Debug, Clone, PartialEq)]
pub struct Snapshot {
    pub version: i32,
    pub ingress: Ingress,
    pub warp_routing: WarpRoutingConfig,
    pub origin_request: OriginRequestConfig,
}

impl Snapshot {
    fn build(version: i32, config: &UnvalidatedConfig) -> Result<Self, IngressError> {
        Ok(Self {
            version,
            ingress: Ingress::parse(&config.ingress, &config.origin_request)?,
            warp_routing: config.warp_routing.clone(),
            origin_request: config.origin_request.clone(),
        })
    }
}

/// Feature flags reported alongside the local configuration
pub type ConfigurationFlags = BTreeMap<String, String>;

#[derive(Serialize)]
struct LocalConfigReport<'a> {
    config: &'a UnvalidatedConfig,
    #[serde(rename = "__configuration_flags")]
    flags: &'a ConfigurationFlags,
}

pub struct Orchestrator {
    local: UnvalidatedConfig,
    flags: ConfigurationFlags,
    tx: watch::Sender<Arc<Snapshot>>,
    update_lock: Mutex<()>,
    metrics: Arc<dyn MetricsSink>,
}

impl std::fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator")
            .field("version", &self.current_version())
            .finish()
    }
}

impl Orchestrator {
    /// Start from the locally loaded configuration at version -1
    pub fn new(
        local: UnvalidatedConfig,
        flags: ConfigurationFlags,
        metrics: Arc<dyn MetricsSink>,
    ) -> Result<Self, IngressError> {
        let snapshot = Snapshot::build(LOCAL_CONFIG_VERSION, &local)?;
        let (tx, _) = watch::channel(Arc::new(snapshot));
        Ok(Self {
            local,
            flags,
            tx,
            update_lock: Mutex::new(()),
            metrics,
        })
    }

    /// Apply a configuration pushed by the edge
    pub async fn update_config(&self, version: i32, raw: &[u8]) -> UpdateConfigurationResponse {
        let _guard = self.update_lock.lock().await;
        let current = self.current_version();

        if version <= current {
            debug!(
                "Ignoring configuration version {}, already at {}",
                version, current
            );
            return UpdateConfigurationResponse::applied(current);
        }

        let snapshot = match UnvalidatedConfig::from_json(raw)
            .and_then(|config| Snapshot::build(version, &config))
        {
            Ok(snapshot) => snapshot,
            Err(e) => {
                warn!("Rejected configuration version {}: {}", version, e);
                return UpdateConfigurationResponse::rejected(current, e);
            }
        };

        let rules = snapshot.ingress.user_rules().len();
        self.tx.send_replace(Arc::new(snapshot));
        self.metrics.set_config_version(version);
        info!(
            "Updated to configuration version {} ({} ingress rules)",
            version, rules
        );
        UpdateConfigurationResponse::applied(version)
    }

    /// Current configuration
    pub fn snapshot(&self) -> Arc<Snapshot> {
        self.tx.borrow().clone()
    }

    /// Receive every configuration change
    pub fn subscribe(&self) -> watch::Receiver<Arc<Snapshot>> {
        self.tx.subscribe()
    }

    pub fn current_version(&self) -> i32 {
        self.tx.borrow().version
    }

    /// Local configuration as pushed with `UpdateLocalConfiguration`
    pub fn local_config_json(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(&LocalConfigReport {
            config: &self.local,
            flags: &self.flags,
        })
    }
}

#[async_trait]
impl ConfigurationManager for Orchestrator {
    async fn update_configuration(&self, version: i32, config: &[u8]) -> UpdateConfigurationResponse {
        self.update_config(version, config).await
    }
}
