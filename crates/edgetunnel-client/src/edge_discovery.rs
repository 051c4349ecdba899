//! Edge address discovery
//!
//! Resolves the set of edge addresses a slot may dial, caches the last good
//! answer, and hands each slot an [`AddrCursor`] that spreads slots over the
//! address list and tells the slot when to ask for protocol fallback.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::SocketAddr;
use std::sync::{Arc, RwLock};
use thiserror::Error;
use tracing::{debug, warn};

/// Default SRV-style domain the edge publishes its addresses under
pub const DEFAULT_EDGE_DOMAIN: &str = "edge.edgetunnel.net";

/// Default edge port
pub const DEFAULT_EDGE_PORT: u16 = 7844;

/// Which address families to dial
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum EdgeIpVersion {
    V4,
    V6,
    /// IPv4 first, then IPv6
    #[default]
    Auto,
}

impl EdgeIpVersion {
    fn accepts(&self, addr: &SocketAddr) -> bool {
        match self {
            EdgeIpVersion::V4 => addr.is_ipv4(),
            EdgeIpVersion::V6 => addr.is_ipv6(),
            EdgeIpVersion::Auto => true,
        }
    }
}

impl fmt::Display for EdgeIpVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            EdgeIpVersion::V4 => "4",
            EdgeIpVersion::V6 => "6",
            EdgeIpVersion::Auto => "auto",
        })
    }
}

impl std::str::FromStr for EdgeIpVersion {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "4" | "v4" => Ok(EdgeIpVersion::V4),
            "6" | "v6" => Ok(EdgeIpVersion::V6),
            "auto" => Ok(EdgeIpVersion::Auto),
            _ => Err(format!("Invalid edge IP version: {} (expected 4, 6 or auto)", s)),
        }
    }
}

/// One dialable edge address
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EdgeAddr {
    pub addr: SocketAddr,
}

impl EdgeAddr {
    pub fn new(addr: SocketAddr) -> Self {
        Self { addr }
    }

    pub fn ip_version(&self) -> EdgeIpVersion {
        if self.addr.is_ipv4() {
            EdgeIpVersion::V4
        } else {
            EdgeIpVersion::V6
        }
    }
}

impl fmt::Display for EdgeAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.addr.fmt(f)
    }
}

/// Edge discovery errors
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum EdgeError {
    #[error("Failed to resolve edge addresses: {0}")]
    Resolution(String),

    #[error("No edge addresses found for IP version {0}")]
    NoAddressesFound(EdgeIpVersion),
}

/// Source of edge addresses
#[async_trait]
pub trait EdgeResolver: Send + Sync {
    async fn resolve(&self, region: Option<&str>) -> Result<Vec<SocketAddr>, EdgeError>;
}

/// Resolves `region1.<domain>` and `region2.<domain>` through the system resolver
#[derive(Debug, Clone)]
pub struct DnsResolver {
    domain: String,
    port: u16,
}

impl DnsResolver {
    pub fn new(domain: impl Into<String>, port: u16) -> Self {
        Self {
            domain: domain.into(),
            port,
        }
    }

    fn hostnames(&self, region: Option<&str>) -> Vec<String> {
        let prefix = region.map(|r| format!("{}-", r)).unwrap_or_default();
        (1..=2)
            .map(|n| format!("{}region{}.{}", prefix, n, self.domain))
            .collect()
    }
}

impl Default for DnsResolver {
    fn default() -> Self {
        Self::new(DEFAULT_EDGE_DOMAIN, DEFAULT_EDGE_PORT)
    }
}

#[async_trait]
impl EdgeResolver for DnsResolver {
    async fn resolve(&self, region: Option<&str>) -> Result<Vec<SocketAddr>, EdgeError> {
        let mut addrs = Vec::new();
        let mut last_error = None;

        for host in self.hostnames(region) {
            match tokio::net::lookup_host((host.as_str(), self.port)).await {
                Ok(found) => {
                    for addr in found {
                        if !addrs.contains(&addr) {
                            addrs.push(addr);
                        }
                    }
                }
                Err(e) => {
                    debug!("Lookup of {} failed: {}", host, e);
                    last_error = Some(format!("{}: {}", host, e));
                }
            }
        }

        if addrs.is_empty() {
            if let Some(e) = last_error {
                return Err(EdgeError::Resolution(e));
            }
        }
        Ok(addrs)
    }
}

/// Fixed address list (from `--edge` flags)
#[derive(Debug, Clone)]
pub struct StaticResolver {
    addrs: Vec<SocketAddr>,
}

impl StaticResolver {
    pub fn new(addrs: Vec<SocketAddr>) -> Self {
        Self { addrs }
    }
}

#[async_trait]
impl EdgeResolver for StaticResolver {
    async fn resolve(&self, _region: Option<&str>) -> Result<Vec<SocketAddr>, EdgeError> {
        Ok(self.addrs.clone())
    }
}

/// Cached edge address discovery
pub struct EdgeDiscovery {
    resolver: Arc<dyn EdgeResolver>,
    cache: RwLock<Vec<EdgeAddr>>,
}

impl fmt::Debug for EdgeDiscovery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EdgeDiscovery")
            .field("cached", &self.cached().len())
            .finish()
    }
}

impl EdgeDiscovery {
    pub fn new(resolver: Arc<dyn EdgeResolver>) -> Self {
        Self {
            resolver,
            cache: RwLock::new(Vec::new()),
        }
    }

    /// Resolve edge addresses for the requested family
    ///
    /// A successful lookup refreshes the cache; a failed one falls back to the
    /// cache when it holds anything.
    pub async fn resolve_edge(
        &self,
        region: Option<&str>,
        ip_version: EdgeIpVersion,
    ) -> Result<Vec<EdgeAddr>, EdgeError> {
        let all = match self.resolver.resolve(region).await {
            Ok(found) if !found.is_empty() => {
                let addrs: Vec<EdgeAddr> = found.into_iter().map(EdgeAddr::new).collect();
                if let Ok(mut cache) = self.cache.write() {
                    *cache = addrs.clone();
                }
                addrs
            }
            Ok(_) => Vec::new(),
            Err(e) => {
                let cached = self.cached();
                if cached.is_empty() {
                    return Err(e);
                }
                warn!("Edge resolution failed, using {} cached addresses: {}", cached.len(), e);
                cached
            }
        };

        let selected = select_family(&all, ip_version);
        if selected.is_empty() {
            return Err(EdgeError::NoAddressesFound(ip_version));
        }
        Ok(selected)
    }

    /// One address for a side-channel RPC client
    pub async fn get_addr_for_rpc(&self) -> Result<EdgeAddr, EdgeError> {
        if let Some(addr) = self.cached().first() {
            return Ok(*addr);
        }
        let addrs = self.resolve_edge(None, EdgeIpVersion::Auto).await?;
        addrs
            .first()
            .copied()
            .ok_or(EdgeError::NoAddressesFound(EdgeIpVersion::Auto))
    }

    /// Addresses from the last successful lookup
    pub fn cached(&self) -> Vec<EdgeAddr> {
        self.cache.read().map(|c| c.clone()).unwrap_or_default()
    }
}

fn select_family(addrs: &[EdgeAddr], ip_version: EdgeIpVersion) -> Vec<EdgeAddr> {
    match ip_version {
        EdgeIpVersion::Auto => {
            let v4 = addrs.iter().filter(|a| a.addr.is_ipv4());
            let v6 = addrs.iter().filter(|a| a.addr.is_ipv6());
            v4.chain(v6).copied().collect()
        }
        version => addrs
            .iter()
            .filter(|a| version.accepts(&a.addr))
            .copied()
            .collect(),
    }
}

/// What a slot should do after a failed dial
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CursorStep {
    /// Try the next address on the same protocol
    NextAddress,
    /// Too many consecutive failures; fall back to the next protocol
    Fallback,
}

/// Per-slot position in the edge address list
#[derive(Debug, Clone)]
pub struct AddrCursor {
    len: usize,
    position: usize,
    consecutive_failures: u8,
    max_failures: u8,
}

impl AddrCursor {
    /// Start at `conn_index % len` so slots land on different addresses
    pub fn new(conn_index: u8, len: usize, max_failures: u8) -> Self {
        let len = len.max(1);
        Self {
            len,
            position: conn_index as usize % len,
            consecutive_failures: 0,
            max_failures: max_failures.max(1),
        }
    }

    /// Index of the address to dial next
    pub fn position(&self) -> usize {
        self.position
    }

    /// Record a failed dial and move to the next address
    pub fn record_failure(&mut self) -> CursorStep {
        self.position = (self.position + 1) % self.len;
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        if self.consecutive_failures >= self.max_failures {
            self.consecutive_failures = 0;
            CursorStep::Fallback
        } else {
            CursorStep::NextAddress
        }
    }

    /// A dial succeeded; keep the position, clear the failure streak
    pub fn record_success(&mut self) {
        self.consecutive_failures = 0;
    }

    pub fn consecutive_failures(&self) -> u8 {
        self.consecutive_failures
    }

    /// Size of the address list this cursor walks
    pub fn len(&self) -> usize {
        self.len
    }
}
