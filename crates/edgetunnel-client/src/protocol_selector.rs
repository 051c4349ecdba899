//! Transport protocol selection and per-slot fallback

use async_trait::async_trait;
use edgetunnel_proto::{Protocol, PROTOCOL_LIST};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// How often automatic selection re-reads the rollout percentages
pub const DEFAULT_REFRESH_TTL: Duration = Duration::from_secs(3600);

/// Longest a single rollout lookup may take before the cached choice is used
pub const ROLLOUT_FETCH_TIMEOUT: Duration = Duration::from_secs(10);

/// User-facing protocol setting
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ProtocolChoice {
    #[default]
    Auto,
    Pinned(Protocol),
}

impl std::str::FromStr for ProtocolChoice {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.eq_ignore_ascii_case("auto") {
            return Ok(ProtocolChoice::Auto);
        }
        s.parse::<Protocol>().map(ProtocolChoice::Pinned)
    }
}

impl std::fmt::Display for ProtocolChoice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProtocolChoice::Auto => f.write_str("auto"),
            ProtocolChoice::Pinned(p) => p.fmt(f),
        }
    }
}

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
#[error("No protocol left to fall back to after {0}")]
pub struct ProtocolExhausted(pub Protocol);

/// Rollout percentage for one protocol
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProtocolPercent {
    pub protocol: Protocol,
    pub percentage: u32,
}

/// Source of protocol rollout percentages
#[async_trait]
pub trait PercentageFetcher: Send + Sync {
    async fn fetch(&self) -> Result<Vec<ProtocolPercent>, String>;
}

/// Fixed percentages
#[derive(Debug, Clone)]
pub struct StaticPercentages(pub Vec<ProtocolPercent>);

/// Parses `protocol=percentage` pairs separated by commas, e.g. `quic=50,http2=100`
impl std::str::FromStr for StaticPercentages {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.split(',')
            .map(str::trim)
            .filter(|pair| !pair.is_empty())
            .map(|pair| {
                let (protocol, percentage) = pair
                    .split_once('=')
                    .ok_or_else(|| format!("Expected protocol=percentage, got '{}'", pair))?;
                let percentage: u32 = percentage
                    .trim()
                    .parse()
                    .map_err(|_| format!("Invalid percentage in '{}'", pair))?;
                if percentage > 100 {
                    return Err(format!("Percentage above 100 in '{}'", pair));
                }
                Ok(ProtocolPercent {
                    protocol: protocol.trim().parse()?,
                    percentage,
                })
            })
            .collect::<Result<Vec<_>, _>>()
            .map(StaticPercentages)
    }
}

#[async_trait]
impl PercentageFetcher for StaticPercentages {
    async fn fetch(&self) -> Result<Vec<ProtocolPercent>, String> {
        Ok(self.0.clone())
    }
}

/// 32-bit FNV-1a
fn fnv1a32(data: &[u8]) -> u32 {
    const OFFSET: u32 = 0x811c_9dc5;
    const PRIME: u32 = 0x0100_0193;
    data.iter()
        .fold(OFFSET, |hash, b| (hash ^ *b as u32).wrapping_mul(PRIME))
}

struct AutoState {
    current: Protocol,
    refresh_after: Instant,
}

/// Picks the protocol new dials start with
///
/// A pinned selector only ever offers its protocol. An automatic selector
/// starts from the most capable protocol and, when a fetcher is configured,
/// follows the rollout percentages for this account.
pub struct ProtocolSelector {
    choice: ProtocolChoice,
    threshold: u32,
    fetcher: Option<Arc<dyn PercentageFetcher>>,
    refresh_ttl: Duration,
    state: Mutex<AutoState>,
}

impl std::fmt::Debug for ProtocolSelector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProtocolSelector")
            .field("choice", &self.choice)
            .field("threshold", &self.threshold)
            .finish()
    }
}

impl ProtocolSelector {
    pub fn pinned(protocol: Protocol) -> Self {
        Self::build(ProtocolChoice::Pinned(protocol), "", None)
    }

    pub fn auto(account_tag: &str, fetcher: Option<Arc<dyn PercentageFetcher>>) -> Self {
        Self::build(ProtocolChoice::Auto, account_tag, fetcher)
    }

    pub fn new(
        choice: ProtocolChoice,
        account_tag: &str,
        fetcher: Option<Arc<dyn PercentageFetcher>>,
    ) -> Self {
        Self::build(choice, account_tag, fetcher)
    }

    fn build(
        choice: ProtocolChoice,
        account_tag: &str,
        fetcher: Option<Arc<dyn PercentageFetcher>>,
    ) -> Self {
        let initial = match choice {
            ProtocolChoice::Pinned(p) => p,
            ProtocolChoice::Auto => PROTOCOL_LIST[0],
        };
        Self {
            choice,
            threshold: fnv1a32(account_tag.as_bytes()) % 100,
            fetcher,
            refresh_ttl: DEFAULT_REFRESH_TTL,
            state: Mutex::new(AutoState {
                current: initial,
                // Due immediately so the first current() consults the fetcher
                refresh_after: Instant::now(),
            }),
        }
    }

    pub fn with_refresh_ttl(mut self, ttl: Duration) -> Self {
        self.refresh_ttl = ttl;
        self
    }

    pub fn choice(&self) -> ProtocolChoice {
        self.choice
    }

    /// Protocols a slot may walk through, most capable first
    pub fn candidates(&self) -> Vec<Protocol> {
        match self.choice {
            ProtocolChoice::Pinned(p) => vec![p],
            ProtocolChoice::Auto => PROTOCOL_LIST.to_vec(),
        }
    }

    /// Protocol new dials should start with
    pub async fn current(&self) -> Protocol {
        if let ProtocolChoice::Pinned(p) = self.choice {
            return p;
        }

        let Some(fetcher) = &self.fetcher else {
            return self.state.lock().await.current;
        };

        // Claim the refresh so concurrent callers keep using the cached choice
        {
            let mut state = self.state.lock().await;
            if Instant::now() < state.refresh_after {
                return state.current;
            }
            state.refresh_after = Instant::now() + self.refresh_ttl;
        }

        let fetched = match tokio::time::timeout(ROLLOUT_FETCH_TIMEOUT, fetcher.fetch()).await {
            Ok(result) => result,
            Err(_) => Err(format!("timed out after {:?}", ROLLOUT_FETCH_TIMEOUT)),
        };

        let mut state = self.state.lock().await;
        match fetched {
            Ok(percentages) => {
                let selected = self.select(&percentages);
                if selected != state.current {
                    info!(
                        "Protocol rollout changed selection from {} to {}",
                        state.current, selected
                    );
                }
                state.current = selected;
            }
            Err(e) => {
                warn!(
                    "Failed to fetch protocol percentages, keeping {}: {}",
                    state.current, e
                );
            }
        }
        state.current
    }

    fn select(&self, percentages: &[ProtocolPercent]) -> Protocol {
        for protocol in PROTOCOL_LIST {
            let enabled = percentages
                .iter()
                .any(|p| p.protocol == protocol && p.percentage > self.threshold);
            if enabled {
                return protocol;
            }
        }
        PROTOCOL_LIST[PROTOCOL_LIST.len() - 1]
    }

    /// Next candidate after `from` in the fixed fallback order
    pub fn fallback(&self, from: Protocol) -> Result<Protocol, ProtocolExhausted> {
        match self.choice {
            ProtocolChoice::Pinned(_) => Err(ProtocolExhausted(from)),
            ProtocolChoice::Auto => from.fallback().ok_or(ProtocolExhausted(from)),
        }
    }
}

/// Per-slot walk through the protocol candidates
///
/// Starts at the selector's current protocol and visits every candidate at
/// most once, wrapping around the fixed order, until [`reset`](Self::reset).
#[derive(Debug)]
pub struct ProtocolFallback {
    selector: Arc<ProtocolSelector>,
    current: Protocol,
    tried: Vec<Protocol>,
}

impl ProtocolFallback {
    pub async fn new(selector: Arc<ProtocolSelector>) -> Self {
        let current = selector.current().await;
        Self {
            selector,
            current,
            tried: vec![current],
        }
    }

    pub fn current(&self) -> Protocol {
        self.current
    }

    /// Switch to the next untried protocol
    pub fn fallback(&mut self) -> Result<Protocol, ProtocolExhausted> {
        let candidates = self.selector.candidates();
        let start = candidates
            .iter()
            .position(|p| *p == self.current)
            .unwrap_or(0);

        let next = (1..candidates.len())
            .map(|offset| candidates[(start + offset) % candidates.len()])
            .find(|p| !self.tried.contains(p))
            .ok_or(ProtocolExhausted(self.current))?;

        debug!("Falling back from {} to {}", self.current, next);
        self.current = next;
        self.tried.push(next);
        Ok(next)
    }

    /// Start a new cycle from the selector's current protocol
    pub async fn reset(&mut self) {
        self.current = self.selector.current().await;
        self.tried.clear();
        self.tried.push(self.current);
    }
}
