//! Reconnection backoff with a bounded retry budget

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::config::duration_secs;

/// Backoff configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BackoffConfig {
    /// Delay before the first retry
    #[serde(with = "duration_secs")]
    pub initial_backoff: Duration,
    /// Upper bound for any single delay
    #[serde(with = "duration_secs")]
    pub max_backoff: Duration,
    /// Backoff multiplier
    pub multiplier: f64,
    /// Randomize each delay into `[delay/2, delay]`
    pub jitter: bool,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(60),
            multiplier: 2.0,
            jitter: true,
        }
    }
}

impl BackoffConfig {
    /// Delay for the given (1-based) attempt, before jitter
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(32) as i32;
        let secs = self.initial_backoff.as_secs_f64() * self.multiplier.powi(exponent);
        if !secs.is_finite() || secs >= self.max_backoff.as_secs_f64() {
            return self.max_backoff;
        }
        Duration::from_secs_f64(secs)
    }

    fn jittered(&self, delay: Duration) -> Duration {
        if !self.jitter || delay.is_zero() {
            return delay;
        }
        let half = delay / 2;
        rand::thread_rng().gen_range(half..=delay)
    }
}

/// Backoff errors
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum BackoffError {
    #[error("Retry budget of {0} exhausted")]
    MaxAttemptsReached(u32),

    #[error("Backoff cancelled")]
    Cancelled,
}

/// Exponential backoff with a retry budget
///
/// Each [`wait`](Self::wait) consumes one retry. Once more than
/// `max_retries` have been consumed the wait fails without sleeping.
#[derive(Debug)]
pub struct BackoffHandler {
    config: BackoffConfig,
    max_retries: u32,
    retries: u32,
}

impl BackoffHandler {
    pub fn new(config: BackoffConfig, max_retries: u32) -> Self {
        Self {
            config,
            max_retries,
            retries: 0,
        }
    }

    /// Consume one retry and return how long to wait before it
    pub fn next_delay(&mut self) -> Result<Duration, BackoffError> {
        if self.retries >= self.max_retries {
            return Err(BackoffError::MaxAttemptsReached(self.max_retries));
        }
        self.retries += 1;
        Ok(self.config.jittered(self.config.delay_for(self.retries)))
    }

    /// Wait before the next retry
    pub async fn wait(&mut self, cancel: &CancellationToken) -> Result<(), BackoffError> {
        self.wait_at_least(None, cancel).await
    }

    /// Wait before the next retry, honoring a server-provided delay if set
    pub async fn wait_at_least(
        &mut self,
        server_delay: Option<Duration>,
        cancel: &CancellationToken,
    ) -> Result<(), BackoffError> {
        let computed = self.next_delay()?;
        let delay = server_delay.unwrap_or(computed);

        debug!(
            "Waiting {:?} before retry {}/{}",
            delay, self.retries, self.max_retries
        );

        tokio::select! {
            _ = sleep(delay) => Ok(()),
            _ = cancel.cancelled() => Err(BackoffError::Cancelled),
        }
    }

    /// Reset the budget (call after a successful connection)
    pub fn reset(&mut self) {
        if self.retries > 0 {
            debug!("Resetting reconnection backoff");
        }
        self.retries = 0;
    }

    /// Retries consumed since the last reset
    pub fn retries(&self) -> u32 {
        self.retries
    }

    pub fn config(&self) -> &BackoffConfig {
        &self.config
    }
}
