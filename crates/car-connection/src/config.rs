//! Connection Configuration

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Reconnect behavior of the legacy bind path
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectPolicy {
    /// Attempts per disconnect before giving up (None = until stopped)
    pub max_retries: Option<u32>,
    /// Backoff before the second attempt, doubled afterwards (ms)
    pub retry_backoff_ms: u64,
    /// Upper bound for the backoff (ms)
    pub max_backoff_ms: u64,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            max_retries: Some(10),
            retry_backoff_ms: 200,
            max_backoff_ms: 10_000,
        }
    }
}

impl ReconnectPolicy {
    /// Reconnect until explicitly stopped
    pub fn unbounded() -> Self {
        Self {
            max_retries: None,
            ..Default::default()
        }
    }

    /// Delay before the given zero-based attempt; the first attempt is immediate
    pub fn backoff(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }
        let factor = 1u64.checked_shl(attempt - 1).unwrap_or(u64::MAX);
        let delay_ms = self
            .retry_backoff_ms
            .saturating_mul(factor)
            .min(self.max_backoff_ms);
        Duration::from_millis(delay_ms)
    }

    /// Whether `attempts` failed attempts exhaust the policy
    pub fn exhausted(&self, attempts: u32) -> bool {
        self.max_retries.is_some_and(|max| attempts >= max)
    }
}

/// Configuration for the shared connection
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionConfig {
    /// Keep-alive after the last subscriber detaches (ms)
    pub grace_period_ms: u64,
    /// Legacy reconnect policy
    pub reconnect: ReconnectPolicy,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            grace_period_ms: 10_000,
            reconnect: ReconnectPolicy::default(),
        }
    }
}

impl ConnectionConfig {
    /// Grace period as a duration
    pub fn grace_period(&self) -> Duration {
        Duration::from_millis(self.grace_period_ms)
    }
}
