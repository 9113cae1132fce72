// ABOUTME: Retry and backoff policies for batch calls
// ABOUTME: Connection-level retries live inside one call, loop-level retries span batches

use std::time::Duration;

use crate::config::BackfillConfig;
use crate::error::InvokeError;

/// Per-call retry applied by the batch invoker before a failure reaches the loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionRetryPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for ConnectionRetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 2,
            base_delay: Duration::from_millis(1000),
            max_delay: Duration::from_millis(5000),
        }
    }
}

impl ConnectionRetryPolicy {
    pub fn with_retries(max_retries: u32) -> Self {
        Self {
            max_retries,
            ..Self::default()
        }
    }

    /// Delay before retry number `attempt + 1`, where `attempt` counts from 0.
    pub fn delay(&self, attempt: u32) -> Duration {
        exponential(self.base_delay, attempt, self.max_delay)
    }

    pub fn should_retry(&self, attempt: u32, err: &InvokeError) -> bool {
        err.is_retryable() && attempt < self.max_retries
    }
}

/// What a loop controller does after a failed batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Refresh the token and retry immediately without spending budget.
    RefreshToken,
    /// Wait, then retry the same batch.
    Backoff(Duration),
    GiveUp,
}

/// Application-level retry across batches of one backfill loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoopRetryPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Budget multiplier for errors that look like connectivity loss
    pub network_multiplier: u32,
}

impl Default for LoopRetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(2000),
            max_delay: Duration::from_millis(30_000),
            network_multiplier: 2,
        }
    }
}

impl LoopRetryPolicy {
    pub fn from_config(config: &BackfillConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            ..Self::default()
        }
    }

    pub fn effective_max(&self, err: &InvokeError) -> u32 {
        if err.is_network() {
            self.max_retries * self.network_multiplier
        } else {
            self.max_retries
        }
    }

    /// Delay after the `retry_count`-th consecutive failure (1-based).
    pub fn delay(&self, retry_count: u32) -> Duration {
        exponential(self.base_delay, retry_count.saturating_sub(1), self.max_delay)
    }

    /// Decide what to do after a failure. `retry_count` is the consecutive
    /// failure count including this one; it is ignored for auth errors.
    pub fn decide(&self, retry_count: u32, err: &InvokeError) -> RetryDecision {
        if err.is_auth() {
            return RetryDecision::RefreshToken;
        }
        if retry_count >= self.effective_max(err) {
            RetryDecision::GiveUp
        } else {
            RetryDecision::Backoff(self.delay(retry_count))
        }
    }

    /// Longest one outer attempt can take once connection retries compound:
    /// every connection attempt runs to its timeout and every connection delay
    /// is paid, followed by the largest loop-level delay.
    pub fn worst_case_attempt_latency(
        &self,
        connection: &ConnectionRetryPolicy,
        timeout: Duration,
    ) -> Duration {
        let attempts = connection.max_retries + 1;
        let connection_delays: Duration = (0..connection.max_retries)
            .map(|attempt| connection.delay(attempt))
            .sum();
        timeout * attempts + connection_delays + self.max_delay
    }
}

fn exponential(base: Duration, exponent: u32, cap: Duration) -> Duration {
    let factor = 2u32.checked_pow(exponent).unwrap_or(u32::MAX);
    base.checked_mul(factor).unwrap_or(cap).min(cap)
}
