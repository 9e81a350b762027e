//! Retry policies - exponential backoff with deterministic jitter
//!
//! ```text
//! delay  = base_delay × backoff_factor ^ attempt
//! delay += 0.1 × delay × frac(node_id)        (jitter, when enabled)
//! delay  = min(delay, max_delay)
//! ```
//!
//! `frac(node_id)` is a stable FNV-1a hash of the node id reduced to
//! `[0, 1)`. Two nodes failing at the same moment back off by slightly
//! different amounts, while a single node always waits the same time for a
//! given attempt. That keeps retries reproducible under test.
//!
//! ```rust
//! use superstep_core::retry::RetryPolicy;
//! use std::time::Duration;
//!
//! let policy = RetryPolicy::new(3)
//!     .with_base_delay(0.5)
//!     .with_backoff_factor(2.0)
//!     .with_jitter(false);
//!
//! assert!(policy.should_retry(2));
//! assert!(!policy.should_retry(3));
//! assert_eq!(policy.calculate_delay("fetch", 2), Duration::from_secs(2));
//! ```

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Backoff configuration shared by every node under the `retry` policy
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Retries allowed after the first failure
    pub max_retries: u32,

    /// Delay before the first retry, in seconds
    pub base_delay: f64,

    /// Multiplier applied per attempt
    pub backoff_factor: f64,

    /// Upper bound on any single delay, in seconds
    pub max_delay: f64,

    /// Whether to add the per-node jitter
    pub jitter: bool,
}

impl RetryPolicy {
    /// Policy allowing `max_retries` retries with default timings
    pub fn new(max_retries: u32) -> Self {
        Self {
            max_retries,
            ..Self::default()
        }
    }

    pub fn with_base_delay(mut self, seconds: f64) -> Self {
        self.base_delay = seconds;
        self
    }

    pub fn with_backoff_factor(mut self, factor: f64) -> Self {
        self.backoff_factor = factor;
        self
    }

    pub fn with_max_delay(mut self, seconds: f64) -> Self {
        self.max_delay = seconds;
        self
    }

    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    /// Delay to wait before retry number `attempt + 1` of `node_id`
    pub fn calculate_delay(&self, node_id: &str, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
        let mut delay = self.base_delay * self.backoff_factor.powi(exponent);

        if self.jitter {
            delay += 0.1 * delay * jitter_fraction(node_id);
        }

        if delay.is_nan() {
            return Duration::ZERO;
        }
        let capped = delay.min(self.max_delay);
        if capped <= 0.0 {
            return Duration::ZERO;
        }
        Duration::try_from_secs_f64(capped).unwrap_or(Duration::MAX)
    }

    /// Whether a failure on `attempt` (0-based) may be retried
    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_retries
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: 1.0,
            backoff_factor: 2.0,
            max_delay: 128.0,
            jitter: true,
        }
    }
}

/// Stable value in `[0, 1)` derived from `node_id`
fn jitter_fraction(node_id: &str) -> f64 {
    const FNV_OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
    const FNV_PRIME: u64 = 0x0000_0100_0000_01b3;

    let hash = node_id.bytes().fold(FNV_OFFSET, |hash, byte| {
        (hash ^ u64::from(byte)).wrapping_mul(FNV_PRIME)
    });
    (hash % 1000) as f64 / 1000.0
}

/// Attempt bookkeeping for a single node activation
#[derive(Debug, Clone, Default)]
pub struct RetryState {
    /// Failed attempts so far
    pub attempts: u32,
    /// Message of the most recent failure
    pub last_error: Option<String>,
}

impl RetryState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a failed attempt
    pub fn record_attempt(&mut self, error: impl Into<String>) {
        self.attempts += 1;
        self.last_error = Some(error.into());
    }
}
