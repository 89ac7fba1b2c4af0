//! Tunables for the Paxos engine and the leader election loop.
//!
//! ## Tuning Guidelines
//!
//! - `request_timeout` bounds every broadcast. It should comfortably exceed a
//!   peer round trip plus one durable write on the acceptor.
//!
//! - `ping_rate` is how often the election loop re-verifies leadership. A
//!   leader that was partitioned away notices it lost leadership within about
//!   one `ping_rate`.
//!
//! - The backoff spreads out competing proposers after a round conflict so
//!   that two nodes do not keep preempting each other forever.
//!
//! Loading these from files or flags is left to the embedding service; the
//! structs derive serde traits so it can.

use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

/// Configuration for the Paxos façade.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PaxosConfig {
    /// Upper bound on one broadcast round to acceptors or learners.
    pub request_timeout: Duration,
}

impl Default for PaxosConfig {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(5),
        }
    }
}

impl PaxosConfig {
    /// Create a Paxos config suitable for in-process simulated clusters.
    pub fn for_simulation() -> Self {
        Self {
            request_timeout: Duration::from_millis(200),
        }
    }
}

/// Jittered exponential backoff used between leadership attempts.
///
/// ```text
/// delay(n) = min(initial * multiplier^n, max) * (1 - jitter * U[0, 1))
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackoffConfig {
    /// Delay before the first retry.
    pub initial: Duration,
    /// Upper bound on any single delay.
    pub max: Duration,
    /// Growth factor per attempt.
    pub multiplier: f64,
    /// Fraction of the delay that is randomized, between 0.0 and 1.0.
    pub jitter: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial: Duration::from_millis(50),
            max: Duration::from_secs(2),
            multiplier: 2.0,
            jitter: 0.5,
        }
    }
}

impl BackoffConfig {
    /// Backoff suitable for in-process simulated clusters.
    pub fn for_simulation() -> Self {
        Self {
            initial: Duration::from_millis(5),
            max: Duration::from_millis(100),
            multiplier: 2.0,
            jitter: 0.5,
        }
    }

    /// Upper bound of the delay for the given retry attempt (0-based).
    pub fn ceiling_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
        let scaled = self.initial.as_nanos() as f64 * self.multiplier.max(1.0).powi(exponent);
        if !scaled.is_finite() || scaled >= self.max.as_nanos() as f64 {
            self.max
        } else {
            Duration::from_nanos(scaled.round() as u64)
        }
    }

    /// Jittered delay for the given retry attempt (0-based).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let ceiling = self.ceiling_for_attempt(attempt);
        // NaN would survive the clamp and make `mul_f64` panic.
        let jitter = if self.jitter.is_finite() {
            self.jitter.clamp(0.0, 1.0)
        } else {
            0.0
        };
        if jitter == 0.0 {
            return ceiling;
        }
        let factor = 1.0 - jitter * rand::rng().random_range(0.0..1.0);
        ceiling.mul_f64(factor)
    }
}

/// Configuration for the leader election service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LeaderElectionConfig {
    /// How often leadership is re-verified in the background.
    pub ping_rate: Duration,
    /// Timeout for pinging peers' leadership status.
    pub ping_timeout: Duration,
    /// Backoff between failed leadership attempts.
    pub backoff: BackoffConfig,
}

impl Default for LeaderElectionConfig {
    fn default() -> Self {
        Self {
            ping_rate: Duration::from_secs(1),
            ping_timeout: Duration::from_secs(1),
            backoff: BackoffConfig::default(),
        }
    }
}

impl LeaderElectionConfig {
    /// Create an election config suitable for in-process simulated clusters.
    pub fn for_simulation() -> Self {
        Self {
            ping_rate: Duration::from_millis(50),
            ping_timeout: Duration::from_millis(100),
            backoff: BackoffConfig::for_simulation(),
        }
    }
}
