//! Pool-level circuit breaker.
//!
//! Counts consecutive task failures. Once the count reaches the threshold the
//! breaker opens and submissions are refused outright. After the cool-down
//! (measured from the most recent failure) the next submission closes it
//! again and acts as the probe; no dedicated probe task is sent.

use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{info, warn};

use crate::config::BreakerConfig;
use crate::error::SubmitError;

#[derive(Debug)]
pub struct CircuitBreaker {
    config: BreakerConfig,
    is_open: bool,
    consecutive_failures: u32,
    last_failure: Option<Instant>,
    last_failure_at: Option<DateTime<Utc>>,
    times_opened: u64,
}

/// Breaker state for stats.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BreakerSnapshot {
    pub is_open: bool,
    pub consecutive_failures: u32,
    pub last_failure_at: Option<DateTime<Utc>>,
    pub times_opened: u64,
}

impl CircuitBreaker {
    pub fn new(config: BreakerConfig) -> Self {
        Self {
            config,
            is_open: false,
            consecutive_failures: 0,
            last_failure: None,
            last_failure_at: None,
            times_opened: 0,
        }
    }

    pub fn is_open(&self) -> bool {
        self.is_open
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    /// Gate a submission.
    ///
    /// An open breaker whose cool-down has elapsed is closed here and the
    /// failure count cleared, letting this submission through as the probe.
    pub fn admit(&mut self, now: Instant) -> Result<(), SubmitError> {
        if !self.is_open {
            return Ok(());
        }

        let elapsed = self
            .last_failure
            .map(|at| now.saturating_duration_since(at))
            .unwrap_or(self.config.cooldown);

        if elapsed >= self.config.cooldown {
            info!(
                failures = self.consecutive_failures,
                "Circuit breaker cool-down elapsed, admitting probe submission"
            );
            self.is_open = false;
            self.consecutive_failures = 0;
            return Ok(());
        }

        Err(SubmitError::CircuitOpen {
            failures: self.consecutive_failures,
            retry_after: self.config.cooldown - elapsed,
        })
    }

    /// Record a pool-level failure.
    pub fn record_failure(&mut self, now: Instant) {
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        self.last_failure = Some(now);
        self.last_failure_at = Some(Utc::now());

        if !self.is_open && self.consecutive_failures >= self.config.failure_threshold {
            self.is_open = true;
            self.times_opened += 1;
            warn!(
                failures = self.consecutive_failures,
                cooldown_secs = self.config.cooldown.as_secs(),
                "Circuit breaker opened"
            );
        }
    }

    /// Record a successful task. Clears the failure streak but leaves an
    /// open breaker open; only `admit` closes it.
    pub fn record_success(&mut self) {
        self.consecutive_failures = 0;
    }

    pub fn snapshot(&self) -> BreakerSnapshot {
        BreakerSnapshot {
            is_open: self.is_open,
            consecutive_failures: self.consecutive_failures,
            last_failure_at: self.last_failure_at,
            times_opened: self.times_opened,
        }
    }
}
