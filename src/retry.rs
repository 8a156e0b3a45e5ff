//! Retry policies for failed sends and reconnection attempts.

use std::fmt;
use std::time::Duration;

use rand::Rng;

use crate::error::TransportError;

/// Outcome of consulting a [`RetryPolicy`]: whether to try again, and how
/// long to wait first.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct RetryDecision {
    pub should_retry: bool,
    pub delay: Duration,
}

impl RetryDecision {
    pub fn retry(delay: Duration) -> Self {
        Self {
            should_retry: true,
            delay,
        }
    }

    pub fn stop() -> Self {
        Self {
            should_retry: false,
            delay: Duration::ZERO,
        }
    }
}

/// Maps an attempt number and the most recent error to a [`RetryDecision`].
///
/// Implementations must be pure: the engine may consult the policy from the
/// send path and the reconnect loop concurrently.
pub trait RetryPolicy: Send + Sync + fmt::Debug {
    fn retry_decision(&self, current_retry_count: u32, last_error: &TransportError)
        -> RetryDecision;
}

/// Exponential backoff with a jittered delta, the default policy.
///
/// The delay for attempt `c` is
/// `min(min_backoff + (2^c - 1) * jitter(delta_backoff), max_backoff)` where
/// the jitter is drawn uniformly from 80% to 120% of `delta_backoff`. With
/// `first_fast_retry` set, attempt 0 goes out immediately.
#[derive(Debug, Clone)]
pub struct ExponentialBackoffWithJitter {
    retry_count: u32,
    min_backoff: Duration,
    max_backoff: Duration,
    delta_backoff: Duration,
    first_fast_retry: bool,
}

impl ExponentialBackoffWithJitter {
    pub fn new(
        retry_count: u32,
        min_backoff: Duration,
        max_backoff: Duration,
        delta_backoff: Duration,
        first_fast_retry: bool,
    ) -> Self {
        Self {
            retry_count,
            min_backoff,
            max_backoff,
            delta_backoff,
            first_fast_retry,
        }
    }
}

impl Default for ExponentialBackoffWithJitter {
    fn default() -> Self {
        Self {
            retry_count: u32::MAX,
            min_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(10),
            delta_backoff: Duration::from_millis(100),
            first_fast_retry: true,
        }
    }
}

impl RetryPolicy for ExponentialBackoffWithJitter {
    fn retry_decision(
        &self,
        current_retry_count: u32,
        _last_error: &TransportError,
    ) -> RetryDecision {
        if current_retry_count >= self.retry_count {
            return RetryDecision::stop();
        }
        if current_retry_count == 0 && self.first_fast_retry {
            return RetryDecision::retry(Duration::ZERO);
        }

        let delta_millis = self.delta_backoff.as_millis() as f64;
        let jitter = rand::thread_rng().gen_range(delta_millis * 0.8..=delta_millis * 1.2);
        // Cap the exponent; beyond 2^30 the max backoff dominates anyway
        let exponent = current_retry_count.min(30) as i32;
        let backoff = (2f64.powi(exponent) - 1.0) * jitter;
        let delay_millis = (self.min_backoff.as_millis() as f64 + backoff)
            .min(self.max_backoff.as_millis() as f64);

        RetryDecision::retry(Duration::from_millis(delay_millis as u64))
    }
}

/// A policy that never retries
#[derive(Debug, Clone, Copy, Default)]
pub struct NoRetry;

impl RetryPolicy for NoRetry {
    fn retry_decision(
        &self,
        _current_retry_count: u32,
        _last_error: &TransportError,
    ) -> RetryDecision {
        RetryDecision::stop()
    }
}
