//! Retry decisions for throttled and stale-range results.
//!
//! Policies are pure functions of a [`RetryInput`]. The retry counters live
//! with the queued operation and are fed back into every evaluation.
use std::time::Duration;

use http::StatusCode;

use crate::{
    options::{RetryOptions, ThrottleRetryOptions},
    response::{OperationOutcome, SubStatusCode},
};

/// The facts a retry policy decides on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryInput {
    pub status: StatusCode,
    pub sub_status: Option<SubStatusCode>,
    /// Delay suggested by the server.
    pub retry_after: Option<Duration>,
    /// Number of throttling retries already performed.
    pub attempt_count: u32,
    /// Time already spent waiting before throttling retries.
    pub waited: Duration,
    /// Number of re-routes already performed.
    pub reroute_count: u32,
}

/// What to do with a failed or throttled result.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Complete the operation with the result as-is.
    Complete,
    /// Re-submit the operation after the delay.
    RetryAfter(Duration),
    /// Resolve the partition range again and re-submit on the new range.
    Reroute,
}

pub trait RetryPolicy: Send + Sync + std::fmt::Debug {
    fn evaluate(&self, input: &RetryInput) -> RetryDecision;
}

/// Retries throttled results with the server suggested delay.
#[derive(Debug, Clone)]
pub struct ThrottleRetryPolicy {
    options: ThrottleRetryOptions,
}

/// Re-routes stale-range results a bounded number of times.
#[derive(Debug, Clone)]
pub struct StaleRangeRetryPolicy {
    max_reroutes: u32,
}

/// The stale-range policy stacked on top of the throttling policy.
#[derive(Debug, Clone)]
pub struct DispatchRetryPolicy {
    stale_range: StaleRangeRetryPolicy,
    throttle: ThrottleRetryPolicy,
}

impl RetryDecision {
    pub fn is_retry(&self) -> bool {
        !matches!(self, Self::Complete)
    }

    pub fn delay(&self) -> Duration {
        match self {
            Self::RetryAfter(delay) => *delay,
            _ => Duration::ZERO,
        }
    }
}

impl ThrottleRetryPolicy {
    pub fn new(options: ThrottleRetryOptions) -> Self {
        Self { options }
    }
}

impl RetryPolicy for ThrottleRetryPolicy {
    fn evaluate(&self, input: &RetryInput) -> RetryDecision {
        if input.status != StatusCode::TOO_MANY_REQUESTS {
            return RetryDecision::Complete;
        }

        if input.attempt_count >= self.options.max_attempts {
            return RetryDecision::Complete;
        }

        let delay = input.retry_after.unwrap_or(self.options.default_backoff);
        // retry-after comes from the server and may be arbitrarily large
        if input
            .waited
            .checked_add(delay)
            .is_none_or(|total| total > self.options.max_wait)
        {
            return RetryDecision::Complete;
        }

        RetryDecision::RetryAfter(delay)
    }
}

impl StaleRangeRetryPolicy {
    pub fn new(max_reroutes: u32) -> Self {
        Self { max_reroutes }
    }
}

impl RetryPolicy for StaleRangeRetryPolicy {
    fn evaluate(&self, input: &RetryInput) -> RetryDecision {
        if !matches!(
            OperationOutcome::classify(input.status, input.sub_status),
            OperationOutcome::StaleRange
        ) {
            return RetryDecision::Complete;
        }

        if input.reroute_count >= self.max_reroutes {
            return RetryDecision::Complete;
        }

        RetryDecision::Reroute
    }
}

impl DispatchRetryPolicy {
    pub fn new(options: &RetryOptions) -> Self {
        Self {
            stale_range: StaleRangeRetryPolicy::new(options.max_reroutes),
            throttle: ThrottleRetryPolicy::new(options.throttle.clone()),
        }
    }
}

impl RetryPolicy for DispatchRetryPolicy {
    fn evaluate(&self, input: &RetryInput) -> RetryDecision {
        match self.stale_range.evaluate(input) {
            RetryDecision::Complete => self.throttle.evaluate(input),
            decision => decision,
        }
    }
}
