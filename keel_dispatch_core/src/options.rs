use std::time::Duration;

use bytesize::ByteSize;

use crate::{
    error::{ConfigurationSnafu, Result},
    partition::{EffectivePartitionKey, PartitionKey},
};

/// Options controlling how the executor batches and dispatches operations.
#[derive(Debug, Clone, PartialEq)]
pub struct DispatchOptions {
    /// The maximum number of operations in a single batch.
    pub max_operation_count: usize,
    /// The maximum packed size of a single batch.
    pub max_body_size: ByteSize,
    /// The maximum number of batches in flight per partition range.
    pub max_concurrency_per_range: usize,
    /// The interval at which partially filled queues are flushed.
    pub flush_interval: Duration,
    /// Shrink batches on ranges that are being throttled.
    pub adaptive_batch_size: bool,
    /// Retry configuration.
    pub retry: RetryOptions,
}

/// Options for the stacked retry policies.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryOptions {
    /// Throttling retry configuration.
    pub throttle: ThrottleRetryOptions,
    /// The maximum number of times an operation is re-routed after a stale range.
    pub max_reroutes: u32,
}

/// Options for retrying throttled operations.
#[derive(Debug, Clone, PartialEq)]
pub struct ThrottleRetryOptions {
    /// The maximum number of retries of a single operation.
    pub max_attempts: u32,
    /// The maximum cumulative time spent waiting before retries.
    pub max_wait: Duration,
    /// The delay used when the server does not suggest one.
    pub default_backoff: Duration,
}

/// Consistency levels a caller may request on a single call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsistencyLevel {
    Strong,
    BoundedStaleness,
    Session,
    ConsistentPrefix,
    Eventual,
}

/// How a request addresses its partition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PartitionTarget {
    /// Address the logical partition key of the item.
    Logical(PartitionKey),
    /// Address a pre-computed partition key hash.
    Effective(EffectivePartitionKey),
}

/// Request-level options supplied alongside an operation or a batch.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RequestOptions {
    /// Overrides the partition the request targets.
    pub partition_target: Option<PartitionTarget>,
    /// Overrides the account consistency level for this call.
    pub consistency_level: Option<ConsistencyLevel>,
    /// Session token to read your own writes.
    pub session_token: Option<String>,
}

impl Default for DispatchOptions {
    fn default() -> Self {
        Self {
            max_operation_count: 100,
            max_body_size: ByteSize::kib(220),
            max_concurrency_per_range: 1,
            flush_interval: Duration::from_millis(100),
            adaptive_batch_size: false,
            retry: RetryOptions::default(),
        }
    }
}

impl DispatchOptions {
    /// Change the maximum number of operations per batch.
    pub fn with_max_operation_count(mut self, max_operation_count: usize) -> Self {
        self.max_operation_count = max_operation_count;
        self
    }

    /// Change the maximum packed size of a batch.
    pub fn with_max_body_size(mut self, max_body_size: ByteSize) -> Self {
        self.max_body_size = max_body_size;
        self
    }

    /// Change the maximum number of in-flight batches per range.
    pub fn with_max_concurrency_per_range(mut self, max_concurrency_per_range: usize) -> Self {
        self.max_concurrency_per_range = max_concurrency_per_range;
        self
    }

    /// Change the flush interval.
    pub fn with_flush_interval(mut self, flush_interval: Duration) -> Self {
        self.flush_interval = flush_interval;
        self
    }

    /// Enable or disable adaptive batch sizing.
    pub fn with_adaptive_batch_size(mut self, adaptive_batch_size: bool) -> Self {
        self.adaptive_batch_size = adaptive_batch_size;
        self
    }

    /// Change the retry options.
    pub fn with_retry(mut self, retry: RetryOptions) -> Self {
        self.retry = retry;
        self
    }

    /// The maximum batch size, in bytes.
    pub fn max_body_bytes(&self) -> usize {
        self.max_body_size.as_u64().try_into().unwrap_or(usize::MAX)
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_operation_count == 0 {
            return ConfigurationSnafu {
                message: "max operation count must be at least 1".to_string(),
            }
            .fail();
        }

        if self.max_body_size.as_u64() == 0 {
            return ConfigurationSnafu {
                message: "max body size must be greater than zero".to_string(),
            }
            .fail();
        }

        if self.max_concurrency_per_range == 0 {
            return ConfigurationSnafu {
                message: "max concurrency per range must be at least 1".to_string(),
            }
            .fail();
        }

        if self.flush_interval.is_zero() {
            return ConfigurationSnafu {
                message: "flush interval must be greater than zero".to_string(),
            }
            .fail();
        }

        Ok(())
    }
}

impl Default for RetryOptions {
    fn default() -> Self {
        Self {
            throttle: ThrottleRetryOptions::default(),
            max_reroutes: 3,
        }
    }
}

impl RetryOptions {
    pub fn with_throttle(mut self, throttle: ThrottleRetryOptions) -> Self {
        self.throttle = throttle;
        self
    }

    pub fn with_max_reroutes(mut self, max_reroutes: u32) -> Self {
        self.max_reroutes = max_reroutes;
        self
    }
}

impl Default for ThrottleRetryOptions {
    fn default() -> Self {
        Self {
            max_attempts: 9,
            max_wait: Duration::from_secs(30),
            default_backoff: Duration::from_millis(5),
        }
    }
}

impl ThrottleRetryOptions {
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    pub fn with_max_wait(mut self, max_wait: Duration) -> Self {
        self.max_wait = max_wait;
        self
    }

    pub fn with_default_backoff(mut self, default_backoff: Duration) -> Self {
        self.default_backoff = default_backoff;
        self
    }
}

impl RequestOptions {
    /// Reject the options that a batched request cannot express.
    pub fn validate_for_batch(&self) -> Result<()> {
        if let Some(PartitionTarget::Effective(epk)) = &self.partition_target {
            return ConfigurationSnafu {
                message: format!(
                    "effective partition key {} cannot be used with batched operations",
                    epk.0
                ),
            }
            .fail();
        }

        if let Some(level) = self.consistency_level {
            return ConfigurationSnafu {
                message: format!(
                    "consistency level {level:?} cannot be overridden for batched operations"
                ),
            }
            .fail();
        }

        if self.session_token.is_some() {
            return ConfigurationSnafu {
                message: "session tokens are not supported for batched operations".to_string(),
            }
            .fail();
        }

        Ok(())
    }

    /// The logical partition key override, if any.
    pub fn logical_partition_key(&self) -> Option<&PartitionKey> {
        match &self.partition_target {
            Some(PartitionTarget::Logical(key)) => Some(key),
            _ => None,
        }
    }
}
