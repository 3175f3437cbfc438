use std::{
    collections::HashMap,
    mem,
    sync::atomic::{AtomicBool, Ordering},
    time::Duration,
};

use parking_lot::Mutex;
use tokio::sync::OwnedSemaphorePermit;
use tracing::{debug, warn};

use crate::{
    builder::pack,
    error::DispatchError,
    executor::{DispatchContext, Resubmitter},
    reply::QueuedOperation,
    response::{BatchResponse, OperationOutcome, OperationRecord},
    retry::RetryDecision,
    routing::RangeId,
    transport::BatchRequest,
};

pub use self::metrics::DispatchMetrics;

mod metrics;

/// A one-shot group of operations for a single range.
///
/// A batcher is filled with [`Batcher::try_add`] and dispatched at most once.
pub(crate) struct Batcher {
    range_id: RangeId,
    max_operation_count: usize,
    max_body_bytes: usize,
    dispatched: AtomicBool,
    buffer: Mutex<BatcherBuffer>,
}

#[derive(Default)]
struct BatcherBuffer {
    operations: Vec<QueuedOperation>,
    approximate_size: usize,
}

/// What happened to a dispatched batch, fed back to the streamer.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub(crate) struct DispatchSummary {
    pub operations: usize,
    pub throttled: usize,
}

/// Operations sorted by what happens to them next.
#[derive(Default)]
struct Settlement {
    retries: HashMap<Duration, Vec<QueuedOperation>>,
    reroutes: Vec<QueuedOperation>,
    throttled: usize,
}

impl Batcher {
    pub fn new(range_id: RangeId, max_operation_count: usize, max_body_bytes: usize) -> Self {
        Self {
            range_id,
            max_operation_count: max_operation_count.max(1),
            max_body_bytes,
            dispatched: AtomicBool::new(false),
            buffer: Mutex::new(BatcherBuffer::default()),
        }
    }

    /// Adds the operation to the batch.
    ///
    /// Gives the operation back if the batcher was dispatched or the operation
    /// does not fit. The first operation is always accepted.
    pub fn try_add(&self, operation: QueuedOperation) -> Result<(), QueuedOperation> {
        if self.dispatched.load(Ordering::Acquire) {
            return Err(operation);
        }

        // A failed materialization is reported by `pack`.
        let size = operation.operation.approximate_size().unwrap_or(0);

        let mut buffer = self.buffer.lock();
        if buffer.operations.len() >= self.max_operation_count {
            return Err(operation);
        }

        if !buffer.operations.is_empty() && buffer.approximate_size + size > self.max_body_bytes {
            return Err(operation);
        }

        buffer.approximate_size += size;
        buffer.operations.push(operation);

        Ok(())
    }

    pub fn len(&self) -> usize {
        self.buffer.lock().operations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Sends the batch and settles every operation in it.
    ///
    /// The permit is held until all results are processed.
    pub async fn dispatch(
        &self,
        context: &DispatchContext,
        resubmitter: &Resubmitter,
        permit: OwnedSemaphorePermit,
    ) -> DispatchSummary {
        if self
            .dispatched
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            warn!(range = %self.range_id, "batcher dispatched twice");
            return DispatchSummary::default();
        }

        let operations = mem::take(&mut self.buffer.lock().operations);

        let packed = pack(operations, self.max_body_bytes, self.max_operation_count);

        for (operation, error) in packed.rejected {
            context.metrics.record_completed(OperationOutcome::Failed);
            operation.fail(error);
        }

        if !packed.overflow.is_empty() {
            debug!(
                range = %self.range_id,
                operations = packed.overflow.len(),
                "resubmitting batch overflow"
            );
            resubmitter.resubmit(packed.overflow);
        }

        if packed.batch.is_empty() {
            return DispatchSummary::default();
        }

        let (operations, body) = packed.batch.into_parts();
        let operation_count = operations.len();

        let request = BatchRequest {
            range_id: self.range_id.clone(),
            partition_key: None,
            atomic: false,
            operation_count,
            body,
        };

        context.metrics.record_batch(request.body.len(), false);
        debug!(
            range = %self.range_id,
            operations = operation_count,
            bytes = request.body.len(),
            "dispatching batch"
        );

        let result = context.transport.send(&self.range_id, request).await;

        let summary = match result {
            Err(error) => {
                warn!(range = %self.range_id, error = %error, "batch transport failed");
                for operation in operations {
                    context.metrics.record_completed(OperationOutcome::Failed);
                    operation.fail(DispatchError::Transport {
                        range_id: self.range_id.clone(),
                        source: error.clone(),
                    });
                }

                DispatchSummary {
                    operations: operation_count,
                    throttled: 0,
                }
            }
            Ok(response) => self.settle(context, resubmitter, response, operations),
        };

        drop(permit);

        summary
    }

    fn settle(
        &self,
        context: &DispatchContext,
        resubmitter: &Resubmitter,
        response: BatchResponse,
        operations: Vec<QueuedOperation>,
    ) -> DispatchSummary {
        let operation_count = operations.len();
        let mut settlement = Settlement::default();

        if response.results.is_empty() && !response.is_success() {
            debug!(
                range = %self.range_id,
                status = %response.status,
                "batch failed without per-operation results"
            );

            let status = response.status;
            let sub_status = response.sub_status;
            let retry_after = response.retry_after;
            match response.outcome() {
                OperationOutcome::Throttled | OperationOutcome::StaleRange => {
                    for operation in operations {
                        let mut record = OperationRecord::new(0, status);
                        record.sub_status = sub_status;
                        record.retry_after = retry_after;
                        self.settle_one(context, &mut settlement, operation, record);
                    }
                }
                _ => {
                    for operation in operations {
                        context.metrics.record_completed(OperationOutcome::Failed);
                        operation.fail(DispatchError::BatchRejected { status, sub_status });
                    }
                }
            }
        } else {
            let slots = response.correlate(operation_count);
            for (index, (operation, slot)) in operations.into_iter().zip(slots).enumerate() {
                match slot {
                    Some(record) => self.settle_one(context, &mut settlement, operation, record),
                    None => {
                        warn!(range = %self.range_id, index, "no result for operation");
                        context.metrics.record_completed(OperationOutcome::Failed);
                        operation.fail(DispatchError::Internal {
                            message: format!("missing result for operation at index {index}"),
                        });
                    }
                }
            }
        }

        let throttled = settlement.throttled;
        settlement.submit(&self.range_id, context, resubmitter);

        DispatchSummary {
            operations: operation_count,
            throttled,
        }
    }

    fn settle_one(
        &self,
        context: &DispatchContext,
        settlement: &mut Settlement,
        mut operation: QueuedOperation,
        record: OperationRecord,
    ) {
        let outcome = record.outcome();
        if outcome == OperationOutcome::Throttled {
            settlement.throttled += 1;
        }

        if outcome == OperationOutcome::Success {
            context.metrics.record_completed(outcome);
            operation.succeed(record);
            return;
        }

        let input = operation.retry_input(record.status, record.sub_status, record.retry_after);
        let decision = context.retry_policy.evaluate(&input);

        if decision.is_retry() && operation.is_cancelled() {
            context.metrics.record_completed(outcome);
            operation.fail(DispatchError::Cancelled);
            return;
        }

        match decision {
            RetryDecision::RetryAfter(delay) => {
                operation.retry.throttle_attempts += 1;
                operation.retry.waited = operation.retry.waited.saturating_add(delay);
                settlement.retries.entry(delay).or_default().push(operation);
            }
            RetryDecision::Reroute => {
                operation.retry.reroutes += 1;
                settlement.reroutes.push(operation);
            }
            RetryDecision::Complete => {
                context.metrics.record_completed(outcome);
                let error = self.terminal_error(&operation, outcome, &record);
                operation.fail(error);
            }
        }
    }

    fn terminal_error(
        &self,
        operation: &QueuedOperation,
        outcome: OperationOutcome,
        record: &OperationRecord,
    ) -> DispatchError {
        match outcome {
            OperationOutcome::Throttled => DispatchError::Throttled {
                status: record.status,
                sub_status: record.sub_status,
                attempts: operation.retry.throttle_attempts,
            },
            OperationOutcome::StaleRange => DispatchError::StaleRange {
                range_id: self.range_id.clone(),
                reroutes: operation.retry.reroutes,
            },
            _ => DispatchError::Rejected {
                status: record.status,
                sub_status: record.sub_status,
                request_charge: record.request_charge,
            },
        }
    }
}

impl Settlement {
    fn submit(self, range_id: &RangeId, context: &DispatchContext, resubmitter: &Resubmitter) {
        for (delay, operations) in self.retries {
            debug!(
                range = %range_id,
                operations = operations.len(),
                delay = ?delay,
                "retrying throttled operations"
            );
            context
                .metrics
                .throttled_operations
                .add(operations.len() as u64, &[]);
            resubmitter.retry_after(delay, operations);
        }

        if !self.reroutes.is_empty() {
            debug!(
                range = %range_id,
                operations = self.reroutes.len(),
                "re-routing operations from stale range"
            );
            context
                .metrics
                .rerouted_operations
                .add(self.reroutes.len() as u64, &[]);
            resubmitter.reroute(range_id.clone(), self.reroutes);
        }
    }
}
