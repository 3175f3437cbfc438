//! All-or-nothing batches within a single logical partition.
use http::StatusCode;
use serde::Serialize;
use snafu::ResultExt;
use tracing::debug;

use crate::{
    error::{DispatchError, Result, RoutingSnafu, ValidationSnafu},
    executor::ExecutorInner,
    operation::Operation,
    options::DispatchOptions,
    partition::PartitionKey,
    reply::RetryState,
    response::{BatchResponse, OperationOutcome, OperationRecord, SubStatusCode},
    retry::{RetryDecision, RetryInput},
    transport::BatchRequest,
    wire,
};

/// Operations on items of one logical partition, applied atomically.
#[derive(Debug)]
pub struct TransactionalBatch {
    partition_key: PartitionKey,
    operations: Vec<Operation>,
}

/// The result of a transactional batch.
///
/// When the batch fails, the operation that caused the failure reports its
/// own status and the others report `424 Failed Dependency`.
#[derive(Debug, Clone, PartialEq)]
pub struct TransactionalBatchResponse {
    pub status: StatusCode,
    pub sub_status: Option<SubStatusCode>,
    pub request_charge: f64,
    pub activity_id: Option<String>,
    /// How many times the batch was retried or re-routed.
    pub retries: u32,
    results: Vec<OperationRecord>,
}

impl TransactionalBatch {
    pub fn new(partition_key: impl Into<PartitionKey>) -> Self {
        Self {
            partition_key: partition_key.into(),
            operations: Vec::new(),
        }
    }

    pub fn create_item<T>(self, resource: T) -> Self
    where
        T: Serialize + Send + Sync + 'static,
    {
        let operation = Operation::create(self.partition_key.clone(), resource);
        self.add(operation)
    }

    pub fn upsert_item<T>(self, resource: T) -> Self
    where
        T: Serialize + Send + Sync + 'static,
    {
        let operation = Operation::upsert(self.partition_key.clone(), resource);
        self.add(operation)
    }

    pub fn replace_item<T>(self, id: impl Into<String>, resource: T) -> Self
    where
        T: Serialize + Send + Sync + 'static,
    {
        let operation = Operation::replace(self.partition_key.clone(), id, resource);
        self.add(operation)
    }

    pub fn patch_item<T>(self, id: impl Into<String>, patch: T) -> Self
    where
        T: Serialize + Send + Sync + 'static,
    {
        let operation = Operation::patch(self.partition_key.clone(), id, patch);
        self.add(operation)
    }

    pub fn read_item(self, id: impl Into<String>) -> Self {
        let operation = Operation::read(self.partition_key.clone(), id);
        self.add(operation)
    }

    pub fn delete_item(self, id: impl Into<String>) -> Self {
        let operation = Operation::delete(self.partition_key.clone(), id);
        self.add(operation)
    }

    /// Add a prepared operation, for example one with an `if-match` condition.
    pub fn add(mut self, operation: Operation) -> Self {
        self.operations.push(operation);
        self
    }

    pub fn partition_key(&self) -> &PartitionKey {
        &self.partition_key
    }

    pub fn operations(&self) -> &[Operation] {
        &self.operations
    }

    pub fn len(&self) -> usize {
        self.operations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.operations.is_empty()
    }

    /// Check the batch can be sent as a single request.
    pub fn validate(&self, options: &DispatchOptions) -> Result<()> {
        if self.operations.is_empty() {
            return ValidationSnafu {
                message: "transactional batch has no operations".to_string(),
            }
            .fail();
        }

        if self.operations.len() > options.max_operation_count {
            return ValidationSnafu {
                message: format!(
                    "transactional batch has {} operations, more than the maximum of {}",
                    self.operations.len(),
                    options.max_operation_count
                ),
            }
            .fail();
        }

        let mut size = 0;
        for operation in &self.operations {
            if operation.partition_key() != &self.partition_key {
                return ValidationSnafu {
                    message: format!(
                        "operation partition key {} does not match batch partition key {}",
                        operation.partition_key(),
                        self.partition_key
                    ),
                }
                .fail();
            }

            operation.validate()?;
            size += operation.approximate_size()?;
        }

        if size > options.max_body_bytes() {
            return ValidationSnafu {
                message: format!(
                    "transactional batch is {size} bytes, more than the maximum of {}",
                    options.max_body_size
                ),
            }
            .fail();
        }

        Ok(())
    }
}

impl TransactionalBatchResponse {
    fn new(response: BatchResponse, operation_count: usize, retries: u32) -> Result<Self> {
        let status = response.status;
        let sub_status = response.sub_status;
        let request_charge = response.request_charge;
        let activity_id = response.activity_id.clone();

        let mut results = Vec::with_capacity(operation_count);
        for (index, slot) in response.correlate(operation_count).into_iter().enumerate() {
            let Some(record) = slot else {
                return Err(DispatchError::Internal {
                    message: format!("missing result for transactional operation at index {index}"),
                });
            };
            results.push(record);
        }

        Ok(Self {
            status,
            sub_status,
            request_charge,
            activity_id,
            retries,
            results,
        })
    }

    /// Whether the batch was committed.
    pub fn is_success(&self) -> bool {
        self.status.is_success()
    }

    /// Per-operation results, ordered like the operations of the batch.
    pub fn results(&self) -> &[OperationRecord] {
        &self.results
    }

    pub fn get(&self, index: usize) -> Option<&OperationRecord> {
        self.results.get(index)
    }

    /// The first operation that caused the batch to fail.
    pub fn first_failure(&self) -> Option<&OperationRecord> {
        self.results
            .iter()
            .find(|record| record.outcome() == OperationOutcome::Failed)
    }

    pub fn len(&self) -> usize {
        self.results.len()
    }

    pub fn is_empty(&self) -> bool {
        self.results.is_empty()
    }
}

/// Send the batch, retrying it as a whole on throttling and stale ranges.
pub(crate) async fn execute(
    inner: &ExecutorInner,
    batch: TransactionalBatch,
) -> Result<TransactionalBatchResponse> {
    let context = &inner.context;
    batch.validate(&context.options)?;

    let mut materialized = Vec::with_capacity(batch.len());
    for operation in batch.operations() {
        materialized.push(operation.materialize()?);
    }
    let size: usize = materialized.iter().map(|m| m.approximate_size).sum();
    let body = wire::encode_body(batch.operations().iter().zip(materialized), size);

    let mut retry = RetryState::default();

    loop {
        let range_id = inner
            .resolver
            .resolve_range(batch.partition_key())
            .await
            .context(RoutingSnafu {
                message: "failed to resolve partition range",
            })?;

        let limiter = inner.streamer(range_id.clone()).limiter();
        let permit = tokio::select! {
            _ = inner.ct.cancelled() => return Err(DispatchError::ExecutorClosed),
            permit = limiter.acquire_owned() => {
                permit.map_err(|_| DispatchError::ExecutorClosed)?
            }
        };

        let request = BatchRequest {
            range_id: range_id.clone(),
            partition_key: Some(batch.partition_key().clone()),
            atomic: true,
            operation_count: batch.len(),
            body: body.clone(),
        };

        context.metrics.record_batch(request.body.len(), true);
        debug!(
            range = %range_id,
            operations = batch.len(),
            "dispatching transactional batch"
        );

        let result = context.transport.send(&range_id, request).await;
        drop(permit);

        let response = result.map_err(|source| DispatchError::Transport {
            range_id: range_id.clone(),
            source,
        })?;

        let retries = retry.throttle_attempts + retry.reroutes;
        if response.is_success() {
            return TransactionalBatchResponse::new(response, batch.len(), retries);
        }

        let input = RetryInput {
            status: response.status,
            sub_status: response.sub_status,
            retry_after: response.retry_after,
            attempt_count: retry.throttle_attempts,
            waited: retry.waited,
            reroute_count: retry.reroutes,
        };

        match context.retry_policy.evaluate(&input) {
            RetryDecision::RetryAfter(delay) => {
                debug!(range = %range_id, delay = ?delay, "transactional batch throttled");
                retry.throttle_attempts += 1;
                retry.waited = retry.waited.saturating_add(delay);
                context.metrics.throttled_operations.add(batch.len() as u64, &[]);

                tokio::select! {
                    _ = inner.ct.cancelled() => return Err(DispatchError::ExecutorClosed),
                    _ = tokio::time::sleep(delay) => {}
                }
            }
            RetryDecision::Reroute => {
                debug!(range = %range_id, "transactional batch hit a stale range");
                retry.reroutes += 1;
                context.metrics.rerouted_operations.add(batch.len() as u64, &[]);
                inner.resolver.mark_stale(&range_id).await;
            }
            RetryDecision::Complete => {
                return match response.outcome() {
                    OperationOutcome::Throttled => Err(DispatchError::Throttled {
                        status: response.status,
                        sub_status: response.sub_status,
                        attempts: retry.throttle_attempts,
                    }),
                    OperationOutcome::StaleRange => Err(DispatchError::StaleRange {
                        range_id,
                        reroutes: retry.reroutes,
                    }),
                    _ if response.results.is_empty() => Err(DispatchError::BatchRejected {
                        status: response.status,
                        sub_status: response.sub_status,
                    }),
                    _ => TransactionalBatchResponse::new(response, batch.len(), retries),
                };
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use bytesize::ByteSize;

    use super::*;

    #[test]
    fn test_validate_transactional_batch() {
        let options = DispatchOptions::default();

        let err = TransactionalBatch::new("pk").validate(&options).unwrap_err();
        assert!(matches!(err, DispatchError::Validation { .. }));

        let batch = TransactionalBatch::new("pk")
            .create_item(serde_json::json!({"id": "a"}))
            .read_item("b")
            .add(Operation::delete("other", "c"));
        let err = batch.validate(&options).unwrap_err();
        assert!(matches!(err, DispatchError::Validation { .. }));

        let batch = TransactionalBatch::new("pk")
            .create_item(serde_json::json!({"id": "a"}))
            .patch_item("b", serde_json::json!([{"op": "add", "path": "/x", "value": 1}]))
            .delete_item("c");
        batch.validate(&options).unwrap();
        assert_eq!(batch.len(), 3);
    }

    #[test]
    fn test_transactional_batch_must_fit_bounds() {
        let batch = TransactionalBatch::new("pk")
            .read_item("a")
            .read_item("b")
            .read_item("c");
        let options = DispatchOptions::default().with_max_operation_count(2);
        assert!(batch.validate(&options).is_err());

        let batch = TransactionalBatch::new("pk").upsert_item(serde_json::json!({
            "id": "a",
            "blob": "x".repeat(2048),
        }));
        let options = DispatchOptions::default().with_max_body_size(ByteSize::kib(1));
        assert!(batch.validate(&options).is_err());
    }

    #[test]
    fn test_response_orders_results_by_index() {
        let response = BatchResponse::new(
            StatusCode::PRECONDITION_FAILED,
            vec![
                OperationRecord::new(2, StatusCode::FAILED_DEPENDENCY),
                OperationRecord::new(0, StatusCode::FAILED_DEPENDENCY),
                OperationRecord::new(1, StatusCode::PRECONDITION_FAILED),
            ],
        );

        let response = TransactionalBatchResponse::new(response, 3, 0).unwrap();
        assert!(!response.is_success());
        assert_eq!(response.get(0).unwrap().status, StatusCode::FAILED_DEPENDENCY);
        assert_eq!(response.first_failure().map(|r| r.index), Some(1));
    }
}
