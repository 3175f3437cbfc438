use std::{
    sync::{Arc, Weak},
    time::Duration,
};

use dashmap::DashMap;
use snafu::ResultExt;
use tokio_util::{
    sync::{CancellationToken, DropGuard},
    task::TaskTracker,
};
use tracing::debug;

use crate::{
    batcher::DispatchMetrics,
    error::{DispatchError, Result, RoutingSnafu},
    operation::Operation,
    options::DispatchOptions,
    reply::{OperationHandle, OperationResult, QueuedOperation},
    retry::{DispatchRetryPolicy, RetryPolicy},
    routing::{RangeId, RangeResolver},
    streamer::Streamer,
    transaction::{self, TransactionalBatch, TransactionalBatchResponse},
    transport::BatchTransport,
};

/// Batches and dispatches item operations of a single container.
///
/// Operations are grouped by the partition range that owns their key. Each
/// range gets its own queue and concurrency limiter on first use, kept for
/// the lifetime of the executor.
///
/// Dropping the executor has the same effect as [`DispatchExecutor::close`]
/// without waiting for in-flight batches.
pub struct DispatchExecutor {
    inner: Arc<ExecutorInner>,
    _ct_guard: DropGuard,
}

/// Builds a [`DispatchExecutor`].
pub struct DispatchExecutorBuilder {
    resolver: Arc<dyn RangeResolver>,
    transport: Arc<dyn BatchTransport>,
    options: DispatchOptions,
    retry_policy: Option<Arc<dyn RetryPolicy>>,
}

/// State shared by the streamers and their dispatch tasks.
pub(crate) struct DispatchContext {
    pub options: DispatchOptions,
    pub transport: Arc<dyn BatchTransport>,
    pub retry_policy: Arc<dyn RetryPolicy>,
    pub metrics: DispatchMetrics,
}

/// The path back into the executor for operations that must be queued again.
///
/// Holds a weak reference so that in-flight batches do not keep a dropped
/// executor alive. Operations resubmitted after the executor is gone fail
/// with [`DispatchError::ExecutorClosed`].
#[derive(Clone)]
pub(crate) struct Resubmitter {
    inner: Weak<ExecutorInner>,
}

pub(crate) struct ExecutorInner {
    pub(crate) resolver: Arc<dyn RangeResolver>,
    pub(crate) context: Arc<DispatchContext>,
    streamers: DashMap<RangeId, Arc<Streamer>>,
    pub(crate) ct: CancellationToken,
    tracker: TaskTracker,
    this: Weak<ExecutorInner>,
}

impl DispatchExecutor {
    pub fn builder(
        resolver: Arc<dyn RangeResolver>,
        transport: Arc<dyn BatchTransport>,
    ) -> DispatchExecutorBuilder {
        DispatchExecutorBuilder {
            resolver,
            transport,
            options: DispatchOptions::default(),
            retry_policy: None,
        }
    }

    /// Create an executor with the default retry policy.
    pub fn new(
        resolver: Arc<dyn RangeResolver>,
        transport: Arc<dyn BatchTransport>,
        options: DispatchOptions,
    ) -> Result<Self> {
        Self::builder(resolver, transport)
            .with_options(options)
            .build()
    }

    /// Queue an operation for dispatch.
    ///
    /// Validation, materialization and range resolution happen before the
    /// operation is queued, and their errors are returned here. Every later
    /// outcome is delivered through the returned handle.
    pub async fn submit(&self, operation: Operation) -> Result<OperationHandle> {
        if self.inner.ct.is_cancelled() {
            return Err(DispatchError::ExecutorClosed);
        }

        operation.validate()?;
        operation.materialize()?;

        let range_id = self
            .inner
            .resolver
            .resolve_range(operation.partition_key())
            .await
            .context(RoutingSnafu {
                message: "failed to resolve partition range",
            })?;

        let (queued, handle) = QueuedOperation::new(operation);
        self.inner
            .streamer(range_id)
            .enqueue(queued)
            .map_err(|_| DispatchError::ExecutorClosed)?;

        self.inner.context.metrics.submitted_operations.add(1, &[]);

        Ok(handle)
    }

    /// Submit an operation and wait for its result.
    pub async fn execute(&self, operation: Operation) -> OperationResult {
        self.submit(operation).await?.await
    }

    /// Execute all operations of the batch atomically.
    ///
    /// The batch is sent as a single request that the server applies
    /// all-or-nothing, counting against the same per-range concurrency bound
    /// as regular batches.
    pub async fn execute_transactional_batch(
        &self,
        batch: TransactionalBatch,
    ) -> Result<TransactionalBatchResponse> {
        if self.inner.ct.is_cancelled() {
            return Err(DispatchError::ExecutorClosed);
        }

        transaction::execute(&self.inner, batch).await
    }

    /// The number of partition ranges operations were dispatched to.
    pub fn range_count(&self) -> usize {
        self.inner.streamers.len()
    }

    pub fn options(&self) -> &DispatchOptions {
        &self.inner.context.options
    }

    /// Stop the executor.
    ///
    /// Queued operations fail with [`DispatchError::ExecutorClosed`]. Batches
    /// already in flight are awaited and their results delivered.
    pub async fn close(&self) {
        debug!(ranges = self.inner.streamers.len(), "closing executor");
        self.inner.ct.cancel();
        self.inner.tracker.close();
        self.inner.tracker.wait().await;
    }
}

impl DispatchExecutorBuilder {
    pub fn with_options(mut self, options: DispatchOptions) -> Self {
        self.options = options;
        self
    }

    /// Replace the default throttling and stale-range retry policy.
    pub fn with_retry_policy(mut self, retry_policy: Arc<dyn RetryPolicy>) -> Self {
        self.retry_policy = Some(retry_policy);
        self
    }

    pub fn build(self) -> Result<DispatchExecutor> {
        self.options.validate()?;

        let retry_policy = self
            .retry_policy
            .unwrap_or_else(|| Arc::new(DispatchRetryPolicy::new(&self.options.retry)));

        let context = Arc::new(DispatchContext {
            options: self.options,
            transport: self.transport,
            retry_policy,
            metrics: DispatchMetrics::default(),
        });

        let ct = CancellationToken::new();
        let inner = Arc::new_cyclic(|this| ExecutorInner {
            resolver: self.resolver,
            context,
            streamers: DashMap::new(),
            ct: ct.clone(),
            tracker: TaskTracker::new(),
            this: this.clone(),
        });

        Ok(DispatchExecutor {
            inner,
            _ct_guard: ct.drop_guard(),
        })
    }
}

impl ExecutorInner {
    /// The streamer of `range_id`, created on first use.
    pub(crate) fn streamer(&self, range_id: RangeId) -> Arc<Streamer> {
        if let Some(streamer) = self.streamers.get(&range_id) {
            return streamer.clone();
        }

        self.streamers
            .entry(range_id.clone())
            .or_insert_with(|| {
                debug!(range = %range_id, "creating streamer");
                Arc::new(Streamer::spawn(
                    range_id.clone(),
                    self.context.clone(),
                    self.resubmitter(),
                    &self.tracker,
                    self.ct.child_token(),
                ))
            })
            .clone()
    }

    fn resubmitter(&self) -> Resubmitter {
        Resubmitter {
            inner: self.this.clone(),
        }
    }

    /// Resolve the operation's range again and queue it there.
    async fn route(&self, operation: QueuedOperation) {
        if operation.is_cancelled() {
            operation.fail(DispatchError::Cancelled);
            return;
        }

        let range_id = match self
            .resolver
            .resolve_range(operation.operation.partition_key())
            .await
        {
            Ok(range_id) => range_id,
            Err(source) => {
                operation.fail(DispatchError::Routing {
                    message: "failed to re-resolve partition range",
                    source,
                });
                return;
            }
        };

        if let Err(operation) = self.streamer(range_id).enqueue(operation) {
            operation.fail(DispatchError::ExecutorClosed);
        }
    }
}

#[cfg(test)]
impl Resubmitter {
    /// A resubmitter with no executor behind it. Scheduled operations fail
    /// with `ExecutorClosed`.
    pub(crate) fn detached() -> Self {
        Self { inner: Weak::new() }
    }
}

impl Resubmitter {
    /// Queue the operations again on the range that currently owns them.
    pub fn resubmit(&self, operations: Vec<QueuedOperation>) {
        self.schedule(operations, None, None);
    }

    /// Queue the operations again once `delay` has elapsed.
    pub fn retry_after(&self, delay: Duration, operations: Vec<QueuedOperation>) {
        self.schedule(operations, Some(delay), None);
    }

    /// Report `stale` to the resolver, then queue the operations again.
    pub fn reroute(&self, stale: RangeId, operations: Vec<QueuedOperation>) {
        self.schedule(operations, None, Some(stale));
    }

    fn schedule(
        &self,
        operations: Vec<QueuedOperation>,
        delay: Option<Duration>,
        stale: Option<RangeId>,
    ) {
        let Some(inner) = self.inner.upgrade() else {
            fail_all(operations, DispatchError::ExecutorClosed);
            return;
        };

        let ct = inner.ct.clone();
        let this = self.inner.clone();
        inner.tracker.spawn(async move {
            if let Some(delay) = delay {
                tokio::select! {
                    _ = ct.cancelled() => {
                        fail_all(operations, DispatchError::ExecutorClosed);
                        return;
                    }
                    _ = tokio::time::sleep(delay) => {}
                }
            }

            let Some(inner) = this.upgrade() else {
                fail_all(operations, DispatchError::ExecutorClosed);
                return;
            };

            if let Some(stale) = stale {
                inner.resolver.mark_stale(&stale).await;
            }

            for operation in operations {
                inner.route(operation).await;
            }
        });
    }
}

fn fail_all(operations: Vec<QueuedOperation>, error: DispatchError) {
    for operation in operations {
        operation.fail(error.clone());
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use http::StatusCode;
    use tokio::time::Instant;

    use super::*;
    use crate::{
        options::{PartitionTarget, RequestOptions, RetryOptions},
        partition::EffectivePartitionKey,
        response::{BatchResponse, OperationRecord, SubStatusCode},
        test_utils::{ScriptedTransport, SwitchingResolver, all_with_status},
        transport::TransportError,
    };

    fn executor(
        resolver: &Arc<SwitchingResolver>,
        transport: &Arc<ScriptedTransport>,
        options: DispatchOptions,
    ) -> DispatchExecutor {
        DispatchExecutor::new(resolver.clone(), transport.clone(), options).unwrap()
    }

    fn gone() -> BatchResponse {
        BatchResponse::failed(
            StatusCode::GONE,
            Some(SubStatusCode::PARTITION_KEY_RANGE_GONE),
        )
    }

    #[tokio::test]
    async fn test_reroute_changes_range() {
        tokio::time::pause();

        let resolver = Arc::new(SwitchingResolver::new(["r1", "r2"]));
        let transport = Arc::new(ScriptedTransport::new());
        transport.then_reply(Ok(gone()));
        let executor = executor(&resolver, &transport, DispatchOptions::default());

        let response = executor.execute(Operation::read("pk", "a")).await.unwrap();
        assert_eq!(response.status, StatusCode::OK);
        assert_eq!(response.retries, 1);

        let ranges: Vec<_> = transport
            .requests()
            .into_iter()
            .map(|request| request.range_id)
            .collect();
        assert_eq!(ranges, vec![RangeId::from("r1"), RangeId::from("r2")]);
        assert_eq!(resolver.stale(), vec![RangeId::from("r1")]);
        assert_eq!(executor.range_count(), 2);
    }

    #[tokio::test]
    async fn test_stale_range_reroutes_are_bounded() {
        tokio::time::pause();

        let resolver = Arc::new(SwitchingResolver::new(["r1"]));
        let transport = Arc::new(ScriptedTransport::new());
        for _ in 0..3 {
            transport.then_reply(Ok(gone()));
        }
        let options = DispatchOptions::default()
            .with_retry(RetryOptions::default().with_max_reroutes(2));
        let executor = executor(&resolver, &transport, options);

        let err = executor
            .execute(Operation::read("pk", "a"))
            .await
            .unwrap_err();
        assert!(matches!(err, DispatchError::StaleRange { reroutes: 2, .. }));
        assert_eq!(transport.requests().len(), 3);
    }

    #[tokio::test]
    async fn test_results_are_correlated_by_index() {
        tokio::time::pause();

        let resolver = Arc::new(SwitchingResolver::new(["r1"]));
        let transport = Arc::new(ScriptedTransport::new());
        transport.then(|_| {
            Ok(BatchResponse::new(
                StatusCode::MULTI_STATUS,
                vec![
                    OperationRecord::new(2, StatusCode::NOT_FOUND),
                    OperationRecord::new(0, StatusCode::CREATED).with_etag("e0"),
                    OperationRecord::new(1, StatusCode::CONFLICT),
                ],
            ))
        });
        let options = DispatchOptions::default().with_max_operation_count(3);
        let executor = executor(&resolver, &transport, options);

        let first = executor
            .submit(Operation::create("pk", serde_json::json!({"id": "a"})))
            .await
            .unwrap();
        let second = executor
            .submit(Operation::create("pk", serde_json::json!({"id": "b"})))
            .await
            .unwrap();
        let third = executor.submit(Operation::read("pk", "c")).await.unwrap();

        let first = first.await.unwrap();
        assert_eq!(first.status, StatusCode::CREATED);
        assert_eq!(first.etag.as_deref(), Some("e0"));
        assert!(matches!(
            second.await,
            Err(DispatchError::Rejected {
                status: StatusCode::CONFLICT,
                ..
            })
        ));
        assert!(matches!(
            third.await,
            Err(DispatchError::Rejected {
                status: StatusCode::NOT_FOUND,
                ..
            })
        ));
        assert_eq!(transport.requests().len(), 1);
    }

    #[tokio::test]
    async fn test_missing_result_is_internal_error() {
        tokio::time::pause();

        let resolver = Arc::new(SwitchingResolver::new(["r1"]));
        let transport = Arc::new(ScriptedTransport::new());
        transport.then(|_| {
            Ok(BatchResponse::new(
                StatusCode::MULTI_STATUS,
                vec![OperationRecord::new(0, StatusCode::OK)],
            ))
        });
        let options = DispatchOptions::default().with_max_operation_count(2);
        let executor = executor(&resolver, &transport, options);

        let first = executor.submit(Operation::read("pk", "a")).await.unwrap();
        let second = executor.submit(Operation::read("pk", "b")).await.unwrap();

        assert!(first.await.is_ok());
        assert!(matches!(second.await, Err(DispatchError::Internal { .. })));
    }

    #[tokio::test]
    async fn test_throttled_operation_is_retried_after_delay() {
        tokio::time::pause();

        let resolver = Arc::new(SwitchingResolver::new(["r1"]));
        let transport = Arc::new(ScriptedTransport::new());
        transport.then(|request| {
            let results = (0..request.operation_count)
                .map(|index| {
                    OperationRecord::new(index, StatusCode::TOO_MANY_REQUESTS)
                        .with_retry_after(Duration::from_millis(50))
                })
                .collect();
            Ok(BatchResponse::new(StatusCode::MULTI_STATUS, results))
        });
        let options = DispatchOptions::default().with_max_operation_count(1);
        let executor = executor(&resolver, &transport, options);

        let start = Instant::now();
        let response = executor.execute(Operation::read("pk", "a")).await.unwrap();

        assert_eq!(response.status, StatusCode::OK);
        assert_eq!(response.retries, 1);
        assert!(start.elapsed() >= Duration::from_millis(50));
        assert_eq!(transport.requests().len(), 2);
    }

    #[tokio::test]
    async fn test_batch_level_throttle_retries_every_operation() {
        tokio::time::pause();

        let resolver = Arc::new(SwitchingResolver::new(["r1"]));
        let transport = Arc::new(ScriptedTransport::new());
        transport.then_reply(Ok(BatchResponse::failed(
            StatusCode::TOO_MANY_REQUESTS,
            None,
        )
        .with_retry_after(Duration::from_millis(20))));
        let options = DispatchOptions::default().with_max_operation_count(2);
        let executor = executor(&resolver, &transport, options);

        let first = executor.submit(Operation::read("pk", "a")).await.unwrap();
        let second = executor.submit(Operation::read("pk", "b")).await.unwrap();

        assert_eq!(first.await.unwrap().retries, 1);
        assert_eq!(second.await.unwrap().retries, 1);
    }

    #[tokio::test]
    async fn test_batch_level_failure_fails_every_operation() {
        tokio::time::pause();

        let resolver = Arc::new(SwitchingResolver::new(["r1"]));
        let transport = Arc::new(ScriptedTransport::new());
        transport.then_reply(Ok(BatchResponse::failed(StatusCode::BAD_REQUEST, None)));
        transport.then_reply(Err(TransportError::ConnectionClosed));
        let options = DispatchOptions::default().with_max_operation_count(2);
        let executor = executor(&resolver, &transport, options);

        let first = executor.submit(Operation::read("pk", "a")).await.unwrap();
        let second = executor.submit(Operation::read("pk", "b")).await.unwrap();
        for handle in [first, second] {
            assert!(matches!(
                handle.await,
                Err(DispatchError::BatchRejected {
                    status: StatusCode::BAD_REQUEST,
                    ..
                })
            ));
        }

        let first = executor.submit(Operation::read("pk", "a")).await.unwrap();
        let second = executor.submit(Operation::read("pk", "b")).await.unwrap();
        for handle in [first, second] {
            let err = handle.await.unwrap_err();
            assert!(matches!(err, DispatchError::Transport { .. }));
            assert!(err.kind().is_retryable());
        }
    }

    #[tokio::test]
    async fn test_invalid_operations_are_rejected_before_queuing() {
        let resolver = Arc::new(SwitchingResolver::new(["r1"]));
        let transport = Arc::new(ScriptedTransport::new());
        let executor = executor(&resolver, &transport, DispatchOptions::default());

        let err = executor
            .submit(Operation::read("pk", ""))
            .await
            .unwrap_err();
        assert!(matches!(err, DispatchError::Validation { .. }));

        let err = executor
            .submit(Operation::read("pk", "a").with_request_options(RequestOptions {
                partition_target: Some(PartitionTarget::Effective(EffectivePartitionKey(
                    "0A1B".to_string(),
                ))),
                ..Default::default()
            }))
            .await
            .unwrap_err();
        assert!(matches!(err, DispatchError::Configuration { .. }));

        assert_eq!(executor.range_count(), 0);
        assert!(transport.requests().is_empty());
    }

    #[tokio::test]
    async fn test_cancelled_operation_is_never_sent() {
        tokio::time::pause();

        let resolver = Arc::new(SwitchingResolver::new(["r1"]));
        let transport = Arc::new(ScriptedTransport::new());
        let executor = executor(&resolver, &transport, DispatchOptions::default());

        let cancelled = executor.submit(Operation::read("pk", "a")).await.unwrap();
        let kept = executor.submit(Operation::read("pk", "b")).await.unwrap();
        cancelled.cancel();

        assert!(matches!(cancelled.await, Err(DispatchError::Cancelled)));
        assert!(kept.await.is_ok());

        let requests = transport.requests();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].operation_count, 1);
    }

    #[tokio::test]
    async fn test_close_fails_queued_operations() {
        tokio::time::pause();

        let resolver = Arc::new(SwitchingResolver::new(["r1"]));
        let transport = Arc::new(ScriptedTransport::new());
        let options = DispatchOptions::default().with_flush_interval(Duration::from_secs(3600));
        let executor = executor(&resolver, &transport, options);

        let handle = executor.submit(Operation::read("pk", "a")).await.unwrap();
        executor.close().await;

        assert!(matches!(handle.await, Err(DispatchError::ExecutorClosed)));
        assert!(matches!(
            executor.submit(Operation::read("pk", "b")).await,
            Err(DispatchError::ExecutorClosed)
        ));
        assert!(transport.requests().is_empty());
    }

    #[tokio::test]
    async fn test_operations_are_dispatched_on_flush() {
        tokio::time::pause();

        let resolver = Arc::new(SwitchingResolver::new(["r1"]));
        let transport = Arc::new(ScriptedTransport::new());
        transport.then(|request| Ok(all_with_status(request, StatusCode::OK)));
        let executor = executor(&resolver, &transport, DispatchOptions::default());

        let handles = [
            executor.submit(Operation::read("pk", "a")).await.unwrap(),
            executor.submit(Operation::read("pk", "b")).await.unwrap(),
            executor.submit(Operation::read("pk", "c")).await.unwrap(),
        ];

        let start = Instant::now();
        for handle in handles {
            handle.await.unwrap();
        }

        assert!(start.elapsed() >= Duration::from_millis(90));
        let requests = transport.requests();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].operation_count, 3);
    }
}
