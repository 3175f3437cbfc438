//! Per-range queueing and micro-batching.
//!
//! Every partition range gets one streamer. Operations are queued without
//! blocking and drained into batchers when the queue is long enough or when
//! the flush timer fires. A drain only forms a batcher once it holds a
//! permit of the range's concurrency limiter, so the number of in-flight
//! batches never exceeds the configured bound.
use std::{collections::VecDeque, sync::Arc};

use tokio::{
    sync::{Semaphore, mpsc},
    time::{Instant, MissedTickBehavior},
};
use tokio_util::{sync::CancellationToken, task::TaskTracker};
use tracing::{debug, trace};

use crate::{
    batcher::Batcher,
    error::DispatchError,
    executor::{DispatchContext, Resubmitter},
    reply::QueuedOperation,
    routing::RangeId,
    thresholds::BatchSizeThresholds,
};

pub(crate) struct Streamer {
    tx: mpsc::UnboundedSender<QueuedOperation>,
    limiter: Arc<Semaphore>,
}

struct StreamerTask {
    range_id: RangeId,
    rx: mpsc::UnboundedReceiver<QueuedOperation>,
    pending: VecDeque<QueuedOperation>,
    limiter: Arc<Semaphore>,
    thresholds: Arc<BatchSizeThresholds>,
    context: Arc<DispatchContext>,
    resubmitter: Resubmitter,
    tracker: TaskTracker,
}

impl Streamer {
    /// Creates the streamer for `range_id` and spawns its task.
    ///
    /// The task stops when `ct` is cancelled, failing any operation still
    /// queued with [`DispatchError::ExecutorClosed`].
    pub fn spawn(
        range_id: RangeId,
        context: Arc<DispatchContext>,
        resubmitter: Resubmitter,
        tracker: &TaskTracker,
        ct: CancellationToken,
    ) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let limiter = Arc::new(Semaphore::new(
            context.options.max_concurrency_per_range.max(1),
        ));
        let thresholds = Arc::new(BatchSizeThresholds::new(
            context.options.max_operation_count,
            context.options.adaptive_batch_size,
        ));

        let task = StreamerTask {
            range_id,
            rx,
            pending: VecDeque::new(),
            limiter: limiter.clone(),
            thresholds,
            context,
            resubmitter,
            tracker: tracker.clone(),
        };
        tracker.spawn(task.run(ct));

        Self { tx, limiter }
    }

    /// Queues the operation. Never blocks.
    ///
    /// Gives the operation back if the streamer has stopped.
    pub fn enqueue(&self, operation: QueuedOperation) -> Result<(), QueuedOperation> {
        self.tx.send(operation).map_err(|err| err.0)
    }

    /// The range's concurrency limiter.
    pub fn limiter(&self) -> Arc<Semaphore> {
        self.limiter.clone()
    }
}

impl StreamerTask {
    async fn run(mut self, ct: CancellationToken) {
        let flush_interval = self.context.options.flush_interval;
        let mut interval =
            tokio::time::interval_at(Instant::now() + flush_interval, flush_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        debug!(range = %self.range_id, "streamer started");

        loop {
            tokio::select! {
                biased;
                _ = ct.cancelled() => break,
                operation = self.rx.recv() => {
                    let Some(operation) = operation else {
                        break;
                    };

                    self.pending.push_back(operation);
                    if self.pending.len() >= self.thresholds.target() {
                        self.drain();
                    }
                }
                _ = interval.tick() => self.drain(),
            }
        }

        self.shutdown();
    }

    /// Forms and dispatches batchers while operations and permits remain.
    fn drain(&mut self) {
        loop {
            if self.pending.is_empty() {
                return;
            }

            let Ok(permit) = self.limiter.clone().try_acquire_owned() else {
                trace!(
                    range = %self.range_id,
                    pending = self.pending.len(),
                    "no dispatch permit available, deferring drain"
                );
                return;
            };

            let batcher = Batcher::new(
                self.range_id.clone(),
                self.thresholds.target(),
                self.context.options.max_body_bytes(),
            );

            while let Some(operation) = self.pending.pop_front() {
                if operation.is_cancelled() {
                    operation.fail(DispatchError::Cancelled);
                    continue;
                }

                if let Err(operation) = batcher.try_add(operation) {
                    self.pending.push_front(operation);
                    break;
                }
            }

            if batcher.is_empty() {
                return;
            }

            let context = self.context.clone();
            let resubmitter = self.resubmitter.clone();
            let thresholds = self.thresholds.clone();
            self.tracker.spawn(async move {
                let summary = batcher.dispatch(&context, &resubmitter, permit).await;
                if summary.operations > 0 {
                    thresholds.record(summary.throttled > 0);
                }
            });
        }
    }

    fn shutdown(mut self) {
        self.rx.close();
        while let Ok(operation) = self.rx.try_recv() {
            self.pending.push_back(operation);
        }

        debug!(
            range = %self.range_id,
            pending = self.pending.len(),
            "streamer stopped"
        );

        for operation in self.pending.drain(..) {
            operation.fail(DispatchError::ExecutorClosed);
        }
    }
}
