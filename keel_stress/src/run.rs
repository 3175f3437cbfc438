use std::{sync::Arc, time::Duration};

use futures::{StreamExt, stream::FuturesUnordered};
use keel_dispatch_core::{DispatchExecutor, InMemoryStore};
use snafu::ResultExt;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::{
    error::{Result, SplitSnafu, SubmitSnafu},
    generators::OperationGenerator,
    report::Report,
};

/// Per-client workload settings.
#[derive(Debug, Clone, Copy)]
pub struct ClientConfig {
    pub operations: usize,
    /// Operations awaited concurrently by one client.
    pub pipeline: usize,
    /// Send one transactional batch every this many operations; 0 disables.
    pub transactional_every: usize,
    pub transactional_size: usize,
}

pub async fn run_client(
    client_id: u64,
    executor: Arc<DispatchExecutor>,
    mut generator: OperationGenerator,
    config: ClientConfig,
    report: Arc<Report>,
    ct: CancellationToken,
) -> Result<()> {
    let mut in_flight = FuturesUnordered::new();

    for i in 0..config.operations {
        if ct.is_cancelled() {
            break;
        }

        let every = config.transactional_every;
        if every > 0 && i % every == every - 1 {
            let batch = generator.transactional_batch(config.transactional_size);
            let started = Instant::now();
            let result = executor.execute_transactional_batch(batch).await;
            report.record_transaction(&result, started.elapsed());
            continue;
        }

        let operation = generator.next_operation();
        let kind = operation.kind();
        let started = Instant::now();
        let handle = executor.submit(operation).await.context(SubmitSnafu {})?;

        in_flight.push(async move {
            let result = handle.await;
            (kind, result, started.elapsed())
        });

        if in_flight.len() >= config.pipeline.max(1) {
            if let Some((kind, result, elapsed)) = in_flight.next().await {
                report.record(kind, &result, elapsed);
            }
        }
    }

    while let Some((kind, result, elapsed)) = in_flight.next().await {
        report.record(kind, &result, elapsed);
    }

    debug!(client_id, "client finished");

    Ok(())
}

/// Split every range of the store once, after `delay`.
pub async fn split_ranges(
    store: InMemoryStore,
    delay: Duration,
    ct: CancellationToken,
) -> Result<()> {
    tokio::select! {
        _ = ct.cancelled() => return Ok(()),
        _ = tokio::time::sleep(delay) => {}
    }

    for range_id in store.range_ids() {
        let (left, right) = store.split(&range_id).context(SplitSnafu {
            range_id: range_id.clone(),
        })?;
        info!(range = %range_id, %left, %right, "split range");
    }

    Ok(())
}
