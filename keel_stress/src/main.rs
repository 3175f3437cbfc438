use std::{process::ExitCode, sync::Arc, time::Duration};

use bytesize::ByteSize;
use clap::{Args, Parser};
use futures::future::join_all;
use keel_dispatch_core::{
    DispatchExecutor, DispatchOptions, InMemoryStore, RetryOptions, ThrottleRetryOptions,
};
use keel_observability::{MetricsExporter, init_observability};
use snafu::ResultExt;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::{
    error::{ExecutorSnafu, JoinSnafu, ObservabilitySnafu, Result, UnexpectedFailuresSnafu},
    generators::{OperationGenerator, Workload},
    helpers::SizeRange,
    report::Report,
    run::{ClientConfig, run_client, split_ranges},
};

mod error;
mod generators;
mod helpers;
mod report;
mod run;

#[derive(Parser)]
#[command(name = "keel-stress")]
#[command(about = "Keel dispatch stress testing CLI")]
#[command(version)]
struct Cli {
    /// Number of partition ranges in the in-memory store.
    #[arg(long, default_value = "4")]
    ranges: usize,
    /// Number of distinct partition keys.
    #[arg(long, default_value = "64")]
    partition_keys: u64,
    /// Number of concurrent clients.
    #[arg(long, default_value = "8")]
    clients: u64,
    /// Operations submitted by each client.
    #[arg(long, default_value = "1000")]
    operations: usize,
    /// Operations each client keeps in flight.
    #[arg(long, default_value = "64")]
    pipeline: usize,
    /// The mix of operation kinds.
    #[arg(long, value_enum, default_value = "mixed")]
    workload: Workload,
    /// Size of the random data in each payload.
    ///
    /// Either provide a size (e.g. 512B) or a range (e.g. 64B-2KiB).
    #[arg(long, default_value = "64B-1KiB")]
    payload_size: SizeRange,
    /// Send one transactional batch every N operations. 0 disables them.
    #[arg(long, default_value = "0")]
    transactional_every: usize,
    /// Number of creates in each transactional batch.
    #[arg(long, default_value = "5")]
    transactional_size: usize,
    /// Seed for the operation generators.
    #[arg(long, default_value = "0")]
    seed: u64,
    #[clap(flatten)]
    store: StoreArgs,
    #[clap(flatten)]
    dispatch: DispatchArgs,
}

/// Fault injection in the in-memory store.
#[derive(Args, Debug, Clone)]
struct StoreArgs {
    /// Simulated latency of every batch request, in milliseconds.
    #[arg(long, default_value = "2")]
    latency_ms: u64,
    /// Throttle this many requests at the start of the run.
    #[arg(long, default_value = "0")]
    throttled_requests: usize,
    /// The retry-after delay sent with throttled responses, in milliseconds.
    #[arg(long, default_value = "10")]
    retry_after_ms: u64,
    /// Split every range once, this many milliseconds into the run.
    #[arg(long)]
    split_after_ms: Option<u64>,
}

/// Executor options.
#[derive(Args, Debug, Clone)]
struct DispatchArgs {
    /// The maximum number of operations in a batch.
    #[arg(long, default_value = "100")]
    max_operation_count: usize,
    /// The maximum packed size of a batch.
    #[arg(long, default_value = "220KiB")]
    max_body_size: ByteSize,
    /// The maximum number of in-flight batches per range.
    #[arg(long, default_value = "1")]
    max_concurrency_per_range: usize,
    /// Flush partially filled queues at this interval, in milliseconds.
    #[arg(long, default_value = "100")]
    flush_interval_ms: u64,
    /// Shrink batches on throttled ranges.
    #[arg(long)]
    adaptive_batch_size: bool,
    /// The maximum number of retries of a throttled operation.
    #[arg(long, default_value = "9")]
    max_throttle_attempts: u32,
    /// The maximum number of re-routes after a stale range.
    #[arg(long, default_value = "3")]
    max_reroutes: u32,
}

impl DispatchArgs {
    fn options(&self) -> DispatchOptions {
        let retry = RetryOptions::default()
            .with_max_reroutes(self.max_reroutes)
            .with_throttle(
                ThrottleRetryOptions::default().with_max_attempts(self.max_throttle_attempts),
            );

        DispatchOptions::default()
            .with_max_operation_count(self.max_operation_count)
            .with_max_body_size(self.max_body_size)
            .with_max_concurrency_per_range(self.max_concurrency_per_range)
            .with_flush_interval(Duration::from_millis(self.flush_interval_ms))
            .with_adaptive_batch_size(self.adaptive_batch_size)
            .with_retry(retry)
    }
}

impl StoreArgs {
    fn store(&self, ranges: usize) -> InMemoryStore {
        let store = InMemoryStore::new(ranges);
        store.set_latency(Duration::from_millis(self.latency_ms));
        if self.throttled_requests > 0 {
            store.throttle_next(
                self.throttled_requests,
                Duration::from_millis(self.retry_after_ms),
            );
        }
        store
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    match run(Cli::parse()).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            let code = err.exit_code();
            eprintln!("Error: {}", snafu::Report::from_error(err));
            ExitCode::from(code)
        }
    }
}

async fn run(cli: Cli) -> Result<()> {

    let metrics = MetricsExporter::default();
    init_observability(
        env!("CARGO_PKG_NAME"),
        env!("CARGO_PKG_VERSION"),
        metrics.clone(),
    )
    .context(ObservabilitySnafu {})?;

    let ct = CancellationToken::new();

    tokio::spawn({
        let ct = ct.clone();
        async move {
            let _ = tokio::signal::ctrl_c().await;
            ct.cancel();
        }
    });

    let options = cli.dispatch.options();
    let store = cli.store.store(cli.ranges);
    let backend = Arc::new(store.clone());
    let executor = Arc::new(
        DispatchExecutor::new(backend.clone(), backend, options.clone())
            .context(ExecutorSnafu {})?,
    );

    info!(
        ranges = cli.ranges,
        clients = cli.clients,
        operations = cli.operations,
        workload = ?cli.workload,
        payload_size = %cli.payload_size,
        max_operation_count = options.max_operation_count,
        max_body_size = %options.max_body_size,
        max_concurrency_per_range = options.max_concurrency_per_range,
        "running stress test"
    );

    let splitter = cli.store.split_after_ms.map(|delay| {
        tokio::spawn(split_ranges(
            store.clone(),
            Duration::from_millis(delay),
            ct.clone(),
        ))
    });

    let config = ClientConfig {
        operations: cli.operations,
        pipeline: cli.pipeline,
        transactional_every: cli.transactional_every,
        transactional_size: cli.transactional_size,
    };
    let report = Arc::new(Report::default());
    let start = Instant::now();

    let clients = (0..cli.clients).map(|client_id| {
        let generator = OperationGenerator::new(
            client_id,
            cli.seed,
            cli.partition_keys,
            cli.payload_size,
            cli.workload,
        );
        tokio::spawn(run_client(
            client_id,
            executor.clone(),
            generator,
            config,
            report.clone(),
            ct.clone(),
        ))
    });

    for result in join_all(clients).await {
        result.context(JoinSnafu {})??;
    }

    // The run is over, so a pending split is no longer interesting.
    ct.cancel();
    if let Some(splitter) = splitter {
        splitter.await.context(JoinSnafu {})??;
    }

    executor.close().await;

    report.print(start.elapsed());
    print_metrics(&metrics);

    let failures = report.failures();
    if failures > 0 {
        return UnexpectedFailuresSnafu { count: failures }.fail();
    }

    Ok(())
}

fn print_metrics(metrics: &MetricsExporter) {
    let samples = match metrics.snapshot() {
        Ok(samples) => samples,
        Err(err) => {
            tracing::warn!(error = %err, "failed to collect metrics");
            return;
        }
    };

    println!("Metrics");
    for sample in samples
        .iter()
        .filter(|sample| sample.name.starts_with("client.dispatch"))
    {
        let attributes = sample
            .attributes
            .iter()
            .map(|(key, value)| format!("{key}={value}"))
            .collect::<Vec<_>>()
            .join(",");
        println!("  {:<40} {:<24} {}", sample.name, attributes, sample.value);
    }
}
