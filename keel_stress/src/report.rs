//! Outcome and latency accounting for a stress run.
use std::{collections::BTreeMap, time::Duration};

use keel_dispatch_core::{
    ErrorKind, OperationKind, OperationResult, Result as DispatchResult,
    TransactionalBatchResponse,
};
use parking_lot::Mutex;
use tracing::warn;

#[derive(Debug, Default)]
pub struct Report {
    inner: Mutex<Counts>,
}

#[derive(Debug, Default)]
struct Counts {
    by_kind: BTreeMap<&'static str, KindCounts>,
    failures: BTreeMap<String, u64>,
    retries: u64,
    transactions_committed: u64,
    transactions_aborted: u64,
    latencies: Vec<Duration>,
}

#[derive(Debug, Default, Clone, Copy)]
struct KindCounts {
    succeeded: u64,
    /// Refused by the store, e.g. a read of an item deleted concurrently.
    rejected: u64,
}

/// Latency percentiles over all recorded operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Latencies {
    pub p50: Duration,
    pub p99: Duration,
    pub max: Duration,
}

impl Report {
    pub fn record(&self, kind: OperationKind, result: &OperationResult, elapsed: Duration) {
        let mut counts = self.inner.lock();
        counts.latencies.push(elapsed);

        let entry = counts.by_kind.entry(kind_name(kind)).or_default();
        match result {
            Ok(response) => {
                entry.succeeded += 1;
                counts.retries += u64::from(response.retries);
            }
            Err(err) if err.kind() == ErrorKind::Rejected => entry.rejected += 1,
            Err(err) => {
                warn!(kind = kind_name(kind), error = %err, "operation failed");
                *counts.failures.entry(format!("{:?}", err.kind())).or_default() += 1;
            }
        }
    }

    pub fn record_transaction(
        &self,
        result: &DispatchResult<TransactionalBatchResponse>,
        elapsed: Duration,
    ) {
        let mut counts = self.inner.lock();
        counts.latencies.push(elapsed);

        match result {
            Ok(response) if response.is_success() => {
                counts.transactions_committed += 1;
                counts.retries += u64::from(response.retries);
            }
            Ok(_) => counts.transactions_aborted += 1,
            Err(err) => {
                warn!(error = %err, "transactional batch failed");
                *counts.failures.entry(format!("{:?}", err.kind())).or_default() += 1;
            }
        }
    }

    /// Operations that failed for a reason other than a store rejection.
    pub fn failures(&self) -> u64 {
        self.inner.lock().failures.values().sum()
    }

    pub fn completed(&self) -> u64 {
        let counts = self.inner.lock();
        let operations: u64 = counts
            .by_kind
            .values()
            .map(|kind| kind.succeeded + kind.rejected)
            .sum();
        operations
            + counts.transactions_committed
            + counts.transactions_aborted
            + counts.failures.values().sum::<u64>()
    }

    pub fn latencies(&self) -> Option<Latencies> {
        let mut latencies = self.inner.lock().latencies.clone();
        if latencies.is_empty() {
            return None;
        }

        latencies.sort_unstable();
        Some(Latencies {
            p50: percentile(&latencies, 50),
            p99: percentile(&latencies, 99),
            max: latencies[latencies.len() - 1],
        })
    }

    pub fn print(&self, elapsed: Duration) {
        let completed = self.completed();
        let throughput = completed as f64 / elapsed.as_secs_f64().max(f64::EPSILON);

        println!("Completed {completed} operations in {elapsed:.2?} ({throughput:.0} op/s)");

        let counts = self.inner.lock();
        for (kind, kind_counts) in &counts.by_kind {
            println!(
                "  {kind:<8} succeeded {:<8} rejected {}",
                kind_counts.succeeded, kind_counts.rejected
            );
        }
        if counts.transactions_committed + counts.transactions_aborted > 0 {
            println!(
                "  batches  committed {:<8} aborted  {}",
                counts.transactions_committed, counts.transactions_aborted
            );
        }
        println!("  retries  {}", counts.retries);
        for (kind, count) in &counts.failures {
            println!("  failed   {kind:<8} {count}");
        }
        drop(counts);

        if let Some(latencies) = self.latencies() {
            println!(
                "  latency  p50 {:.2?} p99 {:.2?} max {:.2?}",
                latencies.p50, latencies.p99, latencies.max
            );
        }
    }
}

fn kind_name(kind: OperationKind) -> &'static str {
    match kind {
        OperationKind::Create => "create",
        OperationKind::Read => "read",
        OperationKind::Replace => "replace",
        OperationKind::Upsert => "upsert",
        OperationKind::Delete => "delete",
        OperationKind::Patch => "patch",
    }
}

/// Nearest-rank percentile of a sorted, non-empty slice.
fn percentile(sorted: &[Duration], pct: usize) -> Duration {
    let rank = (sorted.len() * pct).div_ceil(100).max(1);
    sorted[rank - 1]
}

#[cfg(test)]
mod tests {
    use http::StatusCode;
    use keel_dispatch_core::{DispatchError, OperationResponse};

    use super::*;

    fn ok() -> OperationResult {
        Ok(OperationResponse {
            status: StatusCode::OK,
            etag: None,
            request_charge: 1.0,
            resource: None,
            retries: 2,
        })
    }

    #[test]
    fn test_rejections_are_not_failures() {
        let report = Report::default();
        let ms = Duration::from_millis;

        report.record(OperationKind::Read, &ok(), ms(1));
        report.record(
            OperationKind::Read,
            &Err(DispatchError::Rejected {
                status: StatusCode::NOT_FOUND,
                sub_status: None,
                request_charge: 1.0,
            }),
            ms(2),
        );
        report.record(OperationKind::Create, &Err(DispatchError::Cancelled), ms(3));

        assert_eq!(report.completed(), 3);
        assert_eq!(report.failures(), 1);
        assert_eq!(report.inner.lock().retries, 2);
    }

    #[test]
    fn test_percentile() {
        let sorted: Vec<_> = (1..=100).map(Duration::from_millis).collect();
        assert_eq!(percentile(&sorted, 50), Duration::from_millis(50));
        assert_eq!(percentile(&sorted, 99), Duration::from_millis(99));
        assert_eq!(percentile(&sorted[..1], 99), Duration::from_millis(1));
    }
}
