use keel_observability::{Counter, KeyValue};

use crate::response::OperationOutcome;

pub struct DispatchMetrics {
    pub submitted_operations: Counter<u64>,
    pub completed_operations: Counter<u64>,
    pub dispatched_batches: Counter<u64>,
    pub throttled_operations: Counter<u64>,
    pub rerouted_operations: Counter<u64>,
    pub packed_bytes: Counter<u64>,
}

impl DispatchMetrics {
    pub fn record_completed(&self, outcome: OperationOutcome) {
        let outcome = match outcome {
            OperationOutcome::Success => "success",
            OperationOutcome::Throttled => "throttled",
            OperationOutcome::StaleRange => "stale_range",
            OperationOutcome::DependentFailure => "dependent_failure",
            OperationOutcome::Failed => "failed",
        };
        self.completed_operations
            .add(1, &[KeyValue::new("outcome", outcome)]);
    }

    pub fn record_batch(&self, bytes: usize, atomic: bool) {
        let attributes = [KeyValue::new("atomic", atomic)];
        self.dispatched_batches.add(1, &attributes);
        self.packed_bytes.add(bytes as u64, &attributes);
    }
}

impl Default for DispatchMetrics {
    fn default() -> Self {
        let meter = keel_observability::meter("dispatch");
        Self {
            submitted_operations: meter
                .u64_counter("client.dispatch.operations.submitted")
                .with_unit("{operation}")
                .with_description("operations accepted by the executor")
                .build(),
            completed_operations: meter
                .u64_counter("client.dispatch.operations.completed")
                .with_unit("{operation}")
                .with_description("operations completed, by outcome")
                .build(),
            dispatched_batches: meter
                .u64_counter("client.dispatch.batches")
                .with_unit("{batch}")
                .with_description("batch requests sent to the server")
                .build(),
            throttled_operations: meter
                .u64_counter("client.dispatch.operations.throttled")
                .with_unit("{operation}")
                .with_description("operations retried after throttling")
                .build(),
            rerouted_operations: meter
                .u64_counter("client.dispatch.operations.rerouted")
                .with_unit("{operation}")
                .with_description("operations re-routed after a stale range")
                .build(),
            packed_bytes: meter
                .u64_counter("client.dispatch.bytes")
                .with_unit("By")
                .with_description("packed bytes sent to the server")
                .build(),
        }
    }
}
