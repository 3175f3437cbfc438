//! Client-side batching and dispatch of item operations.
//!
//! Operations submitted to a [`DispatchExecutor`] are grouped by the partition
//! range owning their key, packed into bounded batch requests and sent with a
//! bounded number of in-flight requests per range. Results are correlated
//! back to each operation, and throttled or stale-range operations are
//! retried transparently.
pub mod batcher;
pub mod builder;
pub mod error;
pub mod executor;
pub mod memory;
pub mod operation;
pub mod options;
pub mod partition;
pub mod reply;
pub mod response;
pub mod retry;
pub mod routing;
mod streamer;
mod thresholds;
pub mod transaction;
pub mod transport;
pub mod wire;

#[cfg(test)]
pub mod test_utils;

pub use builder::{Batch, PackResult, pack};
pub use error::{DispatchError, ErrorKind, Result};
pub use executor::{DispatchExecutor, DispatchExecutorBuilder};
pub use memory::InMemoryStore;
pub use operation::{Operation, OperationKind, OperationOptions};
pub use options::{
    ConsistencyLevel, DispatchOptions, PartitionTarget, RequestOptions, RetryOptions,
    ThrottleRetryOptions,
};
pub use partition::{EffectivePartitionKey, PartitionKey, PartitionKeyValue};
pub use reply::{OperationHandle, OperationResult};
pub use response::{
    BatchResponse, OperationOutcome, OperationRecord, OperationResponse, SubStatusCode,
};
pub use retry::{
    DispatchRetryPolicy, RetryDecision, RetryInput, RetryPolicy, StaleRangeRetryPolicy,
    ThrottleRetryPolicy,
};
pub use routing::{RangeId, RangeResolver, RoutingError};
pub use transaction::{TransactionalBatch, TransactionalBatchResponse};
pub use transport::{BatchRequest, BatchTransport, TransportError};
