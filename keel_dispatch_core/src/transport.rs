use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use snafu::Snafu;

use crate::{partition::PartitionKey, response::BatchResponse, routing::RangeId};

/// A packed batch ready to be sent to a partition range.
#[derive(Debug, Clone, PartialEq)]
pub struct BatchRequest {
    /// The range the batch targets.
    pub range_id: RangeId,
    /// The partition key shared by all operations of an atomic batch.
    pub partition_key: Option<PartitionKey>,
    /// Whether the server must apply the batch all-or-nothing.
    pub atomic: bool,
    /// The number of operations packed in the body.
    pub operation_count: usize,
    /// The packed operations.
    pub body: Bytes,
}

/// Errors raised when a batch got no response at all.
#[derive(Debug, Clone, Snafu)]
#[snafu(visibility(pub))]
pub enum TransportError {
    #[snafu(display("service unavailable: {message}"))]
    Unavailable { message: String },
    #[snafu(display("request timed out after {elapsed:?}"))]
    Timeout { elapsed: Duration },
    #[snafu(display("connection closed"))]
    ConnectionClosed,
}

/// Sends packed batches to the server.
#[async_trait]
pub trait BatchTransport: Send + Sync {
    async fn send(
        &self,
        range_id: &RangeId,
        request: BatchRequest,
    ) -> Result<BatchResponse, TransportError>;
}
