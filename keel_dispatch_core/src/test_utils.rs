use std::collections::VecDeque;

use async_trait::async_trait;
use http::StatusCode;
use parking_lot::Mutex;

use crate::{
    partition::PartitionKey,
    response::{BatchResponse, OperationRecord},
    routing::{RangeId, RangeResolver, RoutingError},
    transport::{BatchRequest, BatchTransport, TransportError},
};

pub type ScriptedReply = Result<BatchResponse, TransportError>;

/// A transport that answers from a script and records every request.
///
/// Once the script is exhausted every operation succeeds with `200 OK`.
#[derive(Default)]
pub struct ScriptedTransport {
    script: Mutex<VecDeque<Box<dyn FnOnce(&BatchRequest) -> ScriptedReply + Send>>>,
    requests: Mutex<Vec<BatchRequest>>,
}

/// Resolves every key to the current range, switching to the next range
/// once the current one is reported stale.
pub struct SwitchingResolver {
    ranges: Mutex<VecDeque<RangeId>>,
    stale: Mutex<Vec<RangeId>>,
}

impl ScriptedTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a reply computed from the request.
    pub fn then(&self, reply: impl FnOnce(&BatchRequest) -> ScriptedReply + Send + 'static) {
        self.script.lock().push_back(Box::new(reply));
    }

    /// Queue a fixed reply.
    pub fn then_reply(&self, reply: ScriptedReply) {
        self.then(move |_| reply);
    }

    pub fn requests(&self) -> Vec<BatchRequest> {
        self.requests.lock().clone()
    }
}

#[async_trait]
impl BatchTransport for ScriptedTransport {
    async fn send(
        &self,
        _range_id: &RangeId,
        request: BatchRequest,
    ) -> Result<BatchResponse, TransportError> {
        self.requests.lock().push(request.clone());
        let reply = self.script.lock().pop_front();
        match reply {
            Some(reply) => reply(&request),
            None => Ok(all_with_status(&request, StatusCode::OK)),
        }
    }
}

impl SwitchingResolver {
    pub fn new(ranges: impl IntoIterator<Item = &'static str>) -> Self {
        Self {
            ranges: Mutex::new(ranges.into_iter().map(RangeId::from).collect()),
            stale: Mutex::new(Vec::new()),
        }
    }

    /// The ranges reported stale so far.
    pub fn stale(&self) -> Vec<RangeId> {
        self.stale.lock().clone()
    }
}

#[async_trait]
impl RangeResolver for SwitchingResolver {
    async fn resolve_range(&self, partition_key: &PartitionKey) -> Result<RangeId, RoutingError> {
        self.ranges
            .lock()
            .front()
            .cloned()
            .ok_or_else(|| RoutingError::RangeNotFound {
                partition_key: partition_key.clone(),
            })
    }

    async fn mark_stale(&self, range_id: &RangeId) {
        self.stale.lock().push(range_id.clone());
        let mut ranges = self.ranges.lock();
        if ranges.front() == Some(range_id) && ranges.len() > 1 {
            ranges.pop_front();
        }
    }
}

/// A response in which every operation of the request has `status`.
pub fn all_with_status(request: &BatchRequest, status: StatusCode) -> BatchResponse {
    let results = (0..request.operation_count)
        .map(|index| OperationRecord::new(index, status))
        .collect();
    BatchResponse::new(StatusCode::MULTI_STATUS, results)
}
