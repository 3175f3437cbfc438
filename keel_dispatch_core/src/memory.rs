//! In-memory implementation of the range resolver and the batch transport.
//!
//! The store keeps items in memory and partitions them over key-hash ranges.
//! Ranges can be split at runtime. Clients resolve ranges through a cached
//! routing map that is only refreshed when a range is reported stale, so a
//! split is observed the same way as with a real server: the first request
//! to the retired range fails with `410 Gone`.
use std::{
    collections::{HashMap, VecDeque, hash_map::DefaultHasher},
    hash::{Hash, Hasher},
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use bytes::Bytes;
use http::StatusCode;
use parking_lot::Mutex;
use serde_json::Value;
use snafu::Snafu;
use tracing::debug;
use ulid::Ulid;

use crate::{
    operation::OperationKind,
    partition::PartitionKey,
    response::{BatchResponse, OperationRecord, SubStatusCode},
    routing::{RangeId, RangeNotFoundSnafu, RangeResolver, RoutingError},
    transport::{BatchRequest, BatchTransport, TransportError},
    wire::{WireOperation, decode_body},
};

const READ_CHARGE: f64 = 1.0;
const WRITE_CHARGE: f64 = 5.0;

/// An in-memory partitioned item store.
#[derive(Debug, Clone)]
pub struct InMemoryStore {
    inner: Arc<StoreInner>,
}

/// A request received by the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedRequest {
    pub range_id: RangeId,
    pub operation_count: usize,
    pub atomic: bool,
}

#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum SplitError {
    #[snafu(display("range {range_id} does not exist"))]
    UnknownRange { range_id: RangeId },
    #[snafu(display("range {range_id} is too small to split"))]
    RangeTooSmall { range_id: RangeId },
}

#[derive(Debug)]
struct StoreInner {
    latency: Mutex<Duration>,
    routing: Mutex<Routing>,
    items: Mutex<HashMap<ItemKey, StoredItem>>,
    faults: Mutex<Faults>,
    requests: Mutex<Vec<RecordedRequest>>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

#[derive(Debug, Clone)]
struct KeyRange {
    id: RangeId,
    /// Inclusive bounds of the owned key hashes.
    min: u64,
    max: u64,
}

#[derive(Debug)]
struct Routing {
    /// The ranges the server knows about.
    live: Vec<KeyRange>,
    /// The routing map handed out to clients.
    cached: Vec<KeyRange>,
    next_range_id: usize,
}

#[derive(Debug, Default)]
struct Faults {
    throttled: VecDeque<Duration>,
    transport: VecDeque<TransportError>,
}

type ItemKey = (PartitionKey, String);

#[derive(Debug, Clone)]
struct StoredItem {
    body: Value,
    etag: String,
}

/// The result of applying one operation.
struct Applied {
    status: StatusCode,
    etag: Option<String>,
    resource: Option<Bytes>,
    request_charge: f64,
}

impl InMemoryStore {
    /// Create a store with `range_count` ranges of equal width.
    pub fn new(range_count: usize) -> Self {
        let range_count = range_count.max(1) as u64;
        let width = u64::MAX / range_count;

        let live: Vec<_> = (0..range_count)
            .map(|i| KeyRange {
                id: RangeId::from(i.to_string()),
                min: i * width,
                max: if i + 1 == range_count {
                    u64::MAX
                } else {
                    (i + 1) * width - 1
                },
            })
            .collect();

        let routing = Routing {
            cached: live.clone(),
            live,
            next_range_id: range_count as usize,
        };

        Self {
            inner: Arc::new(StoreInner {
                latency: Mutex::new(Duration::ZERO),
                routing: Mutex::new(routing),
                items: Mutex::new(HashMap::new()),
                faults: Mutex::new(Faults::default()),
                requests: Mutex::new(Vec::new()),
                in_flight: AtomicUsize::new(0),
                max_in_flight: AtomicUsize::new(0),
            }),
        }
    }

    /// Delay every response by `latency`.
    pub fn set_latency(&self, latency: Duration) {
        *self.inner.latency.lock() = latency;
    }

    /// Split `range_id` in two halves with new ids.
    ///
    /// Clients keep routing to the old range until it is reported stale.
    pub fn split(&self, range_id: &RangeId) -> Result<(RangeId, RangeId), SplitError> {
        let mut routing = self.inner.routing.lock();
        let Some(position) = routing.live.iter().position(|r| &r.id == range_id) else {
            return UnknownRangeSnafu {
                range_id: range_id.clone(),
            }
            .fail();
        };

        let range = routing.live[position].clone();
        if range.min == range.max {
            return RangeTooSmallSnafu {
                range_id: range_id.clone(),
            }
            .fail();
        }

        let middle = range.min + (range.max - range.min) / 2;
        let left = KeyRange {
            id: RangeId::from(routing.next_range_id.to_string()),
            min: range.min,
            max: middle,
        };
        let right = KeyRange {
            id: RangeId::from((routing.next_range_id + 1).to_string()),
            min: middle + 1,
            max: range.max,
        };
        routing.next_range_id += 2;

        debug!(range = %range_id, left = %left.id, right = %right.id, "split range");

        let ids = (left.id.clone(), right.id.clone());
        routing.live.splice(position..=position, [left, right]);

        Ok(ids)
    }

    /// The ids of the ranges the server currently knows about.
    pub fn range_ids(&self) -> Vec<RangeId> {
        self.inner
            .routing
            .lock()
            .live
            .iter()
            .map(|r| r.id.clone())
            .collect()
    }

    /// Respond to the next `count` requests with `429 Too Many Requests`.
    pub fn throttle_next(&self, count: usize, retry_after: Duration) {
        let mut faults = self.inner.faults.lock();
        faults.throttled.extend(std::iter::repeat_n(retry_after, count));
    }

    /// Fail the next request without a response.
    pub fn fail_next(&self, error: TransportError) {
        self.inner.faults.lock().transport.push_back(error);
    }

    /// The stored item, if any.
    pub fn item(&self, partition_key: &PartitionKey, id: &str) -> Option<Value> {
        self.inner
            .items
            .lock()
            .get(&(partition_key.clone(), id.to_string()))
            .map(|item| item.body.clone())
    }

    pub fn item_count(&self) -> usize {
        self.inner.items.lock().len()
    }

    /// Every request received so far, in arrival order.
    pub fn requests(&self) -> Vec<RecordedRequest> {
        self.inner.requests.lock().clone()
    }

    /// The highest number of requests processed at the same time.
    pub fn max_in_flight(&self) -> usize {
        self.inner.max_in_flight.load(Ordering::SeqCst)
    }

    fn process(&self, range_id: &RangeId, request: &BatchRequest) -> BatchResponse {
        let activity_id = Ulid::new().to_string();

        let Some(range) = self.inner.routing.lock().live_range(range_id) else {
            debug!(range = %range_id, "request for retired range");
            return BatchResponse::failed(
                StatusCode::GONE,
                Some(SubStatusCode::PARTITION_KEY_RANGE_GONE),
            )
            .with_activity_id(activity_id);
        };

        let operations = match decode_body(request.body.clone()) {
            Ok(operations) => operations,
            Err(error) => {
                debug!(range = %range_id, error = %error, "malformed request body");
                return BatchResponse::failed(StatusCode::BAD_REQUEST, None)
                    .with_activity_id(activity_id);
            }
        };

        let throttled = self.inner.faults.lock().throttled.pop_front();
        if let Some(retry_after) = throttled {
            if request.atomic {
                return BatchResponse::failed(StatusCode::TOO_MANY_REQUESTS, None)
                    .with_retry_after(retry_after)
                    .with_activity_id(activity_id);
            }

            let results = operations
                .iter()
                .map(|op| {
                    OperationRecord::new(op.index, StatusCode::TOO_MANY_REQUESTS)
                        .with_retry_after(retry_after)
                })
                .collect();
            return BatchResponse::new(StatusCode::MULTI_STATUS, results)
                .with_retry_after(retry_after)
                .with_activity_id(activity_id);
        }

        let response = if request.atomic {
            self.apply_atomic(&range, &operations)
        } else {
            self.apply_each(&range, &operations)
        };

        response.with_activity_id(activity_id)
    }

    fn apply_each(&self, range: &KeyRange, operations: &[WireOperation]) -> BatchResponse {
        let mut items = self.inner.items.lock();

        let results = operations
            .iter()
            .map(|op| {
                if !range.owns(&op.partition_key) {
                    return OperationRecord::new(op.index, StatusCode::GONE)
                        .with_sub_status(SubStatusCode::PARTITION_KEY_RANGE_GONE);
                }

                apply(&mut items, op).into_record(op.index)
            })
            .collect();

        BatchResponse::new(StatusCode::MULTI_STATUS, results)
    }

    fn apply_atomic(&self, range: &KeyRange, operations: &[WireOperation]) -> BatchResponse {
        if let Some(op) = operations.iter().find(|op| !range.owns(&op.partition_key)) {
            debug!(partition_key = %op.partition_key, "atomic batch key not owned by range");
            return BatchResponse::failed(
                StatusCode::GONE,
                Some(SubStatusCode::PARTITION_KEY_RANGE_GONE),
            );
        }

        let mut items = self.inner.items.lock();
        let mut staged = items.clone();

        let mut results = Vec::with_capacity(operations.len());
        let mut failure = None;
        for op in operations {
            let applied = apply(&mut staged, op);
            if !applied.status.is_success() {
                failure = Some((op.index, applied.status, applied.request_charge));
                break;
            }
            results.push(applied.into_record(op.index));
        }

        let Some((failed_index, status, request_charge)) = failure else {
            *items = staged;
            return BatchResponse::new(StatusCode::OK, results);
        };

        let results = operations
            .iter()
            .map(|op| {
                if op.index == failed_index {
                    OperationRecord::new(op.index, status).with_request_charge(request_charge)
                } else {
                    OperationRecord::new(op.index, StatusCode::FAILED_DEPENDENCY)
                }
            })
            .collect();

        BatchResponse::new(status, results)
    }
}

#[async_trait]
impl RangeResolver for InMemoryStore {
    async fn resolve_range(&self, partition_key: &PartitionKey) -> Result<RangeId, RoutingError> {
        let hash = key_hash(partition_key);
        self.inner
            .routing
            .lock()
            .cached
            .iter()
            .find(|range| range.contains(hash))
            .map(|range| range.id.clone())
            .ok_or_else(|| {
                RangeNotFoundSnafu {
                    partition_key: partition_key.clone(),
                }
                .build()
            })
    }

    async fn mark_stale(&self, range_id: &RangeId) {
        let mut routing = self.inner.routing.lock();
        if routing.cached.iter().any(|range| &range.id == range_id) {
            debug!(range = %range_id, "refreshing routing map");
            routing.cached = routing.live.clone();
        }
    }
}

#[async_trait]
impl BatchTransport for InMemoryStore {
    async fn send(
        &self,
        range_id: &RangeId,
        request: BatchRequest,
    ) -> Result<BatchResponse, TransportError> {
        self.inner.requests.lock().push(RecordedRequest {
            range_id: range_id.clone(),
            operation_count: request.operation_count,
            atomic: request.atomic,
        });

        let _guard = InFlightGuard::new(&self.inner);

        let latency = *self.inner.latency.lock();
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }

        if let Some(error) = self.inner.faults.lock().transport.pop_front() {
            return Err(error);
        }

        Ok(self.process(range_id, &request))
    }
}

impl Routing {
    fn live_range(&self, range_id: &RangeId) -> Option<KeyRange> {
        self.live.iter().find(|r| &r.id == range_id).cloned()
    }
}

impl KeyRange {
    fn contains(&self, hash: u64) -> bool {
        self.min <= hash && hash <= self.max
    }

    fn owns(&self, partition_key: &PartitionKey) -> bool {
        self.contains(key_hash(partition_key))
    }
}

impl Applied {
    fn status(status: StatusCode) -> Self {
        Self {
            status,
            etag: None,
            resource: None,
            request_charge: READ_CHARGE,
        }
    }

    fn item(status: StatusCode, item: &StoredItem, request_charge: f64) -> Self {
        Self {
            status,
            etag: Some(item.etag.clone()),
            resource: serde_json::to_vec(&item.body).ok().map(Bytes::from),
            request_charge,
        }
    }

    fn into_record(self, index: usize) -> OperationRecord {
        let mut record =
            OperationRecord::new(index, self.status).with_request_charge(self.request_charge);
        record.etag = self.etag;
        record.resource = self.resource;
        record
    }
}

struct InFlightGuard<'a> {
    inner: &'a StoreInner,
}

impl<'a> InFlightGuard<'a> {
    fn new(inner: &'a StoreInner) -> Self {
        let current = inner.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        inner.max_in_flight.fetch_max(current, Ordering::SeqCst);
        Self { inner }
    }
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.inner.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

fn key_hash(partition_key: &PartitionKey) -> u64 {
    let mut hasher = DefaultHasher::new();
    partition_key.hash(&mut hasher);
    hasher.finish()
}

fn apply(items: &mut HashMap<ItemKey, StoredItem>, op: &WireOperation) -> Applied {
    let payload = match op.payload.as_deref().map(serde_json::from_slice::<Value>) {
        None => None,
        Some(Ok(payload)) => Some(payload),
        Some(Err(_)) => return Applied::status(StatusCode::BAD_REQUEST),
    };

    let id = op.id.clone().or_else(|| {
        payload
            .as_ref()
            .and_then(|p| p.get("id"))
            .and_then(Value::as_str)
            .map(str::to_string)
    });
    let Some(id) = id else {
        return Applied::status(StatusCode::BAD_REQUEST);
    };

    let key = (op.partition_key.clone(), id.clone());
    let existing = items.get(&key);

    if let (Some(if_match), Some(item)) = (&op.if_match, existing) {
        if if_match != &item.etag {
            return Applied::status(StatusCode::PRECONDITION_FAILED);
        }
    }

    match op.kind {
        OperationKind::Read => {
            let Some(item) = existing else {
                return Applied::status(StatusCode::NOT_FOUND);
            };
            if op.if_none_match.as_deref() == Some(item.etag.as_str()) {
                return Applied::status(StatusCode::NOT_MODIFIED);
            }
            Applied::item(StatusCode::OK, item, READ_CHARGE)
        }
        OperationKind::Create => {
            if existing.is_some() {
                return Applied::status(StatusCode::CONFLICT);
            }
            let Some(body) = payload.map(|body| with_id(body, &id)) else {
                return Applied::status(StatusCode::BAD_REQUEST);
            };
            store(items, key, body, StatusCode::CREATED)
        }
        OperationKind::Upsert => {
            let status = if existing.is_some() {
                StatusCode::OK
            } else {
                StatusCode::CREATED
            };
            let Some(body) = payload.map(|body| with_id(body, &id)) else {
                return Applied::status(StatusCode::BAD_REQUEST);
            };
            store(items, key, body, status)
        }
        OperationKind::Replace => {
            if existing.is_none() {
                return Applied::status(StatusCode::NOT_FOUND);
            }
            let Some(body) = payload.map(|body| with_id(body, &id)) else {
                return Applied::status(StatusCode::BAD_REQUEST);
            };
            store(items, key, body, StatusCode::OK)
        }
        OperationKind::Patch => {
            let Some(item) = existing else {
                return Applied::status(StatusCode::NOT_FOUND);
            };
            let mut body = item.body.clone();
            let Some(Value::Array(patch)) = payload else {
                return Applied::status(StatusCode::BAD_REQUEST);
            };
            if apply_patch(&mut body, &patch).is_none() {
                return Applied::status(StatusCode::BAD_REQUEST);
            }
            store(items, key, body, StatusCode::OK)
        }
        OperationKind::Delete => {
            if items.remove(&key).is_none() {
                return Applied::status(StatusCode::NOT_FOUND);
            }
            Applied {
                status: StatusCode::NO_CONTENT,
                etag: None,
                resource: None,
                request_charge: WRITE_CHARGE,
            }
        }
    }
}

fn store(
    items: &mut HashMap<ItemKey, StoredItem>,
    key: ItemKey,
    body: Value,
    status: StatusCode,
) -> Applied {
    let item = StoredItem {
        body,
        etag: Ulid::new().to_string(),
    };
    let applied = Applied::item(status, &item, WRITE_CHARGE);
    items.insert(key, item);
    applied
}

fn with_id(mut body: Value, id: &str) -> Value {
    if let Value::Object(map) = &mut body {
        map.entry("id")
            .or_insert_with(|| Value::String(id.to_string()));
    }
    body
}

/// Applies `add`, `set`, `replace`, `remove` and `incr` patch operations.
///
/// Returns `None` if the patch is malformed or a path does not exist.
fn apply_patch(body: &mut Value, patch: &[Value]) -> Option<()> {
    for operation in patch {
        let op = operation.get("op")?.as_str()?;
        let path = operation.get("path")?.as_str()?;
        let (parent_path, field) = path.rsplit_once('/')?;
        let parent = body.pointer_mut(parent_path)?.as_object_mut()?;

        match op {
            "add" | "set" => {
                parent.insert(field.to_string(), operation.get("value")?.clone());
            }
            "replace" => {
                let target = parent.get_mut(field)?;
                *target = operation.get("value")?.clone();
            }
            "remove" => {
                parent.remove(field)?;
            }
            "incr" => {
                let by = operation.get("value")?;
                let target = parent.get_mut(field)?;
                *target = match (target.as_i64(), by.as_i64()) {
                    (Some(current), Some(by)) => Value::from(current.checked_add(by)?),
                    _ => Value::from(target.as_f64()? + by.as_f64()?),
                };
            }
            _ => return None,
        }
    }

    Some(())
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::operation::Operation;

    fn request(range_id: &RangeId, atomic: bool, operations: &[Operation]) -> BatchRequest {
        let materialized: Vec<_> = operations
            .iter()
            .map(|op| op.materialize().unwrap())
            .collect();
        BatchRequest {
            range_id: range_id.clone(),
            partition_key: None,
            atomic,
            operation_count: operations.len(),
            body: crate::wire::encode_body(operations.iter().zip(materialized), 0),
        }
    }

    #[tokio::test]
    async fn test_crud() {
        let store = InMemoryStore::new(1);
        let pk = PartitionKey::from("tenant");
        let range = store.resolve_range(&pk).await.unwrap();

        let operations = [
            Operation::create(pk.clone(), json!({"id": "a", "count": 1})),
            Operation::create(pk.clone(), json!({"id": "a", "count": 2})),
            Operation::read(pk.clone(), "missing"),
            Operation::patch(
                pk.clone(),
                "a",
                json!([{"op": "incr", "path": "/count", "value": 4}]),
            ),
        ];
        let response = store
            .send(&range, request(&range, false, &operations))
            .await
            .unwrap();

        let statuses: Vec<_> = response.results.iter().map(|r| r.status).collect();
        assert_eq!(
            statuses,
            vec![
                StatusCode::CREATED,
                StatusCode::CONFLICT,
                StatusCode::NOT_FOUND,
                StatusCode::OK,
            ]
        );
        assert_eq!(store.item(&pk, "a").unwrap()["count"], 5);

        let etag = response.results[3].etag.clone().unwrap();
        let operations = [
            Operation::replace(pk.clone(), "a", json!({"count": 0}))
                .with_if_match("stale"),
            Operation::delete(pk.clone(), "a").with_if_match(etag),
        ];
        let response = store
            .send(&range, request(&range, false, &operations))
            .await
            .unwrap();
        assert_eq!(
            response.results[0].status,
            StatusCode::PRECONDITION_FAILED
        );
        assert_eq!(response.results[1].status, StatusCode::NO_CONTENT);
        assert_eq!(store.item_count(), 0);
    }

    #[tokio::test]
    async fn test_atomic_failure_rolls_back() {
        let store = InMemoryStore::new(1);
        let pk = PartitionKey::from("tenant");
        let range = store.resolve_range(&pk).await.unwrap();

        let operations = [
            Operation::create(pk.clone(), json!({"id": "a"})),
            Operation::replace(pk.clone(), "missing", json!({})),
            Operation::create(pk.clone(), json!({"id": "b"})),
        ];
        let response = store
            .send(&range, request(&range, true, &operations))
            .await
            .unwrap();

        assert_eq!(response.status, StatusCode::NOT_FOUND);
        let statuses: Vec<_> = response.results.iter().map(|r| r.status).collect();
        assert_eq!(
            statuses,
            vec![
                StatusCode::FAILED_DEPENDENCY,
                StatusCode::NOT_FOUND,
                StatusCode::FAILED_DEPENDENCY,
            ]
        );
        assert_eq!(store.item_count(), 0);
    }

    #[tokio::test]
    async fn test_split_retires_range_until_refresh() {
        let store = InMemoryStore::new(1);
        let pk = PartitionKey::from("tenant");
        let old = store.resolve_range(&pk).await.unwrap();

        let (left, right) = store.split(&old).unwrap();
        assert_eq!(store.range_ids(), vec![left.clone(), right.clone()]);

        // The cached routing map still points at the retired range.
        assert_eq!(store.resolve_range(&pk).await.unwrap(), old);
        let response = store
            .send(&old, request(&old, false, &[Operation::read(pk.clone(), "a")]))
            .await
            .unwrap();
        assert_eq!(response.status, StatusCode::GONE);
        assert_eq!(
            response.sub_status,
            Some(SubStatusCode::PARTITION_KEY_RANGE_GONE)
        );

        store.mark_stale(&old).await;
        let new = store.resolve_range(&pk).await.unwrap();
        assert!(new == left || new == right);
    }

    #[tokio::test]
    async fn test_injected_faults() {
        let store = InMemoryStore::new(2);
        let pk = PartitionKey::from(7);
        let range = store.resolve_range(&pk).await.unwrap();
        let operations = [Operation::read(pk.clone(), "a")];

        store.throttle_next(1, Duration::from_millis(50));
        let response = store
            .send(&range, request(&range, false, &operations))
            .await
            .unwrap();
        assert_eq!(
            response.results[0].status,
            StatusCode::TOO_MANY_REQUESTS
        );
        assert_eq!(
            response.results[0].retry_after,
            Some(Duration::from_millis(50))
        );

        store.fail_next(TransportError::ConnectionClosed);
        let result = store.send(&range, request(&range, false, &operations)).await;
        assert!(matches!(result, Err(TransportError::ConnectionClosed)));

        assert_eq!(store.requests().len(), 2);
        assert_eq!(store.max_in_flight(), 1);
    }

    #[test]
    fn test_apply_patch() {
        let mut body = json!({"id": "a", "n": 1, "nested": {"x": true}});
        let patch = json!([
            {"op": "set", "path": "/name", "value": "keel"},
            {"op": "incr", "path": "/n", "value": 2},
            {"op": "remove", "path": "/nested/x"},
        ]);
        apply_patch(&mut body, patch.as_array().unwrap()).unwrap();
        assert_eq!(body, json!({"id": "a", "n": 3, "name": "keel", "nested": {}}));

        let patch = json!([{"op": "replace", "path": "/missing", "value": 1}]);
        assert!(apply_patch(&mut body, patch.as_array().unwrap()).is_none());
    }
}
