//! Batch responses and their correlation to operations.
//!
//! The server may return per-operation records in any physical order. The
//! batch-local index carried by each record is the only stable key.
use std::{fmt, time::Duration};

use bytes::Bytes;
use http::StatusCode;
use serde::de::DeserializeOwned;
use tracing::warn;

/// Secondary status qualifying a status code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubStatusCode(pub u32);

/// Classification of a single result, decided by a plain status switch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationOutcome {
    Success,
    Throttled,
    StaleRange,
    DependentFailure,
    Failed,
}

/// A per-operation record of a batch response.
#[derive(Debug, Clone, PartialEq)]
pub struct OperationRecord {
    /// The batch-local index of the operation.
    pub index: usize,
    pub status: StatusCode,
    pub sub_status: Option<SubStatusCode>,
    pub retry_after: Option<Duration>,
    pub etag: Option<String>,
    pub request_charge: f64,
    pub resource: Option<Bytes>,
}

/// The response to a batch request.
#[derive(Debug, Clone, PartialEq)]
pub struct BatchResponse {
    pub status: StatusCode,
    pub sub_status: Option<SubStatusCode>,
    pub retry_after: Option<Duration>,
    pub request_charge: f64,
    pub activity_id: Option<String>,
    /// Per-operation records, in no particular order.
    pub results: Vec<OperationRecord>,
}

/// The successful result of an operation, as seen by the caller.
#[derive(Debug, Clone, PartialEq)]
pub struct OperationResponse {
    pub status: StatusCode,
    pub etag: Option<String>,
    pub request_charge: f64,
    pub resource: Option<Bytes>,
    /// How many times the operation was retried or re-routed.
    pub retries: u32,
}

impl SubStatusCode {
    pub const NAME_CACHE_STALE: Self = Self(1000);
    pub const PARTITION_KEY_RANGE_GONE: Self = Self(1002);
    pub const COMPLETING_SPLIT: Self = Self(1007);
    pub const COMPLETING_PARTITION_MIGRATION: Self = Self(1008);

    /// Whether the sub-status signals that the target range no longer exists.
    pub fn is_stale_range(self) -> bool {
        matches!(
            self,
            Self::NAME_CACHE_STALE
                | Self::PARTITION_KEY_RANGE_GONE
                | Self::COMPLETING_SPLIT
                | Self::COMPLETING_PARTITION_MIGRATION
        )
    }
}

impl fmt::Display for SubStatusCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl OperationOutcome {
    pub fn classify(status: StatusCode, sub_status: Option<SubStatusCode>) -> Self {
        match status {
            s if s.is_success() => Self::Success,
            StatusCode::TOO_MANY_REQUESTS => Self::Throttled,
            StatusCode::GONE if sub_status.is_none_or(SubStatusCode::is_stale_range) => {
                Self::StaleRange
            }
            StatusCode::FAILED_DEPENDENCY => Self::DependentFailure,
            _ => Self::Failed,
        }
    }
}

impl OperationRecord {
    pub fn new(index: usize, status: StatusCode) -> Self {
        Self {
            index,
            status,
            sub_status: None,
            retry_after: None,
            etag: None,
            request_charge: 0.0,
            resource: None,
        }
    }

    pub fn with_sub_status(mut self, sub_status: SubStatusCode) -> Self {
        self.sub_status = Some(sub_status);
        self
    }

    pub fn with_retry_after(mut self, retry_after: Duration) -> Self {
        self.retry_after = Some(retry_after);
        self
    }

    pub fn with_etag(mut self, etag: impl Into<String>) -> Self {
        self.etag = Some(etag.into());
        self
    }

    pub fn with_request_charge(mut self, request_charge: f64) -> Self {
        self.request_charge = request_charge;
        self
    }

    pub fn with_resource(mut self, resource: Bytes) -> Self {
        self.resource = Some(resource);
        self
    }

    pub fn outcome(&self) -> OperationOutcome {
        OperationOutcome::classify(self.status, self.sub_status)
    }
}

impl BatchResponse {
    /// A batch-level response with per-operation records.
    pub fn new(status: StatusCode, results: Vec<OperationRecord>) -> Self {
        let request_charge = results.iter().map(|r| r.request_charge).sum();
        Self {
            status,
            sub_status: None,
            retry_after: None,
            request_charge,
            activity_id: None,
            results,
        }
    }

    /// A batch-level failure without per-operation records.
    pub fn failed(status: StatusCode, sub_status: Option<SubStatusCode>) -> Self {
        Self {
            status,
            sub_status,
            retry_after: None,
            request_charge: 0.0,
            activity_id: None,
            results: Vec::new(),
        }
    }

    pub fn with_retry_after(mut self, retry_after: Duration) -> Self {
        self.retry_after = Some(retry_after);
        self
    }

    pub fn with_activity_id(mut self, activity_id: impl Into<String>) -> Self {
        self.activity_id = Some(activity_id.into());
        self
    }

    pub fn is_success(&self) -> bool {
        self.status.is_success()
    }

    pub fn outcome(&self) -> OperationOutcome {
        OperationOutcome::classify(self.status, self.sub_status)
    }

    /// Correlate the records with a batch of `operation_count` operations.
    ///
    /// Slot `i` holds the record carrying index `i`. Records with an
    /// out-of-range or duplicate index are dropped.
    pub fn correlate(self, operation_count: usize) -> Vec<Option<OperationRecord>> {
        let mut slots: Vec<Option<OperationRecord>> = vec![None; operation_count];

        for record in self.results {
            let index = record.index;
            match slots.get_mut(index) {
                None => {
                    warn!(
                        index,
                        operation_count, "ignoring result with out of range index"
                    );
                }
                Some(Some(_)) => {
                    warn!(index, "ignoring duplicate result for operation");
                }
                Some(slot) => *slot = Some(record),
            }
        }

        slots
    }
}

impl OperationResponse {
    pub(crate) fn from_record(record: OperationRecord, retries: u32) -> Self {
        Self {
            status: record.status,
            etag: record.etag,
            request_charge: record.request_charge,
            resource: record.resource,
            retries,
        }
    }

    /// Deserialize the returned resource, if any.
    pub fn resource<T: DeserializeOwned>(&self) -> serde_json::Result<Option<T>> {
        self.resource
            .as_ref()
            .map(|bytes| serde_json::from_slice(bytes))
            .transpose()
    }
}
