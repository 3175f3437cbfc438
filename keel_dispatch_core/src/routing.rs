use std::{fmt, sync::Arc};

use async_trait::async_trait;
use snafu::Snafu;

use crate::partition::PartitionKey;

/// Identifier of a partition key range.
///
/// A range id is only valid for as long as the server keeps the range. After
/// a split or merge the same partition key resolves to a different id.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RangeId(Arc<str>);

/// Errors returned by the range resolution collaborator.
#[derive(Debug, Clone, Snafu)]
#[snafu(visibility(pub))]
pub enum RoutingError {
    #[snafu(display("no partition range owns the key {partition_key}"))]
    RangeNotFound { partition_key: PartitionKey },
    #[snafu(display("routing map unavailable: {message}"))]
    Unavailable { message: String },
}

/// Resolves partition keys to the partition range that currently owns them.
#[async_trait]
pub trait RangeResolver: Send + Sync {
    /// Resolve the range owning `partition_key`.
    ///
    /// Must be callable again after a stale-range signal, and may then return
    /// a different id for the same key.
    async fn resolve_range(&self, partition_key: &PartitionKey) -> Result<RangeId, RoutingError>;

    /// Signal that the server no longer recognizes `range_id`.
    ///
    /// Implementations backed by a cached routing map should refresh it.
    async fn mark_stale(&self, _range_id: &RangeId) {}
}

impl RangeId {
    pub fn new(id: impl Into<Arc<str>>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for RangeId {
    fn from(value: &str) -> Self {
        Self(value.into())
    }
}

impl From<String> for RangeId {
    fn from(value: String) -> Self {
        Self(value.into())
    }
}

impl fmt::Display for RangeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
