//! Item-level operations and their memoized payloads.
//!
//! An [`Operation`] is built by the caller and validated and materialized
//! synchronously by the executor, before it ever occupies a queue slot. The
//! materialized form is computed at most once and reused by every packing
//! pass, so an operation that is retried or re-routed is sent with exactly
//! the same bytes.
use std::{
    fmt::{self, Debug},
    sync::{Arc, OnceLock},
};

use bytes::Bytes;
use serde::Serialize;
use snafu::ResultExt;

use crate::{
    error::{MaterializationSnafu, Result, ValidationSnafu},
    options::RequestOptions,
    partition::PartitionKey,
};

type SerializeFn = dyn Fn() -> std::result::Result<Vec<u8>, serde_json::Error> + Send + Sync;

/// The action an operation performs on its item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OperationKind {
    Create,
    Read,
    Replace,
    Upsert,
    Delete,
    Patch,
}

/// Conditional-match options of a single operation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OperationOptions {
    /// Only apply the operation if the item's etag matches.
    pub if_match: Option<String>,
    /// Only apply the operation if the item's etag does not match.
    pub if_none_match: Option<String>,
}

/// Where the payload of an operation comes from.
#[derive(Clone)]
pub enum ResourceSource {
    /// Already serialized JSON.
    Raw(Bytes),
    /// A value serialized on first materialization.
    Deferred(Arc<SerializeFn>),
}

/// The serialized form of an operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MaterializedOperation {
    /// The JSON encoded partition key.
    pub partition_key: Bytes,
    /// The JSON payload, if the operation carries one.
    pub payload: Option<Bytes>,
    /// Sum of the id, partition key, payload and option lengths.
    pub approximate_size: usize,
}

/// A single action against a single item.
pub struct Operation {
    kind: OperationKind,
    id: Option<String>,
    partition_key: PartitionKey,
    resource: Option<ResourceSource>,
    options: OperationOptions,
    request_options: RequestOptions,
    materialized: OnceLock<Result<MaterializedOperation>>,
}

impl OperationKind {
    pub(crate) fn code(self) -> u8 {
        match self {
            Self::Create => 0,
            Self::Read => 1,
            Self::Replace => 2,
            Self::Upsert => 3,
            Self::Delete => 4,
            Self::Patch => 5,
        }
    }

    pub(crate) fn from_code(code: u8) -> Option<Self> {
        let kind = match code {
            0 => Self::Create,
            1 => Self::Read,
            2 => Self::Replace,
            3 => Self::Upsert,
            4 => Self::Delete,
            5 => Self::Patch,
            _ => return None,
        };
        Some(kind)
    }

    /// Whether the operation carries a payload.
    pub fn has_payload(self) -> bool {
        matches!(
            self,
            Self::Create | Self::Replace | Self::Upsert | Self::Patch
        )
    }

    /// Whether the operation needs the id of an existing item.
    pub fn requires_id(self) -> bool {
        matches!(
            self,
            Self::Read | Self::Replace | Self::Delete | Self::Patch
        )
    }
}

impl Operation {
    fn new(
        kind: OperationKind,
        partition_key: PartitionKey,
        id: Option<String>,
        resource: Option<ResourceSource>,
    ) -> Self {
        Self {
            kind,
            id,
            partition_key,
            resource,
            options: OperationOptions::default(),
            request_options: RequestOptions::default(),
            materialized: OnceLock::new(),
        }
    }

    /// Create a new item. The id is usually part of the resource itself.
    pub fn create<T>(partition_key: impl Into<PartitionKey>, resource: T) -> Self
    where
        T: Serialize + Send + Sync + 'static,
    {
        Self::new(
            OperationKind::Create,
            partition_key.into(),
            None,
            Some(ResourceSource::deferred(resource)),
        )
    }

    /// Create a new item from an already serialized JSON resource.
    pub fn create_raw(partition_key: impl Into<PartitionKey>, resource: Bytes) -> Self {
        Self::new(
            OperationKind::Create,
            partition_key.into(),
            None,
            Some(ResourceSource::Raw(resource)),
        )
    }

    /// Create or replace an item.
    pub fn upsert<T>(partition_key: impl Into<PartitionKey>, resource: T) -> Self
    where
        T: Serialize + Send + Sync + 'static,
    {
        Self::new(
            OperationKind::Upsert,
            partition_key.into(),
            None,
            Some(ResourceSource::deferred(resource)),
        )
    }

    /// Replace an existing item.
    pub fn replace<T>(
        partition_key: impl Into<PartitionKey>,
        id: impl Into<String>,
        resource: T,
    ) -> Self
    where
        T: Serialize + Send + Sync + 'static,
    {
        Self::new(
            OperationKind::Replace,
            partition_key.into(),
            Some(id.into()),
            Some(ResourceSource::deferred(resource)),
        )
    }

    /// Apply a patch document to an existing item.
    pub fn patch<T>(
        partition_key: impl Into<PartitionKey>,
        id: impl Into<String>,
        patch: T,
    ) -> Self
    where
        T: Serialize + Send + Sync + 'static,
    {
        Self::new(
            OperationKind::Patch,
            partition_key.into(),
            Some(id.into()),
            Some(ResourceSource::deferred(patch)),
        )
    }

    /// Read an item.
    pub fn read(partition_key: impl Into<PartitionKey>, id: impl Into<String>) -> Self {
        Self::new(
            OperationKind::Read,
            partition_key.into(),
            Some(id.into()),
            None,
        )
    }

    /// Delete an item.
    pub fn delete(partition_key: impl Into<PartitionKey>, id: impl Into<String>) -> Self {
        Self::new(
            OperationKind::Delete,
            partition_key.into(),
            Some(id.into()),
            None,
        )
    }

    /// Set the id of the target item.
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self.materialized = OnceLock::new();
        self
    }

    /// Only apply the operation if the item's etag matches.
    pub fn with_if_match(mut self, etag: impl Into<String>) -> Self {
        self.options.if_match = Some(etag.into());
        self.materialized = OnceLock::new();
        self
    }

    /// Only apply the operation if the item's etag does not match.
    pub fn with_if_none_match(mut self, etag: impl Into<String>) -> Self {
        self.options.if_none_match = Some(etag.into());
        self.materialized = OnceLock::new();
        self
    }

    /// Attach request-level options.
    pub fn with_request_options(mut self, request_options: RequestOptions) -> Self {
        self.request_options = request_options;
        self
    }

    pub fn kind(&self) -> OperationKind {
        self.kind
    }

    pub fn id(&self) -> Option<&str> {
        self.id.as_deref()
    }

    pub fn partition_key(&self) -> &PartitionKey {
        &self.partition_key
    }

    pub fn options(&self) -> &OperationOptions {
        &self.options
    }

    pub fn request_options(&self) -> &RequestOptions {
        &self.request_options
    }

    /// Check the operation is well formed.
    pub fn validate(&self) -> Result<()> {
        if self.kind.requires_id() && self.id.as_deref().is_none_or(str::is_empty) {
            return ValidationSnafu {
                message: format!("{:?} operation requires an item id", self.kind),
            }
            .fail();
        }

        match (self.kind.has_payload(), self.resource.is_some()) {
            (true, false) => {
                return ValidationSnafu {
                    message: format!("{:?} operation requires a resource", self.kind),
                }
                .fail();
            }
            (false, true) => {
                return ValidationSnafu {
                    message: format!("{:?} operation cannot carry a resource", self.kind),
                }
                .fail();
            }
            _ => {}
        }

        if self.kind == OperationKind::Create && self.options.if_match.is_some() {
            return ValidationSnafu {
                message: "create operation cannot be conditioned on an existing etag".to_string(),
            }
            .fail();
        }

        if let Some(key) = self.request_options.logical_partition_key() {
            if key != &self.partition_key {
                return ValidationSnafu {
                    message: format!(
                        "partition key override {key} does not match operation partition key {}",
                        self.partition_key
                    ),
                }
                .fail();
            }
        }

        self.request_options.validate_for_batch()
    }

    /// Serialize the operation, caching the result.
    ///
    /// Repeated calls return the cached value, including a cached error.
    pub fn materialize(&self) -> Result<&MaterializedOperation> {
        self.materialized
            .get_or_init(|| self.compute_materialized())
            .as_ref()
            .map_err(Clone::clone)
    }

    /// Whether the operation has been materialized.
    pub fn is_materialized(&self) -> bool {
        matches!(self.materialized.get(), Some(Ok(_)))
    }

    /// The approximate serialized size of the operation.
    ///
    /// Materializes the operation if needed.
    pub fn approximate_size(&self) -> Result<usize> {
        self.materialize().map(|m| m.approximate_size)
    }

    fn compute_materialized(&self) -> Result<MaterializedOperation> {
        let partition_key = self.partition_key.to_json().context(MaterializationSnafu {
            message: "failed to serialize partition key",
        })?;

        let payload = match &self.resource {
            None => None,
            Some(ResourceSource::Raw(bytes)) => Some(bytes.clone()),
            Some(ResourceSource::Deferred(serialize)) => {
                let bytes = serialize().context(MaterializationSnafu {
                    message: format!("failed to serialize {:?} resource", self.kind),
                })?;
                Some(Bytes::from(bytes))
            }
        };

        let approximate_size = self.id.as_ref().map_or(0, String::len)
            + partition_key.len()
            + payload.as_ref().map_or(0, Bytes::len)
            + self.options.if_match.as_ref().map_or(0, String::len)
            + self.options.if_none_match.as_ref().map_or(0, String::len);

        Ok(MaterializedOperation {
            partition_key: partition_key.into(),
            payload,
            approximate_size,
        })
    }
}

impl AsRef<Operation> for Operation {
    fn as_ref(&self) -> &Operation {
        self
    }
}

impl ResourceSource {
    fn deferred<T>(value: T) -> Self
    where
        T: Serialize + Send + Sync + 'static,
    {
        Self::Deferred(Arc::new(move || serde_json::to_vec(&value)))
    }
}

impl Debug for ResourceSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Raw(bytes) => write!(f, "Raw(<{} bytes>)", bytes.len()),
            Self::Deferred(_) => f.write_str("Deferred"),
        }
    }
}

impl Debug for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Operation")
            .field("kind", &self.kind)
            .field("id", &self.id)
            .field("partition_key", &self.partition_key)
            .field("resource", &self.resource)
            .field("options", &self.options)
            .field("materialized", &self.is_materialized())
            .finish()
    }
}
