use std::fmt;

use serde::{Deserialize, Serialize};

/// A single component of a (possibly hierarchical) partition key.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PartitionKeyValue {
    Null,
    Bool(bool),
    Number(i64),
    String(String),
}

/// Logical partition key of an item.
///
/// The dispatcher treats the key as opaque: it only compares keys, hashes
/// them, and hands them to the range resolver.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PartitionKey(Vec<PartitionKeyValue>);

/// A pre-computed partition key hash.
///
/// Only meaningful to the server routing layer. Batched requests address
/// logical keys and cannot carry it.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct EffectivePartitionKey(pub String);

impl PartitionKey {
    pub fn new(components: Vec<PartitionKeyValue>) -> Self {
        Self(components)
    }

    /// A key addressing items that have no partition key value.
    pub fn none() -> Self {
        Self(vec![PartitionKeyValue::Null])
    }

    pub fn components(&self) -> &[PartitionKeyValue] {
        &self.0
    }

    /// JSON representation used both on the wire and for size estimates.
    pub fn to_json(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }
}

impl fmt::Display for PartitionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match serde_json::to_string(self) {
            Ok(json) => f.write_str(&json),
            Err(_) => write!(f, "{:?}", self.0),
        }
    }
}

impl From<&str> for PartitionKey {
    fn from(value: &str) -> Self {
        Self(vec![PartitionKeyValue::String(value.to_string())])
    }
}

impl From<String> for PartitionKey {
    fn from(value: String) -> Self {
        Self(vec![PartitionKeyValue::String(value)])
    }
}

impl From<i64> for PartitionKey {
    fn from(value: i64) -> Self {
        Self(vec![PartitionKeyValue::Number(value)])
    }
}

impl From<bool> for PartitionKey {
    fn from(value: bool) -> Self {
        Self(vec![PartitionKeyValue::Bool(value)])
    }
}
