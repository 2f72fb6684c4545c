//! Record trait for types persisted in the Store

use std::collections::HashMap;

use serde::Serialize;
use serde::de::DeserializeOwned;

/// A value stored in the index table for a record field
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IndexValue {
    String(String),
    Int(i64),
    Bool(bool),
}

impl From<&str> for IndexValue {
    fn from(s: &str) -> Self {
        Self::String(s.to_string())
    }
}

impl From<String> for IndexValue {
    fn from(s: String) -> Self {
        Self::String(s)
    }
}

impl From<i64> for IndexValue {
    fn from(v: i64) -> Self {
        Self::Int(v)
    }
}

impl From<bool> for IndexValue {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}

/// A persistable document
///
/// Implementors are serialized to JSON as a whole. `indexed_fields` returns
/// the subset of fields that `Store::list` can filter on.
pub trait Record: Serialize + DeserializeOwned + Clone + Send {
    /// Unique identifier within the collection
    fn id(&self) -> &str;

    /// Last update timestamp (Unix milliseconds)
    fn updated_at(&self) -> i64;

    /// Collection this record type lives in
    fn collection_name() -> &'static str;

    /// Fields exposed to filtered queries
    fn indexed_fields(&self) -> HashMap<String, IndexValue>;
}
