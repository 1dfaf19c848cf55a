//! The storage seam.
//!
//! [`StorageAdapter`] is the uniform capability interface every backend
//! implements: lookup by natural key, row locking, create, update, delete,
//! all inside a caller-supplied transaction scope. The receiving handler
//! opens exactly one transaction per event and commits or rolls back as a
//! unit; the adapter never retries on its own.

use crate::{error::StorageError, Attributes, FieldName};
use async_trait::async_trait;
use serde_json::Value;
use std::collections::BTreeMap;

/// The natural key locating one row: ordered column name to value.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RowKey(BTreeMap<FieldName, Value>);

impl RowKey {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, column: impl Into<FieldName>, value: Value) {
        self.0.insert(column.into(), value);
    }

    pub fn get(&self, column: &str) -> Option<&Value> {
        self.0.get(column)
    }

    pub fn fields(&self) -> impl Iterator<Item = (&FieldName, &Value)> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Deterministic text form, used for lock keys and in-memory indexing.
    /// Column order is fixed by the underlying ordered map.
    pub fn canonical(&self) -> String {
        let mut out = String::new();
        for (i, (column, value)) in self.0.iter().enumerate() {
            if i > 0 {
                out.push(',');
            }
            out.push_str(column);
            out.push('=');
            out.push_str(&value.to_string());
        }
        out
    }
}

impl<K: Into<FieldName>> FromIterator<(K, Value)> for RowKey {
    fn from_iter<I: IntoIterator<Item = (K, Value)>>(iter: I) -> Self {
        Self(iter.into_iter().map(|(k, v)| (k.into(), v)).collect())
    }
}

/// Uniform capability interface over heterogeneous storage backends.
///
/// `lock` must be effective for absent rows as well: two concurrent
/// handlers locking the same key must serialize even when neither row
/// exists yet, otherwise both observe "absent" and both create.
#[async_trait]
pub trait StorageAdapter: Send + Sync {
    /// Backend transaction handle. Dropped on rollback.
    type Tx: Send;

    async fn begin(&self) -> Result<Self::Tx, StorageError>;

    /// Acquire a row-level lock keyed on the natural key. Blocks until
    /// available or fails with [`StorageError::LockTimeout`] per the
    /// adapter's configured policy.
    async fn lock(&self, tx: &mut Self::Tx, table: &str, key: &RowKey)
        -> Result<(), StorageError>;

    async fn find(
        &self,
        tx: &mut Self::Tx,
        table: &str,
        key: &RowKey,
    ) -> Result<Option<Attributes>, StorageError>;

    /// Insert a new row under its natural key. An existing row under the
    /// same key is a [`StorageError::Constraint`].
    async fn create(
        &self,
        tx: &mut Self::Tx,
        table: &str,
        key: &RowKey,
        row: &Attributes,
    ) -> Result<(), StorageError>;

    async fn update(
        &self,
        tx: &mut Self::Tx,
        table: &str,
        key: &RowKey,
        row: &Attributes,
    ) -> Result<(), StorageError>;

    /// Delete the row, returning whether anything was removed.
    async fn delete(
        &self,
        tx: &mut Self::Tx,
        table: &str,
        key: &RowKey,
    ) -> Result<bool, StorageError>;

    async fn commit(&self, tx: Self::Tx) -> Result<(), StorageError>;

    async fn rollback(&self, tx: Self::Tx) -> Result<(), StorageError>;
}
