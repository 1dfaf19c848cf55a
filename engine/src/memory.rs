//! In-memory storage backend.
//!
//! Used in tests and by embedders that keep their receiving-side state in
//! process. A transaction takes the store-wide mutex, so concurrent
//! handlers serialize at `begin` rather than per row; coarser than a real
//! database but it preserves the locking contract. Writes are staged on the
//! transaction and only folded into shared state on commit.

use crate::{
    error::StorageError,
    storage::{RowKey, StorageAdapter},
    Attributes,
};
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};

#[derive(Debug, Default)]
struct MemoryState {
    // table -> canonical key -> row
    tables: HashMap<String, BTreeMap<String, Attributes>>,
}

impl MemoryState {
    fn get(&self, table: &str, key: &str) -> Option<&Attributes> {
        self.tables.get(table).and_then(|rows| rows.get(key))
    }
}

/// A staged write, applied to shared state on commit.
#[derive(Debug)]
enum Staged {
    Put {
        table: String,
        key: String,
        row: Attributes,
    },
    Delete {
        table: String,
        key: String,
    },
}

/// An open in-memory transaction: the store-wide guard plus staged writes.
pub struct MemoryTx {
    guard: OwnedMutexGuard<MemoryState>,
    staged: Vec<Staged>,
}

impl MemoryTx {
    /// Effective view of one row: staged writes shadow committed state.
    fn effective(&self, table: &str, key: &str) -> Option<Attributes> {
        for op in self.staged.iter().rev() {
            match op {
                Staged::Put { table: t, key: k, row } if t == table && k == key => {
                    return Some(row.clone());
                }
                Staged::Delete { table: t, key: k } if t == table && k == key => {
                    return None;
                }
                _ => {}
            }
        }
        self.guard.get(table, key).cloned()
    }
}

/// In-memory [`StorageAdapter`], cheap to clone and share.
#[derive(Clone, Default)]
pub struct MemoryAdapter {
    state: Arc<Mutex<MemoryState>>,
}

impl MemoryAdapter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a row outside any transaction. Test and bootstrap helper.
    pub async fn put(&self, table: &str, key: &RowKey, row: Attributes) {
        let mut state = self.state.lock().await;
        state
            .tables
            .entry(table.to_string())
            .or_default()
            .insert(key.canonical(), row);
    }

    /// Read a row outside any transaction.
    pub async fn get(&self, table: &str, key: &RowKey) -> Option<Attributes> {
        let state = self.state.lock().await;
        state.get(table, &key.canonical()).cloned()
    }

    /// Number of rows currently committed in `table`.
    pub async fn row_count(&self, table: &str) -> usize {
        let state = self.state.lock().await;
        state.tables.get(table).map_or(0, |rows| rows.len())
    }

    /// All committed rows of `table`, in key order.
    pub async fn rows(&self, table: &str) -> Vec<Attributes> {
        let state = self.state.lock().await;
        state
            .tables
            .get(table)
            .map(|rows| rows.values().cloned().collect())
            .unwrap_or_default()
    }
}

#[async_trait]
impl StorageAdapter for MemoryAdapter {
    type Tx = MemoryTx;

    async fn begin(&self) -> Result<Self::Tx, StorageError> {
        let guard = Arc::clone(&self.state).lock_owned().await;
        Ok(MemoryTx {
            guard,
            staged: Vec::new(),
        })
    }

    async fn lock(
        &self,
        _tx: &mut Self::Tx,
        _table: &str,
        _key: &RowKey,
    ) -> Result<(), StorageError> {
        // begin() already holds the store-wide mutex, which serializes every
        // concurrent handler; per-key locks have nothing left to exclude.
        Ok(())
    }

    async fn find(
        &self,
        tx: &mut Self::Tx,
        table: &str,
        key: &RowKey,
    ) -> Result<Option<Attributes>, StorageError> {
        Ok(tx.effective(table, &key.canonical()))
    }

    async fn create(
        &self,
        tx: &mut Self::Tx,
        table: &str,
        key: &RowKey,
        row: &Attributes,
    ) -> Result<(), StorageError> {
        let key = key.canonical();
        if tx.effective(table, &key).is_some() {
            return Err(StorageError::Constraint(format!(
                "duplicate key in {table}: {key}"
            )));
        }
        tx.staged.push(Staged::Put {
            table: table.to_string(),
            key,
            row: row.clone(),
        });
        Ok(())
    }

    async fn update(
        &self,
        tx: &mut Self::Tx,
        table: &str,
        key: &RowKey,
        row: &Attributes,
    ) -> Result<(), StorageError> {
        let key = key.canonical();
        if tx.effective(table, &key).is_none() {
            return Err(StorageError::Backend(format!(
                "update of absent row in {table}: {key}"
            )));
        }
        tx.staged.push(Staged::Put {
            table: table.to_string(),
            key,
            row: row.clone(),
        });
        Ok(())
    }

    async fn delete(
        &self,
        tx: &mut Self::Tx,
        table: &str,
        key: &RowKey,
    ) -> Result<bool, StorageError> {
        let key = key.canonical();
        let existed = tx.effective(table, &key).is_some();
        if existed {
            tx.staged.push(Staged::Delete {
                table: table.to_string(),
                key,
            });
        }
        Ok(existed)
    }

    async fn commit(&self, mut tx: Self::Tx) -> Result<(), StorageError> {
        for op in tx.staged.drain(..) {
            match op {
                Staged::Put { table, key, row } => {
                    tx.guard.tables.entry(table).or_default().insert(key, row);
                }
                Staged::Delete { table, key } => {
                    if let Some(rows) = tx.guard.tables.get_mut(&table) {
                        rows.remove(&key);
                    }
                }
            }
        }
        Ok(())
    }

    async fn rollback(&self, tx: Self::Tx) -> Result<(), StorageError> {
        // Dropping the transaction discards staged writes and releases the
        // store-wide guard.
        drop(tx);
        Ok(())
    }
}
