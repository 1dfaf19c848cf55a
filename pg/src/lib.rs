//! Postgres storage backend for Relay.
//!
//! [`PgAdapter`] implements the engine's `StorageAdapter` seam over a sqlx
//! connection pool. Each handled event runs in one database transaction;
//! per-row locking uses transaction-scoped advisory locks so concurrent
//! handlers of the same record serialize without touching table locks.

mod adapter;
pub mod pool;

pub use adapter::PgAdapter;
pub use pool::{create_pool, Pool};
