//! # Relay Engine
//!
//! Middleware for propagating row-level changes between independently
//! deployed services. One side publishes change events for a logical record,
//! the other applies them to its own storage, guarded against out-of-order
//! delivery and concurrent local writers.
//!
//! This crate sits between an application's storage layer and a message bus.
//! It is not a storage engine: concrete backends plug in behind the
//! [`StorageAdapter`] trait, and the bus and job dispatcher are trait seams
//! ([`MessageBus`], [`JobDispatcher`]) owned by the embedding application.
//!
//! ## Receiving pipeline
//!
//! An inbound [`ChangeEvent`] flows through one [`ReceivingHandler`]
//! invocation inside a single storage transaction:
//!
//! 1. Every row is mapped from wire field names to storage column names
//!    according to the model's [`TargetSpec`].
//! 2. Row locks are acquired for all natural keys before any read, so two
//!    concurrent deliveries cannot both observe "absent" and double-create.
//! 3. [`VersionGuard`] decides per row whether the incoming version is newer
//!    than the stored state. Stale and duplicate deliveries are absorbed
//!    silently, which makes redelivery idempotent.
//! 4. Hooks registered at `before_event` run, then storage writes happen,
//!    then `after_event` hooks run, all inside the open transaction.
//! 5. Commit. Any failure rolls the whole event back; no partial
//!    application, no internal retry.
//!
//! ## Publishing pipeline
//!
//! [`Publisher`] emits one envelope per record, re-fetching current
//! attributes through the adapter. [`BatchPublisher`] scrubs rows through
//! the serialization [`filter`] (times and non-finite floats never cross the
//! wire) and hands a single [`PublishTask`] to the external dispatcher.
//!
//! ## Quick start
//!
//! ```rust
//! use relay_engine::{ChangeEvent, MemoryAdapter, ReceivingHandler, SpecRegistry, TargetSpec};
//! use serde_json::json;
//!
//! # fn row(v: serde_json::Value) -> relay_engine::Attributes {
//! #     v.as_object().cloned().unwrap()
//! # }
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! // 1. Declare how the "User" model lands in local storage
//! let spec = TargetSpec::builder("User")
//!     .to_table("users")
//!     .target_keys(["external_id"])
//!     .map_field("id", "external_id")
//!     .build()?;
//!
//! let mut registry = SpecRegistry::new();
//! registry.register(spec)?;
//!
//! // 2. Handle an inbound event
//! let handler = ReceivingHandler::new(MemoryAdapter::new(), registry);
//! let event = ChangeEvent::update(
//!     "User",
//!     vec![row(json!({"id": 1, "name": "Alice"}))],
//!     1_706_745_600_000,
//! );
//!
//! let outcomes = handler.handle(&event).await?;
//! assert_eq!(outcomes.len(), 1);
//! # Ok(())
//! # }
//! ```

pub mod error;
pub mod event;
pub mod filter;
pub mod guard;
pub mod handler;
pub mod hooks;
pub mod mapper;
pub mod memory;
pub mod publish;
pub mod storage;
pub mod target;
pub mod value;

// Re-export main types at crate root
pub use error::{ConfigError, HandlingError, HookError, PublishError, StorageError};
pub use event::{ChangeEvent, EventKind};
pub use guard::{Decision, VersionGuard};
pub use handler::{ReceivingHandler, RowAction, RowOutcome};
pub use hooks::{GroupedRows, HookPoint, HookRegistry};
pub use memory::MemoryAdapter;
pub use publish::{
    BatchPublisher, Envelope, EnvelopeData, JobDispatcher, MessageBus, PublishOptions,
    PublishTask, Publisher, PublisherConfig, ENVELOPE_EVENT,
};
pub use storage::{RowKey, StorageAdapter};
pub use target::{SpecRegistry, TargetSpec, TargetSpecBuilder};
pub use value::{RawKey, RawValue};

/// Type aliases for clarity
pub type ModelName = String;
pub type TableName = String;
pub type FieldName = String;
pub type Version = u64;
/// A wire or storage row: field name to JSON value.
pub type Attributes = serde_json::Map<String, serde_json::Value>;
/// A pre-wire attribute row as handed over by application code.
pub type RawRow = std::collections::BTreeMap<String, RawValue>;
