//! Error types for the Relay engine.
//!
//! The taxonomy is deliberate: configuration problems fail at registration
//! time and never at event time, while everything that happens during one
//! handling attempt aborts that event as a unit and surfaces to the caller.

use thiserror::Error;

/// Registration-time configuration errors. These are raised while building a
/// [`TargetSpec`](crate::TargetSpec) and never while handling an event.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// A hook was registered at an unknown execution point.
    #[error("Wrong context, available contexts are: [:before_event, :after_event]")]
    InvalidHookContext,

    #[error("target_keys must not be empty (model: {0})")]
    EmptyTargetKeys(String),

    /// The key is renamed away by a mapping override, so no incoming row
    /// could ever resolve it to a storage column.
    #[error("target key '{key}' never resolves to a storage column (model: {model})")]
    UnresolvableTargetKey { model: String, key: String },

    #[error("model already registered: {0}")]
    DuplicateModel(String),
}

/// Errors surfaced by a storage backend.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StorageError {
    /// A row lock could not be acquired within the adapter's timeout.
    /// Aborts the current event only; the core never retries.
    #[error("lock wait timed out: {0}")]
    LockTimeout(String),

    #[error("constraint violation: {0}")]
    Constraint(String),

    #[error("storage backend error: {0}")]
    Backend(String),
}

/// An error raised by a user-supplied hook callback. Aborts the enclosing
/// transaction exactly like a storage failure.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("{0}")]
pub struct HookError(pub String);

impl HookError {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

/// Errors from one receiving-handler invocation. Any of these means the
/// whole event was rolled back.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum HandlingError {
    #[error("no target registered for model: {0}")]
    UnknownModel(String),

    #[error("incoming row is missing key field '{field}' (model: {model})")]
    MissingKeyField { model: String, field: String },

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error("hook failed: {0}")]
    Hook(#[from] HookError),
}

/// Errors from the publishing pipeline.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PublishError {
    #[error("no target registered for model: {0}")]
    UnknownModel(String),

    #[error("row is missing key field '{field}' (model: {model})")]
    MissingKeyField { model: String, field: String },

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error("envelope encoding failed: {0}")]
    Encode(String),

    #[error("bus publish failed: {0}")]
    Bus(String),

    #[error("task dispatch failed: {0}")]
    Dispatch(String),
}
