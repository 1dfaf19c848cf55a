//! User-supplied callbacks bound to named execution points.
//!
//! Hooks run once per batch, inside the same transaction as the writes they
//! observe. `before_event` hooks run after locking and version resolution
//! but before storage writes; `after_event` hooks run after the writes.
//! Both see the same grouping of affected rows: model name to the ordered,
//! post-mapping attribute values actually applied.

use crate::{error::ConfigError, error::HookError, Attributes, ModelName};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

/// Rows affected in one batch, grouped by model name, in handling order.
pub type GroupedRows = BTreeMap<ModelName, Vec<Attributes>>;

/// A hook callback. Errors abort the enclosing transaction.
pub type HookFn = Arc<dyn Fn(&GroupedRows) -> Result<(), HookError> + Send + Sync>;

/// The fixed set of hook execution points.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HookPoint {
    /// After locking and version resolution, before storage writes
    BeforeEvent,
    /// After storage writes, still inside the open transaction
    AfterEvent,
}

impl HookPoint {
    /// Parse a configured execution-point name. A leading `:` is tolerated
    /// so symbol-style configuration ports over unchanged.
    pub fn parse(name: &str) -> Result<Self, ConfigError> {
        match name.trim_start_matches(':') {
            "before_event" => Ok(HookPoint::BeforeEvent),
            "after_event" => Ok(HookPoint::AfterEvent),
            _ => Err(ConfigError::InvalidHookContext),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            HookPoint::BeforeEvent => "before_event",
            HookPoint::AfterEvent => "after_event",
        }
    }
}

/// Callbacks registered per execution point, invoked in registration order.
#[derive(Clone, Default)]
pub struct HookRegistry {
    before: Vec<HookFn>,
    after: Vec<HookFn>,
}

impl HookRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a callback at a named execution point. The point name is
    /// validated here, before any row is ever processed.
    pub fn register(
        &mut self,
        point: &str,
        callback: impl Fn(&GroupedRows) -> Result<(), HookError> + Send + Sync + 'static,
    ) -> Result<(), ConfigError> {
        match HookPoint::parse(point)? {
            HookPoint::BeforeEvent => self.before.push(Arc::new(callback)),
            HookPoint::AfterEvent => self.after.push(Arc::new(callback)),
        }
        Ok(())
    }

    /// Invoke every callback at `point` in registration order. The first
    /// error propagates immediately; remaining callbacks do not run.
    pub fn run(&self, point: HookPoint, rows: &GroupedRows) -> Result<(), HookError> {
        let callbacks = match point {
            HookPoint::BeforeEvent => &self.before,
            HookPoint::AfterEvent => &self.after,
        };
        for callback in callbacks {
            callback(rows)?;
        }
        Ok(())
    }

    pub fn is_empty(&self) -> bool {
        self.before.is_empty() && self.after.is_empty()
    }
}

impl fmt::Debug for HookRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HookRegistry")
            .field("before", &self.before.len())
            .field("after", &self.after.len())
            .finish()
    }
}
