//! Inbound change events.
//!
//! A [`ChangeEvent`] is one bus notification describing one or more row
//! changes for a model. It is immutable once received and scoped to a single
//! handling attempt.

use crate::{Attributes, ModelName, Version};
use serde::{Deserialize, Serialize};

/// The kind of change an event carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    Update,
    Destroy,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::Update => "update",
            EventKind::Destroy => "destroy",
        }
    }
}

/// One inbound notification describing row changes for a model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeEvent {
    /// What happened to the rows
    pub kind: EventKind,
    /// Source-side model the rows belong to
    pub model_name: ModelName,
    /// Ordered wire-format rows (field name to value)
    pub rows: Vec<Attributes>,
    /// Monotonically comparable version stamp for the whole event
    pub version: Version,
    /// Opaque context supplied by the publisher
    #[serde(default)]
    pub source_context: Attributes,
}

impl ChangeEvent {
    pub fn new(
        kind: EventKind,
        model_name: impl Into<ModelName>,
        rows: Vec<Attributes>,
        version: Version,
    ) -> Self {
        Self {
            kind,
            model_name: model_name.into(),
            rows,
            version,
            source_context: Attributes::new(),
        }
    }

    /// An event carrying created or updated rows.
    pub fn update(model_name: impl Into<ModelName>, rows: Vec<Attributes>, version: Version) -> Self {
        Self::new(EventKind::Update, model_name, rows, version)
    }

    /// An event carrying destroyed rows.
    pub fn destroy(model_name: impl Into<ModelName>, rows: Vec<Attributes>, version: Version) -> Self {
        Self::new(EventKind::Destroy, model_name, rows, version)
    }

    /// Attach publisher-supplied context.
    pub fn with_context(mut self, context: Attributes) -> Self {
        self.source_context = context;
        self
    }
}
