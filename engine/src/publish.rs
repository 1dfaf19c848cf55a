//! The publishing pipeline.
//!
//! [`Publisher`] builds and sends a single-record change envelope to the
//! message bus. [`BatchPublisher`] scrubs many rows through the
//! serialization filter and hands one [`PublishTask`] to the external job
//! dispatcher. Both run strictly outside any storage transaction; once a
//! task is submitted, delivery is the dispatcher's problem.

use crate::{
    error::PublishError,
    event::EventKind,
    filter,
    storage::{RowKey, StorageAdapter},
    target::SpecRegistry,
    value, Attributes, ModelName, RawRow, Version,
};
use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Envelope event name consumers match on.
pub const ENVELOPE_EVENT: &str = "table_sync";

/// Per-publish options.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublishOptions {
    /// Request broker acknowledgment before the message counts as sent
    pub confirm: bool,
    /// Use caller-supplied attributes instead of a re-fetch
    pub push_original_attributes: bool,
    /// Fixed routing key, bypassing the resolver
    #[serde(skip_serializing_if = "Option::is_none")]
    pub routing_key: Option<String>,
}

impl Default for PublishOptions {
    fn default() -> Self {
        Self {
            confirm: true,
            push_original_attributes: false,
            routing_key: None,
        }
    }
}

/// Payload section of the bus envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnvelopeData {
    pub event: EventKind,
    pub model: ModelName,
    pub attributes: Vec<serde_json::Value>,
    pub version: Version,
    pub metadata: Attributes,
}

/// The full message sent to the bus for one record change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub routing_key: String,
    pub event: String,
    pub confirm_select: bool,
    pub realtime: bool,
    pub headers: Attributes,
    pub data: EnvelopeData,
}

/// One batch of rows handed to the external job dispatcher.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PublishTask {
    pub model_name: ModelName,
    /// Wire-safe attribute rows, already filtered
    pub rows: Vec<serde_json::Value>,
    pub options: PublishOptions,
}

/// Message-bus seam. The transport and its delivery guarantees live behind
/// this trait.
#[async_trait]
pub trait MessageBus: Send + Sync {
    async fn publish(&self, envelope: &Envelope) -> Result<(), PublishError>;
}

/// Asynchronous job-dispatch seam used by [`BatchPublisher`].
#[async_trait]
pub trait JobDispatcher: Send + Sync {
    async fn submit(&self, task: PublishTask) -> Result<(), PublishError>;
}

/// Resolves the routing key from (model name, envelope metadata).
pub type RoutingKeyResolver = Arc<dyn Fn(&str, &Attributes) -> String + Send + Sync>;

/// Model-specific "attributes for sync" extension point: derives the
/// published attributes from the stored row.
pub type SyncAttributesFn = Arc<dyn Fn(&Attributes) -> RawRow + Send + Sync>;

/// Process-wide publishing configuration, set once at startup.
#[derive(Clone, Default)]
pub struct PublisherConfig {
    headers: Attributes,
    metadata: Attributes,
    routing_key_resolver: Option<RoutingKeyResolver>,
    sync_attributes: Option<SyncAttributesFn>,
}

impl PublisherConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn headers(mut self, headers: Attributes) -> Self {
        self.headers = headers;
        self
    }

    pub fn metadata(mut self, metadata: Attributes) -> Self {
        self.metadata = metadata;
        self
    }

    /// Override the default model-name routing.
    pub fn routing_key_resolver(
        mut self,
        resolver: impl Fn(&str, &Attributes) -> String + Send + Sync + 'static,
    ) -> Self {
        self.routing_key_resolver = Some(Arc::new(resolver));
        self
    }

    /// Install a model-specific attributes-for-sync strategy. Without one,
    /// the stored row is published as-is.
    pub fn sync_attributes(
        mut self,
        strategy: impl Fn(&Attributes) -> RawRow + Send + Sync + 'static,
    ) -> Self {
        self.sync_attributes = Some(Arc::new(strategy));
        self
    }
}

/// Builds and sends a single-record change envelope.
pub struct Publisher<A: StorageAdapter, B: MessageBus> {
    adapter: A,
    bus: B,
    registry: SpecRegistry,
    config: PublisherConfig,
}

impl<A: StorageAdapter, B: MessageBus> Publisher<A, B> {
    pub fn new(adapter: A, bus: B, registry: SpecRegistry) -> Self {
        Self {
            adapter,
            bus,
            registry,
            config: PublisherConfig::default(),
        }
    }

    pub fn with_config(mut self, config: PublisherConfig) -> Self {
        self.config = config;
        self
    }

    /// Publish the current state of one record. An absent record is a
    /// silent no-op: no error, no message. Returns whether a message was
    /// sent.
    pub async fn publish_now(
        &self,
        model_name: &str,
        row: &RawRow,
        options: &PublishOptions,
    ) -> Result<bool, PublishError> {
        let spec = self
            .registry
            .get(model_name)
            .ok_or_else(|| PublishError::UnknownModel(model_name.to_string()))?;

        let attributes = if options.push_original_attributes {
            row.clone()
        } else {
            // Re-fetch by natural key; the key columns come from the row
            let mut key = RowKey::new();
            for column in spec.target_keys() {
                let value = row.get(column).ok_or_else(|| PublishError::MissingKeyField {
                    model: model_name.to_string(),
                    field: column.clone(),
                })?;
                key.insert(column.clone(), value.to_json());
            }

            let mut tx = self.adapter.begin().await?;
            let stored = self.adapter.find(&mut tx, spec.to_table(), &key).await;
            // The transaction is read-only; a failed rollback must not mask
            // the fetch result or abort a publish whose fetch succeeded.
            if let Err(rollback_err) = self.adapter.rollback(tx).await {
                tracing::warn!(
                    model = %model_name,
                    error = %rollback_err,
                    "rollback failed after publish fetch"
                );
            }

            match stored? {
                Some(stored) => match &self.config.sync_attributes {
                    Some(strategy) => strategy(&stored),
                    None => value::raw_row(&stored),
                },
                None => {
                    tracing::debug!(model = %model_name, key = %key.canonical(),
                        "publish skipped, record absent");
                    return Ok(false);
                }
            }
        };

        let scrubbed = filter::scrub_row(&attributes);
        let attributes_json =
            serde_json::to_value(&scrubbed).map_err(|e| PublishError::Encode(e.to_string()))?;

        let routing_key = match &options.routing_key {
            Some(key) => key.clone(),
            None => match &self.config.routing_key_resolver {
                Some(resolver) => resolver(model_name, &self.config.metadata),
                None => model_name.to_string(),
            },
        };

        let envelope = Envelope {
            routing_key,
            event: ENVELOPE_EVENT.to_string(),
            confirm_select: true,
            realtime: true,
            headers: self.config.headers.clone(),
            data: EnvelopeData {
                event: EventKind::Update,
                model: model_name.to_string(),
                attributes: vec![attributes_json],
                version: now_version(),
                metadata: self.config.metadata.clone(),
            },
        };

        self.bus.publish(&envelope).await?;
        Ok(true)
    }
}

/// Filters and batches rows, then hands one serialized task to the job
/// dispatcher for out-of-transaction delivery.
pub struct BatchPublisher<D: JobDispatcher> {
    dispatcher: D,
    push_original_attributes: bool,
}

impl<D: JobDispatcher> BatchPublisher<D> {
    pub fn new(dispatcher: D) -> Self {
        Self {
            dispatcher,
            push_original_attributes: false,
        }
    }

    /// Carry the caller's attributes through to the eventual publish
    /// instead of re-fetching at delivery time.
    pub fn push_original_attributes(mut self, enabled: bool) -> Self {
        self.push_original_attributes = enabled;
        self
    }

    /// Scrub every row and submit exactly one task to the dispatcher.
    pub async fn publish(&self, model_name: &str, rows: &[RawRow]) -> Result<(), PublishError> {
        let mut encoded = Vec::with_capacity(rows.len());
        for row in rows {
            let scrubbed = filter::scrub_row(row);
            encoded
                .push(serde_json::to_value(&scrubbed).map_err(|e| PublishError::Encode(e.to_string()))?);
        }

        let task = PublishTask {
            model_name: model_name.to_string(),
            rows: encoded,
            options: PublishOptions {
                confirm: true,
                push_original_attributes: self.push_original_attributes,
                routing_key: None,
            },
        };

        tracing::debug!(model = %model_name, rows = task.rows.len(), "submitting publish task");
        self.dispatcher.submit(task).await
    }
}

/// Version stamp for outgoing envelopes: current time in epoch millis.
fn now_version() -> Version {
    Utc::now().timestamp_millis() as Version
}
