//! The receiving pipeline.
//!
//! One [`ReceivingHandler::handle`] call processes one inbound
//! [`ChangeEvent`] inside one storage transaction: map, lock, resolve
//! versions, run hooks, apply, commit. Any failure rolls the whole event
//! back and surfaces to the caller; redelivery is the bus's job and is safe
//! because stale versions are skipped.

use crate::{
    error::HandlingError,
    event::{ChangeEvent, EventKind},
    guard::{Decision, VersionGuard},
    hooks::{GroupedRows, HookPoint},
    mapper,
    storage::{RowKey, StorageAdapter},
    target::{SpecRegistry, TargetSpec},
    Attributes, Version,
};
use serde_json::json;
use std::collections::HashMap;

/// What happened to one row during a handling pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RowAction {
    Created,
    Updated,
    Destroyed,
    /// Stored state was as new or newer
    SkippedStale,
    /// Destroy for a row that never existed here
    SkippedAbsent,
}

/// Transient record of one row's fate, valid for a single transaction.
#[derive(Debug, Clone, PartialEq)]
pub struct RowOutcome {
    /// The natural key the row was matched on
    pub key: RowKey,
    pub action: RowAction,
    /// Post-apply attributes for created/updated rows
    pub row: Option<Attributes>,
}

/// One row's resolved plan, between version resolution and apply.
struct RowPlan {
    key: RowKey,
    decision: Decision,
    /// Mapped payload with the version stamp written in
    payload: Attributes,
}

/// Orchestrates the receiving pipeline over a storage adapter and the
/// registered target specs. Cheap to share; holds no per-event state.
pub struct ReceivingHandler<A: StorageAdapter> {
    adapter: A,
    registry: SpecRegistry,
}

impl<A: StorageAdapter> ReceivingHandler<A> {
    pub fn new(adapter: A, registry: SpecRegistry) -> Self {
        Self { adapter, registry }
    }

    pub fn adapter(&self) -> &A {
        &self.adapter
    }

    /// Handle one inbound event. Returns one outcome per input row, in row
    /// order. All-or-nothing: on error the transaction is rolled back and
    /// nothing from this event is persisted.
    pub async fn handle(&self, event: &ChangeEvent) -> Result<Vec<RowOutcome>, HandlingError> {
        let spec = self
            .registry
            .get(&event.model_name)
            .ok_or_else(|| HandlingError::UnknownModel(event.model_name.clone()))?;

        // Received -> Mapped: fail on malformed rows before touching storage
        let mut mapped = Vec::with_capacity(event.rows.len());
        for row in &event.rows {
            let columns = mapper::map_row(row, spec);
            let key = mapper::extract_key(&columns, spec)?;
            mapped.push((key, columns));
        }

        let mut tx = self.adapter.begin().await?;
        match self.apply_event(&mut tx, spec, event, mapped).await {
            Ok(outcomes) => {
                self.adapter.commit(tx).await?;
                Ok(outcomes)
            }
            Err(err) => {
                if let Err(rollback_err) = self.adapter.rollback(tx).await {
                    tracing::warn!(
                        model = %event.model_name,
                        error = %rollback_err,
                        "rollback failed after aborted event"
                    );
                }
                Err(err)
            }
        }
    }

    async fn apply_event(
        &self,
        tx: &mut A::Tx,
        spec: &TargetSpec,
        event: &ChangeEvent,
        mapped: Vec<(RowKey, Attributes)>,
    ) -> Result<Vec<RowOutcome>, HandlingError> {
        let table = spec.to_table();

        // Mapped -> Locked: lock every key before the first read, so two
        // concurrent deliveries cannot both observe "absent" and create.
        for (key, _) in &mapped {
            self.adapter.lock(tx, table, key).await?;
        }

        // Locked -> Resolved. Later rows resolve against what earlier rows
        // staged, so duplicate keys within one event never double-create:
        // the second duplicate sees the first one's version and skips.
        let mut plans = Vec::with_capacity(mapped.len());
        let mut staged_versions: HashMap<String, Option<Version>> = HashMap::new();
        for (key, columns) in mapped {
            let canonical = key.canonical();
            let stored_version = match staged_versions.get(&canonical) {
                Some(version) => *version,
                None => {
                    let stored = self.adapter.find(tx, table, &key).await?;
                    stored
                        .as_ref()
                        .map(|row| VersionGuard::stored_version(row, spec.version_column()))
                }
            };
            let decision = VersionGuard::decide(stored_version, event.version, event.kind);
            let after_apply = match decision {
                Decision::Insert | Decision::Replace => Some(event.version),
                Decision::Remove => None,
                Decision::SkipStale | Decision::SkipAbsent => stored_version,
            };
            staged_versions.insert(canonical, after_apply);
            tracing::debug!(
                model = %event.model_name,
                key = %key.canonical(),
                ?decision,
                incoming = event.version,
                stored = ?stored_version,
                "resolved row"
            );

            let mut payload = columns;
            payload.insert(spec.version_column().to_string(), json!(event.version));
            plans.push(RowPlan { key, decision, payload });
        }

        let changed = grouped_changes(&event.model_name, &plans);
        let run_hooks = !changed.is_empty();

        // Hooks at before_event see the rows about to be written, already
        // mapped and version-stamped.
        if run_hooks {
            spec.hooks().run(HookPoint::BeforeEvent, &changed)?;
        }

        // Resolved -> Applied
        let mut outcomes = Vec::with_capacity(plans.len());
        for plan in &plans {
            let outcome = match plan.decision {
                Decision::Insert => {
                    self.adapter.create(tx, table, &plan.key, &plan.payload).await?;
                    RowOutcome {
                        key: plan.key.clone(),
                        action: RowAction::Created,
                        row: Some(plan.payload.clone()),
                    }
                }
                Decision::Replace => {
                    self.adapter.update(tx, table, &plan.key, &plan.payload).await?;
                    RowOutcome {
                        key: plan.key.clone(),
                        action: RowAction::Updated,
                        row: Some(plan.payload.clone()),
                    }
                }
                Decision::Remove => {
                    self.adapter.delete(tx, table, &plan.key).await?;
                    RowOutcome {
                        key: plan.key.clone(),
                        action: RowAction::Destroyed,
                        row: None,
                    }
                }
                Decision::SkipStale => RowOutcome {
                    key: plan.key.clone(),
                    action: RowAction::SkippedStale,
                    row: None,
                },
                Decision::SkipAbsent => RowOutcome {
                    key: plan.key.clone(),
                    action: RowAction::SkippedAbsent,
                    row: None,
                },
            };
            outcomes.push(outcome);
        }

        // after_event hooks run post-write, still inside the transaction,
        // over the same grouping the before hooks saw.
        if run_hooks {
            spec.hooks().run(HookPoint::AfterEvent, &changed)?;
        }

        Ok(outcomes)
    }
}

/// Group the rows this event will change, keyed by model name, in row
/// order. Skipped rows are not part of the grouping; destroys contribute
/// their mapped key payload.
fn grouped_changes(model_name: &str, plans: &[RowPlan]) -> GroupedRows {
    let mut changed = GroupedRows::new();
    for plan in plans {
        if plan.decision.is_write() {
            changed
                .entry(model_name.to_string())
                .or_default()
                .push(plan.payload.clone());
        }
    }
    changed
}
