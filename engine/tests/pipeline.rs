//! End-to-end tests for the receiving and publishing pipelines over the
//! in-memory backend.

use async_trait::async_trait;
use relay_engine::{
    Attributes, BatchPublisher, ChangeEvent, Envelope, GroupedRows, HandlingError, HookError,
    JobDispatcher, MemoryAdapter, MessageBus, PublishError, PublishOptions, PublishTask,
    Publisher, RawRow, RawValue, ReceivingHandler, RowAction, RowKey, SpecRegistry,
    StorageAdapter, StorageError, TargetSpec,
};
use serde_json::json;
use std::sync::{Arc, Mutex};

fn row(v: serde_json::Value) -> Attributes {
    v.as_object().cloned().unwrap()
}

fn key(v: serde_json::Value) -> RowKey {
    v.as_object()
        .unwrap()
        .iter()
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect()
}

fn registry_with(spec: TargetSpec) -> SpecRegistry {
    let mut registry = SpecRegistry::new();
    registry.register(spec).unwrap();
    registry
}

fn user_handler() -> ReceivingHandler<MemoryAdapter> {
    let spec = TargetSpec::builder("User").to_table("users").build().unwrap();
    ReceivingHandler::new(MemoryAdapter::new(), registry_with(spec))
}

// ---------------------------------------------------------------------------
// Receiving: apply, idempotence, versions
// ---------------------------------------------------------------------------

#[tokio::test]
async fn update_creates_missing_rows() {
    let handler = user_handler();
    let event = ChangeEvent::update(
        "User",
        vec![row(json!({"id": 1, "name": "Alice"})), row(json!({"id": 2, "name": "Bob"}))],
        100,
    );

    let outcomes = handler.handle(&event).await.unwrap();
    assert_eq!(outcomes.len(), 2);
    assert!(outcomes.iter().all(|o| o.action == RowAction::Created));

    let adapter = handler.adapter();
    assert_eq!(adapter.row_count("users").await, 2);
    let stored = adapter.get("users", &key(json!({"id": 1}))).await.unwrap();
    assert_eq!(stored["name"], "Alice");
    // The event version is stamped onto the stored row
    assert_eq!(stored["version"], 100);
}

#[tokio::test]
async fn replaying_an_event_is_a_no_op() {
    let handler = user_handler();
    let event = ChangeEvent::update("User", vec![row(json!({"id": 1, "name": "Alice"}))], 100);

    handler.handle(&event).await.unwrap();
    let before = handler.adapter().rows("users").await;

    let outcomes = handler.handle(&event).await.unwrap();
    assert_eq!(outcomes[0].action, RowAction::SkippedStale);
    assert_eq!(handler.adapter().rows("users").await, before);
}

#[tokio::test]
async fn version_tie_keeps_the_first_writer() {
    let handler = user_handler();
    handler
        .handle(&ChangeEvent::update("User", vec![row(json!({"id": 1, "name": "first"}))], 100))
        .await
        .unwrap();
    handler
        .handle(&ChangeEvent::update("User", vec![row(json!({"id": 1, "name": "second"}))], 100))
        .await
        .unwrap();

    let stored = handler.adapter().get("users", &key(json!({"id": 1}))).await.unwrap();
    assert_eq!(stored["name"], "first");
}

#[tokio::test]
async fn newer_version_replaces_older_state() {
    let handler = user_handler();
    handler
        .handle(&ChangeEvent::update("User", vec![row(json!({"id": 1, "name": "old"}))], 100))
        .await
        .unwrap();
    let outcomes = handler
        .handle(&ChangeEvent::update("User", vec![row(json!({"id": 1, "name": "new"}))], 101))
        .await
        .unwrap();

    assert_eq!(outcomes[0].action, RowAction::Updated);
    let stored = handler.adapter().get("users", &key(json!({"id": 1}))).await.unwrap();
    assert_eq!(stored["name"], "new");
    assert_eq!(stored["version"], 101);
}

#[tokio::test]
async fn stale_update_is_absorbed_silently() {
    let handler = user_handler();
    handler
        .handle(&ChangeEvent::update("User", vec![row(json!({"id": 1, "name": "current"}))], 200))
        .await
        .unwrap();

    let outcomes = handler
        .handle(&ChangeEvent::update("User", vec![row(json!({"id": 1, "name": "late"}))], 150))
        .await
        .unwrap();

    assert_eq!(outcomes[0].action, RowAction::SkippedStale);
    let stored = handler.adapter().get("users", &key(json!({"id": 1}))).await.unwrap();
    assert_eq!(stored["name"], "current");
}

#[tokio::test]
async fn destroy_removes_newer_versions_only() {
    let handler = user_handler();
    handler
        .handle(&ChangeEvent::update("User", vec![row(json!({"id": 1}))], 100))
        .await
        .unwrap();

    // Same version: the applied state wins the tie
    let outcomes = handler
        .handle(&ChangeEvent::destroy("User", vec![row(json!({"id": 1}))], 100))
        .await
        .unwrap();
    assert_eq!(outcomes[0].action, RowAction::SkippedStale);
    assert_eq!(handler.adapter().row_count("users").await, 1);

    let outcomes = handler
        .handle(&ChangeEvent::destroy("User", vec![row(json!({"id": 1}))], 101))
        .await
        .unwrap();
    assert_eq!(outcomes[0].action, RowAction::Destroyed);
    assert_eq!(handler.adapter().row_count("users").await, 0);
}

#[tokio::test]
async fn duplicate_key_rows_in_one_event_apply_once() {
    let handler = user_handler();
    let event = ChangeEvent::update(
        "User",
        vec![row(json!({"id": 1, "name": "first"})), row(json!({"id": 1, "name": "second"}))],
        100,
    );

    // The second row resolves against the first row's staged write and is
    // absorbed as a same-version duplicate instead of double-creating.
    let outcomes = handler.handle(&event).await.unwrap();
    assert_eq!(outcomes[0].action, RowAction::Created);
    assert_eq!(outcomes[1].action, RowAction::SkippedStale);

    let adapter = handler.adapter();
    assert_eq!(adapter.row_count("users").await, 1);
    let stored = adapter.get("users", &key(json!({"id": 1}))).await.unwrap();
    assert_eq!(stored["name"], "first");
}

#[tokio::test]
async fn duplicate_key_rows_in_one_destroy_remove_once() {
    let handler = user_handler();
    handler
        .handle(&ChangeEvent::update("User", vec![row(json!({"id": 1}))], 100))
        .await
        .unwrap();

    let event = ChangeEvent::destroy(
        "User",
        vec![row(json!({"id": 1})), row(json!({"id": 1}))],
        101,
    );
    let outcomes = handler.handle(&event).await.unwrap();
    assert_eq!(outcomes[0].action, RowAction::Destroyed);
    assert_eq!(outcomes[1].action, RowAction::SkippedAbsent);
    assert_eq!(handler.adapter().row_count("users").await, 0);
}

#[tokio::test]
async fn destroy_of_absent_row_is_not_an_error() {
    let handler = user_handler();
    let outcomes = handler
        .handle(&ChangeEvent::destroy("User", vec![row(json!({"id": 404}))], 100))
        .await
        .unwrap();
    assert_eq!(outcomes[0].action, RowAction::SkippedAbsent);
}

#[tokio::test]
async fn unknown_model_is_rejected() {
    let handler = user_handler();
    let err = handler
        .handle(&ChangeEvent::update("Order", vec![row(json!({"id": 1}))], 1))
        .await
        .unwrap_err();
    assert_eq!(err, HandlingError::UnknownModel("Order".into()));
}

#[tokio::test]
async fn missing_key_field_fails_before_any_write() {
    let handler = user_handler();
    let event = ChangeEvent::update(
        "User",
        vec![row(json!({"id": 1, "name": "ok"})), row(json!({"name": "keyless"}))],
        100,
    );

    let err = handler.handle(&event).await.unwrap_err();
    assert!(matches!(err, HandlingError::MissingKeyField { .. }));
    assert_eq!(handler.adapter().row_count("users").await, 0);
}

// ---------------------------------------------------------------------------
// Receiving: custom key resolution
// ---------------------------------------------------------------------------

#[tokio::test]
async fn custom_key_matches_on_mapped_column() {
    let spec = TargetSpec::builder("User")
        .to_table("users")
        .map_field("id", "external_id")
        .target_keys(["external_id"])
        .build()
        .unwrap();
    let handler = ReceivingHandler::new(MemoryAdapter::new(), registry_with(spec));

    handler
        .handle(&ChangeEvent::update("User", vec![row(json!({"id": 42, "name": "Alice"}))], 100))
        .await
        .unwrap();

    // The row is stored and matched under external_id, never under the
    // wire-side primary key.
    let adapter = handler.adapter();
    let stored = adapter.get("users", &key(json!({"external_id": 42}))).await.unwrap();
    assert_eq!(stored["name"], "Alice");
    assert!(stored.get("id").is_none());
    assert!(adapter.get("users", &key(json!({"id": 42}))).await.is_none());

    // A newer event for the same source row updates in place
    handler
        .handle(&ChangeEvent::update("User", vec![row(json!({"id": 42, "name": "Updated"}))], 101))
        .await
        .unwrap();
    assert_eq!(adapter.row_count("users").await, 1);
    let stored = adapter.get("users", &key(json!({"external_id": 42}))).await.unwrap();
    assert_eq!(stored["name"], "Updated");
}

// ---------------------------------------------------------------------------
// Receiving: hooks and atomicity
// ---------------------------------------------------------------------------

#[tokio::test]
async fn hook_failure_rolls_back_the_whole_batch() {
    let spec = TargetSpec::builder("User")
        .to_table("users")
        .on("after_event", |_| Err(HookError::new("downstream refused")))
        .build()
        .unwrap();
    let handler = ReceivingHandler::new(MemoryAdapter::new(), registry_with(spec));

    // N > 1: every row was applied before the hook ran, all must vanish
    let event = ChangeEvent::update(
        "User",
        vec![row(json!({"id": 1})), row(json!({"id": 2})), row(json!({"id": 3}))],
        100,
    );
    let err = handler.handle(&event).await.unwrap_err();
    assert_eq!(err, HandlingError::Hook(HookError::new("downstream refused")));
    assert_eq!(handler.adapter().row_count("users").await, 0);

    // N = 1 behaves identically
    let event = ChangeEvent::update("User", vec![row(json!({"id": 9}))], 100);
    handler.handle(&event).await.unwrap_err();
    assert_eq!(handler.adapter().row_count("users").await, 0);
}

#[tokio::test]
async fn before_hook_failure_prevents_all_writes() {
    let spec = TargetSpec::builder("User")
        .to_table("users")
        .on("before_event", |_| Err(HookError::new("veto")))
        .build()
        .unwrap();
    let handler = ReceivingHandler::new(MemoryAdapter::new(), registry_with(spec));

    handler
        .handle(&ChangeEvent::update("User", vec![row(json!({"id": 1}))], 100))
        .await
        .unwrap_err();
    assert_eq!(handler.adapter().row_count("users").await, 0);
}

#[tokio::test]
async fn hooks_observe_post_apply_values_grouped_by_model() {
    let seen: Arc<Mutex<Vec<GroupedRows>>> = Arc::new(Mutex::new(Vec::new()));
    let captured = Arc::clone(&seen);

    let spec = TargetSpec::builder("User")
        .to_table("users")
        .map_field("id", "external_id")
        .target_keys(["external_id"])
        .on("after_event", move |rows| {
            captured.lock().unwrap().push(rows.clone());
            Ok(())
        })
        .build()
        .unwrap();
    let handler = ReceivingHandler::new(MemoryAdapter::new(), registry_with(spec));

    let event = ChangeEvent::update(
        "User",
        vec![row(json!({"id": 1, "name": "k1"})), row(json!({"id": 2, "name": "k2"}))],
        100,
    );
    handler.handle(&event).await.unwrap();

    let seen = seen.lock().unwrap();
    assert_eq!(seen.len(), 1, "hooks run once per batch, not once per row");
    let rows = &seen[0]["User"];
    assert_eq!(rows.len(), 2);
    // Post-mapping, post-apply values: renamed key column and version stamp
    assert_eq!(rows[0]["external_id"], 1);
    assert_eq!(rows[0]["version"], 100);
    assert!(rows[0].get("id").is_none());
    assert_eq!(rows[1]["external_id"], 2);
}

#[tokio::test]
async fn before_hooks_run_before_writes_and_after_hooks_after() {
    let order: Arc<Mutex<Vec<&'static str>>> = Arc::new(Mutex::new(Vec::new()));

    let before = Arc::clone(&order);
    let after = Arc::clone(&order);
    let spec = TargetSpec::builder("User")
        .to_table("users")
        .on("before_event", move |_| {
            before.lock().unwrap().push("before");
            Ok(())
        })
        .on("after_event", move |_| {
            after.lock().unwrap().push("after");
            Ok(())
        })
        .build()
        .unwrap();
    let handler = ReceivingHandler::new(MemoryAdapter::new(), registry_with(spec));

    handler
        .handle(&ChangeEvent::update("User", vec![row(json!({"id": 1}))], 100))
        .await
        .unwrap();
    assert_eq!(*order.lock().unwrap(), vec!["before", "after"]);
}

#[tokio::test]
async fn hooks_are_skipped_when_nothing_changed() {
    let calls: Arc<Mutex<usize>> = Arc::new(Mutex::new(0));
    let counter = Arc::clone(&calls);

    let spec = TargetSpec::builder("User")
        .to_table("users")
        .on("after_event", move |_| {
            *counter.lock().unwrap() += 1;
            Ok(())
        })
        .build()
        .unwrap();
    let handler = ReceivingHandler::new(MemoryAdapter::new(), registry_with(spec));

    let event = ChangeEvent::update("User", vec![row(json!({"id": 1}))], 100);
    handler.handle(&event).await.unwrap();
    assert_eq!(*calls.lock().unwrap(), 1);

    // Pure replay: no row changes, hooks must not fire
    handler.handle(&event).await.unwrap();
    assert_eq!(*calls.lock().unwrap(), 1);
}

#[tokio::test]
async fn invalid_hook_context_fails_at_registration_never_at_event_time() {
    let err = TargetSpec::builder("User")
        .on("kek_event", |_| Ok(()))
        .build()
        .unwrap_err();
    assert_eq!(
        err.to_string(),
        "Wrong context, available contexts are: [:before_event, :after_event]"
    );
}

// ---------------------------------------------------------------------------
// Publishing
// ---------------------------------------------------------------------------

#[derive(Clone, Default)]
struct RecordingBus {
    sent: Arc<Mutex<Vec<Envelope>>>,
}

#[async_trait]
impl MessageBus for RecordingBus {
    async fn publish(&self, envelope: &Envelope) -> Result<(), PublishError> {
        self.sent.lock().unwrap().push(envelope.clone());
        Ok(())
    }
}

#[derive(Clone, Default)]
struct RecordingDispatcher {
    tasks: Arc<Mutex<Vec<PublishTask>>>,
}

#[async_trait]
impl JobDispatcher for RecordingDispatcher {
    async fn submit(&self, task: PublishTask) -> Result<(), PublishError> {
        self.tasks.lock().unwrap().push(task);
        Ok(())
    }
}

fn raw(entries: Vec<(&str, RawValue)>) -> RawRow {
    entries.into_iter().map(|(k, v)| (k.to_string(), v)).collect()
}

/// Storage whose connection drops at rollback time, after the read itself
/// succeeded.
#[derive(Clone, Default)]
struct DroppedConnectionAdapter {
    inner: MemoryAdapter,
}

#[async_trait]
impl StorageAdapter for DroppedConnectionAdapter {
    type Tx = <MemoryAdapter as StorageAdapter>::Tx;

    async fn begin(&self) -> Result<Self::Tx, StorageError> {
        self.inner.begin().await
    }

    async fn lock(
        &self,
        tx: &mut Self::Tx,
        table: &str,
        key: &RowKey,
    ) -> Result<(), StorageError> {
        self.inner.lock(tx, table, key).await
    }

    async fn find(
        &self,
        tx: &mut Self::Tx,
        table: &str,
        key: &RowKey,
    ) -> Result<Option<Attributes>, StorageError> {
        self.inner.find(tx, table, key).await
    }

    async fn create(
        &self,
        tx: &mut Self::Tx,
        table: &str,
        key: &RowKey,
        row: &Attributes,
    ) -> Result<(), StorageError> {
        self.inner.create(tx, table, key, row).await
    }

    async fn update(
        &self,
        tx: &mut Self::Tx,
        table: &str,
        key: &RowKey,
        row: &Attributes,
    ) -> Result<(), StorageError> {
        self.inner.update(tx, table, key, row).await
    }

    async fn delete(
        &self,
        tx: &mut Self::Tx,
        table: &str,
        key: &RowKey,
    ) -> Result<bool, StorageError> {
        self.inner.delete(tx, table, key).await
    }

    async fn commit(&self, tx: Self::Tx) -> Result<(), StorageError> {
        self.inner.commit(tx).await
    }

    async fn rollback(&self, tx: Self::Tx) -> Result<(), StorageError> {
        self.inner.rollback(tx).await?;
        Err(StorageError::Backend("connection dropped".into()))
    }
}

#[tokio::test]
async fn publish_of_absent_record_sends_nothing() {
    let bus = RecordingBus::default();
    let publisher = Publisher::new(
        MemoryAdapter::new(),
        bus.clone(),
        registry_with(TargetSpec::builder("User").to_table("users").build().unwrap()),
    );

    let sent = publisher
        .publish_now("User", &raw(vec![("id", RawValue::Int(404))]), &PublishOptions::default())
        .await
        .unwrap();

    assert!(!sent);
    assert!(bus.sent.lock().unwrap().is_empty());
}

#[tokio::test]
async fn publish_refetches_and_wraps_the_stored_row() {
    let adapter = MemoryAdapter::new();
    adapter
        .put(
            "users",
            &key(json!({"id": 1})),
            row(json!({"id": 1, "name": "Alice", "version": 7})),
        )
        .await;

    let bus = RecordingBus::default();
    let publisher = Publisher::new(
        adapter,
        bus.clone(),
        registry_with(TargetSpec::builder("User").to_table("users").build().unwrap()),
    );

    let sent = publisher
        .publish_now("User", &raw(vec![("id", RawValue::Int(1))]), &PublishOptions::default())
        .await
        .unwrap();
    assert!(sent);

    let sent = bus.sent.lock().unwrap();
    assert_eq!(sent.len(), 1);
    let envelope = &sent[0];
    assert_eq!(envelope.routing_key, "User");
    assert_eq!(envelope.event, "table_sync");
    assert!(envelope.confirm_select);
    assert!(envelope.realtime);
    assert_eq!(envelope.data.model, "User");
    assert_eq!(envelope.data.attributes.len(), 1);
    assert_eq!(envelope.data.attributes[0]["name"], "Alice");
    assert!(envelope.data.version > 0);
}

#[tokio::test]
async fn publish_survives_a_failed_rollback_of_its_read_transaction() {
    let adapter = DroppedConnectionAdapter::default();
    adapter
        .inner
        .put(
            "users",
            &key(json!({"id": 1})),
            row(json!({"id": 1, "name": "Alice", "version": 1})),
        )
        .await;

    let bus = RecordingBus::default();
    let publisher = Publisher::new(
        adapter,
        bus.clone(),
        registry_with(TargetSpec::builder("User").to_table("users").build().unwrap()),
    );

    // The fetch succeeded; a failed rollback of the read-only transaction
    // must neither abort the publish nor mask the fetched row.
    let sent = publisher
        .publish_now("User", &raw(vec![("id", RawValue::Int(1))]), &PublishOptions::default())
        .await
        .unwrap();
    assert!(sent);

    let sent = bus.sent.lock().unwrap();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].data.attributes[0]["name"], "Alice");
}

#[tokio::test]
async fn push_original_attributes_skips_the_refetch() {
    // Storage is empty; the caller-supplied attributes are used as-is.
    let bus = RecordingBus::default();
    let publisher = Publisher::new(
        MemoryAdapter::new(),
        bus.clone(),
        registry_with(TargetSpec::builder("User").to_table("users").build().unwrap()),
    );

    let options = PublishOptions {
        push_original_attributes: true,
        ..PublishOptions::default()
    };
    let sent = publisher
        .publish_now(
            "User",
            &raw(vec![("id", RawValue::Int(5)), ("name", RawValue::Text("local".into()))]),
            &options,
        )
        .await
        .unwrap();

    assert!(sent);
    let sent = bus.sent.lock().unwrap();
    assert_eq!(sent[0].data.attributes[0]["name"], "local");
}

#[tokio::test]
async fn routing_key_resolver_and_override() {
    let adapter = MemoryAdapter::new();
    adapter
        .put("users", &key(json!({"id": 1})), row(json!({"id": 1, "version": 1})))
        .await;

    let bus = RecordingBus::default();
    let publisher = Publisher::new(
        adapter,
        bus.clone(),
        registry_with(TargetSpec::builder("User").to_table("users").build().unwrap()),
    )
    .with_config(
        relay_engine::PublisherConfig::new()
            .routing_key_resolver(|model, _| format!("sync.{model}")),
    );

    publisher
        .publish_now("User", &raw(vec![("id", RawValue::Int(1))]), &PublishOptions::default())
        .await
        .unwrap();
    assert_eq!(bus.sent.lock().unwrap()[0].routing_key, "sync.User");

    let options = PublishOptions {
        routing_key: Some("override.key".into()),
        ..PublishOptions::default()
    };
    publisher
        .publish_now("User", &raw(vec![("id", RawValue::Int(1))]), &options)
        .await
        .unwrap();
    assert_eq!(bus.sent.lock().unwrap()[1].routing_key, "override.key");
}

#[tokio::test]
async fn sync_attributes_strategy_overrides_generic_access() {
    let adapter = MemoryAdapter::new();
    adapter
        .put(
            "users",
            &key(json!({"id": 1})),
            row(json!({"id": 1, "name": "Alice", "secret": "hunter2", "version": 1})),
        )
        .await;

    let bus = RecordingBus::default();
    let publisher = Publisher::new(
        adapter,
        bus.clone(),
        registry_with(TargetSpec::builder("User").to_table("users").build().unwrap()),
    )
    .with_config(relay_engine::PublisherConfig::new().sync_attributes(|stored| {
        // Publish only the public subset
        stored
            .iter()
            .filter(|(field, _)| *field != "secret")
            .map(|(field, value)| (field.clone(), RawValue::from(value)))
            .collect()
    }));

    publisher
        .publish_now("User", &raw(vec![("id", RawValue::Int(1))]), &PublishOptions::default())
        .await
        .unwrap();

    let sent = bus.sent.lock().unwrap();
    assert_eq!(sent[0].data.attributes[0]["name"], "Alice");
    assert!(sent[0].data.attributes[0].get("secret").is_none());
}

#[tokio::test]
async fn batch_publish_submits_exactly_one_scrubbed_task() {
    use chrono::{TimeZone, Utc};

    let dispatcher = RecordingDispatcher::default();
    let publisher = BatchPublisher::new(dispatcher.clone()).push_original_attributes(true);

    let rows = vec![
        raw(vec![
            ("id", RawValue::Int(1)),
            ("seen_at", RawValue::Time(Utc.with_ymd_and_hms(2024, 2, 1, 0, 0, 0).unwrap())),
        ]),
        raw(vec![("id", RawValue::Int(2)), ("ratio", RawValue::Float(f64::NAN))]),
    ];
    publisher.publish("User", &rows).await.unwrap();

    let tasks = dispatcher.tasks.lock().unwrap();
    assert_eq!(tasks.len(), 1, "exactly one dispatcher submission per publish call");
    let task = &tasks[0];
    assert_eq!(task.model_name, "User");
    assert!(task.options.confirm);
    assert!(task.options.push_original_attributes);
    assert_eq!(task.rows.len(), 2);
    // Unsafe values never reach the dispatcher
    assert_eq!(task.rows[0], json!({"id": 1}));
    assert_eq!(task.rows[1], json!({"id": 2}));
}
