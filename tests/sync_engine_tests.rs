/// Engine behaviour tests
///
/// Debounced field saves, template rows, toggles and rollback driven through
/// the public engine API against the in-memory server.
/// Run with: cargo test --test sync_engine_tests

use optisync::client::CallKind;
use optisync::{
    AggregateId, AggregateSeed, AttemptOutcome, EngineConfig, EntityId, FailureMode,
    InMemorySyncClient, SyncEngine, SyncError, SyncEvent,
};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::sleep;

const WINDOW_MS: u64 = 1_000;

fn lot_seed() -> AggregateSeed {
    serde_json::from_value(json!({
        "id": "lot-1",
        "remote_id": "lot-1",
        "templates": [
            {"key": "Delivery", "kind": {"kind": "stage"}, "defaults": {"name": "Delivery"}}
        ],
        "entities": [
            {"id": "st-1", "kind": {"kind": "stage"}, "fields": {"name": "Cutting"},
             "relationships": {"assigned_to": ["emp-1"]}},
            {"id": "st-2", "kind": {"kind": "stage"}, "fields": {"name": "Edging"}}
        ]
    }))
    .unwrap()
}

fn setup(client: InMemorySyncClient) -> (SyncEngine, Arc<InMemorySyncClient>) {
    let client = Arc::new(client);
    for id in ["lot-1", "st-1", "st-2"] {
        client.seed_record(id, json!({"fields": {}})).unwrap();
    }
    let config = EngineConfig::new().debounce_window_ms(WINDOW_MS);
    let engine = SyncEngine::new(config, client.clone()).unwrap();
    engine.load_aggregate(lot_seed()).unwrap();
    (engine, client)
}

fn lot() -> AggregateId {
    AggregateId::new("lot-1")
}

fn st(id: &str) -> EntityId {
    EntityId::persisted(id)
}

fn drain(events: &mut broadcast::Receiver<SyncEvent>) -> Vec<SyncEvent> {
    let mut seen = Vec::new();
    while let Ok(event) = events.try_recv() {
        seen.push(event);
    }
    seen
}

#[tokio::test(start_paused = true)]
async fn test_rapid_edits_coalesce_into_one_call() {
    let (engine, client) = setup(InMemorySyncClient::new());

    for value in ["A", "AB", "ABC"] {
        engine.edit(&st("st-1"), "notes", json!(value)).unwrap();
        sleep(Duration::from_millis(200)).await;
    }
    assert_eq!(client.call_count().unwrap(), 0);
    assert_eq!(engine.entity(&st("st-1")).unwrap().fields["notes"], json!("ABC"));

    sleep(Duration::from_millis(WINDOW_MS + 100)).await;

    let calls = client.calls().unwrap();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].kind, CallKind::Update);
    assert_eq!(calls[0].payload, Some(json!({"fields": {"notes": "ABC"}})));
    assert_eq!(
        client.record("st-1").unwrap().unwrap()["fields"]["notes"],
        json!("ABC")
    );
    assert!(!engine.is_dirty(&lot()).unwrap());
    assert!(engine.pending_timers().unwrap().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_edits_of_different_fields_are_independent() {
    let (engine, client) = setup(InMemorySyncClient::new());

    engine.edit(&st("st-1"), "name", json!("Sawing")).unwrap();
    engine.edit(&st("st-1"), "notes", json!("check blades")).unwrap();
    engine.edit(&st("st-2"), "name", json!("Banding")).unwrap();
    assert_eq!(engine.pending_timers().unwrap().len(), 3);

    sleep(Duration::from_millis(WINDOW_MS + 100)).await;
    assert_eq!(client.call_count().unwrap(), 3);
}

#[tokio::test(start_paused = true)]
async fn test_materialize_is_idempotent_and_creates_once() {
    let client = InMemorySyncClient::new().with_latency(Duration::from_millis(300));
    let (engine, client) = setup(client);
    let mut events = engine.subscribe();

    let placeholder = engine.materialize(&lot(), "Delivery").unwrap();
    assert!(placeholder.is_virtual());
    assert_eq!(engine.materialize(&lot(), " Delivery ").unwrap(), placeholder);
    let materialized = drain(&mut events)
        .into_iter()
        .filter(|event| matches!(event, SyncEvent::Materialized { .. }))
        .count();
    assert_eq!(materialized, 1);
    assert_eq!(client.call_count().unwrap(), 0);

    // Another row points at the template row before it exists remotely.
    engine
        .toggle(&st("st-2"), "follows", &placeholder.to_string())
        .await
        .unwrap();

    engine.edit(&placeholder, "notes", json!("first")).unwrap();
    // The create leaves after the window and takes 300ms to answer.
    sleep(Duration::from_millis(WINDOW_MS + 100)).await;
    engine.edit(&placeholder, "notes", json!("second")).unwrap();
    sleep(Duration::from_millis(WINDOW_MS + 500)).await;

    let calls = client.calls().unwrap();
    let creates: Vec<_> = calls
        .iter()
        .filter(|call| call.kind == CallKind::Create)
        .collect();
    assert_eq!(creates.len(), 1);
    assert_eq!(creates[0].payload.as_ref().unwrap()["aggregate_id"], json!("lot-1"));

    let assigned = engine.resolve(&placeholder).unwrap();
    assert!(!assigned.is_virtual());
    assert_eq!(engine.materialize(&lot(), "Delivery").unwrap(), assigned);

    let row = engine.entity(&placeholder).unwrap();
    assert_eq!(row.id, assigned);
    assert_eq!(row.fields["notes"], json!("second"));
    assert_eq!(
        client.record(&assigned.to_string()).unwrap().unwrap()["fields"]["notes"],
        json!("second")
    );

    let follows = engine.entity(&st("st-2")).unwrap().relation("follows");
    assert!(follows.contains(&assigned.to_string()));
    assert!(!follows.contains(&placeholder.to_string()));
}

#[tokio::test(start_paused = true)]
async fn test_toggle_on_unshown_template_row_creates_it_once() {
    let (engine, client) = setup(InMemorySyncClient::new());
    let mut events = engine.subscribe();
    let placeholder = EntityId::virtual_for(&lot(), "Delivery");

    let members = engine.toggle(&placeholder, "assigned_to", "emp-4").await.unwrap();
    assert!(members.contains("emp-4"));

    let calls = client.calls().unwrap();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].kind, CallKind::Create);
    let payload = calls[0].payload.as_ref().unwrap();
    assert_eq!(payload["relationships"]["assigned_to"], json!(["emp-4"]));
    assert_eq!(payload["fields"]["name"], json!("Delivery"));

    let assigned = engine.resolve(&placeholder).unwrap();
    assert!(!assigned.is_virtual());
    let materialized = drain(&mut events)
        .into_iter()
        .filter(|event| matches!(event, SyncEvent::Materialized { .. }))
        .count();
    assert_eq!(materialized, 1);
}

#[tokio::test(start_paused = true)]
async fn test_edit_on_unshown_template_row() {
    let (engine, client) = setup(InMemorySyncClient::new());
    let placeholder = EntityId::virtual_for(&lot(), "Delivery");

    engine.edit(&placeholder, "notes", json!("by noon")).unwrap();
    assert_eq!(engine.entity(&placeholder).unwrap().fields["notes"], json!("by noon"));
    sleep(Duration::from_millis(WINDOW_MS + 100)).await;

    let calls = client.calls().unwrap();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].kind, CallKind::Create);
    assert_eq!(calls[0].payload.as_ref().unwrap()["fields"]["notes"], json!("by noon"));
    assert!(!engine.resolve(&placeholder).unwrap().is_virtual());

    // Unknown templates are still unknown rows.
    let unknown = EntityId::virtual_for(&lot(), "Painting");
    assert!(matches!(
        engine.edit(&unknown, "notes", json!("x")),
        Err(SyncError::EntityNotFound(_))
    ));
}

#[tokio::test(start_paused = true)]
async fn test_saves_of_different_entities_run_concurrently() {
    let client = InMemorySyncClient::new().with_latency(Duration::from_millis(300));
    let (engine, client) = setup(client);
    client.fail_id("st-2", FailureMode::Reject).unwrap();

    engine.edit(&st("st-1"), "name", json!("Sawing")).unwrap();
    engine.edit(&st("st-2"), "name", json!("Banding")).unwrap();

    // Both requests are out before either answers.
    sleep(Duration::from_millis(WINDOW_MS + 150)).await;
    assert_eq!(client.call_count().unwrap(), 2);
    assert!(client.record("st-1").unwrap().unwrap()["fields"].get("name").is_none());

    sleep(Duration::from_millis(300)).await;
    assert_eq!(
        client.record("st-1").unwrap().unwrap()["fields"]["name"],
        json!("Sawing")
    );
    assert_eq!(engine.entity(&st("st-1")).unwrap().fields["name"], json!("Sawing"));
    assert_eq!(engine.entity(&st("st-2")).unwrap().fields["name"], json!("Edging"));
    assert!(!engine.is_dirty(&lot()).unwrap());
}

#[tokio::test(start_paused = true)]
async fn test_toggle_twice_restores_the_set() {
    let (engine, client) = setup(InMemorySyncClient::new());
    let before = engine.entity(&st("st-1")).unwrap().relation("assigned_to");

    let once = engine.toggle(&st("st-1"), "assigned_to", "emp-2").await.unwrap();
    assert!(once.contains("emp-2"));
    let twice = engine.toggle(&st("st-1"), "assigned_to", "emp-2").await.unwrap();
    assert_eq!(twice, before);

    let calls = client.calls().unwrap();
    assert!(calls.len() <= 2);
    assert!(calls.iter().all(|call| call.kind == CallKind::Update));
    assert!(!engine.is_dirty(&lot()).unwrap());
}

#[tokio::test(start_paused = true)]
async fn test_failed_save_restores_previous_value() {
    let (engine, client) = setup(InMemorySyncClient::new());
    let mut events = engine.subscribe();
    client.fail_id("st-1", FailureMode::Reject).unwrap();

    engine.edit(&st("st-1"), "name", json!("Sawing")).unwrap();
    assert_eq!(engine.entity(&st("st-1")).unwrap().fields["name"], json!("Sawing"));

    sleep(Duration::from_millis(WINDOW_MS + 100)).await;

    assert_eq!(engine.entity(&st("st-1")).unwrap().fields["name"], json!("Cutting"));
    assert!(!engine.is_dirty(&lot()).unwrap());
    let rolled_back = drain(&mut events).into_iter().any(|event| {
        matches!(&event, SyncEvent::RolledBack { entity_id, .. } if *entity_id == st("st-1"))
    });
    assert!(rolled_back);
}

#[tokio::test(start_paused = true)]
async fn test_failure_of_one_field_keeps_the_other() {
    let (engine, client) = setup(InMemorySyncClient::new());
    client.fail_next(1, FailureMode::Transport).unwrap();

    engine.edit(&st("st-1"), "name", json!("Sawing")).unwrap();
    sleep(Duration::from_millis(100)).await;
    engine.edit(&st("st-1"), "notes", json!("sharpen")).unwrap();
    sleep(Duration::from_millis(WINDOW_MS + 200)).await;

    let entity = engine.entity(&st("st-1")).unwrap();
    assert_eq!(entity.fields["name"], json!("Cutting"));
    assert_eq!(entity.fields["notes"], json!("sharpen"));
    assert_eq!(client.call_count().unwrap(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_unchanged_value_is_not_sent() {
    let (engine, client) = setup(InMemorySyncClient::new());

    engine.edit(&st("st-1"), "name", json!("Cutting")).unwrap();
    engine.edit(&st("st-2"), "name", json!("Trimming")).unwrap();
    engine.edit(&st("st-2"), "name", json!("Edging")).unwrap();
    sleep(Duration::from_millis(WINDOW_MS + 100)).await;
    assert_eq!(client.call_count().unwrap(), 0);

    let outcome = engine
        .persist_field(&st("st-1"), "name", json!("Cutting"))
        .await
        .unwrap();
    assert_eq!(outcome, AttemptOutcome::Skipped { entity_id: st("st-1") });
    assert_eq!(client.call_count().unwrap(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_close_view_drops_pending_saves() {
    let (engine, client) = setup(InMemorySyncClient::new());

    engine.edit(&st("st-1"), "name", json!("Sawing")).unwrap();
    assert_eq!(engine.close_view(&lot()).unwrap(), 1);
    sleep(Duration::from_millis(WINDOW_MS * 2)).await;
    assert_eq!(client.call_count().unwrap(), 0);
    // The local edit stays; only the save was dropped.
    assert!(engine.is_dirty(&lot()).unwrap());
}

#[tokio::test(start_paused = true)]
async fn test_template_row_rejects_unknown_key() {
    let (engine, _client) = setup(InMemorySyncClient::new());
    assert!(matches!(
        engine.materialize(&lot(), "Painting"),
        Err(SyncError::UnknownTemplate { .. })
    ));
}

#[tokio::test(start_paused = true)]
async fn test_engine_drop_cancels_timers() {
    let (engine, client) = setup(InMemorySyncClient::new());
    engine.edit(&st("st-1"), "name", json!("Sawing")).unwrap();
    drop(engine);
    sleep(Duration::from_millis(WINDOW_MS * 2)).await;
    assert_eq!(client.call_count().unwrap(), 0);
}
