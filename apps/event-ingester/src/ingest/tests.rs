use super::types::{EventValue, ItemOutcome};
use super::{EventIngestor, EventRecord, IngestSettings, TimestampInterpreter};
use crate::error::{PublishError, Stage, StorageError};
use crate::health::HealthState;
use crate::publish::Publisher;
use crate::store::EventStore;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex};

const EVENTS_TOPIC: &str = "qs/v1/esp-01/events";
const DEAD_LETTER_TOPIC: &str = "qs/v1/deadletter";

#[derive(Default)]
struct MemoryStore {
    rows: Mutex<HashMap<String, EventRecord>>,
    fail_with: Mutex<Option<fn() -> StorageError>>,
}

impl MemoryStore {
    fn row(&self, event_id: &str) -> Option<EventRecord> {
        self.rows.lock().unwrap().get(event_id).cloned()
    }

    fn len(&self) -> usize {
        self.rows.lock().unwrap().len()
    }

    fn fail_next_with(&self, make: fn() -> StorageError) {
        *self.fail_with.lock().unwrap() = Some(make);
    }
}

#[async_trait]
impl EventStore for MemoryStore {
    async fn insert_event(&self, record: &EventRecord) -> Result<bool, StorageError> {
        if let Some(make) = self.fail_with.lock().unwrap().take() {
            return Err(make());
        }
        let mut rows = self.rows.lock().unwrap();
        if rows.contains_key(&record.event_id) {
            return Ok(false);
        }
        rows.insert(record.event_id.clone(), record.clone());
        Ok(true)
    }

    async fn ping(&self) -> Result<(), StorageError> {
        Ok(())
    }
}

#[derive(Default)]
struct RecordingPublisher {
    sent: Mutex<Vec<(String, Value)>>,
    offline: Mutex<bool>,
}

impl RecordingPublisher {
    fn sent(&self) -> Vec<(String, Value)> {
        self.sent.lock().unwrap().clone()
    }
}

#[async_trait]
impl Publisher for RecordingPublisher {
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), PublishError> {
        if *self.offline.lock().unwrap() {
            return Err(PublishError {
                topic: topic.to_string(),
                reason: "broker offline".to_string(),
            });
        }
        let value: Value = serde_json::from_slice(&payload).expect("outbound json");
        self.sent.lock().unwrap().push((topic.to_string(), value));
        Ok(())
    }
}

struct Harness {
    ingestor: EventIngestor,
    store: Arc<MemoryStore>,
    publisher: Arc<RecordingPublisher>,
    health: Arc<HealthState>,
}

fn harness() -> Harness {
    let store = Arc::new(MemoryStore::default());
    let publisher = Arc::new(RecordingPublisher::default());
    let health = Arc::new(HealthState::new());
    health.set_storage_available(true);
    health.set_mqtt_connected(true);
    let settings = IngestSettings {
        ack_template: "qs/v1/{device_id}/acks".to_string(),
        dead_letter_topic: DEAD_LETTER_TOPIC.to_string(),
        supported_schema: 1,
        timestamps: TimestampInterpreter::new(chrono_tz::America::Los_Angeles),
    };
    let ingestor = EventIngestor::new(store.clone(), publisher.clone(), health.clone(), settings);
    Harness {
        ingestor,
        store,
        publisher,
        health,
    }
}

fn event(event_id: &str) -> Value {
    json!({
        "schema": 1,
        "event_id": event_id,
        "device_id": "esp-01",
        "event_type": "temperature",
        "value": 21.5,
        "unit": "C",
    })
}

fn body(value: &Value) -> Vec<u8> {
    serde_json::to_vec(value).expect("body")
}

fn utc(raw: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(raw)
        .expect("fixture")
        .with_timezone(&Utc)
}

#[tokio::test]
async fn single_event_is_stored_and_acked() {
    let h = harness();
    let report = h
        .ingestor
        .handle_message(EVENTS_TOPIC, &body(&event("evt-1")))
        .await;

    assert_eq!(
        report.outcomes,
        vec![ItemOutcome::Acked {
            event_id: "evt-1".to_string(),
            inserted: true
        }]
    );
    let row = h.store.row("evt-1").expect("stored");
    assert_eq!(row.value_num(), Some(21.5));
    assert_eq!(row.unit.as_deref(), Some("C"));
    assert_eq!(row.meta, json!({}));

    let sent = h.publisher.sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].0, "qs/v1/esp-01/acks");
    assert_eq!(
        sent[0].1,
        json!({"schema": 1, "event_id": "evt-1", "device_id": "esp-01", "status": "stored"})
    );
}

#[tokio::test]
async fn redelivery_is_idempotent_and_still_acked() {
    let h = harness();
    let first = h
        .ingestor
        .handle_message(EVENTS_TOPIC, &body(&event("evt-1")))
        .await;
    let mut changed = event("evt-1");
    changed["value"] = json!("north");
    let second = h
        .ingestor
        .handle_message(EVENTS_TOPIC, &body(&changed))
        .await;

    assert_eq!(
        first.outcomes,
        vec![ItemOutcome::Acked {
            event_id: "evt-1".to_string(),
            inserted: true
        }]
    );
    assert_eq!(
        second.outcomes,
        vec![ItemOutcome::Acked {
            event_id: "evt-1".to_string(),
            inserted: false
        }]
    );
    assert_eq!(h.store.len(), 1);
    assert_eq!(h.store.row("evt-1").expect("row").value_num(), Some(21.5));
    let acks: Vec<_> = h
        .publisher
        .sent()
        .into_iter()
        .filter(|(topic, _)| topic.ends_with("/acks"))
        .collect();
    assert_eq!(acks.len(), 2);
    assert_eq!(h.health.events_duplicate.load(Ordering::Relaxed), 1);
}

#[tokio::test]
async fn bad_item_in_batch_does_not_block_siblings() {
    let h = harness();
    let mut invalid = event("evt-2");
    invalid.as_object_mut().unwrap().remove("event_type");
    let batch = json!([event("evt-1"), invalid, event("evt-3")]);

    let report = h.ingestor.handle_message(EVENTS_TOPIC, &body(&batch)).await;

    assert_eq!(report.acked(), 2);
    assert_eq!(report.dead_lettered(), 1);
    assert!(matches!(
        &report.outcomes[1],
        ItemOutcome::DeadLettered { stage: Stage::Validate, .. }
    ));

    let sent = h.publisher.sent();
    let topics: Vec<&str> = sent.iter().map(|(topic, _)| topic.as_str()).collect();
    assert_eq!(
        topics,
        vec!["qs/v1/esp-01/acks", DEAD_LETTER_TOPIC, "qs/v1/esp-01/acks"]
    );
    let dead = &sent[1].1;
    assert_eq!(dead["payload"], batch[1]);
    assert_eq!(dead["error"], "missing required field event_type");
    assert_eq!(dead["topic"], EVENTS_TOPIC);
    assert_eq!(dead["context"]["stage"], "validate");
    assert_eq!(dead["context"]["index"], 1);
    assert_eq!(dead["context"]["batch_len"], 3);
    assert_eq!(dead["context"]["event_id"], "evt-2");
    assert!(h.store.row("evt-2").is_none());
}

#[tokio::test]
async fn valid_then_invalid_yields_ack_then_dead_letter() {
    let h = harness();
    let batch = json!([event("evt-1"), {"schema": 1, "device_id": "esp-01"}]);
    h.ingestor.handle_message(EVENTS_TOPIC, &body(&batch)).await;

    let sent = h.publisher.sent();
    assert_eq!(sent.len(), 2);
    assert_eq!(sent[0].0, "qs/v1/esp-01/acks");
    assert_eq!(sent[1].0, DEAD_LETTER_TOPIC);
}

#[tokio::test]
async fn missing_event_id_is_dead_lettered_without_row() {
    let h = harness();
    let mut item = event("unused");
    item.as_object_mut().unwrap().remove("event_id");
    let report = h.ingestor.handle_message(EVENTS_TOPIC, &body(&item)).await;

    assert_eq!(report.acked(), 0);
    assert_eq!(h.store.len(), 0);
    let sent = h.publisher.sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].0, DEAD_LETTER_TOPIC);
    assert_eq!(sent[0].1["error"], "missing required field event_id");
}

#[tokio::test]
async fn unsupported_schema_is_dead_lettered() {
    let h = harness();
    let mut item = event("evt-1");
    item["schema"] = json!(2);
    let report = h.ingestor.handle_message(EVENTS_TOPIC, &body(&item)).await;

    assert_eq!(report.dead_lettered(), 1);
    assert_eq!(h.store.len(), 0);
    assert_eq!(h.publisher.sent()[0].0, DEAD_LETTER_TOPIC);
}

#[tokio::test]
async fn value_typing_follows_dual_typing_rule() {
    let h = harness();
    let mut numeric = event("num");
    numeric["value"] = json!(42);
    let mut numeric_text = event("num-text");
    numeric_text["value"] = json!("42");
    let mut text = event("text");
    text["value"] = json!("north");
    let batch = json!([numeric, numeric_text, text]);
    h.ingestor.handle_message(EVENTS_TOPIC, &body(&batch)).await;

    let num = h.store.row("num").expect("num");
    assert_eq!((num.value_num(), num.value_text()), (Some(42.0), None));
    let num_text = h.store.row("num-text").expect("num-text");
    assert_eq!((num_text.value_num(), num_text.value_text()), (Some(42.0), None));
    let text = h.store.row("text").expect("text");
    assert_eq!(text.value, Some(EventValue::Text("north".to_string())));
    assert_eq!(text.value_num(), None);
}

#[tokio::test]
async fn device_timestamps_follow_zone_policy() {
    let h = harness();
    let mut zulu = event("zulu");
    zulu["ts_device"] = json!("2024-02-10T00:00:00Z");
    let mut naive = event("naive");
    naive["ts_device"] = json!("2024-02-10T00:00:00");
    let mut garbage = event("garbage");
    garbage["ts_device"] = json!("garbage");
    let absent = event("absent");
    let batch = json!([zulu, naive, garbage, absent]);

    let report = h.ingestor.handle_message(EVENTS_TOPIC, &body(&batch)).await;

    assert_eq!(report.acked(), 4);
    assert_eq!(
        h.store.row("zulu").unwrap().ts_device,
        Some(utc("2024-02-10T00:00:00Z"))
    );
    assert_eq!(
        h.store.row("naive").unwrap().ts_device,
        Some(utc("2024-02-10T08:00:00Z"))
    );
    assert_eq!(h.store.row("garbage").unwrap().ts_device, None);
    assert_eq!(h.store.row("absent").unwrap().ts_device, None);
}

#[tokio::test]
async fn server_timestamps_are_non_decreasing() {
    let h = harness();
    let batch = json!([event("a"), event("b"), event("c")]);
    h.ingestor.handle_message(EVENTS_TOPIC, &body(&batch)).await;

    let a = h.store.row("a").unwrap().ts_server;
    let b = h.store.row("b").unwrap().ts_server;
    let c = h.store.row("c").unwrap().ts_server;
    assert!(a <= b && b <= c);
}

#[tokio::test]
async fn single_object_and_one_element_array_match() {
    let single = harness();
    let array = harness();
    single
        .ingestor
        .handle_message(EVENTS_TOPIC, &body(&event("evt-1")))
        .await;
    array
        .ingestor
        .handle_message(EVENTS_TOPIC, &body(&json!([event("evt-1")])))
        .await;

    let left = single.store.row("evt-1").expect("single row");
    let mut right = array.store.row("evt-1").expect("array row");
    // Server arrival time legitimately differs between the two runs.
    right.ts_server = left.ts_server;
    assert_eq!(left, right);
    assert_eq!(single.publisher.sent(), array.publisher.sent());
}

#[tokio::test]
async fn undecodable_body_is_dead_lettered_with_raw_text() {
    let h = harness();
    let report = h.ingestor.handle_message(EVENTS_TOPIC, b"{oops").await;

    assert!(matches!(
        &report.outcomes[..],
        [ItemOutcome::DeadLettered { stage: Stage::Decode, .. }]
    ));
    let sent = h.publisher.sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].0, DEAD_LETTER_TOPIC);
    assert_eq!(sent[0].1["payload"], "{oops");
    assert_eq!(sent[0].1["context"]["stage"], "decode");
    assert!(sent[0].1["context"].get("index").is_none());

    // The next message is unaffected.
    let next = h
        .ingestor
        .handle_message(EVENTS_TOPIC, &body(&event("evt-1")))
        .await;
    assert_eq!(next.acked(), 1);
}

#[tokio::test]
async fn scalar_body_is_dead_lettered() {
    let h = harness();
    let report = h.ingestor.handle_message(EVENTS_TOPIC, b"42").await;
    assert_eq!(report.dead_lettered(), 1);
    assert_eq!(h.publisher.sent()[0].1["payload"], "42");
}

#[tokio::test]
async fn storage_failure_is_dead_lettered_and_siblings_continue() {
    let h = harness();
    h.store
        .fail_next_with(|| StorageError::Query(sqlx::Error::RowNotFound));
    let batch = json!([event("evt-1"), event("evt-2")]);
    let report = h.ingestor.handle_message(EVENTS_TOPIC, &body(&batch)).await;

    assert!(matches!(
        &report.outcomes[0],
        ItemOutcome::DeadLettered { stage: Stage::Persist, .. }
    ));
    assert_eq!(
        report.outcomes[1],
        ItemOutcome::Acked {
            event_id: "evt-2".to_string(),
            inserted: true
        }
    );
    assert!(h.health.storage_available());
    assert_eq!(h.publisher.sent()[0].1["context"]["stage"], "persist");
}

#[tokio::test]
async fn connectivity_loss_fails_fast_until_storage_recovers() {
    let h = harness();
    h.store
        .fail_next_with(|| StorageError::from(sqlx::Error::PoolTimedOut));
    let batch = json!([event("evt-1"), event("evt-2")]);
    let report = h.ingestor.handle_message(EVENTS_TOPIC, &body(&batch)).await;

    assert_eq!(report.dead_lettered(), 2);
    assert!(!h.health.storage_available());
    assert_eq!(h.store.len(), 0);
    let sent = h.publisher.sent();
    assert_eq!(sent[1].1["error"], "storage unavailable");

    h.health.set_storage_available(true);
    let retry = h
        .ingestor
        .handle_message(EVENTS_TOPIC, &body(&event("evt-1")))
        .await;
    assert_eq!(retry.acked(), 1);
}

#[tokio::test]
async fn fail_fast_items_leave_the_supervisor_alone() {
    let h = harness();
    h.health.set_storage_available(false);
    h.health.record_error("connection refused");

    let report = h
        .ingestor
        .handle_message(EVENTS_TOPIC, &body(&event("evt-1")))
        .await;

    assert_eq!(report.dead_lettered(), 1);
    let woken = tokio::time::timeout(
        std::time::Duration::from_millis(50),
        h.health.storage_suspected(),
    )
    .await;
    assert!(woken.is_err(), "fail-fast item must not trigger a storage probe");
    assert_eq!(
        h.health.last_error.lock().unwrap().as_deref(),
        Some("connection refused")
    );
}

#[tokio::test]
async fn padded_event_id_is_a_distinct_identity() {
    let h = harness();
    let batch = json!([event(" evt-1"), event("evt-1")]);
    let report = h.ingestor.handle_message(EVENTS_TOPIC, &body(&batch)).await;

    assert_eq!(
        report.outcomes,
        vec![
            ItemOutcome::Acked {
                event_id: " evt-1".to_string(),
                inserted: true,
            },
            ItemOutcome::Acked {
                event_id: "evt-1".to_string(),
                inserted: true,
            },
        ]
    );
    assert_eq!(h.store.len(), 2);
    let acked: Vec<Value> = h
        .publisher
        .sent()
        .into_iter()
        .map(|(_, ack)| ack["event_id"].clone())
        .collect();
    assert_eq!(acked, vec![json!(" evt-1"), json!("evt-1")]);
}

#[tokio::test]
async fn publish_failures_do_not_abort_processing() {
    let h = harness();
    *h.publisher.offline.lock().unwrap() = true;
    let batch = json!([event("evt-1"), {"bad": true}, event("evt-3")]);
    let report = h.ingestor.handle_message(EVENTS_TOPIC, &body(&batch)).await;

    assert_eq!(report.acked(), 2);
    assert_eq!(report.dead_lettered(), 1);
    assert_eq!(h.store.len(), 2);
    assert_eq!(h.health.publish_failures.load(Ordering::Relaxed), 3);
}

#[tokio::test]
async fn empty_batch_produces_no_outcomes() {
    let h = harness();
    let report = h.ingestor.handle_message(EVENTS_TOPIC, b"[]").await;
    assert!(report.outcomes.is_empty());
    assert!(h.publisher.sent().is_empty());
    assert_eq!(h.health.messages_received.load(Ordering::Relaxed), 1);
}

#[tokio::test]
async fn worker_drains_queue_in_arrival_order() {
    use crate::pipeline::{spawn_worker, InboundMessage, PipelineHandle};

    let h = harness();
    let (tx, rx) = tokio::sync::mpsc::channel(8);
    let pipeline = PipelineHandle::new(tx, h.health.clone());
    let worker = spawn_worker(h.ingestor.clone(), rx);

    for id in ["evt-a", "evt-b", "evt-c"] {
        pipeline
            .enqueue(InboundMessage {
                topic: EVENTS_TOPIC.to_string(),
                payload: body(&event(id)),
            })
            .await
            .expect("enqueue");
    }
    drop(pipeline);
    worker.await.expect("worker");

    let acked: Vec<Value> = h
        .publisher
        .sent()
        .into_iter()
        .map(|(_, ack)| ack["event_id"].clone())
        .collect();
    assert_eq!(acked, vec![json!("evt-a"), json!("evt-b"), json!("evt-c")]);
    assert_eq!(h.health.queue_depth.load(Ordering::Relaxed), 0);
}
