use super::batch::unwrap_batch;
use super::clock::ServerClock;
use super::types::{
    AckMessage, DeadLetterContext, DeadLetterMessage, EventRecord, ItemOutcome, MessageReport,
};
use super::validate::validate_event;
use super::{EventIngestor, IngestSettings};
use crate::error::{ItemError, Stage, StorageError};
use crate::health::HealthState;
use crate::publish::Publisher;
use crate::store::EventStore;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use std::sync::atomic::Ordering;
use std::sync::Arc;

impl EventIngestor {
    pub fn new(
        store: Arc<dyn EventStore>,
        publisher: Arc<dyn Publisher>,
        health: Arc<HealthState>,
        settings: IngestSettings,
    ) -> Self {
        Self {
            store,
            publisher,
            health,
            settings: Arc::new(settings),
            clock: Arc::new(ServerClock::new()),
        }
    }

    pub fn health(&self) -> Arc<HealthState> {
        self.health.clone()
    }

    /// Runs one received message through the pipeline.
    ///
    /// Every batch item ends either acked or dead-lettered, in batch order. A failing
    /// item never stops its siblings, and nothing here returns an error to the caller.
    #[tracing::instrument(name = "ingest_message", skip_all, fields(topic = %topic, bytes = body.len()))]
    pub async fn handle_message(&self, topic: &str, body: &[u8]) -> MessageReport {
        let received_at = Utc::now();
        self.health.messages_received.fetch_add(1, Ordering::Relaxed);

        let items = match unwrap_batch(body) {
            Ok(items) => items,
            Err(err) => {
                tracing::warn!(error=%err, "dead-lettering undecodable message");
                let payload = Value::String(err.raw_text.clone());
                let context = DeadLetterContext {
                    stage: Stage::Decode,
                    index: None,
                    batch_len: None,
                    event_id: None,
                    device_id: None,
                };
                let error = err.to_string();
                self.dead_letter(topic, &payload, &error, context, received_at)
                    .await;
                return MessageReport {
                    outcomes: vec![ItemOutcome::DeadLettered {
                        stage: Stage::Decode,
                        error,
                    }],
                };
            }
        };

        let batch_len = items.len();
        if batch_len == 0 {
            tracing::debug!("message carried an empty batch");
        }

        let mut report = MessageReport {
            outcomes: Vec::with_capacity(batch_len),
        };
        for (index, item) in items.iter().enumerate() {
            let outcome = match self.process_item(item).await {
                Ok((record, inserted)) => {
                    self.acknowledge(&record, inserted).await;
                    ItemOutcome::Acked {
                        event_id: record.event_id,
                        inserted,
                    }
                }
                Err(err) => {
                    let stage = err.stage();
                    let error = err.to_string();
                    tracing::warn!(error=%error, stage=%stage, index, batch_len, "dead-lettering event");
                    match &err {
                        // Fail-fast rejections; the supervisor already knows storage is down.
                        ItemError::Storage(StorageError::Unavailable) => {}
                        ItemError::Storage(storage @ StorageError::Connection(_)) => {
                            self.health.record_error(storage.to_string());
                            self.health.report_storage_lost();
                        }
                        ItemError::Storage(storage) => self.health.record_error(storage.to_string()),
                        ItemError::Validation(_) => {}
                    }
                    let context = DeadLetterContext {
                        stage,
                        index: Some(index),
                        batch_len: Some(batch_len),
                        event_id: string_field(item, "event_id"),
                        device_id: string_field(item, "device_id"),
                    };
                    self.dead_letter(topic, item, &error, context, received_at)
                        .await;
                    ItemOutcome::DeadLettered { stage, error }
                }
            };
            report.outcomes.push(outcome);
        }
        report
    }

    async fn process_item(&self, item: &Value) -> Result<(EventRecord, bool), ItemError> {
        let event = validate_event(item, self.settings.supported_schema)?;
        let ts_device = self
            .settings
            .timestamps
            .interpret(event.ts_device.as_deref());
        if ts_device.is_none() {
            if let Some(raw) = event.ts_device.as_deref() {
                tracing::debug!(event_id=%event.event_id, ts_device=%raw, "unparsable device timestamp; storing without it");
            }
        }

        // Fail fast instead of queueing behind a storage outage.
        if !self.health.storage_available() {
            return Err(StorageError::Unavailable.into());
        }

        let record = event.into_record(ts_device, self.clock.now());
        self.health.begin_persist();
        let result = self.store.insert_event(&record).await;
        self.health.end_persist();
        let inserted = result?;
        Ok((record, inserted))
    }

    async fn acknowledge(&self, record: &EventRecord, inserted: bool) {
        if inserted {
            self.health.events_stored.fetch_add(1, Ordering::Relaxed);
            tracing::debug!(event_id=%record.event_id, device_id=%record.device_id, "stored event");
        } else {
            self.health.events_duplicate.fetch_add(1, Ordering::Relaxed);
            tracing::debug!(event_id=%record.event_id, device_id=%record.device_id, "event already stored; re-acking");
        }

        let topic = self.settings.ack_topic(&record.device_id);
        self.emit(&topic, &AckMessage::stored(record)).await;
    }

    async fn dead_letter(
        &self,
        source_topic: &str,
        payload: &Value,
        error: &str,
        context: DeadLetterContext,
        received_at: DateTime<Utc>,
    ) {
        self.health
            .events_dead_lettered
            .fetch_add(1, Ordering::Relaxed);
        let message = DeadLetterMessage {
            payload,
            error: error.to_string(),
            context,
            topic: source_topic,
            received_at,
        };
        self.emit(&self.settings.dead_letter_topic, &message).await;
    }

    /// Publish failures are logged and counted, never retried.
    async fn emit<T: Serialize>(&self, topic: &str, message: &T) {
        let payload = match serde_json::to_vec(message) {
            Ok(payload) => payload,
            Err(err) => {
                tracing::error!(error=%err, topic=%topic, "failed to encode outbound message");
                self.health.publish_failures.fetch_add(1, Ordering::Relaxed);
                return;
            }
        };
        if let Err(err) = self.publisher.publish(topic, payload).await {
            self.health.publish_failures.fetch_add(1, Ordering::Relaxed);
            self.health.record_error(err.to_string());
            tracing::warn!(error=%err, "failed to publish outbound message");
        }
    }
}

fn string_field(item: &Value, key: &str) -> Option<String> {
    item.get(key)
        .and_then(|value| value.as_str())
        .map(|value| value.to_string())
}

