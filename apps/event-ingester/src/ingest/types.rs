use crate::error::Stage;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;

/// Event value after dual typing: numeric-coercible inputs land in `Number`.
#[derive(Debug, Clone, PartialEq)]
pub enum EventValue {
    Number(f64),
    Text(String),
}

/// A payload that passed validation; timestamps are not resolved yet.
#[derive(Debug, Clone, PartialEq)]
pub struct ValidatedEvent {
    pub event_id: String,
    pub device_id: String,
    pub schema: i32,
    pub event_type: String,
    pub value: Option<EventValue>,
    pub unit: Option<String>,
    pub ts_device: Option<String>,
    pub meta: Value,
}

impl ValidatedEvent {
    pub fn into_record(
        self,
        ts_device: Option<DateTime<Utc>>,
        ts_server: DateTime<Utc>,
    ) -> EventRecord {
        EventRecord {
            event_id: self.event_id,
            device_id: self.device_id,
            schema: self.schema,
            event_type: self.event_type,
            value: self.value,
            unit: self.unit,
            ts_device,
            ts_server,
            meta: self.meta,
        }
    }
}

/// The persisted row shape of the `events` table.
#[derive(Debug, Clone, PartialEq)]
pub struct EventRecord {
    pub event_id: String,
    pub device_id: String,
    pub schema: i32,
    pub event_type: String,
    pub value: Option<EventValue>,
    pub unit: Option<String>,
    pub ts_device: Option<DateTime<Utc>>,
    pub ts_server: DateTime<Utc>,
    pub meta: Value,
}

impl EventRecord {
    pub fn value_num(&self) -> Option<f64> {
        match &self.value {
            Some(EventValue::Number(value)) => Some(*value),
            _ => None,
        }
    }

    pub fn value_text(&self) -> Option<&str> {
        match &self.value {
            Some(EventValue::Text(value)) => Some(value.as_str()),
            _ => None,
        }
    }
}

pub const ACK_STATUS_STORED: &str = "stored";

#[derive(Debug, Clone, Serialize)]
pub struct AckMessage<'a> {
    pub schema: i32,
    pub event_id: &'a str,
    pub device_id: &'a str,
    pub status: &'static str,
}

impl<'a> AckMessage<'a> {
    pub fn stored(record: &'a EventRecord) -> Self {
        Self {
            schema: record.schema,
            event_id: &record.event_id,
            device_id: &record.device_id,
            status: ACK_STATUS_STORED,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct DeadLetterContext {
    pub stage: Stage,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub index: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub batch_len: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub event_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub device_id: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct DeadLetterMessage<'a> {
    /// Original batch item, or the raw body text when the body itself was undecodable.
    pub payload: &'a Value,
    pub error: String,
    pub context: DeadLetterContext,
    pub topic: &'a str,
    pub received_at: DateTime<Utc>,
}

/// Terminal outcome of one batch item.
#[derive(Debug, Clone, PartialEq)]
pub enum ItemOutcome {
    Acked { event_id: String, inserted: bool },
    DeadLettered { stage: Stage, error: String },
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct MessageReport {
    pub outcomes: Vec<ItemOutcome>,
}

impl MessageReport {
    pub fn acked(&self) -> usize {
        self.outcomes
            .iter()
            .filter(|outcome| matches!(outcome, ItemOutcome::Acked { .. }))
            .count()
    }

    pub fn dead_lettered(&self) -> usize {
        self.outcomes.len() - self.acked()
    }
}
