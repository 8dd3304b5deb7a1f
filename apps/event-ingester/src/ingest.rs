mod batch;
mod clock;
mod ingestor;
mod timestamp;
mod types;
mod validate;

#[cfg(test)]
mod tests;

pub use timestamp::TimestampInterpreter;
pub use types::EventRecord;
#[cfg(test)]
pub use types::EventValue;

use crate::config::{Config, DEVICE_ID_PLACEHOLDER};
use crate::health::HealthState;
use crate::publish::Publisher;
use crate::store::EventStore;
use std::sync::Arc;

/// Topic routing and policy the coordinator applies to every message.
#[derive(Clone, Debug)]
pub struct IngestSettings {
    pub ack_template: String,
    pub dead_letter_topic: String,
    pub supported_schema: i64,
    pub timestamps: TimestampInterpreter,
}

impl IngestSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            ack_template: config.ack_template.clone(),
            dead_letter_topic: config.dead_letter_topic.clone(),
            supported_schema: config.supported_schema,
            timestamps: TimestampInterpreter::new(config.timezone),
        }
    }

    fn ack_topic(&self, device_id: &str) -> String {
        self.ack_template.replace(DEVICE_ID_PLACEHOLDER, device_id)
    }
}

#[derive(Clone)]
pub struct EventIngestor {
    store: Arc<dyn EventStore>,
    publisher: Arc<dyn Publisher>,
    health: Arc<HealthState>,
    settings: Arc<IngestSettings>,
    clock: Arc<clock::ServerClock>,
}
