use crate::error::PublishError;
use async_trait::async_trait;
use rumqttc::{AsyncClient, QoS};

/// Outbound side of the messaging channel (acks and dead letters).
#[async_trait]
pub trait Publisher: Send + Sync {
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), PublishError>;
}

#[derive(Clone)]
pub struct MqttPublisher {
    client: AsyncClient,
}

impl MqttPublisher {
    pub fn new(client: AsyncClient) -> Self {
        Self { client }
    }
}

#[async_trait]
impl Publisher for MqttPublisher {
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), PublishError> {
        // Fails when the client request queue is full; never waits on the event loop.
        self.client
            .try_publish(topic, QoS::AtLeastOnce, false, payload)
            .map_err(|err| PublishError {
                topic: topic.to_string(),
                reason: err.to_string(),
            })
    }
}
