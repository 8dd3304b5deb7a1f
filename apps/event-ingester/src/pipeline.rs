use crate::health::HealthState;
use crate::ingest::EventIngestor;
use anyhow::Result;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// One MQTT publish as received, before decoding.
#[derive(Debug, Clone)]
pub struct InboundMessage {
    pub topic: String,
    pub payload: Vec<u8>,
}

#[derive(Clone)]
pub struct PipelineHandle {
    tx: mpsc::Sender<InboundMessage>,
    health: Arc<HealthState>,
}

impl PipelineHandle {
    pub fn new(tx: mpsc::Sender<InboundMessage>, health: Arc<HealthState>) -> Self {
        Self { tx, health }
    }

    /// Waits for queue space, so a slow store pushes back on the MQTT loop.
    pub async fn enqueue(&self, message: InboundMessage) -> Result<()> {
        let queue_depth = self.health.queue_depth.fetch_add(1, Ordering::Relaxed) + 1;
        tracing::trace!(queue_depth, topic = %message.topic, "queued message");
        if let Err(err) = self.tx.send(message).await {
            self.health.queue_depth.fetch_sub(1, Ordering::Relaxed);
            return Err(err.into());
        }
        Ok(())
    }
}

/// Processes queued messages one at a time, in arrival order.
pub fn spawn_worker(ingestor: EventIngestor, mut rx: mpsc::Receiver<InboundMessage>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let health = ingestor.health();
        while let Some(message) = rx.recv().await {
            health.queue_depth.fetch_sub(1, Ordering::Relaxed);
            let report = ingestor
                .handle_message(&message.topic, &message.payload)
                .await;
            tracing::debug!(
                topic = %message.topic,
                acked = report.acked(),
                dead_lettered = report.dead_lettered(),
                "processed message"
            );
        }
        tracing::info!("ingest queue closed; worker exiting");
    })
}
