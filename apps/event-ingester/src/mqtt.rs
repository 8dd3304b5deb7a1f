use crate::config::Config;
use crate::health::HealthState;
use crate::lifecycle::Backoff;
use crate::pipeline::{InboundMessage, PipelineHandle};
use anyhow::Result;
use rumqttc::{AsyncClient, Event, EventLoop, Incoming, MqttOptions, Outgoing, QoS};
use std::sync::Arc;
use tokio::sync::watch;
use tokio::time::{sleep, Duration};

pub fn mqtt_options(config: &Config) -> MqttOptions {
    let mut mqttoptions = MqttOptions::new(
        config.mqtt_client_id.clone(),
        config.mqtt_host.clone(),
        config.mqtt_port,
    );
    mqttoptions.set_keep_alive(config.mqtt_keepalive());
    if let Some(username) = &config.mqtt_username {
        mqttoptions.set_credentials(
            username.clone(),
            config.mqtt_password.clone().unwrap_or_default(),
        );
    }
    mqttoptions
}

pub fn connect(config: &Config) -> (AsyncClient, EventLoop) {
    AsyncClient::new(mqtt_options(config), config.mqtt_channel_capacity)
}

/// Drives the MQTT event loop and hands every received publish to the ingest queue.
///
/// The subscription is re-issued on each ConnAck so a reconnect with a clean session
/// keeps receiving events. Once `shutdown` fires the ingest queue is closed and the
/// loop keeps polling only until the client's disconnect goes out.
pub async fn run_listener(
    config: Config,
    client: AsyncClient,
    mut eventloop: EventLoop,
    pipeline: PipelineHandle,
    health: Arc<HealthState>,
    mut shutdown: watch::Receiver<bool>,
) -> Result<()> {
    let mut pipeline = Some(pipeline);
    let mut backoff = Backoff::new(Duration::from_secs(1), Duration::from_secs(30));
    loop {
        let event = tokio::select! {
            event = eventloop.poll() => event,
            _ = shutdown.changed(), if pipeline.is_some() => {
                tracing::info!("shutdown requested; closing ingest queue");
                pipeline = None;
                continue;
            }
        };

        match event {
            Ok(Event::Incoming(Incoming::ConnAck(ack))) => {
                health.set_mqtt_connected(true);
                backoff.reset();
                tracing::info!(host=%config.mqtt_host, port=config.mqtt_port, session_present=ack.session_present, "connected to MQTT broker");
                if pipeline.is_some() {
                    resubscribe(&client, &config.events_topic);
                }
            }
            Ok(Event::Incoming(Incoming::SubAck(ack))) => {
                tracing::debug!(pkid = ack.pkid, return_codes=?ack.return_codes, "subscription acknowledged");
            }
            Ok(Event::Incoming(Incoming::Publish(publish))) => {
                let Some(queue) = &pipeline else {
                    tracing::debug!(topic=%publish.topic, "ingest queue closed; dropping message");
                    continue;
                };
                let message = InboundMessage {
                    topic: publish.topic.clone(),
                    payload: publish.payload.to_vec(),
                };
                if let Err(err) = queue.enqueue(message).await {
                    tracing::warn!(error=%err, "ingest worker stopped; MQTT listener exiting");
                    return Ok(());
                }
            }
            Ok(Event::Incoming(Incoming::Disconnect)) => {
                health.set_mqtt_connected(false);
                tracing::warn!("MQTT broker sent disconnect");
            }
            Ok(Event::Outgoing(Outgoing::Disconnect)) if pipeline.is_none() => {
                health.set_mqtt_connected(false);
                tracing::info!("disconnected from MQTT broker");
                return Ok(());
            }
            Ok(_) => {}
            Err(err) if pipeline.is_none() => {
                health.set_mqtt_connected(false);
                tracing::info!(error=%err, "MQTT connection closed during shutdown");
                return Ok(());
            }
            Err(err) => {
                health.set_mqtt_connected(false);
                health.record_error(format!("mqtt: {err}"));
                let delay = backoff.next_delay();
                tracing::warn!(error=%err, retry_in_secs = delay.as_secs(), "MQTT connection error; reconnecting");
                sleep(delay).await;
            }
        }
    }
}

/// Queues the events subscription from a separate task.
///
/// The request channel may be full of pending acks; subscribing inline would stall
/// the poll loop that drains it.
fn resubscribe(client: &AsyncClient, filter: &str) {
    let client = client.clone();
    let filter = filter.to_string();
    tokio::spawn(async move {
        match client.subscribe(filter.clone(), QoS::AtLeastOnce).await {
            Ok(_) => tracing::info!(topic=%filter, "subscribed to event feed"),
            Err(err) => {
                tracing::warn!(error=%err, topic=%filter, "failed to queue subscription")
            }
        }
    });
}
