mod config;
mod error;
mod health;
mod ingest;
mod lifecycle;
mod mqtt;
mod pipeline;
mod publish;
mod store;

use crate::config::Config;
use crate::health::{HealthState, HttpState};
use crate::ingest::{EventIngestor, IngestSettings};
use crate::lifecycle::{connect_store, StorageSupervisor};
use crate::pipeline::{spawn_worker, InboundMessage, PipelineHandle};
use crate::publish::MqttPublisher;
use crate::store::PgEventStore;
use anyhow::Result;
use futures::future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};

const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

fn init_tracing(config: &Config) -> Result<()> {
    use opentelemetry::KeyValue;
    use opentelemetry_otlp::WithExportConfig;
    use opentelemetry_sdk::{runtime::Tokio, trace::Config as OTelTraceConfig, Resource};
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "info,event_ingester=info".into());
    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_target(true)
        .with_thread_ids(true);

    if let Some(endpoint) = &config.otlp_endpoint {
        let endpoint = normalize_otlp_http_endpoint(endpoint);
        let exporter = opentelemetry_otlp::new_exporter()
            .http()
            .with_endpoint(endpoint);
        let tracer = opentelemetry_otlp::new_pipeline()
            .tracing()
            .with_exporter(exporter)
            .with_trace_config(OTelTraceConfig::default().with_resource(Resource::new(vec![
                KeyValue::new("service.name", "event-ingester"),
            ])))
            .install_batch(Tokio)?;

        let otel_layer = tracing_opentelemetry::layer().with_tracer(tracer);
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt_layer)
            .with(otel_layer)
            .try_init()?;
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt_layer)
            .try_init()?;
    }

    Ok(())
}

fn normalize_otlp_http_endpoint(endpoint: &str) -> String {
    let trimmed = endpoint.trim_end_matches('/');
    if trimmed.ends_with("/v1/traces") {
        return trimmed.to_string();
    }
    format!("{trimmed}/v1/traces")
}

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::from_env()?;
    init_tracing(&config)?;
    tracing::info!(
        events_topic=%config.events_topic,
        dead_letter_topic=%config.dead_letter_topic,
        timezone=%config.timezone,
        "starting event ingester"
    );

    let health = Arc::new(HealthState::new());
    let pool = connect_store(&config).await?;
    health.set_storage_available(true);
    let store = Arc::new(PgEventStore::new(pool.clone()));

    let (client, eventloop) = mqtt::connect(&config);
    let publisher = Arc::new(MqttPublisher::new(client.clone()));
    let ingestor = EventIngestor::new(
        store.clone(),
        publisher,
        health.clone(),
        IngestSettings::from_config(&config),
    );

    let (tx, rx) = mpsc::channel::<InboundMessage>(config.max_queue);
    let pipeline = PipelineHandle::new(tx, health.clone());
    let mut worker_handle = spawn_worker(ingestor, rx);

    let supervisor_handle = tokio::spawn(
        StorageSupervisor::new(store, health.clone(), config.storage_check_interval()).run(),
    );

    let http_handle = match &config.health_bind {
        Some(bind) => {
            let app = health::router(HttpState {
                health: health.clone(),
                stall_threshold: config.stall_threshold(),
            });
            let listener = tokio::net::TcpListener::bind(bind).await?;
            tracing::info!(bind=%bind, "health endpoint listening");
            Some(tokio::spawn(async move {
                if let Err(err) = axum::serve(listener, app).await {
                    tracing::error!(error=%err, "health endpoint exited");
                }
            }))
        }
        None => None,
    };

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut mqtt_handle = {
        let config = config.clone();
        let client = client.clone();
        let health = health.clone();
        tokio::spawn(async move {
            mqtt::run_listener(config, client, eventloop, pipeline, health, shutdown_rx).await
        })
    };

    tokio::select! {
        res = &mut mqtt_handle => {
            match res {
                Ok(Ok(())) => tracing::warn!("MQTT listener stopped"),
                Ok(Err(err)) => tracing::error!(error=%err, "MQTT listener failed"),
                Err(err) => tracing::error!(error=%err, "MQTT task failed"),
            }
        }
        res = &mut worker_handle => {
            if let Err(err) = res { tracing::error!(error=%err, "ingest worker failed"); }
        }
        _ = async {
            if let Some(handle) = http_handle {
                let _ = handle.await;
            } else {
                future::pending::<()>().await;
            }
        } => {}
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("shutdown signal received");
        }
    }

    // Close the queue and let queued messages finish before dropping the connections.
    let _ = shutdown_tx.send(true);
    if !worker_handle.is_finished() {
        match tokio::time::timeout(SHUTDOWN_GRACE, &mut worker_handle).await {
            Ok(Err(err)) => tracing::error!(error=%err, "ingest worker failed"),
            Ok(Ok(())) => {}
            Err(_) => {
                tracing::warn!("ingest worker did not drain in time");
                worker_handle.abort();
            }
        }
    }

    if let Err(err) = client.disconnect().await {
        tracing::warn!(error=%err, "failed to queue MQTT disconnect");
    }
    if !mqtt_handle.is_finished()
        && tokio::time::timeout(SHUTDOWN_GRACE, &mut mqtt_handle)
            .await
            .is_err()
    {
        tracing::warn!("MQTT listener did not disconnect in time");
        mqtt_handle.abort();
    }

    supervisor_handle.abort();
    pool.close().await;
    tracing::info!("event ingester stopped");

    Ok(())
}
