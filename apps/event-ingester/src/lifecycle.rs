use crate::config::Config;
use crate::health::HealthState;
use crate::store::{build_pool, EventStore};
use anyhow::Result;
use sqlx::PgPool;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;

/// Doubling retry delay with a ceiling.
#[derive(Debug, Clone)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    current: Duration,
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self {
            initial,
            max,
            current: initial,
        }
    }

    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = (self.current * 2).min(self.max);
        delay
    }

    pub fn reset(&mut self) {
        self.current = self.initial;
    }
}

fn storage_backoff() -> Backoff {
    Backoff::new(Duration::from_secs(2), Duration::from_secs(30))
}

/// Connects the Postgres pool, retrying until it succeeds.
pub async fn connect_store(config: &Config) -> Result<PgPool> {
    let options = config.pg_connect_options()?;
    let mut backoff = storage_backoff();
    loop {
        match build_pool(options.clone(), config.db_pool_size).await {
            Ok(pool) => {
                tracing::info!(pool_size = config.db_pool_size, "connected to Postgres");
                return Ok(pool);
            }
            Err(err) => {
                let delay = backoff.next_delay();
                tracing::warn!(error=%err, retry_in_secs = delay.as_secs(), "Postgres connect failed; retrying");
                sleep(delay).await;
            }
        }
    }
}

/// Keeps `HealthState::storage_available` in step with the store.
///
/// Probes on `interval` while healthy, and with backoff while down. A connectivity
/// error reported by the coordinator triggers an immediate probe.
pub struct StorageSupervisor {
    store: Arc<dyn EventStore>,
    health: Arc<HealthState>,
    interval: Duration,
    backoff: Backoff,
}

impl StorageSupervisor {
    pub fn new(store: Arc<dyn EventStore>, health: Arc<HealthState>, interval: Duration) -> Self {
        Self {
            store,
            health,
            interval,
            backoff: storage_backoff(),
        }
    }

    pub fn with_backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    pub async fn run(mut self) {
        let mut retry_delay = self.backoff.next_delay();
        loop {
            let wait = if self.health.storage_available() {
                self.interval
            } else {
                retry_delay
            };
            tokio::select! {
                _ = sleep(wait) => {}
                _ = self.health.storage_suspected() => {}
            }

            match self.store.ping().await {
                Ok(()) => {
                    if !self.health.storage_available() {
                        tracing::info!("storage connection restored");
                    }
                    self.health.set_storage_available(true);
                    self.backoff.reset();
                    retry_delay = self.backoff.next_delay();
                }
                Err(err) => {
                    if self.health.storage_available() {
                        tracing::error!(error=%err, "storage connection lost");
                    } else {
                        tracing::warn!(error=%err, retry_in_ms = retry_delay.as_millis() as u64, "storage still unavailable");
                    }
                    self.health.set_storage_available(false);
                    self.health.record_error(err.to_string());
                    retry_delay = self.backoff.next_delay();
                }
            }
        }
    }
}
