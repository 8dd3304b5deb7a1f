use crate::error::StorageError;
use crate::ingest::EventRecord;
use async_trait::async_trait;
use sqlx::postgres::{PgConnectOptions, PgPoolOptions};
use sqlx::types::Json as SqlJson;
use sqlx::PgPool;

/// Durable event storage keyed by `event_id`.
#[async_trait]
pub trait EventStore: Send + Sync {
    /// Idempotent insert. `Ok(true)` when the row is new, `Ok(false)` when the
    /// `event_id` was already stored; identity conflicts are never errors.
    async fn insert_event(&self, record: &EventRecord) -> Result<bool, StorageError>;

    /// Cheap round trip used by the connection supervisor.
    async fn ping(&self) -> Result<(), StorageError>;
}

#[derive(Clone)]
pub struct PgEventStore {
    pool: PgPool,
}

impl PgEventStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

pub async fn build_pool(
    options: PgConnectOptions,
    max_connections: u32,
) -> Result<PgPool, sqlx::Error> {
    PgPoolOptions::new()
        .max_connections(max_connections)
        .connect_with(options)
        .await
}

#[async_trait]
impl EventStore for PgEventStore {
    async fn insert_event(&self, record: &EventRecord) -> Result<bool, StorageError> {
        let result = sqlx::query(
            r#"
            INSERT INTO events
              (event_id, device_id, schema, event_type, value_num, value_text, unit, ts_device, ts_server, meta)
            VALUES
              ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            ON CONFLICT (event_id) DO NOTHING
            "#,
        )
        .bind(&record.event_id)
        .bind(&record.device_id)
        .bind(record.schema)
        .bind(&record.event_type)
        .bind(record.value_num())
        .bind(record.value_text())
        .bind(record.unit.as_deref())
        .bind(record.ts_device)
        .bind(record.ts_server)
        .bind(SqlJson(&record.meta))
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn ping(&self) -> Result<(), StorageError> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}
