// Relational sink: keeps one row per device in PostgreSQL with its last
// known position and last-seen time. Rows are upserted, so a redelivered
// message rewrites the same row instead of adding one.
use std::collections::HashMap;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgPoolOptions};

use super::{Batch, Sink, SinkError};
use crate::config::PostgresConfig;
use crate::decode::SampleValue;

const CREATE_DEVICES_TABLE: &str = "CREATE TABLE IF NOT EXISTS devices (
    device_id   TEXT PRIMARY KEY,
    last_seen   TIMESTAMPTZ NOT NULL,
    latitude    DOUBLE PRECISION,
    longitude   DOUBLE PRECISION,
    updated_at  TIMESTAMPTZ NOT NULL DEFAULT now()
)";

// Older samples never overwrite newer state, which keeps replays and
// redeliveries harmless.
const UPSERT_DEVICE: &str = "INSERT INTO devices (device_id, last_seen, latitude, longitude, updated_at)
VALUES ($1, $2, $3, $4, now())
ON CONFLICT (device_id) DO UPDATE SET
    last_seen = EXCLUDED.last_seen,
    latitude = COALESCE(EXCLUDED.latitude, devices.latitude),
    longitude = COALESCE(EXCLUDED.longitude, devices.longitude),
    updated_at = now()
WHERE devices.last_seen <= EXCLUDED.last_seen";

#[derive(Debug, Clone, PartialEq)]
pub struct DeviceUpsert {
    pub device_id: String,
    pub last_seen: DateTime<Utc>,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
}

/// Reduce a batch to one upsert per device, keeping the newest sample. On
/// equal timestamps the later arrival wins.
pub fn collapse(batch: &Batch) -> Vec<DeviceUpsert> {
    let mut index: HashMap<&str, usize> = HashMap::new();
    let mut out: Vec<DeviceUpsert> = Vec::new();

    for sample in batch.samples() {
        let (latitude, longitude) = match sample.value() {
            SampleValue::Gps { lat, lon } => (Some(*lat), Some(*lon)),
            _ => (None, None),
        };
        let upsert = DeviceUpsert {
            device_id: sample.device_id().to_string(),
            last_seen: sample.timestamp(),
            latitude,
            longitude,
        };
        match index.get(sample.device_id()) {
            Some(&i) => {
                if upsert.last_seen >= out[i].last_seen {
                    out[i] = upsert;
                }
            }
            None => {
                index.insert(sample.device_id(), out.len());
                out.push(upsert);
            }
        }
    }
    out
}

/// Map a driver error onto the retry taxonomy. Connection-level failures
/// and SQLSTATE classes 08/40/53/57/58 are transient, everything else is a
/// rejection of the data itself.
pub fn classify(err: sqlx::Error) -> SinkError {
    match &err {
        sqlx::Error::Database(db) => {
            let code = db.code().map(|c| c.into_owned()).unwrap_or_default();
            match code.get(..2) {
                Some("08" | "40" | "53" | "57" | "58") => SinkError::Unavailable(err.to_string()),
                _ => SinkError::Rejected(err.to_string()),
            }
        }
        sqlx::Error::Io(_)
        | sqlx::Error::Tls(_)
        | sqlx::Error::Protocol(_)
        | sqlx::Error::PoolTimedOut
        | sqlx::Error::PoolClosed
        | sqlx::Error::WorkerCrashed => SinkError::Unavailable(err.to_string()),
        _ => SinkError::Rejected(err.to_string()),
    }
}

pub struct RelationalSink {
    pool: PgPool,
}

impl RelationalSink {
    pub async fn connect(config: &PostgresConfig) -> anyhow::Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .acquire_timeout(Duration::from_secs(5))
            .connect(&config.url)
            .await
            .context("failed to connect to PostgreSQL")?;
        tracing::info!(max_connections = config.max_connections, "connected to PostgreSQL");
        Ok(Self::from_pool(pool))
    }

    pub fn from_pool(pool: PgPool) -> Self {
        RelationalSink { pool }
    }

    pub async fn ensure_schema(&self) -> anyhow::Result<()> {
        sqlx::query(CREATE_DEVICES_TABLE)
            .execute(&self.pool)
            .await
            .context("failed to create devices table")?;
        Ok(())
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

#[async_trait]
impl Sink for RelationalSink {
    async fn write_batch(&self, batch: &Batch) -> Result<(), SinkError> {
        let upserts = collapse(batch);
        if upserts.is_empty() {
            return Ok(());
        }

        // Dropping `tx` on an early return rolls the whole batch back and
        // returns the connection to the pool.
        let mut tx = self.pool.begin().await.map_err(classify)?;
        for upsert in &upserts {
            sqlx::query(UPSERT_DEVICE)
                .bind(&upsert.device_id)
                .bind(upsert.last_seen)
                .bind(upsert.latitude)
                .bind(upsert.longitude)
                .execute(&mut *tx)
                .await
                .map_err(classify)?;
        }
        tx.commit().await.map_err(classify)?;

        tracing::debug!(batch = batch.id(), devices = upserts.len(), "upserted device records");
        Ok(())
    }
}
