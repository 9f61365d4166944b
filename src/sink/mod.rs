// Storage sinks. A worker hands a `Batch` to exactly one `Sink`; the two
// implementations live in `postgres` (device records) and `influx`
// (sensor time series).
pub mod influx;
pub mod postgres;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

use crate::decode::Sample;

pub use influx::TimeSeriesSink;
pub use postgres::RelationalSink;

/// Identifier of a received broker message, assigned in arrival order.
pub type DeliveryId = u64;

pub type BatchId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SinkKind {
    Relational,
    TimeSeries,
}

impl SinkKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SinkKind::Relational => "relational",
            SinkKind::TimeSeries => "time_series",
        }
    }
}

impl fmt::Display for SinkKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum SinkError {
    /// Store unreachable or overloaded; worth retrying.
    #[error("sink unavailable: {0}")]
    Unavailable(String),
    /// Store refused the data; retrying cannot help.
    #[error("sink rejected batch: {0}")]
    Rejected(String),
}

impl SinkError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, SinkError::Unavailable(_))
    }
}

#[derive(Debug, Clone)]
pub struct BatchEntry {
    pub delivery: DeliveryId,
    pub sample: Sample,
}

/// Samples bound for one sink, in arrival order.
#[derive(Debug, Clone)]
pub struct Batch {
    id: BatchId,
    sink: SinkKind,
    entries: Vec<BatchEntry>,
}

impl Batch {
    pub fn new(id: BatchId, sink: SinkKind, entries: Vec<BatchEntry>) -> Self {
        Batch { id, sink, entries }
    }

    pub fn id(&self) -> BatchId {
        self.id
    }

    pub fn sink(&self) -> SinkKind {
        self.sink
    }

    pub fn entries(&self) -> &[BatchEntry] {
        &self.entries
    }

    pub fn samples(&self) -> impl Iterator<Item = &Sample> {
        self.entries.iter().map(|e| &e.sample)
    }

    pub fn deliveries(&self) -> impl Iterator<Item = DeliveryId> + '_ {
        self.entries.iter().map(|e| e.delivery)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[async_trait]
pub trait Sink: Send + Sync {
    /// Durably write the whole batch or fail.
    async fn write_batch(&self, batch: &Batch) -> Result<(), SinkError>;
}

/// One handle per sink kind, shared by every worker.
#[derive(Clone)]
pub struct Sinks {
    pub relational: Arc<dyn Sink>,
    pub time_series: Arc<dyn Sink>,
}

impl Sinks {
    pub fn get(&self, kind: SinkKind) -> &Arc<dyn Sink> {
        match kind {
            SinkKind::Relational => &self.relational,
            SinkKind::TimeSeries => &self.time_series,
        }
    }
}
