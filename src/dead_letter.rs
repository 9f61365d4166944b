// Dead-letter log. Batches that exhausted their retries (or were rejected)
// are appended here as JSON lines, one record per sample, so they can be
// replayed by hand with the `replay` binary.
//
// A dedicated blocking thread owns the file. Workers send it jobs over a
// channel and await a oneshot reply, which only arrives after the records
// were written and synced to disk.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::Path;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use crossbeam_channel::{Receiver, Sender, unbounded};
use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;
use tokio::task::{self, JoinHandle};

use crate::decode::Sample;
use crate::sink::{BatchEntry, BatchId, DeliveryId, SinkKind};

/// One failed write of one message to one sink. A message fanned out to
/// both sinks that fails on both gets two records sharing `delivery`;
/// `(delivery, sink)` is unique within a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeadLetterRecord {
    pub failed_at: DateTime<Utc>,
    pub sink: SinkKind,
    pub batch: BatchId,
    pub delivery: DeliveryId,
    pub attempts: u32,
    pub reason: String,
    /// Topic and payload to republish on replay.
    pub topic: String,
    pub payload: String,
    pub sample: Sample,
}

impl DeadLetterRecord {
    pub fn new(entry: &BatchEntry, sink: SinkKind, batch: BatchId, attempts: u32, reason: &str) -> Self {
        DeadLetterRecord {
            failed_at: Utc::now(),
            sink,
            batch,
            delivery: entry.delivery,
            attempts,
            reason: reason.to_string(),
            topic: entry.sample.topic(),
            payload: entry.sample.to_payload(),
            sample: entry.sample.clone(),
        }
    }
}

enum DeadLetterCommand {
    Append(Vec<DeadLetterRecord>),
    Shutdown,
}

struct DeadLetterJob {
    command: DeadLetterCommand,
    response: oneshot::Sender<Result<()>>,
}

#[derive(Clone)]
pub struct DeadLetterLog {
    tx: Sender<DeadLetterJob>,
}

impl DeadLetterLog {
    /// Open (or create) the log in append mode and start the writer thread.
    /// Failing to open the file is a startup error.
    pub fn open(path: impl AsRef<Path>) -> Result<(DeadLetterLog, JoinHandle<()>)> {
        let path = path.as_ref();
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("failed to open dead-letter log {}", path.display()))?;

        let (tx, rx): (Sender<DeadLetterJob>, Receiver<DeadLetterJob>) = unbounded();
        let join = task::spawn_blocking(move || run_writer(file, rx));

        tracing::info!(path = %path.display(), "dead-letter log opened");
        Ok((DeadLetterLog { tx }, join))
    }

    /// Append records; resolves once they are on disk.
    pub async fn append(&self, records: Vec<DeadLetterRecord>) -> Result<()> {
        if records.is_empty() {
            return Ok(());
        }
        self.request(DeadLetterCommand::Append(records)).await
    }

    pub async fn shutdown(&self) -> Result<()> {
        self.request(DeadLetterCommand::Shutdown).await
    }

    async fn request(&self, command: DeadLetterCommand) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        let job = DeadLetterJob { command, response: tx };
        self.tx
            .send(job)
            .map_err(|e| anyhow::anyhow!("dead-letter job send error: {}", e))?;
        rx.await
            .map_err(|e| anyhow::anyhow!("dead-letter job response error: {}", e))?
    }
}

fn run_writer(mut file: File, rx: Receiver<DeadLetterJob>) {
    while let Ok(job) = rx.recv() {
        match job.command {
            DeadLetterCommand::Append(records) => {
                let res = append_records(&mut file, &records);
                let _ = job.response.send(res);
            }
            DeadLetterCommand::Shutdown => {
                let res = file.sync_all().context("failed to sync dead-letter log");
                let _ = job.response.send(res);
                break;
            }
        }
    }
}

fn append_records(file: &mut File, records: &[DeadLetterRecord]) -> Result<()> {
    let mut buf = String::new();
    for record in records {
        buf.push_str(&serde_json::to_string(record).context("failed to encode dead-letter record")?);
        buf.push('\n');
    }
    file.write_all(buf.as_bytes()).context("failed to write dead-letter log")?;
    file.sync_data().context("failed to sync dead-letter log")?;
    Ok(())
}

/// Read every record from a dead-letter log.
pub fn read_records(path: impl AsRef<Path>) -> Result<Vec<DeadLetterRecord>> {
    let path = path.as_ref();
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read dead-letter log {}", path.display()))?;
    content
        .lines()
        .enumerate()
        .filter(|(_, line)| !line.trim().is_empty())
        .map(|(i, line)| {
            serde_json::from_str(line)
                .with_context(|| format!("{}:{}: invalid dead-letter record", path.display(), i + 1))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decode::SampleValue;
    use crate::topic::Metric;

    fn entry(delivery: u64, device: &str) -> BatchEntry {
        let sample = Sample::new(
            device,
            Metric::Gps,
            Utc::now(),
            None,
            SampleValue::Gps { lat: 1.5, lon: -2.5 },
        );
        BatchEntry { delivery, sample }
    }

    #[tokio::test]
    async fn test_append_and_read_back() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("dead.jsonl");
        let (log, join) = DeadLetterLog::open(&path).expect("open");

        let records = vec![
            DeadLetterRecord::new(&entry(1, "truck1"), SinkKind::Relational, 9, 3, "unavailable"),
            DeadLetterRecord::new(&entry(2, "truck2"), SinkKind::Relational, 9, 3, "unavailable"),
        ];
        log.append(records.clone()).await.expect("append");
        log.append(vec![DeadLetterRecord::new(&entry(3, "truck3"), SinkKind::TimeSeries, 10, 1, "rejected")])
            .await
            .expect("append");
        log.shutdown().await.expect("shutdown");
        join.await.expect("writer thread");

        let read = read_records(&path).expect("read");
        assert_eq!(read.len(), 3);
        assert_eq!(&read[..2], &records[..]);
        assert_eq!(read[2].delivery, 3);
        assert_eq!(read[0].topic, "logistics/truck1/gps");
    }

    #[tokio::test]
    async fn test_reopen_appends() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("dead.jsonl");
        for i in 0..2 {
            let (log, join) = DeadLetterLog::open(&path).expect("open");
            log.append(vec![DeadLetterRecord::new(&entry(i, "t"), SinkKind::TimeSeries, i, 1, "x")])
                .await
                .expect("append");
            log.shutdown().await.expect("shutdown");
            join.await.expect("writer thread");
        }
        assert_eq!(read_records(&path).expect("read").len(), 2);
    }

    #[test]
    fn test_open_fails_for_missing_directory() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("missing").join("dead.jsonl");
        let rt = tokio::runtime::Runtime::new().unwrap();
        let _guard = rt.enter();
        assert!(DeadLetterLog::open(&path).is_err());
    }
}
