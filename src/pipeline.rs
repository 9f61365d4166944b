// Ingestion pipeline: a fixed pool of workers, each fed by its own bounded
// queue. A stable hash of (device, metric) picks the worker, so one stream
// is always handled by one worker and its acknowledgments stay in order.
//
// Worker cycle: Idle (waiting on the queue) -> Batching -> Dispatching ->
// Acking | Retrying -> Idle. Relational and time-series batches fill
// independently and flush on size or age, whichever comes first.
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use prometheus::IntGauge;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinSet;
use tokio::time::{Instant, sleep_until};
use tokio_util::sync::CancellationToken;

use crate::config::PipelineConfig;
use crate::dead_letter::{DeadLetterLog, DeadLetterRecord};
use crate::decode::Sample;
use crate::delivery::{Acknowledger, DeliveryTracker, Outcome, Receipt, Settled};
use crate::metrics::IngestMetrics;
use crate::retry::{self, WriteOutcome};
use crate::sink::{Batch, BatchEntry, BatchId, SinkKind, Sinks};
use crate::topic::{Metric, TopicKey};

/// Unit of work on a worker queue.
#[derive(Debug)]
pub enum Envelope {
    Sample { receipt: Receipt, sample: Sample },
    /// Payload failed to decode. Still routed to the stream's worker so its
    /// acknowledgment keeps its place in the stream order.
    Discard { receipt: Receipt, key: TopicKey },
}

impl Envelope {
    fn stream(&self) -> (&str, Metric) {
        match self {
            Envelope::Sample { sample, .. } => (sample.device_id(), sample.metric()),
            Envelope::Discard { key, .. } => (key.device_id.as_str(), key.metric),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum EnqueueError {
    #[error("ingest queue is full")]
    Full(Envelope),
    #[error("pipeline is shutting down")]
    Closed(Envelope),
}

/// Everything a worker needs, passed in explicitly at startup.
pub struct PipelineContext {
    pub config: PipelineConfig,
    pub sinks: Sinks,
    pub dead_letters: DeadLetterLog,
    pub acker: Arc<dyn Acknowledger>,
    pub metrics: IngestMetrics,
}

/// Stable worker assignment for a stream.
pub fn shard(device_id: &str, metric: Metric, workers: usize) -> usize {
    let mut hasher = DefaultHasher::new();
    device_id.hash(&mut hasher);
    metric.hash(&mut hasher);
    (hasher.finish() % workers.max(1) as u64) as usize
}

/// The worker queues and the gauge reporting how many envelopes they hold.
#[derive(Clone)]
struct Queues {
    senders: Arc<[mpsc::Sender<Envelope>]>,
    depth: IntGauge,
}

impl Queues {
    fn for_stream(&self, device_id: &str, metric: Metric) -> &mpsc::Sender<Envelope> {
        &self.senders[shard(device_id, metric, self.senders.len())]
    }

    /// Producers still waiting for a slot are not counted.
    fn observe(&self) {
        let depth: usize = self.senders.iter().map(|s| s.max_capacity() - s.capacity()).sum();
        self.depth.set(depth as i64);
    }
}

/// Producer side of the worker queues. Cheap to clone.
#[derive(Clone)]
pub struct PipelineHandle {
    queues: Queues,
    stop: CancellationToken,
}

impl PipelineHandle {
    fn queue_for(&self, envelope: &Envelope) -> mpsc::Sender<Envelope> {
        let (device_id, metric) = envelope.stream();
        self.queues.for_stream(device_id, metric).clone()
    }

    /// Enqueue, waiting while the target queue is full.
    pub async fn enqueue(&self, envelope: Envelope) -> Result<(), EnqueueError> {
        if self.stop.is_cancelled() {
            return Err(EnqueueError::Closed(envelope));
        }
        let res = self.queue_for(&envelope).send(envelope).await;
        self.queues.observe();
        res.map_err(|e| EnqueueError::Closed(e.0))
    }

    /// Enqueue without waiting; a full queue hands the envelope back.
    pub fn try_enqueue(&self, envelope: Envelope) -> Result<(), EnqueueError> {
        if self.stop.is_cancelled() {
            return Err(EnqueueError::Closed(envelope));
        }
        let res = self.queue_for(&envelope).try_send(envelope);
        self.queues.observe();
        res.map_err(|e| match e {
            TrySendError::Full(env) => EnqueueError::Full(env),
            TrySendError::Closed(env) => EnqueueError::Closed(env),
        })
    }

    pub fn is_closed(&self) -> bool {
        self.stop.is_cancelled()
    }
}

pub struct Pipeline {
    workers: JoinSet<()>,
    stop: CancellationToken,
    force: CancellationToken,
    grace: Duration,
}

impl Pipeline {
    pub fn start(ctx: PipelineContext) -> (Pipeline, PipelineHandle) {
        let stop = CancellationToken::new();
        let force = CancellationToken::new();
        let capacity = ctx.config.per_worker_capacity();
        let batch_ids = Arc::new(AtomicU64::new(1));

        let (senders, receivers): (Vec<_>, Vec<_>) =
            (0..ctx.config.workers.max(1)).map(|_| mpsc::channel(capacity)).unzip();
        let queues = Queues {
            senders: senders.into(),
            depth: ctx.metrics.queue_depth.clone(),
        };
        let (size, timeout) = (ctx.config.batch_size, ctx.config.batch_timeout);

        let mut workers = JoinSet::new();
        for (index, rx) in receivers.into_iter().enumerate() {
            let worker = Worker {
                index,
                rx,
                queues: queues.clone(),
                relational: Batcher::new(SinkKind::Relational, size, timeout),
                time_series: Batcher::new(SinkKind::TimeSeries, size, timeout),
                tracker: DeliveryTracker::new(ctx.acker.clone()),
                sinks: ctx.sinks.clone(),
                dead_letters: ctx.dead_letters.clone(),
                backoff: ctx.config.backoff.clone(),
                metrics: ctx.metrics.clone(),
                batch_ids: batch_ids.clone(),
                stop: stop.clone(),
                force: force.clone(),
            };
            workers.spawn(worker.run());
        }
        let worker_count = queues.senders.len();
        tracing::info!(
            workers = worker_count,
            queue_capacity = capacity * worker_count,
            "pipeline started"
        );

        let handle = PipelineHandle {
            queues,
            stop: stop.clone(),
        };
        let pipeline = Pipeline {
            workers,
            stop,
            force,
            grace: ctx.config.shutdown_grace,
        };
        (pipeline, handle)
    }

    /// Stop accepting work, let workers drain for up to the grace period,
    /// then force-close them. Force-closed workers dead-letter everything
    /// still pending.
    pub async fn shutdown(mut self) {
        self.stop.cancel();
        tracing::info!(grace_ms = self.grace.as_millis() as u64, "draining pipeline");

        let workers = &mut self.workers;
        let drained = tokio::time::timeout(self.grace, async {
            while let Some(res) = workers.join_next().await {
                if let Err(e) = res {
                    tracing::error!(error = %e, "worker task failed");
                }
            }
        })
        .await
        .is_ok();

        if !drained {
            tracing::warn!("grace period elapsed, force-closing workers");
            self.force.cancel();
            while let Some(res) = self.workers.join_next().await {
                if let Err(e) = res {
                    tracing::error!(error = %e, "worker task failed");
                }
            }
        }
        tracing::info!("pipeline stopped");
    }
}

/// Accumulates entries for one sink until it is full or old enough.
struct Batcher {
    sink: SinkKind,
    entries: Vec<BatchEntry>,
    opened_at: Option<Instant>,
    max_size: usize,
    max_wait: Duration,
}

impl Batcher {
    fn new(sink: SinkKind, max_size: usize, max_wait: Duration) -> Self {
        Batcher {
            sink,
            entries: Vec::with_capacity(max_size),
            opened_at: None,
            max_size: max_size.max(1),
            max_wait,
        }
    }

    /// Returns true once the batch reached its size limit.
    fn push(&mut self, entry: BatchEntry) -> bool {
        if self.entries.is_empty() {
            self.opened_at = Some(Instant::now());
        }
        self.entries.push(entry);
        self.entries.len() >= self.max_size
    }

    fn deadline(&self) -> Option<Instant> {
        self.opened_at.map(|t| t + self.max_wait)
    }

    fn take(&mut self) -> Vec<BatchEntry> {
        self.opened_at = None;
        std::mem::replace(&mut self.entries, Vec::with_capacity(self.max_size))
    }
}

struct Worker {
    index: usize,
    rx: mpsc::Receiver<Envelope>,
    queues: Queues,
    relational: Batcher,
    time_series: Batcher,
    tracker: DeliveryTracker,
    sinks: Sinks,
    dead_letters: DeadLetterLog,
    backoff: retry::BackoffConfig,
    metrics: IngestMetrics,
    batch_ids: Arc<AtomicU64>,
    stop: CancellationToken,
    force: CancellationToken,
}

impl Worker {
    async fn run(mut self) {
        let mut closing = false;
        loop {
            let deadline = self.next_deadline();
            // Disabled branches are still constructed, so the timer needs a
            // concrete instant even without an open batch.
            let wake = deadline.unwrap_or_else(|| Instant::now() + Duration::from_secs(3600));

            tokio::select! {
                biased;
                _ = self.force.cancelled() => {
                    self.abort().await;
                    break;
                }
                _ = self.stop.cancelled(), if !closing => {
                    // Buffered envelopes stay receivable; new sends fail.
                    closing = true;
                    self.rx.close();
                }
                envelope = self.rx.recv() => match envelope {
                    Some(envelope) => {
                        self.queues.observe();
                        self.accept(envelope).await;
                        // a busy queue must not starve the age trigger
                        self.flush_expired().await;
                    }
                    None => {
                        self.dispatch(SinkKind::Relational).await;
                        self.dispatch(SinkKind::TimeSeries).await;
                        if self.force.is_cancelled() {
                            self.abort().await;
                        }
                        break;
                    }
                },
                _ = sleep_until(wake), if deadline.is_some() => {
                    self.flush_expired().await;
                }
            }
        }
        tracing::debug!(worker = self.index, in_flight = self.tracker.in_flight(), "worker stopped");
    }

    fn next_deadline(&self) -> Option<Instant> {
        match (self.relational.deadline(), self.time_series.deadline()) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    fn batcher_mut(&mut self, kind: SinkKind) -> &mut Batcher {
        match kind {
            SinkKind::Relational => &mut self.relational,
            SinkKind::TimeSeries => &mut self.time_series,
        }
    }

    /// Register the envelope with the tracker and add it to its batches.
    /// Returns the sinks whose batch is now full.
    fn stage(&mut self, envelope: Envelope) -> Vec<SinkKind> {
        match envelope {
            Envelope::Discard { receipt, .. } => {
                let settled = self.tracker.register(receipt, 0);
                self.record(&settled);
                Vec::new()
            }
            Envelope::Sample { receipt, sample } => {
                let delivery = receipt.id;
                let kinds = sample.sinks();
                let settled = self.tracker.register(receipt, kinds.len());
                self.record(&settled);

                let mut full = Vec::new();
                for &kind in kinds {
                    let entry = BatchEntry {
                        delivery,
                        sample: sample.clone(),
                    };
                    if self.batcher_mut(kind).push(entry) {
                        full.push(kind);
                    }
                }
                full
            }
        }
    }

    async fn accept(&mut self, envelope: Envelope) {
        for kind in self.stage(envelope) {
            self.dispatch(kind).await;
        }
    }

    async fn flush_expired(&mut self) {
        let now = Instant::now();
        for kind in [SinkKind::Relational, SinkKind::TimeSeries] {
            if self.batcher_mut(kind).deadline().is_some_and(|d| d <= now) {
                self.dispatch(kind).await;
            }
        }
    }

    fn take_batch(&mut self, kind: SinkKind) -> Option<Batch> {
        let entries = self.batcher_mut(kind).take();
        if entries.is_empty() {
            return None;
        }
        let id: BatchId = self.batch_ids.fetch_add(1, Ordering::Relaxed);
        let batch = Batch::new(id, kind, entries);
        self.tracker.attach(id, batch.deliveries());
        Some(batch)
    }

    async fn dispatch(&mut self, kind: SinkKind) {
        let Some(batch) = self.take_batch(kind) else {
            return;
        };
        let sink = self.sinks.get(kind).clone();
        let metrics = self.metrics.clone();

        let outcome = retry::write_with_retry(sink.as_ref(), &batch, &self.backoff, &self.force, |_, _| {
            metrics.sink_retry(kind)
        })
        .await;

        let settled = match outcome {
            WriteOutcome::Written { attempts } => {
                self.metrics.batch_written(kind);
                tracing::debug!(
                    worker = self.index,
                    sink = %kind,
                    batch = batch.id(),
                    samples = batch.len(),
                    attempts,
                    "batch written"
                );
                self.tracker.complete(batch.id(), Outcome::Stored)
            }
            WriteOutcome::Failed { error, attempts } => {
                tracing::error!(
                    worker = self.index,
                    sink = %kind,
                    batch = batch.id(),
                    samples = batch.len(),
                    attempts,
                    retryable = error.is_retryable(),
                    error = %error,
                    "batch failed, moving to dead-letter log"
                );
                self.dead_letter(&batch, &error.to_string(), attempts).await
            }
            WriteOutcome::Cancelled { attempts } => {
                self.dead_letter(&batch, "shutdown before the write completed", attempts).await
            }
        };
        self.record(&settled);
    }

    async fn dead_letter(&mut self, batch: &Batch, reason: &str, attempts: u32) -> Vec<Settled> {
        let records = batch
            .entries()
            .iter()
            .map(|e| DeadLetterRecord::new(e, batch.sink(), batch.id(), attempts, reason))
            .collect();
        match self.dead_letters.append(records).await {
            Ok(()) => {
                self.metrics.dead_letter(batch.sink(), batch.len());
                tracing::warn!(
                    worker = self.index,
                    sink = %batch.sink(),
                    batch = batch.id(),
                    samples = batch.len(),
                    reason,
                    "batch dead-lettered"
                );
                self.tracker.complete(batch.id(), Outcome::DeadLettered)
            }
            Err(e) => {
                // Leave the messages unacknowledged; the broker redelivers.
                tracing::error!(
                    worker = self.index,
                    sink = %batch.sink(),
                    batch = batch.id(),
                    samples = batch.len(),
                    error = ?e,
                    "dead-letter write failed, batch abandoned"
                );
                self.tracker.complete(batch.id(), Outcome::Abandoned)
            }
        }
    }

    /// Force-close: dead-letter the open batches and whatever is still
    /// queued.
    async fn abort(&mut self) {
        self.rx.close();
        while let Ok(envelope) = self.rx.try_recv() {
            self.stage(envelope);
        }
        self.queues.observe();
        for kind in [SinkKind::Relational, SinkKind::TimeSeries] {
            if let Some(batch) = self.take_batch(kind) {
                let settled = self.dead_letter(&batch, "shutdown grace period elapsed", 0).await;
                self.record(&settled);
            }
        }
        if self.tracker.in_flight() > 0 {
            tracing::warn!(
                worker = self.index,
                in_flight = self.tracker.in_flight(),
                "worker closed with unsettled messages"
            );
        }
    }

    fn record(&self, settled: &[Settled]) {
        for s in settled {
            if s.outcome.is_acknowledged() {
                self.metrics.messages_acked.inc();
            }
            tracing::trace!(
                worker = self.index,
                delivery = s.id,
                outcome = ?s.outcome,
                "message settled"
            );
        }
    }
}
