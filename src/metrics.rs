// Prometheus metrics for the ingest path. All collectors are registered on
// one `Registry`, which the HTTP `/metrics` handler gathers.
use prometheus::{IntCounter, IntCounterVec, IntGauge, Opts, Registry};

use crate::sink::SinkKind;
use crate::topic::Metric;

#[derive(Clone)]
pub struct IngestMetrics {
    pub messages_received: IntCounter,
    pub parse_errors: IntCounter,
    pub decode_errors: IntCounterVec,
    pub samples_enqueued: IntCounter,
    pub queue_depth: IntGauge,
    pub batches_written: IntCounterVec,
    pub sink_retries: IntCounterVec,
    pub dead_lettered: IntCounterVec,
    pub messages_acked: IntCounter,
    pub broker_connected: IntGauge,
}

impl IngestMetrics {
    pub fn register(registry: &Registry) -> prometheus::Result<Self> {
        let metrics = IngestMetrics {
            messages_received: IntCounter::new("mqtt_messages_total", "Total MQTT messages received")?,
            parse_errors: IntCounter::new(
                "ingest_parse_errors_total",
                "Messages dropped for a malformed topic",
            )?,
            decode_errors: IntCounterVec::new(
                Opts::new("ingest_decode_errors_total", "Messages dropped for an undecodable payload"),
                &["metric"],
            )?,
            samples_enqueued: IntCounter::new(
                "ingest_samples_enqueued_total",
                "Samples handed to the worker pool",
            )?,
            queue_depth: IntGauge::new("ingest_queue_depth", "Messages waiting in worker queues")?,
            batches_written: IntCounterVec::new(
                Opts::new("ingest_batches_written_total", "Batches durably written"),
                &["sink"],
            )?,
            sink_retries: IntCounterVec::new(
                Opts::new("ingest_sink_retries_total", "Sink write retries"),
                &["sink"],
            )?,
            dead_lettered: IntCounterVec::new(
                Opts::new("ingest_dead_lettered_total", "Samples moved to the dead-letter log"),
                &["sink"],
            )?,
            messages_acked: IntCounter::new(
                "mqtt_messages_acked_total",
                "Messages acknowledged to the broker",
            )?,
            broker_connected: IntGauge::new("mqtt_broker_connected", "1 while the broker connection is up")?,
        };

        registry.register(Box::new(metrics.messages_received.clone()))?;
        registry.register(Box::new(metrics.parse_errors.clone()))?;
        registry.register(Box::new(metrics.decode_errors.clone()))?;
        registry.register(Box::new(metrics.samples_enqueued.clone()))?;
        registry.register(Box::new(metrics.queue_depth.clone()))?;
        registry.register(Box::new(metrics.batches_written.clone()))?;
        registry.register(Box::new(metrics.sink_retries.clone()))?;
        registry.register(Box::new(metrics.dead_lettered.clone()))?;
        registry.register(Box::new(metrics.messages_acked.clone()))?;
        registry.register(Box::new(metrics.broker_connected.clone()))?;

        Ok(metrics)
    }

    /// Collectors bound to a throwaway registry.
    #[cfg(test)]
    pub(crate) fn unregistered() -> Self {
        Self::register(&Registry::new()).expect("fresh registry accepts every collector")
    }

    pub fn decode_error(&self, metric: Metric) {
        self.decode_errors.with_label_values(&[metric.as_str()]).inc();
    }

    pub fn batch_written(&self, sink: SinkKind) {
        self.batches_written.with_label_values(&[sink.as_str()]).inc();
    }

    pub fn sink_retry(&self, sink: SinkKind) {
        self.sink_retries.with_label_values(&[sink.as_str()]).inc();
    }

    pub fn dead_letter(&self, sink: SinkKind, samples: usize) {
        self.dead_lettered.with_label_values(&[sink.as_str()]).inc_by(samples as u64);
    }
}
