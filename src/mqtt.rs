// MQTT side of the service. `connect` opens the session and subscribes to
// every metric topic, `run_event_loop` polls the broker and hands each
// publish to `Ingress`, which routes, decodes and enqueues it.
//
// Acknowledgments come back from the pipeline workers through `MqttAcker`.
// They are forwarded over a channel to a separate task because the event
// loop may itself be blocked waiting on a full worker queue.
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use rumqttc::{AsyncClient, ConnectReturnCode, Event, EventLoop, Incoming, MqttOptions, Publish, QoS};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::MqttConfig;
use crate::decode::{Decoder, IngestClock};
use crate::delivery::{Acknowledger, Receipt};
use crate::metrics::IngestMetrics;
use crate::pipeline::{EnqueueError, Envelope, PipelineHandle};
use crate::sink::DeliveryId;
use crate::topic::{self, subscription_filters};

pub fn mqtt_options(config: &MqttConfig) -> MqttOptions {
    let mut options = MqttOptions::new(&config.client_id, &config.host, config.port);
    options.set_keep_alive(config.keep_alive);
    if !config.username.is_empty() {
        options.set_credentials(&config.username, &config.password);
    }
    // With QoS 1 the broker keeps the session so unacknowledged messages
    // are redelivered after a restart.
    let at_least_once = config.qos != QoS::AtMostOnce;
    options.set_clean_session(!at_least_once);
    options.set_manual_acks(at_least_once);
    options
}

/// Connect and subscribe. Gives up after `connect_retries` failed attempts.
pub async fn connect(config: &MqttConfig, metrics: &IngestMetrics) -> Result<(AsyncClient, EventLoop)> {
    let (client, mut eventloop) = AsyncClient::new(mqtt_options(config), 64);
    tracing::info!(broker = %config.broker_url(), client_id = %config.client_id, "connecting to MQTT broker");

    let mut failures = 0;
    loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Incoming::ConnAck(ack))) => {
                if ack.code != ConnectReturnCode::Success {
                    bail!("MQTT broker refused connection: {:?}", ack.code);
                }
                metrics.broker_connected.set(1);
                tracing::info!(session_present = ack.session_present, "connected to MQTT broker");
                break;
            }
            Ok(_) => {}
            Err(e) => {
                failures += 1;
                if failures >= config.connect_retries.max(1) {
                    return Err(e).with_context(|| {
                        format!(
                            "could not connect to MQTT broker {} after {} attempts",
                            config.broker_url(),
                            failures
                        )
                    });
                }
                tracing::warn!(attempt = failures, error = %e, "MQTT connect failed, retrying");
                tokio::time::sleep(config.reconnect_delay).await;
            }
        }
    }

    for filter in subscription_filters() {
        client
            .subscribe(&filter, config.qos)
            .await
            .with_context(|| format!("failed to subscribe to {}", filter))?;
        tracing::info!(topic = %filter, qos = ?config.qos, "subscribed");
    }
    Ok((client, eventloop))
}

fn resubscribe(client: &AsyncClient, qos: QoS) {
    for filter in subscription_filters() {
        if let Err(e) = client.try_subscribe(&filter, qos) {
            tracing::error!(topic = %filter, error = %e, "resubscribe failed");
        }
    }
}

/// Turns broker publishes into pipeline envelopes.
pub struct Ingress {
    decoder: Decoder,
    clock: IngestClock,
    next_id: DeliveryId,
    pipeline: PipelineHandle,
    acker: Arc<dyn Acknowledger>,
    metrics: IngestMetrics,
}

impl Ingress {
    pub fn new(
        decoder: Decoder,
        pipeline: PipelineHandle,
        acker: Arc<dyn Acknowledger>,
        metrics: IngestMetrics,
    ) -> Self {
        Ingress {
            decoder,
            clock: IngestClock::new(),
            next_id: 1,
            pipeline,
            acker,
            metrics,
        }
    }

    /// Waits while the owning worker's queue is full. Only fails once the
    /// pipeline is closed; that message stays unacknowledged.
    pub async fn handle_publish(&mut self, publish: &Publish) -> Result<(), EnqueueError> {
        self.metrics.messages_received.inc();
        let receipt = Receipt {
            id: self.next_id,
            topic: publish.topic.clone(),
            pkid: publish.pkid,
            qos: publish.qos,
        };
        self.next_id += 1;
        let received_at = self.clock.now();

        let key = match topic::route(&publish.topic) {
            Ok(key) => key,
            Err(e) => {
                // no stream to order against, acknowledge right away
                self.metrics.parse_errors.inc();
                tracing::warn!(error = %e, "dropping message");
                self.acker.acknowledge(&receipt);
                self.metrics.messages_acked.inc();
                return Ok(());
            }
        };

        let envelope = match self.decoder.decode(key.clone(), &publish.payload, received_at) {
            Ok(sample) => {
                self.metrics.samples_enqueued.inc();
                Envelope::Sample { receipt, sample }
            }
            Err(e) => {
                self.metrics.decode_error(key.metric);
                tracing::warn!(topic = %publish.topic, error = %e, "discarding undecodable payload");
                Envelope::Discard { receipt, key }
            }
        };
        self.pipeline.enqueue(envelope).await
    }
}

/// Poll the broker until `stop` fires or the pipeline closes.
pub async fn run_event_loop(
    mut eventloop: EventLoop,
    client: AsyncClient,
    mut ingress: Ingress,
    config: MqttConfig,
    stop: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = stop.cancelled() => break,
            ev = eventloop.poll() => match ev {
                Ok(Event::Incoming(Incoming::Publish(p))) => {
                    tracing::trace!(
                        topic = %p.topic,
                        pkid = p.pkid,
                        bytes = p.payload.len(),
                        "publish received"
                    );
                    let res = tokio::select! {
                        res = ingress.handle_publish(&p) => res,
                        _ = stop.cancelled() => break,
                    };
                    if let Err(e) = res {
                        tracing::info!(error = %e, "pipeline closed, leaving receive loop");
                        break;
                    }
                }
                Ok(Event::Incoming(Incoming::ConnAck(ack))) => {
                    ingress.metrics.broker_connected.set(1);
                    tracing::info!(session_present = ack.session_present, "reconnected to MQTT broker");
                    if !ack.session_present {
                        resubscribe(&client, config.qos);
                    }
                }
                Ok(Event::Incoming(Incoming::Disconnect)) => {
                    ingress.metrics.broker_connected.set(0);
                    tracing::warn!("broker sent disconnect");
                }
                Ok(_) => {}
                Err(e) => {
                    // rumqttc reconnects on the next poll
                    ingress.metrics.broker_connected.set(0);
                    let delay_ms = config.reconnect_delay.as_millis() as u64;
                    tracing::warn!(error = %e, delay_ms, "MQTT connection error");
                    tokio::select! {
                        _ = tokio::time::sleep(config.reconnect_delay) => {}
                        _ = stop.cancelled() => break,
                    }
                }
            }
        }
    }
    tracing::info!("MQTT receive loop stopped");
}

/// Forwards acknowledgments to the ack task.
#[derive(Clone)]
pub struct MqttAcker {
    tx: mpsc::UnboundedSender<Receipt>,
}

impl Acknowledger for MqttAcker {
    fn acknowledge(&self, receipt: &Receipt) {
        if self.tx.send(receipt.clone()).is_err() {
            tracing::debug!(delivery = receipt.id, "ack task gone, dropping acknowledgment");
        }
    }
}

/// Spawn the ack task. It ends once every `MqttAcker` clone is dropped.
pub fn spawn_acker(client: AsyncClient) -> (MqttAcker, JoinHandle<()>) {
    let (tx, mut rx) = mpsc::unbounded_channel::<Receipt>();
    let join = tokio::spawn(async move {
        while let Some(receipt) = rx.recv().await {
            if receipt.qos == QoS::AtMostOnce {
                continue;
            }
            let mut publish = Publish::new(receipt.topic, receipt.qos, Vec::<u8>::new());
            publish.pkid = receipt.pkid;
            if let Err(e) = client.ack(&publish).await {
                tracing::warn!(delivery = receipt.id, pkid = receipt.pkid, error = %e, "failed to send ack");
            }
        }
    });
    (MqttAcker { tx }, join)
}
