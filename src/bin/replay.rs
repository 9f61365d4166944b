// Republish dead-lettered samples so they go through the pipeline again.
//
//   replay [PATH] [--dry-run]
//
// PATH defaults to DEAD_LETTER_PATH (or `dead_letters.jsonl`). Broker
// settings come from the same MQTT_* variables as the service.
use std::collections::HashSet;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use rumqttc::{AsyncClient, Event, Incoming, QoS};

use logistics_ingest::config::MqttConfig;
use logistics_ingest::dead_letter::read_records;
use logistics_ingest::{mqtt, server};

#[tokio::main]
async fn main() -> Result<()> {
    server::init_tracing();

    let mut path = None;
    let mut dry_run = false;
    for arg in std::env::args().skip(1) {
        match arg.as_str() {
            "--dry-run" => dry_run = true,
            flag if flag.starts_with("--") => bail!("unknown flag {}", flag),
            _ => path = Some(arg),
        }
    }
    let path = path
        .or_else(|| std::env::var("DEAD_LETTER_PATH").ok())
        .unwrap_or_else(|| "dead_letters.jsonl".to_string());

    let records = read_records(&path)?;
    // a sample that failed on both sinks is recorded twice but needs one publish
    let mut seen = HashSet::new();
    let messages: Vec<(String, String)> = records
        .into_iter()
        .map(|r| (r.topic, r.payload))
        .filter(|m| seen.insert(m.clone()))
        .collect();
    tracing::info!(path = %path, messages = messages.len(), "loaded dead-letter log");

    if dry_run {
        for (topic, payload) in &messages {
            println!("{} {}", topic, payload);
        }
        return Ok(());
    }
    if messages.is_empty() {
        return Ok(());
    }

    let mut config = MqttConfig::from_env()?;
    config.client_id = format!("{}-replay", config.client_id);
    config.qos = QoS::AtMostOnce; // clean session for the replay client
    let mut options = mqtt::mqtt_options(&config);
    options.set_keep_alive(Duration::from_secs(30));
    let (client, mut eventloop) = AsyncClient::new(options, 64);

    let total = messages.len();
    let publisher = client.clone();
    tokio::spawn(async move {
        for (topic, payload) in messages {
            if let Err(e) = publisher.publish(&topic, QoS::AtLeastOnce, false, payload).await {
                tracing::error!(topic = %topic, error = %e, "publish failed");
                break;
            }
        }
    });

    let mut acked = 0;
    let wait = async {
        while acked < total {
            match eventloop.poll().await {
                Ok(Event::Incoming(Incoming::PubAck(_))) => acked += 1,
                Ok(_) => {}
                Err(e) => return Err(e).context("broker connection failed during replay"),
            }
        }
        Ok(())
    };
    tokio::time::timeout(Duration::from_secs(60), wait)
        .await
        .context("timed out waiting for broker acknowledgments")??;

    tracing::info!(published = acked, "replay complete");
    if let Err(e) = client.disconnect().await {
        tracing::debug!(error = %e, "disconnect");
    }
    Ok(())
}
