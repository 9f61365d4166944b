//! Time-series sink backed by the InfluxDB v2 HTTP write API.
//!
//! Every sample becomes one Line Protocol point:
//! ```text
//! <metric>,device_id=<device> <fields> <timestamp_ns>
//! ```
//! InfluxDB identifies a point by measurement, tag set and timestamp, and a
//! second write of the same point replaces the first. That identity is the
//! idempotency key for redelivered messages.
//!
//! See: <https://docs.influxdata.com/influxdb/v2/reference/syntax/line-protocol/>

use std::collections::HashMap;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use reqwest::header::{AUTHORIZATION, CONTENT_TYPE};
use reqwest::{StatusCode, Url};

use super::{Batch, Sink, SinkError};
use crate::config::InfluxConfig;
use crate::decode::{Sample, SampleValue};
use crate::topic::Metric;

/// Accumulates Line Protocol points.
struct LineProtocolWriter {
    buffer: Vec<String>,
}

impl LineProtocolWriter {
    fn new() -> Self {
        Self { buffer: Vec::new() }
    }

    /// Append one point. Tags are written sorted by key (canonical form).
    ///
    /// # Panics
    /// Panics if `fields` is empty (InfluxDB requires at least one field).
    fn write_point(
        &mut self,
        measurement: &str,
        tags: &[(&str, &str)],
        fields: &[(&str, f64)],
        timestamp_ns: i64,
    ) {
        assert!(!fields.is_empty(), "InfluxDB requires at least one field");

        let mut line = escape_measurement(measurement);

        let mut sorted_tags: Vec<_> = tags.iter().collect();
        sorted_tags.sort_by_key(|(k, _)| *k);
        for (key, value) in &sorted_tags {
            line.push(',');
            line.push_str(&escape_key(key));
            line.push('=');
            line.push_str(&escape_key(value));
        }

        line.push(' ');
        for (i, (key, value)) in fields.iter().enumerate() {
            if i > 0 {
                line.push(',');
            }
            line.push_str(&escape_key(key));
            line.push('=');
            line.push_str(&value.to_string());
        }

        line.push(' ');
        line.push_str(&timestamp_ns.to_string());

        self.buffer.push(line);
    }

    fn flush(&mut self) -> Vec<String> {
        std::mem::take(&mut self.buffer)
    }
}

/// Spaces and commas are escaped in measurement names.
fn escape_measurement(s: &str) -> String {
    s.replace(',', "\\,").replace(' ', "\\ ")
}

/// Tag keys, tag values and field keys additionally escape `=`.
fn escape_key(s: &str) -> String {
    s.replace(',', "\\,").replace('=', "\\=").replace(' ', "\\ ")
}

fn fields_of(sample: &Sample) -> Vec<(&'static str, f64)> {
    match *sample.value() {
        SampleValue::Scalar { value } => vec![("value", value)],
        SampleValue::Gps { lat, lon } => vec![("lat", lat), ("lon", lon)],
        SampleValue::Accel { x, y, z } => vec![("x", x), ("y", y), ("z", z)],
    }
}

/// Encode a batch as a Line Protocol body, one point per distinct
/// (device, metric, timestamp). A duplicate inside the batch keeps the last
/// occurrence, the same thing InfluxDB would store.
pub fn encode_batch(batch: &Batch) -> String {
    let mut index: HashMap<(&str, Metric, i64), usize> = HashMap::new();
    let mut points: Vec<&Sample> = Vec::new();
    for sample in batch.samples() {
        let identity = (sample.device_id(), sample.metric(), sample.timestamp_nanos());
        match index.get(&identity) {
            Some(&i) => points[i] = sample,
            None => {
                index.insert(identity, points.len());
                points.push(sample);
            }
        }
    }

    let mut writer = LineProtocolWriter::new();
    for sample in points {
        writer.write_point(
            sample.metric().as_str(),
            &[("device_id", sample.device_id())],
            &fields_of(sample),
            sample.timestamp_nanos(),
        );
    }
    writer.flush().join("\n")
}

pub struct TimeSeriesSink {
    client: reqwest::Client,
    base_url: Url,
    write_url: Url,
    token: String,
}

impl TimeSeriesSink {
    /// Build a sink with one long-lived, pooled HTTP client.
    pub fn new(config: &InfluxConfig) -> anyhow::Result<Self> {
        let base_url =
            Url::parse(&config.url).with_context(|| format!("invalid InfluxDB URL '{}'", config.url))?;
        let write_url = Url::parse_with_params(
            &format!("{}/api/v2/write", config.url.trim_end_matches('/')),
            &[
                ("org", config.org.as_str()),
                ("bucket", config.bucket.as_str()),
                ("precision", "ns"),
            ],
        )
        .context("invalid InfluxDB write URL")?;
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .context("failed to build HTTP client")?;

        Ok(TimeSeriesSink {
            client,
            base_url,
            write_url,
            token: config.token.clone(),
        })
    }

    /// Startup reachability check against `/health`.
    pub async fn ping(&self) -> anyhow::Result<()> {
        let url = self.base_url.join("health").context("invalid InfluxDB health URL")?;
        let resp = self
            .client
            .get(url)
            .send()
            .await
            .context("InfluxDB unreachable")?;
        if !resp.status().is_success() {
            anyhow::bail!("InfluxDB health check returned {}", resp.status());
        }
        tracing::info!(url = %self.base_url, "connected to InfluxDB");
        Ok(())
    }
}

fn classify_status(status: StatusCode, body: &str) -> SinkError {
    let detail = format!("InfluxDB returned {}: {}", status, body.trim());
    let transient = status == StatusCode::TOO_MANY_REQUESTS || status == StatusCode::REQUEST_TIMEOUT;
    if status.is_server_error() || transient {
        SinkError::Unavailable(detail)
    } else {
        SinkError::Rejected(detail)
    }
}

#[async_trait]
impl Sink for TimeSeriesSink {
    async fn write_batch(&self, batch: &Batch) -> Result<(), SinkError> {
        if batch.is_empty() {
            return Ok(());
        }
        let body = encode_batch(batch);

        let resp = self
            .client
            .post(self.write_url.clone())
            .header(AUTHORIZATION, format!("Token {}", self.token))
            .header(CONTENT_TYPE, "text/plain; charset=utf-8")
            .body(body)
            .send()
            .await
            .map_err(|e| SinkError::Unavailable(e.to_string()))?;

        let status = resp.status();
        if status.is_success() {
            tracing::debug!(batch = batch.id(), points = batch.len(), "wrote points to InfluxDB");
            return Ok(());
        }
        let text = resp.text().await.unwrap_or_default();
        Err(classify_status(status, &text))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sink::{BatchEntry, SinkKind};
    use axum::{Router, http::HeaderMap, routing::post};
    use chrono::{TimeZone, Utc};
    use std::sync::{Arc, Mutex};

    type Store = Arc<Mutex<HashMap<(String, String), String>>>;

    fn speed(device: &str, secs: i64, value: f64) -> Sample {
        let ts = Utc.timestamp_opt(secs, 0).unwrap();
        Sample::new(device, Metric::Speed, ts, None, SampleValue::Scalar { value })
    }

    fn batch_of(id: u64, samples: Vec<Sample>) -> Batch {
        let entries = samples
            .into_iter()
            .enumerate()
            .map(|(i, sample)| BatchEntry { delivery: i as u64, sample })
            .collect();
        Batch::new(id, SinkKind::TimeSeries, entries)
    }

    /// In-process stand-in for `/api/v2/write`. Points are keyed by series
    /// and timestamp, so a rewrite replaces the stored point like InfluxDB.
    async fn influx_stub(respond: StatusCode) -> (InfluxConfig, Store) {
        let store: Store = Arc::new(Mutex::new(HashMap::new()));
        let state = store.clone();
        let app = Router::new().route(
            "/api/v2/write",
            post(move |headers: HeaderMap, body: String| {
                let state = state.clone();
                async move {
                    let authorized = headers
                        .get("authorization")
                        .and_then(|v| v.to_str().ok())
                        .map(|v| v == "Token test-token")
                        .unwrap_or(false);
                    if !authorized {
                        return StatusCode::UNAUTHORIZED;
                    }
                    if !respond.is_success() {
                        return respond;
                    }
                    let mut points = state.lock().unwrap();
                    for line in body.lines() {
                        let (rest, ts) = line.rsplit_once(' ').unwrap();
                        let (series, _fields) = rest.split_once(' ').unwrap();
                        points.insert((series.to_string(), ts.to_string()), line.to_string());
                    }
                    StatusCode::NO_CONTENT
                }
            }),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        let config = InfluxConfig {
            url: format!("http://{}", addr),
            org: "fleet".to_string(),
            bucket: "telemetry".to_string(),
            token: "test-token".to_string(),
        };
        (config, store)
    }

    #[test]
    fn test_speed_point_encoding() {
        let batch = batch_of(1, vec![speed("truck42", 1, 72.5)]);
        assert_eq!(encode_batch(&batch), "speed,device_id=truck42 value=72.5 1000000000");
    }

    #[test]
    fn test_structured_point_encoding() {
        let ts = Utc.timestamp_opt(2, 0).unwrap();
        let gps = Sample::new("van 1", Metric::Gps, ts, None, SampleValue::Gps { lat: 52.5, lon: 4.25 });
        let value = SampleValue::Accel { x: 0.5, y: -1.0, z: 9.75 };
        let accel = Sample::new("van=2", Metric::Accel, ts, None, value);
        let body = encode_batch(&batch_of(1, vec![gps, accel]));
        let lines: Vec<&str> = body.lines().collect();
        assert_eq!(lines[0], "gps,device_id=van\\ 1 lat=52.5,lon=4.25 2000000000");
        assert_eq!(lines[1], "accel,device_id=van\\=2 x=0.5,y=-1,z=9.75 2000000000");
    }

    #[test]
    fn test_duplicates_in_batch_collapse() {
        let batch = batch_of(1, vec![speed("t1", 5, 10.0), speed("t2", 5, 20.0), speed("t1", 5, 11.0)]);
        let body = encode_batch(&batch);
        let lines: Vec<&str> = body.lines().collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0], "speed,device_id=t1 value=11 5000000000");
    }

    #[tokio::test]
    async fn test_same_sample_twice_stores_one_record() {
        let (config, store) = influx_stub(StatusCode::NO_CONTENT).await;
        let sink = TimeSeriesSink::new(&config).expect("sink");

        let sample = speed("truck42", 10, 72.5);
        sink.write_batch(&batch_of(1, vec![sample.clone()])).await.expect("first write");
        sink.write_batch(&batch_of(2, vec![sample])).await.expect("redelivered write");

        let points = store.lock().unwrap();
        assert_eq!(points.len(), 1);
        let line = points.values().next().unwrap();
        assert!(line.starts_with("speed,device_id=truck42 value=72.5 "));
    }

    #[tokio::test]
    async fn test_status_classification() {
        let (config, _) = influx_stub(StatusCode::SERVICE_UNAVAILABLE).await;
        let sink = TimeSeriesSink::new(&config).expect("sink");
        let err = sink.write_batch(&batch_of(1, vec![speed("t", 1, 1.0)])).await.unwrap_err();
        assert!(err.is_retryable(), "{:?}", err);

        let (config, _) = influx_stub(StatusCode::BAD_REQUEST).await;
        let sink = TimeSeriesSink::new(&config).expect("sink");
        let err = sink.write_batch(&batch_of(1, vec![speed("t", 1, 1.0)])).await.unwrap_err();
        assert!(!err.is_retryable(), "{:?}", err);

        let (mut config, _) = influx_stub(StatusCode::NO_CONTENT).await;
        config.token = "wrong".to_string();
        let sink = TimeSeriesSink::new(&config).expect("sink");
        let err = sink.write_batch(&batch_of(1, vec![speed("t", 1, 1.0)])).await.unwrap_err();
        assert!(matches!(err, SinkError::Rejected(_)));
    }

    #[tokio::test]
    async fn test_unreachable_store_is_retryable() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        let config = InfluxConfig {
            url: format!("http://{}", addr),
            org: "fleet".to_string(),
            bucket: "telemetry".to_string(),
            token: "test-token".to_string(),
        };
        let sink = TimeSeriesSink::new(&config).expect("sink");
        let err = sink.write_batch(&batch_of(1, vec![speed("t", 1, 1.0)])).await.unwrap_err();
        assert!(err.is_retryable());
    }
}
