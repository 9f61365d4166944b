// Payload decoding. Each metric has its own payload grammar; `Decoder`
// dispatches on the metric tag and produces an immutable `Sample`.
//
// Accepted payloads:
//   scalar (speed, drowsiness, temp): `72.5` or `{"value": 72.5, "ts": ...}`
//   gps:                              `52.1,4.3` or `{"lat": .., "lon": .., "ts": ..}`
//   accel:                            `0.1,-0.2,9.8` or `{"x": .., "y": .., "z": .., "ts": ..}`
use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::sink::SinkKind;
use crate::topic::{Metric, TopicKey};

/// Inclusive sanity bound for one decoded number.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Range {
    pub min: f64,
    pub max: f64,
}

impl Range {
    pub const fn new(min: f64, max: f64) -> Self {
        Range { min, max }
    }

    fn check(&self, metric: Metric, field: &'static str, value: f64) -> Result<f64, DecodeError> {
        if value < self.min || value > self.max {
            return Err(DecodeError::OutOfRange {
                metric,
                field,
                value,
                min: self.min,
                max: self.max,
            });
        }
        Ok(value)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Bounds {
    pub speed: Range,
    pub drowsiness: Range,
    pub temp: Range,
    /// Applied to each accelerometer axis.
    pub accel: Range,
    pub latitude: Range,
    pub longitude: Range,
}

impl Default for Bounds {
    fn default() -> Self {
        Bounds {
            speed: Range::new(0.0, 180.0),
            drowsiness: Range::new(0.0, 100.0),
            temp: Range::new(-40.0, 85.0),
            accel: Range::new(-16.0, 16.0),
            latitude: Range::new(-90.0, 90.0),
            longitude: Range::new(-180.0, 180.0),
        }
    }
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum DecodeError {
    #[error("invalid {metric} payload: {reason}")]
    InvalidPayload { metric: Metric, reason: String },
    #[error("{metric} {field} {value} outside [{min}, {max}]")]
    OutOfRange {
        metric: Metric,
        field: &'static str,
        value: f64,
        min: f64,
        max: f64,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum SampleValue {
    Scalar { value: f64 },
    Gps { lat: f64, lon: f64 },
    Accel { x: f64, y: f64, z: f64 },
}

/// One decoded reading. Fields are private so a sample cannot change after
/// decoding.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sample {
    device_id: String,
    metric: Metric,
    received_at: DateTime<Utc>,
    reported_at: Option<DateTime<Utc>>,
    value: SampleValue,
}

impl Sample {
    pub fn new(
        device_id: impl Into<String>,
        metric: Metric,
        received_at: DateTime<Utc>,
        reported_at: Option<DateTime<Utc>>,
        value: SampleValue,
    ) -> Self {
        Sample {
            device_id: device_id.into(),
            metric,
            received_at,
            reported_at,
            value,
        }
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    pub fn metric(&self) -> Metric {
        self.metric
    }

    pub fn reported_at(&self) -> Option<DateTime<Utc>> {
        self.reported_at
    }

    pub fn value(&self) -> &SampleValue {
        &self.value
    }

    /// Device time when the device sent one, ingestion time otherwise.
    pub fn timestamp(&self) -> DateTime<Utc> {
        self.reported_at.unwrap_or(self.received_at)
    }

    pub fn timestamp_nanos(&self) -> i64 {
        let ts = self.timestamp();
        ts.timestamp_nanos_opt()
            .unwrap_or_else(|| ts.timestamp_micros().saturating_mul(1_000))
    }

    /// Sinks this sample is written to. GPS fixes also update the device
    /// record in the relational store.
    pub fn sinks(&self) -> &'static [SinkKind] {
        match self.metric {
            Metric::Gps => &[SinkKind::Relational, SinkKind::TimeSeries],
            _ => &[SinkKind::TimeSeries],
        }
    }

    pub fn topic(&self) -> String {
        TopicKey {
            device_id: self.device_id.clone(),
            metric: self.metric,
        }
        .topic()
    }

    /// Re-encode as a JSON payload the decoder accepts. The timestamp is
    /// pinned so a replayed sample keeps its time-series identity.
    pub fn to_payload(&self) -> String {
        let mut obj = match &self.value {
            SampleValue::Scalar { value } => serde_json::json!({ "value": value }),
            SampleValue::Gps { lat, lon } => serde_json::json!({ "lat": lat, "lon": lon }),
            SampleValue::Accel { x, y, z } => serde_json::json!({ "x": x, "y": y, "z": z }),
        };
        obj["ts"] = Value::String(self.timestamp().to_rfc3339());
        obj.to_string()
    }
}

/// Hands out strictly increasing ingestion timestamps, so two samples of the
/// same stream received within one clock tick still get distinct times.
#[derive(Debug, Default)]
pub struct IngestClock {
    last_micros: i64,
}

impl IngestClock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn now(&mut self) -> DateTime<Utc> {
        let wall = Utc::now().timestamp_micros();
        let next = wall.max(self.last_micros + 1);
        self.last_micros = next;
        DateTime::from_timestamp_micros(next).unwrap_or_else(Utc::now)
    }
}

#[derive(Debug, Clone, Default)]
pub struct Decoder {
    bounds: Bounds,
}

impl Decoder {
    pub fn new(bounds: Bounds) -> Self {
        Decoder { bounds }
    }

    pub fn decode(
        &self,
        key: TopicKey,
        payload: &[u8],
        received_at: DateTime<Utc>,
    ) -> Result<Sample, DecodeError> {
        let metric = key.metric;
        let body = Body::parse(metric, payload)?;
        let reported_at = body.reported_at(metric)?;

        let value = match metric {
            Metric::Speed => self.scalar(metric, &body, &self.bounds.speed)?,
            Metric::Drowsiness => self.scalar(metric, &body, &self.bounds.drowsiness)?,
            Metric::Temp => self.scalar(metric, &body, &self.bounds.temp)?,
            Metric::Gps => {
                let [lat, lon] = body.fields(metric, ["lat", "lon"])?;
                SampleValue::Gps {
                    lat: self.bounds.latitude.check(metric, "lat", lat)?,
                    lon: self.bounds.longitude.check(metric, "lon", lon)?,
                }
            }
            Metric::Accel => {
                let [x, y, z] = body.fields(metric, ["x", "y", "z"])?;
                let axis = &self.bounds.accel;
                SampleValue::Accel {
                    x: axis.check(metric, "x", x)?,
                    y: axis.check(metric, "y", y)?,
                    z: axis.check(metric, "z", z)?,
                }
            }
        };

        Ok(Sample::new(key.device_id, metric, received_at, reported_at, value))
    }

    fn scalar(&self, metric: Metric, body: &Body<'_>, range: &Range) -> Result<SampleValue, DecodeError> {
        let [value] = body.fields(metric, ["value"])?;
        Ok(SampleValue::Scalar {
            value: range.check(metric, "value", value)?,
        })
    }
}

enum Body<'a> {
    Text(&'a str),
    Json(Map<String, Value>),
}

impl<'a> Body<'a> {
    fn parse(metric: Metric, payload: &'a [u8]) -> Result<Body<'a>, DecodeError> {
        let text = std::str::from_utf8(payload)
            .map_err(|e| invalid(metric, format!("not utf-8: {}", e)))?
            .trim();
        if text.is_empty() {
            return Err(invalid(metric, "empty payload"));
        }
        if text.starts_with('{') {
            match serde_json::from_str::<Value>(text) {
                Ok(Value::Object(obj)) => Ok(Body::Json(obj)),
                Ok(_) => Err(invalid(metric, "expected a JSON object")),
                Err(e) => Err(invalid(metric, e.to_string())),
            }
        } else {
            Ok(Body::Text(text))
        }
    }

    /// Numbers by position for text payloads, by name for JSON payloads.
    fn fields<const N: usize>(
        &self,
        metric: Metric,
        names: [&'static str; N],
    ) -> Result<[f64; N], DecodeError> {
        let mut out = [0.0; N];
        match self {
            Body::Text(text) => {
                let parts: Vec<&str> = text.split(',').map(str::trim).collect();
                if parts.len() != N {
                    let detail = format!("expected {} comma-separated numbers, got {}", N, parts.len());
                    return Err(invalid(metric, detail));
                }
                for (slot, part) in out.iter_mut().zip(parts) {
                    let v: f64 = part
                        .parse()
                        .map_err(|_| invalid(metric, format!("'{}' is not a number", part)))?;
                    *slot = finite(metric, v)?;
                }
            }
            Body::Json(obj) => {
                for (slot, name) in out.iter_mut().zip(names) {
                    let v = obj
                        .get(name)
                        .and_then(Value::as_f64)
                        .ok_or_else(|| invalid(metric, format!("missing numeric field '{}'", name)))?;
                    *slot = finite(metric, v)?;
                }
            }
        }
        Ok(out)
    }

    fn reported_at(&self, metric: Metric) -> Result<Option<DateTime<Utc>>, DecodeError> {
        let Body::Json(obj) = self else {
            return Ok(None);
        };
        match obj.get("ts").or_else(|| obj.get("time")) {
            None | Some(Value::Null) => Ok(None),
            Some(v) => parse_time(v)
                .map(Some)
                .ok_or_else(|| invalid(metric, format!("unparseable timestamp {}", v))),
        }
    }
}

fn invalid(metric: Metric, reason: impl Into<String>) -> DecodeError {
    DecodeError::InvalidPayload {
        metric,
        reason: reason.into(),
    }
}

fn finite(metric: Metric, v: f64) -> Result<f64, DecodeError> {
    if v.is_finite() {
        Ok(v)
    } else {
        Err(invalid(metric, "non-finite number"))
    }
}

/// Epoch milliseconds, RFC 3339, or `YYYY-MM-DD HH:MM:SS` taken as UTC.
fn parse_time(v: &Value) -> Option<DateTime<Utc>> {
    match v {
        Value::Number(n) => n.as_i64().and_then(|ms| Utc.timestamp_millis_opt(ms).single()),
        Value::String(s) => {
            if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
                return Some(dt.with_timezone(&Utc));
            }
            NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S")
                .ok()
                .map(|ndt| ndt.and_utc())
        }
        _ => None,
    }
}

//   TESTS
//

#[cfg(test)]
mod tests {
    use super::*;
    use crate::topic::route;

    fn decode_on(topic: &str, payload: &str) -> Result<Sample, DecodeError> {
        let key = route(topic).expect("valid topic");
        Decoder::default().decode(key, payload.as_bytes(), Utc::now())
    }

    #[test]
    fn test_speed_scalar() {
        let sample = decode_on("logistics/truck42/speed", "72.5").expect("decode");
        assert_eq!(sample.device_id(), "truck42");
        assert_eq!(sample.metric(), Metric::Speed);
        assert_eq!(sample.value(), &SampleValue::Scalar { value: 72.5 });
        assert!(sample.reported_at().is_none());
        assert_eq!(sample.sinks(), &[SinkKind::TimeSeries]);
    }

    #[test]
    fn test_speed_out_of_range() {
        match decode_on("logistics/truck42/speed", "200") {
            Err(DecodeError::OutOfRange { metric, value, max, .. }) => {
                assert_eq!(metric, Metric::Speed);
                assert_eq!(value, 200.0);
                assert_eq!(max, 180.0);
            }
            other => panic!("expected OutOfRange, got {:?}", other),
        }
        assert!(matches!(
            decode_on("logistics/truck42/speed", "-1"),
            Err(DecodeError::OutOfRange { .. })
        ));
    }

    #[test]
    fn test_round_trip_all_metrics() {
        // (metric, synthetic payload, expected value)
        let cases = [
            (Metric::Speed, "88.25".to_string(), SampleValue::Scalar { value: 88.25 }),
            (Metric::Drowsiness, "12".to_string(), SampleValue::Scalar { value: 12.0 }),
            (Metric::Temp, "-3.5".to_string(), SampleValue::Scalar { value: -3.5 }),
            (Metric::Gps, "52.37, 4.89".to_string(), SampleValue::Gps { lat: 52.37, lon: 4.89 }),
            (
                Metric::Accel,
                r#"{"x": 0.1, "y": -0.2, "z": 9.8}"#.to_string(),
                SampleValue::Accel { x: 0.1, y: -0.2, z: 9.8 },
            ),
        ];

        for (i, (metric, payload, expected)) in cases.into_iter().enumerate() {
            let device = format!("device-{}", i);
            let topic = format!("logistics/{}/{}", device, metric);
            let sample = decode_on(&topic, &payload).expect("decode");
            assert_eq!(sample.device_id(), device);
            assert_eq!(sample.metric(), metric);
            assert_eq!(sample.value(), &expected);

            // The re-encoded payload decodes back to the same reading.
            let again = decode_on(&topic, &sample.to_payload()).expect("decode replayed payload");
            assert_eq!(again.value(), sample.value());
            assert_eq!(again.timestamp(), sample.timestamp());
        }
    }

    #[test]
    fn test_json_with_device_time() {
        let sample = decode_on(
            "logistics/van7/temp",
            r#"{"value": 4.5, "ts": "2025-11-29 22:00:39"}"#,
        )
        .expect("decode");
        let expected = Utc.with_ymd_and_hms(2025, 11, 29, 22, 0, 39).unwrap();
        assert_eq!(sample.reported_at(), Some(expected));
        assert_eq!(sample.timestamp(), expected);

        let sample = decode_on("logistics/van7/temp", r#"{"value": 4.5, "ts": 1764453639000}"#)
            .expect("decode epoch millis");
        assert_eq!(sample.timestamp().timestamp_millis(), 1_764_453_639_000);
    }

    #[test]
    fn test_invalid_payloads() {
        let bad = [
            ("logistics/t/speed", "fast"),
            ("logistics/t/speed", ""),
            ("logistics/t/speed", "NaN"),
            ("logistics/t/speed", "{\"speed\": 10}"),
            ("logistics/t/speed", "[1, 2]"),
            ("logistics/t/gps", "52.3"),
            ("logistics/t/gps", "52.3,4.8,1.0"),
            ("logistics/t/accel", "{\"x\": 1, \"y\": 2}"),
            ("logistics/t/temp", "{\"value\": 1, \"ts\": \"yesterday\"}"),
        ];
        for (topic, payload) in bad {
            assert!(
                matches!(decode_on(topic, payload), Err(DecodeError::InvalidPayload { .. })),
                "{} / {:?} should be invalid",
                topic,
                payload
            );
        }
        let key = route("logistics/t/temp").unwrap();
        assert!(matches!(
            Decoder::default().decode(key, &[0xff, 0xfe], Utc::now()),
            Err(DecodeError::InvalidPayload { .. })
        ));
    }

    #[test]
    fn test_gps_fans_out_and_checks_bounds() {
        let sample =
            decode_on("logistics/truck1/gps", r#"{"lat": 48.85, "lon": 2.35}"#).expect("decode");
        assert_eq!(sample.sinks(), &[SinkKind::Relational, SinkKind::TimeSeries]);

        assert!(matches!(
            decode_on("logistics/truck1/gps", "91.0,2.0"),
            Err(DecodeError::OutOfRange { field: "lat", .. })
        ));
        assert!(matches!(
            decode_on("logistics/truck1/accel", "0,0,20"),
            Err(DecodeError::OutOfRange { field: "z", .. })
        ));
    }

    #[test]
    fn test_ingest_clock_strictly_increases() {
        let mut clock = IngestClock::new();
        let mut prev = clock.now();
        for _ in 0..1000 {
            let next = clock.now();
            assert!(next > prev);
            prev = next;
        }
    }
}
