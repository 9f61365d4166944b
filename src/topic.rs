// Topic routing. Every telemetry message arrives on
// `logistics/<device_id>/<metric>`; this module turns the topic string into
// a `TopicKey` and owns the list of subscription filters.
use serde::{Deserialize, Serialize};
use std::fmt;

/// Literal first segment of every telemetry topic.
pub const TOPIC_PREFIX: &str = "logistics";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Metric {
    Speed,
    Drowsiness,
    Accel,
    Gps,
    Temp,
}

impl Metric {
    pub const ALL: [Metric; 5] = [
        Metric::Speed,
        Metric::Drowsiness,
        Metric::Accel,
        Metric::Gps,
        Metric::Temp,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Metric::Speed => "speed",
            Metric::Drowsiness => "drowsiness",
            Metric::Accel => "accel",
            Metric::Gps => "gps",
            Metric::Temp => "temp",
        }
    }

    pub fn from_segment(segment: &str) -> Option<Metric> {
        match segment {
            "speed" => Some(Metric::Speed),
            "drowsiness" => Some(Metric::Drowsiness),
            "accel" => Some(Metric::Accel),
            "gps" => Some(Metric::Gps),
            "temp" => Some(Metric::Temp),
            _ => None,
        }
    }

    /// Wildcard filter used when subscribing, e.g. `logistics/+/speed`.
    pub fn subscription_filter(&self) -> String {
        format!("{}/+/{}", TOPIC_PREFIX, self.as_str())
    }
}

impl fmt::Display for Metric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// All filters the service subscribes to, one per known metric.
pub fn subscription_filters() -> Vec<String> {
    Metric::ALL.iter().map(|m| m.subscription_filter()).collect()
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TopicKey {
    pub device_id: String,
    pub metric: Metric,
}

impl TopicKey {
    /// Rebuild the topic this key was routed from.
    pub fn topic(&self) -> String {
        format!("{}/{}/{}", TOPIC_PREFIX, self.device_id, self.metric)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ParseError {
    #[error("malformed topic '{topic}': {reason}")]
    MalformedTopic { topic: String, reason: &'static str },
}

/// Parse `logistics/<device_id>/<metric>` into a [`TopicKey`].
pub fn route(topic: &str) -> Result<TopicKey, ParseError> {
    let malformed = |reason| ParseError::MalformedTopic {
        topic: topic.to_string(),
        reason,
    };

    let segments: Vec<&str> = topic.split('/').collect();
    if segments.len() != 3 {
        return Err(malformed("expected 3 segments"));
    }
    if segments[0] != TOPIC_PREFIX {
        return Err(malformed("unexpected prefix"));
    }
    if segments[1].is_empty() {
        return Err(malformed("empty device id"));
    }
    let metric = Metric::from_segment(segments[2]).ok_or_else(|| malformed("unknown metric"))?;

    Ok(TopicKey {
        device_id: segments[1].to_string(),
        metric,
    })
}
