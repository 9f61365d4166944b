// HTTP handlers for the operational endpoints. Shared state arrives through
// axum `Extension` layers set up in `server.rs`.
use axum::{
    extract::Extension,
    http::{HeaderMap, HeaderValue, StatusCode, header::CONTENT_TYPE},
};
use prometheus::{Encoder, Registry, TextEncoder};
use std::sync::Arc;

use crate::metrics::IngestMetrics;

/// Prometheus text-format metrics gathered from the shared `Registry`.
pub async fn metrics_handler(
    Extension(registry): Extension<Arc<Registry>>,
) -> (StatusCode, HeaderMap, String) {
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    let mut headers = HeaderMap::new();
    if let Err(e) = encoder.encode(&registry.gather(), &mut buffer) {
        tracing::error!(error = %e, "failed to encode metrics");
        return (StatusCode::INTERNAL_SERVER_ERROR, headers, e.to_string());
    }
    if let Ok(value) = HeaderValue::from_str(encoder.format_type()) {
        headers.insert(CONTENT_TYPE, value);
    }
    (StatusCode::OK, headers, String::from_utf8_lossy(&buffer).into_owned())
}

/// `200 ok` while the broker session is up, `503` otherwise.
pub async fn health(Extension(metrics): Extension<IngestMetrics>) -> (StatusCode, &'static str) {
    if metrics.broker_connected.get() == 1 {
        (StatusCode::OK, "ok")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "broker disconnected")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_metrics_body_and_content_type() {
        let registry = Arc::new(Registry::new());
        let metrics = IngestMetrics::register(&registry).unwrap();
        metrics.messages_received.inc_by(3);

        let (status, headers, body) = metrics_handler(Extension(registry)).await;
        assert_eq!(status, StatusCode::OK);
        assert!(headers[CONTENT_TYPE].to_str().unwrap().starts_with("text/plain"));
        assert!(body.contains("mqtt_messages_total 3"));
    }

    #[tokio::test]
    async fn test_health_tracks_broker_connection() {
        let metrics = IngestMetrics::unregistered();
        let (status, _) = health(Extension(metrics.clone())).await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);

        metrics.broker_connected.set(1);
        let (status, body) = health(Extension(metrics)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, "ok");
    }
}
