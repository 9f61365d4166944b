// `server.rs` wires the service together: configuration, metrics, the two
// sinks, the dead-letter log, the worker pool and the MQTT session, plus
// the small axum app serving `/metrics` and `/health`. Any failure before
// the receive loop starts is fatal.
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use axum::{Extension, Router, routing::get};
use prometheus::Registry;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use crate::config::Config;
use crate::dead_letter::DeadLetterLog;
use crate::decode::Decoder;
use crate::metrics::IngestMetrics;
use crate::pipeline::{Pipeline, PipelineContext};
use crate::sink::{RelationalSink, Sinks, TimeSeriesSink};
use crate::{handlers, mqtt};

pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    // a second init (tests, embedding) keeps the first subscriber
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}

pub fn app(registry: Arc<Registry>, metrics: IngestMetrics) -> Router {
    Router::new()
        .route("/metrics", get(handlers::metrics_handler))
        .route("/health", get(handlers::health))
        .layer(Extension(registry))
        .layer(Extension(metrics))
}

pub async fn run() -> anyhow::Result<()> {
    init_tracing();
    let config = Config::from_env()?;

    let registry = Arc::new(Registry::new());
    let metrics = IngestMetrics::register(&registry).context("failed to register metrics")?;

    let relational = RelationalSink::connect(&config.postgres).await?;
    relational.ensure_schema().await?;
    let time_series = TimeSeriesSink::new(&config.influx)?;
    time_series.ping().await?;
    let relational = Arc::new(relational);

    let (dead_letters, dead_letter_writer) = DeadLetterLog::open(&config.dead_letter_path)?;

    let (client, eventloop) = mqtt::connect(&config.mqtt, &metrics).await?;
    let (acker, ack_task) = mqtt::spawn_acker(client.clone());
    let acker = Arc::new(acker);

    let (pipeline, handle) = Pipeline::start(PipelineContext {
        config: config.pipeline.clone(),
        sinks: Sinks {
            relational: relational.clone(),
            time_series: Arc::new(time_series),
        },
        dead_letters: dead_letters.clone(),
        acker: acker.clone(),
        metrics: metrics.clone(),
    });

    let stop = CancellationToken::new();
    let ingress = mqtt::Ingress::new(Decoder::new(config.bounds.clone()), handle, acker, metrics.clone());
    let receiver = tokio::spawn(mqtt::run_event_loop(
        eventloop,
        client.clone(),
        ingress,
        config.mqtt.clone(),
        stop.clone(),
    ));

    let listener = tokio::net::TcpListener::bind(config.metrics_addr)
        .await
        .with_context(|| format!("failed to bind {}", config.metrics_addr))?;
    tracing::info!(addr = %config.metrics_addr, "serving /metrics and /health");
    let http_stop = stop.clone();
    let http = tokio::spawn(async move {
        let serve = axum::serve(listener, app(registry, metrics))
            .with_graceful_shutdown(async move { http_stop.cancelled().await });
        if let Err(e) = serve.await {
            tracing::error!(error = %e, "metrics server failed");
        }
    });

    shutdown_signal().await;
    tracing::info!("shutdown requested");

    stop.cancel();
    if let Err(e) = receiver.await {
        tracing::error!(error = %e, "receive loop task failed");
    }
    pipeline.shutdown().await;

    // workers and the receive loop held the last ackers; the task drains and exits
    if tokio::time::timeout(Duration::from_secs(5), ack_task).await.is_err() {
        tracing::warn!("ack task did not finish in time");
    }
    if let Err(e) = client.disconnect().await {
        tracing::debug!(error = %e, "MQTT disconnect");
    }

    dead_letters.shutdown().await?;
    if let Err(e) = dead_letter_writer.await {
        tracing::error!(error = %e, "dead-letter writer failed");
    }
    relational.close().await;
    let _ = http.await;

    tracing::info!("stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
