//! MQTT telemetry ingestion for a logistics fleet. Device readings arrive on
//! `logistics/{device}/{metric}`, are decoded into typed samples and written
//! in batches to PostgreSQL (latest device state) and InfluxDB (history).
pub mod config;
pub mod dead_letter;
pub mod decode;
pub mod delivery;
pub mod handlers;
pub mod metrics;
pub mod mqtt;
pub mod pipeline;
pub mod retry;
pub mod server;
pub mod sink;
pub mod topic;
