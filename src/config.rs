// Service configuration, read from environment variables (a `.env` file is
// loaded first when present). Credentials have no defaults: a missing
// username, password or token stops the service at startup.
use std::fmt::Display;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use rumqttc::QoS;

use crate::decode::{Bounds, Range};
use crate::retry::BackoffConfig;

#[derive(Clone)]
pub struct MqttConfig {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    pub client_id: String,
    pub keep_alive: Duration,
    pub qos: QoS,
    /// Connection attempts at startup before giving up.
    pub connect_retries: u32,
    pub reconnect_delay: Duration,
}

impl MqttConfig {
    /// Broker settings alone, for tools that only talk to the broker.
    pub fn from_env() -> Result<MqttConfig> {
        load_dotenv()?;
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<MqttConfig> {
        Self::parse(&Env { lookup })
    }

    fn parse<F: Fn(&str) -> Option<String>>(env: &Env<F>) -> Result<MqttConfig> {
        Ok(MqttConfig {
            host: env.or("MQTT_HOST", "localhost".to_string())?,
            port: env.or("MQTT_PORT", 1883)?,
            username: env.required("MQTT_USERNAME")?,
            password: env.required("MQTT_PASSWORD")?,
            client_id: env.or("MQTT_CLIENT_ID", "logistics-ingest".to_string())?,
            keep_alive: Duration::from_secs(env.or("MQTT_KEEP_ALIVE_SECS", 60)?),
            qos: match env.or::<u8>("MQTT_QOS", 0)? {
                0 => QoS::AtMostOnce,
                1 => QoS::AtLeastOnce,
                other => bail!("MQTT_QOS must be 0 or 1, got {}", other),
            },
            connect_retries: env.or("MQTT_CONNECT_RETRIES", 5)?,
            reconnect_delay: Duration::from_secs(env.or("MQTT_RECONNECT_DELAY_SECS", 5)?),
        })
    }

    pub fn broker_url(&self) -> String {
        format!("tcp://{}:{}", self.host, self.port)
    }
}

#[derive(Clone)]
pub struct PostgresConfig {
    pub url: String,
    pub max_connections: u32,
}

#[derive(Clone)]
pub struct InfluxConfig {
    pub url: String,
    pub org: String,
    pub bucket: String,
    pub token: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PipelineConfig {
    pub workers: usize,
    /// Upper bound on queued messages across all workers.
    pub queue_capacity: usize,
    pub batch_size: usize,
    pub batch_timeout: Duration,
    pub backoff: BackoffConfig,
    pub shutdown_grace: Duration,
}

impl PipelineConfig {
    /// Each worker gets an equal share of the queue bound, so the total
    /// never exceeds `queue_capacity`.
    pub fn per_worker_capacity(&self) -> usize {
        (self.queue_capacity / self.workers.max(1)).max(1)
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        PipelineConfig {
            workers: 4,
            queue_capacity: 1024,
            batch_size: 100,
            batch_timeout: Duration::from_millis(1000),
            backoff: BackoffConfig::default(),
            shutdown_grace: Duration::from_secs(10),
        }
    }
}

#[derive(Clone)]
pub struct Config {
    pub mqtt: MqttConfig,
    pub postgres: PostgresConfig,
    pub influx: InfluxConfig,
    pub pipeline: PipelineConfig,
    pub bounds: Bounds,
    pub dead_letter_path: PathBuf,
    pub metrics_addr: SocketAddr,
}

impl Config {
    /// Load `.env` (if any) and read the process environment.
    pub fn from_env() -> Result<Config> {
        load_dotenv()?;
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Config> {
        let env = Env { lookup };

        let mqtt = MqttConfig::parse(&env)?;

        let postgres_url = match env.get("POSTGRES_URL") {
            Some(url) => url,
            None => format!(
                "postgres://{}:{}@{}:{}/{}?sslmode=disable",
                env.required("POSTGRES_USER")?,
                env.required("POSTGRES_PASSWORD")?,
                env.or("POSTGRES_HOST", "localhost".to_string())?,
                env.or::<u16>("POSTGRES_PORT", 5432)?,
                env.required("POSTGRES_DB")?,
            ),
        };
        let postgres = PostgresConfig {
            url: postgres_url,
            max_connections: env.or("POSTGRES_MAX_CONNECTIONS", 8)?,
        };

        let influx = InfluxConfig {
            url: env.or("INFLUXDB_URL", "http://localhost:8086".to_string())?,
            org: env.required("INFLUXDB_ORG")?,
            bucket: env.required("INFLUXDB_BUCKET")?,
            token: env.required("INFLUXDB_TOKEN")?,
        };

        let defaults = PipelineConfig::default();
        let pipeline = PipelineConfig {
            workers: env.or("INGEST_WORKERS", defaults.workers)?,
            queue_capacity: env.or("INGEST_QUEUE_CAPACITY", defaults.queue_capacity)?,
            batch_size: env.or("INGEST_BATCH_SIZE", defaults.batch_size)?,
            batch_timeout: Duration::from_millis(env.or("INGEST_BATCH_TIMEOUT_MS", 1000)?),
            backoff: BackoffConfig {
                base_delay: Duration::from_millis(env.or("INGEST_RETRY_BASE_MS", 200)?),
                factor: env.or("INGEST_RETRY_FACTOR", 2.0)?,
                max_delay: Duration::from_millis(env.or("INGEST_RETRY_MAX_DELAY_MS", 5000)?),
                max_attempts: env.or("INGEST_RETRY_MAX_ATTEMPTS", 5)?,
                write_timeout: Duration::from_millis(env.or("INGEST_WRITE_TIMEOUT_MS", 10_000)?),
            },
            shutdown_grace: Duration::from_secs(env.or("INGEST_SHUTDOWN_GRACE_SECS", 10)?),
        };

        let default_bounds = Bounds::default();
        let bounds = Bounds {
            speed: Range::new(0.0, env.or("SPEED_MAX", default_bounds.speed.max)?),
            drowsiness: Range::new(0.0, env.or("DROWSINESS_MAX", default_bounds.drowsiness.max)?),
            temp: Range::new(
                env.or("TEMP_MIN", default_bounds.temp.min)?,
                env.or("TEMP_MAX", default_bounds.temp.max)?,
            ),
            accel: {
                let max: f64 = env.or("ACCEL_MAX", default_bounds.accel.max)?;
                Range::new(-max, max)
            },
            ..default_bounds
        };

        let config = Config {
            mqtt,
            postgres,
            influx,
            pipeline,
            bounds,
            dead_letter_path: PathBuf::from(env.or("DEAD_LETTER_PATH", "dead_letters.jsonl".to_string())?),
            metrics_addr: env.or("METRICS_ADDR", SocketAddr::from(([0, 0, 0, 0], 3000)))?,
        };
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        let p = &self.pipeline;
        if p.workers == 0 {
            bail!("INGEST_WORKERS must be at least 1");
        }
        if p.queue_capacity < p.workers {
            bail!(
                "INGEST_QUEUE_CAPACITY ({}) must be at least INGEST_WORKERS ({})",
                p.queue_capacity,
                p.workers
            );
        }
        if p.batch_size == 0 {
            bail!("INGEST_BATCH_SIZE must be at least 1");
        }
        if p.backoff.max_attempts == 0 {
            bail!("INGEST_RETRY_MAX_ATTEMPTS must be at least 1");
        }
        if p.backoff.factor < 1.0 {
            bail!("INGEST_RETRY_FACTOR must be >= 1.0");
        }
        let b = &self.bounds;
        let ranges = [("speed", b.speed), ("drowsiness", b.drowsiness), ("temp", b.temp), ("accel", b.accel)];
        for (name, range) in ranges {
            if range.min > range.max {
                bail!("{} bounds are empty: [{}, {}]", name, range.min, range.max);
            }
        }
        Ok(())
    }
}

fn load_dotenv() -> Result<()> {
    match dotenvy::dotenv() {
        Ok(path) => tracing::info!(path = %path.display(), "loaded .env file"),
        Err(e) if e.not_found() => tracing::debug!("no .env file, using process environment"),
        Err(e) => return Err(e).context("failed to load .env file"),
    }
    Ok(())
}

struct Env<F> {
    lookup: F,
}

impl<F: Fn(&str) -> Option<String>> Env<F> {
    fn get(&self, key: &str) -> Option<String> {
        (self.lookup)(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty())
    }

    fn required(&self, key: &str) -> Result<String> {
        self.get(key).with_context(|| format!("{} must be set", key))
    }

    fn or<T>(&self, key: &str, default: T) -> Result<T>
    where
        T: FromStr,
        T::Err: Display,
    {
        match self.get(key) {
            None => Ok(default),
            Some(raw) => raw
                .parse()
                .map_err(|e| anyhow::anyhow!("invalid {} value '{}': {}", key, raw, e)),
        }
    }
}
