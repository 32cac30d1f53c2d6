use anyhow::{Context, Result};
use serde::Deserialize;
use std::time::Duration;

/// `AppConfig` holds all configuration parameters required by the services.
///
/// The configuration is loaded from environment variables (optionally via a
/// `.env` file) or uses default values if the variable is not set. Fields
/// cover the database pool, the Kafka transaction broker, the Redis shared
/// cache / result stream, the local cache, the existence filter, the
/// outbound RPC limits, and the HTTP server. Deserializable via Serde.
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct AppConfig {
    // --- Database settings ---
    /// Database hostname or service name.
    pub db_host: String,
    /// Database port (default: 5432).
    pub db_port: u16,
    /// Database user.
    pub db_user: String,
    /// Database password.
    pub db_password: String,
    /// Database name.
    pub db_name: String,
    /// Upper bound of open connections in the pool.
    pub db_max_open: usize,

    // --- Kafka settings ---
    /// List of Kafka brokers (comma-separated string in env, parsed to Vec<String>).
    pub kafka_brokers: Vec<String>,
    /// Consumer group id; one group per service forms the queue group.
    pub kafka_group_id: String,
    /// Concurrent subscriber loops per subscribed topic.
    pub kafka_workers: usize,

    // --- Redis settings ---
    /// Redis connection URL for the shared cache tier and result stream.
    pub redis_url: String,
    /// Base TTL for shared cache entries; jitter is added on top.
    #[serde(deserialize_with = "deserialize_duration")]
    pub redis_expiration: Duration,
    /// Approximate MAXLEN retention of the purchase result stream.
    pub purchase_result_maxlen: i64,

    // --- Local cache ---
    /// TTL of in-process cache entries.
    #[serde(deserialize_with = "deserialize_duration")]
    pub local_cache_expiration: Duration,
    /// Maximum entries held in-process.
    pub local_cache_capacity: u64,

    // --- Existence filter ---
    /// Filter implementation: "none", "bloom" or "cuckoo".
    pub filter_kind: FilterKind,
    /// Capacity hint passed on filter creation.
    pub filter_capacity: u64,
    /// Target false-positive rate (bloom only).
    pub filter_error_rate: f64,

    // --- Outbound RPC ---
    /// Base URL of the product service consumed by order reads.
    pub product_service_url: String,
    /// Token-bucket refill rate for peer-service calls, per second.
    pub rpc_rps: u32,
    /// Consecutive failures before the circuit breaker opens.
    pub rpc_breaker_threshold: u32,
    /// Time an open breaker waits before half-opening.
    #[serde(deserialize_with = "deserialize_duration")]
    pub rpc_breaker_timeout: Duration,

    // --- HTTP server ---
    /// The port on which the HTTP server will listen.
    pub http_port: u16,

    // --- Shutdown timeout ---
    /// Graceful shutdown timeout (human-friendly format, e.g. "5s", "1m").
    #[serde(deserialize_with = "deserialize_duration")]
    pub shutdown_timeout: Duration,
}

/// Existence filter selection.
///
/// Bloom filters cannot delete members, so product deletion leaves a
/// false-positive behind; cuckoo filters support deletion at slightly
/// different space/error characteristics.
#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum FilterKind {
    None,
    Bloom,
    Cuckoo,
}

/// Custom deserializer for duration fields.
/// Accepts human-readable formats like "5s", "1m", etc.
fn deserialize_duration<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: serde::Deserializer<'de>,
{
    use serde::de::Error;
    let val = String::deserialize(deserializer)?;
    humantime::parse_duration(&val)
        .map_err(|e| D::Error::custom(format!("Invalid duration '{val}': {e}")))
}

impl AppConfig {
    /// Loads configuration from environment variables (and optionally from
    /// a `.env` file). Fields not set via env fall back to defaults.
    ///
    /// # Errors
    /// Returns an error if environment variables are invalid.
    pub fn load() -> Result<Self> {
        dotenvy::dotenv().ok();

        let settings = config::Config::builder()
            // Database
            .set_default("db_host", "localhost")?
            .set_default("db_port", 5432)?
            .set_default("db_user", "saga_user")?
            .set_default("db_password", "securepassword")?
            .set_default("db_name", "saga_db")?
            .set_default("db_max_open", 16)?
            // Kafka
            .set_default("kafka_brokers", vec!["localhost:9092"])?
            .set_default("kafka_group_id", "purchase_saga")?
            .set_default("kafka_workers", 4)?
            // Redis
            .set_default("redis_url", "redis://localhost:6379")?
            .set_default("redis_expiration", "60s")?
            .set_default("purchase_result_maxlen", 10000)?
            // Local cache
            .set_default("local_cache_expiration", "10s")?
            .set_default("local_cache_capacity", 10000)?
            // Existence filter
            .set_default("filter_kind", "none")?
            .set_default("filter_capacity", 100000)?
            .set_default("filter_error_rate", 0.01)?
            // Outbound RPC
            .set_default("product_service_url", "http://localhost:8080")?
            .set_default("rpc_rps", 50)?
            .set_default("rpc_breaker_threshold", 5)?
            .set_default("rpc_breaker_timeout", "30s")?
            // HTTP
            .set_default("http_port", 8081)?
            // Shutdown
            .set_default("shutdown_timeout", "5s")?
            .add_source(config::Environment::default())
            .build()?;

        settings
            .try_deserialize()
            .context("Failed to load configuration")
    }

    /// Postgres DSN assembled from the db fields.
    pub fn db_dsn(&self) -> String {
        format!(
            "host={} port={} user={} password={} dbname={} sslmode=disable",
            self.db_host, self.db_port, self.db_user, self.db_password, self.db_name
        )
    }
}
