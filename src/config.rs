//! Process configuration
//!
//! Every setting has a default; [`RotorConfig::from_env`] overrides them from
//! `ROTOR_*` and `KAFKA_*` variables, and a JSON file may be loaded with
//! [`RotorConfig::from_file`].

use crate::consumer::ConsumerConfig;
use crate::error::{RotorError, RotorResult};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

/// Where connections and functions are loaded from
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RepositoryConfig {
    /// JSON file or http(s) URL with the connection list
    pub connections: String,
    /// JSON file or http(s) URL with the function list
    pub functions: String,
    /// Bearer token for http sources
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth_token: Option<String>,
}

impl Default for RepositoryConfig {
    fn default() -> Self {
        Self {
            connections: "connections.json".to_string(),
            functions: "functions.json".to_string(),
            auth_token: None,
        }
    }
}

/// Rotor configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct RotorConfig {
    /// Kafka consumer settings
    pub consumer: ConsumerConfig,
    /// Connection and function sources
    pub repository: RepositoryConfig,
    /// HTTP listen port
    pub http_port: u16,
    /// Bound on a single function call and on outbound HTTP
    pub fetch_timeout: Duration,
    /// How long built chains are cached
    pub chain_cache_ttl: Duration,
    /// Idle time after which compiled UDFs are evicted
    pub udf_cache_ttl: Duration,
    /// How long a replaced UDF unit stays usable
    pub udf_grace_period: Duration,
    /// Interval between store refreshes
    pub store_refresh_interval: Duration,
    /// Store snapshot directory
    pub cache_dir: Option<PathBuf>,
    /// Bulker endpoint
    pub bulker_url: Option<String>,
    /// Bulker auth token
    pub bulker_token: Option<String>,
    /// Metrics flush interval
    pub metrics_flush_interval: Duration,
    /// Rows buffered before an early metrics flush
    pub metrics_max_buffer: usize,
    /// Wasm fuel per UDF invocation
    pub udf_fuel: u64,
    /// Wasm memory limit per UDF instance
    pub udf_max_memory_bytes: usize,
}

impl Default for RotorConfig {
    fn default() -> Self {
        Self {
            consumer: ConsumerConfig::default(),
            repository: RepositoryConfig::default(),
            http_port: 3401,
            fetch_timeout: Duration::from_secs(2),
            chain_cache_ttl: Duration::from_secs(60),
            udf_cache_ttl: Duration::from_secs(600),
            udf_grace_period: Duration::from_secs(10),
            store_refresh_interval: Duration::from_secs(10),
            cache_dir: None,
            bulker_url: None,
            bulker_token: None,
            metrics_flush_interval: Duration::from_secs(60),
            metrics_max_buffer: 10_000,
            udf_fuel: 50_000_000,
            udf_max_memory_bytes: 64 * 1024 * 1024,
        }
    }
}

fn env_var(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.trim().is_empty())
}

fn env_parse<T: FromStr>(name: &str) -> RotorResult<Option<T>>
where
    T::Err: std::fmt::Display,
{
    env_var(name)
        .map(|v| {
            v.trim()
                .parse::<T>()
                .map_err(|e| RotorError::Configuration(format!("{name}={v}: {e}")))
        })
        .transpose()
}

fn env_secs(name: &str) -> RotorResult<Option<Duration>> {
    Ok(env_parse::<u64>(name)?.map(Duration::from_secs))
}

fn env_list(name: &str) -> Option<Vec<String>> {
    env_var(name).map(|v| {
        v.split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect()
    })
}

impl RotorConfig {
    /// Defaults overridden by environment variables
    pub fn from_env() -> RotorResult<Self> {
        let mut config = Self::default();
        config.apply_env()?;
        Ok(config)
    }

    /// Load a JSON config file; missing fields keep their defaults
    pub fn from_file(path: impl AsRef<Path>) -> RotorResult<Self> {
        let bytes = std::fs::read(path.as_ref())?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    /// Override fields from `ROTOR_*` / `KAFKA_*` variables
    pub fn apply_env(&mut self) -> RotorResult<()> {
        let consumer = &mut self.consumer;
        if let Some(v) = env_var("KAFKA_BOOTSTRAP_SERVERS") {
            consumer.brokers = v;
        }
        if let Some(v) = env_var("KAFKA_CONSUMER_GROUP_ID") {
            consumer.group_id = v;
        }
        if let Some(v) = env_list("KAFKA_TOPICS") {
            consumer.topics = v;
        }
        if let Some(v) = env_var("KAFKA_RETRY_TOPIC") {
            consumer.retry_topic = v;
        }
        if let Some(v) = env_var("KAFKA_DEAD_LETTER_TOPIC") {
            consumer.dead_letter_topic = v;
        }
        if let Some(v) = env_var("KAFKA_SECURITY_PROTOCOL") {
            consumer.kafka_properties.insert("security.protocol".into(), v);
        }
        if let Some(v) = env_var("KAFKA_SASL_MECHANISM") {
            consumer.kafka_properties.insert("sasl.mechanism".into(), v);
        }
        if let Some(v) = env_var("KAFKA_SASL_USERNAME") {
            consumer.kafka_properties.insert("sasl.username".into(), v);
        }
        if let Some(v) = env_var("KAFKA_SASL_PASSWORD") {
            consumer.kafka_properties.insert("sasl.password".into(), v);
        }
        if let Some(v) = env_parse("ROTOR_CONCURRENCY")? {
            consumer.concurrency = v;
        }
        if let Some(v) = env_parse("ROTOR_RETRY_MAX_RETRIES")? {
            consumer.retry.max_retries = v;
        }
        if let Some(v) = env_parse("ROTOR_RETRY_BACKOFF_BASE")? {
            consumer.retry.backoff_base = v;
        }
        if let Some(v) = env_parse("ROTOR_RETRY_MAX_DELAY_MINUTES")? {
            consumer.retry.max_delay_minutes = v;
        }

        if let Some(v) = env_var("ROTOR_REPOSITORY_CONNECTIONS") {
            self.repository.connections = v;
        }
        if let Some(v) = env_var("ROTOR_REPOSITORY_FUNCTIONS") {
            self.repository.functions = v;
        }
        if let Some(v) = env_var("ROTOR_REPOSITORY_TOKEN") {
            self.repository.auth_token = Some(v);
        }
        if let Some(v) = env_parse("ROTOR_HTTP_PORT")? {
            self.http_port = v;
        }
        if let Some(v) = env_parse::<u64>("ROTOR_FETCH_TIMEOUT_MS")? {
            self.fetch_timeout = Duration::from_millis(v);
        }
        if let Some(v) = env_secs("ROTOR_CHAIN_CACHE_TTL_SEC")? {
            self.chain_cache_ttl = v;
        }
        if let Some(v) = env_secs("ROTOR_UDF_CACHE_TTL_SEC")? {
            self.udf_cache_ttl = v;
        }
        if let Some(v) = env_secs("ROTOR_STORE_REFRESH_SEC")? {
            self.store_refresh_interval = v;
        }
        if let Some(v) = env_var("ROTOR_CACHE_DIR") {
            self.cache_dir = Some(PathBuf::from(v));
        }
        if let Some(v) = env_var("ROTOR_BULKER_URL") {
            self.bulker_url = Some(v);
        }
        if let Some(v) = env_var("ROTOR_BULKER_TOKEN") {
            self.bulker_token = Some(v);
        }
        if let Some(v) = env_secs("ROTOR_METRICS_FLUSH_SEC")? {
            self.metrics_flush_interval = v;
        }
        Ok(())
    }

    /// Validate the configuration
    pub fn validate(&self) -> RotorResult<()> {
        self.consumer
            .validate()
            .map_err(RotorError::Configuration)?;
        if self.fetch_timeout.is_zero() {
            return Err(RotorError::Configuration(
                "Fetch timeout must be greater than 0".into(),
            ));
        }
        if self.store_refresh_interval.is_zero() {
            return Err(RotorError::Configuration(
                "Store refresh interval must be greater than 0".into(),
            ));
        }
        if self.bulker_token.is_some() && self.bulker_url.is_none() {
            return Err(RotorError::Configuration(
                "Bulker token is set but bulker url is not".into(),
            ));
        }
        if self.metrics_max_buffer == 0 {
            return Err(RotorError::Configuration(
                "Metrics buffer must be greater than 0".into(),
            ));
        }
        Ok(())
    }

    pub fn with_http_port(mut self, port: u16) -> Self {
        self.http_port = port;
        self
    }

    pub fn with_fetch_timeout(mut self, timeout: Duration) -> Self {
        self.fetch_timeout = timeout;
        self
    }

    pub fn with_cache_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cache_dir = Some(dir.into());
        self
    }

    pub fn with_bulker(mut self, url: impl Into<String>, token: impl Into<String>) -> Self {
        self.bulker_url = Some(url.into());
        self.bulker_token = Some(token.into());
        self
    }
}
