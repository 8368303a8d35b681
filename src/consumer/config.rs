//! Consumer configuration structures

use crate::consumer::retry::RetrySettings;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

/// Redpanda/Kafka consumer configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConsumerConfig {
    /// Kafka broker addresses (comma-separated)
    pub brokers: String,

    /// Consumer group ID
    pub group_id: String,

    /// Topics to consume from
    pub topics: Vec<String>,

    /// Topic failed messages are requeued to
    pub retry_topic: String,

    /// Topic messages go to once retries are exhausted
    pub dead_letter_topic: String,

    /// Session timeout in milliseconds
    pub session_timeout_ms: u32,

    /// Auto-commit interval in milliseconds
    pub auto_commit_interval_ms: u32,

    /// Offset reset policy (earliest, latest, none)
    pub auto_offset_reset: String,

    /// Maximum number of messages dispatched at once
    pub concurrency: usize,

    /// How often a slow drain is reported; shutdown still waits for every
    /// inflight message
    pub drain_timeout: Duration,

    /// Produce timeout for retry and dead-letter messages
    pub publish_timeout: Duration,

    /// Retry limits and backoff
    pub retry: RetrySettings,

    /// Additional Kafka properties
    pub kafka_properties: HashMap<String, String>,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            brokers: "localhost:9092".to_string(),
            group_id: "rotor".to_string(),
            topics: vec!["destination-messages".to_string()],
            retry_topic: "destination-messages-retry".to_string(),
            dead_letter_topic: "destination-messages-dead".to_string(),
            session_timeout_ms: 30000,
            auto_commit_interval_ms: 5000,
            auto_offset_reset: "earliest".to_string(),
            concurrency: 100,
            drain_timeout: Duration::from_secs(30),
            publish_timeout: Duration::from_secs(10),
            retry: RetrySettings::default(),
            kafka_properties: HashMap::new(),
        }
    }
}

/// Builder for ConsumerConfig
pub struct ConsumerConfigBuilder {
    config: ConsumerConfig,
}

impl ConsumerConfigBuilder {
    /// Create a new consumer config builder
    pub fn new() -> Self {
        Self {
            config: ConsumerConfig::default(),
        }
    }

    /// Set the broker addresses
    pub fn brokers(mut self, brokers: String) -> Self {
        self.config.brokers = brokers;
        self
    }

    /// Set the consumer group ID
    pub fn group_id(mut self, group_id: String) -> Self {
        self.config.group_id = group_id;
        self
    }

    /// Set the topics to consume
    pub fn topics(mut self, topics: Vec<String>) -> Self {
        self.config.topics = topics;
        self
    }

    pub fn retry_topic(mut self, topic: String) -> Self {
        self.config.retry_topic = topic;
        self
    }

    pub fn dead_letter_topic(mut self, topic: String) -> Self {
        self.config.dead_letter_topic = topic;
        self
    }

    pub fn session_timeout_ms(mut self, timeout: u32) -> Self {
        self.config.session_timeout_ms = timeout;
        self
    }

    /// Set the maximum number of concurrently dispatched messages
    pub fn concurrency(mut self, concurrency: usize) -> Self {
        self.config.concurrency = concurrency;
        self
    }

    /// Set how long shutdown waits for inflight messages
    pub fn drain_timeout(mut self, timeout: Duration) -> Self {
        self.config.drain_timeout = timeout;
        self
    }

    /// Set the retry limits
    pub fn retry(mut self, retry: RetrySettings) -> Self {
        self.config.retry = retry;
        self
    }

    /// Add a custom Kafka property
    pub fn kafka_property(mut self, key: String, value: String) -> Self {
        self.config.kafka_properties.insert(key, value);
        self
    }

    /// Build the consumer configuration
    pub fn build(self) -> ConsumerConfig {
        self.config
    }
}

impl Default for ConsumerConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl ConsumerConfig {
    /// Create a new consumer config builder
    pub fn builder() -> ConsumerConfigBuilder {
        ConsumerConfigBuilder::new()
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), String> {
        if self.brokers.is_empty() {
            return Err("Brokers cannot be empty".to_string());
        }

        if self.group_id.is_empty() {
            return Err("Group ID cannot be empty".to_string());
        }

        if self.topics.is_empty() {
            return Err("Topics cannot be empty".to_string());
        }

        if self.retry_topic.is_empty() || self.dead_letter_topic.is_empty() {
            return Err("Retry and dead-letter topics must be set".to_string());
        }

        if self.topics.contains(&self.dead_letter_topic) {
            return Err("Dead-letter topic cannot be consumed".to_string());
        }

        if self.concurrency == 0 {
            return Err("Concurrency must be greater than 0".to_string());
        }

        if self.retry.backoff_base == 0 {
            return Err("Retry backoff base must be greater than 0".to_string());
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_valid() {
        assert!(ConsumerConfig::default().validate().is_ok());
    }

    #[test]
    fn test_builder() {
        let config = ConsumerConfig::builder()
            .brokers("kafka:9092".to_string())
            .topics(vec!["in".to_string()])
            .retry_topic("in-retry".to_string())
            .concurrency(8)
            .kafka_property("security.protocol".to_string(), "SSL".to_string())
            .build();
        assert_eq!(config.brokers, "kafka:9092");
        assert_eq!(config.concurrency, 8);
        assert_eq!(config.kafka_properties["security.protocol"], "SSL");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validation_errors() {
        let zero = ConsumerConfig::builder().concurrency(0).build();
        assert!(zero.validate().is_err());

        let dead_loop = ConsumerConfig::builder()
            .topics(vec!["destination-messages-dead".to_string()])
            .build();
        assert!(dead_loop.validate().is_err());
    }
}
