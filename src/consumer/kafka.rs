//! rdkafka transport: stream consumer source, future producer publisher and
//! topic bootstrap

use crate::consumer::config::ConsumerConfig;
use crate::consumer::processor::{MessagePublisher, MessageSource, RotorMessage};
use crate::error::{RotorError, RotorResult};
use async_trait::async_trait;
use rdkafka::admin::{AdminClient, AdminOptions, NewTopic, TopicReplication};
use rdkafka::client::DefaultClientContext;
use rdkafka::consumer::{Consumer, StreamConsumer};
use rdkafka::message::{BorrowedMessage, Header, Headers, OwnedHeaders};
use rdkafka::producer::{FutureProducer, FutureRecord, Producer};
use rdkafka::types::RDKafkaErrorCode;
use rdkafka::util::Timeout;
use rdkafka::{ClientConfig, Message};
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Kafka properties that may be passed through from configuration
const ALLOWED_KAFKA_PROPS: &[&str] = &[
    // Compression settings
    "compression.type",
    "compression.level",
    // Fetch settings
    "fetch.min.bytes",
    "fetch.max.wait.ms",
    "fetch.max.bytes",
    "max.partition.fetch.bytes",
    // Request settings
    "request.timeout.ms",
    "metadata.max.age.ms",
    // Connection settings
    "reconnect.backoff.ms",
    "reconnect.backoff.max.ms",
    "connections.max.idle.ms",
    "socket.keepalive.enable",
    // Security
    "security.protocol",
    "sasl.mechanism",
    "sasl.username",
    "sasl.password",
    "ssl.ca.location",
    // Monitoring
    "statistics.interval.ms",
];

fn client_config(config: &ConsumerConfig) -> RotorResult<ClientConfig> {
    let mut client_config = ClientConfig::new();
    client_config.set("bootstrap.servers", &config.brokers);
    for (key, value) in &config.kafka_properties {
        if !ALLOWED_KAFKA_PROPS.contains(&key.as_str()) {
            return Err(RotorError::Configuration(format!(
                "Disallowed Kafka property '{}'. Allowed properties: {:?}",
                key, ALLOWED_KAFKA_PROPS
            )));
        }
        client_config.set(key, value);
    }
    Ok(client_config)
}

/// Create the retry and dead-letter topics when they are missing
pub async fn ensure_topics(config: &ConsumerConfig) -> RotorResult<()> {
    let admin: AdminClient<DefaultClientContext> = client_config(config)?
        .create()
        .map_err(|e| RotorError::Kafka(format!("Failed to create admin client: {}", e)))?;
    let topics = [
        NewTopic::new(&config.retry_topic, 1, TopicReplication::Fixed(1)),
        NewTopic::new(&config.dead_letter_topic, 1, TopicReplication::Fixed(1)),
    ];
    let results = admin
        .create_topics(&topics, &AdminOptions::new())
        .await
        .map_err(|e| RotorError::Kafka(format!("Failed to create topics: {}", e)))?;
    for result in results {
        match result {
            Ok(topic) => info!("Created topic {}", topic),
            Err((topic, RDKafkaErrorCode::TopicAlreadyExists)) => {
                debug!("Topic {} already exists", topic)
            }
            Err((topic, code)) => {
                return Err(RotorError::Kafka(format!(
                    "Failed to create topic {}: {}",
                    topic, code
                )))
            }
        }
    }
    Ok(())
}

/// Consumer group member reading the input topics
pub struct KafkaSource {
    consumer: StreamConsumer,
}

impl KafkaSource {
    /// Create the consumer and subscribe to `config.topics`
    pub fn connect(config: &ConsumerConfig) -> RotorResult<Self> {
        let consumer: StreamConsumer = client_config(config)?
            .set("group.id", &config.group_id)
            .set("enable.auto.commit", "true")
            .set(
                "auto.commit.interval.ms",
                config.auto_commit_interval_ms.to_string(),
            )
            .set("session.timeout.ms", config.session_timeout_ms.to_string())
            .set("auto.offset.reset", &config.auto_offset_reset)
            .create()
            .map_err(|e| RotorError::Kafka(format!("Failed to create consumer: {}", e)))?;

        let topics: Vec<&str> = config.topics.iter().map(|s| s.as_str()).collect();
        consumer
            .subscribe(&topics)
            .map_err(|e| RotorError::Kafka(format!("Failed to subscribe: {}", e)))?;
        info!("Subscribed to topics: {:?}", config.topics);
        Ok(Self { consumer })
    }
}

fn to_rotor_message(msg: &BorrowedMessage<'_>) -> RotorMessage {
    let mut headers = BTreeMap::new();
    if let Some(kafka_headers) = msg.headers() {
        for header in kafka_headers.iter() {
            if let Some(value) = header.value {
                headers.insert(
                    header.key.to_string(),
                    String::from_utf8_lossy(value).into_owned(),
                );
            }
        }
    }
    RotorMessage {
        topic: msg.topic().to_string(),
        key: msg.key().map(|k| String::from_utf8_lossy(k).into_owned()),
        payload: msg.payload().map(<[u8]>::to_vec).unwrap_or_default(),
        headers,
    }
}

#[async_trait]
impl MessageSource for KafkaSource {
    async fn next(&mut self) -> Option<RotorResult<RotorMessage>> {
        Some(
            self.consumer
                .recv()
                .await
                .map(|msg| to_rotor_message(&msg))
                .map_err(|e| RotorError::Kafka(e.to_string())),
        )
    }

    async fn close(&mut self) {
        self.consumer.unsubscribe();
        info!("Consumer disconnected");
    }
}

/// Producer for retry and dead-letter messages
pub struct KafkaPublisher {
    producer: FutureProducer,
    timeout: Duration,
}

impl KafkaPublisher {
    /// Create the producer
    pub fn connect(config: &ConsumerConfig) -> RotorResult<Self> {
        let producer: FutureProducer = client_config(config)?
            .set("message.timeout.ms", config.publish_timeout.as_millis().to_string())
            .create()
            .map_err(|e| RotorError::Kafka(format!("Failed to create producer: {}", e)))?;
        Ok(Self {
            producer,
            timeout: config.publish_timeout,
        })
    }
}

#[async_trait]
impl MessagePublisher for KafkaPublisher {
    async fn publish(&self, message: RotorMessage) -> RotorResult<()> {
        let mut headers = OwnedHeaders::new();
        for (key, value) in &message.headers {
            headers = headers.insert(Header {
                key: key.as_str(),
                value: Some(value.as_bytes()),
            });
        }
        let mut record = FutureRecord::to(&message.topic)
            .payload(&message.payload)
            .headers(headers);
        if let Some(key) = &message.key {
            record = record.key(key);
        }

        match self.producer.send(record, self.timeout).await {
            Ok((partition, offset)) => {
                debug!(
                    "Published to {} partition {} offset {}",
                    message.topic, partition, offset
                );
                Ok(())
            }
            Err((e, _)) => {
                error!("Failed to publish to {}: {}", message.topic, e);
                Err(RotorError::Kafka(e.to_string()))
            }
        }
    }

    async fn close(&self) {
        if let Err(e) = self.producer.flush(Timeout::After(self.timeout)) {
            warn!("Producer flush failed: {}", e);
        }
        info!("Producer disconnected");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rejects_unknown_properties() {
        let config = ConsumerConfig::builder()
            .kafka_property("plugin.library.paths".to_string(), "/tmp/x.so".to_string())
            .build();
        assert!(matches!(
            client_config(&config),
            Err(RotorError::Configuration(_))
        ));
    }
}
