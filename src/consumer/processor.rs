//! Transport seams of the consumer: where messages come from and where
//! requeued messages go

use crate::error::{RotorError, RotorResult};
use async_trait::async_trait;
use std::collections::BTreeMap;
use tokio::sync::mpsc;

/// Failure reason of the last attempt
pub const HEADER_ERROR: &str = "error";
/// Number of failed attempts so far
pub const HEADER_RETRIES: &str = "retries";
/// Topic the message was first consumed from
pub const HEADER_ORIGINAL_TOPIC: &str = "original_topic";
/// RFC 3339 time before which the message must not be retried
pub const HEADER_RETRY_TIME: &str = "retry_time";
/// Comma-separated connections the message is routed to
pub const HEADER_CONNECTION_IDS: &str = "connection_ids";
/// Function that failed on the last attempt
pub const HEADER_FUNCTION_ID: &str = "function_id";

/// Transport-neutral message
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RotorMessage {
    /// Topic the message was read from or is published to
    pub topic: String,
    /// Partitioning key
    pub key: Option<String>,
    /// Raw body
    pub payload: Vec<u8>,
    /// String headers
    pub headers: BTreeMap<String, String>,
}

impl RotorMessage {
    /// Message on `topic` with `payload`
    pub fn new(topic: impl Into<String>, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
            ..Default::default()
        }
    }

    pub fn with_key(mut self, key: impl Into<String>) -> Self {
        self.key = Some(key.into());
        self
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    /// Header value, `None` when missing or empty
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(name)
            .map(String::as_str)
            .filter(|v| !v.is_empty())
    }

    /// Failed attempts so far; unparseable values count as zero
    pub fn retries(&self) -> u32 {
        self.header(HEADER_RETRIES)
            .and_then(|v| v.trim().parse().ok())
            .unwrap_or(0)
    }

    /// Connections listed in the `connection_ids` header
    pub fn connection_ids(&self) -> Vec<String> {
        self.header(HEADER_CONNECTION_IDS)
            .map(|v| {
                v.split(',')
                    .map(str::trim)
                    .filter(|id| !id.is_empty())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default()
    }
}

/// Source of consumed messages
#[async_trait]
pub trait MessageSource: Send {
    /// Next message, `None` once the source is exhausted
    async fn next(&mut self) -> Option<RotorResult<RotorMessage>>;

    /// Stop consuming and release the connection
    async fn close(&mut self) {}
}

/// Sink for retry and dead-letter messages
#[async_trait]
pub trait MessagePublisher: Send + Sync {
    /// Publish one message to `message.topic`
    async fn publish(&self, message: RotorMessage) -> RotorResult<()>;

    /// Flush and disconnect
    async fn close(&self) {}
}

/// Source reading from a channel
pub struct ChannelSource {
    rx: mpsc::Receiver<RotorMessage>,
}

impl ChannelSource {
    /// Source plus the sender feeding it
    pub fn new(buffer: usize) -> (mpsc::Sender<RotorMessage>, Self) {
        let (tx, rx) = mpsc::channel(buffer.max(1));
        (tx, Self { rx })
    }
}

#[async_trait]
impl MessageSource for ChannelSource {
    async fn next(&mut self) -> Option<RotorResult<RotorMessage>> {
        self.rx.recv().await.map(Ok)
    }

    async fn close(&mut self) {
        self.rx.close();
    }
}

/// Publisher keeping every message in memory
#[derive(Debug, Default)]
pub struct InMemoryPublisher {
    published: parking_lot::Mutex<Vec<RotorMessage>>,
    fail: std::sync::atomic::AtomicBool,
}

impl InMemoryPublisher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make subsequent publishes fail
    pub fn set_failing(&self, fail: bool) {
        self.fail.store(fail, std::sync::atomic::Ordering::SeqCst);
    }

    /// Everything published so far
    pub fn published(&self) -> Vec<RotorMessage> {
        self.published.lock().clone()
    }

    /// Messages published to `topic`
    pub fn on_topic(&self, topic: &str) -> Vec<RotorMessage> {
        self.published
            .lock()
            .iter()
            .filter(|m| m.topic == topic)
            .cloned()
            .collect()
    }
}

#[async_trait]
impl MessagePublisher for InMemoryPublisher {
    async fn publish(&self, message: RotorMessage) -> RotorResult<()> {
        if self.fail.load(std::sync::atomic::Ordering::SeqCst) {
            return Err(RotorError::Kafka(format!(
                "publishing to {} is disabled",
                message.topic
            )));
        }
        self.published.lock().push(message);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_accessors() {
        let message = RotorMessage::new("in", "{}")
            .with_header(HEADER_RETRIES, "3")
            .with_header(HEADER_CONNECTION_IDS, "c1, c2,,")
            .with_header(HEADER_FUNCTION_ID, "");
        assert_eq!(message.retries(), 3);
        assert_eq!(message.connection_ids(), vec!["c1", "c2"]);
        assert_eq!(message.header(HEADER_FUNCTION_ID), None);

        let bare = RotorMessage::new("in", "{}").with_header(HEADER_RETRIES, "x");
        assert_eq!(bare.retries(), 0);
        assert!(bare.connection_ids().is_empty());
    }

    #[tokio::test]
    async fn test_in_memory_publisher() {
        let publisher = InMemoryPublisher::new();
        publisher.publish(RotorMessage::new("a", "1")).await.unwrap();
        publisher.publish(RotorMessage::new("b", "2")).await.unwrap();
        assert_eq!(publisher.on_topic("a").len(), 1);

        publisher.set_failing(true);
        assert!(publisher.publish(RotorMessage::new("a", "3")).await.is_err());
        assert_eq!(publisher.published().len(), 2);
    }

    #[tokio::test]
    async fn test_channel_source() {
        let (tx, mut source) = ChannelSource::new(4);
        tx.send(RotorMessage::new("in", "x")).await.unwrap();
        drop(tx);
        assert_eq!(source.next().await.unwrap().unwrap().payload, b"x");
        assert!(source.next().await.is_none());
    }
}
