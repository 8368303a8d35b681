//! Redpanda/Kafka consumer for the rotor
//!
//! This module provides:
//! - Bounded concurrent dispatch (backpressure)
//! - Fan-out of one message to several connections
//! - Retry and dead-letter requeueing with exponential backoff
//! - Graceful, draining shutdown
//!
//! The transport sits behind [`MessageSource`] and [`MessagePublisher`];
//! rdkafka implementations live in `kafka` (feature `kafka`).
//!
//! # Example
//!
//! ```no_run
//! use rotor::consumer::{ChannelSource, ConsumerConfig, ConsumerOrchestrator, InMemoryPublisher};
//! use rotor::dispatch::MessageDispatcher;
//! use std::sync::Arc;
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn example(dispatcher: Arc<MessageDispatcher>) -> anyhow::Result<()> {
//! let config = ConsumerConfig::builder()
//!     .topics(vec!["destination-messages".to_string()])
//!     .concurrency(50)
//!     .build();
//!
//! let (_tx, source) = ChannelSource::new(100);
//! let orchestrator = Arc::new(ConsumerOrchestrator::new(
//!     config,
//!     dispatcher,
//!     Arc::new(InMemoryPublisher::new()),
//! ));
//! orchestrator.run(source, CancellationToken::new()).await?;
//! # Ok(())
//! # }
//! ```

pub mod backpressure;
pub mod config;
pub mod consumer;
#[cfg(feature = "kafka")]
pub mod kafka;
pub mod processor;
pub mod retry;
pub mod shutdown;

pub use backpressure::{BackpressureController, BackpressurePermit};
pub use config::{ConsumerConfig, ConsumerConfigBuilder};
pub use consumer::{ConsumerOrchestrator, Requeue};
pub use processor::{
    ChannelSource, InMemoryPublisher, MessagePublisher, MessageSource, RotorMessage,
};
pub use retry::{RetryPolicy, RetrySettings};
pub use shutdown::ShutdownState;
