//! Event routing engine
//!
//! Every message consumed from the input topic belongs to one or more
//! connections. Each connection owns a function chain (built-in
//! transformations, user-defined functions, then a destination) which the
//! rotor builds once, caches, and runs against the event. Failures are
//! requeued to a retry topic with exponential backoff and eventually to a
//! dead-letter topic.
//!
//! # Example
//!
//! ```no_run
//! use rotor::dispatch::DispatchRequest;
//! use rotor::{Rotor, RotorConfig};
//! use serde_json::json;
//!
//! # async fn example() -> anyhow::Result<()> {
//! let rotor = Rotor::start(RotorConfig::from_env()?).await?;
//!
//! let request = DispatchRequest::for_event("conn-1", json!({"type": "page"}));
//! let result = rotor.dispatcher.dispatch(request).await?;
//! tracing::info!("{} events delivered", result.events.len());
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![deny(unsafe_code)]
#![warn(clippy::all)]
#![allow(clippy::too_many_arguments)]
#![allow(clippy::module_inception)]

pub use app::Rotor;
pub use config::RotorConfig;
pub use error::{FuncError, FuncErrorKind, RotorError, RotorResult};
pub use event::{AnyEvent, EventContext, IngestMessage};

/// Process wiring
pub mod app;

/// Function chains: build, cache, execute
pub mod chain;

/// Process configuration
pub mod config;

/// Consumer orchestrator and transports
pub mod consumer;

/// Per-message dispatch
pub mod dispatch;

/// Geo and user-agent enrichment
pub mod enrich;

/// Error types
pub mod error;

/// Events and their context
pub mod event;

/// Per-connection events log
pub mod events_log;

/// Pipeline functions
pub mod functions;

/// Prometheus collectors and the metrics aggregator
pub mod metrics;

/// Cancellable polling
pub mod poll;

/// HTTP service
#[cfg(feature = "service")]
pub mod service;

/// Entity stores
pub mod store;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Initialize the tracing subscriber with default settings
pub fn init_tracing() {
    use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::from_default_env())
        .with(tracing_subscriber::fmt::layer().json())
        .init();
}

/// Human readable output at debug level, for local runs
pub fn init_tracing_pretty() {
    use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("debug")),
        )
        .with(tracing_subscriber::fmt::layer().pretty())
        .init();
}
