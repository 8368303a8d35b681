//! Prometheus collectors
//!
//! All collectors live in [`REGISTRY`], which the HTTP service exposes on
//! `/metrics`.

use once_cell::sync::Lazy;
use prometheus::core::Collector;
use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounterVec, IntGaugeVec, Opts, Registry, TextEncoder,
};
use tracing::warn;

/// Registry holding every rotor collector
pub static REGISTRY: Lazy<Registry> = Lazy::new(Registry::new);

/// Function calls currently running, by step kind
pub static FUNCTIONS_IN_FLIGHT: Lazy<IntGaugeVec> = Lazy::new(|| {
    register(
        IntGaugeVec::new(
            Opts::new("rotor_functions_in_flight", "Function calls in progress"),
            &["kind"],
        )
        .expect("valid metric definition"),
    )
});

/// Function call duration, by step kind
pub static FUNCTION_TIME: Lazy<HistogramVec> = Lazy::new(|| {
    register(
        HistogramVec::new(
            HistogramOpts::new("rotor_function_time_seconds", "Function call duration")
                .buckets(vec![0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 2.0, 5.0]),
            &["kind"],
        )
        .expect("valid metric definition"),
    )
});

/// Consumed messages by outcome (`processed`, `requeued`, `dead_lettered`,
/// `publish_failed`)
pub static MESSAGES: Lazy<IntCounterVec> = Lazy::new(|| {
    register(
        IntCounterVec::new(
            Opts::new("rotor_messages_total", "Consumed messages by outcome"),
            &["outcome"],
        )
        .expect("valid metric definition"),
    )
});

/// Aggregated function events written by the metrics aggregator
pub static FUNCTION_EVENTS: Lazy<IntCounterVec> = Lazy::new(|| {
    register(
        IntCounterVec::new(
            Opts::new("rotor_function_events_total", "Function invocations by status"),
            &["workspace_id", "connection_id", "function_id", "status"],
        )
        .expect("valid metric definition"),
    )
});

/// HTTP requests by route and status code
pub static HTTP_REQUESTS: Lazy<IntCounterVec> = Lazy::new(|| {
    register(
        IntCounterVec::new(
            Opts::new("rotor_http_requests_total", "HTTP requests by route and status"),
            &["route", "status"],
        )
        .expect("valid metric definition"),
    )
});

fn register<C: Collector + Clone + 'static>(collector: C) -> C {
    if let Err(e) = REGISTRY.register(Box::new(collector.clone())) {
        warn!(error = %e, "Failed to register collector");
    }
    collector
}

/// Text exposition of [`REGISTRY`]
pub fn gather_text() -> Result<(String, String), prometheus::Error> {
    // touch lazies so every family shows up even before first use
    Lazy::force(&FUNCTIONS_IN_FLIGHT);
    Lazy::force(&FUNCTION_TIME);
    Lazy::force(&MESSAGES);
    Lazy::force(&FUNCTION_EVENTS);
    Lazy::force(&HTTP_REQUESTS);

    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    encoder.encode(&REGISTRY.gather(), &mut buffer)?;
    let text = String::from_utf8_lossy(&buffer).into_owned();
    Ok((encoder.format_type().to_string(), text))
}
