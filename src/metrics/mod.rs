//! Metrics: prometheus collectors and the per-function aggregator

pub mod aggregator;
pub mod prom;

pub use aggregator::{
    MetricKey, MetricRow, MetricStatus, MetricsAggregator, MetricsSink, PrometheusSink,
};
