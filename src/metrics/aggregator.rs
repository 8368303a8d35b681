//! Buffered per-function event counts

use super::prom::FUNCTION_EVENTS;
use crate::chain::executor::{FunctionExecLog, FunctionExecRes};
use crate::event::MetricsMeta;
use crate::functions::FuncKind;
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Outcome of one invocation as reported in metrics
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MetricStatus {
    /// Destination accepted the event
    Success,
    /// Transformation completed
    Processed,
    /// Non-retryable failure
    Error,
    /// Retryable failure
    RetryError,
    /// Event discarded
    Dropped,
}

impl MetricStatus {
    /// Label value
    pub fn as_str(&self) -> &'static str {
        match self {
            MetricStatus::Success => "success",
            MetricStatus::Processed => "processed",
            MetricStatus::Error => "error",
            MetricStatus::RetryError => "retry_error",
            MetricStatus::Dropped => "dropped",
        }
    }

    /// Status of one exec-log entry
    pub fn of(entry: &FunctionExecRes) -> Self {
        match &entry.error {
            Some(e) if e.is_retryable() => MetricStatus::RetryError,
            Some(_) => MetricStatus::Error,
            None if entry.dropped => MetricStatus::Dropped,
            None if entry.kind == FuncKind::BuiltinDestination => MetricStatus::Success,
            None => MetricStatus::Processed,
        }
    }
}

/// Grouping key of aggregated counts
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricKey {
    /// Workspace id
    pub workspace_id: String,
    /// Source stream id
    pub stream_id: String,
    /// Destination id
    pub destination_id: String,
    /// Connection id
    pub connection_id: String,
    /// Chain step
    pub function_id: String,
    /// Outcome
    pub status: MetricStatus,
}

/// Summed count for one key
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MetricRow {
    /// Grouping key
    #[serde(flatten)]
    pub key: MetricKey,
    /// Number of invocations
    pub events: u64,
}

/// Destination of flushed rows
#[async_trait]
pub trait MetricsSink: Send + Sync {
    /// Write one flush worth of rows
    async fn write(&self, rows: Vec<MetricRow>) -> anyhow::Result<()>;
}

/// Sink adding rows to the `rotor_function_events_total` counter
#[derive(Debug, Default)]
pub struct PrometheusSink;

#[async_trait]
impl MetricsSink for PrometheusSink {
    async fn write(&self, rows: Vec<MetricRow>) -> anyhow::Result<()> {
        for row in rows {
            FUNCTION_EVENTS
                .with_label_values(&[
                    row.key.workspace_id.as_str(),
                    row.key.connection_id.as_str(),
                    row.key.function_id.as_str(),
                    row.key.status.as_str(),
                ])
                .inc_by(row.events);
        }
        Ok(())
    }
}

/// Collects one key per exec-log entry and writes summed rows to a
/// [`MetricsSink`] on a timer or when the buffer is full
pub struct MetricsAggregator {
    buffer: Mutex<Vec<MetricKey>>,
    sink: Arc<dyn MetricsSink>,
    max_buffer: usize,
}

impl MetricsAggregator {
    /// Aggregator flushing at `max_buffer` entries
    pub fn new(sink: Arc<dyn MetricsSink>, max_buffer: usize) -> Arc<Self> {
        Arc::new(Self {
            buffer: Mutex::new(Vec::new()),
            sink,
            max_buffer: max_buffer.max(1),
        })
    }

    /// Flush every `interval` until `cancel` fires, then flush once more
    pub fn start(
        self: &Arc<Self>,
        interval: Duration,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        let aggregator = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        aggregator.flush().await;
                    }
                }
            }
            aggregator.flush().await;
            debug!("Metrics aggregator stopped");
        })
    }

    /// Record a chain run
    pub async fn push(&self, meta: &MetricsMeta, exec_log: &FunctionExecLog) {
        let full = {
            let mut buffer = self.buffer.lock();
            buffer.extend(exec_log.iter().map(|entry| MetricKey {
                workspace_id: meta.workspace_id.clone(),
                stream_id: meta.stream_id.clone(),
                destination_id: meta.destination_id.clone(),
                connection_id: meta.connection_id.clone(),
                function_id: entry.function_id.clone(),
                status: MetricStatus::of(entry),
            }));
            buffer.len() >= self.max_buffer
        };
        if full {
            self.flush().await;
        }
    }

    /// Entries waiting for the next flush
    pub fn pending(&self) -> usize {
        self.buffer.lock().len()
    }

    /// Write buffered entries; returns the number of rows written
    pub async fn flush(&self) -> usize {
        let keys = std::mem::take(&mut *self.buffer.lock());
        if keys.is_empty() {
            return 0;
        }
        let mut counts: HashMap<MetricKey, u64> = HashMap::new();
        for key in keys {
            *counts.entry(key).or_default() += 1;
        }
        let rows: Vec<MetricRow> = counts
            .into_iter()
            .map(|(key, events)| MetricRow { key, events })
            .collect();
        let written = rows.len();
        if let Err(e) = self.sink.write(rows).await {
            warn!(error = %e, rows = written, "Failed to write metrics");
            return 0;
        }
        written
    }
}
