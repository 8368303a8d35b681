//! Per-connection events log
//!
//! Functions and the dispatcher report what happened to each event of a
//! connection. The storage behind it is an external collaborator; the default
//! logger forwards entries to `tracing`.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, error, info, warn};

/// Severity of an events-log entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    /// Verbose
    Debug,
    /// Normal processing
    Info,
    /// Recoverable problem
    Warn,
    /// Failure
    Error,
}

impl LogLevel {
    /// Parse the numeric level used by the UDF host interface
    pub fn from_code(code: i32) -> Self {
        match code {
            0 => LogLevel::Debug,
            1 => LogLevel::Info,
            2 => LogLevel::Warn,
            _ => LogLevel::Error,
        }
    }
}

/// Sink for per-connection log entries
pub trait EventsLogger: Send + Sync {
    /// Record one entry
    fn log(&self, connection_id: &str, level: LogLevel, payload: Value);
}

/// Logger writing entries as structured `tracing` events
#[derive(Debug, Default, Clone)]
pub struct TracingEventsLogger;

impl EventsLogger for TracingEventsLogger {
    fn log(&self, connection_id: &str, level: LogLevel, payload: Value) {
        match level {
            LogLevel::Debug => debug!(connection_id, %payload, "events log"),
            LogLevel::Info => info!(connection_id, %payload, "events log"),
            LogLevel::Warn => warn!(connection_id, %payload, "events log"),
            LogLevel::Error => error!(connection_id, %payload, "events log"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_level_codes() {
        assert_eq!(LogLevel::from_code(0), LogLevel::Debug);
        assert_eq!(LogLevel::from_code(2), LogLevel::Warn);
        assert_eq!(LogLevel::from_code(42), LogLevel::Error);
    }
}
