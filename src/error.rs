/// Error types for the rotor pipeline
use crate::consumer::retry::RetryPolicy;
use crate::event::AnyEvent;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result type alias for rotor operations
pub type RotorResult<T> = std::result::Result<T, RotorError>;

/// Main error type for rotor operations
#[derive(Error, Debug)]
pub enum RotorError {
    /// Connection or function configuration cannot be turned into a chain.
    /// Fatal for the affected connection, never retried.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Connection id does not resolve in the connection store
    #[error("Unknown connection: {0}")]
    UnknownConnection(String),

    /// Incoming message could not be parsed
    #[error("Parse error: {0}")]
    Parse(String),

    /// Entity store has no value to serve
    #[error("Store '{store}' refresh failed: {message}")]
    StoreRefresh {
        /// Store name
        store: String,
        /// Last refresh error
        message: String,
    },

    /// A pipeline function failed
    #[error(transparent)]
    Function(#[from] FuncError),

    /// Message transport failed
    #[error("Kafka error: {0}")]
    Kafka(String),

    /// JSON (de)serialization failed
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// IO operation failed
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl RotorError {
    /// Whether the orchestrator should requeue the message instead of
    /// sending it straight to the dead-letter topic.
    pub fn is_retryable(&self) -> bool {
        match self {
            RotorError::Function(e) => e.is_retryable(),
            RotorError::Kafka(_) | RotorError::Io(_) | RotorError::StoreRefresh { .. } => true,
            _ => false,
        }
    }

    /// Retry policy override carried by the error, if any
    pub fn retry_policy(&self) -> Option<&RetryPolicy> {
        match self {
            RotorError::Function(e) => e.retry_policy.as_ref(),
            _ => None,
        }
    }
}

/// Classification of a function failure
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FuncErrorKind {
    /// Arbitrary failure inside a function
    #[serde(rename = "Error")]
    Error,
    /// Explicit request to retry the event later
    #[serde(rename = "RetryError")]
    Retry,
    /// Drop the event now and retry it later
    #[serde(rename = "DropRetryError")]
    DropRetry,
    /// Destination call failed (timeout, non-2xx)
    #[serde(rename = "TransportError")]
    Transport,
}

impl FuncErrorKind {
    /// Name recorded in logs and headers
    pub fn name(&self) -> &'static str {
        match self {
            FuncErrorKind::Error => "Error",
            FuncErrorKind::Retry => "RetryError",
            FuncErrorKind::DropRetry => "DropRetryError",
            FuncErrorKind::Transport => "TransportError",
        }
    }

    /// Parse the error name reported by a UDF
    pub fn from_name(name: &str) -> Self {
        match name {
            "RetryError" => FuncErrorKind::Retry,
            "DropRetryError" => FuncErrorKind::DropRetry,
            "TransportError" => FuncErrorKind::Transport,
            _ => FuncErrorKind::Error,
        }
    }
}

/// Error raised by a pipeline function
#[derive(Error, Debug, Clone, PartialEq, Serialize, Deserialize)]
#[error("{}: {message}", kind.name())]
pub struct FuncError {
    /// Failure classification
    pub kind: FuncErrorKind,
    /// Human readable message
    pub message: String,
    /// Function that raised the error
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub function_id: Option<String>,
    /// Event at the time of failure, used to resume retries
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event: Option<AnyEvent>,
    /// Policy override for this error
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_policy: Option<RetryPolicy>,
}

impl FuncError {
    /// Create an error of the given kind
    pub fn new(kind: FuncErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            function_id: None,
            event: None,
            retry_policy: None,
        }
    }

    /// Plain, non-retryable failure
    pub fn error(message: impl Into<String>) -> Self {
        Self::new(FuncErrorKind::Error, message)
    }

    /// Retry request
    pub fn retry(message: impl Into<String>) -> Self {
        Self::new(FuncErrorKind::Retry, message)
    }

    /// Drop-and-retry request
    pub fn drop_retry(message: impl Into<String>) -> Self {
        Self::new(FuncErrorKind::DropRetry, message)
    }

    /// Destination transport failure
    pub fn transport(message: impl Into<String>) -> Self {
        Self::new(FuncErrorKind::Transport, message)
    }

    /// Attach the originating function id
    pub fn with_function_id(mut self, function_id: impl Into<String>) -> Self {
        self.function_id = Some(function_id.into());
        self
    }

    /// Attach the event snapshot at failure time
    pub fn with_event(mut self, event: AnyEvent) -> Self {
        self.event = Some(event);
        self
    }

    /// Attach a retry policy override
    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = Some(policy);
        self
    }

    /// Whether the error escalates to retry/dead-letter handling
    pub fn is_retryable(&self) -> bool {
        matches!(
            self.kind,
            FuncErrorKind::Retry | FuncErrorKind::DropRetry | FuncErrorKind::Transport
        )
    }

    /// Whether the current event must be discarded
    pub fn is_drop(&self) -> bool {
        self.kind == FuncErrorKind::DropRetry
    }
}

impl From<reqwest::Error> for FuncError {
    fn from(err: reqwest::Error) -> Self {
        FuncError::transport(err.to_string())
    }
}
