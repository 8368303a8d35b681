//! Pipeline functions
//!
//! Every step of a chain implements [`ChainFunction`]. Steps come in three
//! kinds, resolved once when the chain is built:
//! - built-in transformations (`builtin.transformation.<name>`)
//! - the UDF pipeline (`udf.PIPELINE`) wrapping all user-defined functions
//! - the terminal destination (`builtin.destination.<type>` or the bulker)

pub mod builtin;
pub mod bulker;
pub mod fetch;
pub mod kv;
pub mod registry;
pub mod udf;
#[cfg(feature = "wasm")]
pub mod wasm;

pub use fetch::{FetchClient, FetchResponse};
pub use kv::{MemoryKvStore, UdfKvStore};
pub use registry::FunctionRegistry;
pub use udf::{UdfCache, UdfPipelineFunction, UdfRuntime, UdfSource};

use crate::error::FuncError;
use crate::event::{AnyEvent, EventContext, SystemContext};
use crate::events_log::EventsLogger;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::sync::Arc;

/// Prefix of user-defined function references
pub const UDF_PREFIX: &str = "udf.";
/// Id of the synthetic step wrapping all UDFs
pub const UDF_PIPELINE_ID: &str = "udf.PIPELINE";
/// Prefix of built-in transformations
pub const BUILTIN_TRANSFORMATION_PREFIX: &str = "builtin.transformation.";
/// Prefix of built-in destinations
pub const BUILTIN_DESTINATION_PREFIX: &str = "builtin.destination.";
/// Id of the warehouse loader function
pub const BULKER_FUNCTION_ID: &str = "builtin.destination.bulker";

/// Kind of a chain step
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FuncKind {
    /// `builtin.transformation.*`
    BuiltinTransformation,
    /// `udf.PIPELINE`
    UdfPipeline,
    /// `builtin.destination.*`, including the bulker
    BuiltinDestination,
}

impl FuncKind {
    /// Label used in metrics
    pub fn as_str(&self) -> &'static str {
        match self {
            FuncKind::BuiltinTransformation => "transformation",
            FuncKind::UdfPipeline => "udf",
            FuncKind::BuiltinDestination => "destination",
        }
    }

    /// Classify a function id by its prefix
    pub fn of_function_id(id: &str) -> Option<Self> {
        if id.starts_with(BUILTIN_DESTINATION_PREFIX) {
            Some(FuncKind::BuiltinDestination)
        } else if id.starts_with(BUILTIN_TRANSFORMATION_PREFIX) {
            Some(FuncKind::BuiltinTransformation)
        } else if id.starts_with(UDF_PREFIX) {
            Some(FuncKind::UdfPipeline)
        } else {
            None
        }
    }
}

/// What a function did with an event
#[derive(Debug, Clone, PartialEq)]
pub enum FuncReturn {
    /// Discard the event
    Drop,
    /// Replace the event with several events
    Many(Vec<AnyEvent>),
    /// Replace the event
    One(AnyEvent),
    /// Keep the event as it was passed in
    Unchanged,
}

impl FuncReturn {
    /// Interpret a JSON result the way UDFs report it: `"drop"`, an array,
    /// an object, or null for "unchanged".
    pub fn from_json(value: Value) -> Self {
        match value {
            Value::Null => FuncReturn::Unchanged,
            Value::String(s) if s == "drop" => FuncReturn::Drop,
            Value::Array(events) => FuncReturn::Many(events),
            other => FuncReturn::One(other),
        }
    }
}

/// Everything a function may use besides the event itself
#[derive(Clone)]
pub struct FuncContext {
    /// Id of the running function
    pub function_id: String,
    /// Function configuration / options
    pub props: Value,
    /// Per-message context
    pub event: Arc<EventContext>,
    /// Only set for functions with `enable_system_context`
    pub system: Option<SystemContext>,
    /// Outbound HTTP, bounded by the fetch timeout
    pub fetch: FetchClient,
    /// Per-connection events log
    pub logger: Arc<dyn EventsLogger>,
    /// Per-connection key-value state
    pub store: Arc<dyn UdfKvStore>,
}

impl FuncContext {
    /// Same context for another function
    pub fn for_function(&self, function_id: impl Into<String>, props: Value) -> Self {
        Self {
            function_id: function_id.into(),
            props,
            ..self.clone()
        }
    }
}

impl fmt::Debug for FuncContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FuncContext")
            .field("function_id", &self.function_id)
            .field("connection_id", &self.event.connection_id)
            .finish()
    }
}

/// A chain step
#[async_trait]
pub trait ChainFunction: Send + Sync {
    /// Process one event
    async fn exec(&self, event: AnyEvent, ctx: &FuncContext) -> Result<FuncReturn, FuncError>;
}

/// Adapter turning a synchronous closure into a [`ChainFunction`]
pub struct FnFunction<F>(F);

#[async_trait]
impl<F> ChainFunction for FnFunction<F>
where
    F: Fn(AnyEvent, &FuncContext) -> Result<FuncReturn, FuncError> + Send + Sync,
{
    async fn exec(&self, event: AnyEvent, ctx: &FuncContext) -> Result<FuncReturn, FuncError> {
        (self.0)(event, ctx)
    }
}

/// Wrap a closure as a chain function
pub fn from_fn<F>(f: F) -> Arc<dyn ChainFunction>
where
    F: Fn(AnyEvent, &FuncContext) -> Result<FuncReturn, FuncError> + Send + Sync + 'static,
{
    Arc::new(FnFunction(f))
}

/// One resolved chain step
#[derive(Clone)]
pub struct Func {
    /// Function id
    pub id: String,
    /// Step kind
    pub kind: FuncKind,
    /// Implementation
    pub exec: Arc<dyn ChainFunction>,
    /// Configuration passed as `ctx.props`
    pub config: Value,
    /// Whether the function receives the [`SystemContext`]
    pub enable_system_context: bool,
}

impl fmt::Debug for Func {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Func")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("enable_system_context", &self.enable_system_context)
            .finish()
    }
}

/// Ordered steps built for one connection
#[derive(Debug, Clone)]
pub struct FuncChain {
    /// Connection the chain belongs to
    pub connection_id: String,
    /// Steps in execution order; the last one is the destination
    pub functions: Vec<Func>,
}

impl FuncChain {
    /// Ids of all steps
    pub fn ids(&self) -> Vec<&str> {
        self.functions.iter().map(|f| f.id.as_str()).collect()
    }

    /// Terminal destination step
    pub fn destination(&self) -> Option<&Func> {
        self.functions.last()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_kind_of_function_id() {
        assert_eq!(
            FuncKind::of_function_id("builtin.destination.webhook"),
            Some(FuncKind::BuiltinDestination)
        );
        assert_eq!(
            FuncKind::of_function_id(BULKER_FUNCTION_ID),
            Some(FuncKind::BuiltinDestination)
        );
        assert_eq!(
            FuncKind::of_function_id("builtin.transformation.bot-filter"),
            Some(FuncKind::BuiltinTransformation)
        );
        assert_eq!(FuncKind::of_function_id("udf.abc"), Some(FuncKind::UdfPipeline));
        assert_eq!(FuncKind::of_function_id("something"), None);
    }

    #[test]
    fn test_return_from_json() {
        assert_eq!(FuncReturn::from_json(Value::Null), FuncReturn::Unchanged);
        assert_eq!(FuncReturn::from_json(json!("drop")), FuncReturn::Drop);
        assert_eq!(
            FuncReturn::from_json(json!([{"a": 1}, {"a": 2}])),
            FuncReturn::Many(vec![json!({"a": 1}), json!({"a": 2})])
        );
        assert_eq!(
            FuncReturn::from_json(json!({"a": 1})),
            FuncReturn::One(json!({"a": 1}))
        );
    }
}
