//! Per-message entry point: parse, enrich, resolve the chain and run it

use crate::chain::{
    check_error, run_chain, ChainCache, ChainFilter, ChainResult, ChainServices,
    FunctionChainBuilder,
};
use crate::enrich::{ua, GeoResolver};
use crate::error::{FuncError, RotorError, RotorResult};
use crate::event::{
    context_get, context_mut, AnyEvent, EventContext, Geo, IngestMessage, SystemContext,
};
use crate::events_log::LogLevel;
use crate::functions::UDF_PREFIX;
use crate::metrics::MetricsAggregator;
use crate::store::entities::Connection;
use crate::store::ObjectStore;
use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Map, Value};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Workspace-level profile builders, run on the first attempt only
#[async_trait]
pub trait ProfileBuilderRunner: Send + Sync {
    /// Feed one event to the workspace's profile builders
    async fn run(
        &self,
        workspace_id: &str,
        event: &AnyEvent,
        ctx: &EventContext,
    ) -> anyhow::Result<()>;
}

/// Workspaces whose profile builders already saw a message. Clones share
/// the set, so the per-connection copies of a fanned-out message feed each
/// workspace's profile builders once.
#[derive(Debug, Clone, Default)]
pub struct ProfiledWorkspaces(Arc<Mutex<HashSet<String>>>);

impl ProfiledWorkspaces {
    /// True for the first claim of `workspace_id`
    pub fn claim(&self, workspace_id: &str) -> bool {
        self.0.lock().insert(workspace_id.to_string())
    }
}

/// One message to dispatch
#[derive(Debug, Clone)]
pub struct DispatchRequest {
    /// Parsed message
    pub message: IngestMessage,
    /// Connection to use instead of the one embedded in the message
    pub connection_id: Option<String>,
    /// Previous attempts
    pub retries: u32,
    /// Function that failed on the previous attempt
    pub function_id: Option<String>,
    /// Shared with every clone of this request
    pub profiled: ProfiledWorkspaces,
}

impl DispatchRequest {
    /// Parse a raw message body
    pub fn parse(body: &[u8]) -> RotorResult<Self> {
        let message = IngestMessage::parse(body).map_err(|e| RotorError::Parse(e.to_string()))?;
        Ok(Self {
            message,
            connection_id: None,
            retries: 0,
            function_id: None,
            profiled: ProfiledWorkspaces::default(),
        })
    }

    /// Request for a bare event on a given connection
    pub fn for_event(connection_id: impl Into<String>, event: AnyEvent) -> Self {
        Self {
            message: IngestMessage {
                connection_id: None,
                message_id: event.get("messageId").and_then(Value::as_str).map(str::to_string),
                message_created: None,
                http_headers: HashMap::new(),
                http_payload: event,
                geo: None,
            },
            connection_id: Some(connection_id.into()),
            retries: 0,
            function_id: None,
            profiled: ProfiledWorkspaces::default(),
        }
    }

    /// Override the connection
    pub fn with_connection_id(mut self, connection_id: impl Into<String>) -> Self {
        self.connection_id = Some(connection_id.into());
        self
    }

    /// Set the attempt counter
    pub fn with_retries(mut self, retries: u32) -> Self {
        self.retries = retries;
        self
    }

    /// Set the function that failed previously
    pub fn with_function_id(mut self, function_id: Option<String>) -> Self {
        self.function_id = function_id;
        self
    }
}

/// Chain output together with the error to escalate, if any
#[derive(Debug, Clone)]
pub struct DispatchOutcome {
    /// Connection the message went through
    pub connection_id: String,
    /// Chain output
    pub result: ChainResult,
    /// Retryable failure found in the exec log
    pub error: Option<FuncError>,
}

/// Runs messages through their connection's chain
pub struct MessageDispatcher {
    connections: Arc<dyn ObjectStore<Connection>>,
    builder: Arc<FunctionChainBuilder>,
    chains: ChainCache,
    services: ChainServices,
    geo: Option<Arc<dyn GeoResolver>>,
    profile_builders: Option<Arc<dyn ProfileBuilderRunner>>,
    metrics: Option<Arc<MetricsAggregator>>,
}

impl MessageDispatcher {
    /// Dispatcher caching built chains for `chain_ttl`
    pub fn new(
        connections: Arc<dyn ObjectStore<Connection>>,
        builder: Arc<FunctionChainBuilder>,
        services: ChainServices,
        chain_ttl: Duration,
    ) -> Self {
        Self {
            connections,
            builder,
            chains: ChainCache::new(chain_ttl),
            services,
            geo: None,
            profile_builders: None,
            metrics: None,
        }
    }

    /// Resolve `context.geo` with `resolver`
    pub fn with_geo(mut self, resolver: Arc<dyn GeoResolver>) -> Self {
        self.geo = Some(resolver);
        self
    }

    /// Run profile builders on first attempts
    pub fn with_profile_builders(mut self, runner: Arc<dyn ProfileBuilderRunner>) -> Self {
        self.profile_builders = Some(runner);
        self
    }

    /// Report exec logs to `aggregator`
    pub fn with_metrics(mut self, aggregator: Arc<MetricsAggregator>) -> Self {
        self.metrics = Some(aggregator);
        self
    }

    /// Dispatch and fail with the first retryable function error
    pub async fn dispatch(&self, request: DispatchRequest) -> RotorResult<ChainResult> {
        let outcome = self.run(request).await?;
        match outcome.error {
            Some(err) => Err(RotorError::Function(err)),
            None => Ok(outcome.result),
        }
    }

    /// Dispatch and return the chain output even when a function failed
    pub async fn run(&self, request: DispatchRequest) -> RotorResult<DispatchOutcome> {
        let DispatchRequest {
            message,
            connection_id,
            retries,
            function_id,
            profiled,
        } = request;

        let connection_id = connection_id
            .or_else(|| message.connection_id.clone())
            .ok_or_else(|| RotorError::Parse("message has no connection id".into()))?;
        let connection = self
            .connections
            .get_object(&connection_id)
            .ok_or_else(|| RotorError::UnknownConnection(connection_id.clone()))?;

        let headers: HashMap<String, String> = message
            .http_headers
            .iter()
            .map(|(k, v)| (k.to_ascii_lowercase(), v.clone()))
            .collect();
        let mut event = message.http_payload;
        let geo = self.enrich(&mut event, &headers, message.geo).await;

        let event_ctx = Arc::new(EventContext {
            message_id: message.message_id,
            headers,
            geo,
            retries,
            source_id: connection.stream_id.clone(),
            source_name: connection.stream_name.clone(),
            destination_id: connection.destination_id.clone(),
            destination_type: connection.destination_type.clone(),
            connection_id: connection.id.clone(),
            workspace_id: connection.workspace_id.clone(),
            resume_function_id: function_id
                .clone()
                .filter(|id| id.starts_with(UDF_PREFIX)),
        });
        let meta = event_ctx.metrics_meta(&connection.stream_id);

        let chain = self.chains.get_or_build(&self.builder, &connection).await?;

        if retries == 0 && profiled.claim(&connection.workspace_id) {
            if let Some(runner) = &self.profile_builders {
                if let Err(e) = runner.run(&connection.workspace_id, &event, &event_ctx).await {
                    warn!(connection_id = %connection.id, error = %e, "Profile builders failed");
                }
            }
        }

        let filter = ChainFilter::from_function_id(function_id.as_deref());
        let system = SystemContext {
            destination_credentials: connection.credentials.clone(),
            extra: Map::new(),
        };
        let result = run_chain(
            &chain,
            event,
            filter,
            event_ctx.clone(),
            Some(system),
            &self.services,
        )
        .await;

        if let Some(metrics) = &self.metrics {
            metrics.push(&meta, &result.exec_log).await;
        }

        let failed = result.exec_log.iter().any(|e| e.error.is_some());
        self.services.logger.log(
            &connection.id,
            if failed { LogLevel::Error } else { LogLevel::Info },
            json!({
                "messageId": event_ctx.message_id,
                "retries": retries,
                "filter": filter,
                "events": result.events.len(),
                "execLog": result.exec_log,
            }),
        );
        debug!(
            connection_id = %connection.id,
            retries,
            events = result.events.len(),
            "Dispatched message"
        );

        let error = match check_error(&result.exec_log) {
            Err(RotorError::Function(err)) => Some(err),
            Err(other) => return Err(other),
            Ok(()) => None,
        };
        Ok(DispatchOutcome {
            connection_id: connection.id,
            result,
            error,
        })
    }

    /// Fill `context.geo` and `context.ua`; returns the geo used
    async fn enrich(
        &self,
        event: &mut AnyEvent,
        headers: &HashMap<String, String>,
        upstream_geo: Option<Geo>,
    ) -> Option<Geo> {
        let existing_geo = context_get(event, "geo")
            .cloned()
            .and_then(|v| serde_json::from_value::<Geo>(v).ok());
        let geo = match existing_geo {
            Some(geo) => Some(geo),
            None => match upstream_geo {
                Some(geo) => Some(geo),
                None => self.resolve_geo(event, headers).await,
            },
        };

        let user_agent = context_get(event, "userAgent")
            .and_then(Value::as_str)
            .map(str::to_string)
            .or_else(|| headers.get("user-agent").cloned());
        let has_ua = context_get(event, "ua").is_some();

        if let Some(ctx) = context_mut(event) {
            if let Some(geo) = &geo {
                if !ctx.contains_key("geo") {
                    if let Ok(value) = serde_json::to_value(geo) {
                        ctx.insert("geo".into(), value);
                    }
                }
            }
            if let (false, Some(raw)) = (has_ua, user_agent) {
                if let Ok(value) = serde_json::to_value(ua::parse(&raw)) {
                    ctx.insert("ua".into(), value);
                }
            }
        }
        geo
    }

    async fn resolve_geo(
        &self,
        event: &AnyEvent,
        headers: &HashMap<String, String>,
    ) -> Option<Geo> {
        let resolver = self.geo.as_ref()?;
        let ip = context_get(event, "ip")
            .and_then(Value::as_str)
            .map(str::to_string)
            .or_else(|| headers.get("x-real-ip").cloned())
            .or_else(|| {
                headers
                    .get("x-forwarded-for")
                    .and_then(|v| v.split(',').next())
                    .map(|v| v.trim().to_string())
            })?;
        match resolver.resolve(&ip).await {
            Ok(geo) => geo,
            Err(e) => {
                warn!(ip = %ip, error = %e, "Geo lookup failed");
                None
            }
        }
    }
}
