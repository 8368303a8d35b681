//! Runs a chain against one event

use crate::error::{FuncError, RotorError, RotorResult};
use crate::event::{AnyEvent, EventContext, MetricsMeta, SystemContext};
use crate::events_log::EventsLogger;
use crate::functions::{
    FetchClient, FuncChain, FuncContext, FuncKind, FuncReturn, UdfKvStore,
    BUILTIN_DESTINATION_PREFIX, UDF_PREFIX,
};
use crate::metrics::prom::{FUNCTIONS_IN_FLIGHT, FUNCTION_TIME};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Which steps run on this attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ChainFilter {
    /// Every step
    All,
    /// Skip built-in transformations (retry of a failed UDF)
    UdfAndDestinationOnly,
    /// Only the destination (retry of a failed delivery)
    DestinationOnly,
}

impl ChainFilter {
    /// Filter for a retry of a failure raised by `function_id`
    pub fn from_function_id(function_id: Option<&str>) -> Self {
        match function_id {
            Some(id) if id.starts_with(UDF_PREFIX) => ChainFilter::UdfAndDestinationOnly,
            Some(id) if id.starts_with(BUILTIN_DESTINATION_PREFIX) => ChainFilter::DestinationOnly,
            _ => ChainFilter::All,
        }
    }

    fn includes(&self, kind: FuncKind) -> bool {
        match self {
            ChainFilter::All => true,
            ChainFilter::UdfAndDestinationOnly => kind != FuncKind::BuiltinTransformation,
            ChainFilter::DestinationOnly => kind == FuncKind::BuiltinDestination,
        }
    }
}

/// One function invocation
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FunctionExecRes {
    /// When the step received the event
    pub received_at: DateTime<Utc>,
    /// Chain step id
    pub function_id: String,
    /// Step kind
    #[serde(rename = "functionType")]
    pub kind: FuncKind,
    /// Identifiers of the message being processed
    pub metrics_meta: MetricsMeta,
    /// Position of the event in the step's input
    pub event_index: usize,
    /// Whether the event was discarded
    pub dropped: bool,
    /// Failure, if any
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<FuncError>,
    /// Event at the time of the failure
    #[serde(skip_serializing_if = "Option::is_none")]
    pub event: Option<AnyEvent>,
    /// Elapsed milliseconds
    pub ms: u64,
}

/// All invocations of one chain run
pub type FunctionExecLog = Vec<FunctionExecRes>;

/// Outcome of [`run_chain`]
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChainResult {
    /// Events that made it through every step
    pub events: Vec<AnyEvent>,
    /// Invocation log
    pub exec_log: FunctionExecLog,
}

/// Shared collaborators of chain runs
#[derive(Clone)]
pub struct ChainServices {
    /// HTTP client for functions
    pub fetch: FetchClient,
    /// Per-connection log
    pub logger: Arc<dyn EventsLogger>,
    /// Key-value state shared by a connection's functions
    pub store: Arc<dyn UdfKvStore>,
}

impl ChainServices {
    /// Bound for a single function call
    pub fn call_timeout(&self) -> Duration {
        self.fetch.timeout()
    }
}

/// Keeps the in-flight gauge raised for one call. Dropping it, including when
/// the surrounding future is cancelled, lowers the gauge and records the
/// elapsed time.
struct CallTimer {
    kind: &'static str,
    started: Instant,
}

impl CallTimer {
    fn start(kind: &'static str) -> Self {
        FUNCTIONS_IN_FLIGHT.with_label_values(&[kind]).inc();
        Self {
            kind,
            started: Instant::now(),
        }
    }

    fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }
}

impl Drop for CallTimer {
    fn drop(&mut self) {
        FUNCTIONS_IN_FLIGHT.with_label_values(&[self.kind]).dec();
        FUNCTION_TIME
            .with_label_values(&[self.kind])
            .observe(self.elapsed().as_secs_f64());
    }
}

/// Run every step (subject to `filter`) over the current set of events.
///
/// Each step is applied to every event produced by the previous step. A
/// failing event stops there while its siblings continue; failures are
/// recorded in the exec log and surface through [`check_error`].
pub async fn run_chain(
    chain: &FuncChain,
    event: AnyEvent,
    filter: ChainFilter,
    event_ctx: Arc<EventContext>,
    system: Option<SystemContext>,
    services: &ChainServices,
) -> ChainResult {
    let mut events = vec![event];
    let mut exec_log = FunctionExecLog::new();
    let meta = event_ctx.metrics_meta(&event_ctx.source_id);

    for func in chain.functions.iter().filter(|f| filter.includes(f.kind)) {
        let ctx = FuncContext {
            function_id: func.id.clone(),
            props: func.config.clone(),
            event: event_ctx.clone(),
            system: if func.enable_system_context {
                system.clone()
            } else {
                None
            },
            fetch: services.fetch.clone(),
            logger: services.logger.clone(),
            store: services.store.clone(),
        };

        let mut next = Vec::with_capacity(events.len());
        for (index, event) in events.into_iter().enumerate() {
            let received_at = Utc::now();
            let timer = CallTimer::start(func.kind.as_str());
            let outcome = match tokio::time::timeout(
                services.call_timeout(),
                func.exec.exec(event.clone(), &ctx),
            )
            .await
            {
                Ok(result) => result,
                Err(_) => Err(FuncError::transport(format!(
                    "function '{}' timed out after {:?}",
                    func.id,
                    services.call_timeout()
                ))),
            };
            let elapsed = timer.elapsed();
            drop(timer);

            let mut entry = FunctionExecRes {
                received_at,
                function_id: func.id.clone(),
                kind: func.kind,
                metrics_meta: meta.clone(),
                event_index: index,
                dropped: false,
                error: None,
                event: None,
                ms: elapsed.as_millis() as u64,
            };

            match outcome {
                Ok(FuncReturn::Drop) => {
                    debug!(
                        connection_id = %chain.connection_id,
                        function_id = %func.id,
                        "Event dropped"
                    );
                    entry.dropped = true;
                }
                Ok(FuncReturn::Unchanged) => next.push(event),
                Ok(FuncReturn::One(out)) => next.push(out),
                Ok(FuncReturn::Many(out)) => next.extend(out),
                Err(err) => {
                    warn!(
                        connection_id = %chain.connection_id,
                        message_id = ?event_ctx.message_id,
                        function_id = %func.id,
                        failed_function = ?err.function_id,
                        error = %err,
                        "Function failed"
                    );
                    let snapshot = err.event.clone().unwrap_or_else(|| event.clone());
                    if err.is_drop() {
                        entry.dropped = true;
                    } else if func.kind == FuncKind::UdfPipeline {
                        if let Some(partial) = &err.event {
                            next.push(partial.clone());
                        }
                    }
                    entry.event = Some(snapshot);
                    entry.error = Some(err);
                }
            }
            exec_log.push(entry);
        }

        events = next;
        if events.is_empty() {
            break;
        }
    }

    ChainResult { events, exec_log }
}

/// First retryable failure of a run, annotated with the function that
/// raised it and the event at failure time
pub fn check_error(exec_log: &FunctionExecLog) -> RotorResult<()> {
    for entry in exec_log {
        let Some(err) = &entry.error else { continue };
        if !err.is_retryable() {
            continue;
        }
        let mut err = err.clone();
        if err.function_id.is_none() {
            err.function_id = Some(entry.function_id.clone());
        }
        if err.event.is_none() {
            err.event = entry.event.clone();
        }
        return Err(RotorError::Function(err));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events_log::TracingEventsLogger;
    use crate::functions::{from_fn, Func};
    use pretty_assertions::assert_eq;
    use serde_json::{json, Value};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn func(id: &str, kind: FuncKind, f: Arc<dyn crate::functions::ChainFunction>) -> Func {
        Func {
            id: id.into(),
            kind,
            exec: f,
            config: Value::Null,
            enable_system_context: false,
        }
    }

    fn services() -> ChainServices {
        ChainServices {
            fetch: FetchClient::new(Duration::from_millis(500)),
            logger: Arc::new(TracingEventsLogger),
            store: Arc::new(crate::functions::MemoryKvStore::default()),
        }
    }

    fn set(key: &'static str) -> Arc<dyn crate::functions::ChainFunction> {
        from_fn(move |mut e, _| {
            e[key] = json!(true);
            Ok(FuncReturn::One(e))
        })
    }

    fn counting_destination(counter: Arc<AtomicUsize>) -> Func {
        func(
            "builtin.destination.test",
            FuncKind::BuiltinDestination,
            from_fn(move |_, _| {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(FuncReturn::Unchanged)
            }),
        )
    }

    async fn run(chain: &FuncChain, filter: ChainFilter) -> ChainResult {
        run_chain(
            chain,
            json!({}),
            filter,
            Arc::new(EventContext::default()),
            None,
            &services(),
        )
        .await
    }

    #[test]
    fn test_filter_from_function_id() {
        assert_eq!(ChainFilter::from_function_id(None), ChainFilter::All);
        assert_eq!(
            ChainFilter::from_function_id(Some("udf.f2")),
            ChainFilter::UdfAndDestinationOnly
        );
        assert_eq!(
            ChainFilter::from_function_id(Some("builtin.destination.webhook")),
            ChainFilter::DestinationOnly
        );
        assert_eq!(
            ChainFilter::from_function_id(Some("builtin.transformation.x")),
            ChainFilter::All
        );
    }

    #[tokio::test]
    async fn test_fan_out_reaches_destination_per_event() {
        let counter = Arc::new(AtomicUsize::new(0));
        let chain = FuncChain {
            connection_id: "c".into(),
            functions: vec![
                func(
                    "builtin.transformation.split",
                    FuncKind::BuiltinTransformation,
                    from_fn(|e, _| Ok(FuncReturn::Many(vec![e.clone(), e.clone(), e]))),
                ),
                counting_destination(counter.clone()),
            ],
        };
        let result = run(&chain, ChainFilter::All).await;
        assert_eq!(result.events.len(), 3);
        assert_eq!(counter.load(Ordering::SeqCst), 3);
        assert_eq!(result.exec_log.len(), 4);
    }

    #[tokio::test]
    async fn test_drop_stops_chain() {
        let counter = Arc::new(AtomicUsize::new(0));
        let chain = FuncChain {
            connection_id: "c".into(),
            functions: vec![
                func(
                    "builtin.transformation.drop",
                    FuncKind::BuiltinTransformation,
                    from_fn(|_, _| Ok(FuncReturn::Drop)),
                ),
                counting_destination(counter.clone()),
            ],
        };
        let result = run(&chain, ChainFilter::All).await;
        assert!(result.events.is_empty());
        assert!(result.exec_log[0].dropped);
        assert_eq!(counter.load(Ordering::SeqCst), 0);
        assert!(check_error(&result.exec_log).is_ok());
    }

    #[tokio::test]
    async fn test_filter_skips_transformations() {
        let chain = FuncChain {
            connection_id: "c".into(),
            functions: vec![
                func("builtin.transformation.a", FuncKind::BuiltinTransformation, set("a")),
                func("udf.PIPELINE", FuncKind::UdfPipeline, set("u")),
                func("builtin.destination.d", FuncKind::BuiltinDestination, set("d")),
            ],
        };
        let result = run(&chain, ChainFilter::UdfAndDestinationOnly).await;
        assert_eq!(result.events, vec![json!({"u": true, "d": true})]);

        let result = run(&chain, ChainFilter::DestinationOnly).await;
        assert_eq!(result.events, vec![json!({"d": true})]);
    }

    #[tokio::test]
    async fn test_pipeline_failure_forwards_partial_event() {
        let counter = Arc::new(AtomicUsize::new(0));
        let chain = FuncChain {
            connection_id: "c".into(),
            functions: vec![
                func(
                    "udf.PIPELINE",
                    FuncKind::UdfPipeline,
                    from_fn(|_, _| {
                        Err(FuncError::retry("later")
                            .with_function_id("udf.f2")
                            .with_event(json!({"partial": true})))
                    }),
                ),
                counting_destination(counter.clone()),
            ],
        };
        let result = run(&chain, ChainFilter::All).await;
        assert_eq!(result.events, vec![json!({"partial": true})]);
        assert_eq!(counter.load(Ordering::SeqCst), 1);

        let err = match check_error(&result.exec_log) {
            Err(RotorError::Function(e)) => e,
            other => panic!("unexpected {other:?}"),
        };
        assert_eq!(err.function_id.as_deref(), Some("udf.f2"));
        assert_eq!(err.event, Some(json!({"partial": true})));
    }

    #[tokio::test]
    async fn test_drop_retry_is_a_drop_but_retryable() {
        let counter = Arc::new(AtomicUsize::new(0));
        let chain = FuncChain {
            connection_id: "c".into(),
            functions: vec![
                func(
                    "udf.PIPELINE",
                    FuncKind::UdfPipeline,
                    from_fn(|e, _| Err(FuncError::drop_retry("not yet").with_event(e))),
                ),
                counting_destination(counter.clone()),
            ],
        };
        let result = run(&chain, ChainFilter::All).await;
        assert!(result.events.is_empty());
        assert_eq!(counter.load(Ordering::SeqCst), 0);
        assert!(result.exec_log[0].dropped);
        assert!(check_error(&result.exec_log).is_err());
    }

    #[tokio::test]
    async fn test_plain_error_is_not_retryable() {
        let chain = FuncChain {
            connection_id: "c".into(),
            functions: vec![func(
                "builtin.destination.d",
                FuncKind::BuiltinDestination,
                from_fn(|_, _| Err(FuncError::error("bad payload"))),
            )],
        };
        let result = run(&chain, ChainFilter::All).await;
        assert!(result.events.is_empty());
        assert!(result.exec_log[0].error.is_some());
        assert!(check_error(&result.exec_log).is_ok());
    }

    #[tokio::test]
    async fn test_transport_error_annotated_with_step() {
        let chain = FuncChain {
            connection_id: "c".into(),
            functions: vec![func(
                "builtin.destination.d",
                FuncKind::BuiltinDestination,
                from_fn(|_, _| Err(FuncError::transport("503"))),
            )],
        };
        let result = run(&chain, ChainFilter::All).await;
        let err = match check_error(&result.exec_log) {
            Err(RotorError::Function(e)) => e,
            other => panic!("unexpected {other:?}"),
        };
        assert_eq!(err.function_id.as_deref(), Some("builtin.destination.d"));
        assert_eq!(err.event, Some(json!({})));
    }

    #[tokio::test]
    async fn test_cancelled_call_releases_in_flight_gauge() {
        const LABEL: &str = "cancelled-call";
        let gauge = FUNCTIONS_IN_FLIGHT.with_label_values(&[LABEL]);
        let observed = FUNCTION_TIME.with_label_values(&[LABEL]).get_sample_count();

        let call = async {
            let _timer = CallTimer::start(LABEL);
            tokio::time::sleep(Duration::from_millis(500)).await;
        };
        assert!(tokio::time::timeout(Duration::from_millis(20), call)
            .await
            .is_err());

        assert_eq!(gauge.get(), 0);
        assert_eq!(
            FUNCTION_TIME.with_label_values(&[LABEL]).get_sample_count(),
            observed + 1
        );
    }
}
