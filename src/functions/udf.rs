//! User-defined functions
//!
//! All UDFs of a connection run inside one compiled unit ([`UdfUnit`]) that
//! the chain sees as a single `udf.PIPELINE` step. Units are compiled by a
//! pluggable [`UdfRuntime`] and cached per connection in [`UdfCache`],
//! invalidated by a hash over the functions' code hashes.

use super::{ChainFunction, FuncContext, FuncReturn, UDF_PREFIX};
use crate::error::FuncError;
use crate::event::AnyEvent;
use crate::store::entities::FunctionConfig;
use async_trait::async_trait;
use moka::future::Cache;
use moka::notification::RemovalCause;
use moka::ops::compute::Op;
use parking_lot::RwLock;
use serde_json::Value;
use siphasher::sip::SipHasher13;
use std::fmt;
use std::hash::Hasher;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

/// Errors of a compiled unit
#[derive(Error, Debug, Clone, PartialEq)]
pub enum UdfError {
    /// The unit was closed while a caller still held it
    #[error("UDF unit is disposed")]
    Disposed,

    /// A function of the pipeline failed
    #[error(transparent)]
    Function(#[from] FuncError),
}

impl From<UdfError> for FuncError {
    fn from(err: UdfError) -> Self {
        match err {
            UdfError::Function(e) => e,
            UdfError::Disposed => FuncError::error("UDF unit is disposed"),
        }
    }
}

/// Compiles tenant code into callable functions
#[async_trait]
pub trait UdfRuntime: Send + Sync {
    /// Compile one function
    async fn compile(&self, function: &FunctionConfig) -> anyhow::Result<Arc<dyn ChainFunction>>;
}

/// Code of one `udf.*` reference, or the reason it could not be resolved
#[derive(Debug, Clone)]
pub enum UdfSourceKind {
    /// Resolved function
    Code(FunctionConfig),
    /// Missing or foreign function; always fails
    Unresolved(String),
}

/// One UDF of a connection, in declared order
#[derive(Debug, Clone)]
pub struct UdfSource {
    /// Full id, `udf.<functionId>`
    pub id: String,
    /// Function options from the connection
    pub options: Value,
    /// Code or resolution failure
    pub kind: UdfSourceKind,
}

impl UdfSource {
    /// Resolved function
    pub fn code(function: FunctionConfig, options: Value) -> Self {
        Self {
            id: format!("{UDF_PREFIX}{}", function.id),
            options,
            kind: UdfSourceKind::Code(function),
        }
    }

    /// Reference that could not be resolved
    pub fn unresolved(function_id: &str, message: impl Into<String>) -> Self {
        Self {
            id: format!("{UDF_PREFIX}{function_id}"),
            options: Value::Null,
            kind: UdfSourceKind::Unresolved(message.into()),
        }
    }

    /// Hash contributed to the pipeline hash
    pub fn code_hash(&self) -> &str {
        match &self.kind {
            UdfSourceKind::Code(f) => &f.code_hash,
            UdfSourceKind::Unresolved(_) => "unresolved",
        }
    }
}

/// Hash over the ordered code hashes of a pipeline
pub fn pipeline_hash(sources: &[UdfSource]) -> u64 {
    let mut hasher = SipHasher13::new();
    for source in sources {
        hasher.write(source.id.as_bytes());
        hasher.write_u8(0);
        hasher.write(source.code_hash().as_bytes());
        hasher.write_u8(0xff);
    }
    hasher.finish()
}

/// Stand-in for a UDF that cannot run
struct FailingFunction {
    message: String,
}

#[async_trait]
impl ChainFunction for FailingFunction {
    async fn exec(&self, _event: AnyEvent, _ctx: &FuncContext) -> Result<FuncReturn, FuncError> {
        Err(FuncError::error(self.message.clone()))
    }
}

struct CompiledUdf {
    id: String,
    options: Value,
    function: Arc<dyn ChainFunction>,
}

/// Compiled UDF pipeline of one connection
pub struct UdfUnit {
    connection_id: String,
    hash: u64,
    steps: RwLock<Option<Arc<Vec<CompiledUdf>>>>,
}

impl UdfUnit {
    /// Invalidation hash the unit was compiled for
    pub fn hash(&self) -> u64 {
        self.hash
    }

    /// Ids of the functions in the unit
    pub fn function_ids(&self) -> Vec<String> {
        self.steps
            .read()
            .as_ref()
            .map(|steps| steps.iter().map(|s| s.id.clone()).collect())
            .unwrap_or_default()
    }

    /// Release the compiled functions. Later runs fail with
    /// [`UdfError::Disposed`].
    pub fn close(&self) {
        if self.steps.write().take().is_some() {
            debug!(connection_id = %self.connection_id, "Closed UDF unit");
        }
    }

    /// Whether [`close`](Self::close) was called
    pub fn is_closed(&self) -> bool {
        self.steps.read().is_none()
    }

    /// Run the pipeline, starting at `ctx.event.resume_function_id` when it
    /// names a function of this unit. A failure carries the failing function
    /// id and the event it was given.
    pub async fn run(&self, event: AnyEvent, ctx: &FuncContext) -> Result<FuncReturn, UdfError> {
        let steps = self.steps.read().clone().ok_or(UdfError::Disposed)?;
        let start = ctx
            .event
            .resume_function_id
            .as_deref()
            .and_then(|resume| steps.iter().position(|s| s.id == resume))
            .unwrap_or(0);

        let mut events = vec![event];
        for step in &steps[start..] {
            let step_ctx = ctx.for_function(step.id.clone(), step.options.clone());
            let mut next = Vec::with_capacity(events.len());
            for event in events {
                match step.function.exec(event.clone(), &step_ctx).await {
                    Ok(FuncReturn::Drop) => {}
                    Ok(FuncReturn::Unchanged) => next.push(event),
                    Ok(FuncReturn::One(out)) => next.push(out),
                    Ok(FuncReturn::Many(out)) => next.extend(out),
                    Err(e) => {
                        let e = if e.function_id.is_none() {
                            e.with_function_id(step.id.clone())
                        } else {
                            e
                        };
                        let e = if e.event.is_none() { e.with_event(event) } else { e };
                        return Err(UdfError::Function(e));
                    }
                }
            }
            if next.is_empty() {
                return Ok(FuncReturn::Drop);
            }
            events = next;
        }

        Ok(match events.len() {
            1 => events.pop().map(FuncReturn::One).unwrap_or(FuncReturn::Drop),
            _ => FuncReturn::Many(events),
        })
    }
}

impl fmt::Debug for UdfUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UdfUnit")
            .field("connection_id", &self.connection_id)
            .field("hash", &self.hash)
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Per-connection cache of compiled units with sliding expiry.
///
/// A rebuild compiles outside the cache, then re-checks the hash atomically
/// before installing; when another task already installed a unit for the
/// same hash, the fresh one is closed and the installed one returned. A
/// replaced unit stays usable for `grace_period` before it is closed.
pub struct UdfCache {
    runtime: Arc<dyn UdfRuntime>,
    entries: Cache<String, Arc<UdfUnit>>,
    grace_period: Duration,
}

impl UdfCache {
    /// Cache with a time-to-idle of `ttl`
    pub fn new(runtime: Arc<dyn UdfRuntime>, ttl: Duration, grace_period: Duration) -> Self {
        let entries = Cache::builder()
            .time_to_idle(ttl)
            .eviction_listener(|key: Arc<String>, unit: Arc<UdfUnit>, cause| {
                if !matches!(cause, RemovalCause::Replaced) {
                    debug!(connection_id = %key, ?cause, "Evicted UDF unit");
                    unit.close();
                }
            })
            .build();
        Self {
            runtime,
            entries,
            grace_period,
        }
    }

    /// Current unit for the connection when its hash matches, else a freshly
    /// compiled one
    pub async fn get_or_compile(&self, connection_id: &str, sources: &[UdfSource]) -> Arc<UdfUnit> {
        let hash = pipeline_hash(sources);
        if let Some(unit) = self.entries.get(connection_id).await {
            if unit.hash == hash && !unit.is_closed() {
                return unit;
            }
        }
        self.rebuild(connection_id, sources, hash).await
    }

    /// Compile and install a new unit unless a live one with the same hash
    /// is already installed
    pub async fn recompile(&self, connection_id: &str, sources: &[UdfSource]) -> Arc<UdfUnit> {
        self.rebuild(connection_id, sources, pipeline_hash(sources)).await
    }

    /// Number of cached units
    pub fn entry_count(&self) -> u64 {
        self.entries.entry_count()
    }

    async fn rebuild(&self, connection_id: &str, sources: &[UdfSource], hash: u64) -> Arc<UdfUnit> {
        let unit = Arc::new(self.compile(connection_id, sources, hash).await);

        let mut installed = None;
        let mut replaced = None;
        let candidate = unit.clone();
        self.entries
            .entry(connection_id.to_string())
            .and_compute_with(|existing| {
                let op = match existing.map(|e| e.into_value()) {
                    Some(current) if current.hash == hash && !current.is_closed() => {
                        installed = Some(current);
                        Op::Nop
                    }
                    previous => {
                        replaced = previous;
                        Op::Put(candidate)
                    }
                };
                std::future::ready(op)
            })
            .await;

        if let Some(current) = installed {
            unit.close();
            return current;
        }
        if let Some(previous) = replaced {
            self.retire(previous);
        }
        info!(
            connection_id,
            functions = sources.len(),
            hash = format_args!("{hash:016x}"),
            "Compiled UDF unit"
        );
        unit
    }

    async fn compile(&self, connection_id: &str, sources: &[UdfSource], hash: u64) -> UdfUnit {
        let mut steps = Vec::with_capacity(sources.len());
        for source in sources {
            let function: Arc<dyn ChainFunction> = match &source.kind {
                UdfSourceKind::Code(config) => match self.runtime.compile(config).await {
                    Ok(f) => f,
                    Err(e) => {
                        warn!(
                            connection_id,
                            function_id = %source.id,
                            error = %e,
                            "Failed to compile UDF"
                        );
                        Arc::new(FailingFunction {
                            message: format!("failed to compile function '{}': {e:#}", source.id),
                        })
                    }
                },
                UdfSourceKind::Unresolved(message) => Arc::new(FailingFunction {
                    message: message.clone(),
                }),
            };
            steps.push(CompiledUdf {
                id: source.id.clone(),
                options: source.options.clone(),
                function,
            });
        }
        UdfUnit {
            connection_id: connection_id.to_string(),
            hash,
            steps: RwLock::new(Some(Arc::new(steps))),
        }
    }

    fn retire(&self, unit: Arc<UdfUnit>) {
        if self.grace_period.is_zero() {
            unit.close();
            return;
        }
        let grace = self.grace_period;
        tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            unit.close();
        });
    }
}

impl fmt::Debug for UdfCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UdfCache")
            .field("entries", &self.entries.entry_count())
            .field("grace_period", &self.grace_period)
            .finish()
    }
}

/// The `udf.PIPELINE` chain step
pub struct UdfPipelineFunction {
    connection_id: String,
    sources: Arc<Vec<UdfSource>>,
    cache: Arc<UdfCache>,
}

impl UdfPipelineFunction {
    /// Pipeline over `sources` backed by `cache`
    pub fn new(
        connection_id: impl Into<String>,
        sources: Vec<UdfSource>,
        cache: Arc<UdfCache>,
    ) -> Self {
        Self {
            connection_id: connection_id.into(),
            sources: Arc::new(sources),
            cache,
        }
    }

    /// Functions of the pipeline
    pub fn sources(&self) -> &[UdfSource] {
        &self.sources
    }
}

#[async_trait]
impl ChainFunction for UdfPipelineFunction {
    async fn exec(&self, event: AnyEvent, ctx: &FuncContext) -> Result<FuncReturn, FuncError> {
        let unit = self.cache.get_or_compile(&self.connection_id, &self.sources).await;
        match unit.run(event.clone(), ctx).await {
            Err(UdfError::Disposed) => {
                debug!(connection_id = %self.connection_id, "UDF unit disposed, recompiling");
                let unit = self.cache.recompile(&self.connection_id, &self.sources).await;
                unit.run(event, ctx).await.map_err(FuncError::from)
            }
            other => other.map_err(FuncError::from),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::EventContext;
    use crate::events_log::TracingEventsLogger;
    use crate::functions::{from_fn, FetchClient};
    use chrono::Utc;
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Code is a directive: `set:<key>`, `drop`, `split`, `retry`, `bad`
    #[derive(Default)]
    struct DirectiveRuntime {
        compiled: AtomicUsize,
    }

    #[async_trait]
    impl UdfRuntime for DirectiveRuntime {
        async fn compile(
            &self,
            function: &FunctionConfig,
        ) -> anyhow::Result<Arc<dyn ChainFunction>> {
            self.compiled.fetch_add(1, Ordering::SeqCst);
            let code = function.code.clone();
            if code == "bad" {
                anyhow::bail!("syntax error");
            }
            Ok(from_fn(move |mut event, _ctx| match code.as_str() {
                "drop" => Ok(FuncReturn::Drop),
                "split" => Ok(FuncReturn::Many(vec![event.clone(), event])),
                "retry" => Err(FuncError::retry("later")),
                set => {
                    let key = set.trim_start_matches("set:");
                    event[key] = json!(true);
                    Ok(FuncReturn::One(event))
                }
            }))
        }
    }

    fn source(id: &str, code: &str) -> UdfSource {
        UdfSource::code(
            FunctionConfig {
                id: id.into(),
                workspace_id: "ws".into(),
                name: id.into(),
                code: code.into(),
                code_hash: format!("{id}:{code}"),
            },
            Value::Null,
        )
    }

    fn ctx(resume: Option<&str>) -> FuncContext {
        FuncContext {
            function_id: "udf.PIPELINE".into(),
            props: Value::Null,
            event: Arc::new(EventContext {
                connection_id: "c1".into(),
                resume_function_id: resume.map(str::to_string),
                ..Default::default()
            }),
            system: None,
            fetch: FetchClient::default(),
            logger: Arc::new(TracingEventsLogger),
            store: Arc::new(crate::functions::MemoryKvStore::default()),
        }
    }

    fn cache(runtime: Arc<DirectiveRuntime>) -> UdfCache {
        UdfCache::new(runtime, Duration::from_secs(60), Duration::ZERO)
    }

    #[tokio::test]
    async fn test_pipeline_runs_in_order() {
        let cache = cache(Arc::new(DirectiveRuntime::default()));
        let sources = vec![source("a", "set:a"), source("b", "set:b")];
        let unit = cache.get_or_compile("c1", &sources).await;
        let out = unit.run(json!({}), &ctx(None)).await.unwrap();
        assert_eq!(out, FuncReturn::One(json!({"a": true, "b": true})));
    }

    #[tokio::test]
    async fn test_pipeline_resumes_at_function() {
        let cache = cache(Arc::new(DirectiveRuntime::default()));
        let sources = vec![source("a", "set:a"), source("b", "set:b")];
        let unit = cache.get_or_compile("c1", &sources).await;
        let out = unit.run(json!({}), &ctx(Some("udf.b"))).await.unwrap();
        assert_eq!(out, FuncReturn::One(json!({"b": true})));
    }

    #[tokio::test]
    async fn test_pipeline_fan_out_and_drop() {
        let cache = cache(Arc::new(DirectiveRuntime::default()));
        let split = vec![source("s", "split"), source("a", "set:a")];
        let unit = cache.get_or_compile("c1", &split).await;
        let out = unit.run(json!({}), &ctx(None)).await.unwrap();
        assert_eq!(out, FuncReturn::Many(vec![json!({"a": true}), json!({"a": true})]));

        let drop = vec![source("d", "drop"), source("a", "set:a")];
        let unit = cache.get_or_compile("c2", &drop).await;
        assert_eq!(unit.run(json!({}), &ctx(None)).await.unwrap(), FuncReturn::Drop);
    }

    #[tokio::test]
    async fn test_error_carries_function_and_snapshot() {
        let cache = cache(Arc::new(DirectiveRuntime::default()));
        let sources = vec![source("a", "set:a"), source("r", "retry"), source("b", "set:b")];
        let unit = cache.get_or_compile("c1", &sources).await;
        let err = match unit.run(json!({}), &ctx(None)).await {
            Err(UdfError::Function(e)) => e,
            other => panic!("unexpected {other:?}"),
        };
        assert_eq!(err.function_id.as_deref(), Some("udf.r"));
        assert_eq!(err.event, Some(json!({"a": true})));
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn test_bad_and_unresolved_fail_per_event() {
        let cache = cache(Arc::new(DirectiveRuntime::default()));
        let sources = vec![source("x", "bad")];
        let unit = cache.get_or_compile("c1", &sources).await;
        let err = FuncError::from(unit.run(json!({}), &ctx(None)).await.unwrap_err());
        assert!(err.message.contains("syntax error"));
        assert!(!err.is_retryable());

        let sources = vec![UdfSource::unresolved("gone", "function 'gone' not found")];
        let unit = cache.get_or_compile("c2", &sources).await;
        let err = FuncError::from(unit.run(json!({}), &ctx(None)).await.unwrap_err());
        assert_eq!(err.message, "function 'gone' not found");
        assert_eq!(err.function_id.as_deref(), Some("udf.gone"));
    }

    #[tokio::test]
    async fn test_cache_reuses_and_replaces_units() {
        let runtime = Arc::new(DirectiveRuntime::default());
        let cache = cache(runtime.clone());
        let v1 = vec![source("a", "set:a")];
        let first = cache.get_or_compile("c1", &v1).await;
        let again = cache.get_or_compile("c1", &v1).await;
        assert!(Arc::ptr_eq(&first, &again));
        assert_eq!(runtime.compiled.load(Ordering::SeqCst), 1);

        let v2 = vec![source("a", "set:b")];
        let second = cache.get_or_compile("c1", &v2).await;
        assert!(!Arc::ptr_eq(&first, &second));
        assert!(first.is_closed());
        assert!(!second.is_closed());
        assert_ne!(first.hash(), second.hash());
    }

    #[tokio::test]
    async fn test_concurrent_rebuild_keeps_single_unit() {
        let cache = cache(Arc::new(DirectiveRuntime::default()));
        let sources = vec![source("a", "set:a")];
        let (x, y) = tokio::join!(
            cache.recompile("c1", &sources),
            cache.recompile("c1", &sources)
        );
        let current = cache.get_or_compile("c1", &sources).await;
        assert!(!current.is_closed());
        assert!(Arc::ptr_eq(&current, &x) || Arc::ptr_eq(&current, &y));
    }

    #[tokio::test]
    async fn test_pipeline_function_recompiles_disposed_unit() {
        let runtime = Arc::new(DirectiveRuntime::default());
        let cache = Arc::new(cache(runtime.clone()));
        let pipeline = UdfPipelineFunction::new("c1", vec![source("a", "set:a")], cache.clone());

        let unit = cache.get_or_compile("c1", pipeline.sources()).await;
        unit.close();

        let out = pipeline.exec(json!({"t": Utc::now().timestamp()}), &ctx(None)).await.unwrap();
        match out {
            FuncReturn::One(event) => assert_eq!(event["a"], json!(true)),
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(runtime.compiled.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_hash_depends_on_order_and_code() {
        let a = source("a", "set:a");
        let b = source("b", "set:b");
        assert_eq!(pipeline_hash(&[a.clone(), b.clone()]), pipeline_hash(&[a.clone(), b.clone()]));
        assert_ne!(pipeline_hash(&[a.clone(), b.clone()]), pipeline_hash(&[b, a]));
    }
}
