#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use parking_lot::Mutex;
use rotor::chain::{ChainServices, FunctionChainBuilder};
use rotor::dispatch::{MessageDispatcher, ProfileBuilderRunner};
use rotor::events_log::TracingEventsLogger;
use rotor::functions::{
    from_fn, ChainFunction, FetchClient, FuncReturn, FunctionRegistry, MemoryKvStore, UdfCache,
    UdfRuntime,
};
use rotor::store::{
    Connection, ConnectionOptions, EntityRecords, FunctionConfig, FunctionRef, StaticObjectStore,
};
use rotor::event::EventContext;
use rotor::{AnyEvent, FuncError};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

pub const WORKSPACE: &str = "ws";

/// Runtime where the function code is a directive:
/// - `append:<prop>` sets `properties.<prop>` and increments `counter`
/// - `drop_retry_once:<prop>` fails with a drop-retry on the first attempt,
///   then behaves like `append:<prop>`
/// - `retry`, `drop_retry`, `fail`, `drop`, `split`
pub struct ScriptRuntime;

fn append(mut event: AnyEvent, prop: &str) -> AnyEvent {
    event["properties"][prop] = json!(true);
    let counter = event["counter"].as_u64().unwrap_or(0);
    event["counter"] = json!(counter + 1);
    event
}

#[async_trait]
impl UdfRuntime for ScriptRuntime {
    async fn compile(&self, function: &FunctionConfig) -> anyhow::Result<Arc<dyn ChainFunction>> {
        let code = function.code.clone();
        if let Some(prop) = code.strip_prefix("append:") {
            let prop = prop.to_string();
            return Ok(from_fn(move |event, _ctx| Ok(FuncReturn::One(append(event, &prop)))));
        }
        if let Some(prop) = code.strip_prefix("drop_retry_once:") {
            let prop = prop.to_string();
            return Ok(from_fn(move |event, ctx| {
                if ctx.event.retries == 0 {
                    Err(FuncError::drop_retry("not yet"))
                } else {
                    Ok(FuncReturn::One(append(event, &prop)))
                }
            }));
        }
        match code.as_str() {
            "retry" => Ok(from_fn(|_, _| Err(FuncError::retry("later")))),
            "drop_retry" => Ok(from_fn(|_, _| Err(FuncError::drop_retry("later")))),
            "fail" => Ok(from_fn(|_, _| Err(FuncError::error("boom")))),
            "drop" => Ok(from_fn(|_, _| Ok(FuncReturn::Drop))),
            "split" => Ok(from_fn(|event, _| {
                Ok(FuncReturn::Many(vec![event.clone(), event]))
            })),
            other => anyhow::bail!("unknown directive '{other}'"),
        }
    }
}

/// Profile builder runner counting the events it is fed per workspace
#[derive(Default)]
pub struct CountingProfiles {
    pub runs: AtomicUsize,
    pub workspaces: Mutex<Vec<String>>,
}

impl CountingProfiles {
    pub fn runs(&self) -> usize {
        self.runs.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ProfileBuilderRunner for CountingProfiles {
    async fn run(
        &self,
        workspace_id: &str,
        _event: &AnyEvent,
        _ctx: &EventContext,
    ) -> anyhow::Result<()> {
        self.runs.fetch_add(1, Ordering::SeqCst);
        self.workspaces.lock().push(workspace_id.to_string());
        Ok(())
    }
}

/// Dispatcher over static stores, delivering to a `capture` destination
pub struct Harness {
    pub dispatcher: Arc<MessageDispatcher>,
    pub builder: Arc<FunctionChainBuilder>,
    pub udf_cache: Arc<UdfCache>,
    pub delivered: Arc<Mutex<Vec<AnyEvent>>>,
}

impl Harness {
    pub fn new(connections: Vec<Connection>, functions: Vec<FunctionConfig>) -> Self {
        Self::build(connections, functions, None)
    }

    pub fn with_profiles(
        connections: Vec<Connection>,
        functions: Vec<FunctionConfig>,
        profiles: Arc<CountingProfiles>,
    ) -> Self {
        Self::build(connections, functions, Some(profiles))
    }

    fn build(
        connections: Vec<Connection>,
        functions: Vec<FunctionConfig>,
        profiles: Option<Arc<CountingProfiles>>,
    ) -> Self {
        let delivered = Arc::new(Mutex::new(Vec::new()));
        let sink = delivered.clone();

        let mut registry = FunctionRegistry::with_builtins();
        registry
            .register_destination(
                "capture",
                from_fn(move |event, _ctx| {
                    sink.lock().push(event);
                    Ok(FuncReturn::Unchanged)
                }),
            )
            .register_transformation(
                "tag",
                from_fn(|mut event, _ctx| {
                    event["tagged"] = json!(true);
                    Ok(FuncReturn::One(event))
                }),
            );

        let functions = StaticObjectStore::new(EntityRecords::new(
            functions.into_iter().map(|f| (f.id.clone(), f)),
            DateTime::<Utc>::UNIX_EPOCH,
        ));
        let udf_cache = Arc::new(UdfCache::new(
            Arc::new(ScriptRuntime),
            Duration::from_secs(60),
            Duration::ZERO,
        ));
        let builder = Arc::new(FunctionChainBuilder::new(
            Arc::new(registry),
            Arc::new(functions),
            udf_cache.clone(),
        ));
        let services = ChainServices {
            fetch: FetchClient::default(),
            logger: Arc::new(TracingEventsLogger),
            store: Arc::new(MemoryKvStore::default()),
        };
        let mut dispatcher = MessageDispatcher::new(
            Arc::new(StaticObjectStore::new(EntityRecords::from_connections(
                connections,
            ))),
            builder.clone(),
            services,
            Duration::from_secs(60),
        );
        if let Some(profiles) = profiles {
            dispatcher = dispatcher.with_profile_builders(profiles);
        }
        let dispatcher = Arc::new(dispatcher);

        Self {
            dispatcher,
            builder,
            udf_cache,
            delivered,
        }
    }

    pub fn delivered(&self) -> Vec<AnyEvent> {
        self.delivered.lock().clone()
    }
}

pub fn udf(id: &str, code: &str) -> FunctionConfig {
    FunctionConfig {
        id: id.into(),
        workspace_id: WORKSPACE.into(),
        name: id.into(),
        code: code.into(),
        code_hash: format!("{id}:{code}"),
    }
}

/// Connection delivering to `capture` through the given function ids
pub fn connection(id: &str, function_ids: &[&str]) -> Connection {
    Connection {
        id: id.into(),
        workspace_id: WORKSPACE.into(),
        destination_type: "capture".into(),
        uses_bulker: false,
        stream_id: "s1".into(),
        stream_name: "site".into(),
        destination_id: format!("d-{id}"),
        credentials: Value::Null,
        credentials_hash: String::new(),
        options: ConnectionOptions {
            functions: function_ids
                .iter()
                .map(|f| FunctionRef {
                    function_id: f.to_string(),
                    function_options: Value::Null,
                })
                .collect(),
            ..Default::default()
        },
        updated_at: Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
    }
}

/// Ingest envelope routed to `connection_id`
pub fn envelope(connection_id: &str, message_id: &str, event: Value) -> Vec<u8> {
    serde_json::to_vec(&json!({
        "connectionId": connection_id,
        "messageId": message_id,
        "httpHeaders": {},
        "httpPayload": event,
    }))
    .unwrap()
}
