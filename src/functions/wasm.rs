//! WebAssembly UDF runtime
//!
//! A function's `code` is either WAT text or a base64-encoded core module.
//! Each call gets a fresh store with fuel and memory limits; modules never
//! share state between events.
//!
//! Guest ABI:
//! - export `memory`
//! - export `alloc(len: i32) -> i32` returning a buffer for the input
//! - export `process(ptr: i32, len: i32) -> i64` returning `(out_ptr << 32) | out_len`
//! - optional import `env.log(level: i32, ptr: i32, len: i32)`
//! - optional import `env.fetch(ptr: i32, len: i32) -> i64` taking
//!   `{"url", "method"?, "headers"?, "body"?}` and returning a packed
//!   pointer to `{"status", "body"}` or `{"error"}`
//! - optional import `env.store_get(key_ptr: i32, key_len: i32) -> i64`
//!   returning a packed pointer to `{"value"}` or `{"error"}`
//! - optional import `env.store_set(key_ptr, key_len, value_ptr, value_len) -> i32`
//!   storing a JSON value, `0` on success and `-1` on failure
//!
//! Buffers handed back to the guest are allocated with its `alloc` export.
//! Store keys are scoped to the connection of the running event.
//!
//! Input is `{"event", "context", "props"}` as JSON. Output is
//! `{"result": "drop" | event | [events] | null}` or
//! `{"error": {"name", "message", "retryPolicy"?, "event"?}}`.

use super::udf::UdfRuntime;
use super::{ChainFunction, FetchClient, FuncContext, FuncReturn, UdfKvStore};
use crate::consumer::retry::RetryPolicy;
use crate::error::{FuncError, FuncErrorKind};
use crate::event::AnyEvent;
use crate::events_log::LogLevel;
use crate::store::entities::FunctionConfig;
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::runtime::Handle;
use wasmtime::{
    Caller, Config, Engine, Extern, Linker, Module, Store, StoreLimits, StoreLimitsBuilder,
};

/// Resource limits for one call
#[derive(Debug, Clone, Copy)]
pub struct WasmLimits {
    /// Fuel units available per call
    pub fuel: u64,
    /// Maximum linear memory in bytes
    pub max_memory_bytes: usize,
}

impl Default for WasmLimits {
    fn default() -> Self {
        Self {
            fuel: 50_000_000,
            max_memory_bytes: 64 * 1024 * 1024,
        }
    }
}

struct HostState {
    limits: StoreLimits,
    logs: Vec<(i32, String)>,
    connection_id: String,
    fetch: FetchClient,
    store: Arc<dyn UdfKvStore>,
    runtime: Handle,
}

#[derive(Debug, Deserialize)]
struct GuestRequest {
    url: String,
    #[serde(default)]
    method: Option<String>,
    #[serde(default)]
    headers: HashMap<String, String>,
    #[serde(default)]
    body: Option<String>,
}

fn read_guest(caller: &mut Caller<'_, HostState>, ptr: i32, len: i32) -> Result<Vec<u8>> {
    let Some(Extern::Memory(memory)) = caller.get_export("memory") else {
        return Err(anyhow!("module does not export 'memory'"));
    };
    let start = ptr as u32 as usize;
    let end = start.saturating_add(len as u32 as usize);
    memory
        .data(&*caller)
        .get(start..end)
        .map(<[u8]>::to_vec)
        .ok_or_else(|| anyhow!("guest range {start}..{end} is out of bounds"))
}

/// Copy `value` into a buffer from the guest's `alloc`, returning `(ptr << 32) | len`
fn write_guest(caller: &mut Caller<'_, HostState>, value: &Value) -> Result<i64> {
    let bytes = serde_json::to_vec(value)?;
    let len = i32::try_from(bytes.len()).context("host response too large")?;
    let alloc = caller
        .get_export("alloc")
        .and_then(Extern::into_func)
        .ok_or_else(|| anyhow!("module does not export 'alloc'"))?
        .typed::<i32, i32>(&*caller)?;
    let ptr = alloc.call(&mut *caller, len)?;
    let Some(Extern::Memory(memory)) = caller.get_export("memory") else {
        return Err(anyhow!("module does not export 'memory'"));
    };
    memory.write(&mut *caller, ptr as u32 as usize, &bytes)?;
    Ok(((ptr as u32 as i64) << 32) | len as i64)
}

fn guest_fetch(state: &HostState, request: &[u8]) -> Value {
    let request: GuestRequest = match serde_json::from_slice(request) {
        Ok(request) => request,
        Err(e) => return json!({"error": format!("invalid fetch request: {e}")}),
    };
    let method = match request
        .method
        .as_deref()
        .unwrap_or("GET")
        .to_ascii_uppercase()
        .parse::<reqwest::Method>()
    {
        Ok(method) => method,
        Err(e) => return json!({"error": format!("invalid method: {e}")}),
    };
    let response = state.runtime.block_on(state.fetch.fetch(
        method,
        &request.url,
        &request.headers,
        request.body,
    ));
    match response {
        Ok(response) => json!(response),
        Err(e) => json!({"error": e.message}),
    }
}

/// Runtime compiling UDFs with wasmtime
pub struct WasmUdfRuntime {
    engine: Engine,
    linker: Arc<Linker<HostState>>,
    limits: WasmLimits,
}

impl WasmUdfRuntime {
    /// Runtime with the given limits
    pub fn new(limits: WasmLimits) -> Result<Self> {
        let mut config = Config::new();
        config.consume_fuel(true);
        let engine = Engine::new(&config)?;

        let mut linker = Linker::new(&engine);
        linker.func_wrap(
            "env",
            "log",
            |mut caller: Caller<'_, HostState>, level: i32, ptr: i32, len: i32| {
                if let Ok(bytes) = read_guest(&mut caller, ptr, len) {
                    let message = String::from_utf8_lossy(&bytes).into_owned();
                    caller.data_mut().logs.push((level, message));
                }
            },
        )?;
        linker.func_wrap(
            "env",
            "fetch",
            |mut caller: Caller<'_, HostState>, ptr: i32, len: i32| -> Result<i64> {
                let request = read_guest(&mut caller, ptr, len)?;
                let response = guest_fetch(caller.data(), &request);
                write_guest(&mut caller, &response)
            },
        )?;
        linker.func_wrap(
            "env",
            "store_get",
            |mut caller: Caller<'_, HostState>, ptr: i32, len: i32| -> Result<i64> {
                let key = String::from_utf8(read_guest(&mut caller, ptr, len)?)?;
                let state = caller.data();
                let found = state
                    .runtime
                    .block_on(state.store.get(&state.connection_id, &key));
                let response = match found {
                    Ok(value) => json!({"value": value}),
                    Err(e) => json!({"error": e.to_string()}),
                };
                write_guest(&mut caller, &response)
            },
        )?;
        linker.func_wrap(
            "env",
            "store_set",
            |mut caller: Caller<'_, HostState>,
             key_ptr: i32,
             key_len: i32,
             value_ptr: i32,
             value_len: i32|
             -> Result<i32> {
                let key = String::from_utf8(read_guest(&mut caller, key_ptr, key_len)?)?;
                let value: Value = match serde_json::from_slice(&read_guest(
                    &mut caller,
                    value_ptr,
                    value_len,
                )?) {
                    Ok(value) => value,
                    Err(_) => return Ok(-1),
                };
                let state = caller.data();
                let stored = state
                    .runtime
                    .block_on(state.store.set(&state.connection_id, &key, value, None));
                Ok(if stored.is_ok() { 0 } else { -1 })
            },
        )?;

        Ok(Self {
            engine,
            linker: Arc::new(linker),
            limits,
        })
    }
}

fn decode_source(code: &str) -> Result<Vec<u8>> {
    let trimmed = code.trim();
    if trimmed.starts_with('(') {
        return Ok(trimmed.as_bytes().to_vec());
    }
    STANDARD
        .decode(trimmed)
        .context("code is neither WAT nor base64-encoded wasm")
}

#[async_trait]
impl UdfRuntime for WasmUdfRuntime {
    async fn compile(&self, function: &FunctionConfig) -> Result<Arc<dyn ChainFunction>> {
        let bytes = decode_source(&function.code)?;
        let engine = self.engine.clone();
        let module = tokio::task::spawn_blocking(move || Module::new(&engine, &bytes))
            .await
            .context("compile task panicked")??;
        Ok(Arc::new(WasmFunction {
            module,
            linker: self.linker.clone(),
            limits: self.limits,
        }))
    }
}

struct WasmFunction {
    module: Module,
    linker: Arc<Linker<HostState>>,
    limits: WasmLimits,
}

struct Invocation {
    output: Vec<u8>,
    logs: Vec<(i32, String)>,
}

/// Capabilities granted to one call
struct Capabilities {
    connection_id: String,
    fetch: FetchClient,
    store: Arc<dyn UdfKvStore>,
    runtime: Handle,
}

fn invoke(
    module: &Module,
    linker: &Linker<HostState>,
    limits: WasmLimits,
    capabilities: Capabilities,
    input: &[u8],
) -> Result<Invocation> {
    let state = HostState {
        limits: StoreLimitsBuilder::new()
            .memory_size(limits.max_memory_bytes)
            .build(),
        logs: Vec::new(),
        connection_id: capabilities.connection_id,
        fetch: capabilities.fetch,
        store: capabilities.store,
        runtime: capabilities.runtime,
    };
    let mut store = Store::new(module.engine(), state);
    store.limiter(|s| &mut s.limits);
    store.set_fuel(limits.fuel)?;

    let instance = linker.instantiate(&mut store, module)?;
    let memory = instance
        .get_memory(&mut store, "memory")
        .ok_or_else(|| anyhow!("module does not export 'memory'"))?;
    let alloc = instance.get_typed_func::<i32, i32>(&mut store, "alloc")?;
    let process = instance.get_typed_func::<(i32, i32), i64>(&mut store, "process")?;

    let len = i32::try_from(input.len()).context("input too large")?;
    let ptr = alloc.call(&mut store, len)?;
    memory.write(&mut store, ptr as u32 as usize, input)?;
    let packed = process.call(&mut store, (ptr, len))? as u64;

    let out_ptr = (packed >> 32) as usize;
    let out_len = (packed & 0xffff_ffff) as usize;
    let output = memory
        .data(&store)
        .get(out_ptr..out_ptr.saturating_add(out_len))
        .ok_or_else(|| anyhow!("output range {out_ptr}+{out_len} is out of bounds"))?
        .to_vec();

    Ok(Invocation {
        output,
        logs: std::mem::take(&mut store.data_mut().logs),
    })
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GuestError {
    #[serde(default)]
    name: String,
    message: String,
    #[serde(default)]
    retry_policy: Option<RetryPolicy>,
    #[serde(default)]
    event: Option<AnyEvent>,
}

#[derive(Debug, Deserialize)]
struct GuestOutput {
    #[serde(default)]
    result: Value,
    #[serde(default)]
    error: Option<GuestError>,
}

#[async_trait]
impl ChainFunction for WasmFunction {
    async fn exec(&self, event: AnyEvent, ctx: &FuncContext) -> Result<FuncReturn, FuncError> {
        let input = serde_json::to_vec(&json!({
            "event": event,
            "context": &*ctx.event,
            "props": ctx.props,
        }))
        .map_err(|e| FuncError::error(format!("failed to encode input: {e}")))?;

        let module = self.module.clone();
        let linker = self.linker.clone();
        let limits = self.limits;
        let capabilities = Capabilities {
            connection_id: ctx.event.connection_id.clone(),
            fetch: ctx.fetch.clone(),
            store: ctx.store.clone(),
            runtime: Handle::current(),
        };
        let invocation = tokio::task::spawn_blocking(move || {
            invoke(&module, &linker, limits, capabilities, &input)
        })
        .await
        .map_err(|e| FuncError::error(format!("wasm task failed: {e}")))?
        .map_err(|e| FuncError::error(format!("wasm execution failed: {e:#}")))?;

        for (level, message) in invocation.logs {
            ctx.logger.log(
                &ctx.event.connection_id,
                LogLevel::from_code(level),
                json!({"functionId": ctx.function_id, "message": message}),
            );
        }

        let output: GuestOutput = serde_json::from_slice(&invocation.output)
            .map_err(|e| FuncError::error(format!("invalid function output: {e}")))?;
        if let Some(err) = output.error {
            let mut error = FuncError::new(FuncErrorKind::from_name(&err.name), err.message);
            error.retry_policy = err.retry_policy;
            error.event = err.event;
            return Err(error);
        }
        Ok(FuncReturn::from_json(output.result))
    }
}
