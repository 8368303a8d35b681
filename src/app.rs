//! Process wiring: stores, chain builder, dispatcher and metrics built from
//! a [`RotorConfig`]

use crate::chain::{BulkerSettings, ChainServices, FunctionChainBuilder};
use crate::config::RotorConfig;
use crate::dispatch::MessageDispatcher;
use crate::events_log::{EventsLogger, TracingEventsLogger};
use crate::functions::{FetchClient, FunctionRegistry, MemoryKvStore, UdfCache, UdfRuntime};
use crate::metrics::{MetricsAggregator, PrometheusSink};
use crate::store::{
    Connection, DiskCache, Entity, EntityLoader, EntityRecords, EntityStore, FunctionConfig,
    HttpLoader, JsonFileLoader, StoreHealth, StoreHealthSource, StoreOptions,
};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Everything a running rotor shares between the consumer and HTTP
pub struct Rotor {
    /// Effective configuration
    pub config: RotorConfig,
    /// Connection store
    pub connections: EntityStore<EntityRecords<Connection>>,
    /// Function store
    pub functions: EntityStore<EntityRecords<FunctionConfig>>,
    /// Message dispatcher
    pub dispatcher: Arc<MessageDispatcher>,
    /// Metrics aggregator
    pub metrics: Arc<MetricsAggregator>,
    cancel: CancellationToken,
    metrics_task: JoinHandle<()>,
}

fn loader_for<T: Entity>(
    source: &str,
    config: &RotorConfig,
) -> Arc<dyn EntityLoader<EntityRecords<T>>> {
    if source.starts_with("http://") || source.starts_with("https://") {
        Arc::new(HttpLoader::<T>::new(
            source,
            config.repository.auth_token.clone(),
            config.fetch_timeout.max(std::time::Duration::from_secs(10)),
        ))
    } else {
        Arc::new(JsonFileLoader::<T>::new(source))
    }
}

#[cfg(feature = "wasm")]
fn udf_runtime(config: &RotorConfig) -> anyhow::Result<Arc<dyn UdfRuntime>> {
    use crate::functions::wasm::{WasmLimits, WasmUdfRuntime};
    Ok(Arc::new(WasmUdfRuntime::new(WasmLimits {
        fuel: config.udf_fuel,
        max_memory_bytes: config.udf_max_memory_bytes,
    })?))
}

#[cfg(not(feature = "wasm"))]
fn udf_runtime(_config: &RotorConfig) -> anyhow::Result<Arc<dyn UdfRuntime>> {
    struct Unsupported;

    #[async_trait::async_trait]
    impl UdfRuntime for Unsupported {
        async fn compile(
            &self,
            function: &FunctionConfig,
        ) -> anyhow::Result<Arc<dyn crate::functions::ChainFunction>> {
            anyhow::bail!("function {} needs the wasm feature", function.id)
        }
    }

    Ok(Arc::new(Unsupported))
}

impl Rotor {
    /// Build every component and start the background tasks
    pub async fn start(config: RotorConfig) -> anyhow::Result<Self> {
        config.validate()?;
        let options = StoreOptions {
            refresh_interval: config.store_refresh_interval,
            disk_cache: config.cache_dir.clone().map(DiskCache::new),
        };
        let connections = EntityStore::with_loader(
            "connections",
            loader_for::<Connection>(&config.repository.connections, &config),
            options.clone(),
        );
        let functions = EntityStore::with_loader(
            "functions",
            loader_for::<FunctionConfig>(&config.repository.functions, &config),
            options,
        );
        connections.get().await?;
        functions.get().await?;
        info!("Entity stores initialized");

        let udf_cache = Arc::new(UdfCache::new(
            udf_runtime(&config)?,
            config.udf_cache_ttl,
            config.udf_grace_period,
        ));
        let mut builder = FunctionChainBuilder::new(
            Arc::new(FunctionRegistry::with_builtins()),
            Arc::new(functions.clone()),
            udf_cache,
        );
        if let Some(endpoint) = &config.bulker_url {
            builder = builder.with_bulker(BulkerSettings {
                endpoint: endpoint.clone(),
                auth_token: config.bulker_token.clone(),
            });
        }

        let logger: Arc<dyn EventsLogger> = Arc::new(TracingEventsLogger);
        let services = ChainServices {
            fetch: FetchClient::new(config.fetch_timeout),
            logger,
            store: Arc::new(MemoryKvStore::default()),
        };
        let metrics = MetricsAggregator::new(Arc::new(PrometheusSink), config.metrics_max_buffer);
        let cancel = CancellationToken::new();
        let metrics_task = metrics.start(config.metrics_flush_interval, cancel.clone());

        let dispatcher = Arc::new(
            MessageDispatcher::new(
                Arc::new(connections.clone()),
                Arc::new(builder),
                services,
                config.chain_cache_ttl,
            )
            .with_metrics(metrics.clone()),
        );

        Ok(Self {
            config,
            connections,
            functions,
            dispatcher,
            metrics,
            cancel,
            metrics_task,
        })
    }

    /// Store health for `/health`
    pub fn health(&self) -> Vec<StoreHealth> {
        vec![self.connections.health(), self.functions.health()]
    }

    /// Stop refresh loops and flush metrics
    pub async fn stop(self) {
        self.connections.stop();
        self.functions.stop();
        self.cancel.cancel();
        let _ = self.metrics_task.await;
        info!("Rotor stopped");
    }
}
