//! Turns a connection's function list into an executable chain

use crate::error::{RotorError, RotorResult};
use crate::functions::bulker::{BulkerConfig, BulkerDestination};
use crate::functions::{
    Func, FuncChain, FuncKind, FunctionRegistry, UdfCache, UdfPipelineFunction, UdfSource,
    BUILTIN_DESTINATION_PREFIX, BUILTIN_TRANSFORMATION_PREFIX, BULKER_FUNCTION_ID, UDF_PIPELINE_ID,
    UDF_PREFIX,
};
use crate::store::entities::{Connection, FunctionConfig};
use crate::store::ObjectStore;
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, warn};

/// Where the warehouse loader lives
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BulkerSettings {
    /// Base URL
    pub endpoint: String,
    /// Bearer token
    pub auth_token: Option<String>,
}

/// Builds [`FuncChain`]s
pub struct FunctionChainBuilder {
    registry: Arc<FunctionRegistry>,
    functions: Arc<dyn ObjectStore<FunctionConfig>>,
    udf_cache: Arc<UdfCache>,
    bulker: Option<BulkerSettings>,
}

impl FunctionChainBuilder {
    /// Builder resolving UDFs through `functions`
    pub fn new(
        registry: Arc<FunctionRegistry>,
        functions: Arc<dyn ObjectStore<FunctionConfig>>,
        udf_cache: Arc<UdfCache>,
    ) -> Self {
        Self {
            registry,
            functions,
            udf_cache,
            bulker: None,
        }
    }

    /// Enable `usesBulker` connections
    pub fn with_bulker(mut self, bulker: BulkerSettings) -> Self {
        self.bulker = Some(bulker);
        self
    }

    /// Function store the builder reads
    pub fn function_store(&self) -> &Arc<dyn ObjectStore<FunctionConfig>> {
        &self.functions
    }

    /// Build the chain
    /// `[builtin transformations] + [udf.PIPELINE if any UDF] + [destination]`.
    ///
    /// Fails with [`RotorError::Configuration`] when the destination or a
    /// built-in transformation is not registered. Broken UDF references do
    /// not fail the build; they fail each event at execution time.
    pub async fn build(&self, connection: &Connection) -> RotorResult<FuncChain> {
        let terminal = self.terminal(connection)?;

        let mut functions = Vec::new();
        for reference in &connection.options.functions {
            let id = reference.function_id.as_str();
            if let Some(name) = id.strip_prefix(BUILTIN_TRANSFORMATION_PREFIX) {
                let exec = self.registry.transformation(name).ok_or_else(|| {
                    RotorError::Configuration(format!(
                        "connection '{}': unknown transformation '{}'",
                        connection.id, id
                    ))
                })?;
                functions.push(Func {
                    id: id.to_string(),
                    kind: FuncKind::BuiltinTransformation,
                    exec,
                    config: reference.function_options.clone(),
                    enable_system_context: false,
                });
            } else if !id.starts_with(UDF_PREFIX) {
                warn!(
                    connection_id = %connection.id,
                    function_id = id,
                    "Ignoring unsupported function reference"
                );
            }
        }

        let sources = self.udf_sources(connection);
        if !sources.is_empty() {
            // compile now so the first event does not pay for it
            self.udf_cache.get_or_compile(&connection.id, &sources).await;
            functions.push(Func {
                id: UDF_PIPELINE_ID.to_string(),
                kind: FuncKind::UdfPipeline,
                exec: Arc::new(UdfPipelineFunction::new(
                    connection.id.clone(),
                    sources,
                    self.udf_cache.clone(),
                )),
                config: Value::Null,
                enable_system_context: false,
            });
        }

        functions.push(terminal);
        let chain = FuncChain {
            connection_id: connection.id.clone(),
            functions,
        };
        debug!(connection_id = %connection.id, chain = ?chain.ids(), "Built function chain");
        Ok(chain)
    }

    fn terminal(&self, connection: &Connection) -> RotorResult<Func> {
        if connection.uses_bulker {
            let bulker = self.bulker.as_ref().ok_or_else(|| {
                RotorError::Configuration(format!(
                    "connection '{}' uses bulker but no bulker endpoint is configured",
                    connection.id
                ))
            })?;
            let config = BulkerConfig::for_connection(
                connection,
                &bulker.endpoint,
                bulker.auth_token.as_deref(),
            );
            return Ok(Func {
                id: BULKER_FUNCTION_ID.to_string(),
                kind: FuncKind::BuiltinDestination,
                exec: Arc::new(BulkerDestination),
                config: serde_json::to_value(config)?,
                enable_system_context: true,
            });
        }

        let exec = self
            .registry
            .destination(&connection.destination_type)
            .ok_or_else(|| {
                RotorError::Configuration(format!(
                    "connection '{}': no destination function registered for type '{}'",
                    connection.id, connection.destination_type
                ))
            })?;
        Ok(Func {
            id: format!("{BUILTIN_DESTINATION_PREFIX}{}", connection.destination_type),
            kind: FuncKind::BuiltinDestination,
            exec,
            config: connection.credentials.clone(),
            enable_system_context: true,
        })
    }

    fn udf_sources(&self, connection: &Connection) -> Vec<UdfSource> {
        connection
            .udf_refs()
            .map(|reference| {
                let id = reference
                    .function_id
                    .strip_prefix(UDF_PREFIX)
                    .unwrap_or(&reference.function_id);
                match self.functions.get_object(id) {
                    None => {
                        warn!(connection_id = %connection.id, function_id = id, "UDF not found");
                        UdfSource::unresolved(id, format!("function '{id}' not found"))
                    }
                    Some(f) if f.workspace_id != connection.workspace_id => {
                        warn!(
                            connection_id = %connection.id,
                            function_id = id,
                            "UDF belongs to another workspace"
                        );
                        UdfSource::unresolved(
                            id,
                            format!(
                                "function '{id}' does not belong to workspace '{}'",
                                connection.workspace_id
                            ),
                        )
                    }
                    Some(f) => UdfSource::code(f, reference.function_options.clone()),
                }
            })
            .collect()
    }
}
