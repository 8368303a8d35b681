//! Connection and function definitions served by the entity stores

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::Arc;

/// Reference to a function inside `connection.options.functions`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FunctionRef {
    /// `builtin.transformation.<name>` or `udf.<functionId>`
    pub function_id: String,
    /// Per-connection options for the function
    #[serde(default)]
    pub function_options: Value,
}

/// Connection options. Only `functions` and the bulker settings are typed;
/// everything else is kept as-is for destination functions.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionOptions {
    /// Ordered function list
    #[serde(default)]
    pub functions: Vec<FunctionRef>,
    /// Bulker data layout (`segment`, `jitsu-legacy`, ...)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_layout: Option<String>,
    /// Bulker mode (`stream` or `batch`)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mode: Option<String>,
    /// Target table name override
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub table_name: Option<String>,
    /// Remaining options
    #[serde(default, flatten)]
    pub extra: Map<String, Value>,
}

/// A source → destination link
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Connection {
    /// Connection id
    pub id: String,
    /// Owning workspace
    pub workspace_id: String,
    /// Destination type, resolves `builtin.destination.<type>`
    #[serde(rename = "type")]
    pub destination_type: String,
    /// Deliver through the warehouse loader instead of a destination function
    #[serde(default)]
    pub uses_bulker: bool,
    /// Source stream id
    #[serde(default)]
    pub stream_id: String,
    /// Source display name
    #[serde(default)]
    pub stream_name: String,
    /// Destination id
    #[serde(default)]
    pub destination_id: String,
    /// Destination credentials
    #[serde(default)]
    pub credentials: Value,
    /// Hash of `credentials`
    #[serde(default)]
    pub credentials_hash: String,
    /// Connection options
    #[serde(default)]
    pub options: ConnectionOptions,
    /// Last modification time
    pub updated_at: DateTime<Utc>,
}

impl Connection {
    /// All `udf.*` references in declared order
    pub fn udf_refs(&self) -> impl Iterator<Item = &FunctionRef> {
        self.options
            .functions
            .iter()
            .filter(|f| f.function_id.starts_with(crate::functions::UDF_PREFIX))
    }
}

/// A user-defined function
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FunctionConfig {
    /// Function id (without the `udf.` prefix)
    pub id: String,
    /// Owning workspace
    pub workspace_id: String,
    /// Display name
    #[serde(default)]
    pub name: String,
    /// Source code
    pub code: String,
    /// Content hash used to detect changes
    pub code_hash: String,
}

/// Snapshot of one entity kind, keyed by id
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EntityRecords<T> {
    /// Objects by id
    pub objects: HashMap<String, T>,
    /// Latest modification among the objects
    pub last_modified: DateTime<Utc>,
}

impl<T> EntityRecords<T> {
    /// Build records from `(id, object)` pairs
    pub fn new(
        objects: impl IntoIterator<Item = (String, T)>,
        last_modified: DateTime<Utc>,
    ) -> Self {
        Self {
            objects: objects.into_iter().collect(),
            last_modified,
        }
    }
}

impl EntityRecords<Connection> {
    /// Records from a list of connections
    pub fn from_connections(connections: Vec<Connection>) -> Self {
        let last_modified = connections
            .iter()
            .map(|c| c.updated_at)
            .max()
            .unwrap_or(DateTime::<Utc>::UNIX_EPOCH);
        Self::new(
            connections.into_iter().map(|c| (c.id.clone(), c)),
            last_modified,
        )
    }
}

/// Read access to a set of entities by id
pub trait ObjectStore<T>: Send + Sync {
    /// Look up an entity
    fn get_object(&self, id: &str) -> Option<T>;

    /// Time of the latest change, if the store has loaded anything yet
    fn last_modified(&self) -> Option<DateTime<Utc>>;
}

/// Fixed in-memory [`ObjectStore`]
#[derive(Debug, Clone)]
pub struct StaticObjectStore<T> {
    records: Arc<EntityRecords<T>>,
}

impl<T> StaticObjectStore<T> {
    /// Wrap a set of records
    pub fn new(records: EntityRecords<T>) -> Self {
        Self {
            records: Arc::new(records),
        }
    }

    /// Empty store
    pub fn empty() -> Self {
        Self::new(EntityRecords::new(
            Vec::<(String, T)>::new(),
            DateTime::<Utc>::UNIX_EPOCH,
        ))
    }
}

impl<T: Clone + Send + Sync> ObjectStore<T> for StaticObjectStore<T> {
    fn get_object(&self, id: &str) -> Option<T> {
        self.records.objects.get(id).cloned()
    }

    fn last_modified(&self) -> Option<DateTime<Utc>> {
        Some(self.records.last_modified)
    }
}
