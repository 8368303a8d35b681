//! Built chains cached per connection

use super::builder::FunctionChainBuilder;
use crate::error::RotorResult;
use crate::functions::FuncChain;
use crate::store::entities::Connection;
use chrono::{DateTime, Utc};
use moka::future::Cache;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

#[derive(Clone)]
struct CachedChain {
    version: DateTime<Utc>,
    chain: Arc<FuncChain>,
}

/// Chains keyed by connection id, rebuilt when the connection or the
/// function store changed since the chain was built
pub struct ChainCache {
    entries: Cache<String, CachedChain>,
}

impl ChainCache {
    /// Cache whose entries live at most `ttl`
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: Cache::builder().time_to_live(ttl).build(),
        }
    }

    /// Cached chain when still current, else a fresh build
    pub async fn get_or_build(
        &self,
        builder: &FunctionChainBuilder,
        connection: &Connection,
    ) -> RotorResult<Arc<FuncChain>> {
        let functions_modified = builder
            .function_store()
            .last_modified()
            .unwrap_or(DateTime::<Utc>::UNIX_EPOCH);
        let version = connection.updated_at.max(functions_modified);

        if let Some(cached) = self.entries.get(&connection.id).await {
            if cached.version == version {
                return Ok(cached.chain);
            }
            debug!(connection_id = %connection.id, "Chain is outdated, rebuilding");
        }

        let chain = Arc::new(builder.build(connection).await?);
        self.entries
            .insert(
                connection.id.clone(),
                CachedChain {
                    version,
                    chain: chain.clone(),
                },
            )
            .await;
        Ok(chain)
    }

    /// Drop the cached chain of a connection
    pub async fn invalidate(&self, connection_id: &str) {
        self.entries.invalidate(connection_id).await;
    }
}
