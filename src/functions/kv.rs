//! Key-value state for functions, partitioned by connection

use async_trait::async_trait;
use moka::future::Cache;
use serde_json::Value;
use std::time::Duration;

/// State a function keeps between events. Keys never cross connections.
#[async_trait]
pub trait UdfKvStore: Send + Sync {
    /// Value stored under `key` for `connection_id`
    async fn get(&self, connection_id: &str, key: &str) -> anyhow::Result<Option<Value>>;

    /// Store `value`; `ttl` bounds how long it is kept, when the backend supports it
    async fn set(
        &self,
        connection_id: &str,
        key: &str,
        value: Value,
        ttl: Option<Duration>,
    ) -> anyhow::Result<()>;

    /// Remove `key`
    async fn delete(&self, connection_id: &str, key: &str) -> anyhow::Result<()>;
}

/// In-process store. Entries expire after the configured idle time; a
/// per-entry ttl is not honoured.
pub struct MemoryKvStore {
    entries: Cache<(String, String), Value>,
}

impl MemoryKvStore {
    /// Store holding at most `capacity` entries, each dropped after `idle`
    /// without access
    pub fn new(capacity: u64, idle: Duration) -> Self {
        Self {
            entries: Cache::builder()
                .max_capacity(capacity)
                .time_to_idle(idle)
                .build(),
        }
    }
}

impl Default for MemoryKvStore {
    fn default() -> Self {
        Self::new(100_000, Duration::from_secs(24 * 3600))
    }
}

fn entry_key(connection_id: &str, key: &str) -> (String, String) {
    (connection_id.to_string(), key.to_string())
}

#[async_trait]
impl UdfKvStore for MemoryKvStore {
    async fn get(&self, connection_id: &str, key: &str) -> anyhow::Result<Option<Value>> {
        Ok(self.entries.get(&entry_key(connection_id, key)).await)
    }

    async fn set(
        &self,
        connection_id: &str,
        key: &str,
        value: Value,
        _ttl: Option<Duration>,
    ) -> anyhow::Result<()> {
        self.entries
            .insert(entry_key(connection_id, key), value)
            .await;
        Ok(())
    }

    async fn delete(&self, connection_id: &str, key: &str) -> anyhow::Result<()> {
        self.entries.invalidate(&entry_key(connection_id, key)).await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_keys_are_scoped_to_connection() {
        let store = MemoryKvStore::default();
        store.set("c1", "seen", json!(3), None).await.unwrap();

        assert_eq!(store.get("c1", "seen").await.unwrap(), Some(json!(3)));
        assert_eq!(store.get("c2", "seen").await.unwrap(), None);

        store.delete("c1", "seen").await.unwrap();
        assert_eq!(store.get("c1", "seen").await.unwrap(), None);
    }
}
