//! Geolocation lookup

use crate::event::Geo;
use async_trait::async_trait;
use moka::future::Cache;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Resolves an IP address to a location. The database behind it lives
/// outside rotor.
#[async_trait]
pub trait GeoResolver: Send + Sync {
    /// Location of `ip`, `None` when unknown
    async fn resolve(&self, ip: &str) -> anyhow::Result<Option<Geo>>;
}

/// Fixed IP → location table
#[derive(Debug, Clone, Default)]
pub struct StaticGeoResolver {
    entries: HashMap<String, Geo>,
}

impl StaticGeoResolver {
    /// Resolver answering from `entries`
    pub fn new(entries: HashMap<String, Geo>) -> Self {
        Self { entries }
    }
}

#[async_trait]
impl GeoResolver for StaticGeoResolver {
    async fn resolve(&self, ip: &str) -> anyhow::Result<Option<Geo>> {
        Ok(self.entries.get(ip).cloned())
    }
}

/// Memoizes another resolver. Failed lookups are not cached.
pub struct CachedGeoResolver {
    inner: Arc<dyn GeoResolver>,
    cache: Cache<String, Option<Geo>>,
}

impl CachedGeoResolver {
    /// Cache up to `capacity` addresses for `ttl`
    pub fn new(inner: Arc<dyn GeoResolver>, capacity: u64, ttl: Duration) -> Self {
        Self {
            inner,
            cache: Cache::builder().max_capacity(capacity).time_to_live(ttl).build(),
        }
    }
}

#[async_trait]
impl GeoResolver for CachedGeoResolver {
    async fn resolve(&self, ip: &str) -> anyhow::Result<Option<Geo>> {
        if let Some(hit) = self.cache.get(ip).await {
            return Ok(hit);
        }
        let geo = self.inner.resolve(ip).await?;
        debug!(ip, found = geo.is_some(), "Resolved geo");
        self.cache.insert(ip.to_string(), geo.clone()).await;
        Ok(geo)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::GeoCountry;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Counting {
        calls: AtomicUsize,
        inner: StaticGeoResolver,
    }

    #[async_trait]
    impl GeoResolver for Counting {
        async fn resolve(&self, ip: &str) -> anyhow::Result<Option<Geo>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.inner.resolve(ip).await
        }
    }

    #[tokio::test]
    async fn test_cached_lookups() {
        let geo = Geo {
            country: Some(GeoCountry {
                code: "DE".into(),
                name: "Germany".into(),
                is_eu: true,
            }),
            ..Default::default()
        };
        let counting = Arc::new(Counting {
            calls: AtomicUsize::new(0),
            inner: StaticGeoResolver::new(HashMap::from([("1.1.1.1".to_string(), geo.clone())])),
        });
        let cached = CachedGeoResolver::new(counting.clone(), 100, Duration::from_secs(60));

        assert_eq!(cached.resolve("1.1.1.1").await.unwrap(), Some(geo.clone()));
        assert_eq!(cached.resolve("1.1.1.1").await.unwrap(), Some(geo));
        assert_eq!(cached.resolve("2.2.2.2").await.unwrap(), None);
        assert_eq!(cached.resolve("2.2.2.2").await.unwrap(), None);
        assert_eq!(counting.calls.load(Ordering::SeqCst), 2);
    }
}
