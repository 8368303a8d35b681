//! Stale-while-revalidate entity stores
//!
//! An [`EntityStore`] keeps one value (typically [`EntityRecords`] of
//! connections or functions) in memory and refreshes it in the background:
//! - the first `get()` waits for the initial load, later calls never block
//! - a failed refresh keeps serving the previous value (`outdated`)
//! - every successful load is persisted to disk, and the snapshot is used
//!   when the very first load fails
//!
//! # Example
//!
//! ```no_run
//! use rotor::store::{EntityLoader, EntityStore, EntityRecords, StoreOptions, Connection};
//! use async_trait::async_trait;
//! use std::sync::Arc;
//!
//! struct ConnectionsFromApi;
//!
//! #[async_trait]
//! impl EntityLoader<EntityRecords<Connection>> for ConnectionsFromApi {
//!     async fn load(&self) -> anyhow::Result<EntityRecords<Connection>> {
//!         Ok(EntityRecords::from_connections(vec![]))
//!     }
//! }
//!
//! # async fn example() -> anyhow::Result<()> {
//! let store = EntityStore::new(
//!     "connections",
//!     Arc::new(ConnectionsFromApi),
//!     StoreOptions::default(),
//! );
//! let connections = store.get().await?;
//! # Ok(())
//! # }
//! ```

pub mod disk;
pub mod entities;
pub mod loaders;

pub use disk::DiskCache;
pub use entities::{
    Connection, ConnectionOptions, EntityRecords, FunctionConfig, FunctionRef, ObjectStore,
    StaticObjectStore,
};
pub use loaders::{Entity, HttpLoader, JsonFileLoader};

use crate::error::{RotorError, RotorResult};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Source of fresh values for a store
#[async_trait]
pub trait EntityLoader<T>: Send + Sync + 'static {
    /// Load the complete current value
    async fn load(&self) -> anyhow::Result<T>;
}

/// Lifecycle state of a store
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreStatus {
    /// Initial load not finished
    Initializing,
    /// Last refresh succeeded
    Ok,
    /// Serving a previous or disk-cached value
    Outdated,
    /// No value available
    Failed,
    /// Refresh loop stopped
    Stopped,
}

/// Store options
#[derive(Debug, Clone)]
pub struct StoreOptions {
    /// Interval between background refreshes
    pub refresh_interval: Duration,
    /// Snapshot location; `None` disables disk fallback
    pub disk_cache: Option<DiskCache>,
}

impl Default for StoreOptions {
    fn default() -> Self {
        Self {
            refresh_interval: Duration::from_secs(10),
            disk_cache: None,
        }
    }
}

/// Health report of one store
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoreHealth {
    /// Store name
    pub name: String,
    /// Current status
    pub status: StoreStatus,
    /// Time of the last successful refresh
    pub last_refresh: Option<DateTime<Utc>>,
    /// Last refresh error
    pub last_error: Option<String>,
}

/// Anything that can report store health, for `/health`
pub trait StoreHealthSource: Send + Sync {
    /// Current health
    fn health(&self) -> StoreHealth;
}

struct Snapshot<T> {
    value: Option<Arc<T>>,
    status: StoreStatus,
    last_refresh: Option<DateTime<Utc>>,
    last_error: Option<String>,
}

struct Inner<T> {
    name: String,
    loader: Arc<dyn EntityLoader<T>>,
    state: watch::Sender<Snapshot<T>>,
    disk: Option<DiskCache>,
    refresh_lock: Mutex<()>,
    cancel: CancellationToken,
}

/// Stale-while-revalidate cache with disk fallback
pub struct EntityStore<T> {
    inner: Arc<Inner<T>>,
}

impl<T> Clone for EntityStore<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T> EntityStore<T>
where
    T: Serialize + DeserializeOwned + Send + Sync + 'static,
{
    /// Create the store and start its refresh loop. Must be called inside a
    /// Tokio runtime.
    pub fn new<L: EntityLoader<T>>(
        name: impl Into<String>,
        loader: Arc<L>,
        options: StoreOptions,
    ) -> Self {
        Self::with_loader(name, loader, options)
    }

    /// Same as [`EntityStore::new`] for an already type-erased loader
    pub fn with_loader(
        name: impl Into<String>,
        loader: Arc<dyn EntityLoader<T>>,
        options: StoreOptions,
    ) -> Self {
        let (state, _) = watch::channel(Snapshot {
            value: None,
            status: StoreStatus::Initializing,
            last_refresh: None,
            last_error: None,
        });
        let inner = Arc::new(Inner {
            name: name.into(),
            loader,
            state,
            disk: options.disk_cache,
            refresh_lock: Mutex::new(()),
            cancel: CancellationToken::new(),
        });

        tokio::spawn(refresh_loop(
            Arc::downgrade(&inner),
            inner.cancel.clone(),
            options.refresh_interval,
        ));

        Self { inner }
    }

    /// Current value, waiting for the initial load if necessary.
    /// Fails only when no value is available at all.
    pub async fn get(&self) -> RotorResult<Arc<T>> {
        let mut rx = self.inner.state.subscribe();
        let snapshot = rx
            .wait_for(|s| s.value.is_some() || s.status != StoreStatus::Initializing)
            .await
            .map_err(|_| self.refresh_error("store closed".to_string()))?;
        match &snapshot.value {
            Some(value) => Ok(value.clone()),
            None => Err(self.refresh_error(
                snapshot
                    .last_error
                    .clone()
                    .unwrap_or_else(|| "no value loaded".to_string()),
            )),
        }
    }

    /// Run a refresh now. Waits for an in-flight refresh instead of starting
    /// a second one concurrently.
    pub async fn refresh_now(&self) {
        self.inner.refresh().await;
    }
}

impl<T> EntityStore<T> {
    /// Current value without waiting
    pub fn get_current(&self) -> Option<Arc<T>> {
        self.inner.state.borrow().value.clone()
    }

    /// Current status
    pub fn status(&self) -> StoreStatus {
        self.inner.state.borrow().status
    }

    /// Time of the last successful refresh
    pub fn last_refresh(&self) -> Option<DateTime<Utc>> {
        self.inner.state.borrow().last_refresh
    }

    /// Store name
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Stop background refreshes. The last value stays available.
    pub fn stop(&self) {
        self.inner.cancel.cancel();
        self.inner.state.send_modify(|s| s.status = StoreStatus::Stopped);
        info!(store = %self.inner.name, "Entity store stopped");
    }

    fn refresh_error(&self, message: String) -> RotorError {
        RotorError::StoreRefresh {
            store: self.inner.name.clone(),
            message,
        }
    }
}

impl<T: Send + Sync> StoreHealthSource for EntityStore<T> {
    fn health(&self) -> StoreHealth {
        let state = self.inner.state.borrow();
        StoreHealth {
            name: self.inner.name.clone(),
            status: state.status,
            last_refresh: state.last_refresh,
            last_error: state.last_error.clone(),
        }
    }
}

impl<T: Clone + Send + Sync> ObjectStore<T> for EntityStore<EntityRecords<T>> {
    fn get_object(&self, id: &str) -> Option<T> {
        self.get_current()
            .and_then(|records| records.objects.get(id).cloned())
    }

    fn last_modified(&self) -> Option<DateTime<Utc>> {
        self.get_current().map(|records| records.last_modified)
    }
}

impl<T> Inner<T>
where
    T: Serialize + DeserializeOwned + Send + Sync + 'static,
{
    async fn refresh(&self) {
        let _guard = self.refresh_lock.lock().await;
        if self.cancel.is_cancelled() {
            return;
        }

        let result = self.loader.load().await;
        if self.cancel.is_cancelled() {
            debug!(store = %self.name, "Discarding refresh result of stopped store");
            return;
        }

        match result {
            Ok(value) => {
                let value = Arc::new(value);
                self.persist(value.clone());
                self.publish(|s| {
                    s.value = Some(value);
                    s.status = StoreStatus::Ok;
                    s.last_refresh = Some(Utc::now());
                    s.last_error = None;
                });
                debug!(store = %self.name, "Entity store refreshed");
            }
            Err(e) => {
                let message = format!("{e:#}");
                let has_value = self.state.borrow().value.is_some();
                if has_value {
                    warn!(
                        store = %self.name,
                        error = %message,
                        "Refresh failed, serving previous value"
                    );
                    self.publish(|s| {
                        s.status = StoreStatus::Outdated;
                        s.last_error = Some(message);
                    });
                    return;
                }

                let cached = match &self.disk {
                    Some(disk) => disk.load::<T>(&self.name).await,
                    None => None,
                };
                match cached {
                    Some(value) => {
                        warn!(
                            store = %self.name,
                            error = %message,
                            "Initial load failed, using disk snapshot"
                        );
                        self.publish(|s| {
                            s.value = Some(Arc::new(value));
                            s.status = StoreStatus::Outdated;
                            s.last_error = Some(message);
                        });
                    }
                    None => {
                        error!(
                            store = %self.name,
                            error = %message,
                            "Initial load failed and no disk snapshot exists"
                        );
                        self.publish(|s| {
                            s.status = StoreStatus::Failed;
                            s.last_error = Some(message);
                        });
                    }
                }
            }
        }
    }

    /// Apply `update` to the snapshot. A stopped store stays `Stopped` even
    /// when `stop()` lands while a refresh is finishing.
    fn publish(&self, update: impl FnOnce(&mut Snapshot<T>)) {
        self.state.send_modify(|s| {
            update(s);
            if self.cancel.is_cancelled() {
                s.status = StoreStatus::Stopped;
            }
        });
    }

    fn persist(&self, value: Arc<T>) {
        let Some(disk) = self.disk.clone() else {
            return;
        };
        let name = self.name.clone();
        tokio::spawn(async move {
            if let Err(e) = disk.save(&name, value.as_ref()).await {
                warn!(store = %name, error = %e, "Failed to persist store snapshot");
            }
        });
    }
}

async fn refresh_loop<T>(inner: Weak<Inner<T>>, cancel: CancellationToken, interval: Duration)
where
    T: Serialize + DeserializeOwned + Send + Sync + 'static,
{
    match inner.upgrade() {
        Some(inner) => inner.refresh().await,
        None => return,
    }
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(interval) => {}
        }
        match inner.upgrade() {
            Some(inner) => inner.refresh().await,
            None => break,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use tempfile::TempDir;

    struct CountingLoader {
        calls: AtomicUsize,
        fail: AtomicBool,
        delay: Duration,
    }

    impl CountingLoader {
        fn new(fail: bool) -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
                fail: AtomicBool::new(fail),
                delay: Duration::ZERO,
            })
        }
    }

    #[async_trait]
    impl EntityLoader<Vec<u32>> for CountingLoader {
        async fn load(&self) -> anyhow::Result<Vec<u32>> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst) as u32;
            tokio::time::sleep(self.delay).await;
            if self.fail.load(Ordering::SeqCst) {
                anyhow::bail!("config source unavailable");
            }
            Ok(vec![n])
        }
    }

    fn options(interval: Duration, disk: Option<DiskCache>) -> StoreOptions {
        StoreOptions {
            refresh_interval: interval,
            disk_cache: disk,
        }
    }

    #[tokio::test]
    async fn test_initial_load() {
        let loader = CountingLoader::new(false);
        let store = EntityStore::new(
            "numbers",
            loader.clone(),
            options(Duration::from_secs(3600), None),
        );
        assert_eq!(*store.get().await.unwrap(), vec![0]);
        assert_eq!(store.status(), StoreStatus::Ok);
        assert!(store.last_refresh().is_some());
    }

    #[tokio::test]
    async fn test_concurrent_get_shares_initial_load() {
        let loader = Arc::new(CountingLoader {
            calls: AtomicUsize::new(0),
            fail: AtomicBool::new(false),
            delay: Duration::from_millis(50),
        });
        let store = EntityStore::new(
            "numbers",
            loader.clone(),
            options(Duration::from_secs(3600), None),
        );
        let gets = (0..10).map(|_| {
            let store = store.clone();
            tokio::spawn(async move { store.get().await.map(|v| v[0]) })
        });
        for handle in gets {
            assert_eq!(handle.await.unwrap().unwrap(), 0);
        }
        assert_eq!(loader.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_failed_without_snapshot() {
        let loader = CountingLoader::new(true);
        let store: EntityStore<Vec<u32>> =
            EntityStore::new("numbers", loader, options(Duration::from_secs(3600), None));
        let err = store.get().await.unwrap_err();
        assert!(matches!(err, RotorError::StoreRefresh { .. }));
        assert_eq!(store.status(), StoreStatus::Failed);
        assert!(store.health().last_error.unwrap().contains("unavailable"));
    }

    #[tokio::test]
    async fn test_disk_snapshot_fallback() {
        let tmp = TempDir::new().unwrap();
        let disk = DiskCache::new(tmp.path());
        disk.save("numbers", &vec![42u32]).await.unwrap();

        let loader = CountingLoader::new(true);
        let store: EntityStore<Vec<u32>> = EntityStore::new(
            "numbers",
            loader,
            options(Duration::from_millis(20), Some(disk)),
        );
        assert_eq!(*store.get().await.unwrap(), vec![42]);
        assert_eq!(store.status(), StoreStatus::Outdated);

        // keeps refreshing, keeps failing, never becomes failed
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(store.status(), StoreStatus::Outdated);
        assert_eq!(*store.get().await.unwrap(), vec![42]);
    }

    #[tokio::test]
    async fn test_successful_load_is_persisted() {
        let tmp = TempDir::new().unwrap();
        let disk = DiskCache::new(tmp.path());
        let loader = CountingLoader::new(false);
        let store = EntityStore::new(
            "numbers",
            loader,
            options(Duration::from_secs(3600), Some(disk.clone())),
        );
        store.get().await.unwrap();

        let mut persisted = None;
        for _ in 0..50 {
            persisted = disk.load::<Vec<u32>>("numbers").await;
            if persisted.is_some() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(persisted, Some(vec![0]));
    }

    #[tokio::test]
    async fn test_refresh_failure_keeps_value() {
        let loader = CountingLoader::new(false);
        let store = EntityStore::new(
            "numbers",
            loader.clone(),
            options(Duration::from_secs(3600), None),
        );
        assert_eq!(*store.get().await.unwrap(), vec![0]);

        loader.fail.store(true, Ordering::SeqCst);
        store.refresh_now().await;
        assert_eq!(store.status(), StoreStatus::Outdated);
        assert_eq!(*store.get().await.unwrap(), vec![0]);

        loader.fail.store(false, Ordering::SeqCst);
        store.refresh_now().await;
        assert_eq!(store.status(), StoreStatus::Ok);
        assert_eq!(*store.get().await.unwrap(), vec![2]);
    }

    #[tokio::test]
    async fn test_stop_keeps_last_value() {
        let loader = CountingLoader::new(false);
        let store = EntityStore::new(
            "numbers",
            loader.clone(),
            options(Duration::from_millis(10), None),
        );
        store.get().await.unwrap();
        store.stop();
        assert_eq!(store.status(), StoreStatus::Stopped);

        let calls = loader.calls.load(Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(loader.calls.load(Ordering::SeqCst), calls);
        assert!(store.get().await.is_ok());
        assert_eq!(store.status(), StoreStatus::Stopped);
    }

    #[tokio::test]
    async fn test_late_refresh_does_not_restart_stopped_store() {
        let loader = CountingLoader::new(false);
        let store = EntityStore::new("numbers", loader, options(Duration::from_secs(3600), None));
        store.get().await.unwrap();
        store.stop();

        // a refresh that passed its cancellation check just before stop()
        store.inner.publish(|s| {
            s.value = Some(Arc::new(vec![7]));
            s.status = StoreStatus::Ok;
        });

        assert_eq!(store.status(), StoreStatus::Stopped);
        assert_eq!(*store.get_current().unwrap(), vec![7]);
    }

    #[tokio::test]
    async fn test_object_store_view() {
        struct Records;

        #[async_trait]
        impl EntityLoader<EntityRecords<String>> for Records {
            async fn load(&self) -> anyhow::Result<EntityRecords<String>> {
                Ok(EntityRecords::new(
                    vec![("a".to_string(), "alpha".to_string())],
                    Utc::now(),
                ))
            }
        }

        let store = EntityStore::new("records", Arc::new(Records), StoreOptions::default());
        store.get().await.unwrap();
        assert_eq!(store.get_object("a").as_deref(), Some("alpha"));
        assert!(store.last_modified().is_some());
    }
}
