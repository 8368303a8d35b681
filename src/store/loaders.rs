//! [`EntityLoader`]s reading entity lists from a JSON file or an HTTP
//! endpoint

use crate::store::entities::{Connection, EntityRecords, FunctionConfig};
use crate::store::EntityLoader;
use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use siphasher::sip::SipHasher13;
use std::hash::Hasher;
use std::marker::PhantomData;
use std::path::PathBuf;
use std::time::Duration;
use tracing::debug;

/// An entity that can be keyed in [`EntityRecords`]
pub trait Entity: DeserializeOwned + Send + Sync + 'static {
    /// Record id
    fn entity_id(&self) -> &str;

    /// Modification time, when the entity carries one
    fn modified(&self) -> Option<DateTime<Utc>> {
        None
    }
}

impl Entity for Connection {
    fn entity_id(&self) -> &str {
        &self.id
    }

    fn modified(&self) -> Option<DateTime<Utc>> {
        Some(self.updated_at)
    }
}

impl Entity for FunctionConfig {
    fn entity_id(&self) -> &str {
        &self.id
    }
}

/// Tracks when a payload last changed, for entities without timestamps
#[derive(Default)]
struct ContentClock {
    last: Mutex<Option<(u64, DateTime<Utc>)>>,
}

impl ContentClock {
    fn observe(&self, body: &[u8]) -> DateTime<Utc> {
        let mut hasher = SipHasher13::new();
        hasher.write(body);
        let hash = hasher.finish();

        let mut last = self.last.lock();
        match *last {
            Some((seen, at)) if seen == hash => at,
            _ => {
                let now = Utc::now();
                *last = Some((hash, now));
                now
            }
        }
    }
}

fn to_records<T: Entity>(body: &[u8], clock: &ContentClock) -> anyhow::Result<EntityRecords<T>> {
    let items: Vec<T> = serde_json::from_slice(body).context("Malformed entity list")?;
    let last_modified = items
        .iter()
        .filter_map(Entity::modified)
        .max()
        .unwrap_or_else(|| clock.observe(body));
    Ok(EntityRecords::new(
        items.into_iter().map(|item| (item.entity_id().to_string(), item)),
        last_modified,
    ))
}

/// Loads a JSON array of entities from a file
pub struct JsonFileLoader<T> {
    path: PathBuf,
    clock: ContentClock,
    _entity: PhantomData<fn() -> T>,
}

impl<T> JsonFileLoader<T> {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            clock: ContentClock::default(),
            _entity: PhantomData,
        }
    }
}

#[async_trait]
impl<T: Entity> EntityLoader<EntityRecords<T>> for JsonFileLoader<T> {
    async fn load(&self) -> anyhow::Result<EntityRecords<T>> {
        let body = tokio::fs::read(&self.path)
            .await
            .with_context(|| format!("Cannot read {}", self.path.display()))?;
        let records = to_records(&body, &self.clock)?;
        debug!(
            path = %self.path.display(),
            objects = records.objects.len(),
            "Loaded entities from file"
        );
        Ok(records)
    }
}

/// Loads a JSON array of entities from an HTTP endpoint
pub struct HttpLoader<T> {
    client: reqwest::Client,
    url: String,
    token: Option<String>,
    timeout: Duration,
    clock: ContentClock,
    _entity: PhantomData<fn() -> T>,
}

impl<T> HttpLoader<T> {
    pub fn new(url: impl Into<String>, token: Option<String>, timeout: Duration) -> Self {
        Self {
            client: reqwest::Client::new(),
            url: url.into(),
            token,
            timeout,
            clock: ContentClock::default(),
            _entity: PhantomData,
        }
    }
}

#[async_trait]
impl<T: Entity> EntityLoader<EntityRecords<T>> for HttpLoader<T> {
    async fn load(&self) -> anyhow::Result<EntityRecords<T>> {
        let mut request = self.client.get(&self.url).timeout(self.timeout);
        if let Some(token) = &self.token {
            request = request.bearer_auth(token);
        }
        let response = request
            .send()
            .await
            .with_context(|| format!("GET {} failed", self.url))?
            .error_for_status()?;
        let body = response.bytes().await?;
        let records = to_records(&body, &self.clock)?;
        debug!(url = %self.url, objects = records.objects.len(), "Loaded entities over HTTP");
        Ok(records)
    }
}
