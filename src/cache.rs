use anyhow::Result;
use log::{debug, warn};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::{fmt, future::Future, sync::Arc, time::Duration};

use crate::{clock::Clock, kv::KvStore, metrics};

/// A cache family plus the name-cache epoch its values were resolved against.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheKey {
    pub family: String,
    pub epoch: u64,
}

impl CacheKey {
    pub fn new(family: impl Into<String>, epoch: u64) -> Self {
        Self {
            family: family.into(),
            epoch,
        }
    }

    /// Where the most recently written key of this family is recorded.
    pub fn pointer(&self) -> String {
        format!("{}:current", self.family)
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:e{}", self.family, self.epoch)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CachedEntry<T> {
    pub generated_at_ms: u64,
    pub value: T,
}

/// Read-through, time-bounded cache over a `KvStore`.
///
/// There is no single-flight: two callers missing at the same time both compute
/// and the later write wins.
pub struct ResultCache {
    kv: Arc<dyn KvStore>,
    clock: Arc<dyn Clock>,
}

impl ResultCache {
    pub fn new(kv: Arc<dyn KvStore>, clock: Arc<dyn Clock>) -> Self {
        Self { kv, clock }
    }

    pub async fn get_or_compute<T, F, Fut>(
        &self,
        key: &CacheKey,
        ttl: Duration,
        compute: F,
    ) -> Result<CachedEntry<T>>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let storage_key = key.to_string();
        if let Some(entry) = self.read::<T>(&storage_key).await {
            let age = self.clock.now_ms().saturating_sub(entry.generated_at_ms);
            if age < ttl.as_millis() as u64 {
                debug!("Cache hit {} (age {}ms)", storage_key, age);
                metrics::record_cache_hit();
                return Ok(entry);
            }
        }

        metrics::record_cache_miss();
        let value = compute().await?;
        let entry = CachedEntry {
            generated_at_ms: self.clock.now_ms(),
            value,
        };
        self.write(&storage_key, &entry).await;
        self.retire_previous(key).await;
        Ok(entry)
    }

    async fn read<T: DeserializeOwned>(&self, storage_key: &str) -> Option<CachedEntry<T>> {
        match self.kv.get(storage_key).await {
            Ok(Some(raw)) => match serde_json::from_str(&raw) {
                Ok(entry) => Some(entry),
                Err(e) => {
                    warn!("Discarding undecodable cache entry {}: {}", storage_key, e);
                    None
                }
            },
            Ok(None) => None,
            Err(e) => {
                warn!("Cache read {} failed: {:#}", storage_key, e);
                None
            }
        }
    }

    async fn write<T: Serialize>(&self, storage_key: &str, entry: &CachedEntry<T>) {
        let raw = match serde_json::to_string(entry) {
            Ok(raw) => raw,
            Err(e) => {
                warn!("Cache entry {} not serializable: {}", storage_key, e);
                return;
            }
        };
        if let Err(e) = self.kv.set(storage_key, &raw).await {
            warn!("Cache write {} failed: {:#}", storage_key, e);
        }
    }

    /// Best effort: drops the family's previous epoch key and records the new one.
    async fn retire_previous(&self, key: &CacheKey) {
        let pointer = key.pointer();
        let current = key.to_string();

        match self.kv.get(&pointer).await {
            Ok(Some(previous)) if previous != current => {
                if let Err(e) = self.kv.del(&previous).await {
                    warn!("Deleting stale cache key {} failed: {:#}", previous, e);
                }
            }
            Ok(_) => {}
            Err(e) => warn!("Reading cache pointer {} failed: {:#}", pointer, e),
        }

        if let Err(e) = self.kv.set(&pointer, &current).await {
            warn!("Updating cache pointer {} failed: {:#}", pointer, e);
        }
    }
}
