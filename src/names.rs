use anyhow::{Context, Result};
use async_trait::async_trait;
use ethers::types::Address;
use futures::future::join_all;
use log::{debug, info, warn};
use reqwest::Client;
use serde::Deserialize;
use std::{collections::HashMap, sync::Arc, time::Duration};
use tokio::sync::RwLock;

use crate::{
    chain::ChainReader,
    clock::Clock,
    kv::KvStore,
    utils::{address_key, parse_address},
};

pub const NAME_PAGE_SIZE: usize = 1_000;

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct NameRecord {
    pub name: String,
    pub address: String,
}

/// Off-chain subname registry.
#[async_trait]
pub trait NameService: Send + Sync {
    async fn list_names(
        &self,
        domain: &str,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<NameRecord>>;

    async fn is_available(&self, domain: &str, label: &str) -> Result<bool>;
}

pub struct NamestoneClient {
    client: Client,
    base_url: String,
    api_key: String,
}

impl NamestoneClient {
    pub fn new(base_url: &str, api_key: &str) -> Result<Self> {
        let client = Client::builder().timeout(Duration::from_secs(10)).build()?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
        })
    }
}

#[async_trait]
impl NameService for NamestoneClient {
    async fn list_names(
        &self,
        domain: &str,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<NameRecord>> {
        let limit = limit.to_string();
        let offset = offset.to_string();
        self.client
            .get(format!("{}/get-names", self.base_url))
            .header("Authorization", &self.api_key)
            .query(&[("domain", domain), ("limit", limit.as_str()), ("offset", offset.as_str())])
            .send()
            .await?
            .error_for_status()?
            .json()
            .await
            .context("Malformed get-names response")
    }

    async fn is_available(&self, domain: &str, label: &str) -> Result<bool> {
        let matches: Vec<NameRecord> = self
            .client
            .get(format!("{}/search-names", self.base_url))
            .header("Authorization", &self.api_key)
            .query(&[("domain", domain), ("name", label), ("exact_match", "1")])
            .send()
            .await?
            .error_for_status()?
            .json()
            .await
            .context("Malformed search-names response")?;

        Ok(!matches.iter().any(|r| r.name.eq_ignore_ascii_case(label)))
    }
}

/// Subname labels: 1 to 63 of `[a-z0-9-]`, no hyphen at either end.
pub fn validate_label(label: &str) -> bool {
    !label.is_empty()
        && label.len() <= 63
        && !label.starts_with('-')
        && !label.ends_with('-')
        && label.chars().all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
}

/// One complete, immutable generation of the name cache.
#[derive(Debug, Clone, Default)]
pub struct NameSnapshot {
    /// Rebuild timestamp; doubles as the cache epoch. Zero means never built.
    pub built_at_ms: u64,
    pub names: HashMap<Address, String>,
}

impl NameSnapshot {
    pub fn epoch(&self) -> u64 {
        self.built_at_ms
    }

    pub fn get(&self, address: &Address) -> Option<&String> {
        self.names.get(address)
    }
}

/// Address to display-name map, rebuilt wholesale once its TTL lapses.
///
/// Readers always get a complete snapshot. A rebuild happens outside the lock and
/// is swapped in at the end, so concurrent readers keep the previous generation
/// until then. Concurrent rebuilds are not coalesced; the last one to finish wins.
pub struct NameCache {
    service: Option<Arc<dyn NameService>>,
    domain: Option<String>,
    kv: Arc<dyn KvStore>,
    clock: Arc<dyn Clock>,
    ttl_ms: u64,
    snapshot: RwLock<Arc<NameSnapshot>>,
}

impl NameCache {
    pub fn new(
        service: Option<Arc<dyn NameService>>,
        domain: Option<String>,
        kv: Arc<dyn KvStore>,
        clock: Arc<dyn Clock>,
        ttl: Duration,
    ) -> Self {
        Self {
            service,
            domain,
            kv,
            clock,
            ttl_ms: ttl.as_millis() as u64,
            snapshot: RwLock::new(Arc::new(NameSnapshot::default())),
        }
    }

    pub async fn current(&self) -> Arc<NameSnapshot> {
        self.snapshot.read().await.clone()
    }

    fn is_fresh(&self, built_at_ms: u64) -> bool {
        built_at_ms > 0 && self.clock.now_ms().saturating_sub(built_at_ms) < self.ttl_ms
    }

    fn names_key(domain: &str) -> String {
        format!("names:{}", domain)
    }

    fn built_at_key(domain: &str) -> String {
        format!("names:{}:built_at", domain)
    }

    /// Returns a snapshot no older than the TTL, rebuilding first if needed.
    /// A failed rebuild keeps serving the previous snapshot.
    pub async fn ensure_fresh(&self) -> Arc<NameSnapshot> {
        let current = self.current().await;
        let (Some(service), Some(domain)) = (&self.service, &self.domain) else {
            return current;
        };
        if self.is_fresh(current.built_at_ms) {
            return current;
        }

        let rebuilt = match self.load_shared(domain).await {
            Some(shared) => shared,
            None => match self.rebuild(service.as_ref(), domain).await {
                Ok(snapshot) => snapshot,
                Err(e) => {
                    warn!(
                        "Name cache rebuild failed, keeping generation {}: {:#}",
                        current.epoch(),
                        e
                    );
                    return current;
                }
            },
        };

        let rebuilt = Arc::new(rebuilt);
        *self.snapshot.write().await = rebuilt.clone();
        rebuilt
    }

    /// Adopts a snapshot another instance already published, if it is still fresh.
    async fn load_shared(&self, domain: &str) -> Option<NameSnapshot> {
        let built_at_ms = match self.kv.get(&Self::built_at_key(domain)).await {
            Ok(Some(raw)) => raw.parse::<u64>().ok()?,
            Ok(None) => return None,
            Err(e) => {
                warn!("Reading shared name cache stamp failed: {:#}", e);
                return None;
            }
        };
        if !self.is_fresh(built_at_ms) {
            return None;
        }

        let raw = match self.kv.hgetall(&Self::names_key(domain)).await {
            Ok(raw) => raw,
            Err(e) => {
                warn!("Reading shared name cache failed: {:#}", e);
                return None;
            }
        };
        let names = raw
            .into_iter()
            .filter_map(|(address, name)| parse_address(&address).map(|a| (a, name)))
            .collect::<HashMap<_, _>>();

        debug!("Adopted shared name cache generation {} ({} names)", built_at_ms, names.len());
        Some(NameSnapshot { built_at_ms, names })
    }

    async fn rebuild(&self, service: &dyn NameService, domain: &str) -> Result<NameSnapshot> {
        let mut names = HashMap::new();
        let mut offset = 0;
        loop {
            let page = service.list_names(domain, NAME_PAGE_SIZE, offset).await?;
            let page_len = page.len();
            for record in page {
                match parse_address(&record.address) {
                    Some(address) => {
                        names.insert(address, format!("{}.{}", record.name, domain));
                    }
                    None => debug!(
                        "Skipping {} with unparseable address {}",
                        record.name, record.address
                    ),
                }
            }
            if page_len < NAME_PAGE_SIZE {
                break;
            }
            offset += page_len;
        }

        let built_at_ms = self.clock.now_ms();
        self.publish(domain, built_at_ms, &names).await;
        info!("Rebuilt name cache generation {} with {} names", built_at_ms, names.len());
        Ok(NameSnapshot { built_at_ms, names })
    }

    async fn publish(&self, domain: &str, built_at_ms: u64, names: &HashMap<Address, String>) {
        let fields: Vec<(String, String)> = names
            .iter()
            .map(|(a, n)| (address_key(a), n.clone()))
            .collect();
        let key = Self::names_key(domain);

        let result = async {
            self.kv.del(&key).await?;
            self.kv.hset(&key, &fields).await?;
            self.kv.set(&Self::built_at_key(domain), &built_at_ms.to_string()).await
        }
        .await;

        if let Err(e) = result {
            warn!("Publishing name cache to KV failed: {:#}", e);
        }
    }
}

/// Cache first, chain reverse record second, bounded by a timeout.
pub struct NameResolver {
    cache: Arc<NameCache>,
    chain: Arc<dyn ChainReader>,
    lookup_timeout: Duration,
}

impl NameResolver {
    pub fn new(
        cache: Arc<NameCache>,
        chain: Arc<dyn ChainReader>,
        lookup_timeout: Duration,
    ) -> Self {
        Self {
            cache,
            chain,
            lookup_timeout,
        }
    }

    pub async fn snapshot(&self) -> Arc<NameSnapshot> {
        self.cache.ensure_fresh().await
    }

    pub async fn resolve(&self, address: Address) -> Option<String> {
        let snapshot = self.snapshot().await;
        self.resolve_in(&snapshot, address).await
    }

    /// Resolves against a fixed snapshot so callers can key results by its epoch.
    pub async fn resolve_in(&self, snapshot: &NameSnapshot, address: Address) -> Option<String> {
        if let Some(name) = snapshot.get(&address) {
            return Some(name.clone());
        }

        match tokio::time::timeout(self.lookup_timeout, self.chain.reverse_name(address)).await {
            Ok(Ok(name)) => name,
            Ok(Err(e)) => {
                warn!("Reverse lookup for {:?} failed: {:#}", address, e);
                None
            }
            Err(_) => {
                debug!("Reverse lookup for {:?} timed out", address);
                None
            }
        }
    }

    pub async fn resolve_all(
        &self,
        snapshot: &NameSnapshot,
        addresses: &[Address],
    ) -> Vec<Option<String>> {
        join_all(addresses.iter().map(|a| self.resolve_in(snapshot, *a))).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_label() {
        assert!(validate_label("zeus"));
        assert!(validate_label("army-1"));
        assert!(!validate_label(""));
        assert!(!validate_label("-zeus"));
        assert!(!validate_label("zeus-"));
        assert!(!validate_label("Zeus"));
        assert!(!validate_label("ze.us"));
        assert!(!validate_label(&"a".repeat(64)));
    }
}
