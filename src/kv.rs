use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use dashmap::DashMap;
use log::warn;
use reqwest::Client;
use serde::Deserialize;
use serde_json::Value;
use std::{collections::HashMap, sync::Arc, time::Duration};

use crate::metrics;

/// Minimal key-value surface the caches need.
#[async_trait]
pub trait KvStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>>;
    async fn set(&self, key: &str, value: &str) -> Result<()>;
    async fn del(&self, key: &str) -> Result<()>;
    async fn hgetall(&self, key: &str) -> Result<HashMap<String, String>>;
    async fn hset(&self, key: &str, fields: &[(String, String)]) -> Result<()>;
}

#[derive(Debug, Default)]
pub struct MemoryKv {
    strings: DashMap<String, String>,
    hashes: DashMap<String, HashMap<String, String>>,
}

impl MemoryKv {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.strings.len() + self.hashes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl KvStore for MemoryKv {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self.strings.get(key).map(|v| v.value().clone()))
    }

    async fn set(&self, key: &str, value: &str) -> Result<()> {
        self.strings.insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn del(&self, key: &str) -> Result<()> {
        self.strings.remove(key);
        self.hashes.remove(key);
        Ok(())
    }

    async fn hgetall(&self, key: &str) -> Result<HashMap<String, String>> {
        Ok(self.hashes.get(key).map(|h| h.value().clone()).unwrap_or_default())
    }

    async fn hset(&self, key: &str, fields: &[(String, String)]) -> Result<()> {
        let mut hash = self.hashes.entry(key.to_string()).or_default();
        for (field, value) in fields {
            hash.insert(field.clone(), value.clone());
        }
        Ok(())
    }
}

#[derive(Debug, Deserialize)]
struct RestReply {
    result: Option<Value>,
    error: Option<String>,
}

/// Managed store spoken to over the Upstash-style REST protocol.
pub struct RestKv {
    client: Client,
    url: String,
    token: String,
}

impl RestKv {
    pub fn new(url: &str, token: &str) -> Result<Self> {
        let client = Client::builder().timeout(Duration::from_secs(5)).build()?;
        Ok(Self {
            client,
            url: url.trim_end_matches('/').to_string(),
            token: token.to_string(),
        })
    }

    async fn command(&self, args: Vec<&str>) -> Result<Value> {
        let op = args.first().copied().unwrap_or_default().to_string();
        let reply: RestReply = self
            .client
            .post(&self.url)
            .bearer_auth(&self.token)
            .json(&args)
            .send()
            .await
            .with_context(|| format!("KV {} request failed", op))?
            .json()
            .await
            .with_context(|| format!("KV {} returned malformed JSON", op))?;

        if let Some(error) = reply.error {
            return Err(anyhow!("KV {} failed: {}", op, error));
        }
        Ok(reply.result.unwrap_or(Value::Null))
    }
}

#[async_trait]
impl KvStore for RestKv {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        match self.command(vec!["GET", key]).await? {
            Value::Null => Ok(None),
            Value::String(s) => Ok(Some(s)),
            other => Ok(Some(other.to_string())),
        }
    }

    async fn set(&self, key: &str, value: &str) -> Result<()> {
        self.command(vec!["SET", key, value]).await?;
        Ok(())
    }

    async fn del(&self, key: &str) -> Result<()> {
        self.command(vec!["DEL", key]).await?;
        Ok(())
    }

    async fn hgetall(&self, key: &str) -> Result<HashMap<String, String>> {
        let flat = match self.command(vec!["HGETALL", key]).await? {
            Value::Array(items) => items,
            Value::Null => Vec::new(),
            other => return Err(anyhow!("KV HGETALL returned unexpected value: {}", other)),
        };

        Ok(flat
            .chunks(2)
            .filter_map(|pair| match pair {
                [Value::String(field), Value::String(value)] => {
                    Some((field.clone(), value.clone()))
                }
                _ => None,
            })
            .collect())
    }

    async fn hset(&self, key: &str, fields: &[(String, String)]) -> Result<()> {
        if fields.is_empty() {
            return Ok(());
        }
        let mut args = vec!["HSET", key];
        for (field, value) in fields {
            args.push(field);
            args.push(value);
        }
        self.command(args).await?;
        Ok(())
    }
}

/// Serves every operation from an in-process map whenever the primary store errors.
pub struct FallbackKv {
    primary: Arc<dyn KvStore>,
    fallback: MemoryKv,
}

impl FallbackKv {
    pub fn new(primary: Arc<dyn KvStore>) -> Self {
        Self {
            primary,
            fallback: MemoryKv::new(),
        }
    }
}

#[async_trait]
impl KvStore for FallbackKv {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        match self.primary.get(key).await {
            Ok(value) => Ok(value),
            Err(e) => {
                warn!("KV get {} failed, using in-memory store: {:#}", key, e);
                metrics::record_kv_fallback("get");
                self.fallback.get(key).await
            }
        }
    }

    async fn set(&self, key: &str, value: &str) -> Result<()> {
        if let Err(e) = self.primary.set(key, value).await {
            warn!("KV set {} failed, using in-memory store: {:#}", key, e);
            metrics::record_kv_fallback("set");
            self.fallback.set(key, value).await?;
        }
        Ok(())
    }

    async fn del(&self, key: &str) -> Result<()> {
        if let Err(e) = self.primary.del(key).await {
            warn!("KV del {} failed, using in-memory store: {:#}", key, e);
            metrics::record_kv_fallback("del");
        }
        self.fallback.del(key).await
    }

    async fn hgetall(&self, key: &str) -> Result<HashMap<String, String>> {
        match self.primary.hgetall(key).await {
            Ok(value) => Ok(value),
            Err(e) => {
                warn!("KV hgetall {} failed, using in-memory store: {:#}", key, e);
                metrics::record_kv_fallback("hgetall");
                self.fallback.hgetall(key).await
            }
        }
    }

    async fn hset(&self, key: &str, fields: &[(String, String)]) -> Result<()> {
        if let Err(e) = self.primary.hset(key, fields).await {
            warn!("KV hset {} failed, using in-memory store: {:#}", key, e);
            metrics::record_kv_fallback("hset");
            self.fallback.hset(key, fields).await?;
        }
        Ok(())
    }
}
