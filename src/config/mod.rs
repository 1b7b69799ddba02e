use anyhow::{anyhow, Context, Result};
use ethers::types::Address;
use serde::{Deserialize, Serialize};
use std::{env, net::SocketAddr, str::FromStr, time::Duration};
use validator::{Validate, ValidationError};

use crate::utils::parse_address;

pub const DEFAULT_NAMESTONE_URL: &str = "https://namestone.com/api/public_v1";
pub const DEFAULT_BIND_ADDR: &str = "0.0.0.0:3000";

/// Burn sinks that never count as holders.
pub const BURN_ADDRESSES: &[&str] = &[
    "0x0000000000000000000000000000000000000000",
    "0x000000000000000000000000000000000000dEaD",
];

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct AppConfig {
    // Network configuration
    #[validate(custom = "validate_rpc_url")]
    pub rpc_url: String,

    // Contract addresses
    #[validate(custom = "validate_address")]
    pub token_address: Address,
    #[validate(custom = "validate_address")]
    pub wrapped_token_address: Option<Address>,
    #[validate(custom = "validate_address")]
    pub lp_pool_address: Option<Address>,
    pub excluded_addresses: Vec<Address>,

    // Off-chain names
    pub ens_domain: Option<String>,
    pub namestone_api_key: Option<String>,
    #[validate(custom = "validate_http_url")]
    pub namestone_url: String,

    // Managed KV store
    #[validate(custom = "validate_http_url")]
    pub kv_rest_url: Option<String>,
    pub kv_rest_token: Option<String>,

    // Serving
    pub bind_addr: SocketAddr,
    pub metrics_addr: Option<SocketAddr>,
    pub log_level: String,
}

impl AppConfig {
    pub fn from_env() -> Result<Self> {
        let rpc_url = required("RPC_URL")?;
        let token_address = required_address("TOKEN_ADDRESS")?;
        let wrapped_token_address = optional_address("WRAPPED_TOKEN_ADDRESS")?;
        let lp_pool_address = optional_address("LP_POOL_ADDRESS")?;

        let excluded_addresses = match optional("EXCLUDED_ADDRESSES") {
            Some(list) => list
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(|s| {
                    parse_address(s).ok_or_else(|| anyhow!("EXCLUDED_ADDRESSES: bad address {}", s))
                })
                .collect::<Result<Vec<_>>>()?,
            None => Vec::new(),
        };

        let bind_addr = optional("BIND_ADDR")
            .unwrap_or_else(|| DEFAULT_BIND_ADDR.to_string())
            .parse()
            .context("BIND_ADDR must be host:port")?;
        let metrics_addr = optional("METRICS_ADDR")
            .map(|s| s.parse().context("METRICS_ADDR must be host:port"))
            .transpose()?;

        Ok(Self {
            rpc_url,
            token_address,
            wrapped_token_address,
            lp_pool_address,
            excluded_addresses,
            ens_domain: optional("ENS_DOMAIN"),
            namestone_api_key: optional("NAMESTONE_API_KEY"),
            namestone_url: optional("NAMESTONE_URL")
                .unwrap_or_else(|| DEFAULT_NAMESTONE_URL.to_string()),
            kv_rest_url: optional("KV_REST_API_URL"),
            kv_rest_token: optional("KV_REST_API_TOKEN"),
            bind_addr,
            metrics_addr,
            log_level: optional("LOG_LEVEL").unwrap_or_else(|| "info".to_string()),
        })
    }

    pub fn validate_all(&self) -> Result<()> {
        if let Err(e) = self.validate() {
            return Err(anyhow!("Configuration validation failed: {:?}", e));
        }

        if self.lp_pool_address == Some(self.token_address)
            || self.wrapped_token_address == Some(self.token_address)
        {
            return Err(anyhow!("Token, wrapped token and LP pool addresses must differ"));
        }

        if self.namestone_api_key.is_some() && self.ens_domain.is_none() {
            return Err(anyhow!("NAMESTONE_API_KEY is set but ENS_DOMAIN is missing"));
        }

        Ok(())
    }

    /// Addresses that are never ranked: burn sinks, the LP pool and any configured extras.
    pub fn all_excluded(&self) -> Vec<Address> {
        let mut excluded: Vec<Address> =
            BURN_ADDRESSES.iter().filter_map(|a| parse_address(a)).collect();
        excluded.extend(self.lp_pool_address);
        excluded.extend(self.excluded_addresses.iter().copied());
        excluded
    }

    pub fn kv_backend(&self) -> Option<(&str, &str)> {
        match (&self.kv_rest_url, &self.kv_rest_token) {
            (Some(url), Some(token)) => Some((url.as_str(), token.as_str())),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct RuntimeConfig {
    #[validate(range(min = 1))]
    pub lookback_blocks: u64,
    #[validate(range(min = 1))]
    pub candidate_cap: usize,
    #[validate(range(min = 1, max = 50))]
    pub balance_batch_size: usize,
    pub name_cache_ttl: Duration,
    pub result_cache_ttl: Duration,
    pub reverse_lookup_timeout: Duration,
    pub fallback_price_usd: f64,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            lookback_blocks: 50_000,
            candidate_cap: 2_000,
            balance_batch_size: 50,
            name_cache_ttl: Duration::from_secs(300),
            result_cache_ttl: Duration::from_secs(300),
            reverse_lookup_timeout: Duration::from_millis(1_000),
            fallback_price_usd: 0.0,
        }
    }
}

impl RuntimeConfig {
    pub fn from_env() -> Result<Self> {
        let defaults = Self::default();
        let config = Self {
            lookback_blocks: parsed("LOOKBACK_BLOCKS")?.unwrap_or(defaults.lookback_blocks),
            candidate_cap: parsed("CANDIDATE_CAP")?.unwrap_or(defaults.candidate_cap),
            balance_batch_size: parsed::<usize>("BALANCE_BATCH_SIZE")?
                .map(|n| n.clamp(1, 50))
                .unwrap_or(defaults.balance_batch_size),
            name_cache_ttl: parsed("NAME_CACHE_TTL_SECS")?
                .map(Duration::from_secs)
                .unwrap_or(defaults.name_cache_ttl),
            result_cache_ttl: parsed("RESULT_CACHE_TTL_SECS")?
                .map(Duration::from_secs)
                .unwrap_or(defaults.result_cache_ttl),
            reverse_lookup_timeout: parsed::<u64>("REVERSE_LOOKUP_TIMEOUT_MS")?
                .map(|ms| Duration::from_millis(ms.min(1_000)))
                .unwrap_or(defaults.reverse_lookup_timeout),
            fallback_price_usd: parsed("FALLBACK_PRICE_USD")?
                .unwrap_or(defaults.fallback_price_usd),
        };

        config
            .validate()
            .map_err(|e| anyhow!("Runtime configuration validation failed: {:?}", e))?;
        Ok(config)
    }
}

fn optional(key: &str) -> Option<String> {
    env::var(key).ok().map(|v| v.trim().to_string()).filter(|v| !v.is_empty())
}

fn required(key: &str) -> Result<String> {
    optional(key).ok_or_else(|| anyhow!("Missing required environment variable {}", key))
}

fn required_address(key: &str) -> Result<Address> {
    let raw = required(key)?;
    parse_address(&raw).ok_or_else(|| anyhow!("{} is not a valid address: {}", key, raw))
}

fn optional_address(key: &str) -> Result<Option<Address>> {
    optional(key)
        .map(|raw| {
            parse_address(&raw).ok_or_else(|| anyhow!("{} is not a valid address: {}", key, raw))
        })
        .transpose()
}

fn parsed<T: FromStr>(key: &str) -> Result<Option<T>> {
    optional(key)
        .map(|raw| raw.parse::<T>().map_err(|_| anyhow!("{} has an invalid value: {}", key, raw)))
        .transpose()
}

// Custom validators
fn validate_rpc_url(url: &str) -> Result<(), ValidationError> {
    if !url.starts_with("http://") && !url.starts_with("https://") {
        return Err(ValidationError::new("invalid_rpc_url"));
    }
    validate_http_url(url)
}

fn validate_http_url(url: &str) -> Result<(), ValidationError> {
    match url::Url::parse(url) {
        Ok(parsed) if parsed.scheme() == "http" || parsed.scheme() == "https" => Ok(()),
        _ => Err(ValidationError::new("invalid_url")),
    }
}

fn validate_address(address: &Address) -> Result<(), ValidationError> {
    if address == &Address::zero() {
        return Err(ValidationError::new("zero_address"));
    }
    Ok(())
}
