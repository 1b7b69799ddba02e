use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use ethers::types::Address;
use log::{debug, warn};
#[cfg(test)]
use mockall::automock;
use reqwest::Client;
use serde::Deserialize;
use std::{collections::HashMap, time::Duration};

use crate::{metrics, utils::address_key};

pub const DEXSCREENER_URL: &str = "https://api.dexscreener.com/latest/dex/tokens";
pub const GECKOTERMINAL_URL: &str =
    "https://api.geckoterminal.com/api/v2/simple/networks/eth/token_price";
pub const PRICE_TIMEOUT: Duration = Duration::from_secs(5);

#[cfg_attr(test, automock)]
#[async_trait]
pub trait PriceFeed: Send + Sync {
    fn name(&self) -> &'static str;

    async fn price_usd(&self, token: Address) -> Result<f64>;
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PriceQuote {
    pub price_usd: f64,
    pub source: &'static str,
}

/// Tries each feed in order, then settles on a constant.
pub struct PriceOracle {
    feeds: Vec<Box<dyn PriceFeed>>,
    fallback_price: f64,
}

impl PriceOracle {
    pub fn new(feeds: Vec<Box<dyn PriceFeed>>, fallback_price: f64) -> Self {
        Self { feeds, fallback_price }
    }

    pub fn with_default_feeds(fallback_price: f64) -> Result<Self> {
        let client = Client::builder().timeout(PRICE_TIMEOUT).build()?;
        Ok(Self::new(
            vec![
                Box::new(DexScreenerFeed::new(client.clone(), DEXSCREENER_URL)),
                Box::new(GeckoTerminalFeed::new(client, GECKOTERMINAL_URL)),
            ],
            fallback_price,
        ))
    }

    pub async fn quote(&self, token: Address) -> PriceQuote {
        for (i, feed) in self.feeds.iter().enumerate() {
            match feed.price_usd(token).await {
                Ok(price) if price.is_finite() && price > 0.0 => {
                    if i > 0 {
                        metrics::record_price_fallback("secondary");
                    }
                    debug!("Price from {}: {}", feed.name(), price);
                    return PriceQuote {
                        price_usd: price,
                        source: feed.name(),
                    };
                }
                Ok(price) => warn!("{} returned unusable price {}", feed.name(), price),
                Err(e) => warn!("{} price lookup failed: {:#}", feed.name(), e),
            }
        }

        metrics::record_price_fallback("constant");
        warn!("All price sources failed, using fallback {}", self.fallback_price);
        PriceQuote {
            price_usd: self.fallback_price,
            source: "fallback",
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DexScreenerResponse {
    #[serde(default)]
    pairs: Option<Vec<DexScreenerPair>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DexScreenerPair {
    chain_id: String,
    price_usd: Option<String>,
    liquidity: Option<DexScreenerLiquidity>,
}

#[derive(Debug, Deserialize)]
struct DexScreenerLiquidity {
    usd: Option<f64>,
}

pub struct DexScreenerFeed {
    client: Client,
    base_url: String,
}

impl DexScreenerFeed {
    pub fn new(client: Client, base_url: &str) -> Self {
        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }
}

/// Deepest Ethereum pair wins.
fn best_dexscreener_price(response: DexScreenerResponse) -> Option<f64> {
    response
        .pairs
        .unwrap_or_default()
        .into_iter()
        .filter(|p| p.chain_id == "ethereum")
        .filter_map(|p| {
            let price = p.price_usd.as_deref()?.parse::<f64>().ok()?;
            let depth = p.liquidity.and_then(|l| l.usd).unwrap_or(0.0);
            Some((depth, price))
        })
        .max_by(|a, b| a.0.total_cmp(&b.0))
        .map(|(_, price)| price)
}

#[async_trait]
impl PriceFeed for DexScreenerFeed {
    fn name(&self) -> &'static str {
        "dexscreener"
    }

    async fn price_usd(&self, token: Address) -> Result<f64> {
        let url = format!("{}/{}", self.base_url, address_key(&token));
        let response: DexScreenerResponse = self
            .client
            .get(&url)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await
            .context("Malformed DexScreener response")?;

        best_dexscreener_price(response)
            .ok_or_else(|| anyhow!("No Ethereum pair priced for {:?}", token))
    }
}

#[derive(Debug, Deserialize)]
struct GeckoResponse {
    data: GeckoData,
}

#[derive(Debug, Deserialize)]
struct GeckoData {
    attributes: GeckoAttributes,
}

#[derive(Debug, Deserialize)]
struct GeckoAttributes {
    token_prices: HashMap<String, Option<String>>,
}

pub struct GeckoTerminalFeed {
    client: Client,
    base_url: String,
}

impl GeckoTerminalFeed {
    pub fn new(client: Client, base_url: &str) -> Self {
        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }
}

#[async_trait]
impl PriceFeed for GeckoTerminalFeed {
    fn name(&self) -> &'static str {
        "geckoterminal"
    }

    async fn price_usd(&self, token: Address) -> Result<f64> {
        let key = address_key(&token);
        let url = format!("{}/{}", self.base_url, key);
        let response: GeckoResponse = self
            .client
            .get(&url)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await
            .context("Malformed GeckoTerminal response")?;

        response
            .data
            .attributes
            .token_prices
            .into_iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(&key))
            .and_then(|(_, v)| v)
            .and_then(|v| v.parse::<f64>().ok())
            .ok_or_else(|| anyhow!("GeckoTerminal has no price for {}", key))
    }
}
