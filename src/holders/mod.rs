pub mod types;

use anyhow::{Context, Result};
use ethers::types::{Address, U256};
use log::{debug, info, warn};
use std::{
    collections::HashSet,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};

use crate::{
    aggregator::{aggregate, lp_derived_balances, AggregatedHolder, HolderBalance, HolderSource},
    cache::{CacheKey, ResultCache},
    chain::{collapse_fetches, ChainReader},
    error::HolderError,
    kv::KvStore,
    metrics,
    names::{NameResolver, NameSnapshot},
    price::PriceOracle,
    utils::{address_key, format_amount, normalize_decimals},
};
pub use types::*;

/// Ranks below this boundary come from the result cache.
pub const CACHED_TOP: usize = 10;

#[derive(Debug, Clone)]
pub struct HolderSettings {
    pub token: Address,
    pub wrapped_token: Option<Address>,
    pub lp_pool: Option<Address>,
    pub excluded: HashSet<Address>,
    pub lookback_blocks: u64,
    pub candidate_cap: usize,
    pub result_ttl: Duration,
}

/// Orchestrates price, balances, aggregation, names and caching for one request.
pub struct HolderService {
    chain: Arc<dyn ChainReader>,
    names: Arc<NameResolver>,
    prices: Arc<PriceOracle>,
    cache: Arc<ResultCache>,
    kv: Arc<dyn KvStore>,
    settings: HolderSettings,
}

impl HolderService {
    pub fn new(
        chain: Arc<dyn ChainReader>,
        names: Arc<NameResolver>,
        prices: Arc<PriceOracle>,
        cache: Arc<ResultCache>,
        kv: Arc<dyn KvStore>,
        settings: HolderSettings,
    ) -> Self {
        Self {
            chain,
            names,
            prices,
            cache,
            kv,
            settings,
        }
    }

    pub async fn page(&self, query: HolderQuery) -> Result<HolderPage, HolderError> {
        metrics::record_request();
        self.check_filter(query.filter)?;

        let quote = self.prices.quote(self.settings.token).await;
        let token = self.token_info().await?;

        let (holders, total_holders) = match query.address {
            Some(address) => {
                let (found, total) = self.lookup(address, query.filter).await?;
                (vec![found], total)
            }
            None => self.window(query.offset, query.limit, query.filter).await?,
        };

        let data: Vec<RankedHolder> = holders
            .iter()
            .map(|h| RankedHolder::from_named(h, &token, quote.price_usd))
            .collect();
        let market_cap = format_amount(token.total_supply, token.decimals) * quote.price_usd;

        info!(
            "Served {} holders (offset {}, limit {}, filter {}) at ${} from {}",
            data.len(),
            query.offset,
            query.limit,
            query.filter.as_str(),
            quote.price_usd,
            quote.source
        );

        Ok(HolderPage {
            success: true,
            count: data.len(),
            data,
            price: quote.price_usd,
            market_cap,
            offset: query.offset,
            limit: query.limit,
            total_holders,
        })
    }

    fn check_filter(&self, filter: SourceFilter) -> Result<(), HolderError> {
        match filter {
            SourceFilter::LpOnly if self.settings.lp_pool.is_none() => {
                Err(HolderError::InvalidParam("LP source is not configured".to_string()))
            }
            SourceFilter::WrappedOnly if self.settings.wrapped_token.is_none() => {
                Err(HolderError::InvalidParam("Wrapped token source is not configured".to_string()))
            }
            _ => Ok(()),
        }
    }

    async fn token_info(&self) -> Result<TokenInfo, HolderError> {
        let token = self.settings.token;
        let (decimals, total_supply) =
            tokio::try_join!(self.chain.decimals(token), self.chain.total_supply(token))
                .map_err(|e| HolderError::upstream("Failed to read token metadata", e))?;
        Ok(TokenInfo { decimals, total_supply })
    }

    /// Single-address mode: ranked against a fresh, uncached aggregation. Also returns
    /// the size of that aggregation.
    async fn lookup(
        &self,
        address: Address,
        filter: SourceFilter,
    ) -> Result<(NamedHolder, usize), HolderError> {
        let full = self
            .compute_full(filter, Some(address))
            .await
            .map_err(|e| HolderError::upstream("Failed to compute holders", e))?;

        let Some(position) = full.iter().position(|h| h.address == address) else {
            let key = address_key(&address);
            return Err(HolderError::NotFound(format!("{} holds no balance", key)));
        };

        let snapshot = self.names.snapshot().await;
        let display_name = self.names.resolve_in(&snapshot, address).await;
        let named = NamedHolder {
            rank: position + 1,
            holder: full[position].clone(),
            display_name,
        };
        Ok((named, full.len()))
    }

    /// Paged mode. The top of the ranking is cached; anything past it is computed per request.
    async fn window(
        &self,
        offset: usize,
        limit: usize,
        filter: SourceFilter,
    ) -> Result<(Vec<NamedHolder>, usize), HolderError> {
        let end = offset.saturating_add(limit);
        let snapshot = self.names.snapshot().await;

        if offset >= CACHED_TOP {
            let full = self.fresh_full(filter).await?;
            let total = full.len();
            let page = self.name_slice(&snapshot, &full, offset, end).await;
            return Ok((page, total));
        }

        let top = self.cached_top(filter, &snapshot).await?;
        let mut page: Vec<NamedHolder> = top
            .holders
            .iter()
            .skip(offset)
            .take(end.min(CACHED_TOP) - offset)
            .cloned()
            .collect();
        let mut total = top.total_holders;

        if end > CACHED_TOP {
            debug!("Window {}..{} crosses the cached top, fetching the remainder", offset, end);
            let full = self.fresh_full(filter).await?;
            total = full.len();
            page.extend(self.name_slice(&snapshot, &full, CACHED_TOP, end).await);
        }

        Ok((page, total))
    }

    async fn fresh_full(&self, filter: SourceFilter) -> Result<Vec<AggregatedHolder>, HolderError> {
        self.compute_full(filter, None)
            .await
            .map_err(|e| HolderError::upstream("Failed to compute holders", e))
    }

    async fn name_slice(
        &self,
        snapshot: &NameSnapshot,
        full: &[AggregatedHolder],
        start: usize,
        end: usize,
    ) -> Vec<NamedHolder> {
        let start = start.min(full.len());
        let end = end.min(full.len());
        let slice = &full[start..end];
        let addresses: Vec<Address> = slice.iter().map(|h| h.address).collect();
        let names = self.names.resolve_all(snapshot, &addresses).await;

        slice
            .iter()
            .zip(names)
            .enumerate()
            .map(|(i, (holder, display_name))| NamedHolder {
                rank: start + i + 1,
                holder: holder.clone(),
                display_name,
            })
            .collect()
    }

    fn cache_key(&self, filter: SourceFilter, snapshot: &NameSnapshot) -> CacheKey {
        CacheKey::new(
            format!("top_holders:{}:{}", address_key(&self.settings.token), filter.as_str()),
            snapshot.epoch(),
        )
    }

    async fn cached_top(
        &self,
        filter: SourceFilter,
        snapshot: &Arc<NameSnapshot>,
    ) -> Result<TopHolders, HolderError> {
        let key = self.cache_key(filter, snapshot);
        let computed = AtomicBool::new(false);
        let computed_ref = &computed;
        let names = snapshot.clone();

        let entry = self
            .cache
            .get_or_compute(&key, self.settings.result_ttl, move || async move {
                computed_ref.store(true, Ordering::SeqCst);
                self.compute_top(filter, &names).await
            })
            .await
            .map_err(|e| HolderError::upstream("Failed to compute top holders", e))?;

        if computed.load(Ordering::SeqCst) {
            self.index_holders(&key, &entry.value).await;
        }
        Ok(entry.value)
    }

    async fn compute_top(
        &self,
        filter: SourceFilter,
        snapshot: &NameSnapshot,
    ) -> Result<TopHolders> {
        let full = self.compute_full(filter, None).await?;
        let holders = self.name_slice(snapshot, &full, 0, CACHED_TOP).await;
        Ok(TopHolders {
            total_holders: full.len(),
            holders,
        })
    }

    /// Per-address hash written after each cache refresh. Nothing in this service reads it back.
    async fn index_holders(&self, key: &CacheKey, top: &TopHolders) {
        for named in &top.holders {
            let fields = vec![
                ("rank".to_string(), named.rank.to_string()),
                ("total".to_string(), named.holder.total_balance.to_string()),
                ("name".to_string(), named.display_name.clone().unwrap_or_default()),
                ("cache".to_string(), key.to_string()),
            ];
            let hash_key = format!("holder:{}", address_key(&named.holder.address));
            if let Err(e) = self.kv.hset(&hash_key, &fields).await {
                warn!("Writing {} failed: {:#}", hash_key, e);
            }
        }
    }

    /// Full aggregation across the sources `filter` selects. `extra` is always read
    /// even when the log scan did not surface it.
    pub async fn compute_full(
        &self,
        filter: SourceFilter,
        extra: Option<Address>,
    ) -> Result<Vec<AggregatedHolder>> {
        let started = Instant::now();
        let token = self.settings.token;

        let primary = async {
            if !filter.includes_primary() {
                return Ok(Vec::new());
            }
            self.token_balances(token, extra, HolderSource::Primary).await
        };

        let wrapped = async {
            let wrapped = self.settings.wrapped_token.filter(|_| filter.includes_wrapped());
            let Some(wrapped) = wrapped else {
                return Ok(Vec::new());
            };
            let (token_decimals, wrapped_decimals) =
                tokio::try_join!(self.chain.decimals(token), self.chain.decimals(wrapped))?;
            let balances = self.token_balances(wrapped, extra, HolderSource::Wrapped).await?;
            Ok::<_, anyhow::Error>(
                balances
                    .into_iter()
                    .map(|mut b| {
                        b.balance_raw =
                            normalize_decimals(b.balance_raw, wrapped_decimals, token_decimals);
                        b
                    })
                    .collect(),
            )
        };

        let lp = async {
            let Some(pool) = self.settings.lp_pool.filter(|_| filter.includes_lp()) else {
                return Ok(Vec::new());
            };
            let state = self.chain.pool_state(pool).await?;
            let lp_holders = self.raw_balances(pool, extra).await?;
            Ok::<_, anyhow::Error>(lp_derived_balances(&state, token, &lp_holders))
        };

        let (primary, wrapped, lp) = tokio::try_join!(primary, wrapped, lp)?;

        let excluded = &self.settings.excluded;
        let merged = primary
            .into_iter()
            .chain(wrapped)
            .chain(lp)
            .filter(|b| !excluded.contains(&b.address));
        let holders = aggregate(merged);

        let elapsed = started.elapsed();
        metrics::record_compute_time(elapsed);
        debug!("Aggregated {} holders in {:?}", holders.len(), elapsed);
        Ok(holders)
    }

    async fn token_balances(
        &self,
        token: Address,
        extra: Option<Address>,
        source: HolderSource,
    ) -> Result<Vec<HolderBalance>> {
        Ok(self
            .raw_balances(token, extra)
            .await?
            .into_iter()
            .map(|(address, balance)| HolderBalance::new(address, balance, source))
            .collect())
    }

    async fn raw_balances(
        &self,
        token: Address,
        extra: Option<Address>,
    ) -> Result<Vec<(Address, U256)>> {
        let mut candidates = self
            .chain
            .holder_candidates(token, self.settings.lookback_blocks, self.settings.candidate_cap)
            .await
            .with_context(|| format!("Holder scan failed for {}", address_key(&token)))?;

        if let Some(extra) = extra {
            if !candidates.contains(&extra) {
                candidates.push(extra);
            }
        }
        candidates.retain(|a| !self.settings.excluded.contains(a));

        let fetches = self.chain.balances(token, &candidates).await;
        Ok(collapse_fetches(fetches))
    }
}
