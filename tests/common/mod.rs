#![allow(dead_code)]

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use ethers::types::{Address, U256};
use std::{
    collections::{HashMap, HashSet},
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use zeus_holders::{
    cache::ResultCache,
    chain::{BalanceFetch, ChainReader, FetchStatus, PoolState},
    clock::ManualClock,
    holders::{HolderService, HolderSettings},
    kv::MemoryKv,
    names::{NameCache, NameRecord, NameResolver, NameService},
    price::{PriceFeed, PriceOracle},
};

pub const LATEST_BLOCK: u64 = 1_000_000;
pub const START_MS: u64 = 1_700_000_000_000;
pub const RESULT_TTL: Duration = Duration::from_secs(300);
pub const NAME_TTL: Duration = Duration::from_secs(60);
pub const LOOKUP_TIMEOUT: Duration = Duration::from_millis(200);
pub const DOMAIN: &str = "zeusarmy.eth";

pub fn addr(n: u64) -> Address {
    Address::from_low_u64_be(n)
}

pub fn token() -> Address {
    addr(0x2e05)
}

pub fn wrapped() -> Address {
    addr(0x3e05)
}

pub fn pool() -> Address {
    addr(0x4e05)
}

pub fn units(n: u64) -> U256 {
    U256::from(n) * U256::exp10(18)
}

#[derive(Default)]
struct TokenState {
    decimals: u8,
    total_supply: U256,
    balances: HashMap<Address, U256>,
    /// Block of each holder's most recent transfer.
    last_active: Vec<(Address, u64)>,
}

/// In-memory chain with per-token balances and a notion of transfer recency.
#[derive(Default)]
pub struct FakeChain {
    tokens: Mutex<HashMap<Address, TokenState>>,
    pools: Mutex<HashMap<Address, PoolState>>,
    failing: Mutex<HashSet<Address>>,
    reverse: Mutex<HashMap<Address, String>>,
    reverse_delay: Duration,
    pub balance_calls: AtomicUsize,
}

impl FakeChain {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_token(self, token: Address, decimals: u8, total_supply: U256) -> Self {
        self.tokens.lock().unwrap().insert(
            token,
            TokenState {
                decimals,
                total_supply,
                ..Default::default()
            },
        );
        self
    }

    /// Holder whose last transfer happened at `block`.
    pub fn with_holder_at(
        self,
        token: Address,
        holder: Address,
        balance: U256,
        block: u64,
    ) -> Self {
        {
            let mut tokens = self.tokens.lock().unwrap();
            let state = tokens.entry(token).or_default();
            state.balances.insert(holder, balance);
            state.last_active.push((holder, block));
        }
        self
    }

    pub fn with_holder(self, token: Address, holder: Address, balance: U256) -> Self {
        self.with_holder_at(token, holder, balance, LATEST_BLOCK)
    }

    pub fn with_pool(self, pool: Address, state: PoolState) -> Self {
        self.pools.lock().unwrap().insert(pool, state);
        self
    }

    pub fn with_failing(self, holder: Address) -> Self {
        self.failing.lock().unwrap().insert(holder);
        self
    }

    pub fn with_reverse_name(self, holder: Address, name: &str) -> Self {
        self.reverse.lock().unwrap().insert(holder, name.to_string());
        self
    }

    /// Every reverse lookup stalls for `delay` before answering.
    pub fn with_reverse_delay(mut self, delay: Duration) -> Self {
        self.reverse_delay = delay;
        self
    }

    pub fn set_balance(&self, token: Address, holder: Address, balance: U256) {
        let mut tokens = self.tokens.lock().unwrap();
        tokens.entry(token).or_default().balances.insert(holder, balance);
    }

    pub fn calls(&self) -> usize {
        self.balance_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ChainReader for FakeChain {
    async fn balances(&self, token: Address, holders: &[Address]) -> Vec<BalanceFetch> {
        self.balance_calls.fetch_add(1, Ordering::SeqCst);
        let tokens = self.tokens.lock().unwrap();
        let failing = self.failing.lock().unwrap();
        holders
            .iter()
            .map(|holder| {
                let status = if failing.contains(holder) {
                    FetchStatus::Failed("execution reverted".to_string())
                } else {
                    let balance = tokens
                        .get(&token)
                        .and_then(|t| t.balances.get(holder).copied())
                        .unwrap_or_default();
                    FetchStatus::Ok(balance)
                };
                BalanceFetch {
                    address: *holder,
                    status,
                }
            })
            .collect()
    }

    async fn decimals(&self, token: Address) -> Result<u8> {
        self.tokens
            .lock()
            .unwrap()
            .get(&token)
            .map(|t| t.decimals)
            .ok_or_else(|| anyhow!("unknown token {:?}", token))
    }

    async fn total_supply(&self, token: Address) -> Result<U256> {
        self.tokens
            .lock()
            .unwrap()
            .get(&token)
            .map(|t| t.total_supply)
            .ok_or_else(|| anyhow!("unknown token {:?}", token))
    }

    async fn holder_candidates(
        &self,
        token: Address,
        lookback_blocks: u64,
        cap: usize,
    ) -> Result<Vec<Address>> {
        let floor = LATEST_BLOCK.saturating_sub(lookback_blocks);
        let tokens = self.tokens.lock().unwrap();
        let Some(state) = tokens.get(&token) else {
            return Ok(Vec::new());
        };
        Ok(state
            .last_active
            .iter()
            .filter(|(_, block)| *block >= floor)
            .map(|(holder, _)| *holder)
            .take(cap)
            .collect())
    }

    async fn pool_state(&self, pool: Address) -> Result<PoolState> {
        self.pools
            .lock()
            .unwrap()
            .get(&pool)
            .cloned()
            .ok_or_else(|| anyhow!("unknown pool {:?}", pool))
    }

    async fn reverse_name(&self, address: Address) -> Result<Option<String>> {
        if !self.reverse_delay.is_zero() {
            tokio::time::sleep(self.reverse_delay).await;
        }
        Ok(self.reverse.lock().unwrap().get(&address).cloned())
    }
}

/// Registry that serves a fixed list of labels and counts how often it is paged.
#[derive(Default)]
pub struct FakeNames {
    pub records: Mutex<Vec<NameRecord>>,
    pub list_calls: AtomicUsize,
    pub fail: std::sync::atomic::AtomicBool,
}

impl FakeNames {
    pub fn with(records: &[(&str, Address)]) -> Self {
        let names = Self::default();
        names.set(records);
        names
    }

    pub fn set(&self, records: &[(&str, Address)]) {
        *self.records.lock().unwrap() = records
            .iter()
            .map(|(name, address)| NameRecord {
                name: name.to_string(),
                address: format!("{:#x}", address),
            })
            .collect();
    }
}

#[async_trait]
impl NameService for FakeNames {
    async fn list_names(
        &self,
        _domain: &str,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<NameRecord>> {
        self.list_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail.load(Ordering::SeqCst) {
            return Err(anyhow!("registry unavailable"));
        }
        let records = self.records.lock().unwrap();
        Ok(records.iter().skip(offset).take(limit).cloned().collect())
    }

    async fn is_available(&self, _domain: &str, label: &str) -> Result<bool> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(anyhow!("registry unavailable"));
        }
        Ok(!self.records.lock().unwrap().iter().any(|r| r.name == label))
    }
}

pub struct FixedFeed(pub f64);

#[async_trait]
impl PriceFeed for FixedFeed {
    fn name(&self) -> &'static str {
        "fixed"
    }

    async fn price_usd(&self, _token: Address) -> Result<f64> {
        Ok(self.0)
    }
}

pub struct DownFeed;

#[async_trait]
impl PriceFeed for DownFeed {
    fn name(&self) -> &'static str {
        "down"
    }

    async fn price_usd(&self, _token: Address) -> Result<f64> {
        Err(anyhow!("HTTP 503"))
    }
}

pub fn settings() -> HolderSettings {
    HolderSettings {
        token: token(),
        wrapped_token: None,
        lp_pool: None,
        excluded: [Address::zero(), pool()].into_iter().collect(),
        lookback_blocks: 50_000,
        candidate_cap: 2_000,
        result_ttl: RESULT_TTL,
    }
}

pub struct Harness {
    pub service: HolderService,
    pub chain: Arc<FakeChain>,
    pub kv: Arc<MemoryKv>,
    pub clock: Arc<ManualClock>,
}

pub struct HarnessBuilder {
    chain: FakeChain,
    settings: HolderSettings,
    names: Option<Arc<FakeNames>>,
    feeds: Vec<Box<dyn PriceFeed>>,
    fallback_price: f64,
}

impl HarnessBuilder {
    pub fn new(chain: FakeChain) -> Self {
        Self {
            chain,
            settings: settings(),
            names: None,
            feeds: vec![Box::new(FixedFeed(2.0))],
            fallback_price: 0.0,
        }
    }

    pub fn settings(mut self, f: impl FnOnce(&mut HolderSettings)) -> Self {
        f(&mut self.settings);
        self
    }

    pub fn names(mut self, names: Arc<FakeNames>) -> Self {
        self.names = Some(names);
        self
    }

    pub fn prices(mut self, feeds: Vec<Box<dyn PriceFeed>>, fallback_price: f64) -> Self {
        self.feeds = feeds;
        self.fallback_price = fallback_price;
        self
    }

    pub fn build(self) -> Harness {
        let chain = Arc::new(self.chain);
        let kv = Arc::new(MemoryKv::new());
        let clock = Arc::new(ManualClock::new(START_MS));

        let service: Option<Arc<dyn NameService>> =
            self.names.map(|n| n as Arc<dyn NameService>);
        let domain = service.as_ref().map(|_| DOMAIN.to_string());
        let name_cache = Arc::new(NameCache::new(
            service,
            domain,
            kv.clone(),
            clock.clone(),
            NAME_TTL,
        ));
        let resolver = Arc::new(NameResolver::new(name_cache, chain.clone(), LOOKUP_TIMEOUT));
        let cache = Arc::new(ResultCache::new(kv.clone(), clock.clone()));
        let prices = Arc::new(PriceOracle::new(self.feeds, self.fallback_price));

        let service =
            HolderService::new(chain.clone(), resolver, prices, cache, kv.clone(), self.settings);
        Harness {
            service,
            chain,
            kv,
            clock,
        }
    }
}
