use anyhow::{Context, Result};
use async_trait::async_trait;
use ethers::{
    contract::abigen,
    providers::{Http, Middleware, Provider, ProviderError},
    types::{Address, BlockNumber, Filter, H256, U256},
};
use futures::future::join_all;
use itertools::Itertools;
use log::{debug, info, warn};
use std::{future::Future, sync::Arc};

use crate::metrics;

/// Hard ceiling on concurrent balance reads.
pub const MAX_BATCH_SIZE: usize = 50;

/// Block span per `eth_getLogs` call.
pub const LOG_CHUNK_BLOCKS: u64 = 10_000;

pub const TRANSFER_EVENT: &str = "Transfer(address,address,uint256)";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchStatus {
    Ok(U256),
    Failed(String),
}

/// Outcome of one balance read. Failures stay visible here and are collapsed later.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BalanceFetch {
    pub address: Address,
    pub status: FetchStatus,
}

impl BalanceFetch {
    pub fn balance(&self) -> Option<U256> {
        match self.status {
            FetchStatus::Ok(balance) => Some(balance),
            FetchStatus::Failed(_) => None,
        }
    }

    pub fn is_failed(&self) -> bool {
        matches!(self.status, FetchStatus::Failed(_))
    }
}

/// Drops failed reads. A failed address and a zero balance both end up absent downstream.
pub fn collapse_fetches(fetches: Vec<BalanceFetch>) -> Vec<(Address, U256)> {
    let failed = fetches.iter().filter(|f| f.is_failed()).count();
    metrics::record_balance_failures(failed);
    fetches
        .into_iter()
        .filter_map(|f| f.balance().map(|b| (f.address, b)))
        .collect()
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolState {
    pub total_supply: U256,
    pub reserve0: U256,
    pub reserve1: U256,
    pub token0: Address,
    pub token1: Address,
}

impl PoolState {
    pub fn token_reserve(&self, token: Address) -> Option<U256> {
        if token == self.token0 {
            Some(self.reserve0)
        } else if token == self.token1 {
            Some(self.reserve1)
        } else {
            None
        }
    }
}

#[async_trait]
pub trait ChainReader: Send + Sync {
    /// Reads `balanceOf` for every address. Never fails as a whole.
    async fn balances(&self, token: Address, holders: &[Address]) -> Vec<BalanceFetch>;

    async fn decimals(&self, token: Address) -> Result<u8>;

    async fn total_supply(&self, token: Address) -> Result<U256>;

    /// Recent Transfer participants, newest first. Holders idle for longer than
    /// `lookback_blocks` are not discovered.
    async fn holder_candidates(
        &self,
        token: Address,
        lookback_blocks: u64,
        cap: usize,
    ) -> Result<Vec<Address>>;

    async fn pool_state(&self, pool: Address) -> Result<PoolState>;

    /// On-chain reverse name. `Ok(None)` when no primary name is set.
    async fn reverse_name(&self, address: Address) -> Result<Option<String>>;
}

/// Runs `fetch` for every address, at most `batch_size` in flight at a time.
pub async fn fetch_in_batches<F, Fut>(
    addresses: &[Address],
    batch_size: usize,
    fetch: F,
) -> Vec<BalanceFetch>
where
    F: Fn(Address) -> Fut,
    Fut: Future<Output = Result<U256>>,
{
    let batch_size = batch_size.clamp(1, MAX_BATCH_SIZE);
    let mut out = Vec::with_capacity(addresses.len());

    for batch in addresses.chunks(batch_size) {
        let results = join_all(batch.iter().map(|address| fetch(*address))).await;
        for (address, result) in batch.iter().zip(results) {
            let status = match result {
                Ok(balance) => FetchStatus::Ok(balance),
                Err(e) => {
                    warn!("Balance read failed for {:?}: {:#}", address, e);
                    FetchStatus::Failed(e.to_string())
                }
            };
            out.push(BalanceFetch {
                address: *address,
                status,
            });
        }
    }

    out
}

/// Order-preserving dedupe, capped.
pub fn unique_capped<I>(addresses: I, cap: usize) -> Vec<Address>
where
    I: IntoIterator<Item = Address>,
{
    addresses.into_iter().unique().take(cap).collect()
}

fn topic_address(topic: &H256) -> Address {
    Address::from(*topic)
}

pub struct EthChainReader {
    provider: Arc<Provider<Http>>,
    batch_size: usize,
}

impl EthChainReader {
    pub fn new(rpc_url: &str, batch_size: usize) -> Result<Self> {
        let provider = Provider::<Http>::try_from(rpc_url).context("Invalid RPC URL")?;
        Ok(Self {
            provider: Arc::new(provider),
            batch_size,
        })
    }
}

#[async_trait]
impl ChainReader for EthChainReader {
    async fn balances(&self, token: Address, holders: &[Address]) -> Vec<BalanceFetch> {
        let contract = ERC20::new(token, self.provider.clone());
        fetch_in_batches(holders, self.batch_size, |holder| {
            let call = contract.balance_of(holder);
            async move { Ok(call.call().await?) }
        })
        .await
    }

    async fn decimals(&self, token: Address) -> Result<u8> {
        let contract = ERC20::new(token, self.provider.clone());
        contract
            .decimals()
            .call()
            .await
            .with_context(|| format!("decimals() failed for {:?}", token))
    }

    async fn total_supply(&self, token: Address) -> Result<U256> {
        let contract = ERC20::new(token, self.provider.clone());
        contract
            .total_supply()
            .call()
            .await
            .with_context(|| format!("totalSupply() failed for {:?}", token))
    }

    async fn holder_candidates(
        &self,
        token: Address,
        lookback_blocks: u64,
        cap: usize,
    ) -> Result<Vec<Address>> {
        let latest = self
            .provider
            .get_block_number()
            .await
            .context("eth_blockNumber failed")?
            .as_u64();
        let floor = latest.saturating_sub(lookback_blocks);

        let mut participants = Vec::new();
        let mut end = latest;
        loop {
            let start = end.saturating_sub(LOG_CHUNK_BLOCKS - 1).max(floor);
            let filter = Filter::new()
                .address(token)
                .event(TRANSFER_EVENT)
                .from_block(BlockNumber::Number(start.into()))
                .to_block(BlockNumber::Number(end.into()));

            let logs = self
                .provider
                .get_logs(&filter)
                .await
                .with_context(|| format!("eth_getLogs failed for blocks {}..={}", start, end))?;

            for log in logs.iter().rev() {
                // recipients first, they are the ones most likely to still hold
                if let Some(to) = log.topics.get(2) {
                    participants.push(topic_address(to));
                }
                if let Some(from) = log.topics.get(1) {
                    participants.push(topic_address(from));
                }
            }

            let unique = unique_capped(participants.iter().copied(), cap);
            if unique.len() >= cap || start <= floor {
                info!(
                    "Scanned blocks {}..={} for {:?}: {} candidates",
                    start,
                    latest,
                    token,
                    unique.len()
                );
                return Ok(unique);
            }
            end = start - 1;
        }
    }

    async fn pool_state(&self, pool: Address) -> Result<PoolState> {
        let pair = UniswapV2Pair::new(pool, self.provider.clone());
        let total_supply_call = pair.total_supply();
        let reserves_call = pair.get_reserves();
        let token0_call = pair.token_0();
        let token1_call = pair.token_1();

        let (total_supply, (reserve0, reserve1, _), token0, token1) = tokio::try_join!(
            total_supply_call.call(),
            reserves_call.call(),
            token0_call.call(),
            token1_call.call(),
        )
        .with_context(|| format!("Pool state read failed for {:?}", pool))?;

        Ok(PoolState {
            total_supply,
            reserve0: U256::from(reserve0),
            reserve1: U256::from(reserve1),
            token0,
            token1,
        })
    }

    async fn reverse_name(&self, address: Address) -> Result<Option<String>> {
        match self.provider.lookup_address(address).await {
            Ok(name) => Ok(Some(name)),
            Err(ProviderError::EnsError(_)) | Err(ProviderError::EnsNotOwned(_)) => {
                debug!("No reverse record for {:?}", address);
                Ok(None)
            }
            Err(e) => Err(e).with_context(|| format!("Reverse lookup failed for {:?}", address)),
        }
    }
}

// Generate type-safe contract bindings
abigen!(
    ERC20,
    r#"[
        function decimals() external view returns (uint8)
        function totalSupply() external view returns (uint256)
        function balanceOf(address account) external view returns (uint256)
    ]"#,
);

abigen!(
    UniswapV2Pair,
    r#"[
        function getReserves() external view returns (uint112 reserve0, uint112 reserve1, uint32 blockTimestampLast)
        function totalSupply() external view returns (uint256)
        function token0() external view returns (address)
        function token1() external view returns (address)
    ]"#,
);
