use ethers::types::{Address, U256};
use serde::{Deserialize, Serialize};

use crate::{
    aggregator::AggregatedHolder,
    utils::{address_key, format_amount},
};

/// Which balance sources feed a ranking.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceFilter {
    All,
    LpOnly,
    WrappedOnly,
}

impl SourceFilter {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::All => "all",
            Self::LpOnly => "lp",
            Self::WrappedOnly => "wrapped",
        }
    }

    pub fn includes_primary(&self) -> bool {
        matches!(self, Self::All)
    }

    pub fn includes_wrapped(&self) -> bool {
        matches!(self, Self::All | Self::WrappedOnly)
    }

    pub fn includes_lp(&self) -> bool {
        matches!(self, Self::All | Self::LpOnly)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HolderQuery {
    pub offset: usize,
    pub limit: usize,
    pub address: Option<Address>,
    pub filter: SourceFilter,
}

impl Default for HolderQuery {
    fn default() -> Self {
        Self {
            offset: 0,
            limit: 10,
            address: None,
            filter: SourceFilter::All,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TokenInfo {
    pub decimals: u8,
    pub total_supply: U256,
}

/// An aggregated holder with its rank and resolved name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NamedHolder {
    pub rank: usize,
    pub holder: AggregatedHolder,
    pub display_name: Option<String>,
}

/// What the result cache stores for the top of the ranking.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TopHolders {
    pub total_holders: usize,
    pub holders: Vec<NamedHolder>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SourceBalances {
    pub zeus: f64,
    pub wzeus: f64,
    pub lp: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RankedHolder {
    pub rank: usize,
    pub address: String,
    pub display_name: Option<String>,
    pub per_source_balances_formatted: SourceBalances,
    /// Total in human units.
    pub total_balance_raw: f64,
    pub usd_value: f64,
    pub supply_percentage: f64,
}

impl RankedHolder {
    pub fn from_named(named: &NamedHolder, token: &TokenInfo, price_usd: f64) -> Self {
        let holder = &named.holder;
        let total = format_amount(holder.total_balance, token.decimals);

        Self {
            rank: named.rank,
            address: address_key(&holder.address),
            display_name: named.display_name.clone(),
            per_source_balances_formatted: SourceBalances {
                zeus: format_amount(holder.primary_balance, token.decimals),
                wzeus: format_amount(holder.wrapped_balance, token.decimals),
                lp: format_amount(holder.lp_derived_balance, token.decimals),
            },
            total_balance_raw: total,
            usd_value: total * price_usd,
            supply_percentage: supply_percentage(holder.total_balance, token.total_supply),
        }
    }
}

/// Percent of supply, kept to six decimal places.
pub fn supply_percentage(balance: U256, total_supply: U256) -> f64 {
    if total_supply.is_zero() {
        return 0.0;
    }
    let scaled = balance.full_mul(U256::exp10(8)) / ethers::types::U512::from(total_supply);
    let scaled = U256::try_from(scaled).unwrap_or(U256::MAX);
    if scaled > U256::from(u128::MAX) {
        return f64::INFINITY;
    }
    scaled.as_u128() as f64 / 1_000_000.0
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HolderPage {
    pub success: bool,
    pub data: Vec<RankedHolder>,
    pub price: f64,
    pub market_cap: f64,
    pub offset: usize,
    pub limit: usize,
    pub count: usize,
    pub total_holders: usize,
}
