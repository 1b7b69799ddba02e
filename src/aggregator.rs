use ethers::types::{Address, U256, U512};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::chain::PoolState;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum HolderSource {
    Primary,
    Wrapped,
    LiquidityPool,
}

/// One balance reading for one address from one source, in primary-token base units.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HolderBalance {
    pub address: Address,
    pub balance_raw: U256,
    pub source: HolderSource,
}

impl HolderBalance {
    pub fn new(address: Address, balance_raw: U256, source: HolderSource) -> Self {
        Self {
            address,
            balance_raw,
            source,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AggregatedHolder {
    pub address: Address,
    pub primary_balance: U256,
    pub wrapped_balance: U256,
    pub lp_derived_balance: U256,
    pub total_balance: U256,
}

impl AggregatedHolder {
    fn empty(address: Address) -> Self {
        Self {
            address,
            primary_balance: U256::zero(),
            wrapped_balance: U256::zero(),
            lp_derived_balance: U256::zero(),
            total_balance: U256::zero(),
        }
    }

    fn add(&mut self, balance: &HolderBalance) {
        let slot = match balance.source {
            HolderSource::Primary => &mut self.primary_balance,
            HolderSource::Wrapped => &mut self.wrapped_balance,
            HolderSource::LiquidityPool => &mut self.lp_derived_balance,
        };
        *slot = slot.saturating_add(balance.balance_raw);
        self.total_balance = self
            .primary_balance
            .saturating_add(self.wrapped_balance)
            .saturating_add(self.lp_derived_balance);
    }
}

/// Merges per-source balances into one entry per address, sorted by total descending.
///
/// Equal totals keep the order in which their address was first seen in `balances`,
/// so the same input always ranks the same way. Addresses whose total is zero are dropped.
pub fn aggregate<I>(balances: I) -> Vec<AggregatedHolder>
where
    I: IntoIterator<Item = HolderBalance>,
{
    let mut index: HashMap<Address, usize> = HashMap::new();
    let mut holders: Vec<AggregatedHolder> = Vec::new();

    for balance in balances {
        let slot = *index.entry(balance.address).or_insert_with(|| {
            holders.push(AggregatedHolder::empty(balance.address));
            holders.len() - 1
        });
        holders[slot].add(&balance);
    }

    holders.retain(|h| !h.total_balance.is_zero());
    // sort_by is stable, which gives the first-seen tie-break
    holders.sort_by(|a, b| b.total_balance.cmp(&a.total_balance));
    holders
}

/// Share of `token_reserve` owned by `lp_balance` pool tokens, floored.
pub fn lp_to_token_balance(lp_balance: U256, token_reserve: U256, pool_total_supply: U256) -> U256 {
    if pool_total_supply.is_zero() {
        return U256::zero();
    }
    let share = lp_balance.full_mul(token_reserve) / U512::from(pool_total_supply);
    U256::try_from(share).unwrap_or(U256::MAX)
}

/// Converts LP token balances into virtual primary-token balances.
pub fn lp_derived_balances(
    pool: &PoolState,
    token: Address,
    lp_balances: &[(Address, U256)],
) -> Vec<HolderBalance> {
    let Some(reserve) = pool.token_reserve(token) else {
        return Vec::new();
    };

    lp_balances
        .iter()
        .map(|(address, lp)| {
            HolderBalance::new(
                *address,
                lp_to_token_balance(*lp, reserve, pool.total_supply),
                HolderSource::LiquidityPool,
            )
        })
        .filter(|b| !b.balance_raw.is_zero())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(n: u64) -> Address {
        Address::from_low_u64_be(n)
    }

    fn primary(n: u64, amount: u64) -> HolderBalance {
        HolderBalance::new(addr(n), U256::from(amount), HolderSource::Primary)
    }

    #[test]
    fn test_ranks_primary_balances() {
        let out = aggregate(vec![primary(1, 500), primary(2, 300), primary(3, 200)]);
        let totals: Vec<U256> = out.iter().map(|h| h.total_balance).collect();
        assert_eq!(totals, vec![U256::from(500), U256::from(300), U256::from(200)]);
        assert_eq!(out[0].address, addr(1));
    }

    #[test]
    fn test_merges_sources_exactly() {
        let big = U256::exp10(32);
        let out = aggregate(vec![
            primary(1, 10),
            HolderBalance::new(addr(2), big, HolderSource::Wrapped),
            HolderBalance::new(addr(1), U256::from(5), HolderSource::Wrapped),
            HolderBalance::new(addr(1), U256::from(7), HolderSource::LiquidityPool),
            HolderBalance::new(addr(2), big, HolderSource::Primary),
        ]);

        assert_eq!(out.len(), 2);
        assert_eq!(out[0].address, addr(2));
        assert_eq!(out[0].total_balance, big + big);
        for h in &out {
            assert_eq!(
                h.total_balance,
                h.primary_balance + h.wrapped_balance + h.lp_derived_balance
            );
        }
        assert_eq!(out[1].primary_balance, U256::from(10));
        assert_eq!(out[1].wrapped_balance, U256::from(5));
        assert_eq!(out[1].lp_derived_balance, U256::from(7));
        assert_eq!(out[1].total_balance, U256::from(22));
    }

    #[test]
    fn test_drops_zero_totals() {
        let out = aggregate(vec![
            primary(1, 0),
            HolderBalance::new(addr(1), U256::zero(), HolderSource::Wrapped),
            HolderBalance::new(addr(1), U256::zero(), HolderSource::LiquidityPool),
            primary(2, 1),
        ]);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].address, addr(2));
    }

    #[test]
    fn test_ties_keep_first_seen_order() {
        let out = aggregate(vec![primary(9, 100), primary(3, 100), primary(5, 100)]);
        let order: Vec<Address> = out.iter().map(|h| h.address).collect();
        assert_eq!(order, vec![addr(9), addr(3), addr(5)]);
    }

    #[test]
    fn test_lp_conversion_floors_and_guards_zero_supply() {
        assert_eq!(
            lp_to_token_balance(U256::from(10), U256::from(1000), U256::zero()),
            U256::zero()
        );
        // 1 * 999 / 1000 floors to 0
        assert_eq!(
            lp_to_token_balance(U256::from(1), U256::from(999), U256::from(1000)),
            U256::zero()
        );
        assert_eq!(
            lp_to_token_balance(U256::from(250), U256::from(1000), U256::from(1000)),
            U256::from(250)
        );

        let huge = U256::exp10(40);
        assert_eq!(lp_to_token_balance(huge, huge, huge), huge);
    }

    #[test]
    fn test_lp_derived_balances_picks_token_side() {
        let token = addr(100);
        let pool = PoolState {
            total_supply: U256::from(1000),
            reserve0: U256::from(50),
            reserve1: U256::from(4000),
            token0: addr(200),
            token1: token,
        };
        let lp = vec![(addr(1), U256::from(500)), (addr(2), U256::from(0))];
        let out = lp_derived_balances(&pool, token, &lp);
        assert_eq!(
            out,
            vec![HolderBalance::new(addr(1), U256::from(2000), HolderSource::LiquidityPool)]
        );

        assert!(lp_derived_balances(&pool, addr(300), &lp).is_empty());
    }
}
