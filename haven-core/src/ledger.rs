use ethers::types::{H160, I256, U256};
use std::collections::HashMap;

/// Signed balance map folded from transfer events. Addition is commutative,
/// so input order does not matter. The zero address (mint/burn) never gets an
/// entry; a negative balance anywhere else signals an ingestion gap and is
/// surfaced through [`BalanceLedger::negative_entries`], never clamped.
#[derive(Debug, Default, Clone)]
pub struct BalanceLedger {
    balances: HashMap<H160, I256>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Holder {
    pub address: H160,
    pub balance: U256,
}

impl BalanceLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn build<I>(transfers: I) -> Self
    where
        I: IntoIterator<Item = (H160, H160, U256)>,
    {
        let mut ledger = Self::new();
        for (from, to, amount) in transfers {
            ledger.apply_transfer(from, to, amount);
        }
        ledger
    }

    pub fn apply_transfer(&mut self, from: H160, to: H160, amount: U256) {
        let delta = I256::try_from(amount).unwrap_or(I256::MAX);
        if !from.is_zero() {
            let entry = self.balances.entry(from).or_insert_with(I256::zero);
            *entry = entry.saturating_sub(delta);
        }
        if !to.is_zero() {
            let entry = self.balances.entry(to).or_insert_with(I256::zero);
            *entry = entry.saturating_add(delta);
        }
    }

    /// Raw signed balance, before any exclusion. The creator's dev-holds
    /// metric reads this directly.
    pub fn balance_raw(&self, address: H160) -> I256 {
        self.balances.get(&address).copied().unwrap_or_else(I256::zero)
    }

    pub fn positive_balance(&self, address: H160) -> U256 {
        let raw = self.balance_raw(address);
        if raw.is_negative() {
            U256::zero()
        } else {
            raw.into_raw()
        }
    }

    /// Addresses holding a strictly positive balance, minus `exclude`
    /// (token contract and paired liquidity address), sorted descending.
    pub fn holders(&self, exclude: &[H160]) -> Vec<Holder> {
        let mut out: Vec<Holder> = self
            .balances
            .iter()
            .filter(|(addr, bal)| bal.is_positive() && !exclude.contains(addr))
            .map(|(addr, bal)| Holder {
                address: *addr,
                balance: bal.into_raw(),
            })
            .collect();
        out.sort_by(|a, b| b.balance.cmp(&a.balance));
        out
    }

    /// Entries the fold drove below zero. Non-empty means the transfer
    /// history has a gap and derived stats should be treated as suspect.
    pub fn negative_entries(&self) -> Vec<(H160, I256)> {
        self.balances
            .iter()
            .filter(|(_, bal)| bal.is_negative())
            .map(|(addr, bal)| (*addr, *bal))
            .collect()
    }

    /// Sum of all positive balances; equals total supply minus burned when
    /// the history is complete from genesis.
    pub fn circulating(&self) -> U256 {
        self.balances
            .values()
            .filter(|bal| bal.is_positive())
            .fold(U256::zero(), |acc, bal| acc.saturating_add(bal.into_raw()))
    }
}

/// Share of `total` held by `amount`, in basis points, round-half-up.
/// Integer all the way down; the only division happens here.
pub fn pct_bps(amount: U256, total: U256) -> u32 {
    if total.is_zero() {
        return 0;
    }
    let doubled = amount.saturating_mul(U256::from(20_000u64)) / total;
    let bps = (doubled + U256::from(1u64)) / U256::from(2u64);
    bps.min(U256::from(u32::MAX)).as_u32()
}

/// The uniform percentage policy: basis points divided down at the edge.
pub fn pct(amount: U256, total: U256) -> f64 {
    f64::from(pct_bps(amount, total)) / 100.0
}

/// Combined share of the first `n` holders, as a percentage of full supply.
pub fn top_n_pct(holders: &[Holder], n: usize, total_supply: U256) -> f64 {
    let sum = holders
        .iter()
        .take(n)
        .fold(U256::zero(), |acc, h| acc.saturating_add(h.balance));
    pct(sum, total_supply)
}
