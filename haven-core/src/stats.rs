use crate::classify::Classification;
use crate::ledger::{pct, top_n_pct, Holder};
use crate::normalize::units_to_f64;
use chrono::{DateTime, Duration, Utc};
use ethers::types::U256;

/// One swap inside the trailing stats window.
#[derive(Debug, Clone, Copy)]
pub struct WindowSwap {
    pub is_buy: bool,
    pub volume_usd: f64,
}

/// Everything the aggregate recomputation needs, assembled by the pipeline.
/// The computation itself is pure so replaying it is deterministic.
#[derive(Debug, Clone)]
pub struct AggregateInputs<'a> {
    pub holders: &'a [Holder],
    pub total_supply: U256,
    /// Creator balance before exclusions; the creator is a normal holder.
    pub dev_balance: U256,
    pub classification: &'a Classification,
    pub insider_pct: f64,
    pub swaps_24h: &'a [WindowSwap],
    pub price_usd: f64,
    pub liquidity_usd: f64,
    /// (snapped_at, price) history, any order.
    pub snapshots: &'a [(DateTime<Utc>, f64)],
    pub now: DateTime<Utc>,
}

/// The wholesale-overwritten metric set for one token.
#[derive(Debug, Clone, PartialEq)]
pub struct TokenAggregates {
    pub holders_count: i64,
    pub txns_24h: i64,
    pub price_usd: f64,
    pub market_cap_usd: f64,
    pub liquidity_usd: f64,
    pub volume_24h_usd: f64,
    pub price_change_5m: Option<f64>,
    pub price_change_1h: Option<f64>,
    pub price_change_6h: Option<f64>,
    pub price_change_24h: Option<f64>,
    pub buys_24h: i64,
    pub sells_24h: i64,
    pub buy_volume_24h_usd: f64,
    pub sell_volume_24h_usd: f64,
    pub net_buy_24h_usd: f64,
    pub dev_holds_pct: f64,
    pub top10_holds_pct: f64,
    pub sniper_holds_pct: f64,
    pub insider_holds_pct: f64,
    pub phishing_holds_pct: f64,
}

pub fn compute(inputs: &AggregateInputs<'_>) -> TokenAggregates {
    let mut buys = 0i64;
    let mut sells = 0i64;
    let mut buy_volume = 0.0;
    let mut sell_volume = 0.0;
    for s in inputs.swaps_24h {
        if s.is_buy {
            buys += 1;
            buy_volume += s.volume_usd;
        } else {
            sells += 1;
            sell_volume += s.volume_usd;
        }
    }

    TokenAggregates {
        holders_count: inputs.holders.len() as i64,
        txns_24h: buys + sells,
        price_usd: inputs.price_usd,
        market_cap_usd: inputs.price_usd * units_to_f64(inputs.total_supply),
        liquidity_usd: inputs.liquidity_usd,
        volume_24h_usd: buy_volume + sell_volume,
        price_change_5m: price_change_pct(
            inputs.price_usd,
            inputs.snapshots,
            Duration::minutes(5),
            inputs.now,
        ),
        price_change_1h: price_change_pct(
            inputs.price_usd,
            inputs.snapshots,
            Duration::hours(1),
            inputs.now,
        ),
        price_change_6h: price_change_pct(
            inputs.price_usd,
            inputs.snapshots,
            Duration::hours(6),
            inputs.now,
        ),
        price_change_24h: price_change_pct(
            inputs.price_usd,
            inputs.snapshots,
            Duration::hours(24),
            inputs.now,
        ),
        buys_24h: buys,
        sells_24h: sells,
        buy_volume_24h_usd: buy_volume,
        sell_volume_24h_usd: sell_volume,
        net_buy_24h_usd: buy_volume - sell_volume,
        dev_holds_pct: pct(inputs.dev_balance, inputs.total_supply),
        top10_holds_pct: top_n_pct(inputs.holders, 10, inputs.total_supply),
        sniper_holds_pct: inputs.classification.sniper_pct,
        insider_holds_pct: inputs.insider_pct,
        phishing_holds_pct: inputs.classification.phishing_pct,
    }
}

/// Percent change of `current` against the snapshot nearest to
/// `now - window`. `None` when there is no usable reference point.
pub fn price_change_pct(
    current: f64,
    snapshots: &[(DateTime<Utc>, f64)],
    window: Duration,
    now: DateTime<Utc>,
) -> Option<f64> {
    let target = now - window;
    let (_, past) = snapshots
        .iter()
        .min_by_key(|(at, _)| (*at - target).num_seconds().abs())?;
    if *past <= 0.0 {
        return None;
    }
    Some((current - past) / past * 100.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use ethers::types::H160;

    fn holder(n: u64, balance: u64) -> Holder {
        Holder {
            address: H160::from_low_u64_be(n),
            balance: U256::from(balance),
        }
    }

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap()
    }

    #[test]
    fn windows_split_buys_and_sells() {
        let swaps = vec![
            WindowSwap {
                is_buy: true,
                volume_usd: 100.0,
            },
            WindowSwap {
                is_buy: true,
                volume_usd: 50.0,
            },
            WindowSwap {
                is_buy: false,
                volume_usd: 40.0,
            },
        ];
        let holders = vec![holder(1, 700), holder(2, 300)];
        let classification = Classification::default();
        let inputs = AggregateInputs {
            holders: &holders,
            total_supply: U256::from(10_000u64),
            dev_balance: U256::from(700u64),
            classification: &classification,
            insider_pct: 0.0,
            swaps_24h: &swaps,
            price_usd: 2.0,
            liquidity_usd: 0.0,
            snapshots: &[],
            now: now(),
        };

        let agg = compute(&inputs);
        assert_eq!(agg.buys_24h, 2);
        assert_eq!(agg.sells_24h, 1);
        assert_eq!(agg.txns_24h, 3);
        assert_eq!(agg.buy_volume_24h_usd, 150.0);
        assert_eq!(agg.sell_volume_24h_usd, 40.0);
        assert_eq!(agg.net_buy_24h_usd, 110.0);
        assert_eq!(agg.volume_24h_usd, 190.0);
        assert_eq!(agg.holders_count, 2);
        assert_eq!(agg.dev_holds_pct, 7.0);
        assert_eq!(agg.top10_holds_pct, 10.0);
    }

    #[test]
    fn price_change_uses_nearest_snapshot() {
        let t = now();
        let snapshots = vec![
            (t - Duration::minutes(62), 1.0),
            (t - Duration::minutes(30), 4.0),
            (t - Duration::minutes(3), 8.0),
        ];
        // 1h window: nearest to t-60m is the t-62m snapshot at 1.0.
        let change = price_change_pct(2.0, &snapshots, Duration::hours(1), t).unwrap();
        assert!((change - 100.0).abs() < 1e-9);
        // 5m window: nearest to t-5m is the t-3m snapshot at 8.0.
        let change = price_change_pct(4.0, &snapshots, Duration::minutes(5), t).unwrap();
        assert!((change + 50.0).abs() < 1e-9);
    }

    #[test]
    fn price_change_without_history_is_none() {
        assert_eq!(
            price_change_pct(2.0, &[], Duration::hours(1), now()),
            None
        );
        // A zero reference price cannot produce a meaningful percentage.
        let snaps = vec![(now() - Duration::hours(1), 0.0)];
        assert_eq!(price_change_pct(2.0, &snaps, Duration::hours(1), now()), None);
    }

    #[test]
    fn market_cap_scales_by_supply_units() {
        let holders = vec![];
        let classification = Classification::default();
        let inputs = AggregateInputs {
            holders: &holders,
            total_supply: U256::from(1_000_000u64) * U256::exp10(18),
            dev_balance: U256::zero(),
            classification: &classification,
            insider_pct: 0.0,
            swaps_24h: &[],
            price_usd: 0.5,
            liquidity_usd: 0.0,
            snapshots: &[],
            now: now(),
        };
        let agg = compute(&inputs);
        assert!((agg.market_cap_usd - 500_000.0).abs() < 1e-6);
    }
}
