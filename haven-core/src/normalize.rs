use crate::events::{LogMeta, TradeLog};
use ethers::types::{H160, U256};
use ethers::utils::format_units;

/// What the normalizer needs to know about the token under scan. The
/// token0/token1 order is read once from the pair contract and cached by the
/// chain reader; it never changes for a deployed pair.
#[derive(Debug, Clone, Copy)]
pub struct TokenContext {
    pub token: H160,
    pub pair: Option<H160>,
    /// True when the tracked token sits in slot 0 of the pair.
    pub token_is_token0: Option<bool>,
}

/// Canonical swap record every source shape converges to.
#[derive(Debug, Clone, PartialEq)]
pub struct NormalizedSwap {
    pub token: H160,
    pub pair: Option<H160>,
    pub trader: H160,
    pub is_buy: bool,
    pub token_amount: U256,
    pub asset_amount: U256,
    pub price_usd: f64,
    pub meta: LogMeta,
}

/// Map one source event into the canonical shape. Returns `None` for pair
/// events that do not resolve to a valid trade direction for the tracked
/// token (both amounts zero, or a same-direction anomaly) — those are
/// discarded, not stored as zero-value trades.
pub fn normalize_trade(
    trade: &TradeLog,
    ctx: &TokenContext,
    asset_usd: f64,
) -> Option<NormalizedSwap> {
    match trade {
        TradeLog::CurveBuy {
            user,
            asset_in,
            tokens_out,
            meta,
            ..
        } => Some(build(ctx, *user, true, *tokens_out, *asset_in, asset_usd, *meta)),
        TradeLog::CurveSell {
            user,
            tokens_in,
            asset_out,
            meta,
            ..
        } => Some(build(ctx, *user, false, *tokens_in, *asset_out, asset_usd, *meta)),
        TradeLog::PairSwap {
            sender,
            to,
            amount0_in,
            amount1_in,
            amount0_out,
            amount1_out,
            meta,
            ..
        } => {
            let token_is_token0 = ctx.token_is_token0?;
            let (token_in, token_out, asset_in, asset_out) = if token_is_token0 {
                (*amount0_in, *amount0_out, *amount1_in, *amount1_out)
            } else {
                (*amount1_in, *amount1_out, *amount0_in, *amount0_out)
            };

            // A buy of the tracked token: counter asset flows in, token
            // flows out. A sell is the reverse.
            let buy = !asset_in.is_zero() && !token_out.is_zero();
            let sell = !token_in.is_zero() && !asset_out.is_zero();

            match (buy, sell) {
                (true, false) => Some(build(ctx, *to, true, token_out, asset_in, asset_usd, *meta)),
                (false, true) => {
                    Some(build(ctx, *sender, false, token_in, asset_out, asset_usd, *meta))
                }
                // Both-zero or both-direction events carry no usable trade.
                _ => None,
            }
        }
    }
}

fn build(
    ctx: &TokenContext,
    trader: H160,
    is_buy: bool,
    token_amount: U256,
    asset_amount: U256,
    asset_usd: f64,
    meta: LogMeta,
) -> NormalizedSwap {
    NormalizedSwap {
        token: ctx.token,
        pair: ctx.pair,
        trader,
        is_buy,
        token_amount,
        asset_amount,
        price_usd: trade_price_usd(token_amount, asset_amount, asset_usd),
        meta,
    }
}

/// USD price of one token unit, from the trade's own amounts. Both sides are
/// 18-decimal raw integers; the ratio is taken after scaling so precision is
/// only lost in the final float.
pub fn trade_price_usd(token_amount: U256, asset_amount: U256, asset_usd: f64) -> f64 {
    let tokens = units_to_f64(token_amount);
    if tokens == 0.0 {
        return 0.0;
    }
    units_to_f64(asset_amount) * asset_usd / tokens
}

/// Fallback pricing from pool reserves, used only when a token has no trade
/// history yet.
pub fn reserve_price_usd(token_reserve: U256, asset_reserve: U256, asset_usd: f64) -> f64 {
    let tokens = units_to_f64(token_reserve);
    if tokens == 0.0 {
        return 0.0;
    }
    units_to_f64(asset_reserve) * asset_usd / tokens
}

/// 18-decimal raw integer to a display float. Precision loss is confined to
/// the final conversion.
pub fn units_to_f64(raw: U256) -> f64 {
    format_units(raw, 18)
        .ok()
        .and_then(|s| s.parse::<f64>().ok())
        .unwrap_or(0.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::LogMeta;
    use ethers::types::H256;

    fn addr(n: u64) -> H160 {
        H160::from_low_u64_be(n)
    }

    fn meta() -> LogMeta {
        LogMeta {
            block_number: 100,
            tx_hash: H256::from_low_u64_be(1),
            log_index: 0,
        }
    }

    fn ctx_token1() -> TokenContext {
        TokenContext {
            token: addr(1),
            pair: Some(addr(2)),
            token_is_token0: Some(false),
        }
    }

    #[test]
    fn pair_swap_buy_when_token_is_token1() {
        // amount0In = 50 (counter asset in), amount1Out = 1000 (token out).
        let trade = TradeLog::PairSwap {
            pair: addr(2),
            sender: addr(10),
            to: addr(11),
            amount0_in: U256::from(50u64),
            amount1_in: U256::zero(),
            amount0_out: U256::zero(),
            amount1_out: U256::from(1_000u64),
            meta: meta(),
        };

        let swap = normalize_trade(&trade, &ctx_token1(), 0.0).expect("valid buy");
        assert!(swap.is_buy);
        assert_eq!(swap.trader, addr(11));
        assert_eq!(swap.token_amount, U256::from(1_000u64));
        assert_eq!(swap.asset_amount, U256::from(50u64));
    }

    #[test]
    fn pair_swap_sell_when_token_is_token1() {
        let trade = TradeLog::PairSwap {
            pair: addr(2),
            sender: addr(10),
            to: addr(11),
            amount0_in: U256::zero(),
            amount1_in: U256::from(1_000u64),
            amount0_out: U256::from(45u64),
            amount1_out: U256::zero(),
            meta: meta(),
        };

        let swap = normalize_trade(&trade, &ctx_token1(), 0.0).expect("valid sell");
        assert!(!swap.is_buy);
        assert_eq!(swap.trader, addr(10));
        assert_eq!(swap.token_amount, U256::from(1_000u64));
        assert_eq!(swap.asset_amount, U256::from(45u64));
    }

    #[test]
    fn anomalous_pair_swaps_are_discarded() {
        let both_zero = TradeLog::PairSwap {
            pair: addr(2),
            sender: addr(10),
            to: addr(11),
            amount0_in: U256::zero(),
            amount1_in: U256::zero(),
            amount0_out: U256::zero(),
            amount1_out: U256::zero(),
            meta: meta(),
        };
        assert!(normalize_trade(&both_zero, &ctx_token1(), 0.0).is_none());

        // Token flows both in and out with the counter asset on both sides:
        // no single direction makes sense.
        let same_direction = TradeLog::PairSwap {
            pair: addr(2),
            sender: addr(10),
            to: addr(11),
            amount0_in: U256::from(5u64),
            amount1_in: U256::from(5u64),
            amount0_out: U256::from(5u64),
            amount1_out: U256::from(5u64),
            meta: meta(),
        };
        assert!(normalize_trade(&same_direction, &ctx_token1(), 0.0).is_none());
    }

    #[test]
    fn pair_swap_without_known_order_is_discarded() {
        let trade = TradeLog::PairSwap {
            pair: addr(2),
            sender: addr(10),
            to: addr(11),
            amount0_in: U256::from(50u64),
            amount1_in: U256::zero(),
            amount0_out: U256::zero(),
            amount1_out: U256::from(1_000u64),
            meta: meta(),
        };
        let ctx = TokenContext {
            token: addr(1),
            pair: Some(addr(2)),
            token_is_token0: None,
        };
        assert!(normalize_trade(&trade, &ctx, 0.0).is_none());
    }

    #[test]
    fn curve_events_map_directly() {
        let ctx = TokenContext {
            token: addr(1),
            pair: None,
            token_is_token0: None,
        };

        let buy = TradeLog::CurveBuy {
            user: addr(7),
            asset_in: U256::from(100u64),
            tokens_out: U256::from(2_000u64),
            fee: U256::from(1u64),
            meta: meta(),
        };
        let swap = normalize_trade(&buy, &ctx, 0.0).expect("curve buy");
        assert!(swap.is_buy);
        assert_eq!(swap.trader, addr(7));
        assert_eq!(swap.token_amount, U256::from(2_000u64));
        assert_eq!(swap.asset_amount, U256::from(100u64));

        let sell = TradeLog::CurveSell {
            user: addr(8),
            tokens_in: U256::from(500u64),
            asset_out: U256::from(20u64),
            fee: U256::from(1u64),
            meta: meta(),
        };
        let swap = normalize_trade(&sell, &ctx, 0.0).expect("curve sell");
        assert!(!swap.is_buy);
        assert_eq!(swap.trader, addr(8));
        assert_eq!(swap.token_amount, U256::from(500u64));
        assert_eq!(swap.asset_amount, U256::from(20u64));
    }

    #[test]
    fn per_trade_price_uses_event_amounts() {
        // 2 BNB for 1000 tokens at 600 USD/BNB = 1.2 USD per token.
        let token_amount = U256::from(1_000u64) * U256::exp10(18);
        let asset_amount = U256::from(2u64) * U256::exp10(18);
        let price = trade_price_usd(token_amount, asset_amount, 600.0);
        assert!((price - 1.2).abs() < 1e-9);
    }

    #[test]
    fn zero_token_amount_prices_at_zero() {
        assert_eq!(trade_price_usd(U256::zero(), U256::from(5u64), 600.0), 0.0);
    }
}
