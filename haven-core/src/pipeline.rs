use crate::chain::ChainReader;
use crate::classify::{self, SwapObservation, TransferObservation};
use crate::config::HavenConfig;
use crate::db::{self, WalletFlagUpdate};
use crate::error::ChainError;
use crate::events::{self, TradeLog, TransferLog};
use crate::ledger::BalanceLedger;
use crate::models::{
    decimal_to_u256, format_address, format_hash, parse_address, u256_to_decimal,
    FeeCollectionRow, SwapRow, Token, TransferRow,
};
use crate::normalize::{self, NormalizedSwap, TokenContext};
use crate::oracle::{PriceOracle, SnapshotThrottle};
use crate::stats::{self, AggregateInputs, WindowSwap};
use anyhow::{anyhow, Result};
use chrono::{DateTime, Duration, Utc};
use ethers::types::H160;
use sqlx::PgPool;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Mutex;
use tracing::{info, warn};

pub const REALTIME_WATERMARK: &str = "realtime_last_block";
pub const FEE_SWEEP_WATERMARK: &str = "fee_sweep_last_block";

/// Everything a driver run needs, owned once per process and borrowed by
/// every per-token pipeline.
pub struct IndexerContext {
    pub pool: PgPool,
    pub chain: Arc<ChainReader>,
    pub oracle: Arc<PriceOracle>,
    pub cfg: HavenConfig,
    snapshot_throttles: Mutex<HashMap<String, SnapshotThrottle>>,
}

impl IndexerContext {
    pub fn new(
        pool: PgPool,
        chain: Arc<ChainReader>,
        oracle: Arc<PriceOracle>,
        cfg: HavenConfig,
    ) -> Self {
        Self {
            pool,
            chain,
            oracle,
            cfg,
            snapshot_throttles: Mutex::new(HashMap::new()),
        }
    }

    /// Price snapshots are paced per token so the per-block refresh does not
    /// write one history row per block.
    async fn snapshot_ready(&self, token_address: &str) -> bool {
        let interval = std::time::Duration::from_secs(self.cfg.oracle.snapshot_interval_secs);
        let mut throttles = self.snapshot_throttles.lock().await;
        throttles
            .entry(token_address.to_string())
            .or_insert_with(|| SnapshotThrottle::new(interval))
            .ready(Instant::now())
    }
}

/// Full-history pipeline for one token. Transient chain errors abort the
/// remaining steps for this token (safe to re-run later); a missing contract
/// capability only skips the step it affects.
pub async fn backfill_token(ctx: &IndexerContext, token: &Token) -> Result<()> {
    let head = ctx.chain.latest_block().await?;
    let from = token.deploy_block.unwrap_or(0).max(0) as u64;

    ingest_range(ctx, token, from, head).await?;
    refresh_contract_facts(ctx, token).await?;

    // The graduation event may have flipped the flag mid-run; re-read before
    // deriving state so pair swaps and pricing see it.
    let token = db::get_token(&ctx.pool, &token.address)
        .await?
        .ok_or_else(|| anyhow!("token {} disappeared during backfill", token.address))?;

    refresh_token_state(ctx, &token).await
}

/// Incremental pipeline for one token over a bounded block range; shared by
/// the realtime per-block loop and the new-token handler.
pub async fn process_block_range(
    ctx: &IndexerContext,
    token: &Token,
    from_block: u64,
    to_block: u64,
) -> Result<()> {
    if from_block > to_block {
        return Ok(());
    }
    ingest_range(ctx, token, from_block, to_block).await?;

    let token = db::get_token(&ctx.pool, &token.address)
        .await?
        .ok_or_else(|| anyhow!("token {} disappeared during range scan", token.address))?;

    refresh_token_state(ctx, &token).await
}

/// Event ingestion over one block range: transfers and curve trades always,
/// pair swaps once graduated, then the graduation scan itself. Raw event
/// rows are immutable and keyed naturally, so overlapping ranges replay to
/// the same state.
async fn ingest_range(
    ctx: &IndexerContext,
    token: &Token,
    from_block: u64,
    to_block: u64,
) -> Result<()> {
    let address = token
        .address_h160()
        .ok_or_else(|| anyhow!("unparseable token address {}", token.address))?;
    let curve = token.curve_h160();
    let trade_source = curve.unwrap_or(address);

    let transfers = fetch_transfers(ctx, address, from_block, to_block).await?;
    if !transfers.is_empty() {
        info!(
            token = %token.address,
            count = transfers.len(),
            "storing transfers for blocks {from_block}..={to_block}"
        );
    }
    db::insert_transfers(&ctx.pool, &transfers).await?;

    let asset_usd = ctx.oracle.bnb_usd().await;
    let curve_ctx = TokenContext {
        token: address,
        pair: None,
        token_is_token0: None,
    };

    let mut swaps = Vec::new();
    for trade in fetch_curve_trades(ctx, trade_source, from_block, to_block).await? {
        if let Some(swap) = normalize::normalize_trade(&trade, &curve_ctx, asset_usd) {
            swaps.push(swap);
        }
    }

    if token.graduated {
        match fetch_pair_swaps(ctx, token, address, from_block, to_block, asset_usd).await {
            Ok(mut pair_swaps) => swaps.append(&mut pair_swaps),
            Err(ChainError::MissingCapability { address, method }) => {
                info!(token = %token.address, "pair {address} lacks {method}, skipping swaps");
            }
            Err(e) => return Err(e.into()),
        }
    }

    let swap_rows = swap_rows(ctx, &token.address, &swaps).await;
    db::insert_swaps(&ctx.pool, &swap_rows).await?;

    match fetch_fee_collections(ctx, token, trade_source, from_block, to_block, asset_usd).await {
        Ok(fees) => db::insert_fee_collections(&ctx.pool, &fees).await?,
        Err(ChainError::MissingCapability { .. }) => {
            info!(token = %token.address, "no fee-collection events on this contract");
        }
        Err(e) => return Err(e.into()),
    }

    check_graduation(ctx, token, trade_source, address, from_block, to_block).await?;

    Ok(())
}

/// Contract reads the ledger cannot supply: total supply and, when the
/// accessor exists, the creator. A token without `creator()` is a feature
/// gap, not a failure.
async fn refresh_contract_facts(ctx: &IndexerContext, token: &Token) -> Result<()> {
    let address = token
        .address_h160()
        .ok_or_else(|| anyhow!("unparseable token address {}", token.address))?;

    match ctx.chain.total_supply(address).await {
        Ok(supply) => {
            db::set_total_supply(&ctx.pool, &token.address, &u256_to_decimal(supply)).await?;
        }
        Err(ChainError::MissingCapability { .. }) => {
            info!(token = %token.address, "totalSupply() unavailable, keeping stored value");
        }
        Err(e) => return Err(e.into()),
    }

    if token.creator_address.is_none() {
        match ctx.chain.creator(address).await {
            Ok(creator) => {
                db::set_creator(&ctx.pool, &token.address, &format_address(creator)).await?;
            }
            Err(ChainError::MissingCapability { .. }) => {
                info!(token = %token.address, "creator() unavailable for this token");
            }
            Err(e) => return Err(e.into()),
        }
    }

    Ok(())
}

async fn fetch_transfers(
    ctx: &IndexerContext,
    token: H160,
    from_block: u64,
    to_block: u64,
) -> Result<Vec<TransferRow>, ChainError> {
    let logs = ctx
        .chain
        .get_logs_chunked(
            token,
            events::event_topic(events::TRANSFER_SIG),
            from_block,
            to_block,
        )
        .await?;

    let mut rows = Vec::with_capacity(logs.len());
    for log in &logs {
        let Some(transfer) = events::decode_transfer(log) else {
            continue;
        };
        rows.push(transfer_row(ctx, token, &transfer).await);
    }
    Ok(rows)
}

async fn transfer_row(ctx: &IndexerContext, token: H160, t: &TransferLog) -> TransferRow {
    let block_time = ctx.chain.block_timestamp(t.meta.block_number).await.ok();
    TransferRow {
        token_address: format_address(token),
        from_address: format_address(t.from),
        to_address: format_address(t.to),
        amount: u256_to_decimal(t.value),
        tx_hash: format_hash(t.meta.tx_hash),
        block_number: t.meta.block_number as i64,
        log_index: t.meta.log_index as i64,
        block_time,
    }
}

async fn fetch_curve_trades(
    ctx: &IndexerContext,
    source: H160,
    from_block: u64,
    to_block: u64,
) -> Result<Vec<TradeLog>, ChainError> {
    let mut trades = Vec::new();

    let buys = ctx
        .chain
        .get_logs_chunked(
            source,
            events::event_topic(events::CURVE_BUY_SIG),
            from_block,
            to_block,
        )
        .await?;
    trades.extend(buys.iter().filter_map(events::decode_curve_buy));

    let sells = ctx
        .chain
        .get_logs_chunked(
            source,
            events::event_topic(events::CURVE_SELL_SIG),
            from_block,
            to_block,
        )
        .await?;
    trades.extend(sells.iter().filter_map(events::decode_curve_sell));

    Ok(trades)
}

async fn fetch_pair_swaps(
    ctx: &IndexerContext,
    token: &Token,
    address: H160,
    from_block: u64,
    to_block: u64,
    asset_usd: f64,
) -> Result<Vec<NormalizedSwap>, ChainError> {
    let Some(pair) = token.pair_h160() else {
        return Ok(Vec::new());
    };

    let (token0, token1) = ctx.chain.pair_tokens(pair).await?;
    let token_is_token0 = if token0 == address {
        Some(true)
    } else if token1 == address {
        Some(false)
    } else {
        warn!(token = %token.address, pair = %format_address(pair), "pair does not contain the tracked token");
        return Ok(Vec::new());
    };

    let pair_ctx = TokenContext {
        token: address,
        pair: Some(pair),
        token_is_token0,
    };

    let logs = ctx
        .chain
        .get_logs_chunked(
            pair,
            events::event_topic(events::PAIR_SWAP_SIG),
            from_block,
            to_block,
        )
        .await?;

    // Events that resolve to no valid direction are dropped here, by design.
    Ok(logs
        .iter()
        .filter_map(events::decode_pair_swap)
        .filter_map(|trade| normalize::normalize_trade(&trade, &pair_ctx, asset_usd))
        .collect())
}

async fn swap_rows(ctx: &IndexerContext, token_address: &str, swaps: &[NormalizedSwap]) -> Vec<SwapRow> {
    let mut rows = Vec::with_capacity(swaps.len());
    for s in swaps {
        let block_time = ctx.chain.block_timestamp(s.meta.block_number).await.ok();
        rows.push(SwapRow {
            token_address: token_address.to_string(),
            pair_address: s.pair.map(format_address),
            trader: format_address(s.trader),
            is_buy: s.is_buy,
            token_amount: u256_to_decimal(s.token_amount),
            asset_amount: u256_to_decimal(s.asset_amount),
            price_usd: s.price_usd,
            tx_hash: format_hash(s.meta.tx_hash),
            block_number: s.meta.block_number as i64,
            log_index: s.meta.log_index as i64,
            block_time,
        });
    }
    rows
}

async fn fetch_fee_collections(
    ctx: &IndexerContext,
    token: &Token,
    source: H160,
    from_block: u64,
    to_block: u64,
    asset_usd: f64,
) -> Result<Vec<FeeCollectionRow>, ChainError> {
    let logs = ctx
        .chain
        .get_logs_chunked(
            source,
            events::event_topic(events::FEE_COLLECTED_SIG),
            from_block,
            to_block,
        )
        .await?;

    let mut rows = Vec::new();
    for log in &logs {
        let Some(fee) = events::decode_fee_collected(log) else {
            continue;
        };
        let block_time = ctx.chain.block_timestamp(fee.meta.block_number).await.ok();
        rows.push(FeeCollectionRow {
            tx_hash: format_hash(fee.meta.tx_hash),
            token_address: token.address.clone(),
            creator_address: format_address(fee.creator),
            asset_amount: u256_to_decimal(fee.amount),
            usd_amount: normalize::units_to_f64(fee.amount) * asset_usd,
            block_number: fee.meta.block_number as i64,
            block_time,
        });
    }
    Ok(rows)
}

async fn check_graduation(
    ctx: &IndexerContext,
    token: &Token,
    source: H160,
    address: H160,
    from_block: u64,
    to_block: u64,
) -> Result<()> {
    if token.graduated {
        return Ok(());
    }

    let logs = match ctx
        .chain
        .get_logs_chunked(
            source,
            events::event_topic(events::GRADUATED_SIG),
            from_block,
            to_block,
        )
        .await
    {
        Ok(logs) => logs,
        Err(ChainError::MissingCapability { .. }) => return Ok(()),
        Err(e) => return Err(e.into()),
    };

    for log in &logs {
        let Some(grad) = events::decode_graduated(log) else {
            continue;
        };
        if grad.token != address {
            continue;
        }
        let at = ctx.chain.block_timestamp(grad.meta.block_number).await.ok();
        info!(token = %token.address, pair = %format_address(grad.pair), "token graduated");
        db::mark_graduated(&ctx.pool, &token.address, &format_address(grad.pair), at).await?;
        break;
    }

    Ok(())
}

/// Recompute everything derived for one token from the stored ledger and
/// overwrite it wholesale: holder balances, wallet flags, and the aggregate
/// metric columns. Running this twice over the same stored events yields the
/// same state.
pub async fn refresh_token_state(ctx: &IndexerContext, token: &Token) -> Result<()> {
    let address = token
        .address_h160()
        .ok_or_else(|| anyhow!("unparseable token address {}", token.address))?;
    let curve = token.curve_h160();
    let pair = token.pair_h160();

    let transfer_rows = db::get_transfers_for_token(&ctx.pool, &token.address).await?;
    let ledger = BalanceLedger::build(transfer_rows.iter().filter_map(|row| {
        Some((
            parse_address(&row.from_address)?,
            parse_address(&row.to_address)?,
            decimal_to_u256(&row.amount)?,
        ))
    }));

    let negatives = ledger.negative_entries();
    if !negatives.is_empty() {
        // An ingestion gap: some spend arrived without its funding transfer.
        // Stats still persist, but the gap is flagged for operators.
        warn!(
            token = %token.address,
            wallets = negatives.len(),
            "negative folded balances indicate missing transfer history"
        );
    }

    let mut excluded = vec![address];
    excluded.extend(curve.filter(|c| *c != address));
    excluded.extend(pair);
    let holders = ledger.holders(&excluded);

    let balances: Vec<(String, sqlx::types::BigDecimal)> = holders
        .iter()
        .map(|h| (format_address(h.address), u256_to_decimal(h.balance)))
        .collect();
    db::replace_holder_balances(&ctx.pool, &token.address, &balances).await?;

    let total_supply = token
        .total_supply_u256()
        .unwrap_or_else(|| ledger.circulating());

    // Classification over the full observed history.
    let transfer_obs: Vec<TransferObservation> = transfer_rows
        .iter()
        .filter_map(|row| {
            Some(TransferObservation {
                from: parse_address(&row.from_address)?,
                to: parse_address(&row.to_address)?,
                block_number: row.block_number as u64,
            })
        })
        .collect();

    let swap_rows = db::get_all_swaps_for_token(&ctx.pool, &token.address).await?;
    let swap_obs: Vec<SwapObservation> = swap_rows
        .iter()
        .filter_map(|row| {
            Some(SwapObservation {
                trader: parse_address(&row.trader)?,
                is_buy: row.is_buy,
                block_number: row.block_number as u64,
            })
        })
        .collect();

    let buyer_first = classify::buyer_first_blocks(address, curve, &transfer_obs, &swap_obs);
    let first_block = classify::first_transfer_block(&transfer_obs);
    let classification = classify::classify_holders(
        &holders,
        &buyer_first,
        first_block,
        ctx.cfg.indexer.sniper_window_blocks,
        total_supply,
    );

    let insider_wallets = find_insiders(ctx, token).await?;
    let insider_pct = classify::insider_pct(&holders, &insider_wallets, total_supply);

    persist_flags(ctx, &classification, &buyer_first, first_block, &insider_wallets).await?;

    // Pricing: the latest trade wins; reserves are only the no-history
    // fallback.
    let asset_usd = ctx.oracle.bnb_usd().await;
    let (price_usd, liquidity_usd) =
        resolve_price(ctx, token, address, pair, asset_usd).await?;

    let now = Utc::now();
    let swaps_24h: Vec<WindowSwap> = db::get_swaps_since(&ctx.pool, &token.address, now - Duration::hours(24))
        .await?
        .iter()
        .map(|s| WindowSwap {
            is_buy: s.is_buy,
            volume_usd: s.price_usd
                * normalize::units_to_f64(decimal_to_u256(&s.token_amount).unwrap_or_default()),
        })
        .collect();

    let snapshots: Vec<(DateTime<Utc>, f64)> =
        db::get_price_snapshots_since(&ctx.pool, &token.address, now - Duration::hours(25))
            .await?
            .iter()
            .map(|s| (s.snapped_at, s.price_usd))
            .collect();

    let aggregates = stats::compute(&AggregateInputs {
        holders: &holders,
        total_supply,
        dev_balance: token
            .creator_h160()
            .map(|c| ledger.positive_balance(c))
            .unwrap_or_default(),
        classification: &classification,
        insider_pct,
        swaps_24h: &swaps_24h,
        price_usd,
        liquidity_usd,
        snapshots: &snapshots,
        now,
    });

    db::update_token_metrics(&ctx.pool, &token.address, &aggregates).await?;
    if price_usd > 0.0 && ctx.snapshot_ready(&token.address).await {
        db::insert_price_snapshot(&ctx.pool, &token.address, price_usd).await?;
    }

    Ok(())
}

async fn resolve_price(
    ctx: &IndexerContext,
    token: &Token,
    address: H160,
    pair: Option<H160>,
    asset_usd: f64,
) -> Result<(f64, f64)> {
    let last = db::last_swap_price(&ctx.pool, &token.address).await?;

    let mut liquidity = 0.0;
    let mut reserve_price = 0.0;
    if let Some(pair) = pair {
        match ctx.chain.pair_tokens(pair).await {
            Ok((token0, _)) => match ctx.chain.get_reserves(pair).await {
                Ok((reserve0, reserve1)) => {
                    let (token_reserve, asset_reserve) = if token0 == address {
                        (reserve0, reserve1)
                    } else {
                        (reserve1, reserve0)
                    };
                    reserve_price =
                        normalize::reserve_price_usd(token_reserve, asset_reserve, asset_usd);
                    liquidity = normalize::units_to_f64(asset_reserve) * asset_usd * 2.0;
                }
                Err(e) if e.is_transient() => warn!(token = %token.address, "reserve read failed: {e}"),
                Err(_) => {}
            },
            Err(e) if e.is_transient() => warn!(token = %token.address, "pair read failed: {e}"),
            Err(_) => {}
        }
    }

    Ok((last.unwrap_or(reserve_price), liquidity))
}

/// Wallets holding ≥2 tokens by this token's creator, with their connection
/// counts.
async fn find_insiders(ctx: &IndexerContext, token: &Token) -> Result<HashMap<H160, usize>> {
    let Some(creator) = token.creator_h160() else {
        return Ok(HashMap::new());
    };
    let Some(creator_str) = token.creator_address.as_deref() else {
        return Ok(HashMap::new());
    };

    let sibling_tokens = db::get_tokens_by_creator(&ctx.pool, creator_str).await?;
    if sibling_tokens.len() < 2 {
        return Ok(HashMap::new());
    }

    let mut holdings: Vec<(H160, HashSet<H160>)> = Vec::with_capacity(sibling_tokens.len());
    for sibling in &sibling_tokens {
        let Some(sibling_addr) = sibling.address_h160() else {
            continue;
        };
        let holders = db::get_positive_holder_addresses(&ctx.pool, &sibling.address)
            .await?
            .iter()
            .filter_map(|s| parse_address(s))
            .collect::<HashSet<_>>();
        holdings.push((sibling_addr, holders));
    }

    Ok(classify::insiders(creator, &holdings))
}

async fn persist_flags(
    ctx: &IndexerContext,
    classification: &classify::Classification,
    buyer_first: &HashMap<H160, u64>,
    first_block: Option<u64>,
    insider_wallets: &HashMap<H160, usize>,
) -> Result<()> {
    let mut updates: HashMap<H160, WalletFlagUpdate> = HashMap::new();

    for wallet in &classification.phishing {
        let entry = updates.entry(*wallet).or_insert_with(|| blank_flag(*wallet));
        entry.is_phishing = true;
        entry.phishing_reports = 1;
    }

    for wallet in &classification.snipers {
        let entry = updates.entry(*wallet).or_insert_with(|| blank_flag(*wallet));
        entry.is_sniper = true;
        entry.sniper_score = sniper_score(
            buyer_first.get(wallet).copied(),
            first_block,
            ctx.cfg.indexer.sniper_window_blocks,
        );
    }

    for (wallet, connections) in insider_wallets {
        let entry = updates.entry(*wallet).or_insert_with(|| blank_flag(*wallet));
        entry.is_insider = true;
        entry.insider_connections = *connections as i32;
    }

    let updates: Vec<WalletFlagUpdate> = updates.into_values().collect();
    db::upsert_wallet_flags(&ctx.pool, &updates).await
}

fn blank_flag(wallet: H160) -> WalletFlagUpdate {
    WalletFlagUpdate {
        wallet_address: format_address(wallet),
        is_phishing: false,
        is_sniper: false,
        is_insider: false,
        sniper_score: 0,
        insider_connections: 0,
        phishing_reports: 0,
    }
}

/// 0–100, higher for buys closer to launch.
fn sniper_score(first_buy: Option<u64>, first_block: Option<u64>, window: u64) -> i32 {
    let (Some(buy), Some(first)) = (first_buy, first_block) else {
        return 0;
    };
    let offset = buy.saturating_sub(first).min(window);
    (((window - offset + 1) * 100) / (window + 1)) as i32
}

/// One sweep tick: scan the capped range for fee-collection events across
/// all tokens. A token's failure is logged and the sweep moves on.
pub async fn sweep_fees(
    ctx: &IndexerContext,
    tokens: &[Token],
    from_block: u64,
    to_block: u64,
) -> Result<()> {
    let asset_usd = ctx.oracle.bnb_usd().await;

    for token in tokens {
        let Some(address) = token.address_h160() else {
            continue;
        };
        let source = token.curve_h160().unwrap_or(address);

        match fetch_fee_collections(ctx, token, source, from_block, to_block, asset_usd).await {
            Ok(fees) => {
                if !fees.is_empty() {
                    info!(token = %token.address, count = fees.len(), "storing fee collections");
                }
                if let Err(e) = db::insert_fee_collections(&ctx.pool, &fees).await {
                    warn!(token = %token.address, "failed to store fee collections: {e:#}");
                }
            }
            Err(ChainError::MissingCapability { .. }) => {}
            Err(e) => warn!(token = %token.address, "fee sweep failed: {e}"),
        }
    }

    Ok(())
}

/// New-token notification handler: index immediately from the deployment
/// block, or the recent window when it is unknown.
pub async fn index_new_token(ctx: &IndexerContext, address: &str) -> Result<()> {
    let Some(token) = db::get_token(&ctx.pool, address).await? else {
        warn!(token = %address, "new-token notification for unknown row");
        return Ok(());
    };

    let head = ctx.chain.latest_block().await?;
    let from = match token.deploy_block {
        Some(block) if block >= 0 => block as u64,
        _ => head.saturating_sub(ctx.cfg.indexer.startup_backfill_blocks),
    };

    refresh_contract_facts(ctx, &token).await?;
    process_block_range(ctx, &token, from, head).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sniper_score_decays_with_distance_from_launch() {
        assert_eq!(sniper_score(Some(100), Some(100), 10), 100);
        assert_eq!(sniper_score(Some(105), Some(100), 10), 54);
        assert_eq!(sniper_score(Some(110), Some(100), 10), 9);
        // Outside the window the score floors rather than going negative.
        assert_eq!(sniper_score(Some(200), Some(100), 10), 9);
        assert_eq!(sniper_score(None, Some(100), 10), 0);
    }
}
