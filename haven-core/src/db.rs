use crate::models::{
    FeeCollectionRow, HolderBalanceRow, PriceSnapshotRow, SwapRow, Token, TransferRow,
    WalletFlagRow,
};
use crate::stats::TokenAggregates;
use anyhow::Result;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgPoolOptions;
use sqlx::types::BigDecimal;
use sqlx::{PgPool, Row};

/// Postgres NOTIFY channel fired by the marketplace backend when a token row
/// is inserted; the realtime indexer LISTENs on it.
pub const NEW_TOKEN_CHANNEL: &str = "haven_new_token";

pub async fn create_pool(database_url: &str, max_connections: u32) -> Result<PgPool> {
    let pool = PgPoolOptions::new()
        .max_connections(max_connections)
        .connect(database_url)
        .await?;
    Ok(pool)
}

pub async fn run_migrations(pool: &PgPool) -> Result<()> {
    // Embed migrations from the workspace `migrations/` directory.
    sqlx::migrate!("../migrations").run(pool).await?;
    Ok(())
}

pub async fn list_tokens(pool: &PgPool) -> Result<Vec<Token>> {
    let rows = sqlx::query_as::<_, Token>("SELECT * FROM tokens ORDER BY address")
        .fetch_all(pool)
        .await?;
    Ok(rows)
}

pub async fn get_token(pool: &PgPool, address: &str) -> Result<Option<Token>> {
    let row = sqlx::query_as::<_, Token>("SELECT * FROM tokens WHERE address = $1")
        .bind(address)
        .fetch_optional(pool)
        .await?;
    Ok(row)
}

pub async fn get_tokens_by_creator(pool: &PgPool, creator: &str) -> Result<Vec<Token>> {
    let rows = sqlx::query_as::<_, Token>("SELECT * FROM tokens WHERE creator_address = $1")
        .bind(creator)
        .fetch_all(pool)
        .await?;
    Ok(rows)
}

/// Transfers are immutable: replaying an overlapping range hits the natural
/// key and inserts nothing.
pub async fn insert_transfers(pool: &PgPool, transfers: &[TransferRow]) -> Result<()> {
    for t in transfers {
        sqlx::query(
            r#"
            INSERT INTO token_transfers (
                token_address,
                from_address,
                to_address,
                amount,
                tx_hash,
                block_number,
                log_index,
                block_time
            ) VALUES ($1,$2,$3,$4,$5,$6,$7,$8)
            ON CONFLICT (tx_hash, token_address, log_index) DO NOTHING
            "#,
        )
        .bind(&t.token_address)
        .bind(&t.from_address)
        .bind(&t.to_address)
        .bind(&t.amount)
        .bind(&t.tx_hash)
        .bind(t.block_number)
        .bind(t.log_index)
        .bind(t.block_time)
        .execute(pool)
        .await?;
    }
    Ok(())
}

pub async fn insert_swaps(pool: &PgPool, swaps: &[SwapRow]) -> Result<()> {
    for s in swaps {
        sqlx::query(
            r#"
            INSERT INTO swap_events (
                token_address,
                pair_address,
                trader,
                is_buy,
                token_amount,
                asset_amount,
                price_usd,
                tx_hash,
                block_number,
                log_index,
                block_time
            ) VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$9,$10,$11)
            ON CONFLICT (tx_hash, log_index) DO NOTHING
            "#,
        )
        .bind(&s.token_address)
        .bind(&s.pair_address)
        .bind(&s.trader)
        .bind(s.is_buy)
        .bind(&s.token_amount)
        .bind(&s.asset_amount)
        .bind(s.price_usd)
        .bind(&s.tx_hash)
        .bind(s.block_number)
        .bind(s.log_index)
        .bind(s.block_time)
        .execute(pool)
        .await?;
    }
    Ok(())
}

/// Wholesale replacement of a token's holder set: the surviving holders are
/// upserted, then rows absent from the recomputed set are deleted. The table
/// stays a strict materialization of "current holders".
pub async fn replace_holder_balances(
    pool: &PgPool,
    token_address: &str,
    balances: &[(String, BigDecimal)],
) -> Result<()> {
    for (holder, balance) in balances {
        sqlx::query(
            r#"
            INSERT INTO holder_balances (token_address, holder_address, balance, updated_at)
            VALUES ($1,$2,$3,now())
            ON CONFLICT (token_address, holder_address)
            DO UPDATE SET balance = EXCLUDED.balance, updated_at = now()
            "#,
        )
        .bind(token_address)
        .bind(holder)
        .bind(balance)
        .execute(pool)
        .await?;
    }

    let keep: Vec<String> = balances.iter().map(|(h, _)| h.clone()).collect();
    sqlx::query(
        r#"
        DELETE FROM holder_balances
        WHERE token_address = $1
          AND NOT (holder_address = ANY($2))
        "#,
    )
    .bind(token_address)
    .bind(&keep)
    .execute(pool)
    .await?;

    Ok(())
}

pub async fn insert_fee_collections(pool: &PgPool, fees: &[FeeCollectionRow]) -> Result<()> {
    for f in fees {
        sqlx::query(
            r#"
            INSERT INTO creator_fee_collections (
                tx_hash,
                token_address,
                creator_address,
                asset_amount,
                usd_amount,
                block_number,
                block_time
            ) VALUES ($1,$2,$3,$4,$5,$6,$7)
            ON CONFLICT (tx_hash) DO NOTHING
            "#,
        )
        .bind(&f.tx_hash)
        .bind(&f.token_address)
        .bind(&f.creator_address)
        .bind(&f.asset_amount)
        .bind(f.usd_amount)
        .bind(f.block_number)
        .bind(f.block_time)
        .execute(pool)
        .await?;
    }
    Ok(())
}

/// One wallet's flag delta from a classification run.
#[derive(Debug, Clone)]
pub struct WalletFlagUpdate {
    pub wallet_address: String,
    pub is_phishing: bool,
    pub is_sniper: bool,
    pub is_insider: bool,
    pub sniper_score: i32,
    pub insider_connections: i32,
    pub phishing_reports: i32,
}

/// Flags merge additively across runs and tokens: once set, a flag stays set
/// unless explicitly cleared; counters keep their maximum; the first-flagged
/// timestamp is preserved.
pub async fn upsert_wallet_flags(pool: &PgPool, updates: &[WalletFlagUpdate]) -> Result<()> {
    for u in updates {
        sqlx::query(
            r#"
            INSERT INTO wallet_flags (
                wallet_address,
                is_phishing,
                is_sniper,
                is_insider,
                sniper_score,
                insider_connections,
                phishing_reports,
                first_flagged_at,
                updated_at
            ) VALUES ($1,$2,$3,$4,$5,$6,$7,now(),now())
            ON CONFLICT (wallet_address) DO UPDATE SET
                is_phishing = wallet_flags.is_phishing OR EXCLUDED.is_phishing,
                is_sniper = wallet_flags.is_sniper OR EXCLUDED.is_sniper,
                is_insider = wallet_flags.is_insider OR EXCLUDED.is_insider,
                sniper_score = GREATEST(wallet_flags.sniper_score, EXCLUDED.sniper_score),
                insider_connections = GREATEST(wallet_flags.insider_connections, EXCLUDED.insider_connections),
                phishing_reports = GREATEST(wallet_flags.phishing_reports, EXCLUDED.phishing_reports),
                first_flagged_at = LEAST(wallet_flags.first_flagged_at, EXCLUDED.first_flagged_at),
                updated_at = now()
            "#,
        )
        .bind(&u.wallet_address)
        .bind(u.is_phishing)
        .bind(u.is_sniper)
        .bind(u.is_insider)
        .bind(u.sniper_score)
        .bind(u.insider_connections)
        .bind(u.phishing_reports)
        .execute(pool)
        .await?;
    }
    Ok(())
}

pub async fn get_wallet_flag(pool: &PgPool, wallet: &str) -> Result<Option<WalletFlagRow>> {
    let row = sqlx::query_as::<_, WalletFlagRow>(
        "SELECT * FROM wallet_flags WHERE wallet_address = $1",
    )
    .bind(wallet)
    .fetch_optional(pool)
    .await?;
    Ok(row)
}

/// Aggregates are recomputed from the ledger and overwritten wholesale, not
/// incrementally patched; the last writer wins by design.
pub async fn update_token_metrics(
    pool: &PgPool,
    token_address: &str,
    agg: &TokenAggregates,
) -> Result<()> {
    sqlx::query(
        r#"
        UPDATE tokens SET
            holders_count = $2,
            txns_24h = $3,
            price_usd = $4,
            market_cap_usd = $5,
            liquidity_usd = $6,
            volume_24h_usd = $7,
            price_change_5m = $8,
            price_change_1h = $9,
            price_change_6h = $10,
            price_change_24h = $11,
            buys_24h = $12,
            sells_24h = $13,
            buy_volume_24h_usd = $14,
            sell_volume_24h_usd = $15,
            net_buy_24h_usd = $16,
            dev_holds_pct = $17,
            top10_holds_pct = $18,
            sniper_holds_pct = $19,
            insider_holds_pct = $20,
            phishing_holds_pct = $21,
            last_indexed_at = now()
        WHERE address = $1
        "#,
    )
    .bind(token_address)
    .bind(agg.holders_count)
    .bind(agg.txns_24h)
    .bind(agg.price_usd)
    .bind(agg.market_cap_usd)
    .bind(agg.liquidity_usd)
    .bind(agg.volume_24h_usd)
    .bind(agg.price_change_5m)
    .bind(agg.price_change_1h)
    .bind(agg.price_change_6h)
    .bind(agg.price_change_24h)
    .bind(agg.buys_24h)
    .bind(agg.sells_24h)
    .bind(agg.buy_volume_24h_usd)
    .bind(agg.sell_volume_24h_usd)
    .bind(agg.net_buy_24h_usd)
    .bind(agg.dev_holds_pct)
    .bind(agg.top10_holds_pct)
    .bind(agg.sniper_holds_pct)
    .bind(agg.insider_holds_pct)
    .bind(agg.phishing_holds_pct)
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn mark_graduated(
    pool: &PgPool,
    token_address: &str,
    pair_address: &str,
    at: Option<DateTime<Utc>>,
) -> Result<()> {
    sqlx::query(
        r#"
        UPDATE tokens
        SET graduated = TRUE,
            graduated_at = COALESCE(tokens.graduated_at, $3),
            pair_address = $2
        WHERE address = $1
        "#,
    )
    .bind(token_address)
    .bind(pair_address)
    .bind(at)
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn set_total_supply(
    pool: &PgPool,
    token_address: &str,
    total_supply: &BigDecimal,
) -> Result<()> {
    sqlx::query("UPDATE tokens SET total_supply = $2 WHERE address = $1")
        .bind(token_address)
        .bind(total_supply)
        .execute(pool)
        .await?;
    Ok(())
}

pub async fn set_creator(pool: &PgPool, token_address: &str, creator: &str) -> Result<()> {
    sqlx::query(
        "UPDATE tokens SET creator_address = $2 WHERE address = $1 AND creator_address IS NULL",
    )
    .bind(token_address)
    .bind(creator)
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn insert_price_snapshot(pool: &PgPool, token_address: &str, price_usd: f64) -> Result<()> {
    sqlx::query("INSERT INTO price_snapshots (token_address, price_usd) VALUES ($1,$2)")
        .bind(token_address)
        .bind(price_usd)
        .execute(pool)
        .await?;
    Ok(())
}

pub async fn get_price_snapshots_since(
    pool: &PgPool,
    token_address: &str,
    since: DateTime<Utc>,
) -> Result<Vec<PriceSnapshotRow>> {
    let rows = sqlx::query_as::<_, PriceSnapshotRow>(
        r#"
        SELECT token_address, price_usd, snapped_at
        FROM price_snapshots
        WHERE token_address = $1
          AND snapped_at >= $2
        ORDER BY snapped_at
        "#,
    )
    .bind(token_address)
    .bind(since)
    .fetch_all(pool)
    .await?;
    Ok(rows)
}

pub async fn get_transfers_for_token(pool: &PgPool, token_address: &str) -> Result<Vec<TransferRow>> {
    let rows = sqlx::query_as::<_, TransferRow>(
        r#"
        SELECT token_address, from_address, to_address, amount,
               tx_hash, block_number, log_index, block_time
        FROM token_transfers
        WHERE token_address = $1
        ORDER BY block_number, log_index
        "#,
    )
    .bind(token_address)
    .fetch_all(pool)
    .await?;
    Ok(rows)
}

pub async fn get_swaps_for_token(
    pool: &PgPool,
    token_address: &str,
    limit: i64,
) -> Result<Vec<SwapRow>> {
    let rows = sqlx::query_as::<_, SwapRow>(
        r#"
        SELECT token_address, pair_address, trader, is_buy, token_amount,
               asset_amount, price_usd, tx_hash, block_number, log_index, block_time
        FROM swap_events
        WHERE token_address = $1
        ORDER BY block_number DESC, log_index DESC
        LIMIT $2
        "#,
    )
    .bind(token_address)
    .bind(limit)
    .fetch_all(pool)
    .await?;
    Ok(rows)
}

pub async fn get_all_swaps_for_token(pool: &PgPool, token_address: &str) -> Result<Vec<SwapRow>> {
    let rows = sqlx::query_as::<_, SwapRow>(
        r#"
        SELECT token_address, pair_address, trader, is_buy, token_amount,
               asset_amount, price_usd, tx_hash, block_number, log_index, block_time
        FROM swap_events
        WHERE token_address = $1
        ORDER BY block_number, log_index
        "#,
    )
    .bind(token_address)
    .fetch_all(pool)
    .await?;
    Ok(rows)
}

pub async fn get_swaps_since(
    pool: &PgPool,
    token_address: &str,
    since: DateTime<Utc>,
) -> Result<Vec<SwapRow>> {
    let rows = sqlx::query_as::<_, SwapRow>(
        r#"
        SELECT token_address, pair_address, trader, is_buy, token_amount,
               asset_amount, price_usd, tx_hash, block_number, log_index, block_time
        FROM swap_events
        WHERE token_address = $1
          AND block_time >= $2
        ORDER BY block_number, log_index
        "#,
    )
    .bind(token_address)
    .bind(since)
    .fetch_all(pool)
    .await?;
    Ok(rows)
}

/// Latest trade price, the preferred price source; reserve-based pricing is
/// only the no-history fallback.
pub async fn last_swap_price(pool: &PgPool, token_address: &str) -> Result<Option<f64>> {
    let row = sqlx::query(
        r#"
        SELECT price_usd FROM swap_events
        WHERE token_address = $1
        ORDER BY block_number DESC, log_index DESC
        LIMIT 1
        "#,
    )
    .bind(token_address)
    .fetch_optional(pool)
    .await?;
    Ok(row.map(|r| r.get::<f64, _>("price_usd")))
}

pub async fn get_holder_balances(
    pool: &PgPool,
    token_address: &str,
    limit: i64,
    offset: i64,
) -> Result<Vec<HolderBalanceRow>> {
    let rows = sqlx::query_as::<_, HolderBalanceRow>(
        r#"
        SELECT token_address, holder_address, balance, updated_at
        FROM holder_balances
        WHERE token_address = $1
        ORDER BY balance DESC
        LIMIT $2 OFFSET $3
        "#,
    )
    .bind(token_address)
    .bind(limit)
    .bind(offset)
    .fetch_all(pool)
    .await?;
    Ok(rows)
}

pub async fn get_positive_holder_addresses(
    pool: &PgPool,
    token_address: &str,
) -> Result<Vec<String>> {
    let rows = sqlx::query(
        "SELECT holder_address FROM holder_balances WHERE token_address = $1 AND balance > 0",
    )
    .bind(token_address)
    .fetch_all(pool)
    .await?;
    Ok(rows
        .into_iter()
        .map(|r| r.get::<String, _>("holder_address"))
        .collect())
}

pub async fn get_watermark(pool: &PgPool, name: &str) -> Result<Option<i64>> {
    let row = sqlx::query("SELECT block_number FROM watermarks WHERE name = $1")
        .bind(name)
        .fetch_optional(pool)
        .await?;
    Ok(row.map(|r| r.get::<i64, _>("block_number")))
}

pub async fn set_watermark(pool: &PgPool, name: &str, block_number: i64) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO watermarks (name, block_number)
        VALUES ($1,$2)
        ON CONFLICT (name) DO UPDATE SET block_number = EXCLUDED.block_number
        "#,
    )
    .bind(name)
    .bind(block_number)
    .execute(pool)
    .await?;
    Ok(())
}
