use anyhow::Result;
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    routing::get,
    Json, Router,
};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use haven_core::{
    config::HavenConfig,
    db,
    ledger::{self, BalanceLedger},
    models::{decimal_to_u256, parse_address, HolderBalanceRow, SwapRow, Token, WalletFlagRow},
};
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::TcpListener;
use tokio::sync::Mutex;
use tracing_subscriber::EnvFilter;

/// Pre-aggregated per-token metrics served to the UI. `source` says whether
/// the numbers came from the indexer's columns or the raw-ledger fallback.
#[derive(Debug, Clone, Serialize)]
struct TokenMetrics {
    address: String,
    holders_count: i64,
    txns_24h: i64,
    price_usd: f64,
    market_cap_usd: f64,
    liquidity_usd: f64,
    volume_24h_usd: f64,
    price_change_5m: Option<f64>,
    price_change_1h: Option<f64>,
    price_change_6h: Option<f64>,
    price_change_24h: Option<f64>,
    buys_24h: i64,
    sells_24h: i64,
    buy_volume_24h_usd: f64,
    sell_volume_24h_usd: f64,
    net_buy_24h_usd: f64,
    dev_holds_pct: Option<f64>,
    top10_holds_pct: Option<f64>,
    sniper_holds_pct: Option<f64>,
    insider_holds_pct: Option<f64>,
    phishing_holds_pct: Option<f64>,
    last_indexed_at: Option<DateTime<Utc>>,
    source: &'static str,
}

#[derive(Clone)]
struct AppState {
    pool: PgPool,
    cache: Arc<Mutex<HashMap<String, (Instant, TokenMetrics)>>>,
    cache_ttl: Duration,
    stale_after: ChronoDuration,
}

async fn health() -> &'static str {
    "ok"
}

async fn token_metrics_handler(
    State(state): State<AppState>,
    Path(address): Path<String>,
) -> Result<Json<TokenMetrics>, StatusCode> {
    let address = address.to_lowercase();

    if let Some((cached_at, metrics)) = state.cache.lock().await.get(&address) {
        if cached_at.elapsed() < state.cache_ttl {
            return Ok(Json(metrics.clone()));
        }
    }

    let token = db::get_token(&state.pool, &address)
        .await
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?
        .ok_or(StatusCode::NOT_FOUND)?;

    let fresh = token
        .last_indexed_at
        .map(|at| Utc::now() - at < state.stale_after)
        .unwrap_or(false);

    let metrics = if fresh {
        indexed_metrics(&token)
    } else {
        // Stale or never-indexed aggregates degrade to a recomputation from
        // raw ledger rows rather than an error.
        recomputed_metrics(&state.pool, &token)
            .await
            .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?
    };

    state
        .cache
        .lock()
        .await
        .insert(address, (Instant::now(), metrics.clone()));

    Ok(Json(metrics))
}

fn indexed_metrics(token: &Token) -> TokenMetrics {
    TokenMetrics {
        address: token.address.clone(),
        holders_count: token.holders_count,
        txns_24h: token.txns_24h,
        price_usd: token.price_usd,
        market_cap_usd: token.market_cap_usd,
        liquidity_usd: token.liquidity_usd,
        volume_24h_usd: token.volume_24h_usd,
        price_change_5m: token.price_change_5m,
        price_change_1h: token.price_change_1h,
        price_change_6h: token.price_change_6h,
        price_change_24h: token.price_change_24h,
        buys_24h: token.buys_24h,
        sells_24h: token.sells_24h,
        buy_volume_24h_usd: token.buy_volume_24h_usd,
        sell_volume_24h_usd: token.sell_volume_24h_usd,
        net_buy_24h_usd: token.net_buy_24h_usd,
        dev_holds_pct: token.dev_holds_pct,
        top10_holds_pct: token.top10_holds_pct,
        sniper_holds_pct: token.sniper_holds_pct,
        insider_holds_pct: token.insider_holds_pct,
        phishing_holds_pct: token.phishing_holds_pct,
        last_indexed_at: token.last_indexed_at,
        source: "indexed",
    }
}

/// Fallback path: fold the stored transfer rows into holder stats on the
/// fly. Price and volume columns keep their last indexed values; only the
/// holder-derived numbers are rebuilt.
async fn recomputed_metrics(pool: &PgPool, token: &Token) -> Result<TokenMetrics> {
    let transfers = db::get_transfers_for_token(pool, &token.address).await?;
    let folded = BalanceLedger::build(transfers.iter().filter_map(|row| {
        Some((
            parse_address(&row.from_address)?,
            parse_address(&row.to_address)?,
            decimal_to_u256(&row.amount)?,
        ))
    }));

    let mut excluded = Vec::new();
    excluded.extend(token.address_h160());
    excluded.extend(token.curve_h160().filter(|c| Some(*c) != token.address_h160()));
    excluded.extend(token.pair_h160());

    let holders = folded.holders(&excluded);
    let total_supply = token
        .total_supply_u256()
        .unwrap_or_else(|| folded.circulating());

    let dev_pct = token
        .creator_h160()
        .map(|creator| ledger::pct(folded.positive_balance(creator), total_supply));

    let mut metrics = indexed_metrics(token);
    metrics.holders_count = holders.len() as i64;
    metrics.top10_holds_pct = Some(ledger::top_n_pct(&holders, 10, total_supply));
    metrics.dev_holds_pct = dev_pct;
    metrics.source = "recomputed";
    Ok(metrics)
}

#[derive(Debug, Deserialize)]
struct HoldersQuery {
    limit: Option<i64>,
    offset: Option<i64>,
}

async fn token_holders_handler(
    State(state): State<AppState>,
    Path(address): Path<String>,
    Query(q): Query<HoldersQuery>,
) -> Result<Json<Vec<HolderBalanceRow>>, StatusCode> {
    let limit = q.limit.unwrap_or(100).clamp(1, 1_000);
    let offset = q.offset.unwrap_or(0).max(0);

    let holders = db::get_holder_balances(&state.pool, &address.to_lowercase(), limit, offset)
        .await
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;

    Ok(Json(holders))
}

#[derive(Debug, Deserialize)]
struct SwapsQuery {
    limit: Option<i64>,
}

async fn token_swaps_handler(
    State(state): State<AppState>,
    Path(address): Path<String>,
    Query(q): Query<SwapsQuery>,
) -> Result<Json<Vec<SwapRow>>, StatusCode> {
    let limit = q.limit.unwrap_or(200).clamp(1, 5_000);

    let swaps = db::get_swaps_for_token(&state.pool, &address.to_lowercase(), limit)
        .await
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;

    Ok(Json(swaps))
}

async fn wallet_flags_handler(
    State(state): State<AppState>,
    Path(address): Path<String>,
) -> Result<Json<WalletFlagRow>, StatusCode> {
    let flag = db::get_wallet_flag(&state.pool, &address.to_lowercase())
        .await
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?
        .ok_or(StatusCode::NOT_FOUND)?;

    Ok(Json(flag))
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let config = HavenConfig::from_env()?;

    let pool = db::create_pool(&config.db.url, config.db.max_connections).await?;
    db::run_migrations(&pool).await?;

    let state = AppState {
        pool,
        cache: Arc::new(Mutex::new(HashMap::new())),
        cache_ttl: Duration::from_secs(config.api.cache_ttl_secs),
        stale_after: ChronoDuration::seconds(config.api.stale_after_secs),
    };

    let app = Router::new()
        .route("/health", get(health))
        .route("/token/:address/metrics", get(token_metrics_handler))
        .route("/token/:address/holders", get(token_holders_handler))
        .route("/token/:address/swaps", get(token_swaps_handler))
        .route("/wallet/:address/flags", get(wallet_flags_handler))
        .with_state(state);

    let addr: SocketAddr = config.api.bind_addr.parse()?;
    tracing::info!("starting read API on {addr}");

    let listener = TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
