use anyhow::Result;
use haven_core::{
    chain::ChainReader,
    config::HavenConfig,
    db,
    oracle::PriceOracle,
    pipeline::{self, IndexerContext, FEE_SWEEP_WATERMARK, REALTIME_WATERMARK},
    sweeper::BlockSweeper,
};
use sqlx::postgres::PgListener;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

/// Long-running incremental indexer: backfills the recent window on startup,
/// then processes only new block ranges per token as the node pushes block
/// notifications. A slower independent sweep reconciles creator-fee events,
/// and new-token inserts are picked up immediately via LISTEN/NOTIFY.
#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let cfg = HavenConfig::from_env()?;

    let pool = db::create_pool(&cfg.db.url, cfg.db.max_connections).await?;
    db::run_migrations(&pool).await?;

    let chain = Arc::new(ChainReader::new(&cfg.chain)?);
    let oracle = Arc::new(PriceOracle::new(chain.clone(), &cfg.oracle));
    let ctx = Arc::new(IndexerContext::new(pool, chain, oracle, cfg));

    let head = ctx.chain.latest_block().await?;
    let startup_from = head.saturating_sub(ctx.cfg.indexer.startup_backfill_blocks);
    startup_backfill(&ctx, startup_from, head).await?;
    db::set_watermark(&ctx.pool, REALTIME_WATERMARK, head as i64).await?;

    spawn_new_token_listener(ctx.clone());
    spawn_fee_sweep(ctx.clone(), head);

    run_block_loop(ctx, head).await
}

/// Re-process the recent window for every known token so a restart never
/// leaves a gap. Replays are harmless: all writes are idempotent.
async fn startup_backfill(ctx: &IndexerContext, from_block: u64, to_block: u64) -> Result<()> {
    let tokens = db::list_tokens(&ctx.pool).await?;
    tracing::info!(
        "startup backfill of blocks {from_block}..={to_block} for {} tokens",
        tokens.len()
    );

    for token in &tokens {
        if let Err(e) = pipeline::process_block_range(ctx, token, from_block, to_block).await {
            tracing::error!(token = %token.address, "startup backfill failed: {e:#}");
        }
    }
    Ok(())
}

/// Main loop: each pushed block advances every token's in-memory watermark
/// by processing exactly the unprocessed range. A token that fails keeps its
/// watermark so the same range is retried on the next block.
async fn run_block_loop(ctx: Arc<IndexerContext>, start_head: u64) -> Result<()> {
    let mut blocks = ctx.chain.subscribe_blocks();
    let mut last_processed: HashMap<String, u64> = HashMap::new();

    tracing::info!("listening for new blocks from {start_head}");

    while let Some(new_block) = blocks.recv().await {
        let tokens = match db::list_tokens(&ctx.pool).await {
            Ok(tokens) => tokens,
            Err(e) => {
                tracing::error!("token list unavailable: {e:#}");
                continue;
            }
        };

        for token in &tokens {
            let watermark = *last_processed
                .entry(token.address.clone())
                .or_insert_with(|| new_block.saturating_sub(1).max(start_head));
            if new_block <= watermark {
                continue;
            }

            match pipeline::process_block_range(&ctx, token, watermark + 1, new_block).await {
                Ok(()) => {
                    last_processed.insert(token.address.clone(), new_block);
                }
                Err(e) => {
                    // Watermark stays put; this range is retried with the
                    // next block notification.
                    tracing::error!(token = %token.address, "block range failed: {e:#}");
                }
            }
        }

        if let Err(e) = db::set_watermark(&ctx.pool, REALTIME_WATERMARK, new_block as i64).await {
            tracing::warn!("failed to persist realtime watermark: {e:#}");
        }
    }

    Err(anyhow::anyhow!("block subscription channel closed"))
}

/// LISTEN for token-row inserts and index each new token immediately,
/// independent of the per-block cadence.
fn spawn_new_token_listener(ctx: Arc<IndexerContext>) {
    tokio::spawn(async move {
        loop {
            let mut listener = match PgListener::connect(&ctx.cfg.db.url).await {
                Ok(l) => l,
                Err(e) => {
                    tracing::error!("PgListener connect failed: {e:#}");
                    tokio::time::sleep(Duration::from_secs(5)).await;
                    continue;
                }
            };

            if let Err(e) = listener.listen(db::NEW_TOKEN_CHANNEL).await {
                tracing::error!("LISTEN {} failed: {e:#}", db::NEW_TOKEN_CHANNEL);
                tokio::time::sleep(Duration::from_secs(5)).await;
                continue;
            }

            tracing::info!("listening for new tokens on {}", db::NEW_TOKEN_CHANNEL);

            loop {
                match listener.recv().await {
                    Ok(notification) => {
                        let address = token_address_from_payload(notification.payload());
                        tracing::info!(token = %address, "new token notification");
                        if let Err(e) = pipeline::index_new_token(&ctx, &address).await {
                            tracing::error!(token = %address, "new-token indexing failed: {e:#}");
                        }
                    }
                    Err(e) => {
                        tracing::error!("notification stream failed: {e:#}");
                        break;
                    }
                }
            }
        }
    });
}

/// The payload is either a bare address or a JSON row image with an
/// `address` field, depending on the trigger that fired it.
fn token_address_from_payload(payload: &str) -> String {
    if let Ok(value) = serde_json::from_str::<serde_json::Value>(payload) {
        if let Some(address) = value.get("address").and_then(|a| a.as_str()) {
            return address.to_lowercase();
        }
    }
    payload.trim().to_lowercase()
}

/// Independent slow sweep for creator-fee events. Its watermark moves by at
/// most the configured cap per tick and may lag the main loop indefinitely
/// under sustained load; that is the intended backpressure.
fn spawn_fee_sweep(ctx: Arc<IndexerContext>, head: u64) {
    tokio::spawn(async move {
        let initial = match db::get_watermark(&ctx.pool, FEE_SWEEP_WATERMARK).await {
            Ok(Some(block)) => block.max(0) as u64,
            Ok(None) => head.saturating_sub(ctx.cfg.indexer.startup_backfill_blocks),
            Err(e) => {
                tracing::error!("fee sweep watermark unavailable: {e:#}");
                head
            }
        };
        let mut sweeper = BlockSweeper::new(initial, ctx.cfg.indexer.fee_sweep_max_blocks);

        let mut ticker =
            tokio::time::interval(Duration::from_secs(ctx.cfg.indexer.fee_sweep_interval_secs));

        loop {
            ticker.tick().await;

            let chain_head = match ctx.chain.latest_block().await {
                Ok(block) => block,
                Err(e) => {
                    tracing::warn!("fee sweep skipped, head unavailable: {e}");
                    continue;
                }
            };

            let Some((from_block, to_block)) = sweeper.next_range(chain_head) else {
                continue;
            };

            let tokens = match db::list_tokens(&ctx.pool).await {
                Ok(tokens) => tokens,
                Err(e) => {
                    tracing::error!("fee sweep token list unavailable: {e:#}");
                    continue;
                }
            };

            tracing::info!("fee sweep over blocks {from_block}..={to_block}");
            if let Err(e) = pipeline::sweep_fees(&ctx, &tokens, from_block, to_block).await {
                tracing::error!("fee sweep failed: {e:#}");
            }

            if let Err(e) =
                db::set_watermark(&ctx.pool, FEE_SWEEP_WATERMARK, to_block as i64).await
            {
                tracing::warn!("failed to persist fee sweep watermark: {e:#}");
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn payload_accepts_bare_address_and_json() {
        assert_eq!(
            token_address_from_payload("0xABCDEF0123456789abcdef0123456789abcdef01"),
            "0xabcdef0123456789abcdef0123456789abcdef01"
        );
        assert_eq!(
            token_address_from_payload(r#"{"address":"0xABC","creator":"0xdef"}"#),
            "0xabc"
        );
        assert_eq!(token_address_from_payload("  0xAbC  "), "0xabc");
    }
}
