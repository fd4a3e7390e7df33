use anyhow::Result;
use haven_core::{
    chain::ChainReader,
    config::HavenConfig,
    db,
    oracle::PriceOracle,
    pipeline::{self, IndexerContext},
};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

/// One-shot chunked full-history scan per token, for initial population or
/// recovery. Safe to re-run over already-indexed ranges: every write is an
/// idempotent natural-key upsert.
#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    // Missing configuration is the one fatal case: exit before any work.
    let cfg = HavenConfig::from_env()?;

    let pool = db::create_pool(&cfg.db.url, cfg.db.max_connections).await?;
    db::run_migrations(&pool).await?;

    let chain = Arc::new(ChainReader::new(&cfg.chain)?);
    let oracle = Arc::new(PriceOracle::new(chain.clone(), &cfg.oracle));
    let ctx = IndexerContext::new(pool, chain, oracle, cfg);

    let tokens = db::list_tokens(&ctx.pool).await?;
    tracing::info!("backfilling {} tokens", tokens.len());

    let mut failed = 0usize;
    for token in &tokens {
        tracing::info!(token = %token.address, "backfill start");
        // One token's failure is never fatal to the batch; operators re-run
        // the script to catch up.
        if let Err(e) = pipeline::backfill_token(&ctx, token).await {
            failed += 1;
            tracing::error!(token = %token.address, "backfill failed: {e:#}");
            continue;
        }
        tracing::info!(token = %token.address, "backfill done");
    }

    tracing::info!(
        "backfill complete: {} ok, {} failed",
        tokens.len() - failed,
        failed
    );
    Ok(())
}
