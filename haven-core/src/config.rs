use anyhow::Result;
use serde::Deserialize;

#[derive(Debug, Deserialize, Clone)]
pub struct ApiConfig {
    pub bind_addr: String,
    /// Seconds a cached metrics response stays valid.
    #[serde(default = "default_api_cache_ttl")]
    pub cache_ttl_secs: u64,
    /// Aggregates older than this are recomputed from raw ledger rows.
    #[serde(default = "default_stale_after")]
    pub stale_after_secs: i64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub url: String,
    pub max_connections: u32,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ChainConfig {
    pub http_url: String,
    pub ws_url: String,
    /// Hard upstream limit on blocks per eth_getLogs call.
    pub max_block_span: u64,
    #[serde(default = "default_rpc_timeout")]
    pub rpc_timeout_secs: u64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct IndexerTuning {
    #[serde(default = "default_startup_backfill")]
    pub startup_backfill_blocks: u64,
    #[serde(default = "default_fee_sweep_interval")]
    pub fee_sweep_interval_secs: u64,
    #[serde(default = "default_fee_sweep_max_blocks")]
    pub fee_sweep_max_blocks: u64,
    #[serde(default = "default_sniper_window")]
    pub sniper_window_blocks: u64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct OracleConfig {
    /// GET endpoint returning {"price": <usd float>} for the reference asset.
    pub price_api_url: Option<String>,
    /// Stable/WBNB pair whose reserves give the on-chain BNB/USD rate.
    pub bnb_usd_pair: Option<String>,
    #[serde(default = "default_oracle_ttl")]
    pub cache_ttl_secs: u64,
    #[serde(default = "default_snapshot_interval")]
    pub snapshot_interval_secs: u64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct HavenConfig {
    pub api: ApiConfig,
    pub db: DbConfig,
    pub chain: ChainConfig,
    pub indexer: IndexerTuning,
    pub oracle: OracleConfig,
}

impl HavenConfig {
    /// Load `config/default.(toml|yaml|json)` relative to the working
    /// directory, then override with `HAVEN__...` environment variables.
    /// Missing required fields fail here, before any work begins.
    pub fn from_env() -> Result<Self> {
        let settings = config::Config::builder()
            .add_source(config::File::with_name("config/default").required(false))
            .add_source(config::Environment::with_prefix("HAVEN").separator("__"))
            .build()?;

        settings.try_deserialize().map_err(Into::into)
    }
}

fn default_api_cache_ttl() -> u64 {
    300
}

fn default_stale_after() -> i64 {
    300
}

fn default_rpc_timeout() -> u64 {
    30
}

fn default_startup_backfill() -> u64 {
    100
}

fn default_fee_sweep_interval() -> u64 {
    600
}

fn default_fee_sweep_max_blocks() -> u64 {
    1_000
}

fn default_sniper_window() -> u64 {
    10
}

fn default_oracle_ttl() -> u64 {
    60
}

fn default_snapshot_interval() -> u64 {
    300
}
