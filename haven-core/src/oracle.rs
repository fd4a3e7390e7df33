use crate::chain::ChainReader;
use crate::config::OracleConfig;
use crate::models::parse_address;
use crate::normalize::units_to_f64;
use ethers::types::H160;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::{debug, warn};

/// Documented last-resort BNB/USD rate when both the reserve read and the
/// price API are unavailable.
pub const FALLBACK_BNB_USD: f64 = 600.0;

pub fn is_fresh(fetched_at: Instant, now: Instant, ttl: Duration) -> bool {
    now.duration_since(fetched_at) < ttl
}

#[derive(Debug, Clone, Copy)]
struct Cached {
    price: f64,
    fetched_at: Instant,
}

/// Process-scoped BNB/USD source with a time-boxed cache. Owned by the
/// driver and injected into whatever needs pricing; there is no ambient
/// global state.
pub struct PriceOracle {
    chain: Arc<ChainReader>,
    http: reqwest::Client,
    price_api_url: Option<String>,
    bnb_usd_pair: Option<H160>,
    ttl: Duration,
    cached: Mutex<Option<Cached>>,
}

impl PriceOracle {
    pub fn new(chain: Arc<ChainReader>, cfg: &OracleConfig) -> Self {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .unwrap_or_default();
        Self {
            chain,
            http,
            price_api_url: cfg.price_api_url.clone(),
            bnb_usd_pair: cfg.bnb_usd_pair.as_deref().and_then(parse_address),
            ttl: Duration::from_secs(cfg.cache_ttl_secs),
            cached: Mutex::new(None),
        }
    }

    /// Current BNB/USD rate: cached value while fresh, then the reserve read
    /// of the configured stable pair, then the price API, then the fallback
    /// constant. Never fails; pricing degrades instead.
    pub async fn bnb_usd(&self) -> f64 {
        let now = Instant::now();
        if let Some(cached) = *self.cached.lock().await {
            if is_fresh(cached.fetched_at, now, self.ttl) {
                return cached.price;
            }
        }

        let price = match self.reserve_rate().await {
            Some(price) => price,
            None => match self.api_rate().await {
                Some(price) => price,
                None => {
                    warn!("no BNB/USD source available, using fallback {FALLBACK_BNB_USD}");
                    FALLBACK_BNB_USD
                }
            },
        };

        *self.cached.lock().await = Some(Cached {
            price,
            fetched_at: now,
        });
        price
    }

    /// Reserve-ratio read of the configured WBNB/stable pair. Convention:
    /// reserve0 is the WBNB side, reserve1 the 18-decimal stable side.
    async fn reserve_rate(&self) -> Option<f64> {
        let pair = self.bnb_usd_pair?;
        match self.chain.get_reserves(pair).await {
            Ok((bnb_reserve, usd_reserve)) => {
                let bnb = units_to_f64(bnb_reserve);
                if bnb == 0.0 {
                    return None;
                }
                let price = units_to_f64(usd_reserve) / bnb;
                debug!("BNB/USD from reserves: {price}");
                Some(price)
            }
            Err(e) => {
                warn!("reserve read for BNB/USD failed: {e}");
                None
            }
        }
    }

    async fn api_rate(&self) -> Option<f64> {
        let url = self.price_api_url.as_deref()?;
        let response = match self.http.get(url).send().await {
            Ok(r) => r,
            Err(e) => {
                warn!("price api request failed: {e}");
                return None;
            }
        };
        let body: serde_json::Value = match response.json().await {
            Ok(v) => v,
            Err(e) => {
                warn!("price api returned invalid json: {e}");
                return None;
            }
        };
        body.get("price").and_then(|p| p.as_f64())
    }
}

/// Paces an action to at most once per interval; used for the periodic
/// BNB-price snapshot so refresh loops do not write one row per block.
#[derive(Debug)]
pub struct SnapshotThrottle {
    last: Option<Instant>,
    min_interval: Duration,
}

impl SnapshotThrottle {
    pub fn new(min_interval: Duration) -> Self {
        Self {
            last: None,
            min_interval,
        }
    }

    /// True when enough time has passed since the last accepted tick; the
    /// accepted tick becomes the new reference point.
    pub fn ready(&mut self, now: Instant) -> bool {
        match self.last {
            Some(last) if now.duration_since(last) < self.min_interval => false,
            _ => {
                self.last = Some(now);
                true
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn freshness_respects_ttl_boundary() {
        let base = Instant::now();
        let ttl = Duration::from_secs(60);
        assert!(is_fresh(base, base + Duration::from_secs(59), ttl));
        assert!(!is_fresh(base, base + Duration::from_secs(60), ttl));
        assert!(!is_fresh(base, base + Duration::from_secs(120), ttl));
    }

    #[test]
    fn throttle_allows_first_tick_then_paces() {
        let base = Instant::now();
        let mut throttle = SnapshotThrottle::new(Duration::from_secs(300));

        assert!(throttle.ready(base));
        assert!(!throttle.ready(base + Duration::from_secs(100)));
        assert!(!throttle.ready(base + Duration::from_secs(299)));
        assert!(throttle.ready(base + Duration::from_secs(300)));
        // The accepted tick resets the window.
        assert!(!throttle.ready(base + Duration::from_secs(599)));
        assert!(throttle.ready(base + Duration::from_secs(600)));
    }
}
