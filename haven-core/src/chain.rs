use crate::config::ChainConfig;
use crate::error::{ChainError, ChainResult};
use chrono::{DateTime, TimeZone, Utc};
use ethers::providers::{Http, Middleware, Provider, ProviderError, Ws};
use ethers::types::transaction::eip2718::TypedTransaction;
use ethers::types::{Filter, TransactionRequest, H160, H256, U256};
use ethers::utils::keccak256;
use futures::StreamExt;
use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tracing::{error, warn};

/// Block-number -> timestamp cache with bounded retention: once capacity is
/// exceeded the oldest insertion is evicted. Every event in a block shares
/// one header fetch.
#[derive(Debug)]
pub struct BlockTimeCache {
    map: HashMap<u64, DateTime<Utc>>,
    order: VecDeque<u64>,
    capacity: usize,
}

impl BlockTimeCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            map: HashMap::new(),
            order: VecDeque::new(),
            capacity: capacity.max(1),
        }
    }

    pub fn get(&self, block: u64) -> Option<DateTime<Utc>> {
        self.map.get(&block).copied()
    }

    pub fn insert(&mut self, block: u64, timestamp: DateTime<Utc>) {
        if self.map.insert(block, timestamp).is_none() {
            self.order.push_back(block);
        }
        while self.map.len() > self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.map.remove(&oldest);
            } else {
                break;
            }
        }
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}

const BLOCK_TIME_CACHE_CAPACITY: usize = 1_000;

/// Thin wrapper over the JSON-RPC node. Every call carries the configured
/// timeout so one hung token cannot stall a whole per-block loop; ranged log
/// queries are split to the upstream max span per call.
pub struct ChainReader {
    provider: Provider<Http>,
    ws_url: String,
    max_block_span: u64,
    rpc_timeout: Duration,
    block_times: Mutex<BlockTimeCache>,
    pair_orders: Mutex<HashMap<H160, (H160, H160)>>,
}

impl ChainReader {
    pub fn new(cfg: &ChainConfig) -> ChainResult<Self> {
        let provider = Provider::<Http>::try_from(cfg.http_url.as_str())
            .map_err(|e| ChainError::Rpc(format!("invalid rpc url: {e}")))?;
        Ok(Self {
            provider,
            ws_url: cfg.ws_url.clone(),
            max_block_span: cfg.max_block_span.max(1),
            rpc_timeout: Duration::from_secs(cfg.rpc_timeout_secs),
            block_times: Mutex::new(BlockTimeCache::new(BLOCK_TIME_CACHE_CAPACITY)),
            pair_orders: Mutex::new(HashMap::new()),
        })
    }

    async fn timed<T, F>(&self, fut: F) -> ChainResult<T>
    where
        F: Future<Output = Result<T, ProviderError>>,
    {
        match tokio::time::timeout(self.rpc_timeout, fut).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => Err(ChainError::Rpc(e.to_string())),
            Err(_) => Err(ChainError::Timeout(self.rpc_timeout.as_secs())),
        }
    }

    pub async fn latest_block(&self) -> ChainResult<u64> {
        let number = self.timed(self.provider.get_block_number()).await?;
        Ok(number.as_u64())
    }

    /// Ordered logs for `topic0` emitted by `address` over the inclusive
    /// range, transparently split into sub-ranges of at most the configured
    /// max span.
    pub async fn get_logs_chunked(
        &self,
        address: H160,
        topic0: H256,
        from_block: u64,
        to_block: u64,
    ) -> ChainResult<Vec<ethers::types::Log>> {
        let mut all = Vec::new();
        let mut current = from_block;

        while current <= to_block {
            let chunk_end = to_block.min(current + self.max_block_span - 1);
            let filter = Filter::new()
                .address(address)
                .topic0(topic0)
                .from_block(current)
                .to_block(chunk_end);

            let logs = self.timed(self.provider.get_logs(&filter)).await?;
            all.extend(logs);
            current = chunk_end + 1;
        }

        Ok(all)
    }

    pub async fn block_timestamp(&self, block: u64) -> ChainResult<DateTime<Utc>> {
        if let Some(cached) = self.block_times.lock().await.get(block) {
            return Ok(cached);
        }

        let header = self
            .timed(self.provider.get_block(block))
            .await?
            .ok_or_else(|| ChainError::Rpc(format!("block {block} not found")))?;

        let timestamp = Utc
            .timestamp_opt(header.timestamp.as_u64() as i64, 0)
            .single()
            .ok_or_else(|| ChainError::Rpc(format!("block {block} has invalid timestamp")))?;

        self.block_times.lock().await.insert(block, timestamp);
        Ok(timestamp)
    }

    /// No-argument view call returning the raw 32-byte words. A revert or an
    /// empty return maps to `MissingCapability`: the token simply does not
    /// implement the accessor, which must not abort the caller's scan.
    async fn call_view(&self, to: H160, signature: &str) -> ChainResult<Vec<u8>> {
        let selector = &keccak256(signature.as_bytes())[..4];
        let tx: TypedTransaction = TransactionRequest::new()
            .to(to)
            .data(selector.to_vec())
            .into();

        let result = tokio::time::timeout(self.rpc_timeout, self.provider.call(&tx, None)).await;
        let bytes = match result {
            Ok(Ok(bytes)) => bytes,
            Ok(Err(e)) => {
                let message = e.to_string();
                if message.to_lowercase().contains("revert") {
                    return Err(ChainError::MissingCapability {
                        address: format!("{to:#x}"),
                        method: signature.to_string(),
                    });
                }
                return Err(ChainError::Rpc(message));
            }
            Err(_) => return Err(ChainError::Timeout(self.rpc_timeout.as_secs())),
        };

        if bytes.len() < 32 {
            return Err(ChainError::MissingCapability {
                address: format!("{to:#x}"),
                method: signature.to_string(),
            });
        }
        Ok(bytes.to_vec())
    }

    pub async fn total_supply(&self, token: H160) -> ChainResult<U256> {
        let words = self.call_view(token, "totalSupply()").await?;
        Ok(U256::from_big_endian(&words[..32]))
    }

    pub async fn creator(&self, token: H160) -> ChainResult<H160> {
        let words = self.call_view(token, "creator()").await?;
        Ok(H160::from_slice(&words[12..32]))
    }

    /// token0/token1 of a pair, read once and cached: the order is fixed at
    /// pair deployment.
    pub async fn pair_tokens(&self, pair: H160) -> ChainResult<(H160, H160)> {
        if let Some(cached) = self.pair_orders.lock().await.get(&pair) {
            return Ok(*cached);
        }

        let token0_words = self.call_view(pair, "token0()").await?;
        let token1_words = self.call_view(pair, "token1()").await?;
        let pair_order = (
            H160::from_slice(&token0_words[12..32]),
            H160::from_slice(&token1_words[12..32]),
        );

        self.pair_orders.lock().await.insert(pair, pair_order);
        Ok(pair_order)
    }

    pub async fn get_reserves(&self, pair: H160) -> ChainResult<(U256, U256)> {
        let words = self.call_view(pair, "getReserves()").await?;
        if words.len() < 64 {
            return Err(ChainError::Rpc(format!(
                "short getReserves return from {pair:#x}"
            )));
        }
        Ok((
            U256::from_big_endian(&words[..32]),
            U256::from_big_endian(&words[32..64]),
        ))
    }

    /// New-block push subscription. A background task owns the WebSocket
    /// connection and forwards block numbers; it reconnects with exponential
    /// backoff and ends when the receiver is dropped.
    pub fn subscribe_blocks(&self) -> mpsc::Receiver<u64> {
        let ws_url = self.ws_url.clone();
        let (tx, rx) = mpsc::channel(256);

        tokio::spawn(async move {
            let mut backoff_ms = 1_000u64;
            loop {
                match Ws::connect(ws_url.clone()).await {
                    Ok(ws) => {
                        let provider = Provider::new(ws);
                        match provider.subscribe_blocks().await {
                            Ok(mut stream) => {
                                backoff_ms = 1_000;
                                while let Some(block) = stream.next().await {
                                    let Some(number) = block.number else { continue };
                                    if tx.send(number.as_u64()).await.is_err() {
                                        return;
                                    }
                                }
                                warn!("block subscription ended, reconnecting");
                            }
                            Err(e) => error!("block subscription failed: {e}"),
                        };
                    }
                    Err(e) => error!("websocket connect to {ws_url} failed: {e}"),
                }
                tokio::time::sleep(Duration::from_millis(backoff_ms)).await;
                backoff_ms = (backoff_ms * 2).min(30_000);
            }
        });

        rx
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ts(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).single().unwrap()
    }

    #[test]
    fn block_time_cache_evicts_oldest_past_capacity() {
        let mut cache = BlockTimeCache::new(3);
        cache.insert(1, ts(10));
        cache.insert(2, ts(20));
        cache.insert(3, ts(30));
        cache.insert(4, ts(40));

        assert_eq!(cache.len(), 3);
        assert_eq!(cache.get(1), None);
        assert_eq!(cache.get(2), Some(ts(20)));
        assert_eq!(cache.get(4), Some(ts(40)));
    }

    #[test]
    fn block_time_cache_reinsert_does_not_duplicate() {
        let mut cache = BlockTimeCache::new(2);
        cache.insert(1, ts(10));
        cache.insert(1, ts(11));
        cache.insert(2, ts(20));

        assert_eq!(cache.len(), 2);
        assert_eq!(cache.get(1), Some(ts(11)));
        assert_eq!(cache.get(2), Some(ts(20)));
    }

    #[test]
    fn selector_matches_known_erc20_hash() {
        // totalSupply() -> 0x18160ddd, the canonical ERC-20 selector.
        let selector = &keccak256(b"totalSupply()")[..4];
        assert_eq!(selector, [0x18, 0x16, 0x0d, 0xdd]);
    }
}
