use chrono::{DateTime, Utc};
use ethers::types::{H160, H256, U256};
use serde::{Deserialize, Serialize};
use sqlx::types::BigDecimal;
use std::str::FromStr;

/// Token registry row. The aggregate columns are overwritten wholesale by the
/// reconciliation layer; everything else is set at insert time by the
/// marketplace backend.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Token {
    pub address: String,
    pub curve_address: Option<String>,
    pub creator_address: Option<String>,
    pub total_supply: Option<BigDecimal>,
    pub deploy_block: Option<i64>,
    pub graduated: bool,
    pub graduated_at: Option<DateTime<Utc>>,
    pub pair_address: Option<String>,
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
    pub dev_holds_pct: Option<f64>,
    pub top10_holds_pct: Option<f64>,
    pub sniper_holds_pct: Option<f64>,
    pub insider_holds_pct: Option<f64>,
    pub phishing_holds_pct: Option<f64>,
    pub last_indexed_at: Option<DateTime<Utc>>,
}

impl Token {
    pub fn address_h160(&self) -> Option<H160> {
        parse_address(&self.address)
    }

    pub fn curve_h160(&self) -> Option<H160> {
        self.curve_address.as_deref().and_then(parse_address)
    }

    pub fn pair_h160(&self) -> Option<H160> {
        self.pair_address.as_deref().and_then(parse_address)
    }

    pub fn creator_h160(&self) -> Option<H160> {
        self.creator_address.as_deref().and_then(parse_address)
    }

    pub fn total_supply_u256(&self) -> Option<U256> {
        self.total_supply.as_ref().and_then(decimal_to_u256)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct TransferRow {
    pub token_address: String,
    pub from_address: String,
    pub to_address: String,
    pub amount: BigDecimal,
    pub tx_hash: String,
    pub block_number: i64,
    pub log_index: i64,
    pub block_time: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct SwapRow {
    pub token_address: String,
    pub pair_address: Option<String>,
    pub trader: String,
    pub is_buy: bool,
    pub token_amount: BigDecimal,
    pub asset_amount: BigDecimal,
    pub price_usd: f64,
    pub tx_hash: String,
    pub block_number: i64,
    pub log_index: i64,
    pub block_time: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct HolderBalanceRow {
    pub token_address: String,
    pub holder_address: String,
    pub balance: BigDecimal,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct FeeCollectionRow {
    pub tx_hash: String,
    pub token_address: String,
    pub creator_address: String,
    pub asset_amount: BigDecimal,
    pub usd_amount: f64,
    pub block_number: i64,
    pub block_time: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct WalletFlagRow {
    pub wallet_address: String,
    pub is_phishing: bool,
    pub is_sniper: bool,
    pub is_insider: bool,
    pub sniper_score: i32,
    pub insider_connections: i32,
    pub phishing_reports: i32,
    pub notes: Option<String>,
    pub first_flagged_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct PriceSnapshotRow {
    pub token_address: String,
    pub price_usd: f64,
    pub snapped_at: DateTime<Utc>,
}

/// Lower-cased `0x…` rendering used for every persisted address and hash, so
/// lookups stay case-insensitive.
pub fn format_address(addr: H160) -> String {
    format!("{:#x}", addr)
}

pub fn format_hash(hash: H256) -> String {
    format!("{:#x}", hash)
}

pub fn parse_address(s: &str) -> Option<H160> {
    s.trim().parse::<H160>().ok()
}

pub fn u256_to_decimal(value: U256) -> BigDecimal {
    BigDecimal::from_str(&value.to_string()).unwrap_or_default()
}

pub fn decimal_to_u256(value: &BigDecimal) -> Option<U256> {
    // Amount columns are NUMERIC(78,0); the decimal form is all digits.
    U256::from_dec_str(&value.to_string()).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn address_round_trip_is_lowercase() {
        let addr: H160 = "0xAbCdEf0123456789abcdef0123456789ABCDEF01"
            .parse()
            .unwrap();
        let s = format_address(addr);
        assert_eq!(s, s.to_lowercase());
        assert_eq!(parse_address(&s), Some(addr));
    }

    #[test]
    fn u256_decimal_round_trip_beyond_u64() {
        // 1e24 does not fit in 64 bits.
        let big = U256::from_dec_str("1000000000000000000000000").unwrap();
        let dec = u256_to_decimal(big);
        assert_eq!(decimal_to_u256(&dec), Some(big));
    }
}
