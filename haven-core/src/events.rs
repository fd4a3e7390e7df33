use ethers::types::{Log, H160, H256, U256};
use ethers::utils::keccak256;

/// Solidity event signatures the indexer understands. Topic hashes are
/// derived at the call site with [`event_topic`], mirroring how the upstream
/// contracts declare them.
pub const TRANSFER_SIG: &str = "Transfer(address,address,uint256)";
pub const CURVE_BUY_SIG: &str = "Buy(address,uint256,uint256,uint256)";
pub const CURVE_SELL_SIG: &str = "Sell(address,uint256,uint256,uint256)";
pub const PAIR_SWAP_SIG: &str = "Swap(address,uint256,uint256,uint256,uint256,address)";
pub const GRADUATED_SIG: &str = "Graduated(address,address)";
pub const FEE_COLLECTED_SIG: &str = "CreatorFeeCollected(address,uint256)";

pub fn event_topic(signature: &str) -> H256 {
    H256::from(keccak256(signature.as_bytes()))
}

/// Position of a log inside the chain; the natural-key half of every stored
/// event row. Logs missing any of these fields are pending and are discarded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LogMeta {
    pub block_number: u64,
    pub tx_hash: H256,
    pub log_index: u64,
}

impl LogMeta {
    fn from_log(log: &Log) -> Option<Self> {
        Some(Self {
            block_number: log.block_number?.as_u64(),
            tx_hash: log.transaction_hash?,
            log_index: log.log_index?.as_u64(),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferLog {
    pub token: H160,
    pub from: H160,
    pub to: H160,
    pub value: U256,
    pub meta: LogMeta,
}

/// One variant per source event shape; [`crate::normalize`] maps each variant
/// into the canonical swap record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TradeLog {
    CurveBuy {
        user: H160,
        asset_in: U256,
        tokens_out: U256,
        fee: U256,
        meta: LogMeta,
    },
    CurveSell {
        user: H160,
        tokens_in: U256,
        asset_out: U256,
        fee: U256,
        meta: LogMeta,
    },
    PairSwap {
        pair: H160,
        sender: H160,
        to: H160,
        amount0_in: U256,
        amount1_in: U256,
        amount0_out: U256,
        amount1_out: U256,
        meta: LogMeta,
    },
}

impl TradeLog {
    pub fn meta(&self) -> LogMeta {
        match self {
            TradeLog::CurveBuy { meta, .. }
            | TradeLog::CurveSell { meta, .. }
            | TradeLog::PairSwap { meta, .. } => *meta,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GraduatedLog {
    pub token: H160,
    pub pair: H160,
    pub meta: LogMeta,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FeeLog {
    pub creator: H160,
    pub amount: U256,
    pub meta: LogMeta,
}

fn topic_address(topic: &H256) -> H160 {
    H160::from_slice(&topic.as_bytes()[12..])
}

fn word(data: &[u8], index: usize) -> Option<U256> {
    let start = index * 32;
    let end = start + 32;
    if data.len() < end {
        return None;
    }
    Some(U256::from_big_endian(&data[start..end]))
}

fn word_address(data: &[u8], index: usize) -> Option<H160> {
    let start = index * 32;
    let end = start + 32;
    if data.len() < end {
        return None;
    }
    Some(H160::from_slice(&data[start + 12..end]))
}

pub fn decode_transfer(log: &Log) -> Option<TransferLog> {
    if log.topics.len() != 3 || log.topics[0] != event_topic(TRANSFER_SIG) {
        return None;
    }
    Some(TransferLog {
        token: log.address,
        from: topic_address(&log.topics[1]),
        to: topic_address(&log.topics[2]),
        value: word(&log.data, 0)?,
        meta: LogMeta::from_log(log)?,
    })
}

pub fn decode_curve_buy(log: &Log) -> Option<TradeLog> {
    if log.topics.len() != 2 || log.topics[0] != event_topic(CURVE_BUY_SIG) {
        return None;
    }
    Some(TradeLog::CurveBuy {
        user: topic_address(&log.topics[1]),
        asset_in: word(&log.data, 0)?,
        tokens_out: word(&log.data, 1)?,
        fee: word(&log.data, 2)?,
        meta: LogMeta::from_log(log)?,
    })
}

pub fn decode_curve_sell(log: &Log) -> Option<TradeLog> {
    if log.topics.len() != 2 || log.topics[0] != event_topic(CURVE_SELL_SIG) {
        return None;
    }
    Some(TradeLog::CurveSell {
        user: topic_address(&log.topics[1]),
        tokens_in: word(&log.data, 0)?,
        asset_out: word(&log.data, 1)?,
        fee: word(&log.data, 2)?,
        meta: LogMeta::from_log(log)?,
    })
}

pub fn decode_pair_swap(log: &Log) -> Option<TradeLog> {
    if log.topics.len() != 3 || log.topics[0] != event_topic(PAIR_SWAP_SIG) {
        return None;
    }
    Some(TradeLog::PairSwap {
        pair: log.address,
        sender: topic_address(&log.topics[1]),
        to: topic_address(&log.topics[2]),
        amount0_in: word(&log.data, 0)?,
        amount1_in: word(&log.data, 1)?,
        amount0_out: word(&log.data, 2)?,
        amount1_out: word(&log.data, 3)?,
        meta: LogMeta::from_log(log)?,
    })
}

pub fn decode_graduated(log: &Log) -> Option<GraduatedLog> {
    if log.topics.len() != 2 || log.topics[0] != event_topic(GRADUATED_SIG) {
        return None;
    }
    Some(GraduatedLog {
        token: topic_address(&log.topics[1]),
        pair: word_address(&log.data, 0)?,
        meta: LogMeta::from_log(log)?,
    })
}

pub fn decode_fee_collected(log: &Log) -> Option<FeeLog> {
    if log.topics.len() != 2 || log.topics[0] != event_topic(FEE_COLLECTED_SIG) {
        return None;
    }
    Some(FeeLog {
        creator: topic_address(&log.topics[1]),
        amount: word(&log.data, 0)?,
        meta: LogMeta::from_log(log)?,
    })
}

#[cfg(test)]
pub mod testutil {
    use super::*;
    use ethers::types::{Bytes, U64};

    pub fn addr(n: u64) -> H160 {
        H160::from_low_u64_be(n)
    }

    pub fn topic_from_address(a: H160) -> H256 {
        let mut buf = [0u8; 32];
        buf[12..].copy_from_slice(a.as_bytes());
        H256::from(buf)
    }

    pub fn words(values: &[U256]) -> Bytes {
        let mut out = Vec::with_capacity(values.len() * 32);
        for v in values {
            let mut buf = [0u8; 32];
            v.to_big_endian(&mut buf);
            out.extend_from_slice(&buf);
        }
        Bytes::from(out)
    }

    pub fn make_log(
        address: H160,
        topics: Vec<H256>,
        data: Bytes,
        block: u64,
        tx: H256,
        log_index: u64,
    ) -> Log {
        Log {
            address,
            topics,
            data,
            block_number: Some(U64::from(block)),
            transaction_hash: Some(tx),
            log_index: Some(U256::from(log_index)),
            ..Default::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testutil::*;
    use super::*;

    fn tx(n: u64) -> H256 {
        H256::from_low_u64_be(n)
    }

    #[test]
    fn decodes_transfer() {
        let log = make_log(
            addr(1),
            vec![
                event_topic(TRANSFER_SIG),
                topic_from_address(addr(2)),
                topic_from_address(addr(3)),
            ],
            words(&[U256::from(500u64)]),
            42,
            tx(9),
            7,
        );

        let t = decode_transfer(&log).expect("should decode");
        assert_eq!(t.from, addr(2));
        assert_eq!(t.to, addr(3));
        assert_eq!(t.value, U256::from(500u64));
        assert_eq!(t.meta.block_number, 42);
        assert_eq!(t.meta.log_index, 7);
    }

    #[test]
    fn transfer_with_wrong_topic_is_skipped() {
        let log = make_log(
            addr(1),
            vec![
                event_topic(CURVE_BUY_SIG),
                topic_from_address(addr(2)),
                topic_from_address(addr(3)),
            ],
            words(&[U256::from(500u64)]),
            42,
            tx(9),
            7,
        );
        assert!(decode_transfer(&log).is_none());
    }

    #[test]
    fn pending_log_without_block_number_is_skipped() {
        let mut log = make_log(
            addr(1),
            vec![
                event_topic(TRANSFER_SIG),
                topic_from_address(addr(2)),
                topic_from_address(addr(3)),
            ],
            words(&[U256::from(1u64)]),
            42,
            tx(9),
            0,
        );
        log.block_number = None;
        assert!(decode_transfer(&log).is_none());
    }

    #[test]
    fn decodes_curve_buy_and_sell() {
        let buy = make_log(
            addr(10),
            vec![event_topic(CURVE_BUY_SIG), topic_from_address(addr(5))],
            words(&[U256::from(100u64), U256::from(2_000u64), U256::from(1u64)]),
            10,
            tx(1),
            0,
        );
        match decode_curve_buy(&buy).expect("buy decodes") {
            TradeLog::CurveBuy {
                user,
                asset_in,
                tokens_out,
                ..
            } => {
                assert_eq!(user, addr(5));
                assert_eq!(asset_in, U256::from(100u64));
                assert_eq!(tokens_out, U256::from(2_000u64));
            }
            other => panic!("wrong variant: {other:?}"),
        }

        let sell = make_log(
            addr(10),
            vec![event_topic(CURVE_SELL_SIG), topic_from_address(addr(6))],
            words(&[U256::from(300u64), U256::from(15u64), U256::from(1u64)]),
            11,
            tx(2),
            1,
        );
        match decode_curve_sell(&sell).expect("sell decodes") {
            TradeLog::CurveSell {
                user,
                tokens_in,
                asset_out,
                ..
            } => {
                assert_eq!(user, addr(6));
                assert_eq!(tokens_in, U256::from(300u64));
                assert_eq!(asset_out, U256::from(15u64));
            }
            other => panic!("wrong variant: {other:?}"),
        }
    }

    #[test]
    fn decodes_pair_swap() {
        let log = make_log(
            addr(20),
            vec![
                event_topic(PAIR_SWAP_SIG),
                topic_from_address(addr(7)),
                topic_from_address(addr(8)),
            ],
            words(&[
                U256::from(50u64),
                U256::zero(),
                U256::zero(),
                U256::from(1_000u64),
            ]),
            12,
            tx(3),
            2,
        );
        match decode_pair_swap(&log).expect("swap decodes") {
            TradeLog::PairSwap {
                pair,
                sender,
                to,
                amount0_in,
                amount1_out,
                ..
            } => {
                assert_eq!(pair, addr(20));
                assert_eq!(sender, addr(7));
                assert_eq!(to, addr(8));
                assert_eq!(amount0_in, U256::from(50u64));
                assert_eq!(amount1_out, U256::from(1_000u64));
            }
            other => panic!("wrong variant: {other:?}"),
        }
    }

    #[test]
    fn decodes_graduation_and_fee() {
        let grad = make_log(
            addr(10),
            vec![event_topic(GRADUATED_SIG), topic_from_address(addr(1))],
            {
                let mut buf = [0u8; 32];
                buf[12..].copy_from_slice(addr(99).as_bytes());
                ethers::types::Bytes::from(buf.to_vec())
            },
            13,
            tx(4),
            0,
        );
        let g = decode_graduated(&grad).expect("graduation decodes");
        assert_eq!(g.token, addr(1));
        assert_eq!(g.pair, addr(99));

        let fee = make_log(
            addr(10),
            vec![event_topic(FEE_COLLECTED_SIG), topic_from_address(addr(42))],
            words(&[U256::from(777u64)]),
            14,
            tx(5),
            3,
        );
        let f = decode_fee_collected(&fee).expect("fee decodes");
        assert_eq!(f.creator, addr(42));
        assert_eq!(f.amount, U256::from(777u64));
    }

    #[test]
    fn short_data_is_rejected() {
        let log = make_log(
            addr(10),
            vec![event_topic(CURVE_BUY_SIG), topic_from_address(addr(5))],
            words(&[U256::from(100u64)]),
            10,
            tx(1),
            0,
        );
        assert!(decode_curve_buy(&log).is_none());
    }
}
