use crate::ledger::{pct, Holder};
use ethers::types::{H160, U256};
use std::collections::{HashMap, HashSet};

/// Transfer facts the classifier needs; a projection of the stored rows.
#[derive(Debug, Clone, Copy)]
pub struct TransferObservation {
    pub from: H160,
    pub to: H160,
    pub block_number: u64,
}

/// Swap facts the classifier needs.
#[derive(Debug, Clone, Copy)]
pub struct SwapObservation {
    pub trader: H160,
    pub is_buy: bool,
    pub block_number: u64,
}

/// Earliest block at which each address bought. The buyer set is the union
/// of direct recipients from the token/curve contract and is-buy traders
/// from normalized swaps.
pub fn buyer_first_blocks(
    token: H160,
    curve: Option<H160>,
    transfers: &[TransferObservation],
    swaps: &[SwapObservation],
) -> HashMap<H160, u64> {
    let mut first: HashMap<H160, u64> = HashMap::new();

    for t in transfers {
        let from_contract = t.from == token || curve.map_or(false, |c| t.from == c);
        if from_contract {
            record_first(&mut first, t.to, t.block_number);
        }
    }
    for s in swaps {
        if s.is_buy {
            record_first(&mut first, s.trader, s.block_number);
        }
    }
    first
}

fn record_first(map: &mut HashMap<H160, u64>, who: H160, block: u64) {
    map.entry(who)
        .and_modify(|b| {
            if block < *b {
                *b = block;
            }
        })
        .or_insert(block);
}

pub fn first_transfer_block(transfers: &[TransferObservation]) -> Option<u64> {
    transfers.iter().map(|t| t.block_number).min()
}

#[derive(Debug, Clone, Default)]
pub struct Classification {
    /// Every address that ever bought.
    pub buyers: HashSet<H160>,
    /// Buyers whose first buy landed inside the early window; flagged even
    /// if they no longer hold.
    pub snipers: HashSet<H160>,
    /// Current holders outside the buyer set.
    pub phishing: HashSet<H160>,
    pub phishing_pct: f64,
    pub sniper_pct: f64,
}

/// Label the current holder set. The sniper window is block-based: the first
/// `sniper_window_blocks` after the token's first observed transfer.
/// Percentages follow the uniform rule: excluded-holder numerator, full
/// total supply denominator.
pub fn classify_holders(
    holders: &[Holder],
    buyer_first: &HashMap<H160, u64>,
    first_block: Option<u64>,
    sniper_window_blocks: u64,
    total_supply: U256,
) -> Classification {
    let snipers: HashSet<H160> = match first_block {
        Some(first) => {
            let cutoff = first.saturating_add(sniper_window_blocks);
            buyer_first
                .iter()
                .filter(|(_, block)| **block <= cutoff)
                .map(|(who, _)| *who)
                .collect()
        }
        None => HashSet::new(),
    };

    let mut phishing = HashSet::new();
    let mut phishing_balance = U256::zero();
    let mut sniper_balance = U256::zero();

    for h in holders {
        if !buyer_first.contains_key(&h.address) {
            phishing.insert(h.address);
            phishing_balance = phishing_balance.saturating_add(h.balance);
        }
        if snipers.contains(&h.address) {
            sniper_balance = sniper_balance.saturating_add(h.balance);
        }
    }

    Classification {
        buyers: buyer_first.keys().copied().collect(),
        snipers,
        phishing,
        phishing_pct: pct(phishing_balance, total_supply),
        sniper_pct: pct(sniper_balance, total_supply),
    }
}

/// Wallets holding a positive balance in at least two distinct tokens by the
/// same creator, excluding the creator. Returns each insider's connection
/// count.
pub fn insiders(
    creator: H160,
    holdings_by_token: &[(H160, HashSet<H160>)],
) -> HashMap<H160, usize> {
    let mut counts: HashMap<H160, usize> = HashMap::new();
    for (_, holders) in holdings_by_token {
        for wallet in holders {
            if *wallet != creator {
                *counts.entry(*wallet).or_insert(0) += 1;
            }
        }
    }
    counts.retain(|_, n| *n >= 2);
    counts
}

/// Combined share held by the given insider wallets in the current holder
/// set.
pub fn insider_pct(
    holders: &[Holder],
    insider_wallets: &HashMap<H160, usize>,
    total_supply: U256,
) -> f64 {
    let sum = holders
        .iter()
        .filter(|h| insider_wallets.contains_key(&h.address))
        .fold(U256::zero(), |acc, h| acc.saturating_add(h.balance));
    pct(sum, total_supply)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(n: u64) -> H160 {
        H160::from_low_u64_be(n)
    }

    fn holder(n: u64, balance: u64) -> Holder {
        Holder {
            address: addr(n),
            balance: U256::from(balance),
        }
    }

    #[test]
    fn unsolicited_recipient_is_phishing() {
        // Wallet 5 received 500 units from another user wallet and never
        // bought; wallet 4 bought from the curve.
        let token = addr(1);
        let transfers = vec![
            TransferObservation {
                from: H160::zero(),
                to: token,
                block_number: 100,
            },
            TransferObservation {
                from: token,
                to: addr(4),
                block_number: 101,
            },
            TransferObservation {
                from: addr(4),
                to: addr(5),
                block_number: 150,
            },
        ];
        let buyer_first = buyer_first_blocks(token, None, &transfers, &[]);

        let holders = vec![holder(4, 500), holder(5, 500)];
        let c = classify_holders(
            &holders,
            &buyer_first,
            first_transfer_block(&transfers),
            10,
            U256::from(10_000u64),
        );

        assert!(c.phishing.contains(&addr(5)));
        assert!(!c.phishing.contains(&addr(4)));
        assert_eq!(c.phishing_pct, 5.0);
    }

    #[test]
    fn sniper_window_is_block_based() {
        let token = addr(1);
        let transfers = vec![
            TransferObservation {
                from: H160::zero(),
                to: token,
                block_number: 1_000,
            },
            // Early buyer inside the 10-block window.
            TransferObservation {
                from: token,
                to: addr(2),
                block_number: 1_005,
            },
            // Late buyer outside it.
            TransferObservation {
                from: token,
                to: addr(3),
                block_number: 1_020,
            },
        ];
        let buyer_first = buyer_first_blocks(token, None, &transfers, &[]);

        let holders = vec![holder(2, 100), holder(3, 100)];
        let c = classify_holders(
            &holders,
            &buyer_first,
            first_transfer_block(&transfers),
            10,
            U256::from(1_000u64),
        );

        assert!(c.snipers.contains(&addr(2)));
        assert!(!c.snipers.contains(&addr(3)));
        assert_eq!(c.sniper_pct, 10.0);
    }

    #[test]
    fn swap_buyers_join_the_buyer_set() {
        let token = addr(1);
        let swaps = vec![
            SwapObservation {
                trader: addr(6),
                is_buy: true,
                block_number: 50,
            },
            SwapObservation {
                trader: addr(7),
                is_buy: false,
                block_number: 51,
            },
        ];
        let buyer_first = buyer_first_blocks(token, None, &[], &swaps);
        assert!(buyer_first.contains_key(&addr(6)));
        assert!(!buyer_first.contains_key(&addr(7)));
    }

    #[test]
    fn curve_address_counts_as_purchase_source() {
        let token = addr(1);
        let curve = addr(2);
        let transfers = vec![TransferObservation {
            from: curve,
            to: addr(3),
            block_number: 10,
        }];
        let buyer_first = buyer_first_blocks(token, Some(curve), &transfers, &[]);
        assert_eq!(buyer_first.get(&addr(3)), Some(&10));
    }

    #[test]
    fn insiders_need_two_tokens_and_exclude_creator() {
        let creator = addr(9);
        let token_a_holders: HashSet<H160> = [addr(9), addr(10), addr(11)].into_iter().collect();
        let token_b_holders: HashSet<H160> = [addr(9), addr(10), addr(12)].into_iter().collect();

        let found = insiders(
            creator,
            &[(addr(1), token_a_holders), (addr(2), token_b_holders)],
        );

        assert_eq!(found.get(&addr(10)), Some(&2));
        assert!(!found.contains_key(&addr(9)));
        assert!(!found.contains_key(&addr(11)));

        let holders = vec![holder(10, 300), holder(11, 100)];
        assert_eq!(insider_pct(&holders, &found, U256::from(1_000u64)), 30.0);
    }

    #[test]
    fn no_transfers_means_no_snipers() {
        let c = classify_holders(&[], &HashMap::new(), None, 10, U256::from(1u64));
        assert!(c.snipers.is_empty());
        assert!(c.phishing.is_empty());
    }
}
