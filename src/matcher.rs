use std::collections::HashSet;

use crate::events::{
    Direction, EventKind, PriceAlert, ReservationAlert, ReservationRole, WalletEvent,
};
use crate::indexer::{parse_amount, parse_sats, EventsBatch};
use crate::store::models::{norm_hex, IdentityProjection, TokenWatch};

/// Result of projecting one indexer batch against the tracked identities.
#[derive(Debug, Default)]
pub struct MatchOutput {
    pub events: Vec<WalletEvent>,
    pub price_alerts: Vec<PriceAlert>,
    pub reservation_alerts: Vec<ReservationAlert>,
    /// `(primary, contract, is_nft)` rows for the seen-contract set.
    pub seen: Vec<(String, String, bool)>,
}

/// Project typed indexer records into semantic wallet events. Actor fields
/// carrying an identity hash compare through `norm_hex`; buyer/seller-style
/// fields may instead carry a BTC address and additionally match through
/// tracked-set membership with canonical normalisation.
pub fn match_batch(
    batch: &EventsBatch,
    proj: &IdentityProjection,
    nft_contracts: &HashSet<String>,
    watches: &[TokenWatch],
) -> MatchOutput {
    let mut out = MatchOutput::default();

    for t in &batch.transfers {
        let Some(amount) = parse_amount(&t.value) else {
            tracing::warn!(tx = %t.tx_hash, value = %t.value, "Skipping transfer with bad amount");
            continue;
        };
        let from = norm_hex(&t.from);
        let to = norm_hex(&t.to);
        let is_nft = t.is_nft || nft_contracts.contains(&t.contract);

        for (primary, hash) in &proj.mldsa {
            let mut push = |direction| {
                out.events.push(WalletEvent {
                    address: primary.clone(),
                    tx_hash: t.tx_hash.clone(),
                    block_height: t.block_height,
                    kind: if is_nft {
                        EventKind::NftTransfer {
                            contract: t.contract.clone(),
                            amount,
                            direction,
                        }
                    } else {
                        EventKind::Token {
                            contract: t.contract.clone(),
                            amount,
                            direction,
                        }
                    },
                });
                out.seen.push((primary.clone(), t.contract.clone(), is_nft));
            };
            if from == *hash {
                push(Direction::Out);
            }
            if to == *hash {
                push(Direction::In);
            }
        }
    }

    for r in &batch.reservations {
        let (Some(satoshis), Some(token_amount)) =
            (parse_sats(&r.satoshis), parse_amount(&r.token_amount))
        else {
            tracing::warn!(tx = %r.tx_hash, "Skipping reservation with bad amounts");
            continue;
        };

        let provider = norm_hex(&r.provider_mldsa);
        for (primary, hash) in &proj.mldsa {
            if provider == *hash {
                out.events.push(WalletEvent {
                    address: primary.clone(),
                    tx_hash: r.tx_hash.clone(),
                    block_height: r.block_height,
                    kind: EventKind::LiquidityReserved {
                        contract: r.contract.clone(),
                        role: ReservationRole::Seller,
                        satoshis,
                        token_amount,
                    },
                });
            }
        }
        if let Some(primary) = match_actor(&r.buyer_address, proj) {
            out.events.push(WalletEvent {
                address: primary,
                tx_hash: r.tx_hash.clone(),
                block_height: r.block_height,
                kind: EventKind::LiquidityReserved {
                    contract: r.contract.clone(),
                    role: ReservationRole::Buyer,
                    satoshis,
                    token_amount,
                },
            });
        }

        for w in watches {
            if w.min_reservation_sats > 0
                && w.contract == r.contract
                && satoshis >= w.min_reservation_sats
            {
                out.reservation_alerts.push(ReservationAlert {
                    chat_id: w.chat_id,
                    contract: w.contract.clone(),
                    label: w.label.clone(),
                    satoshis,
                    token_amount,
                });
            }
        }
    }

    for s in &batch.swaps {
        let (Some(btc_spent), Some(tokens_received)) =
            (parse_sats(&s.btc_spent), parse_amount(&s.tokens_received))
        else {
            tracing::warn!(tx = %s.tx_hash, "Skipping swap with bad amounts");
            continue;
        };

        if let Some(primary) = match_actor(&s.buyer, proj) {
            out.events.push(WalletEvent {
                address: primary,
                tx_hash: s.tx_hash.clone(),
                block_height: s.block_height,
                kind: EventKind::SwapExecuted {
                    contract: s.contract.clone(),
                    btc_spent,
                    tokens_received,
                },
            });
        }
        for provider in &s.providers {
            let provider = norm_hex(provider);
            for (primary, hash) in &proj.mldsa {
                if provider == *hash {
                    out.events.push(WalletEvent {
                        address: primary.clone(),
                        tx_hash: s.tx_hash.clone(),
                        block_height: s.block_height,
                        kind: EventKind::ProviderConsumed {
                            contract: s.contract.clone(),
                            satoshis: btc_spent,
                        },
                    });
                }
            }
        }
    }

    for p in &batch.pool_events {
        let (Some(satoshis), Some(token_amount)) =
            (parse_sats(&p.satoshis), parse_amount(&p.token_amount))
        else {
            tracing::warn!(tx = %p.tx_hash, "Skipping pool event with bad amounts");
            continue;
        };
        let provider = norm_hex(&p.provider);
        for (primary, hash) in &proj.mldsa {
            if provider != *hash {
                continue;
            }
            let kind = match p.kind.as_str() {
                "added" => EventKind::LiquidityAdded {
                    contract: p.contract.clone(),
                    token_amount,
                    satoshis,
                },
                "removed" => EventKind::LiquidityRemoved {
                    contract: p.contract.clone(),
                    token_amount,
                    satoshis,
                },
                other => {
                    tracing::warn!(tx = %p.tx_hash, kind = other, "Unknown pool event kind");
                    continue;
                }
            };
            out.events.push(WalletEvent {
                address: primary.clone(),
                tx_hash: p.tx_hash.clone(),
                block_height: p.block_height,
                kind,
            });
        }
    }

    for s in &batch.staking_events {
        let Some(amount) = parse_amount(&s.amount) else {
            tracing::warn!(tx = %s.tx_hash, "Skipping staking event with bad amount");
            continue;
        };
        let staker = norm_hex(&s.staker);
        for (primary, hash) in &proj.mldsa {
            if staker != *hash {
                continue;
            }
            let kind = match s.kind.as_str() {
                "staked" => EventKind::Staked {
                    contract: s.contract.clone(),
                    amount,
                },
                "unstaked" => EventKind::Unstaked {
                    contract: s.contract.clone(),
                    amount,
                },
                "claimed" => EventKind::RewardsClaimed {
                    contract: s.contract.clone(),
                    amount,
                },
                other => {
                    tracing::warn!(tx = %s.tx_hash, kind = other, "Unknown staking event kind");
                    continue;
                }
            };
            out.events.push(WalletEvent {
                address: primary.clone(),
                tx_hash: s.tx_hash.clone(),
                block_height: s.block_height,
                kind,
            });
        }
    }

    for pc in &batch.price_changes {
        for w in watches {
            if w.price_alert_percent > 0.0
                && w.contract == pc.contract
                && pc.percent_change.abs() >= w.price_alert_percent
            {
                out.price_alerts.push(PriceAlert {
                    chat_id: w.chat_id,
                    contract: w.contract.clone(),
                    label: w.label.clone(),
                    percent_change: pc.percent_change,
                });
            }
        }
    }

    out
}

/// Match an actor field that may be an identity hash or a BTC address.
/// Returns the primary address the match attributes to.
fn match_actor(actor: &str, proj: &IdentityProjection) -> Option<String> {
    let normalized = norm_hex(actor);
    for (primary, hash) in &proj.mldsa {
        if normalized == *hash {
            return Some(primary.clone());
        }
    }
    let actor = actor.trim();
    if proj.tracked.contains(actor) {
        return Some(proj.canonicalize(actor).to_string());
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::indexer::{
        PoolEventRecord, PriceChangeRecord, ReservationRecord, StakingEventRecord, SwapRecord,
        TransferRecord,
    };
    use crate::store::models::TokenKind;

    fn proj_with_identity(primary: &str, hash: &str) -> IdentityProjection {
        let mut p = IdentityProjection::default();
        p.tracked.insert(primary.to_string());
        p.mldsa.insert(primary.to_string(), hash.to_string());
        p
    }

    fn transfer(from: &str, to: &str, value: &str) -> TransferRecord {
        TransferRecord {
            tx_hash: "tx1".into(),
            block_height: 150,
            contract: "c1".into(),
            from: from.into(),
            to: to.into(),
            value: value.into(),
            is_nft: false,
        }
    }

    #[test]
    fn transfer_out_matches_sender_hash() {
        let proj = proj_with_identity("op1qa", "aa11");
        let batch = EventsBatch {
            transfers: vec![transfer("0xAA11", "0xbb22", "1000")],
            ..Default::default()
        };
        let out = match_batch(&batch, &proj, &HashSet::new(), &[]);
        assert_eq!(out.events.len(), 1);
        assert_eq!(out.events[0].address, "op1qa");
        assert_eq!(
            out.events[0].kind,
            EventKind::Token {
                contract: "c1".into(),
                amount: 1000,
                direction: Direction::Out
            }
        );
        assert_eq!(out.seen, vec![("op1qa".into(), "c1".into(), false)]);
    }

    #[test]
    fn self_transfer_emits_both_directions() {
        let proj = proj_with_identity("op1qa", "aa11");
        let batch = EventsBatch {
            transfers: vec![transfer("aa11", "0xAA11", "5")],
            ..Default::default()
        };
        let out = match_batch(&batch, &proj, &HashSet::new(), &[]);
        let dirs: Vec<_> = out.events.iter().filter_map(|e| e.kind.direction()).collect();
        assert_eq!(dirs, vec![Direction::Out, Direction::In]);
    }

    #[test]
    fn nft_contract_produces_nft_transfer() {
        let proj = proj_with_identity("op1qa", "aa11");
        let mut nft = HashSet::new();
        nft.insert("c1".to_string());
        let batch = EventsBatch {
            transfers: vec![transfer("ff", "aa11", "1")],
            ..Default::default()
        };
        let out = match_batch(&batch, &proj, &nft, &[]);
        assert!(matches!(out.events[0].kind, EventKind::NftTransfer { .. }));
        assert_eq!(out.seen[0].2, true);
    }

    #[test]
    fn malformed_amount_skips_record() {
        let proj = proj_with_identity("op1qa", "aa11");
        let batch = EventsBatch {
            transfers: vec![transfer("aa11", "bb", "not-a-number")],
            ..Default::default()
        };
        let out = match_batch(&batch, &proj, &HashSet::new(), &[]);
        assert!(out.events.is_empty());
    }

    #[test]
    fn reservation_seller_side() {
        let proj = proj_with_identity("op1qa", "aa11");
        let batch = EventsBatch {
            reservations: vec![ReservationRecord {
                tx_hash: "tx2".into(),
                block_height: 160,
                contract: "c1".into(),
                provider_mldsa: "0xAA11".into(),
                buyer_address: "ff99".into(),
                satoshis: "10000".into(),
                token_amount: "1000000000".into(),
            }],
            ..Default::default()
        };
        let out = match_batch(&batch, &proj, &HashSet::new(), &[]);
        assert_eq!(out.events.len(), 1);
        assert_eq!(
            out.events[0].kind,
            EventKind::LiquidityReserved {
                contract: "c1".into(),
                role: ReservationRole::Seller,
                satoshis: 10_000,
                token_amount: 1_000_000_000
            }
        );
    }

    #[test]
    fn reservation_buyer_matched_via_tracked_address() {
        let mut proj = proj_with_identity("op1qa", "aa11");
        proj.tracked.insert("bcrt1qalias".into());
        proj.canonical.insert("bcrt1qalias".into(), "op1qa".into());
        let batch = EventsBatch {
            reservations: vec![ReservationRecord {
                tx_hash: "tx3".into(),
                block_height: 161,
                contract: "c1".into(),
                provider_mldsa: "dd00".into(),
                buyer_address: "bcrt1qalias".into(),
                satoshis: "500".into(),
                token_amount: "9".into(),
            }],
            ..Default::default()
        };
        let out = match_batch(&batch, &proj, &HashSet::new(), &[]);
        assert_eq!(out.events.len(), 1);
        assert_eq!(out.events[0].address, "op1qa");
        assert!(matches!(
            out.events[0].kind,
            EventKind::LiquidityReserved {
                role: ReservationRole::Buyer,
                ..
            }
        ));
    }

    #[test]
    fn reservation_alert_respects_threshold() {
        let proj = IdentityProjection::default();
        let watch = TokenWatch {
            id: "w1".into(),
            chat_id: 7,
            contract: "c1".into(),
            label: "tok".into(),
            kind: TokenKind::Fungible,
            price_alert_percent: 0.0,
            min_reservation_sats: 5_000,
        };
        let make = |sats: &str| EventsBatch {
            reservations: vec![ReservationRecord {
                tx_hash: "tx".into(),
                block_height: 1,
                contract: "c1".into(),
                provider_mldsa: "xx".into(),
                buyer_address: "yy".into(),
                satoshis: sats.into(),
                token_amount: "1".into(),
            }],
            ..Default::default()
        };

        let hit = match_batch(&make("5000"), &proj, &HashSet::new(), &[watch.clone()]);
        assert_eq!(hit.reservation_alerts.len(), 1);
        let miss = match_batch(&make("4999"), &proj, &HashSet::new(), &[watch]);
        assert!(miss.reservation_alerts.is_empty());
    }

    #[test]
    fn swap_emits_buyer_and_consumed_providers() {
        let mut proj = proj_with_identity("op1qa", "aa11");
        proj.tracked.insert("op1qlp".into());
        proj.mldsa.insert("op1qlp".into(), "bb22".into());
        let batch = EventsBatch {
            swaps: vec![SwapRecord {
                tx_hash: "tx4".into(),
                block_height: 200,
                contract: "c1".into(),
                buyer: "0xaa11".into(),
                btc_spent: "50000".into(),
                tokens_received: "1000000000000".into(),
                providers: vec!["0xBB22".into(), "cc33".into()],
            }],
            ..Default::default()
        };
        let out = match_batch(&batch, &proj, &HashSet::new(), &[]);
        assert_eq!(out.events.len(), 2);
        assert_eq!(
            out.events[0].kind,
            EventKind::SwapExecuted {
                contract: "c1".into(),
                btc_spent: 50_000,
                tokens_received: 1_000_000_000_000
            }
        );
        assert_eq!(out.events[1].address, "op1qlp");
        assert_eq!(
            out.events[1].kind,
            EventKind::ProviderConsumed {
                contract: "c1".into(),
                satoshis: 50_000
            }
        );
    }

    #[test]
    fn pool_and_staking_kinds() {
        let proj = proj_with_identity("op1qa", "aa11");
        let batch = EventsBatch {
            pool_events: vec![
                PoolEventRecord {
                    tx_hash: "tx5".into(),
                    block_height: 210,
                    contract: "c1".into(),
                    provider: "aa11".into(),
                    kind: "added".into(),
                    token_amount: "10".into(),
                    satoshis: "20".into(),
                },
                PoolEventRecord {
                    tx_hash: "tx6".into(),
                    block_height: 211,
                    contract: "c1".into(),
                    provider: "aa11".into(),
                    kind: "mystery".into(),
                    token_amount: "10".into(),
                    satoshis: "20".into(),
                },
            ],
            staking_events: vec![StakingEventRecord {
                tx_hash: "tx7".into(),
                block_height: 212,
                contract: "c1".into(),
                staker: "aa11".into(),
                kind: "claimed".into(),
                amount: "77".into(),
            }],
            ..Default::default()
        };
        let out = match_batch(&batch, &proj, &HashSet::new(), &[]);
        assert_eq!(out.events.len(), 2);
        assert!(matches!(out.events[0].kind, EventKind::LiquidityAdded { .. }));
        assert!(matches!(
            out.events[1].kind,
            EventKind::RewardsClaimed { amount: 77, .. }
        ));
    }

    #[test]
    fn price_alert_threshold_and_disable() {
        let proj = IdentityProjection::default();
        let watch = |pct: f64| TokenWatch {
            id: "w1".into(),
            chat_id: 7,
            contract: "c1".into(),
            label: "tok".into(),
            kind: TokenKind::Fungible,
            price_alert_percent: pct,
            min_reservation_sats: 0,
        };
        let batch = EventsBatch {
            price_changes: vec![PriceChangeRecord {
                contract: "c1".into(),
                block_height: 220,
                percent_change: -7.5,
                price: None,
            }],
            ..Default::default()
        };

        let hit = match_batch(&batch, &proj, &HashSet::new(), &[watch(5.0)]);
        assert_eq!(hit.price_alerts.len(), 1);
        assert_eq!(hit.price_alerts[0].percent_change, -7.5);

        let too_high = match_batch(&batch, &proj, &HashSet::new(), &[watch(10.0)]);
        assert!(too_high.price_alerts.is_empty());

        // zero disables
        let disabled = match_batch(&batch, &proj, &HashSet::new(), &[watch(0.0)]);
        assert!(disabled.price_alerts.is_empty());
    }
}
