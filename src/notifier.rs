use std::collections::HashSet;

use async_trait::async_trait;
use chrono::Utc;

use crate::events::{Direction, EventKind, PriceAlert, ReservationAlert, WalletEvent};
use crate::store::Store;

/// Outbound message surface. Seam for tests; Telegram implements it.
#[async_trait]
pub trait ChatSink: Send + Sync {
    async fn send_message(&self, chat_id: i64, text: &str) -> anyhow::Result<()>;
}

/// Groups events by (wallet, tx), renders one message per group and fans it
/// out to every subscribed chat behind the paid-subscription gate.
pub struct Notifier<S: ChatSink> {
    sink: S,
    store: Store,
    /// Explorer base URL for tx links, if configured.
    mempool_url: Option<String>,
    /// Chats already told their subscription lapsed, once per session.
    expiry_notified: HashSet<i64>,
}

impl<S: ChatSink> Notifier<S> {
    pub fn new(sink: S, store: Store, mempool_url: Option<String>) -> Self {
        Self {
            sink,
            store,
            mempool_url,
            expiry_notified: HashSet::new(),
        }
    }

    /// Dispatch surviving events. Events arrive ordered by block height;
    /// grouping preserves first-appearance order. Returns messages sent.
    pub async fn dispatch(&mut self, events: &[WalletEvent]) -> anyhow::Result<usize> {
        let mut groups: Vec<((String, String), Vec<&WalletEvent>)> = Vec::new();
        for event in events {
            let key = (event.address.clone(), event.tx_hash.clone());
            match groups.iter_mut().find(|(k, _)| *k == key) {
                Some((_, bucket)) => bucket.push(event),
                None => groups.push((key, vec![event])),
            }
        }

        let mut sent = 0;
        for ((address, tx_hash), bucket) in &groups {
            let body = render_group(bucket);
            let tx_line = match &self.mempool_url {
                Some(base) => format!("[{}…]({base}/tx/{tx_hash})", short(tx_hash)),
                None => format!("tx: `{tx_hash}`"),
            };
            for (chat_id, label) in self.store.chats_tracking(address) {
                if !self.check_gate(chat_id).await? {
                    continue;
                }
                let text = format!("*{label}* (`{}`)\n{body}\n{tx_line}", short(address));
                self.sink.send_message(chat_id, &text).await?;
                sent += 1;
            }
        }
        Ok(sent)
    }

    pub async fn dispatch_price_alerts(&mut self, alerts: &[PriceAlert]) -> anyhow::Result<()> {
        for alert in alerts {
            if !self.check_gate(alert.chat_id).await? {
                continue;
            }
            let arrow = if alert.percent_change >= 0.0 { "📈" } else { "📉" };
            let text = format!(
                "{arrow} *Price Alert* — {}\n{:+.2}% (`{}`)",
                alert.label,
                alert.percent_change,
                short(&alert.contract)
            );
            self.sink.send_message(alert.chat_id, &text).await?;
        }
        Ok(())
    }

    pub async fn dispatch_reservation_alerts(
        &mut self,
        alerts: &[ReservationAlert],
    ) -> anyhow::Result<()> {
        for alert in alerts {
            if !self.check_gate(alert.chat_id).await? {
                continue;
            }
            let text = format!(
                "📣 *Reservation* — {}\n{} BTC for {} tokens (`{}`)",
                alert.label,
                fmt_btc(alert.satoshis),
                alert.token_amount,
                short(&alert.contract)
            );
            self.sink.send_message(alert.chat_id, &text).await?;
        }
        Ok(())
    }

    /// Paid-subscription liveness check. An expired chat gets one notice per
    /// session and is then silent until it renews; a chat that never paid is
    /// silent outright.
    async fn check_gate(&mut self, chat_id: i64) -> anyhow::Result<bool> {
        let now = Utc::now();
        if self.store.has_active_subscription(chat_id, now) {
            return Ok(true);
        }
        if self.store.paid_subscription(chat_id).is_some() && self.expiry_notified.insert(chat_id) {
            self.sink
                .send_message(
                    chat_id,
                    "⚠️ Your subscription has expired. Renew with /redeem to keep receiving notifications.",
                )
                .await?;
        }
        Ok(false)
    }
}

fn short(s: &str) -> &str {
    &s[..8.min(s.len())]
}

/// Satoshi amount as BTC, precision scaled to magnitude.
pub fn fmt_btc(sats: u64) -> String {
    let btc = sats as f64 / 100_000_000.0;
    if btc >= 1.0 {
        format!("{btc:.4}")
    } else if btc >= 0.001 {
        format!("{btc:.6}")
    } else {
        format!("{btc:.8}")
    }
}

/// Render one (wallet, tx) group per the composite patterns; falls back to
/// one line per event.
fn render_group(events: &[&WalletEvent]) -> String {
    let swap = events.iter().find_map(|e| match &e.kind {
        EventKind::SwapExecuted {
            contract,
            btc_spent,
            tokens_received,
        } => Some((contract.clone(), *btc_spent, *tokens_received)),
        _ => None,
    });
    let change: u64 = events
        .iter()
        .filter_map(|e| match e.kind {
            EventKind::BtcReceived { satoshis } => Some(satoshis),
            _ => None,
        })
        .sum();
    let sends: Vec<(u64, Option<&str>, Option<u64>)> = events
        .iter()
        .filter_map(|e| match &e.kind {
            EventKind::BtcSent {
                satoshis,
                counterparty,
                recipient_amount,
            } => Some((*satoshis, counterparty.as_deref(), *recipient_amount)),
            _ => None,
        })
        .collect();

    // Swap Executed: the contract event carries the net cost; token-in legs
    // for the same contract fold into the summary.
    if let Some((contract, btc_spent, tokens_received)) = swap {
        let mut lines = vec![
            "🔁 *Swap Executed*".to_string(),
            format!("Spent: {} BTC", fmt_btc(btc_spent)),
            format!("Received: {tokens_received} (`{}`)", short(&contract)),
        ];
        if change > 0 {
            lines.push(format!("Change: {} BTC", fmt_btc(change)));
        }
        for e in events {
            let merged = matches!(
                &e.kind,
                EventKind::SwapExecuted { .. } | EventKind::BtcReceived { .. }
            ) || matches!(
                &e.kind,
                EventKind::Token { contract: c, direction: Direction::In, .. }
                | EventKind::NftTransfer { contract: c, direction: Direction::In, .. }
                    if *c == contract
            );
            if !merged {
                lines.push(render_single(e));
            }
        }
        return lines.join("\n");
    }

    let token_in = events
        .iter()
        .any(|e| e.kind.direction() == Some(Direction::In));
    let token_out = events
        .iter()
        .any(|e| e.kind.direction() == Some(Direction::Out));

    // OP20 ↔ OP20 trade without a swap record: show both legs.
    if token_in && token_out {
        let mut lines = vec!["🔄 *Token Swap*".to_string()];
        for e in events {
            match &e.kind {
                EventKind::Token {
                    contract,
                    amount,
                    direction,
                }
                | EventKind::NftTransfer {
                    contract,
                    amount,
                    direction,
                } => {
                    let leg = match direction {
                        Direction::Out => "Out",
                        Direction::In => "In",
                    };
                    lines.push(format!("{leg}: {amount} (`{}`)", short(contract)));
                }
                _ => lines.push(render_single(e)),
            }
        }
        return lines.join("\n");
    }

    if !sends.is_empty() && events.iter().all(|e| e.kind.is_btc()) {
        let total_input: u64 = sends.iter().map(|(sats, _, _)| sats).sum();
        let counterparty = sends.iter().find_map(|(_, c, _)| *c);
        let recipient: u64 = sends.iter().filter_map(|(_, _, r)| *r).max().unwrap_or(0);

        return match counterparty {
            // BTC Sent: recipient amount, change if any, fee when computable.
            Some(to) => {
                let mut lines = vec![
                    "📤 *BTC Sent*".to_string(),
                    format!("To: `{to}`"),
                    format!("Amount: {} BTC", fmt_btc(recipient)),
                ];
                if change > 0 {
                    lines.push(format!("Change: {} BTC", fmt_btc(change)));
                }
                if total_input > recipient + change {
                    lines.push(format!("Fee: {} BTC", fmt_btc(total_input - recipient - change)));
                }
                lines.join("\n")
            }
            // Internal Transfer: everything stayed inside the wallet.
            None => {
                let mut lines = vec![
                    "🔁 *Internal Transfer*".to_string(),
                    format!("Received: {} BTC", fmt_btc(change)),
                ];
                if total_input > change {
                    lines.push(format!("Fee: {} BTC", fmt_btc(total_input - change)));
                }
                lines.join("\n")
            }
        };
    }

    events
        .iter()
        .map(|e| render_single(e))
        .collect::<Vec<_>>()
        .join("\n")
}

fn render_single(event: &WalletEvent) -> String {
    match &event.kind {
        EventKind::BtcSent {
            satoshis,
            counterparty,
            ..
        } => match counterparty {
            Some(to) => format!("📤 BTC Sent: {} BTC → `{to}`", fmt_btc(*satoshis)),
            None => format!("📤 BTC Sent: {} BTC", fmt_btc(*satoshis)),
        },
        EventKind::BtcReceived { satoshis } => {
            format!("📥 BTC Received: {} BTC", fmt_btc(*satoshis))
        }
        EventKind::Token {
            contract,
            amount,
            direction,
        } => match direction {
            Direction::In => format!("🪙 Token In: {amount} (`{}`)", short(contract)),
            Direction::Out => format!("🪙 Token Out: {amount} (`{}`)", short(contract)),
        },
        EventKind::NftTransfer {
            contract,
            amount,
            direction,
        } => match direction {
            Direction::In => format!("🖼 NFT Received: {amount} (`{}`)", short(contract)),
            Direction::Out => format!("🖼 NFT Sent: {amount} (`{}`)", short(contract)),
        },
        EventKind::LiquidityReserved {
            contract,
            role,
            satoshis,
            token_amount,
        } => {
            let side = match role {
                crate::events::ReservationRole::Buyer => "buyer",
                crate::events::ReservationRole::Seller => "seller",
            };
            format!(
                "📝 Liquidity Reserved ({side}): {} BTC for {token_amount} (`{}`)",
                fmt_btc(*satoshis),
                short(contract)
            )
        }
        EventKind::ProviderConsumed { contract, satoshis } => format!(
            "💧 Liquidity Consumed: {} BTC (`{}`)",
            fmt_btc(*satoshis),
            short(contract)
        ),
        EventKind::SwapExecuted {
            contract,
            btc_spent,
            tokens_received,
        } => format!(
            "🔁 Swap Executed: {} BTC → {tokens_received} (`{}`)",
            fmt_btc(*btc_spent),
            short(contract)
        ),
        EventKind::LiquidityAdded {
            contract,
            token_amount,
            satoshis,
        } => format!(
            "➕ Liquidity Added: {token_amount} + {} BTC (`{}`)",
            fmt_btc(*satoshis),
            short(contract)
        ),
        EventKind::LiquidityRemoved {
            contract,
            token_amount,
            satoshis,
        } => format!(
            "➖ Liquidity Removed: {token_amount} + {} BTC (`{}`)",
            fmt_btc(*satoshis),
            short(contract)
        ),
        EventKind::Staked { contract, amount } => {
            format!("🔒 Staked: {amount} (`{}`)", short(contract))
        }
        EventKind::Unstaked { contract, amount } => {
            format!("🔓 Unstaked: {amount} (`{}`)", short(contract))
        }
        EventKind::RewardsClaimed { contract, amount } => {
            format!("🎁 Rewards Claimed: {amount} (`{}`)", short(contract))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::models::{AccessCode, Subscription};
    use chrono::Duration;
    use std::sync::Mutex;

    struct MockSink {
        messages: Mutex<Vec<(i64, String)>>,
    }

    impl MockSink {
        fn new() -> Self {
            Self {
                messages: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl ChatSink for &MockSink {
        async fn send_message(&self, chat_id: i64, text: &str) -> anyhow::Result<()> {
            self.messages.lock().unwrap().push((chat_id, text.to_string()));
            Ok(())
        }
    }

    fn store_with_paid_sub(chat_id: i64, address: &str) -> Store {
        let store = Store::open_in_memory().unwrap();
        store
            .add_subscription(Subscription {
                id: "s1".into(),
                chat_id,
                address: address.into(),
                label: "my wallet".into(),
                created_at: Utc::now(),
                linkage: None,
            })
            .unwrap();
        store
            .insert_access_code(AccessCode {
                code: "JT-TEST12345678".into(),
                funding_tx: None,
                redeemed: false,
                redeemed_by: None,
                code_expires_at: Utc::now() + Duration::days(1),
                duration_days: 30,
            })
            .unwrap();
        store
            .redeem_code("JT-TEST12345678", chat_id, address, Utc::now())
            .unwrap();
        store
    }

    fn event(address: &str, tx: &str, kind: EventKind) -> WalletEvent {
        WalletEvent {
            address: address.into(),
            tx_hash: tx.into(),
            block_height: 100,
            kind,
        }
    }

    #[tokio::test]
    async fn btc_sent_composite_shows_fee() {
        // 500k in, 300k to B, 199.5k change → fee 500 sats
        let store = store_with_paid_sub(7, "A");
        let sink = MockSink::new();
        let mut notifier = Notifier::new(&sink, store, None);

        let events = vec![
            event(
                "A",
                "t1",
                EventKind::BtcSent {
                    satoshis: 500_000,
                    counterparty: Some("B".into()),
                    recipient_amount: Some(300_000),
                },
            ),
            event("A", "t1", EventKind::BtcReceived { satoshis: 199_500 }),
        ];
        let sent = notifier.dispatch(&events).await.unwrap();
        assert_eq!(sent, 1);

        let messages = sink.messages.lock().unwrap();
        let text = &messages[0].1;
        assert!(text.contains("BTC Sent"), "{text}");
        assert!(text.contains("Amount: 0.003000 BTC"), "{text}");
        assert!(text.contains("Change: 0.001995 BTC"), "{text}");
        assert!(text.contains("Fee: 0.00000500 BTC"), "{text}");
        assert!(text.contains("my wallet"), "{text}");
    }

    #[tokio::test]
    async fn swap_composite_merges_token_leg() {
        let store = store_with_paid_sub(7, "A");
        let sink = MockSink::new();
        let mut notifier = Notifier::new(&sink, store, None);

        let events = vec![
            event(
                "A",
                "t2",
                EventKind::SwapExecuted {
                    contract: "contract1".into(),
                    btc_spent: 50_000,
                    tokens_received: 1_000_000_000_000,
                },
            ),
            event(
                "A",
                "t2",
                EventKind::Token {
                    contract: "contract1".into(),
                    amount: 1_000_000_000_000,
                    direction: Direction::In,
                },
            ),
        ];
        notifier.dispatch(&events).await.unwrap();

        let messages = sink.messages.lock().unwrap();
        assert_eq!(messages.len(), 1);
        let text = &messages[0].1;
        assert!(text.contains("Swap Executed"), "{text}");
        assert!(text.contains("Spent: 0.00050000 BTC"), "{text}");
        assert!(text.contains("Received: 1000000000000"), "{text}");
        // the token leg folded into the summary, no separate line
        assert!(!text.contains("Token In"), "{text}");
        assert!(!text.contains("Change"), "{text}");
    }

    #[tokio::test]
    async fn internal_transfer_composite() {
        let store = store_with_paid_sub(7, "A");
        let sink = MockSink::new();
        let mut notifier = Notifier::new(&sink, store, None);

        let events = vec![
            event(
                "A",
                "t3",
                EventKind::BtcSent {
                    satoshis: 50_000,
                    counterparty: None,
                    recipient_amount: None,
                },
            ),
            event("A", "t3", EventKind::BtcReceived { satoshis: 49_500 }),
        ];
        notifier.dispatch(&events).await.unwrap();

        let messages = sink.messages.lock().unwrap();
        let text = &messages[0].1;
        assert!(text.contains("Internal Transfer"), "{text}");
        assert!(text.contains("Fee: 0.00000500 BTC"), "{text}");
    }

    #[tokio::test]
    async fn token_swap_composite_shows_both_legs() {
        let store = store_with_paid_sub(7, "A");
        let sink = MockSink::new();
        let mut notifier = Notifier::new(&sink, store, None);

        let events = vec![
            event(
                "A",
                "t4",
                EventKind::Token {
                    contract: "c-from".into(),
                    amount: 10,
                    direction: Direction::Out,
                },
            ),
            event(
                "A",
                "t4",
                EventKind::Token {
                    contract: "c-to".into(),
                    amount: 20,
                    direction: Direction::In,
                },
            ),
        ];
        notifier.dispatch(&events).await.unwrap();

        let text = &sink.messages.lock().unwrap()[0].1;
        assert!(text.contains("Token Swap"), "{text}");
        assert!(text.contains("Out: 10"), "{text}");
        assert!(text.contains("In: 20"), "{text}");
    }

    #[tokio::test]
    async fn unpaid_chat_is_silent_and_expired_chat_notified_once() {
        let store = Store::open_in_memory().unwrap();
        // chat 7 tracks A but never paid
        store
            .add_subscription(Subscription {
                id: "s1".into(),
                chat_id: 7,
                address: "A".into(),
                label: "w".into(),
                created_at: Utc::now(),
                linkage: None,
            })
            .unwrap();
        // chat 8 tracks A with an expired sub
        store
            .add_subscription(Subscription {
                id: "s2".into(),
                chat_id: 8,
                address: "A".into(),
                label: "w".into(),
                created_at: Utc::now(),
                linkage: None,
            })
            .unwrap();
        store
            .insert_access_code(AccessCode {
                code: "JT-EXPIRED12345".into(),
                funding_tx: None,
                redeemed: false,
                redeemed_by: None,
                code_expires_at: Utc::now() + Duration::days(1),
                duration_days: 0,
            })
            .unwrap();
        store
            .redeem_code("JT-EXPIRED12345", 8, "A", Utc::now() - Duration::days(1))
            .unwrap();

        let sink = MockSink::new();
        let mut notifier = Notifier::new(&sink, store, None);
        let events = vec![event("A", "t5", EventKind::BtcReceived { satoshis: 100 })];

        notifier.dispatch(&events).await.unwrap();
        notifier.dispatch(&events).await.unwrap();

        let messages = sink.messages.lock().unwrap();
        // only the one-time expiry notice for chat 8; chat 7 stays silent
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].0, 8);
        assert!(messages[0].1.contains("expired"));
    }

    #[tokio::test]
    async fn price_alerts_are_gated() {
        let store = store_with_paid_sub(7, "A");
        let sink = MockSink::new();
        let mut notifier = Notifier::new(&sink, store, None);

        let alerts = vec![
            PriceAlert {
                chat_id: 7,
                contract: "c1".into(),
                label: "tok".into(),
                percent_change: -7.5,
            },
            PriceAlert {
                chat_id: 99, // never paid
                contract: "c1".into(),
                label: "tok".into(),
                percent_change: -7.5,
            },
        ];
        notifier.dispatch_price_alerts(&alerts).await.unwrap();

        let messages = sink.messages.lock().unwrap();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].0, 7);
        assert!(messages[0].1.contains("-7.50%"), "{}", messages[0].1);
    }

    #[test]
    fn btc_formatting_scales_precision() {
        assert_eq!(fmt_btc(150_000_000), "1.5000");
        assert_eq!(fmt_btc(300_000), "0.003000");
        assert_eq!(fmt_btc(500), "0.00000500");
    }
}
