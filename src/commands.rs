use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::Utc;

use crate::config::Config;
use crate::identity;
use crate::indexer::EventSource;
use crate::notifier::fmt_btc;
use crate::rpc::ChainSource;
use crate::store::models::{
    new_short_id, AccessCode, Subscription, TokenKind, TokenWatch,
};
use crate::store::{RedeemOutcome, Store};

const BALANCE_COOLDOWN: Duration = Duration::from_secs(10);
const PORTFOLIO_COOLDOWN: Duration = Duration::from_secs(30);

const HELP: &str = "\
*opwatch commands*
/track <address> \\[label] — watch a wallet
/untrack <id> — stop watching
/list — your wallets and token watches
/balance <id|address> — BTC + token balances
/portfolio — roll-up across all wallets
/watch <contract> \\[label] \\[nft] — watch a token contract
/unwatch <id> — stop watching a contract
/alert <id> <percent> — price alert threshold (0 off)
/pool <contract> — live pool state
/redeem <code> — activate a subscription
/auth <password> — legacy access";

/// Handles slash commands from the long-poll loop. Failures surface to the
/// chat as one-line errors and never reach the pipeline.
pub struct CommandHandler {
    store: Store,
    rpc: Arc<dyn ChainSource>,
    indexer: Arc<dyn EventSource>,
    cfg: Config,
    rate: Mutex<HashMap<(i64, &'static str), Instant>>,
}

impl CommandHandler {
    pub fn new(
        store: Store,
        rpc: Arc<dyn ChainSource>,
        indexer: Arc<dyn EventSource>,
        cfg: Config,
    ) -> Self {
        Self {
            store,
            rpc,
            indexer,
            cfg,
            rate: Mutex::new(HashMap::new()),
        }
    }

    /// Dispatch one command line. Returns None for non-command text.
    pub async fn handle(&self, chat_id: i64, text: &str) -> Option<String> {
        let text = text.trim();
        if !text.starts_with('/') {
            return None;
        }
        let mut parts = text.split_whitespace();
        let command = parts
            .next()
            .map(|c| c.split('@').next().unwrap_or(c))
            .unwrap_or("");
        let args: Vec<&str> = parts.collect();

        let reply = match command {
            "/start" | "/help" => HELP.to_string(),
            "/auth" => self.auth(chat_id, &args),
            "/redeem" => self.redeem(chat_id, &args),
            _ => {
                if !self.store.is_authorized(chat_id) {
                    "Not authorized. Use /redeem <code> or /auth <password> first.".to_string()
                } else {
                    match command {
                        "/track" => self.track(chat_id, &args).await,
                        "/untrack" => self.untrack(chat_id, &args),
                        "/list" => self.list(chat_id),
                        "/balance" => self.balance(chat_id, &args).await,
                        "/portfolio" => self.portfolio(chat_id).await,
                        "/watch" => self.watch(chat_id, &args),
                        "/unwatch" => self.unwatch(chat_id, &args),
                        "/alert" => self.alert(chat_id, &args),
                        "/pool" => self.pool(&args).await,
                        _ => format!("Unknown command {command}. Try /help."),
                    }
                }
            }
        };
        Some(reply)
    }

    fn check_rate(&self, chat_id: i64, command: &'static str, cooldown: Duration) -> bool {
        let mut rate = self.rate.lock().unwrap();
        let now = Instant::now();
        match rate.get(&(chat_id, command)) {
            Some(last) if now.duration_since(*last) < cooldown => false,
            _ => {
                rate.insert((chat_id, command), now);
                true
            }
        }
    }

    fn auth(&self, chat_id: i64, args: &[&str]) -> String {
        let Some(expected) = self.cfg.bot_password.as_deref() else {
            return "Password access is disabled. Use /redeem <code>.".to_string();
        };
        let Some(supplied) = args.first() else {
            return "Usage: /auth <password>".to_string();
        };
        if *supplied != expected {
            return "Wrong password.".to_string();
        }
        match self.store.authorize_chat(chat_id) {
            Ok(()) => "✅ Authorized. Track wallets with /track.".to_string(),
            Err(e) => internal(chat_id, "auth", e),
        }
    }

    fn redeem(&self, chat_id: i64, args: &[&str]) -> String {
        let Some(code) = args.first() else {
            return "Usage: /redeem JT-XXXXXXXXXXXX".to_string();
        };
        let code = code.trim().to_ascii_uppercase();
        if !AccessCode::is_valid_format(&code) {
            return "That doesn't look like an access code (JT-XXXXXXXXXXXX).".to_string();
        }
        match self.store.redeem_code(&code, chat_id, "", Utc::now()) {
            Ok(RedeemOutcome::Activated { expires_at }) => format!(
                "✅ Subscription active until {}.",
                expires_at.format("%Y-%m-%d")
            ),
            Ok(RedeemOutcome::AlreadyActive { expires_at }) => format!(
                "This code is already yours. Active until {}.",
                expires_at.format("%Y-%m-%d")
            ),
            Ok(RedeemOutcome::AlreadyRedeemed) => "That code has already been used.".to_string(),
            Ok(RedeemOutcome::CodeExpired) => "That code has expired.".to_string(),
            Ok(RedeemOutcome::UnknownCode) => "Unknown code.".to_string(),
            Err(e) => internal(chat_id, "redeem", e),
        }
    }

    async fn track(&self, chat_id: i64, args: &[&str]) -> String {
        let Some(address) = args.first().map(|s| s.to_string()) else {
            return "Usage: /track <address> [label]".to_string();
        };
        if address.len() < 8 || address.contains(|c: char| c.is_whitespace()) {
            return "That doesn't look like an address.".to_string();
        }
        if self.store.subscription_count(chat_id) >= self.cfg.max_wallets_per_user {
            return format!(
                "Wallet limit reached ({}). Remove one with /untrack first.",
                self.cfg.max_wallets_per_user
            );
        }
        if self.store.find_subscription(chat_id, &address).is_some() {
            return format!("Already tracking `{address}`.");
        }

        // Resolve eagerly so the same identity under another format is caught
        // now; a resolver failure just defers linkage to the next tick.
        let linkage = match identity::resolve(self.rpc.as_ref(), self.cfg.network, &address).await {
            Ok(linkage) => linkage,
            Err(e) => {
                tracing::debug!("Track-time resolve failed for {address}: {e:#}");
                None
            }
        };
        if let Some(l) = &linkage {
            if let Some(existing) = self.store.find_subscription_by_hash(chat_id, &l.mldsa_hash) {
                return format!(
                    "Already tracking this wallet as `{}` ({}).",
                    existing.address, existing.label
                );
            }
        }

        let label = if args.len() > 1 {
            args[1..].join(" ")
        } else {
            format!("Wallet {}", self.store.subscription_count(chat_id) + 1)
        };
        let sub = Subscription {
            id: new_short_id(),
            chat_id,
            address: address.clone(),
            label: label.clone(),
            created_at: Utc::now(),
            linkage: linkage.clone(),
        };
        let id = sub.id.clone();
        if let Err(e) = self.store.add_subscription(sub) {
            return internal(chat_id, "track", e);
        }
        if let Some(l) = linkage {
            crate::history::spawn_scan(
                Arc::clone(&self.indexer),
                self.store.clone(),
                address.clone(),
                l.mldsa_hash,
            );
        }
        format!("👁 Tracking `{address}` as *{label}* (id `{id}`).")
    }

    fn untrack(&self, chat_id: i64, args: &[&str]) -> String {
        let Some(key) = args.first() else {
            return "Usage: /untrack <id|address>".to_string();
        };
        match self.store.remove_subscription(chat_id, key) {
            Ok(Some(sub)) => format!("Stopped tracking *{}* (`{}`).", sub.label, sub.address),
            Ok(None) => "No such wallet. See /list.".to_string(),
            Err(e) => internal(chat_id, "untrack", e),
        }
    }

    fn list(&self, chat_id: i64) -> String {
        let subs = self.store.subscriptions_for_chat(chat_id);
        let watches = self.store.watches_for_chat(chat_id);
        if subs.is_empty() && watches.is_empty() {
            return "Nothing tracked yet. Start with /track <address>.".to_string();
        }
        let mut lines = Vec::new();
        if !subs.is_empty() {
            lines.push("*Wallets*".to_string());
            for s in &subs {
                let resolved = if s.linkage.is_some() { "" } else { " (resolving…)" };
                lines.push(format!("`{}` {} — `{}`{resolved}", s.id, s.label, s.address));
            }
        }
        if !watches.is_empty() {
            lines.push("*Token watches*".to_string());
            for w in &watches {
                let alert = if w.price_alert_percent > 0.0 {
                    format!(" alert ±{}%", w.price_alert_percent)
                } else {
                    String::new()
                };
                lines.push(format!(
                    "`{}` {} — `{}` ({}){alert}",
                    w.id,
                    w.label,
                    w.contract,
                    w.kind.as_str()
                ));
            }
        }
        lines.join("\n")
    }

    async fn balance(&self, chat_id: i64, args: &[&str]) -> String {
        if !self.check_rate(chat_id, "balance", BALANCE_COOLDOWN) {
            return "Easy — /balance is limited to once every 10s.".to_string();
        }
        let Some(key) = args.first() else {
            return "Usage: /balance <id|address>".to_string();
        };
        let (address, label) = match self
            .store
            .subscriptions_for_chat(chat_id)
            .into_iter()
            .find(|s| s.id == *key || s.address == *key)
        {
            Some(s) => (s.address, s.label),
            None => (key.to_string(), key.to_string()),
        };

        let btc = match self.rpc.balance(&address, true).await {
            Ok(sats) => sats,
            Err(e) => {
                tracing::warn!("Balance query failed for {address}: {e:#}");
                return "Chain RPC unavailable, try again later.".to_string();
            }
        };
        let mut lines = vec![
            format!("*{label}* (`{address}`)"),
            format!("BTC: {} ", fmt_btc(btc)),
        ];

        // Token balances are best-effort and bounded by the contracts this
        // wallet was seen interacting with.
        if let Ok(balances) = self.indexer.balances(&address).await {
            let seen = self.store.seen_contracts(&address);
            let mut shown = 0;
            for b in balances {
                if !seen.is_empty() && !seen.contains(&b.contract) {
                    continue;
                }
                let name = b.symbol.unwrap_or_else(|| short(&b.contract).to_string());
                lines.push(format!("{name}: {}", b.amount));
                shown += 1;
                if shown >= 10 {
                    break;
                }
            }
        }
        lines.join("\n")
    }

    async fn portfolio(&self, chat_id: i64) -> String {
        if !self.check_rate(chat_id, "portfolio", PORTFOLIO_COOLDOWN) {
            return "Easy — /portfolio is limited to once every 30s.".to_string();
        }
        let subs = self.store.subscriptions_for_chat(chat_id);
        if subs.is_empty() {
            return "Nothing tracked yet. Start with /track <address>.".to_string();
        }
        let mut lines = vec!["*Portfolio*".to_string()];
        let mut total: u64 = 0;
        for s in &subs {
            match self.rpc.balance(&s.address, true).await {
                Ok(sats) => {
                    total += sats;
                    lines.push(format!("{} — {} BTC", s.label, fmt_btc(sats)));
                }
                Err(e) => {
                    tracing::warn!("Portfolio balance failed for {}: {e:#}", s.address);
                    lines.push(format!("{} — unavailable", s.label));
                }
            }
        }
        lines.push(format!("*Total: {} BTC*", fmt_btc(total)));
        lines.join("\n")
    }

    fn watch(&self, chat_id: i64, args: &[&str]) -> String {
        let Some(contract) = args.first().map(|s| s.to_string()) else {
            return "Usage: /watch <contract> [label] [nft]".to_string();
        };
        let kind = if args.last() == Some(&"nft") {
            TokenKind::Nft
        } else {
            TokenKind::Fungible
        };
        let label_parts: &[&str] = match kind {
            TokenKind::Nft if args.len() > 2 => &args[1..args.len() - 1],
            TokenKind::Nft => &[],
            TokenKind::Fungible if args.len() > 1 => &args[1..],
            TokenKind::Fungible => &[],
        };
        let label = if label_parts.is_empty() {
            short(&contract).to_string()
        } else {
            label_parts.join(" ")
        };

        let watch = TokenWatch {
            id: new_short_id(),
            chat_id,
            contract: contract.clone(),
            label: label.clone(),
            kind,
            price_alert_percent: 0.0,
            min_reservation_sats: 0,
        };
        let id = watch.id.clone();
        match self.store.add_token_watch(watch) {
            Ok(()) => format!("👁 Watching `{contract}` as *{label}* (id `{id}`)."),
            Err(_) => format!("Already watching `{contract}`."),
        }
    }

    fn unwatch(&self, chat_id: i64, args: &[&str]) -> String {
        let Some(key) = args.first() else {
            return "Usage: /unwatch <id|contract>".to_string();
        };
        match self.store.remove_token_watch(chat_id, key) {
            Ok(Some(w)) => format!("Stopped watching *{}* (`{}`).", w.label, w.contract),
            Ok(None) => "No such token watch. See /list.".to_string(),
            Err(e) => internal(chat_id, "unwatch", e),
        }
    }

    fn alert(&self, chat_id: i64, args: &[&str]) -> String {
        let (Some(key), Some(pct)) = (args.first(), args.get(1)) else {
            return "Usage: /alert <id|contract> <percent>".to_string();
        };
        let Ok(percent) = pct.parse::<f64>() else {
            return "Percent must be a number, e.g. /alert abc123 5".to_string();
        };
        if !(0.0..=100.0).contains(&percent) {
            return "Percent must be between 0 and 100 (0 disables).".to_string();
        }
        match self.store.set_price_alert(chat_id, key, percent) {
            Ok(true) if percent == 0.0 => "Price alerts disabled.".to_string(),
            Ok(true) => format!("🔔 Alerting on moves of ±{percent}%."),
            Ok(false) => "No such token watch. See /list.".to_string(),
            Err(e) => internal(chat_id, "alert", e),
        }
    }

    async fn pool(&self, args: &[&str]) -> String {
        let Some(contract) = args.first() else {
            return "Usage: /pool <contract>".to_string();
        };
        let mut lines = vec![format!("*Pool* `{contract}`")];
        match self.indexer.listings(contract).await {
            Ok(listings) => {
                lines.push(format!(
                    "Providers: {} priority, {} standard",
                    listings.priority.count, listings.standard.count
                ));
            }
            Err(e) => {
                tracing::warn!("Listings query failed for {contract}: {e:#}");
                lines.push("Listings unavailable.".to_string());
            }
        }
        match self.indexer.prices(contract).await {
            Ok(prices) => {
                if let (Some(btc), Some(tok)) =
                    (prices.virtual_btc_reserve, prices.virtual_token_reserve)
                {
                    lines.push(format!("Reserves: {btc} sat / {tok} tokens"));
                }
                if let Some(last) = prices.history.last() {
                    lines.push(format!("Last move: {:+.2}%", last.percent_change));
                }
            }
            Err(e) => {
                tracing::warn!("Prices query failed for {contract}: {e:#}");
                lines.push("Prices unavailable.".to_string());
            }
        }
        if let Ok(page) = self.indexer.reservations("active", 100).await {
            let pending = page
                .reservations
                .iter()
                .filter(|r| r.contract == *contract)
                .count();
            if pending > 0 {
                lines.push(format!("Pending reservations: {pending}"));
            }
        }
        lines.join("\n")
    }
}

fn short(s: &str) -> &str {
    &s[..8.min(s.len())]
}

fn internal(chat_id: i64, command: &str, e: anyhow::Error) -> String {
    tracing::warn!(chat_id, command, "Command failed: {e:#}");
    "Something went wrong, try again.".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::indexer::{
        BalanceEntry, EventsBatch, ListingsResponse, PricesResponse, QueueInfo, TransfersPage,
    };
    use crate::rpc::{OwnerInfo, RpcBlock, RpcUtxo};
    use async_trait::async_trait;
    use chrono::Duration as ChronoDuration;

    struct FakeChain {
        /// address → identity hash returned by getPublicKeyInfo
        identities: HashMap<String, String>,
        balance: u64,
    }

    #[async_trait]
    impl ChainSource for FakeChain {
        async fn block_number(&self) -> anyhow::Result<u64> {
            Ok(0)
        }
        async fn block(&self, _height: u64) -> anyhow::Result<Option<RpcBlock>> {
            Ok(None)
        }
        async fn public_key_info(
            &self,
            address: &str,
            _include_public_key: bool,
        ) -> anyhow::Result<Option<OwnerInfo>> {
            Ok(self.identities.get(address).map(|hash| OwnerInfo {
                mldsa_hash: Some(hash.clone()),
                ..Default::default()
            }))
        }
        async fn balance(&self, _address: &str, _confirmed_only: bool) -> anyhow::Result<u64> {
            Ok(self.balance)
        }
        async fn csv1_for_address(&self, _owner: &str) -> anyhow::Result<Option<String>> {
            Ok(None)
        }
        async fn utxos(
            &self,
            _address: &str,
            _is_csv: bool,
            _merge_pending: bool,
        ) -> anyhow::Result<Vec<RpcUtxo>> {
            Ok(Vec::new())
        }
    }

    struct FakeIndexer;

    #[async_trait]
    impl EventSource for FakeIndexer {
        async fn events_since(&self, _since: u64) -> anyhow::Result<EventsBatch> {
            Ok(Default::default())
        }
        async fn balances(&self, _address: &str) -> anyhow::Result<Vec<BalanceEntry>> {
            Ok(vec![BalanceEntry {
                contract: "c1".into(),
                amount: "1000".into(),
                symbol: Some("TOK".into()),
                decimals: None,
            }])
        }
        async fn listings(&self, _contract: &str) -> anyhow::Result<ListingsResponse> {
            Ok(ListingsResponse {
                priority: QueueInfo { count: 3 },
                standard: QueueInfo { count: 12 },
            })
        }
        async fn prices(&self, _contract: &str) -> anyhow::Result<PricesResponse> {
            Ok(Default::default())
        }
        async fn transfers(
            &self,
            _mldsa_hash: &str,
            _limit: usize,
            _skip: usize,
        ) -> anyhow::Result<TransfersPage> {
            Ok(Default::default())
        }
        async fn reservations(
            &self,
            _status: &str,
            _limit: usize,
        ) -> anyhow::Result<crate::indexer::ReservationsPage> {
            Ok(Default::default())
        }
    }

    fn handler_with(identities: &[(&str, &str)]) -> CommandHandler {
        let store = Store::open_in_memory().unwrap();
        store.authorize_chat(7).unwrap();
        let mut cfg = Config::default();
        cfg.bot_password = Some("hunter2".into());
        cfg.max_wallets_per_user = 3;
        CommandHandler::new(
            store,
            Arc::new(FakeChain {
                identities: identities
                    .iter()
                    .map(|(a, h)| (a.to_string(), h.to_string()))
                    .collect(),
                balance: 150_000_000,
            }),
            Arc::new(FakeIndexer),
            cfg,
        )
    }

    #[tokio::test]
    async fn unauthorized_chat_is_gated() {
        let handler = handler_with(&[]);
        let reply = handler.handle(99, "/track bcrt1qsomewallet").await.unwrap();
        assert!(reply.contains("Not authorized"), "{reply}");
    }

    #[tokio::test]
    async fn auth_with_password() {
        let handler = handler_with(&[]);
        let wrong = handler.handle(99, "/auth nope").await.unwrap();
        assert!(wrong.contains("Wrong password"));
        let right = handler.handle(99, "/auth hunter2").await.unwrap();
        assert!(right.contains("Authorized"));
        assert!(handler.store.is_authorized(99));
    }

    #[tokio::test]
    async fn track_and_list() {
        let handler = handler_with(&[("bcrt1qwalletx", "aa11")]);
        let reply = handler
            .handle(7, "/track bcrt1qwalletx savings")
            .await
            .unwrap();
        assert!(reply.contains("Tracking"), "{reply}");
        assert!(reply.contains("savings"), "{reply}");

        let list = handler.handle(7, "/list").await.unwrap();
        assert!(list.contains("bcrt1qwalletx"), "{list}");
        assert!(list.contains("savings"), "{list}");
    }

    #[tokio::test]
    async fn cross_format_duplicate_rejected() {
        // Track by bech32 address, then try again under the identity hash.
        let handler = handler_with(&[("bcrt1qwalletx", "aa11"), ("0xaa11", "AA11")]);
        handler
            .handle(7, "/track bcrt1qwalletx savings")
            .await
            .unwrap();
        let reply = handler.handle(7, "/track 0xaa11").await.unwrap();
        assert!(reply.contains("Already tracking this wallet"), "{reply}");
        assert!(reply.contains("bcrt1qwalletx"), "{reply}");
        assert_eq!(handler.store.subscription_count(7), 1);
    }

    #[tokio::test]
    async fn wallet_limit_enforced() {
        let handler = handler_with(&[]);
        for i in 0..3 {
            let reply = handler
                .handle(7, &format!("/track bcrt1qwallet{i}"))
                .await
                .unwrap();
            assert!(reply.contains("Tracking"), "{reply}");
        }
        let over = handler.handle(7, "/track bcrt1qwallet99").await.unwrap();
        assert!(over.contains("limit"), "{over}");
    }

    #[tokio::test]
    async fn untrack_by_id() {
        let handler = handler_with(&[]);
        handler.handle(7, "/track bcrt1qwalletx w").await.unwrap();
        let id = handler.store.subscriptions_for_chat(7)[0].id.clone();
        let reply = handler.handle(7, &format!("/untrack {id}")).await.unwrap();
        assert!(reply.contains("Stopped tracking"), "{reply}");
        assert_eq!(handler.store.subscription_count(7), 0);
    }

    #[tokio::test]
    async fn balance_rate_limited() {
        let handler = handler_with(&[]);
        handler.handle(7, "/track bcrt1qwalletx w").await.unwrap();
        let first = handler.handle(7, "/balance bcrt1qwalletx").await.unwrap();
        assert!(first.contains("BTC: 1.5000"), "{first}");
        let second = handler.handle(7, "/balance bcrt1qwalletx").await.unwrap();
        assert!(second.contains("limited"), "{second}");
    }

    #[tokio::test]
    async fn redeem_bad_format_rejected() {
        let handler = handler_with(&[]);
        let reply = handler.handle(7, "/redeem nope").await.unwrap();
        assert!(reply.contains("access code"), "{reply}");
    }

    #[tokio::test]
    async fn redeem_activates() {
        let handler = handler_with(&[]);
        handler
            .store
            .insert_access_code(AccessCode {
                code: "JT-CMD123456789".into(),
                funding_tx: None,
                redeemed: false,
                redeemed_by: None,
                code_expires_at: Utc::now() + ChronoDuration::days(1),
                duration_days: 30,
            })
            .unwrap();
        let reply = handler.handle(55, "/redeem jt-cmd123456789").await.unwrap();
        assert!(reply.contains("active until"), "{reply}");
        assert!(handler.store.has_active_subscription(55, Utc::now()));
    }

    #[tokio::test]
    async fn watch_alert_and_pool() {
        let handler = handler_with(&[]);
        let reply = handler.handle(7, "/watch contractabc mytoken").await.unwrap();
        assert!(reply.contains("Watching"), "{reply}");

        let id = handler.store.watches_for_chat(7)[0].id.clone();
        let alert = handler.handle(7, &format!("/alert {id} 5")).await.unwrap();
        assert!(alert.contains("±5%"), "{alert}");

        let pool = handler.handle(7, "/pool contractabc").await.unwrap();
        assert!(pool.contains("3 priority, 12 standard"), "{pool}");
    }

    #[tokio::test]
    async fn non_command_text_ignored() {
        let handler = handler_with(&[]);
        assert!(handler.handle(7, "hello there").await.is_none());
    }
}
