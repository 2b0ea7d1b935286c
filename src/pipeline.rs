use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::config::Network;
use crate::events::{EventKind, WalletEvent};
use crate::indexer::EventSource;
use crate::matcher;
use crate::notifier::{ChatSink, Notifier};
use crate::rpc::{ChainSource, RpcBlock};
use crate::scanner;
use crate::store::Store;
use crate::{identity, utxo};

/// Blocks fetched concurrently per chunk; also the fan-out bound.
const BLOCK_BATCH: u64 = 10;

/// Session-scoped cap on remembered tx hashes. Restart tolerance is the
/// cursor's job, not this set's.
const NOTIFIED_CAP: usize = 1000;

/// Bounded set of already-notified tx hashes; oldest pruned on overflow.
pub struct NotifiedLru {
    set: HashSet<String>,
    order: VecDeque<String>,
    cap: usize,
}

impl NotifiedLru {
    pub fn new(cap: usize) -> Self {
        Self {
            set: HashSet::new(),
            order: VecDeque::new(),
            cap,
        }
    }

    pub fn contains(&self, tx_hash: &str) -> bool {
        self.set.contains(tx_hash)
    }

    pub fn insert(&mut self, tx_hash: &str) {
        if !self.set.insert(tx_hash.to_string()) {
            return;
        }
        self.order.push_back(tx_hash.to_string());
        while self.order.len() > self.cap {
            if let Some(oldest) = self.order.pop_front() {
                self.set.remove(&oldest);
            }
        }
    }

    pub fn len(&self) -> usize {
        self.set.len()
    }
}

/// The per-tick driver. Owns the session LRU and the notifier; everything
/// else is injected at startup.
pub struct Pipeline<C, E, S>
where
    C: ChainSource + 'static,
    E: EventSource,
    S: ChatSink,
{
    store: Store,
    rpc: Arc<C>,
    indexer: E,
    notifier: Notifier<S>,
    network: Network,
    poll_interval: Duration,
    notified: NotifiedLru,
}

impl<C, E, S> Pipeline<C, E, S>
where
    C: ChainSource + 'static,
    E: EventSource,
    S: ChatSink,
{
    pub fn new(
        store: Store,
        rpc: Arc<C>,
        indexer: E,
        notifier: Notifier<S>,
        network: Network,
        poll_interval: Duration,
    ) -> Self {
        Self {
            store,
            rpc,
            indexer,
            notifier,
            network,
            poll_interval,
            notified: NotifiedLru::new(NOTIFIED_CAP),
        }
    }

    /// Poll until the shutdown signal flips. Ticks never overlap; a failed
    /// tick leaves the cursor untouched and the next interval retries.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.poll_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        info!(interval_ms = self.poll_interval.as_millis() as u64, "Pipeline started");

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.tick().await {
                        warn!("Tick failed, cursor not advanced: {e:#}");
                    }
                }
                _ = shutdown.changed() => {
                    info!("Shutdown signal received, pipeline stopping");
                    break;
                }
            }
        }
    }

    pub async fn tick(&mut self) -> anyhow::Result<()> {
        // 1. Cursor and indexer batch. No new indexed blocks means no work.
        let cursor = self.store.cursor();
        let since = cursor.saturating_add(1).max(1);
        let batch = self.indexer.events_since(since).await?;
        let target = batch.last_indexed_block;
        if cursor >= target {
            debug!(cursor, target, "Nothing to scan");
            return Ok(());
        }

        // 2. Fill identity gaps, then seed UTXO sets for unseen primaries.
        for primary in self.store.unresolved_primaries() {
            match identity::resolve(self.rpc.as_ref(), self.network, &primary).await {
                Ok(Some(linkage)) => {
                    info!(%primary, hash = %linkage.mldsa_hash, "Identity resolved");
                    self.store.update_linkage(&primary, &linkage)?;
                }
                Ok(None) => debug!(%primary, "No owner record on chain yet"),
                Err(e) => debug!(%primary, "Resolver failed, will retry: {e:#}"),
            }
        }
        let proj = self.store.identity_projection();
        for primary in self.store.tracked_primaries() {
            if !self.store.is_seeded(&primary) {
                let linkage = self.store.linkage_for_address(&primary);
                utxo::seed(self.rpc.as_ref(), &self.store, &primary, linkage.as_ref()).await?;
            }
        }

        // 3. Project the indexer batch.
        let nft_contracts = self.store.nft_contracts();
        let watches = self.store.all_token_watches();
        let matched = matcher::match_batch(&batch, &proj, &nft_contracts, &watches);
        for (primary, contract, is_nft) in &matched.seen {
            self.store.record_seen_contract(primary, contract, *is_nft)?;
        }

        // 4. Scan blocks cursor+1..=target in chunks, applying each block's
        // UTXO delta so later chunks see earlier spends and receives.
        let mut utxo_map = self.store.utxo_map();
        let mut btc_events = Vec::new();
        let mut inferred = Vec::new();
        let mut start = cursor + 1;
        while start <= target {
            let end = (start + BLOCK_BATCH - 1).min(target);
            let mut fetches: JoinSet<(u64, anyhow::Result<Option<RpcBlock>>)> = JoinSet::new();
            for height in start..=end {
                let rpc = Arc::clone(&self.rpc);
                fetches.spawn(async move { (height, rpc.block(height).await) });
            }
            let mut blocks = Vec::with_capacity((end - start + 1) as usize);
            while let Some(joined) = fetches.join_next().await {
                let (height, fetched) = joined?;
                match fetched? {
                    Some(block) => blocks.push((height, block)),
                    None => anyhow::bail!("block {height} not available from RPC"),
                }
            }
            blocks.sort_by_key(|(h, _)| *h);

            for (height, block) in &blocks {
                let out = scanner::scan_block(block, *height, &proj, &utxo_map);
                utxo::apply_delta(&self.store, &mut utxo_map, &out.spent, &out.received)?;
                btc_events.extend(out.events);
                inferred.extend(out.inferred);
            }
            start = end + 1;
        }

        // 5. Promote inferred sends the UTXO path did not catch.
        let confirmed_sends: HashSet<String> = btc_events
            .iter()
            .filter(|e| matches!(e.kind, EventKind::BtcSent { .. }))
            .map(|e| e.tx_hash.clone())
            .collect();
        for inf in inferred {
            if confirmed_sends.contains(&inf.tx_hash) {
                continue;
            }
            btc_events.push(WalletEvent {
                address: inf.address,
                tx_hash: inf.tx_hash,
                block_height: inf.block_height,
                kind: EventKind::BtcSent {
                    satoshis: inf.total_sent,
                    counterparty: Some(inf.counterparty),
                    recipient_amount: Some(inf.counterparty_amount),
                },
            });
        }

        // 6. Merge both sources and drop cross-source duplicates.
        let mut events = matched.events;
        events.extend(btc_events);
        let mut seen_keys = HashSet::new();
        events.retain(|e| seen_keys.insert(e.dedup_key()));

        // 7. Suppress BTC plumbing where contract semantics already tell the
        // story: swaps, reservations, pool and staking activity, and
        // OP20↔OP20 trades (token in + out in one block).
        let mut suppress: HashSet<(String, u64)> = events
            .iter()
            .filter(|e| e.kind.suppresses_btc())
            .map(|e| (e.address.clone(), e.block_height))
            .collect();
        let mut directions: HashMap<(String, u64), (bool, bool)> = HashMap::new();
        for e in &events {
            if let Some(direction) = e.kind.direction() {
                let entry = directions
                    .entry((e.address.clone(), e.block_height))
                    .or_default();
                match direction {
                    crate::events::Direction::In => entry.0 = true,
                    crate::events::Direction::Out => entry.1 = true,
                }
            }
        }
        suppress.extend(
            directions
                .into_iter()
                .filter(|(_, (has_in, has_out))| *has_in && *has_out)
                .map(|(key, _)| key),
        );
        events.retain(|e| {
            !e.kind.is_btc() || !suppress.contains(&(e.address.clone(), e.block_height))
        });

        // Strict block-height order across the tick.
        events.sort_by_key(|e| e.block_height);

        // 8. Session tx-hash dedup.
        let mut fresh = Vec::new();
        let mut fresh_txs: HashSet<String> = HashSet::new();
        for event in events {
            if self.notified.contains(&event.tx_hash) {
                continue;
            }
            fresh_txs.insert(event.tx_hash.clone());
            fresh.push(event);
        }

        // 9. Dispatch events and alerts.
        let messages = self.notifier.dispatch(&fresh).await?;
        for tx in &fresh_txs {
            self.notified.insert(tx);
        }
        self.notifier
            .dispatch_price_alerts(&matched.price_alerts)
            .await?;
        self.notifier
            .dispatch_reservation_alerts(&matched.reservation_alerts)
            .await?;

        // 10. Commit. Everything above re-runs idempotently if this fails.
        self.store.set_cursor(target)?;
        info!(
            cursor = target,
            events = fresh.len(),
            messages,
            "Tick complete"
        );
        Ok(())
    }
}
