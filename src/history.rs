use std::sync::Arc;

use crate::indexer::EventSource;
use crate::store::Store;

const PAGE: usize = 100;
/// Safety bound on pagination; identities with deeper history are truncated.
const MAX_PAGES: usize = 50;

/// Fire-and-forget background scan for a newly tracked identity: walk its
/// prior transfers and seed the seen-contract set. Failures are logged and
/// dropped; the next track of the same identity retries.
pub fn spawn_scan(
    indexer: Arc<dyn EventSource>,
    store: Store,
    primary: String,
    mldsa_hash: String,
) {
    tokio::spawn(async move {
        if store.is_history_scanned(&primary) {
            return;
        }
        match scan(indexer.as_ref(), &store, &primary, &mldsa_hash).await {
            Ok(contracts) => {
                tracing::info!(%primary, contracts, "Historical scan complete");
            }
            Err(e) => tracing::warn!(%primary, "Historical scan failed: {e:#}"),
        }
    });
}

pub async fn scan(
    indexer: &dyn EventSource,
    store: &Store,
    primary: &str,
    mldsa_hash: &str,
) -> anyhow::Result<usize> {
    let mut skip = 0;
    let mut recorded = 0;
    loop {
        let page = indexer.transfers(mldsa_hash, PAGE, skip).await?;
        if page.transfers.is_empty() {
            break;
        }
        for t in &page.transfers {
            store.record_seen_contract(primary, &t.contract, t.is_nft)?;
            recorded += 1;
        }
        if page.transfers.len() < PAGE {
            break;
        }
        skip += PAGE;
        if skip >= PAGE * MAX_PAGES {
            tracing::warn!(primary, "Historical scan truncated at {skip} transfers");
            break;
        }
    }
    store.mark_history_scanned(primary)?;
    Ok(recorded)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::indexer::{
        BalanceEntry, EventsBatch, ListingsResponse, PricesResponse, TransferRecord, TransfersPage,
    };
    use async_trait::async_trait;

    struct PagedIndexer {
        transfers: Vec<TransferRecord>,
    }

    #[async_trait]
    impl EventSource for PagedIndexer {
        async fn events_since(&self, _since: u64) -> anyhow::Result<EventsBatch> {
            Ok(Default::default())
        }
        async fn balances(&self, _address: &str) -> anyhow::Result<Vec<BalanceEntry>> {
            Ok(Vec::new())
        }
        async fn listings(&self, _contract: &str) -> anyhow::Result<ListingsResponse> {
            Ok(Default::default())
        }
        async fn prices(&self, _contract: &str) -> anyhow::Result<PricesResponse> {
            Ok(Default::default())
        }
        async fn transfers(
            &self,
            _mldsa_hash: &str,
            limit: usize,
            skip: usize,
        ) -> anyhow::Result<TransfersPage> {
            Ok(TransfersPage {
                transfers: self
                    .transfers
                    .iter()
                    .skip(skip)
                    .take(limit)
                    .cloned()
                    .collect(),
            })
        }
        async fn reservations(
            &self,
            _status: &str,
            _limit: usize,
        ) -> anyhow::Result<crate::indexer::ReservationsPage> {
            Ok(Default::default())
        }
    }

    fn transfer(contract: &str, is_nft: bool) -> TransferRecord {
        TransferRecord {
            tx_hash: "h".into(),
            block_height: 1,
            contract: contract.into(),
            from: "a".into(),
            to: "b".into(),
            value: "1".into(),
            is_nft,
        }
    }

    #[tokio::test]
    async fn scan_seeds_seen_contracts_across_pages() {
        let store = crate::store::Store::open_in_memory().unwrap();
        let mut transfers = Vec::new();
        for i in 0..150 {
            transfers.push(transfer(&format!("c{}", i % 3), false));
        }
        transfers.push(transfer("c-nft", true));
        let indexer = PagedIndexer { transfers };

        let n = scan(&indexer, &store, "op1qa", "aa11").await.unwrap();
        assert_eq!(n, 151);
        assert_eq!(
            store.seen_contracts("op1qa"),
            vec!["c-nft", "c0", "c1", "c2"]
        );
        assert!(store.nft_contracts().contains("c-nft"));
        assert!(store.is_history_scanned("op1qa"));
    }
}
