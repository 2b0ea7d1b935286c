use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;

/// A typed event batch from `/events?since=K`. Amounts arrive as decimal
/// strings; hashes are lowercase hex with or without 0x. Optional record
/// groups default to empty so older indexer versions still decode.
#[derive(Debug, Clone, Deserialize, Default, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct EventsBatch {
    pub last_indexed_block: u64,
    pub since: u64,
    pub transfers: Vec<TransferRecord>,
    pub reservations: Vec<ReservationRecord>,
    pub swaps: Vec<SwapRecord>,
    pub price_changes: Vec<PriceChangeRecord>,
    pub pool_events: Vec<PoolEventRecord>,
    pub staking_events: Vec<StakingEventRecord>,
}

#[derive(Debug, Clone, Deserialize, Default, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct TransferRecord {
    pub tx_hash: String,
    pub block_height: u64,
    pub contract: String,
    pub from: String,
    pub to: String,
    pub value: String,
    /// Set by the indexer for contracts it knows to be NFT collections.
    pub is_nft: bool,
}

#[derive(Debug, Clone, Deserialize, Default, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct ReservationRecord {
    pub tx_hash: String,
    pub block_height: u64,
    pub contract: String,
    /// Identity hash of the liquidity provider (seller side).
    pub provider_mldsa: String,
    /// Buyer side; may be an identity hash or a BTC address.
    pub buyer_address: String,
    pub satoshis: String,
    pub token_amount: String,
}

#[derive(Debug, Clone, Deserialize, Default, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct SwapRecord {
    pub tx_hash: String,
    pub block_height: u64,
    pub contract: String,
    pub buyer: String,
    pub btc_spent: String,
    pub tokens_received: String,
    /// Identity hashes of the providers whose liquidity was consumed.
    pub providers: Vec<String>,
}

#[derive(Debug, Clone, Deserialize, Default, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct PriceChangeRecord {
    pub contract: String,
    pub block_height: u64,
    pub percent_change: f64,
    pub price: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Default, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct PoolEventRecord {
    pub tx_hash: String,
    pub block_height: u64,
    pub contract: String,
    pub provider: String,
    /// "added" or "removed".
    pub kind: String,
    pub token_amount: String,
    pub satoshis: String,
}

#[derive(Debug, Clone, Deserialize, Default, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct StakingEventRecord {
    pub tx_hash: String,
    pub block_height: u64,
    pub contract: String,
    pub staker: String,
    /// "staked", "unstaked" or "claimed".
    pub kind: String,
    pub amount: String,
}

#[derive(Debug, Clone, Deserialize, Default, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct BalanceEntry {
    pub contract: String,
    pub amount: String,
    pub symbol: Option<String>,
    pub decimals: Option<u8>,
}

#[derive(Debug, Clone, Deserialize, Default, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct QueueInfo {
    pub count: u64,
}

/// NativeSwap provider queues for one contract.
#[derive(Debug, Clone, Deserialize, Default, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct ListingsResponse {
    pub priority: QueueInfo,
    pub standard: QueueInfo,
}

#[derive(Debug, Clone, Deserialize, Default, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct PricesResponse {
    pub virtual_btc_reserve: Option<String>,
    pub virtual_token_reserve: Option<String>,
    pub history: Vec<PriceChangeRecord>,
}

#[derive(Debug, Clone, Deserialize, Default, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct TransfersPage {
    pub transfers: Vec<TransferRecord>,
}

#[derive(Debug, Clone, Deserialize, Default, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct ReservationsPage {
    pub reservations: Vec<ReservationRecord>,
}

/// Parse a decimal-string token amount. Returns None on malformed input; the
/// matcher skips those records rather than failing the tick.
pub fn parse_amount(s: &str) -> Option<u128> {
    s.trim().parse().ok()
}

/// Same, for satoshi fields.
pub fn parse_sats(s: &str) -> Option<u64> {
    s.trim().parse().ok()
}

#[derive(Debug)]
pub enum IndexerError {
    Http(reqwest::Error),
    Status(u16),
}

impl std::fmt::Display for IndexerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            IndexerError::Http(e) => write!(f, "HTTP error: {e}"),
            IndexerError::Status(s) => write!(f, "indexer returned status {s}"),
        }
    }
}

impl std::error::Error for IndexerError {}

/// The indexer operations the pipeline and commands consume. Seam for tests.
#[async_trait]
pub trait EventSource: Send + Sync {
    async fn events_since(&self, since: u64) -> anyhow::Result<EventsBatch>;
    async fn balances(&self, address: &str) -> anyhow::Result<Vec<BalanceEntry>>;
    async fn listings(&self, contract: &str) -> anyhow::Result<ListingsResponse>;
    async fn prices(&self, contract: &str) -> anyhow::Result<PricesResponse>;
    async fn transfers(
        &self,
        mldsa_hash: &str,
        limit: usize,
        skip: usize,
    ) -> anyhow::Result<TransfersPage>;
    async fn reservations(&self, status: &str, limit: usize) -> anyhow::Result<ReservationsPage>;
}

#[async_trait]
impl<T: EventSource + ?Sized> EventSource for std::sync::Arc<T> {
    async fn events_since(&self, since: u64) -> anyhow::Result<EventsBatch> {
        (**self).events_since(since).await
    }
    async fn balances(&self, address: &str) -> anyhow::Result<Vec<BalanceEntry>> {
        (**self).balances(address).await
    }
    async fn listings(&self, contract: &str) -> anyhow::Result<ListingsResponse> {
        (**self).listings(contract).await
    }
    async fn prices(&self, contract: &str) -> anyhow::Result<PricesResponse> {
        (**self).prices(contract).await
    }
    async fn transfers(
        &self,
        mldsa_hash: &str,
        limit: usize,
        skip: usize,
    ) -> anyhow::Result<TransfersPage> {
        (**self).transfers(mldsa_hash, limit, skip).await
    }
    async fn reservations(&self, status: &str, limit: usize) -> anyhow::Result<ReservationsPage> {
        (**self).reservations(status, limit).await
    }
}

/// REST client for the indexer HTTP API.
pub struct IndexerClient {
    base: String,
    client: Client,
}

impl IndexerClient {
    pub fn new(base_url: &str) -> Self {
        let client = Client::builder()
            .timeout(Duration::from_secs(20))
            .build()
            .expect("reqwest client");
        Self {
            base: base_url.trim_end_matches('/').to_string(),
            client,
        }
    }

    async fn get_json<T: serde::de::DeserializeOwned>(&self, path: &str) -> Result<T, IndexerError> {
        let resp = self
            .client
            .get(format!("{}{path}", self.base))
            .send()
            .await
            .map_err(IndexerError::Http)?;
        if !resp.status().is_success() {
            return Err(IndexerError::Status(resp.status().as_u16()));
        }
        resp.json().await.map_err(IndexerError::Http)
    }
}

#[async_trait]
impl EventSource for IndexerClient {
    async fn events_since(&self, since: u64) -> anyhow::Result<EventsBatch> {
        Ok(self.get_json(&format!("/events?since={since}")).await?)
    }

    async fn balances(&self, address: &str) -> anyhow::Result<Vec<BalanceEntry>> {
        Ok(self.get_json(&format!("/balances/{address}")).await?)
    }

    async fn listings(&self, contract: &str) -> anyhow::Result<ListingsResponse> {
        Ok(self.get_json(&format!("/listings/{contract}")).await?)
    }

    async fn prices(&self, contract: &str) -> anyhow::Result<PricesResponse> {
        Ok(self.get_json(&format!("/prices/{contract}")).await?)
    }

    async fn transfers(
        &self,
        mldsa_hash: &str,
        limit: usize,
        skip: usize,
    ) -> anyhow::Result<TransfersPage> {
        Ok(self
            .get_json(&format!("/transfers/{mldsa_hash}?limit={limit}&skip={skip}"))
            .await?)
    }

    async fn reservations(&self, status: &str, limit: usize) -> anyhow::Result<ReservationsPage> {
        Ok(self
            .get_json(&format!("/reservations?status={status}&limit={limit}"))
            .await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn batch_decodes_without_optional_groups() {
        let raw = serde_json::json!({
            "lastIndexedBlock": 200,
            "since": 101,
            "transfers": [{
                "txHash": "0xAA",
                "blockHeight": 150,
                "contract": "c1",
                "from": "0xdead",
                "to": "0xbeef",
                "value": "1000000000000"
            }],
            "reservations": [],
            "swaps": [],
            "priceChanges": []
        });
        let batch: EventsBatch = serde_json::from_value(raw).unwrap();
        assert_eq!(batch.last_indexed_block, 200);
        assert_eq!(batch.transfers.len(), 1);
        assert!(batch.pool_events.is_empty());
        assert!(batch.staking_events.is_empty());
    }

    #[test]
    fn amount_parsing_is_tolerant() {
        assert_eq!(parse_amount("1000000000000"), Some(1_000_000_000_000));
        assert_eq!(parse_amount(" 5 "), Some(5));
        assert_eq!(parse_amount("1e12"), None);
        assert_eq!(parse_amount("-3"), None);
        assert_eq!(parse_sats("50000"), Some(50_000));
        assert_eq!(parse_sats("abc"), None);
    }
}
