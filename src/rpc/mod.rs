use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use serde_json::{json, Value};

/// JSON-RPC client for the chain node.
pub struct OpRpc {
    url: String,
    client: Client,
}

impl OpRpc {
    pub fn new(url: &str) -> Self {
        let client = Client::builder()
            .timeout(Duration::from_secs(15))
            .build()
            .expect("reqwest client");
        Self {
            url: url.trim_end_matches('/').to_string(),
            client,
        }
    }

    pub async fn call(&self, method: &str, params: Value) -> Result<Value, RpcError> {
        let body = json!({
            "jsonrpc": "2.0",
            "id": 1,
            "method": method,
            "params": params,
        });

        let resp = self
            .client
            .post(&self.url)
            .header("Content-Type", "application/json")
            .json(&body)
            .send()
            .await
            .map_err(RpcError::Http)?;

        let json: Value = resp.json().await.map_err(RpcError::Http)?;

        if let Some(err) = json.get("error").filter(|e| !e.is_null()) {
            return Err(RpcError::Rpc(err.clone()));
        }

        Ok(json.get("result").cloned().unwrap_or(Value::Null))
    }
}

#[derive(Debug)]
pub enum RpcError {
    Http(reqwest::Error),
    Rpc(Value),
    Decode(String),
}

impl std::fmt::Display for RpcError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RpcError::Http(e) => write!(f, "HTTP error: {e}"),
            RpcError::Rpc(e) => write!(f, "RPC error: {e}"),
            RpcError::Decode(e) => write!(f, "decode error: {e}"),
        }
    }
}

impl std::error::Error for RpcError {}

/// Accept a satoshi amount as either a JSON number or a decimal string.
pub fn flex_u64(v: &Value) -> Option<u64> {
    match v {
        Value::Number(n) => n.as_u64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

mod flex {
    use serde::{Deserialize, Deserializer};
    use serde_json::Value;

    pub fn u64_field<'de, D: Deserializer<'de>>(d: D) -> Result<u64, D::Error> {
        let v = Value::deserialize(d)?;
        super::flex_u64(&v).ok_or_else(|| serde::de::Error::custom("expected u64 or decimal string"))
    }
}

/// One input of a block transaction. Some networks expose inputs without
/// address data; spend detection then relies entirely on the stored UTXO map.
#[derive(Debug, Clone, Deserialize, PartialEq, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct RpcInput {
    pub original_transaction_id: Option<String>,
    pub output_transaction_index: Option<u32>,
    pub address: Option<String>,
}

#[derive(Debug, Clone, Deserialize, PartialEq, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct ScriptPubKey {
    pub address: Option<String>,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RpcOutput {
    #[serde(default)]
    pub script_pub_key: ScriptPubKey,
    #[serde(deserialize_with = "flex::u64_field")]
    pub value: u64,
    pub index: u32,
}

#[derive(Debug, Clone, Deserialize, PartialEq, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct RpcTransaction {
    pub hash: String,
    pub inputs: Vec<RpcInput>,
    pub outputs: Vec<RpcOutput>,
    pub from: Option<String>,
}

#[derive(Debug, Clone, Deserialize, PartialEq, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct RpcBlock {
    pub height: u64,
    pub transactions: Vec<RpcTransaction>,
}

/// Owner-info record for an address; the source of every derivable form.
#[derive(Debug, Clone, Deserialize, PartialEq, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct OwnerInfo {
    pub mldsa_hash: Option<String>,
    pub tweaked_public_key: Option<String>,
    /// Original public key. Only present when requested and on chain.
    pub public_key: Option<String>,
    pub p2op: Option<String>,
    pub p2tr: Option<String>,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RpcUtxo {
    pub transaction_id: String,
    pub output_index: u32,
    #[serde(deserialize_with = "flex::u64_field")]
    pub value: u64,
}

/// The chain operations the pipeline consumes. Seam for tests.
#[async_trait]
pub trait ChainSource: Send + Sync {
    async fn block_number(&self) -> anyhow::Result<u64>;
    async fn block(&self, height: u64) -> anyhow::Result<Option<RpcBlock>>;
    async fn public_key_info(
        &self,
        address: &str,
        include_public_key: bool,
    ) -> anyhow::Result<Option<OwnerInfo>>;
    async fn balance(&self, address: &str, confirmed_only: bool) -> anyhow::Result<u64>;
    async fn csv1_for_address(&self, owner: &str) -> anyhow::Result<Option<String>>;
    async fn utxos(
        &self,
        address: &str,
        is_csv: bool,
        merge_pending: bool,
    ) -> anyhow::Result<Vec<RpcUtxo>>;
}

#[async_trait]
impl ChainSource for OpRpc {
    async fn block_number(&self) -> anyhow::Result<u64> {
        let v = self.call("getBlockNumber", json!([])).await?;
        flex_u64(&v).ok_or_else(|| RpcError::Decode(format!("block number: {v}")).into())
    }

    async fn block(&self, height: u64) -> anyhow::Result<Option<RpcBlock>> {
        let v = self.call("getBlock", json!([height, true])).await?;
        if v.is_null() {
            return Ok(None);
        }
        let block: RpcBlock =
            serde_json::from_value(v).map_err(|e| RpcError::Decode(format!("block: {e}")))?;
        Ok(Some(block))
    }

    async fn public_key_info(
        &self,
        address: &str,
        include_public_key: bool,
    ) -> anyhow::Result<Option<OwnerInfo>> {
        let v = self
            .call("getPublicKeyInfo", json!([address, include_public_key]))
            .await?;
        if v.is_null() {
            return Ok(None);
        }
        let info: OwnerInfo =
            serde_json::from_value(v).map_err(|e| RpcError::Decode(format!("owner info: {e}")))?;
        Ok(Some(info))
    }

    async fn balance(&self, address: &str, confirmed_only: bool) -> anyhow::Result<u64> {
        let v = self.call("getBalance", json!([address, confirmed_only])).await?;
        flex_u64(&v).ok_or_else(|| RpcError::Decode(format!("balance: {v}")).into())
    }

    async fn csv1_for_address(&self, owner: &str) -> anyhow::Result<Option<String>> {
        let v = self.call("getCSV1ForAddress", json!([owner])).await?;
        Ok(v.get("address").and_then(|a| a.as_str()).map(String::from))
    }

    async fn utxos(
        &self,
        address: &str,
        is_csv: bool,
        merge_pending: bool,
    ) -> anyhow::Result<Vec<RpcUtxo>> {
        let v = self
            .call(
                "utxoManager.getUTXOs",
                json!([{
                    "address": address,
                    "isCSV": is_csv,
                    "mergePendingUTXOs": merge_pending,
                }]),
            )
            .await?;
        if v.is_null() {
            return Ok(Vec::new());
        }
        let utxos: Vec<RpcUtxo> =
            serde_json::from_value(v).map_err(|e| RpcError::Decode(format!("utxos: {e}")))?;
        Ok(utxos)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flex_u64_accepts_number_and_string() {
        assert_eq!(flex_u64(&json!(42)), Some(42));
        assert_eq!(flex_u64(&json!("42")), Some(42));
        assert_eq!(flex_u64(&json!(" 42 ")), Some(42));
        assert_eq!(flex_u64(&json!(-1)), None);
        assert_eq!(flex_u64(&json!(null)), None);
    }

    #[test]
    fn block_decodes_with_partial_inputs() {
        let raw = json!({
            "height": 100,
            "transactions": [{
                "hash": "t1",
                "inputs": [
                    {"originalTransactionId": "t0", "outputTransactionIndex": 0},
                    {}
                ],
                "outputs": [
                    {"scriptPubKey": {"address": "bcrt1qa"}, "value": "300000", "index": 0},
                    {"scriptPubKey": {}, "value": 199500, "index": 1}
                ]
            }]
        });
        let block: RpcBlock = serde_json::from_value(raw).unwrap();
        let tx = &block.transactions[0];
        assert_eq!(tx.inputs[0].original_transaction_id.as_deref(), Some("t0"));
        assert_eq!(tx.inputs[1].original_transaction_id, None);
        assert_eq!(tx.outputs[0].value, 300_000);
        assert_eq!(tx.outputs[1].value, 199_500);
        assert_eq!(tx.outputs[1].script_pub_key.address, None);
    }

    #[test]
    fn owner_info_tolerates_missing_forms() {
        let raw = json!({"mldsaHash": "0xAA11", "p2op": "op1qxyz"});
        let info: OwnerInfo = serde_json::from_value(raw).unwrap();
        assert_eq!(info.mldsa_hash.as_deref(), Some("0xAA11"));
        assert_eq!(info.public_key, None);
        assert_eq!(info.p2tr, None);
    }
}
