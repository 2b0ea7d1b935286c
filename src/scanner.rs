use std::collections::{HashMap, HashSet};

use crate::events::{EventKind, InferredSend, WalletEvent};
use crate::rpc::{RpcBlock, RpcTransaction};
use crate::store::models::{IdentityProjection, StoredUtxo, UtxoEntry};

/// Result of scanning one block against the tracked wallet set.
///
/// `received` and `spent` are already netted: an output created and spent
/// within the same block emits both events but appears in neither delta, and
/// `spent` only lists keys that exist in the caller's UTXO map.
#[derive(Debug, Default)]
pub struct ScanOutput {
    pub events: Vec<WalletEvent>,
    pub received: Vec<StoredUtxo>,
    pub spent: Vec<(String, u32)>,
    pub inferred: Vec<InferredSend>,
}

/// Scan a block's transactions for tracked UTXO spends, receives to tracked
/// addresses, and inferred sends. Pure with respect to its inputs; the
/// orchestrator applies the returned delta.
pub fn scan_block(
    block: &RpcBlock,
    height: u64,
    proj: &IdentityProjection,
    utxo_map: &HashMap<(String, u32), UtxoEntry>,
) -> ScanOutput {
    let mut out = ScanOutput::default();
    // Overlay over utxo_map so later txs in this block see earlier receives.
    let mut added: HashMap<(String, u32), UtxoEntry> = HashMap::new();
    let mut removed: HashSet<(String, u32)> = HashSet::new();

    for tx in &block.transactions {
        scan_tx(tx, height, proj, utxo_map, &mut added, &mut removed, &mut out);
    }

    out.spent = removed
        .iter()
        .filter(|k| utxo_map.contains_key(*k))
        .cloned()
        .collect();
    out.received
        .retain(|u| !removed.contains(&(u.txid.clone(), u.vout)));
    out
}

#[allow(clippy::too_many_arguments)]
fn scan_tx(
    tx: &RpcTransaction,
    height: u64,
    proj: &IdentityProjection,
    utxo_map: &HashMap<(String, u32), UtxoEntry>,
    added: &mut HashMap<(String, u32), UtxoEntry>,
    removed: &mut HashSet<(String, u32)>,
    out: &mut ScanOutput,
) {
    // The counterparty of a spend is the first output leaving the tracked set.
    let external = tx.outputs.iter().find(|o| {
        o.script_pub_key
            .address
            .as_deref()
            .is_some_and(|a| !proj.tracked.contains(a))
    });
    let counterparty = external.and_then(|o| o.script_pub_key.address.clone());
    let recipient_amount = external.map(|o| o.value);

    // Pass 1: confirmed spends via the UTXO map.
    for input in &tx.inputs {
        let (Some(txid), Some(vout)) = (
            input.original_transaction_id.as_ref(),
            input.output_transaction_index,
        ) else {
            continue;
        };
        let key = (txid.clone(), vout);
        if removed.contains(&key) {
            continue;
        }
        let entry = added.get(&key).or_else(|| utxo_map.get(&key));
        if let Some(entry) = entry {
            out.events.push(WalletEvent {
                address: entry.primary.clone(),
                tx_hash: tx.hash.clone(),
                block_height: height,
                kind: EventKind::BtcSent {
                    satoshis: entry.value,
                    counterparty: counterparty.clone(),
                    recipient_amount,
                },
            });
            removed.insert(key);
        }
    }

    // Pass 2: receives to tracked addresses, attributed to the primary.
    let mut first_receive_primary: Option<String> = None;
    for output in &tx.outputs {
        let Some(addr) = output.script_pub_key.address.as_deref() else {
            continue;
        };
        if !proj.tracked.contains(addr) {
            continue;
        }
        let primary = proj.canonicalize(addr).to_string();
        if first_receive_primary.is_none() {
            first_receive_primary = Some(primary.clone());
        }
        out.events.push(WalletEvent {
            address: primary.clone(),
            tx_hash: tx.hash.clone(),
            block_height: height,
            kind: EventKind::BtcReceived {
                satoshis: output.value,
            },
        });
        if output.value > 0 {
            let key = (tx.hash.clone(), output.index);
            added.insert(
                key,
                UtxoEntry {
                    primary: primary.clone(),
                    value: output.value,
                },
            );
            out.received.push(StoredUtxo {
                txid: tx.hash.clone(),
                vout: output.index,
                value: output.value,
                address: primary,
            });
        }
    }

    // Pass 3: inferred send — tracked change plus non-tracked outputs.
    if let Some(address) = first_receive_primary {
        let total_sent: u64 = tx
            .outputs
            .iter()
            .filter(|o| {
                !o.script_pub_key
                    .address
                    .as_deref()
                    .is_some_and(|a| proj.tracked.contains(a))
            })
            .map(|o| o.value)
            .sum();
        if let Some(counterparty) = counterparty {
            out.inferred.push(InferredSend {
                address,
                tx_hash: tx.hash.clone(),
                block_height: height,
                total_sent,
                counterparty,
                counterparty_amount: recipient_amount.unwrap_or(0),
            });
        }
    }
}
