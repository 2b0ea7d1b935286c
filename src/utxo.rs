use std::collections::HashMap;

use crate::rpc::ChainSource;
use crate::store::models::{Linkage, StoredUtxo, UtxoEntry};
use crate::store::Store;

/// First-sight seeding: fetch the current UTXO set at the primary and every
/// linked form (the CSV form through its own RPC path) and store the union
/// under the primary's canonical id. Runs exactly once per primary; a failure
/// leaves the seed marker unset so the next tick retries.
pub async fn seed(
    rpc: &dyn ChainSource,
    store: &Store,
    primary: &str,
    linkage: Option<&Linkage>,
) -> anyhow::Result<usize> {
    let mut targets: Vec<(String, bool)> = vec![(primary.to_string(), false)];
    if let Some(l) = linkage {
        for form in l.address_forms() {
            if form != primary {
                let is_csv = l.csv1.as_deref() == Some(form);
                targets.push((form.to_string(), is_csv));
            }
        }
    }

    let mut utxos = Vec::new();
    for (addr, is_csv) in &targets {
        let fetched = rpc.utxos(addr, *is_csv, false).await?;
        for u in fetched {
            utxos.push(StoredUtxo {
                txid: u.transaction_id,
                vout: u.output_index,
                value: u.value,
                address: primary.to_string(),
            });
        }
    }

    store.insert_utxos(&utxos)?;
    store.mark_seeded(primary)?;
    tracing::info!(
        primary,
        forms = targets.len(),
        utxos = utxos.len(),
        "Seeded UTXO set"
    );
    Ok(utxos.len())
}

/// Apply one block chunk's delta to the store and the in-memory map. Spends
/// go first so a freshly received output spent in the same chunk never
/// resurfaces.
pub fn apply_delta(
    store: &Store,
    map: &mut HashMap<(String, u32), UtxoEntry>,
    spent: &[(String, u32)],
    received: &[StoredUtxo],
) -> anyhow::Result<()> {
    store.remove_utxos(spent)?;
    for key in spent {
        map.remove(key);
    }

    store.insert_utxos(received)?;
    for u in received {
        if u.value > 0 {
            map.insert(
                (u.txid.clone(), u.vout),
                UtxoEntry {
                    primary: u.address.clone(),
                    value: u.value,
                },
            );
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rpc::{OwnerInfo, RpcBlock, RpcUtxo};
    use async_trait::async_trait;
    use std::sync::Mutex;

    struct FakeRpc {
        /// (address, is_csv) pairs observed, for asserting fan-out.
        calls: Mutex<Vec<(String, bool)>>,
    }

    #[async_trait]
    impl ChainSource for FakeRpc {
        async fn block_number(&self) -> anyhow::Result<u64> {
            Ok(0)
        }
        async fn block(&self, _height: u64) -> anyhow::Result<Option<RpcBlock>> {
            Ok(None)
        }
        async fn public_key_info(
            &self,
            _address: &str,
            _include_public_key: bool,
        ) -> anyhow::Result<Option<OwnerInfo>> {
            Ok(None)
        }
        async fn balance(&self, _address: &str, _confirmed_only: bool) -> anyhow::Result<u64> {
            Ok(0)
        }
        async fn csv1_for_address(&self, _owner: &str) -> anyhow::Result<Option<String>> {
            Ok(None)
        }
        async fn utxos(
            &self,
            address: &str,
            is_csv: bool,
            _merge_pending: bool,
        ) -> anyhow::Result<Vec<RpcUtxo>> {
            self.calls.lock().unwrap().push((address.to_string(), is_csv));
            Ok(vec![RpcUtxo {
                transaction_id: format!("tx-{address}"),
                output_index: 0,
                value: 1000,
            }])
        }
    }

    fn make_linkage() -> Linkage {
        Linkage {
            mldsa_hash: "aa".into(),
            tweaked_pubkey: None,
            p2op: Some("op1qa".into()),
            p2tr: Some("bcrt1pa".into()),
            p2wpkh: None,
            p2pkh: None,
            csv1: Some("bcrt1qcsv".into()),
        }
    }

    #[tokio::test]
    async fn seed_unions_all_forms_under_primary() {
        let store = Store::open_in_memory().unwrap();
        let rpc = FakeRpc {
            calls: Mutex::new(Vec::new()),
        };
        let linkage = make_linkage();
        let n = seed(&rpc, &store, "op1qa", Some(&linkage)).await.unwrap();
        assert_eq!(n, 3); // primary/p2op is one form, p2tr, csv1

        let calls = rpc.calls.lock().unwrap();
        assert!(calls.contains(&("op1qa".into(), false)));
        assert!(calls.contains(&("bcrt1pa".into(), false)));
        assert!(calls.contains(&("bcrt1qcsv".into(), true)));

        // every stored UTXO attributes to the primary
        let map = store.utxo_map();
        assert_eq!(map.len(), 3);
        assert!(map.values().all(|e| e.primary == "op1qa"));
        assert!(store.is_seeded("op1qa"));
    }

    #[test]
    fn delta_applies_spends_before_receives() {
        let store = Store::open_in_memory().unwrap();
        store
            .insert_utxos(&[StoredUtxo {
                txid: "t0".into(),
                vout: 0,
                value: 500_000,
                address: "a".into(),
            }])
            .unwrap();
        let mut map = store.utxo_map();

        let received = vec![StoredUtxo {
            txid: "t1".into(),
            vout: 1,
            value: 199_500,
            address: "a".into(),
        }];
        let spent = vec![("t0".to_string(), 0u32)];
        apply_delta(&store, &mut map, &spent, &received).unwrap();

        assert!(!map.contains_key(&("t0".into(), 0)));
        assert_eq!(map.get(&("t1".into(), 1)).unwrap().value, 199_500);
        assert_eq!(store.utxo_map().len(), 1);
    }
}
