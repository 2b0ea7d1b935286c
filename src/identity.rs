use bitcoin::hex::FromHex;
use bitcoin::key::TweakedPublicKey;
use bitcoin::{Address, CompressedPublicKey, PublicKey, XOnlyPublicKey};

use crate::config::Network;
use crate::rpc::ChainSource;
use crate::store::models::{norm_hex, Linkage};

/// Resolve an address to its full identity bundle: the chain-level identity
/// hash plus every address form derivable for the configured network.
///
/// Derivations fail independently; a missing form is simply absent. Returns
/// None when the chain has no owner record for the address.
pub async fn resolve(
    rpc: &dyn ChainSource,
    network: Network,
    address: &str,
) -> anyhow::Result<Option<Linkage>> {
    let Some(info) = rpc.public_key_info(address, true).await? else {
        return Ok(None);
    };
    let Some(hash) = info.mldsa_hash else {
        return Ok(None);
    };

    let p2tr = info.p2tr.clone().or_else(|| {
        info.tweaked_public_key
            .as_deref()
            .and_then(|pk| derive_p2tr(pk, network))
    });
    let p2wpkh = info
        .public_key
        .as_deref()
        .and_then(|pk| derive_p2wpkh(pk, network));
    let p2pkh = info
        .public_key
        .as_deref()
        .and_then(|pk| derive_p2pkh(pk, network));

    // CSV form lives behind its own RPC path; a failure there must not fail
    // the resolver.
    let csv1 = match rpc.csv1_for_address(address).await {
        Ok(addr) => addr,
        Err(e) => {
            tracing::debug!("csv1 lookup failed for {address}: {e}");
            None
        }
    };

    Ok(Some(Linkage {
        mldsa_hash: norm_hex(&hash),
        tweaked_pubkey: info.tweaked_public_key.map(|s| norm_hex(&s)),
        p2op: info.p2op,
        p2tr,
        p2wpkh,
        p2pkh,
        csv1,
    }))
}

fn derive_p2tr(tweaked_hex: &str, network: Network) -> Option<String> {
    let bytes = Vec::<u8>::from_hex(&norm_hex(tweaked_hex)).ok()?;
    let xonly = XOnlyPublicKey::from_slice(&bytes).ok()?;
    let tweaked = TweakedPublicKey::dangerous_assume_tweaked(xonly);
    Some(Address::p2tr_tweaked(tweaked, network.btc()).to_string())
}

fn derive_p2wpkh(pubkey_hex: &str, network: Network) -> Option<String> {
    let bytes = Vec::<u8>::from_hex(&norm_hex(pubkey_hex)).ok()?;
    let pk = CompressedPublicKey::from_slice(&bytes).ok()?;
    Some(Address::p2wpkh(&pk, network.btc()).to_string())
}

fn derive_p2pkh(pubkey_hex: &str, network: Network) -> Option<String> {
    let bytes = Vec::<u8>::from_hex(&norm_hex(pubkey_hex)).ok()?;
    let pk = PublicKey::from_slice(&bytes).ok()?;
    Some(Address::p2pkh(&pk, network.btc()).to_string())
}
