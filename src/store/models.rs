use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};

/// Every address form derivable from one chain identity. Attached to a
/// subscription once the resolver succeeds. Forms are individually optional
/// because some derivations need the original public key, which may not be
/// on chain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Linkage {
    /// 32-byte identity hash, lowercase hex without 0x.
    pub mldsa_hash: String,
    pub tweaked_pubkey: Option<String>,
    pub p2op: Option<String>,
    pub p2tr: Option<String>,
    pub p2wpkh: Option<String>,
    pub p2pkh: Option<String>,
    pub csv1: Option<String>,
}

impl Linkage {
    /// All known address forms, in derivation order.
    pub fn address_forms(&self) -> Vec<&str> {
        [&self.p2op, &self.p2tr, &self.p2wpkh, &self.p2pkh, &self.csv1]
            .into_iter()
            .filter_map(|f| f.as_deref())
            .collect()
    }
}

/// A chat's watch on one address, as originally supplied by the user.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Subscription {
    pub id: String,
    pub chat_id: i64,
    pub address: String,
    pub label: String,
    pub created_at: DateTime<Utc>,
    pub linkage: Option<Linkage>,
}

/// An unspent output owned by a tracked wallet, keyed by (txid, vout) and
/// attributed to the canonical primary address of its subscription.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredUtxo {
    pub txid: String,
    pub vout: u32,
    pub value: u64,
    pub address: String,
}

/// Value side of the per-tick UTXO map: `(txid, vout) → {primary, value}`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UtxoEntry {
    pub primary: String,
    pub value: u64,
}

/// Per-chat paid access. A chat is live iff now < expires_at.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PaidSubscription {
    pub chat_id: i64,
    pub expires_at: DateTime<Utc>,
    pub code: String,
    pub paid_by: String,
}

/// A purchased access code, redeemable at most once.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AccessCode {
    pub code: String,
    pub funding_tx: Option<String>,
    pub redeemed: bool,
    pub redeemed_by: Option<i64>,
    pub code_expires_at: DateTime<Utc>,
    pub duration_days: i64,
}

impl AccessCode {
    /// Structured token format: JT-[A-Z0-9]{12}.
    pub fn is_valid_format(code: &str) -> bool {
        let Some(rest) = code.strip_prefix("JT-") else {
            return false;
        };
        rest.len() == 12
            && rest
                .chars()
                .all(|c| c.is_ascii_uppercase() || c.is_ascii_digit())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TokenKind {
    Fungible,
    Nft,
}

impl TokenKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TokenKind::Fungible => "fungible",
            TokenKind::Nft => "nft",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "fungible" => Some(TokenKind::Fungible),
            "nft" => Some(TokenKind::Nft),
            _ => None,
        }
    }
}

/// A chat-level watch on a specific contract.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TokenWatch {
    pub id: String,
    pub chat_id: i64,
    pub contract: String,
    pub label: String,
    pub kind: TokenKind,
    /// Percent threshold for price alerts. 0 disables.
    pub price_alert_percent: f64,
    /// Minimum satoshi reservation worth notifying about. 0 disables.
    pub min_reservation_sats: u64,
}

/// The three read-only maps the matchers work against, rebuilt from the cache
/// once per tick.
#[derive(Debug, Clone, Default)]
pub struct IdentityProjection {
    /// Everything to match block outputs against: primaries plus every
    /// linked form.
    pub tracked: HashSet<String>,
    /// Primary address → identity hash. Keyed only by primary so events
    /// attribute to the subscription address, never an alias.
    pub mldsa: HashMap<String, String>,
    /// Any linked alias → its primary.
    pub canonical: HashMap<String, String>,
}

impl IdentityProjection {
    /// Resolve an address seen on chain to the primary it attributes to.
    pub fn canonicalize<'a>(&'a self, address: &'a str) -> &'a str {
        self.canonical.get(address).map(String::as_str).unwrap_or(address)
    }
}

const ID_ALPHABET: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";

/// Opaque 8-char id for subscriptions and token watches.
pub fn new_short_id() -> String {
    let mut rng = rand::thread_rng();
    (0..8)
        .map(|_| ID_ALPHABET[rng.gen_range(0..ID_ALPHABET.len())] as char)
        .collect()
}

/// Lowercase a hex identifier and strip an optional 0x prefix. Both indexer
/// and RPC hashes normalize through here before comparison.
pub fn norm_hex(s: &str) -> String {
    let s = s.trim();
    let s = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")).unwrap_or(s);
    s.to_ascii_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn access_code_format() {
        assert!(AccessCode::is_valid_format("JT-ABC123XYZ789"));
        assert!(!AccessCode::is_valid_format("JT-abc123xyz789"));
        assert!(!AccessCode::is_valid_format("JT-ABC123"));
        assert!(!AccessCode::is_valid_format("XX-ABC123XYZ789"));
        assert!(!AccessCode::is_valid_format("JT-ABC123XYZ7890"));
    }

    #[test]
    fn short_id_shape() {
        let id = new_short_id();
        assert_eq!(id.len(), 8);
        assert!(id.chars().all(|c| c.is_ascii_lowercase() || c.is_ascii_digit()));
        assert_ne!(new_short_id(), new_short_id());
    }

    #[test]
    fn norm_hex_strips_and_lowercases() {
        assert_eq!(norm_hex("0xAABB"), "aabb");
        assert_eq!(norm_hex("AABB"), "aabb");
        assert_eq!(norm_hex(" 0Xff00 "), "ff00");
    }

    #[test]
    fn linkage_forms_skip_missing() {
        let l = Linkage {
            mldsa_hash: "ab".into(),
            tweaked_pubkey: None,
            p2op: Some("op1q".into()),
            p2tr: None,
            p2wpkh: Some("bc1q".into()),
            p2pkh: None,
            csv1: None,
        };
        assert_eq!(l.address_forms(), vec!["op1q", "bc1q"]);
    }

    #[test]
    fn canonicalize_falls_through() {
        let mut p = IdentityProjection::default();
        p.canonical.insert("alias".into(), "primary".into());
        assert_eq!(p.canonicalize("alias"), "primary");
        assert_eq!(p.canonicalize("other"), "other");
    }
}
