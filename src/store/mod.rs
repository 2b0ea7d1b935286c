pub mod models;
pub mod schema;

use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::{Arc, Mutex, RwLock};

use anyhow::Context;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};

use self::models::{
    AccessCode, IdentityProjection, Linkage, PaidSubscription, StoredUtxo, Subscription,
    TokenWatch, UtxoEntry,
};

/// Outcome of a code redemption attempt. Redemption is idempotent with
/// respect to the calling chat.
#[derive(Debug, Clone, PartialEq)]
pub enum RedeemOutcome {
    Activated { expires_at: DateTime<Utc> },
    AlreadyActive { expires_at: DateTime<Utc> },
    AlreadyRedeemed,
    CodeExpired,
    UnknownCode,
}

#[derive(Default)]
struct Cache {
    subs: HashMap<String, Subscription>,
    watches: HashMap<String, TokenWatch>,
    utxos: HashMap<(String, u32), StoredUtxo>,
    authorized: HashSet<i64>,
    paid: HashMap<i64, PaidSubscription>,
    codes: HashMap<String, AccessCode>,
    /// primary → contract → is_nft
    seen: HashMap<String, HashMap<String, bool>>,
    cursor: u64,
    seeded: HashSet<String>,
    scanned: HashSet<String>,
}

struct Db {
    conn: Connection,
}

/// Durable state behind a full in-memory cache. Reads are synchronous against
/// the cache; every mutation writes through to SQLite before returning, so a
/// failed write fails the caller and the cursor stays put.
#[derive(Clone)]
pub struct Store {
    db: Arc<Mutex<Db>>,
    cache: Arc<RwLock<Cache>>,
}

impl Store {
    pub fn open(path: &Path) -> anyhow::Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("create {}", parent.display()))?;
            }
        }
        let conn = Connection::open(path).context("open sqlite database")?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")?;
        Self::from_conn(conn)
    }

    /// In-memory store for tests.
    #[cfg(test)]
    pub fn open_in_memory() -> anyhow::Result<Self> {
        Self::from_conn(Connection::open_in_memory()?)
    }

    fn from_conn(conn: Connection) -> anyhow::Result<Self> {
        schema::migrate(&conn).context("migrate schema")?;
        let cache = hydrate(&conn).context("hydrate cache")?;
        tracing::info!(
            subscriptions = cache.subs.len(),
            utxos = cache.utxos.len(),
            cursor = cache.cursor,
            "Store hydrated"
        );
        Ok(Self {
            db: Arc::new(Mutex::new(Db { conn })),
            cache: Arc::new(RwLock::new(cache)),
        })
    }

    // --- Subscriptions ---

    pub fn add_subscription(&self, sub: Subscription) -> anyhow::Result<()> {
        {
            let cache = self.cache.read().unwrap();
            if cache
                .subs
                .values()
                .any(|s| s.chat_id == sub.chat_id && s.address == sub.address)
            {
                anyhow::bail!("already tracking {}", sub.address);
            }
        }
        {
            let db = self.db.lock().unwrap();
            db.upsert_subscription(&sub)?;
        }
        self.cache.write().unwrap().subs.insert(sub.id.clone(), sub);
        Ok(())
    }

    /// Remove a chat's subscription by opaque id or by primary address.
    /// When the last subscription for an address goes away, its UTXO set and
    /// seed marker go with it.
    pub fn remove_subscription(&self, chat_id: i64, key: &str) -> anyhow::Result<Option<Subscription>> {
        let removed = {
            let cache = self.cache.read().unwrap();
            cache
                .subs
                .values()
                .find(|s| s.chat_id == chat_id && (s.id == key || s.address == key))
                .cloned()
        };
        let Some(sub) = removed else {
            return Ok(None);
        };

        let orphaned = {
            let cache = self.cache.read().unwrap();
            !cache
                .subs
                .values()
                .any(|s| s.id != sub.id && s.address == sub.address)
        };

        {
            let db = self.db.lock().unwrap();
            db.conn
                .execute("DELETE FROM subscriptions WHERE id = ?1", params![sub.id])?;
            if orphaned {
                db.conn
                    .execute("DELETE FROM utxos WHERE address = ?1", params![sub.address])?;
                db.delete_state(&format!("seeded:{}", sub.address))?;
            }
        }

        let mut cache = self.cache.write().unwrap();
        cache.subs.remove(&sub.id);
        if orphaned {
            cache.utxos.retain(|_, u| u.address != sub.address);
            cache.seeded.remove(&sub.address);
        }
        Ok(Some(sub))
    }

    pub fn subscription_count(&self, chat_id: i64) -> usize {
        let cache = self.cache.read().unwrap();
        cache.subs.values().filter(|s| s.chat_id == chat_id).count()
    }

    pub fn find_subscription(&self, chat_id: i64, address: &str) -> Option<Subscription> {
        let cache = self.cache.read().unwrap();
        cache
            .subs
            .values()
            .find(|s| s.chat_id == chat_id && s.address == address)
            .cloned()
    }

    /// O(N) scan over the identity-hash index; used only by the track command.
    pub fn find_subscription_by_hash(&self, chat_id: i64, mldsa_hash: &str) -> Option<Subscription> {
        let cache = self.cache.read().unwrap();
        cache
            .subs
            .values()
            .find(|s| {
                s.chat_id == chat_id
                    && s.linkage
                        .as_ref()
                        .is_some_and(|l| l.mldsa_hash == mldsa_hash)
            })
            .cloned()
    }

    pub fn subscriptions_for_chat(&self, chat_id: i64) -> Vec<Subscription> {
        let cache = self.cache.read().unwrap();
        let mut subs: Vec<_> = cache
            .subs
            .values()
            .filter(|s| s.chat_id == chat_id)
            .cloned()
            .collect();
        subs.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        subs
    }

    /// Attach a resolved linkage to every subscription on this primary.
    pub fn update_linkage(&self, address: &str, linkage: &Linkage) -> anyhow::Result<()> {
        let ids: Vec<String> = {
            let cache = self.cache.read().unwrap();
            cache
                .subs
                .values()
                .filter(|s| s.address == address)
                .map(|s| s.id.clone())
                .collect()
        };
        {
            let db = self.db.lock().unwrap();
            for id in &ids {
                db.update_linkage(id, linkage)?;
            }
        }
        let mut cache = self.cache.write().unwrap();
        for id in &ids {
            if let Some(sub) = cache.subs.get_mut(id) {
                sub.linkage = Some(linkage.clone());
            }
        }
        Ok(())
    }

    /// Distinct primary addresses across all subscriptions.
    pub fn tracked_primaries(&self) -> Vec<String> {
        let cache = self.cache.read().unwrap();
        let set: HashSet<&str> = cache.subs.values().map(|s| s.address.as_str()).collect();
        set.into_iter().map(String::from).collect()
    }

    /// Primaries with no stored identity hash yet; the resolver fills these
    /// each tick.
    pub fn unresolved_primaries(&self) -> Vec<String> {
        let cache = self.cache.read().unwrap();
        let mut out: HashSet<&str> = HashSet::new();
        for sub in cache.subs.values() {
            if sub.linkage.is_none() {
                out.insert(sub.address.as_str());
            }
        }
        out.into_iter().map(String::from).collect()
    }

    pub fn linkage_for_address(&self, address: &str) -> Option<Linkage> {
        let cache = self.cache.read().unwrap();
        cache
            .subs
            .values()
            .find(|s| s.address == address)
            .and_then(|s| s.linkage.clone())
    }

    /// O(N) over the cache; N is small by construction (per-chat cap).
    pub fn chats_tracking(&self, address: &str) -> Vec<(i64, String)> {
        let cache = self.cache.read().unwrap();
        let mut out: Vec<(i64, String)> = cache
            .subs
            .values()
            .filter(|s| s.address == address)
            .map(|s| (s.chat_id, s.label.clone()))
            .collect();
        out.sort();
        out.dedup();
        out
    }

    pub fn identity_projection(&self) -> IdentityProjection {
        let cache = self.cache.read().unwrap();
        let mut proj = IdentityProjection::default();
        for sub in cache.subs.values() {
            proj.tracked.insert(sub.address.clone());
            if let Some(linkage) = &sub.linkage {
                proj.mldsa
                    .insert(sub.address.clone(), linkage.mldsa_hash.clone());
                for form in linkage.address_forms() {
                    proj.tracked.insert(form.to_string());
                    if form != sub.address {
                        proj.canonical.insert(form.to_string(), sub.address.clone());
                    }
                }
            }
        }
        proj
    }

    // --- UTXO set ---

    /// Rebuilt once per tick: `(txid, vout) → {primary, value}`.
    pub fn utxo_map(&self) -> HashMap<(String, u32), UtxoEntry> {
        let cache = self.cache.read().unwrap();
        cache
            .utxos
            .iter()
            .map(|(k, u)| {
                (
                    k.clone(),
                    UtxoEntry {
                        primary: u.address.clone(),
                        value: u.value,
                    },
                )
            })
            .collect()
    }

    pub fn insert_utxos(&self, utxos: &[StoredUtxo]) -> anyhow::Result<()> {
        let live: Vec<&StoredUtxo> = utxos.iter().filter(|u| u.value > 0).collect();
        {
            let db = self.db.lock().unwrap();
            for u in &live {
                db.upsert_utxo(u)?;
            }
        }
        let mut cache = self.cache.write().unwrap();
        for u in live {
            cache
                .utxos
                .insert((u.txid.clone(), u.vout), (*u).clone());
        }
        Ok(())
    }

    pub fn remove_utxos(&self, keys: &[(String, u32)]) -> anyhow::Result<()> {
        {
            let db = self.db.lock().unwrap();
            for (txid, vout) in keys {
                db.conn.execute(
                    "DELETE FROM utxos WHERE txid = ?1 AND vout = ?2",
                    params![txid, vout],
                )?;
            }
        }
        let mut cache = self.cache.write().unwrap();
        for key in keys {
            cache.utxos.remove(key);
        }
        Ok(())
    }

    pub fn is_seeded(&self, primary: &str) -> bool {
        self.cache.read().unwrap().seeded.contains(primary)
    }

    pub fn mark_seeded(&self, primary: &str) -> anyhow::Result<()> {
        {
            let db = self.db.lock().unwrap();
            db.set_state(&format!("seeded:{primary}"), "1")?;
        }
        self.cache.write().unwrap().seeded.insert(primary.to_string());
        Ok(())
    }

    // --- Scan cursor ---

    pub fn cursor(&self) -> u64 {
        self.cache.read().unwrap().cursor
    }

    /// Monotonic non-decreasing; a lower height is ignored.
    pub fn set_cursor(&self, height: u64) -> anyhow::Result<()> {
        {
            let cache = self.cache.read().unwrap();
            if height <= cache.cursor {
                return Ok(());
            }
        }
        {
            let db = self.db.lock().unwrap();
            db.set_state("cursor", &height.to_string())?;
        }
        self.cache.write().unwrap().cursor = height;
        Ok(())
    }

    // --- Authorization & paid access ---

    pub fn authorize_chat(&self, chat_id: i64) -> anyhow::Result<()> {
        {
            let db = self.db.lock().unwrap();
            db.conn.execute(
                "INSERT OR IGNORE INTO authorized_chats (chat_id) VALUES (?1)",
                params![chat_id],
            )?;
        }
        self.cache.write().unwrap().authorized.insert(chat_id);
        Ok(())
    }

    pub fn is_authorized(&self, chat_id: i64) -> bool {
        self.cache.read().unwrap().authorized.contains(&chat_id)
    }

    pub fn has_active_subscription(&self, chat_id: i64, now: DateTime<Utc>) -> bool {
        let cache = self.cache.read().unwrap();
        cache
            .paid
            .get(&chat_id)
            .is_some_and(|p| now < p.expires_at)
    }

    pub fn paid_subscription(&self, chat_id: i64) -> Option<PaidSubscription> {
        self.cache.read().unwrap().paid.get(&chat_id).cloned()
    }

    /// Created by the external payment pipeline; exposed for the admin
    /// surface and tests.
    pub fn insert_access_code(&self, code: AccessCode) -> anyhow::Result<()> {
        {
            let db = self.db.lock().unwrap();
            db.upsert_code(&code)?;
        }
        self.cache.write().unwrap().codes.insert(code.code.clone(), code);
        Ok(())
    }

    pub fn redeem_code(
        &self,
        code: &str,
        chat_id: i64,
        paid_by: &str,
        now: DateTime<Utc>,
    ) -> anyhow::Result<RedeemOutcome> {
        let existing = self.cache.read().unwrap().codes.get(code).cloned();
        let Some(mut entry) = existing else {
            return Ok(RedeemOutcome::UnknownCode);
        };

        if entry.redeemed {
            return Ok(match entry.redeemed_by {
                Some(by) if by == chat_id => {
                    let expires_at = self
                        .paid_subscription(chat_id)
                        .map(|p| p.expires_at)
                        .unwrap_or(now);
                    RedeemOutcome::AlreadyActive { expires_at }
                }
                _ => RedeemOutcome::AlreadyRedeemed,
            });
        }
        if now >= entry.code_expires_at {
            return Ok(RedeemOutcome::CodeExpired);
        }

        entry.redeemed = true;
        entry.redeemed_by = Some(chat_id);
        let expires_at = now + chrono::Duration::days(entry.duration_days);
        let paid = PaidSubscription {
            chat_id,
            expires_at,
            code: code.to_string(),
            paid_by: paid_by.to_string(),
        };

        {
            let db = self.db.lock().unwrap();
            db.upsert_code(&entry)?;
            db.upsert_paid(&paid)?;
            db.conn.execute(
                "INSERT OR IGNORE INTO authorized_chats (chat_id) VALUES (?1)",
                params![chat_id],
            )?;
        }
        let mut cache = self.cache.write().unwrap();
        cache.codes.insert(entry.code.clone(), entry);
        cache.paid.insert(chat_id, paid);
        cache.authorized.insert(chat_id);
        Ok(RedeemOutcome::Activated { expires_at })
    }

    // --- Token watches ---

    pub fn add_token_watch(&self, watch: TokenWatch) -> anyhow::Result<()> {
        {
            let cache = self.cache.read().unwrap();
            if cache
                .watches
                .values()
                .any(|w| w.chat_id == watch.chat_id && w.contract == watch.contract)
            {
                anyhow::bail!("already watching {}", watch.contract);
            }
        }
        {
            let db = self.db.lock().unwrap();
            db.upsert_watch(&watch)?;
        }
        self.cache
            .write()
            .unwrap()
            .watches
            .insert(watch.id.clone(), watch);
        Ok(())
    }

    pub fn remove_token_watch(&self, chat_id: i64, key: &str) -> anyhow::Result<Option<TokenWatch>> {
        let found = {
            let cache = self.cache.read().unwrap();
            cache
                .watches
                .values()
                .find(|w| w.chat_id == chat_id && (w.id == key || w.contract == key))
                .cloned()
        };
        let Some(watch) = found else {
            return Ok(None);
        };
        {
            let db = self.db.lock().unwrap();
            db.conn
                .execute("DELETE FROM token_watches WHERE id = ?1", params![watch.id])?;
        }
        self.cache.write().unwrap().watches.remove(&watch.id);
        Ok(Some(watch))
    }

    pub fn watches_for_chat(&self, chat_id: i64) -> Vec<TokenWatch> {
        let cache = self.cache.read().unwrap();
        let mut out: Vec<_> = cache
            .watches
            .values()
            .filter(|w| w.chat_id == chat_id)
            .cloned()
            .collect();
        out.sort_by(|a, b| a.id.cmp(&b.id));
        out
    }

    pub fn all_token_watches(&self) -> Vec<TokenWatch> {
        self.cache.read().unwrap().watches.values().cloned().collect()
    }

    pub fn set_price_alert(&self, chat_id: i64, key: &str, percent: f64) -> anyhow::Result<bool> {
        let found = {
            let cache = self.cache.read().unwrap();
            cache
                .watches
                .values()
                .find(|w| w.chat_id == chat_id && (w.id == key || w.contract == key))
                .map(|w| w.id.clone())
        };
        let Some(id) = found else {
            return Ok(false);
        };
        {
            let db = self.db.lock().unwrap();
            db.conn.execute(
                "UPDATE token_watches SET price_alert_percent = ?1 WHERE id = ?2",
                params![percent, id],
            )?;
        }
        if let Some(w) = self.cache.write().unwrap().watches.get_mut(&id) {
            w.price_alert_percent = percent;
        }
        Ok(true)
    }

    // --- Seen contracts ---

    pub fn record_seen_contract(
        &self,
        primary: &str,
        contract: &str,
        is_nft: bool,
    ) -> anyhow::Result<()> {
        {
            let cache = self.cache.read().unwrap();
            if cache
                .seen
                .get(primary)
                .and_then(|m| m.get(contract))
                .is_some_and(|known_nft| *known_nft == is_nft)
            {
                return Ok(());
            }
        }
        {
            let db = self.db.lock().unwrap();
            db.conn.execute(
                "INSERT OR REPLACE INTO seen_contracts (address, contract, is_nft)
                 VALUES (?1, ?2, ?3)",
                params![primary, contract, is_nft as i64],
            )?;
        }
        self.cache
            .write()
            .unwrap()
            .seen
            .entry(primary.to_string())
            .or_default()
            .insert(contract.to_string(), is_nft);
        Ok(())
    }

    pub fn seen_contracts(&self, primary: &str) -> Vec<String> {
        let cache = self.cache.read().unwrap();
        cache
            .seen
            .get(primary)
            .map(|m| {
                let mut v: Vec<String> = m.keys().cloned().collect();
                v.sort();
                v
            })
            .unwrap_or_default()
    }

    /// Contracts anywhere observed as NFT collections; bounds the formatting
    /// decision in the matcher.
    pub fn nft_contracts(&self) -> HashSet<String> {
        let cache = self.cache.read().unwrap();
        let mut out = HashSet::new();
        for per_wallet in cache.seen.values() {
            for (contract, is_nft) in per_wallet {
                if *is_nft {
                    out.insert(contract.clone());
                }
            }
        }
        out
    }

    pub fn is_history_scanned(&self, primary: &str) -> bool {
        self.cache.read().unwrap().scanned.contains(primary)
    }

    pub fn mark_history_scanned(&self, primary: &str) -> anyhow::Result<()> {
        {
            let db = self.db.lock().unwrap();
            db.set_state(&format!("scanned:{primary}"), "1")?;
        }
        self.cache
            .write()
            .unwrap()
            .scanned
            .insert(primary.to_string());
        Ok(())
    }
}

impl Db {
    fn upsert_subscription(&self, sub: &Subscription) -> Result<(), rusqlite::Error> {
        let l = sub.linkage.as_ref();
        self.conn.execute(
            "INSERT OR REPLACE INTO subscriptions
             (id, chat_id, address, label, created_at,
              mldsa_hash, tweaked_pubkey, p2op, p2tr, p2wpkh, p2pkh, csv1)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
            params![
                sub.id,
                sub.chat_id,
                sub.address,
                sub.label,
                sub.created_at.to_rfc3339(),
                l.map(|l| l.mldsa_hash.clone()),
                l.and_then(|l| l.tweaked_pubkey.clone()),
                l.and_then(|l| l.p2op.clone()),
                l.and_then(|l| l.p2tr.clone()),
                l.and_then(|l| l.p2wpkh.clone()),
                l.and_then(|l| l.p2pkh.clone()),
                l.and_then(|l| l.csv1.clone()),
            ],
        )?;
        Ok(())
    }

    fn update_linkage(&self, id: &str, l: &Linkage) -> Result<(), rusqlite::Error> {
        self.conn.execute(
            "UPDATE subscriptions SET mldsa_hash = ?1, tweaked_pubkey = ?2,
             p2op = ?3, p2tr = ?4, p2wpkh = ?5, p2pkh = ?6, csv1 = ?7
             WHERE id = ?8",
            params![
                l.mldsa_hash,
                l.tweaked_pubkey,
                l.p2op,
                l.p2tr,
                l.p2wpkh,
                l.p2pkh,
                l.csv1,
                id
            ],
        )?;
        Ok(())
    }

    fn upsert_utxo(&self, u: &StoredUtxo) -> Result<(), rusqlite::Error> {
        self.conn.execute(
            "INSERT OR REPLACE INTO utxos (txid, vout, value, address)
             VALUES (?1, ?2, ?3, ?4)",
            params![u.txid, u.vout, u.value as i64, u.address],
        )?;
        Ok(())
    }

    fn upsert_code(&self, c: &AccessCode) -> Result<(), rusqlite::Error> {
        self.conn.execute(
            "INSERT OR REPLACE INTO access_codes
             (code, funding_tx, redeemed, redeemed_by, code_expires_at, duration_days)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                c.code,
                c.funding_tx,
                c.redeemed as i64,
                c.redeemed_by,
                c.code_expires_at.to_rfc3339(),
                c.duration_days
            ],
        )?;
        Ok(())
    }

    fn upsert_paid(&self, p: &PaidSubscription) -> Result<(), rusqlite::Error> {
        self.conn.execute(
            "INSERT OR REPLACE INTO paid_subscriptions (chat_id, expires_at, code, paid_by)
             VALUES (?1, ?2, ?3, ?4)",
            params![p.chat_id, p.expires_at.to_rfc3339(), p.code, p.paid_by],
        )?;
        Ok(())
    }

    fn upsert_watch(&self, w: &TokenWatch) -> Result<(), rusqlite::Error> {
        self.conn.execute(
            "INSERT OR REPLACE INTO token_watches
             (id, chat_id, contract, label, kind, price_alert_percent, min_reservation_sats)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                w.id,
                w.chat_id,
                w.contract,
                w.label,
                w.kind.as_str(),
                w.price_alert_percent,
                w.min_reservation_sats as i64
            ],
        )?;
        Ok(())
    }

    fn set_state(&self, key: &str, value: &str) -> Result<(), rusqlite::Error> {
        self.conn.execute(
            "INSERT OR REPLACE INTO state (key, value) VALUES (?1, ?2)",
            params![key, value],
        )?;
        Ok(())
    }

    fn delete_state(&self, key: &str) -> Result<(), rusqlite::Error> {
        self.conn
            .execute("DELETE FROM state WHERE key = ?1", params![key])?;
        Ok(())
    }
}

fn parse_ts(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .map(|t| t.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

fn hydrate(conn: &Connection) -> anyhow::Result<Cache> {
    let mut cache = Cache::default();

    let mut stmt = conn.prepare(
        "SELECT id, chat_id, address, label, created_at,
                mldsa_hash, tweaked_pubkey, p2op, p2tr, p2wpkh, p2pkh, csv1
         FROM subscriptions",
    )?;
    let rows = stmt.query_map([], |row| {
        let mldsa: Option<String> = row.get(5)?;
        let linkage = mldsa.map(|mldsa_hash| Linkage {
            mldsa_hash,
            tweaked_pubkey: row.get(6).unwrap_or(None),
            p2op: row.get(7).unwrap_or(None),
            p2tr: row.get(8).unwrap_or(None),
            p2wpkh: row.get(9).unwrap_or(None),
            p2pkh: row.get(10).unwrap_or(None),
            csv1: row.get(11).unwrap_or(None),
        });
        let created: String = row.get(4)?;
        Ok(Subscription {
            id: row.get(0)?,
            chat_id: row.get(1)?,
            address: row.get(2)?,
            label: row.get(3)?,
            created_at: parse_ts(&created),
            linkage,
        })
    })?;
    for sub in rows {
        let sub = sub?;
        cache.subs.insert(sub.id.clone(), sub);
    }

    let mut stmt = conn.prepare("SELECT txid, vout, value, address FROM utxos")?;
    let rows = stmt.query_map([], |row| {
        Ok(StoredUtxo {
            txid: row.get(0)?,
            vout: row.get(1)?,
            value: row.get::<_, i64>(2)? as u64,
            address: row.get(3)?,
        })
    })?;
    for u in rows {
        let u = u?;
        cache.utxos.insert((u.txid.clone(), u.vout), u);
    }

    let mut stmt = conn.prepare("SELECT chat_id FROM authorized_chats")?;
    let rows = stmt.query_map([], |row| row.get::<_, i64>(0))?;
    for id in rows {
        cache.authorized.insert(id?);
    }

    let mut stmt = conn.prepare(
        "SELECT code, funding_tx, redeemed, redeemed_by, code_expires_at, duration_days
         FROM access_codes",
    )?;
    let rows = stmt.query_map([], |row| {
        let expires: String = row.get(4)?;
        Ok(AccessCode {
            code: row.get(0)?,
            funding_tx: row.get(1)?,
            redeemed: row.get::<_, i64>(2)? != 0,
            redeemed_by: row.get(3)?,
            code_expires_at: parse_ts(&expires),
            duration_days: row.get(5)?,
        })
    })?;
    for c in rows {
        let c = c?;
        cache.codes.insert(c.code.clone(), c);
    }

    let mut stmt =
        conn.prepare("SELECT chat_id, expires_at, code, paid_by FROM paid_subscriptions")?;
    let rows = stmt.query_map([], |row| {
        let expires: String = row.get(1)?;
        Ok(PaidSubscription {
            chat_id: row.get(0)?,
            expires_at: parse_ts(&expires),
            code: row.get(2)?,
            paid_by: row.get(3)?,
        })
    })?;
    for p in rows {
        let p = p?;
        cache.paid.insert(p.chat_id, p);
    }

    let mut stmt = conn.prepare(
        "SELECT id, chat_id, contract, label, kind, price_alert_percent, min_reservation_sats
         FROM token_watches",
    )?;
    let rows = stmt.query_map([], |row| {
        let kind: String = row.get(4)?;
        Ok(TokenWatch {
            id: row.get(0)?,
            chat_id: row.get(1)?,
            contract: row.get(2)?,
            label: row.get(3)?,
            kind: models::TokenKind::parse(&kind).unwrap_or(models::TokenKind::Fungible),
            price_alert_percent: row.get(5)?,
            min_reservation_sats: row.get::<_, i64>(6)? as u64,
        })
    })?;
    for w in rows {
        let w = w?;
        cache.watches.insert(w.id.clone(), w);
    }

    let mut stmt = conn.prepare("SELECT address, contract, is_nft FROM seen_contracts")?;
    let rows = stmt.query_map([], |row| {
        Ok((
            row.get::<_, String>(0)?,
            row.get::<_, String>(1)?,
            row.get::<_, i64>(2)? != 0,
        ))
    })?;
    for r in rows {
        let (address, contract, is_nft) = r?;
        cache.seen.entry(address).or_default().insert(contract, is_nft);
    }

    cache.cursor = conn
        .query_row("SELECT value FROM state WHERE key = 'cursor'", [], |row| {
            row.get::<_, String>(0)
        })
        .optional()?
        .and_then(|v| v.parse().ok())
        .unwrap_or(0);

    let mut stmt = conn.prepare("SELECT key FROM state WHERE key LIKE 'seeded:%'")?;
    let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
    for key in rows {
        let key = key?;
        if let Some(addr) = key.strip_prefix("seeded:") {
            cache.seeded.insert(addr.to_string());
        }
    }

    let mut stmt = conn.prepare("SELECT key FROM state WHERE key LIKE 'scanned:%'")?;
    let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
    for key in rows {
        let key = key?;
        if let Some(addr) = key.strip_prefix("scanned:") {
            cache.scanned.insert(addr.to_string());
        }
    }

    Ok(cache)
}
