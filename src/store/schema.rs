use rusqlite::Connection;

pub fn migrate(conn: &Connection) -> Result<(), rusqlite::Error> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS subscriptions (
            id              TEXT PRIMARY KEY,
            chat_id         INTEGER NOT NULL,
            address         TEXT NOT NULL,
            label           TEXT NOT NULL,
            created_at      TEXT NOT NULL,
            mldsa_hash      TEXT,
            tweaked_pubkey  TEXT,
            p2op            TEXT,
            p2tr            TEXT,
            p2wpkh          TEXT,
            p2pkh           TEXT,
            csv1            TEXT
        );
        CREATE UNIQUE INDEX IF NOT EXISTS idx_subs_chat_addr
            ON subscriptions(chat_id, address);
        CREATE INDEX IF NOT EXISTS idx_subs_hash ON subscriptions(mldsa_hash);

        CREATE TABLE IF NOT EXISTS utxos (
            txid    TEXT NOT NULL,
            vout    INTEGER NOT NULL,
            value   INTEGER NOT NULL,
            address TEXT NOT NULL,
            PRIMARY KEY (txid, vout)
        );
        CREATE INDEX IF NOT EXISTS idx_utxos_address ON utxos(address);

        CREATE TABLE IF NOT EXISTS authorized_chats (
            chat_id INTEGER PRIMARY KEY
        );

        CREATE TABLE IF NOT EXISTS access_codes (
            code            TEXT PRIMARY KEY,
            funding_tx      TEXT UNIQUE,
            redeemed        INTEGER NOT NULL DEFAULT 0,
            redeemed_by     INTEGER,
            code_expires_at TEXT NOT NULL,
            duration_days   INTEGER NOT NULL
        );

        CREATE TABLE IF NOT EXISTS paid_subscriptions (
            chat_id    INTEGER PRIMARY KEY,
            expires_at TEXT NOT NULL,
            code       TEXT NOT NULL,
            paid_by    TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS token_watches (
            id                   TEXT PRIMARY KEY,
            chat_id              INTEGER NOT NULL,
            contract             TEXT NOT NULL,
            label                TEXT NOT NULL,
            kind                 TEXT NOT NULL,
            price_alert_percent  REAL NOT NULL DEFAULT 0,
            min_reservation_sats INTEGER NOT NULL DEFAULT 0
        );
        CREATE UNIQUE INDEX IF NOT EXISTS idx_watches_chat_contract
            ON token_watches(chat_id, contract);

        CREATE TABLE IF NOT EXISTS seen_contracts (
            address  TEXT NOT NULL,
            contract TEXT NOT NULL,
            is_nft   INTEGER NOT NULL DEFAULT 0,
            PRIMARY KEY (address, contract)
        );

        CREATE TABLE IF NOT EXISTS state (
            key   TEXT PRIMARY KEY,
            value TEXT NOT NULL
        );
        ",
    )?;
    Ok(())
}
