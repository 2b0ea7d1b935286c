use std::env;

/// Which chain network the watcher runs against. Controls address derivation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Network {
    Mainnet,
    Testnet,
    Regtest,
}

impl Network {
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "mainnet" => Some(Network::Mainnet),
            "testnet" => Some(Network::Testnet),
            "regtest" => Some(Network::Regtest),
            _ => None,
        }
    }

    /// The bitcoin-crate network used for key-derived address forms.
    pub fn btc(&self) -> bitcoin::Network {
        match self {
            Network::Mainnet => bitcoin::Network::Bitcoin,
            Network::Testnet => bitcoin::Network::Testnet,
            Network::Regtest => bitcoin::Network::Regtest,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub telegram_bot_token: String,
    /// Legacy password gate. None disables /auth.
    pub bot_password: Option<String>,
    pub rpc_url: String,
    pub indexer_url: String,
    pub network: Network,
    pub poll_interval_ms: u64,
    pub max_wallets_per_user: usize,
    pub mempool_url: Option<String>,
    pub admin_chat_id: Option<i64>,
    pub database_path: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            telegram_bot_token: String::new(),
            bot_password: None,
            rpc_url: "http://127.0.0.1:9001".into(),
            indexer_url: "http://127.0.0.1:3001".into(),
            network: Network::Regtest,
            poll_interval_ms: 30_000,
            max_wallets_per_user: 20,
            mempool_url: None,
            admin_chat_id: None,
            database_path: "data/opwatch.db".into(),
        }
    }
}

impl Config {
    /// Load config from environment variables. Only TELEGRAM_BOT_TOKEN is
    /// required; everything else falls back to defaults with a notice.
    pub fn from_env() -> anyhow::Result<Self> {
        let mut cfg = Config::default();

        cfg.telegram_bot_token = env::var("TELEGRAM_BOT_TOKEN")
            .map_err(|_| anyhow::anyhow!("TELEGRAM_BOT_TOKEN is not set"))?;

        cfg.bot_password = env::var("BOT_PASSWORD").ok().filter(|s| !s.is_empty());

        if let Ok(url) = env::var("RPC_URL") {
            cfg.rpc_url = url;
        }
        if let Ok(url) = env::var("INDEXER_URL") {
            cfg.indexer_url = url;
        }
        if let Ok(net) = env::var("NETWORK") {
            match Network::parse(&net) {
                Some(n) => cfg.network = n,
                None => tracing::warn!("Unknown NETWORK '{net}', using {:?}", cfg.network),
            }
        }
        if let Ok(ms) = env::var("POLL_INTERVAL_MS") {
            match ms.parse() {
                Ok(v) => cfg.poll_interval_ms = v,
                Err(_) => {
                    tracing::warn!("Bad POLL_INTERVAL_MS '{ms}', using {}", cfg.poll_interval_ms)
                }
            }
        }
        if let Ok(n) = env::var("MAX_WALLETS_PER_USER") {
            match n.parse() {
                Ok(v) => cfg.max_wallets_per_user = v,
                Err(_) => tracing::warn!("Bad MAX_WALLETS_PER_USER '{n}'"),
            }
        }
        cfg.mempool_url = env::var("MEMPOOL_URL").ok().filter(|s| !s.is_empty());
        cfg.admin_chat_id = env::var("ADMIN_CHAT_ID").ok().and_then(|s| s.parse().ok());
        if let Ok(path) = env::var("DATABASE_PATH") {
            cfg.database_path = path;
        }

        Ok(cfg)
    }
}
