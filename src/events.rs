use serde::{Deserialize, Serialize};

/// Transfer direction relative to the tracked wallet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Direction {
    In,
    Out,
}

/// Which side of a NativeSwap reservation the tracked wallet is on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ReservationRole {
    Buyer,
    Seller,
}

/// A semantic wallet event, attributed to the primary (subscription) address.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WalletEvent {
    pub address: String,
    pub tx_hash: String,
    pub block_height: u64,
    pub kind: EventKind,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum EventKind {
    BtcSent {
        satoshis: u64,
        counterparty: Option<String>,
        recipient_amount: Option<u64>,
    },
    BtcReceived {
        satoshis: u64,
    },
    Token {
        contract: String,
        amount: u128,
        direction: Direction,
    },
    NftTransfer {
        contract: String,
        amount: u128,
        direction: Direction,
    },
    LiquidityReserved {
        contract: String,
        role: ReservationRole,
        satoshis: u64,
        token_amount: u128,
    },
    ProviderConsumed {
        contract: String,
        satoshis: u64,
    },
    SwapExecuted {
        contract: String,
        btc_spent: u64,
        tokens_received: u128,
    },
    LiquidityAdded {
        contract: String,
        token_amount: u128,
        satoshis: u64,
    },
    LiquidityRemoved {
        contract: String,
        token_amount: u128,
        satoshis: u64,
    },
    Staked {
        contract: String,
        amount: u128,
    },
    Unstaked {
        contract: String,
        amount: u128,
    },
    RewardsClaimed {
        contract: String,
        amount: u128,
    },
}

impl EventKind {
    /// Stable tag used for cross-source deduplication keys.
    pub fn tag(&self) -> &'static str {
        match self {
            EventKind::BtcSent { .. } => "btc_sent",
            EventKind::BtcReceived { .. } => "btc_received",
            EventKind::Token { .. } => "token",
            EventKind::NftTransfer { .. } => "nft_transfer",
            EventKind::LiquidityReserved { .. } => "liquidity_reserved",
            EventKind::ProviderConsumed { .. } => "provider_consumed",
            EventKind::SwapExecuted { .. } => "swap_executed",
            EventKind::LiquidityAdded { .. } => "liquidity_added",
            EventKind::LiquidityRemoved { .. } => "liquidity_removed",
            EventKind::Staked { .. } => "staked",
            EventKind::Unstaked { .. } => "unstaked",
            EventKind::RewardsClaimed { .. } => "rewards_claimed",
        }
    }

    pub fn contract(&self) -> Option<&str> {
        match self {
            EventKind::BtcSent { .. } | EventKind::BtcReceived { .. } => None,
            EventKind::Token { contract, .. }
            | EventKind::NftTransfer { contract, .. }
            | EventKind::LiquidityReserved { contract, .. }
            | EventKind::ProviderConsumed { contract, .. }
            | EventKind::SwapExecuted { contract, .. }
            | EventKind::LiquidityAdded { contract, .. }
            | EventKind::LiquidityRemoved { contract, .. }
            | EventKind::Staked { contract, .. }
            | EventKind::Unstaked { contract, .. }
            | EventKind::RewardsClaimed { contract, .. } => Some(contract),
        }
    }

    pub fn direction(&self) -> Option<Direction> {
        match self {
            EventKind::Token { direction, .. } | EventKind::NftTransfer { direction, .. } => {
                Some(*direction)
            }
            _ => None,
        }
    }

    pub fn is_btc(&self) -> bool {
        matches!(self, EventKind::BtcSent { .. } | EventKind::BtcReceived { .. })
    }

    /// Whether this event marks its (address, block) pair for BTC suppression.
    /// Contract-level semantics win; raw BTC movement in the same tx is gas
    /// plumbing or already folded into the contract event's amounts.
    pub fn suppresses_btc(&self) -> bool {
        matches!(
            self,
            EventKind::SwapExecuted { .. }
                | EventKind::LiquidityReserved { .. }
                | EventKind::ProviderConsumed { .. }
                | EventKind::LiquidityAdded { .. }
                | EventKind::LiquidityRemoved { .. }
                | EventKind::Staked { .. }
                | EventKind::Unstaked { .. }
                | EventKind::RewardsClaimed { .. }
        )
    }
}

impl WalletEvent {
    /// Cross-source dedup key: (type, txHash, address, contract, direction).
    pub fn dedup_key(&self) -> (String, String, String, String, Option<Direction>) {
        (
            self.kind.tag().to_string(),
            self.tx_hash.clone(),
            self.address.clone(),
            self.kind.contract().unwrap_or("").to_string(),
            self.kind.direction(),
        )
    }
}

/// Candidate send detected from a tracked change output plus non-tracked
/// outputs in the same tx. Promoted to `BtcSent` only when the UTXO path
/// produced no confirmed spend for the same tx (§ tick step 5).
#[derive(Debug, Clone, PartialEq)]
pub struct InferredSend {
    pub address: String,
    pub tx_hash: String,
    pub block_height: u64,
    pub total_sent: u64,
    pub counterparty: String,
    /// Value of the first non-tracked output; becomes the promoted event's
    /// recipient amount.
    pub counterparty_amount: u64,
}

/// A price movement that crossed a token watch's alert threshold.
#[derive(Debug, Clone, PartialEq)]
pub struct PriceAlert {
    pub chat_id: i64,
    pub contract: String,
    pub label: String,
    pub percent_change: f64,
}

/// A reservation on a watched contract at or above the watch's minimum size.
#[derive(Debug, Clone, PartialEq)]
pub struct ReservationAlert {
    pub chat_id: i64,
    pub contract: String,
    pub label: String,
    pub satoshis: u64,
    pub token_amount: u128,
}
