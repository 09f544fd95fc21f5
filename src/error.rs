use thiserror::Error;

/// Errors surfaced by the wallet engine.
///
/// Validation failures (`InvalidAddress`, `DustAmount`, `ExceedsMaxMoney`,
/// `InsufficientBalance`) are returned synchronously to the caller and never
/// retried. Provider and dependency failures are treated as transient by the
/// sync layer and retried with backoff.
#[derive(Error, Debug)]
pub enum WalletError {
    #[error("Wallet already exists: {0}")]
    WalletExists(String),

    #[error("Wallet not found: {0}")]
    WalletNotFound(String),

    #[error("Wallet not initialized")]
    WalletNotInitialized,

    #[error("Authentication failed: {0}")]
    Authentication(String),

    #[error("Invalid mnemonic: {0}")]
    InvalidMnemonic(String),

    #[error("Invalid address: {0}")]
    InvalidAddress(String),

    #[error("Amount of {amount} sats would create a dust output (threshold {threshold} sats)")]
    DustAmount { amount: u64, threshold: u64 },

    #[error("Amount of {0} sats exceeds the network maximum")]
    ExceedsMaxMoney(u64),

    #[error("Insufficient balance: need {needed} sats, have {available} sats")]
    InsufficientBalance { needed: u64, available: u64 },

    #[error("Failed to fetch required transaction {txid}")]
    DependencyFetchFailure { txid: bitcoin::Txid },

    #[error("No redeem data for input {input_index}")]
    UnresolvableRedeemData { input_index: usize },

    #[error("Broadcast rejected by provider")]
    BroadcastRejected,

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Provider error: {0}")]
    Provider(#[from] ProviderError),

    #[error("Bitcoin error: {0}")]
    Bitcoin(String),

    #[error("Crypto error: {0}")]
    Crypto(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Errors from the persisted wallet file.
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Wallet file not found: {0}")]
    FileNotFound(String),

    #[error("Corrupt wallet file: {0}")]
    Corrupt(String),
}

/// Errors from the remote chain-indexing provider. Always considered
/// transient by the sync layer.
#[derive(Error, Debug)]
pub enum ProviderError {
    #[error("Network error: {0}")]
    Network(String),

    #[error("Provider returned status {0}")]
    Status(u16),

    #[error("Malformed provider response: {0}")]
    Malformed(String),
}

impl From<reqwest::Error> for ProviderError {
    fn from(e: reqwest::Error) -> Self {
        ProviderError::Network(e.to_string())
    }
}
