/// Wallet engine configuration
///
/// Controls Bitcoin network type, provider endpoint, fee/dust policy and
/// sync behavior. Defaults to mainnet with conservative policy values.
use std::env;
use std::time::Duration;

use bitcoin::{Address, Network};

/// Minimum non-dust output value in satoshis. Payment outputs below this
/// are rejected; change below this is folded into the fee.
pub const DUST_THRESHOLD: u64 = 546;

/// Default fee rate in satoshis per 1024 bytes of serialized transaction.
pub const DEFAULT_FEE_RATE_PER_KB: u64 = 10_000;

/// Confirmation depth at which a transaction is reported as committed.
pub const DEFAULT_COMMIT_DEPTH: u32 = 1;

/// Gap-limit scan defaults: addresses per provider query and consecutive
/// empty batches tolerated before the scan stops.
pub const DEFAULT_SCAN_BATCH_SIZE: u32 = 200;
pub const DEFAULT_INACTIVITY_THRESHOLD: u32 = 10;

/// A mandatory output added to every payment the wallet builds, skipped
/// when its value would be dust.
#[derive(Clone, Debug)]
pub struct ProtocolFee {
    pub address: Address,
    pub value: u64,
}

#[derive(Clone, Debug)]
pub struct WalletConfig {
    /// Bitcoin network type
    pub network: Network,
    /// Chain-indexing provider base URL
    pub provider_url: String,
    /// Dust threshold in satoshis
    pub dust_threshold: u64,
    /// Mandatory protocol-fee outputs appended to every built payment
    pub protocol_fees: Vec<ProtocolFee>,
    /// Depth at which `Committed` events fire
    pub commit_depth: u32,
    /// Addresses derived per scan batch
    pub scan_batch_size: u32,
    /// Consecutive empty batches before a scan stops
    pub inactivity_threshold: u32,
    /// Fixed delay between sync retries
    pub retry_backoff: Duration,
    /// Target wall-clock time for deriving the seed-encryption key; the
    /// calibrated parameters are frozen when the wallet file is created
    pub kdf_target: Duration,
}

impl WalletConfig {
    /// Load configuration from environment variables
    ///
    /// - `BITCOIN_NETWORK`: "mainnet" (default), "testnet" or "regtest"
    /// - `PROVIDER_URL`: chain provider endpoint (optional, has defaults)
    pub fn from_env() -> Self {
        let network_str = env::var("BITCOIN_NETWORK")
            .unwrap_or_else(|_| "mainnet".to_string())
            .to_lowercase();

        let network = match network_str.as_str() {
            "testnet" => {
                log::info!("Using TESTNET network");
                Network::Testnet
            }
            "regtest" => {
                log::info!("Using REGTEST network");
                Network::Regtest
            }
            "mainnet" | "" => Network::Bitcoin,
            other => {
                log::warn!("Unknown network '{}', defaulting to mainnet", other);
                Network::Bitcoin
            }
        };

        let provider_url = env::var("PROVIDER_URL").unwrap_or_else(|_| match network {
            Network::Regtest => "http://localhost:3000".to_string(),
            Network::Testnet => "https://testnet.provider.invalid/api".to_string(),
            _ => "https://provider.invalid/api".to_string(),
        });

        Self {
            network,
            provider_url,
            ..Self::default_for(network)
        }
    }

    /// Default configuration for a given network.
    pub fn default_for(network: Network) -> Self {
        Self {
            network,
            provider_url: String::new(),
            dust_threshold: DUST_THRESHOLD,
            protocol_fees: Vec::new(),
            commit_depth: DEFAULT_COMMIT_DEPTH,
            scan_batch_size: DEFAULT_SCAN_BATCH_SIZE,
            inactivity_threshold: DEFAULT_INACTIVITY_THRESHOLD,
            retry_backoff: Duration::from_secs(60),
            kdf_target: Duration::from_millis(500),
        }
    }

    /// Version byte prefixed to each 20-byte pubkey hash in the packed
    /// address-set format the provider consumes.
    pub fn address_version_byte(&self) -> u8 {
        match self.network {
            Network::Bitcoin => 0x00,
            _ => 0x6f,
        }
    }

    /// Network maximum in satoshis (21 million coins).
    pub fn max_money(&self) -> u64 {
        bitcoin::Amount::MAX_MONEY.to_sat()
    }
}

impl Default for WalletConfig {
    fn default() -> Self {
        Self::default_for(Network::Bitcoin)
    }
}
