//! Remote chain-indexing provider interface
//!
//! The engine consumes the provider as a narrow query/broadcast surface;
//! the concrete transport lives behind [`ChainProvider`]. Address sets are
//! exchanged in a packed binary form: one `version_byte ++ hash160` record
//! (21 bytes) per legacy address, concatenated.

pub mod http;

use async_trait::async_trait;
use bitcoin::{Address, BlockHash, Transaction, Txid};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::error::ProviderError;

pub use http::HttpProvider;

/// Remote chain tip as reported by the provider.
#[derive(Debug, Clone)]
pub struct ChainTip {
    pub height: u32,
    pub hash: BlockHash,
    pub time: u64,
    pub status: TipStatus,
}

/// Whether the remote node is itself caught up with the network.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TipStatus {
    Synchronized,
    CatchingUp,
}

/// Where a transaction appeared in the chain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockAppearance {
    pub hash: BlockHash,
    pub height: u32,
    /// Position within the block
    pub index: u32,
    pub time: u64,
}

/// A transaction as returned by the provider: raw bytes plus block
/// appearance, or pending when unconfirmed.
#[derive(Debug, Clone)]
pub struct ProviderTx {
    pub tx: Transaction,
    pub block: Option<BlockAppearance>,
    /// First-seen time for unconfirmed transactions, block time otherwise
    pub time: u64,
}

impl ProviderTx {
    pub fn txid(&self) -> Txid {
        self.tx.compute_txid()
    }
}

/// Narrow query/broadcast interface to the chain-indexing provider.
///
/// All calls are blocking round-trips from the engine's point of view;
/// the sync layer never fans out concurrent requests for one wallet.
#[async_trait]
pub trait ChainProvider: Send + Sync {
    async fn chain_tip(&self) -> Result<ChainTip, ProviderError>;

    /// All historical transactions touching any address in the set, at or
    /// above `since_height` (0 means full history).
    async fn history(
        &self,
        addresses: &[Address],
        since_height: u32,
    ) -> Result<Vec<ProviderTx>, ProviderError>;

    async fn transaction(&self, txid: Txid) -> Result<Option<ProviderTx>, ProviderError>;

    /// The parent transactions referenced by `txid`'s inputs.
    async fn dependencies(&self, txid: Txid)
        -> Result<HashMap<Txid, Transaction>, ProviderError>;

    async fn broadcast(&self, tx: &Transaction) -> Result<bool, ProviderError>;

    /// Register the address set for push-notification watching.
    /// Best-effort: callers log failures instead of aborting.
    async fn subscribe(
        &self,
        push_token: &str,
        wallet_id: &str,
        addresses: &[Address],
    ) -> Result<bool, ProviderError>;
}

/// Pack legacy addresses into the provider's 21-bytes-per-address wire
/// form. Non-P2PKH scripts are skipped; the provider only watches legacy
/// addresses.
pub fn pack_address_set(addresses: &[Address], version_byte: u8) -> Vec<u8> {
    let mut packed = Vec::with_capacity(addresses.len() * 21);
    for address in addresses {
        let script = address.script_pubkey();
        if !script.is_p2pkh() {
            log::warn!("Skipping non-P2PKH address in packed set: {}", address);
            continue;
        }
        // P2PKH script: OP_DUP OP_HASH160 <20 bytes> OP_EQUALVERIFY OP_CHECKSIG
        packed.push(version_byte);
        packed.extend_from_slice(&script.as_bytes()[3..23]);
    }
    packed
}

/// Transaction ids cross the wire in display (reversed) byte order.
pub fn reversed_txid_bytes(txid: Txid) -> [u8; 32] {
    use bitcoin::hashes::Hash;
    let mut bytes = txid.to_byte_array();
    bytes.reverse();
    bytes
}
