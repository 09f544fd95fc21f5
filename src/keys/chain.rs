//! Deterministic key tree
//!
//! Keys live at `m/0'/chain/index` relative to the wallet's master key:
//! chain 0 is the external (receive) chain, chain 1 the internal (change)
//! chain. The account node `m/0'` is exported as a watch-only xpub so
//! addresses regenerate statelessly during recovery; private keys are only
//! derivable from the decrypted seed.

use bitcoin::bip32::{ChildNumber, Xpriv, Xpub};
use bitcoin::hashes::{sha256, Hash};
use bitcoin::key::CompressedPublicKey;
use bitcoin::secp256k1::Secp256k1;
use bitcoin::{Address, Network, PrivateKey, PublicKey};
use serde::{Deserialize, Serialize};

use super::crypto::Seed;
use crate::error::WalletError;

/// The two derivation chains of the key tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum KeyChain {
    /// Receive chain (chain number 0)
    External,
    /// Change chain (chain number 1)
    Internal,
}

impl KeyChain {
    pub fn number(self) -> u32 {
        match self {
            KeyChain::External => 0,
            KeyChain::Internal => 1,
        }
    }
}

/// Watch-only view of the wallet's account node (`m/0'`).
#[derive(Clone, Debug)]
pub struct KeyTree {
    account_xpub: Xpub,
    network: Network,
}

impl KeyTree {
    /// Build the key tree from a decrypted seed.
    pub fn from_seed(seed: &Seed, network: Network) -> Result<Self, WalletError> {
        let secp = Secp256k1::new();
        let account = account_xpriv(seed, network)?;
        Ok(Self {
            account_xpub: Xpub::from_priv(&secp, &account),
            network,
        })
    }

    /// Rebuild the watch-only tree from a persisted account xpub.
    pub fn from_account_xpub(account_xpub: Xpub, network: Network) -> Self {
        Self {
            account_xpub,
            network,
        }
    }

    pub fn account_xpub(&self) -> &Xpub {
        &self.account_xpub
    }

    pub fn network(&self) -> Network {
        self.network
    }

    /// Hex identifier for this wallet, used when registering the address
    /// set with the provider's push-watching service.
    pub fn wallet_id(&self) -> String {
        let digest = sha256::Hash::hash(&self.account_xpub.encode());
        hex::encode(&digest.to_byte_array()[..16])
    }

    /// Derive the public key at `(chain, index)`. Pure and repeatable:
    /// the same tree and path always yield the same key.
    pub fn derive_public_key(
        &self,
        chain: KeyChain,
        index: u32,
    ) -> Result<CompressedPublicKey, WalletError> {
        let secp = Secp256k1::new();
        let chain_child = ChildNumber::from_normal_idx(chain.number())
            .map_err(|e| WalletError::Bitcoin(e.to_string()))?;
        let index_child =
            ChildNumber::from_normal_idx(index).map_err(|e| WalletError::Bitcoin(e.to_string()))?;

        let derived = self
            .account_xpub
            .derive_pub(&secp, &[chain_child, index_child])
            .map_err(|e| WalletError::Bitcoin(e.to_string()))?;

        CompressedPublicKey::try_from(PublicKey::new(derived.public_key))
            .map_err(|e| WalletError::Bitcoin(e.to_string()))
    }

    /// Derive the legacy P2PKH address at `(chain, index)`.
    pub fn derive_address(&self, chain: KeyChain, index: u32) -> Result<Address, WalletError> {
        let pubkey = self.derive_public_key(chain, index)?;
        Ok(Address::p2pkh(pubkey, self.network))
    }

    /// Derive `count` consecutive addresses starting at `start`, returning
    /// `(index, address)` pairs.
    pub fn derive_addresses(
        &self,
        chain: KeyChain,
        start: u32,
        count: u32,
    ) -> Result<Vec<(u32, Address)>, WalletError> {
        let mut addresses = Vec::with_capacity(count as usize);
        for i in 0..count {
            let index = start + i;
            addresses.push((index, self.derive_address(chain, index)?));
        }
        Ok(addresses)
    }
}

/// Derive the private key at `m/0'/chain/index` from a decrypted seed.
/// Requires an authenticated context; the watch-only tree cannot do this.
pub fn derive_private_key(
    seed: &Seed,
    chain: KeyChain,
    index: u32,
    network: Network,
) -> Result<PrivateKey, WalletError> {
    let secp = Secp256k1::new();
    let account = account_xpriv(seed, network)?;

    let chain_child = ChildNumber::from_normal_idx(chain.number())
        .map_err(|e| WalletError::Bitcoin(e.to_string()))?;
    let index_child =
        ChildNumber::from_normal_idx(index).map_err(|e| WalletError::Bitcoin(e.to_string()))?;

    let derived = account
        .derive_priv(&secp, &[chain_child, index_child])
        .map_err(|e| WalletError::Bitcoin(e.to_string()))?;

    Ok(PrivateKey::new(derived.private_key, network))
}

fn account_xpriv(seed: &Seed, network: Network) -> Result<Xpriv, WalletError> {
    let secp = Secp256k1::new();
    let master = Xpriv::new_master(network, seed.as_bytes())
        .map_err(|e| WalletError::Bitcoin(e.to_string()))?;
    let account_child =
        ChildNumber::from_hardened_idx(0).map_err(|e| WalletError::Bitcoin(e.to_string()))?;
    master
        .derive_priv(&secp, &[account_child])
        .map_err(|e| WalletError::Bitcoin(e.to_string()))
}

/// Issued-index counters per chain. An index is issued exactly once and
/// never reused; the counters only grow.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct KeyChainState {
    pub external_issued: u32,
    pub internal_issued: u32,
}

impl KeyChainState {
    pub fn issued(&self, chain: KeyChain) -> u32 {
        match chain {
            KeyChain::External => self.external_issued,
            KeyChain::Internal => self.internal_issued,
        }
    }

    /// Issue `count` fresh indices on `chain`.
    pub fn issue(&mut self, chain: KeyChain, count: u32) {
        match chain {
            KeyChain::External => self.external_issued += count,
            KeyChain::Internal => self.internal_issued += count,
        }
    }

    /// Issue and return the next fresh index on `chain`.
    pub fn issue_next(&mut self, chain: KeyChain) -> u32 {
        let index = self.issued(chain);
        self.issue(chain, 1);
        index
    }
}

/// Generate a fresh 12-word mnemonic.
pub fn generate_mnemonic() -> Result<bip39::Mnemonic, WalletError> {
    bip39::Mnemonic::generate(12).map_err(|e| WalletError::InvalidMnemonic(e.to_string()))
}

/// Parse a restore phrase.
pub fn parse_mnemonic(phrase: &str) -> Result<bip39::Mnemonic, WalletError> {
    bip39::Mnemonic::parse(phrase).map_err(|e| WalletError::InvalidMnemonic(e.to_string()))
}

/// The 64-byte seed for a mnemonic (empty passphrase).
pub fn seed_from_mnemonic(mnemonic: &bip39::Mnemonic) -> Seed {
    Seed(mnemonic.to_seed(""))
}
