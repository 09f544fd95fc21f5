//! Wallet context
//!
//! Explicit handle bundling everything a loaded wallet owns: the watch-only
//! key tree, issued-key counters, the transaction ledger, the last-seen
//! block and the backing file. All operations take the context instead of
//! reaching for a global instance; create/load/delete are explicit.

use bitcoin::bip32::Xpub;
use bitcoin::Address;
use chrono::{DateTime, Utc};
use std::str::FromStr;

use crate::config::WalletConfig;
use crate::error::{StorageError, WalletError};
use crate::keys::{
    self, EncryptedSeed, KeyChain, KeyChainState, KeyTree, Seed,
};
use crate::store::{BlockRef, ScriptIndex, TransactionStore, WalletData, WalletFile};

pub struct WalletContext {
    pub config: WalletConfig,
    pub keys: KeyTree,
    pub chain_state: KeyChainState,
    pub store: TransactionStore,
    pub scripts: ScriptIndex,
    pub last_block: Option<BlockRef>,
    pub encrypted_seed: EncryptedSeed,
    pub created_at: DateTime<Utc>,
    pub file: WalletFile,
}

impl WalletContext {
    /// Create a brand-new wallet: fresh mnemonic, KDF calibrated against
    /// the configured target time, seed encrypted under `token`, file
    /// written. Returns the context and the mnemonic for backup display.
    pub fn create_new(
        config: WalletConfig,
        file: WalletFile,
        token: &str,
    ) -> Result<(Self, bip39::Mnemonic), WalletError> {
        if file.exists() {
            return Err(WalletError::WalletExists(file.path().display().to_string()));
        }
        let mnemonic = keys::generate_mnemonic()?;
        let ctx = Self::from_mnemonic(config, file, &mnemonic, token)?;
        Ok((ctx, mnemonic))
    }

    /// Restore from a 12-word phrase. Address history is recovered by the
    /// initial sync; only key material is set up here.
    pub fn restore(
        config: WalletConfig,
        file: WalletFile,
        phrase: &str,
        token: &str,
    ) -> Result<Self, WalletError> {
        if file.exists() {
            return Err(WalletError::WalletExists(file.path().display().to_string()));
        }
        let mnemonic = keys::parse_mnemonic(phrase)?;
        Self::from_mnemonic(config, file, &mnemonic, token)
    }

    fn from_mnemonic(
        config: WalletConfig,
        file: WalletFile,
        mnemonic: &bip39::Mnemonic,
        token: &str,
    ) -> Result<Self, WalletError> {
        let seed = keys::seed_from_mnemonic(mnemonic);
        let keys = KeyTree::from_seed(&seed, config.network)?;

        let kdf = keys::calibrate_kdf(config.kdf_target);
        log::info!(
            "Creating wallet file {:?} (KDF time cost {})",
            file.path(),
            kdf.time_cost
        );
        let encrypted_seed = keys::encrypt_seed(&seed, token, &kdf)?;

        let ctx = Self {
            config,
            keys,
            chain_state: KeyChainState::default(),
            store: TransactionStore::new(),
            scripts: ScriptIndex::new(),
            last_block: None,
            encrypted_seed,
            created_at: Utc::now(),
            file,
        };
        ctx.persist()?;
        Ok(ctx)
    }

    /// Load an existing wallet file. No authentication needed: only the
    /// watch-only state is materialized.
    pub fn load(config: WalletConfig, file: WalletFile) -> Result<Self, WalletError> {
        let data = file.load()?;

        // A file written for another network would derive addresses that
        // look valid but belong to the wrong chain.
        if data.network != config.network.to_string() {
            return Err(StorageError::Corrupt(format!(
                "wallet file is for network '{}', configured network is '{}'",
                data.network, config.network
            ))
            .into());
        }

        let account_xpub = Xpub::from_str(&data.account_xpub)
            .map_err(|e| StorageError::Corrupt(format!("account xpub: {}", e)))?;
        let keys = KeyTree::from_account_xpub(account_xpub, config.network);

        let mut transactions = Vec::with_capacity(data.transactions.len());
        for stored in data.transactions {
            transactions.push(stored.into_tracked()?);
        }

        let mut ctx = Self {
            config,
            keys,
            chain_state: data.chain_state,
            store: TransactionStore::from_transactions(transactions),
            scripts: ScriptIndex::new(),
            last_block: data.last_block,
            encrypted_seed: data.encrypted_seed,
            created_at: data.created_at,
            file,
        };
        ctx.rebuild_scripts()?;
        log::info!(
            "Loaded wallet: {} transactions, {} issued external / {} internal keys",
            ctx.store.len(),
            ctx.chain_state.external_issued,
            ctx.chain_state.internal_issued
        );
        Ok(ctx)
    }

    /// Decrypt the master seed with an authentication token. The seed only
    /// lives for the duration of the calling operation.
    pub fn unlock(&self, token: &str) -> Result<Seed, WalletError> {
        keys::decrypt_seed(&self.encrypted_seed, token)
    }

    /// Write the whole wallet state to the file (atomic).
    pub fn persist(&self) -> Result<(), StorageError> {
        let data = build_wallet_data(
            &self.config,
            &self.keys,
            &self.chain_state,
            &self.encrypted_seed,
            &self.last_block,
            &self.created_at,
            &self.store,
        );
        self.file.save(&data)
    }

    /// Issue `count` fresh keys on `chain` and index their scripts.
    pub fn issue_keys(&mut self, chain: KeyChain, count: u32) -> Result<(), WalletError> {
        let start = self.chain_state.issued(chain);
        for index in start..start + count {
            let address = self.keys.derive_address(chain, index)?;
            self.scripts.insert(address.script_pubkey(), chain, index);
        }
        self.chain_state.issue(chain, count);
        Ok(())
    }

    /// Issue and return a fresh receive address.
    pub fn fresh_receive_address(&mut self) -> Result<Address, WalletError> {
        let index = self.chain_state.issue_next(KeyChain::External);
        let address = self.keys.derive_address(KeyChain::External, index)?;
        self.scripts
            .insert(address.script_pubkey(), KeyChain::External, index);
        Ok(address)
    }

    /// All issued addresses across both chains, external first.
    pub fn issued_addresses(&self) -> Result<Vec<Address>, WalletError> {
        let mut addresses = Vec::new();
        for chain in [KeyChain::External, KeyChain::Internal] {
            for index in 0..self.chain_state.issued(chain) {
                addresses.push(self.keys.derive_address(chain, index)?);
            }
        }
        Ok(addresses)
    }

    pub fn balance(&self) -> u64 {
        self.store.balance(&self.scripts)
    }

    /// Local chain height, -1 when no block has been processed yet.
    pub fn local_height(&self) -> i64 {
        self.last_block
            .as_ref()
            .map(|b| b.height as i64)
            .unwrap_or(-1)
    }

    fn rebuild_scripts(&mut self) -> Result<(), WalletError> {
        for chain in [KeyChain::External, KeyChain::Internal] {
            for index in 0..self.chain_state.issued(chain) {
                let address = self.keys.derive_address(chain, index)?;
                self.scripts.insert(address.script_pubkey(), chain, index);
            }
        }
        Ok(())
    }
}

/// Assemble the persisted form. Free function so ingestion can snapshot
/// mid-batch while the store is mutably borrowed.
#[allow(clippy::too_many_arguments)]
pub fn build_wallet_data(
    config: &WalletConfig,
    keys: &KeyTree,
    chain_state: &KeyChainState,
    encrypted_seed: &EncryptedSeed,
    last_block: &Option<BlockRef>,
    created_at: &DateTime<Utc>,
    store: &TransactionStore,
) -> WalletData {
    WalletData {
        network: config.network.to_string(),
        encrypted_seed: encrypted_seed.clone(),
        account_xpub: keys.account_xpub().to_string(),
        chain_state: *chain_state,
        last_block: last_block.clone(),
        transactions: store.to_stored(),
        created_at: *created_at,
    }
}
