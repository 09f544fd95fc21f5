//! Persisted wallet file
//!
//! A single JSON file is the source of truth: encrypted master seed,
//! issued-key counters, tracked transactions and the last-seen chain tip.
//! It is rewritten after every state-changing operation; writes go to a
//! temp file first and are renamed into place so a crash mid-write leaves
//! the previous version intact.

use bitcoin::BlockHash;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use super::transactions::StoredTransaction;
use crate::error::StorageError;
use crate::keys::{EncryptedSeed, KeyChainState};

/// Last block the wallet has fully processed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlockRef {
    pub hash: BlockHash,
    pub height: u32,
    pub time: u64,
}

/// Everything the wallet persists.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WalletData {
    pub network: String,
    pub encrypted_seed: EncryptedSeed,
    pub account_xpub: String,
    pub chain_state: KeyChainState,
    pub last_block: Option<BlockRef>,
    pub transactions: Vec<StoredTransaction>,
    pub created_at: DateTime<Utc>,
}

pub struct WalletFile {
    path: PathBuf,
}

impl WalletFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn exists(&self) -> bool {
        self.path.exists()
    }

    pub fn load(&self) -> Result<WalletData, StorageError> {
        if !self.path.exists() {
            return Err(StorageError::FileNotFound(self.path.display().to_string()));
        }
        let contents = fs::read_to_string(&self.path)?;
        let data = serde_json::from_str(&contents)?;
        Ok(data)
    }

    /// Atomic save: write to a sibling temp file, then rename over the
    /// target. Rename within one directory is atomic on the platforms we
    /// care about.
    pub fn save(&self, data: &WalletData) -> Result<(), StorageError> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let json = serde_json::to_string_pretty(data)?;
        let tmp = self.path.with_extension("tmp");
        fs::write(&tmp, json)?;
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }

    pub fn delete(&self) -> Result<(), StorageError> {
        if !self.path.exists() {
            return Err(StorageError::FileNotFound(self.path.display().to_string()));
        }
        log::warn!("Deleting wallet file: {:?}", self.path);
        fs::remove_file(&self.path)?;
        Ok(())
    }
}
