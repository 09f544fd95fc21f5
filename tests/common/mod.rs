#![allow(dead_code)]

use async_trait::async_trait;
use bitcoin::absolute::LockTime;
use bitcoin::hashes::Hash;
use bitcoin::transaction::Version;
use bitcoin::{
    Address, Amount, BlockHash, Network, OutPoint, ScriptBuf, Sequence, Transaction, TxIn, TxOut,
    Txid, Witness,
};
use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use std::time::Duration;

use bitwallet::config::WalletConfig;
use bitwallet::context::WalletContext;
use bitwallet::error::ProviderError;
use bitwallet::provider::{BlockAppearance, ChainProvider, ChainTip, ProviderTx, TipStatus};
use bitwallet::store::WalletFile;

pub const TOKEN: &str = "correct horse battery staple";

pub fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Testnet config with small scan parameters and near-instant KDF/backoff
/// so tests stay fast.
pub fn test_config() -> WalletConfig {
    let mut config = WalletConfig::default_for(Network::Testnet);
    config.scan_batch_size = 5;
    config.inactivity_threshold = 2;
    config.retry_backoff = Duration::from_millis(5);
    config.kdf_target = Duration::from_millis(1);
    config
}

pub fn new_wallet(dir: &tempfile::TempDir) -> (WalletContext, String) {
    new_wallet_with(dir, test_config())
}

pub fn new_wallet_with(dir: &tempfile::TempDir, config: WalletConfig) -> (WalletContext, String) {
    let file = WalletFile::new(dir.path().join("wallet.json"));
    let (ctx, mnemonic) = WalletContext::create_new(config, file, TOKEN).unwrap();
    (ctx, mnemonic.to_string())
}

pub fn block_hash(height: u32) -> BlockHash {
    let mut bytes = [0u8; 32];
    bytes[..4].copy_from_slice(&height.to_le_bytes());
    BlockHash::from_byte_array(bytes)
}

/// A coinbase-style transaction paying `value` sats to `address`. The tag
/// lands in the input script so repeated payments get distinct txids.
pub fn coinbase_paying(address: &Address, value: u64, tag: u32) -> Transaction {
    Transaction {
        version: Version::TWO,
        lock_time: LockTime::ZERO,
        input: vec![TxIn {
            previous_output: OutPoint::null(),
            script_sig: ScriptBuf::from_bytes(tag.to_le_bytes().to_vec()),
            sequence: Sequence::MAX,
            witness: Witness::new(),
        }],
        output: vec![TxOut {
            value: Amount::from_sat(value),
            script_pubkey: address.script_pubkey(),
        }],
    }
}

/// A transaction spending output `vout` of `parent` into `outputs`.
pub fn spend(parent: &Transaction, vout: u32, outputs: Vec<TxOut>) -> Transaction {
    Transaction {
        version: Version::TWO,
        lock_time: LockTime::ZERO,
        input: vec![TxIn {
            previous_output: OutPoint::new(parent.compute_txid(), vout),
            script_sig: ScriptBuf::new(),
            sequence: Sequence::MAX,
            witness: Witness::new(),
        }],
        output: outputs,
    }
}

pub fn out(value: u64, address: &Address) -> TxOut {
    TxOut {
        value: Amount::from_sat(value),
        script_pubkey: address.script_pubkey(),
    }
}

/// A testnet address the wallet does not control.
pub fn foreign_address() -> Address {
    use std::str::FromStr;
    Address::from_str("mipcBbFg9gMiCh81Kj8tqqdgoZub1ZJRfn")
        .unwrap()
        .require_network(Network::Testnet)
        .unwrap()
}

pub fn confirmed(tx: Transaction, height: u32, time: u64) -> ProviderTx {
    ProviderTx {
        tx,
        block: Some(BlockAppearance {
            hash: block_hash(height),
            height,
            index: 0,
            time,
        }),
        time,
    }
}

pub fn pending(tx: Transaction, time: u64) -> ProviderTx {
    ProviderTx {
        tx,
        block: None,
        time,
    }
}

struct MockState {
    tip: ChainTip,
    txs: HashMap<Txid, ProviderTx>,
    fail_tips: u32,
    fail_dependencies: bool,
    broadcast_ok: bool,
    tip_calls: u32,
    history_calls: u32,
    tx_fetches: Vec<Txid>,
    broadcasts: Vec<Txid>,
    subscriptions: Vec<(String, usize)>,
}

/// Scripted in-memory provider. Holds a closed set of "network"
/// transactions; history matching follows the real provider's semantics
/// (a transaction touches an address when it pays it or spends one of its
/// outputs).
pub struct MockProvider {
    state: Mutex<MockState>,
}

impl MockProvider {
    pub fn new(tip_height: u32) -> Self {
        Self {
            state: Mutex::new(MockState {
                tip: ChainTip {
                    height: tip_height,
                    hash: block_hash(tip_height),
                    time: 1_700_000_000,
                    status: TipStatus::Synchronized,
                },
                txs: HashMap::new(),
                fail_tips: 0,
                fail_dependencies: false,
                broadcast_ok: true,
                tip_calls: 0,
                history_calls: 0,
                tx_fetches: Vec::new(),
                broadcasts: Vec::new(),
                subscriptions: Vec::new(),
            }),
        }
    }

    pub fn add_tx(&self, ptx: ProviderTx) {
        let mut state = self.state.lock().unwrap();
        state.txs.insert(ptx.txid(), ptx);
    }

    pub fn set_tip(&self, height: u32, time: u64) {
        let mut state = self.state.lock().unwrap();
        state.tip = ChainTip {
            height,
            hash: block_hash(height),
            time,
            status: TipStatus::Synchronized,
        };
    }

    pub fn fail_next_tips(&self, count: u32) {
        self.state.lock().unwrap().fail_tips = count;
    }

    pub fn fail_dependencies(&self, fail: bool) {
        self.state.lock().unwrap().fail_dependencies = fail;
    }

    pub fn reject_broadcasts(&self) {
        self.state.lock().unwrap().broadcast_ok = false;
    }

    pub fn tip_calls(&self) -> u32 {
        self.state.lock().unwrap().tip_calls
    }

    pub fn history_calls(&self) -> u32 {
        self.state.lock().unwrap().history_calls
    }

    pub fn tx_fetches(&self) -> Vec<Txid> {
        self.state.lock().unwrap().tx_fetches.clone()
    }

    pub fn broadcasts(&self) -> Vec<Txid> {
        self.state.lock().unwrap().broadcasts.clone()
    }

    pub fn subscriptions(&self) -> Vec<(String, usize)> {
        self.state.lock().unwrap().subscriptions.clone()
    }
}

fn touches(txs: &HashMap<Txid, ProviderTx>, ptx: &ProviderTx, scripts: &HashSet<ScriptBuf>) -> bool {
    if ptx
        .tx
        .output
        .iter()
        .any(|o| scripts.contains(&o.script_pubkey))
    {
        return true;
    }
    ptx.tx.input.iter().any(|input| {
        txs.get(&input.previous_output.txid)
            .and_then(|parent| parent.tx.output.get(input.previous_output.vout as usize))
            .is_some_and(|o| scripts.contains(&o.script_pubkey))
    })
}

fn in_range(ptx: &ProviderTx, since_height: u32) -> bool {
    match &ptx.block {
        Some(block) => block.height >= since_height,
        // Pending transactions are always part of the history.
        None => true,
    }
}

#[async_trait]
impl ChainProvider for MockProvider {
    async fn chain_tip(&self) -> Result<ChainTip, ProviderError> {
        let mut state = self.state.lock().unwrap();
        state.tip_calls += 1;
        if state.fail_tips > 0 {
            state.fail_tips -= 1;
            return Err(ProviderError::Network("mock outage".into()));
        }
        Ok(state.tip.clone())
    }

    async fn history(
        &self,
        addresses: &[Address],
        since_height: u32,
    ) -> Result<Vec<ProviderTx>, ProviderError> {
        let mut state = self.state.lock().unwrap();
        state.history_calls += 1;
        let scripts: HashSet<ScriptBuf> = addresses.iter().map(|a| a.script_pubkey()).collect();
        let mut matches: Vec<ProviderTx> = state
            .txs
            .values()
            .filter(|ptx| in_range(ptx, since_height) && touches(&state.txs, ptx, &scripts))
            .cloned()
            .collect();
        matches.sort_by_key(|p| p.time);
        Ok(matches)
    }

    async fn transaction(&self, txid: Txid) -> Result<Option<ProviderTx>, ProviderError> {
        let mut state = self.state.lock().unwrap();
        state.tx_fetches.push(txid);
        Ok(state.txs.get(&txid).cloned())
    }

    async fn dependencies(
        &self,
        txid: Txid,
    ) -> Result<HashMap<Txid, Transaction>, ProviderError> {
        let state = self.state.lock().unwrap();
        if state.fail_dependencies {
            return Err(ProviderError::Network("mock dependency outage".into()));
        }
        let Some(ptx) = state.txs.get(&txid) else {
            return Ok(HashMap::new());
        };
        let mut parents = HashMap::new();
        for input in &ptx.tx.input {
            if input.previous_output.is_null() {
                continue;
            }
            if let Some(parent) = state.txs.get(&input.previous_output.txid) {
                parents.insert(input.previous_output.txid, parent.tx.clone());
            }
        }
        Ok(parents)
    }

    async fn broadcast(&self, tx: &Transaction) -> Result<bool, ProviderError> {
        let mut state = self.state.lock().unwrap();
        let txid = tx.compute_txid();
        state.broadcasts.push(txid);
        if !state.broadcast_ok {
            return Ok(false);
        }
        state.txs.insert(
            txid,
            ProviderTx {
                tx: tx.clone(),
                block: None,
                time: 1_700_000_000,
            },
        );
        Ok(true)
    }

    async fn subscribe(
        &self,
        push_token: &str,
        _wallet_id: &str,
        addresses: &[Address],
    ) -> Result<bool, ProviderError> {
        let mut state = self.state.lock().unwrap();
        state
            .subscriptions
            .push((push_token.to_string(), addresses.len()));
        Ok(true)
    }
}
