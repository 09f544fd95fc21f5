//! Tracked-transaction ledger
//!
//! Holds every transaction known to touch the wallet, the resolution state
//! of their inputs, and block-appearance metadata. Balance and the UTXO
//! candidate set are always derived views over the connected graph; nothing
//! is cached separately, so they cannot drift.

use bitcoin::{OutPoint, ScriptBuf, Transaction, Txid};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

use crate::error::{StorageError, WalletError};
use crate::keys::KeyChain;
use crate::provider::{BlockAppearance, ChainProvider, ProviderTx};

/// Confidence state of a tracked transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Confidence {
    /// Seen but not yet in a block
    Pending,
    /// In a block; depth counts confirmations
    Building,
    /// An input was spent by a conflicting confirmed transaction
    Dead,
}

/// The value and script of the output an input spends.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolvedOutput {
    pub value: u64,
    pub script_pubkey: ScriptBuf,
}

/// An input and its connection to the output it spends. Unresolved until
/// the parent transaction is known.
#[derive(Debug, Clone)]
pub struct TrackedInput {
    pub outpoint: OutPoint,
    pub resolved: Option<ResolvedOutput>,
}

/// Spend direction relative to the wallet's own addresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Sent,
    Received,
}

#[derive(Debug, Clone)]
pub struct TrackedTransaction {
    pub tx: Transaction,
    pub txid: Txid,
    pub inputs: Vec<TrackedInput>,
    pub block: Option<BlockAppearance>,
    /// Block time when confirmed, first-seen time otherwise
    pub time: u64,
    /// Confirmations; monotonically non-decreasing once set
    pub depth: u32,
    pub confidence: Confidence,
}

impl TrackedTransaction {
    pub fn from_provider(ptx: ProviderTx) -> Self {
        let txid = ptx.txid();
        let inputs = ptx
            .tx
            .input
            .iter()
            .map(|input| TrackedInput {
                outpoint: input.previous_output,
                // A coinbase input spends nothing
                resolved: if input.previous_output.is_null() {
                    Some(ResolvedOutput {
                        value: 0,
                        script_pubkey: ScriptBuf::new(),
                    })
                } else {
                    None
                },
            })
            .collect();
        let confidence = if ptx.block.is_some() {
            Confidence::Building
        } else {
            Confidence::Pending
        };
        Self {
            txid,
            inputs,
            block: ptx.block,
            time: ptx.time,
            depth: 0,
            confidence,
            tx: ptx.tx,
        }
    }

    /// True while any non-coinbase input lacks its connected output.
    /// Until resolution completes, neither the exact fee nor the spend
    /// direction can be computed.
    pub fn requires_dependencies(&self) -> bool {
        self.inputs.iter().any(|input| input.resolved.is_none())
    }

    /// Total value of resolved inputs spending wallet-owned outputs.
    pub fn value_sent(&self, owned: &ScriptIndex) -> u64 {
        self.inputs
            .iter()
            .filter_map(|input| input.resolved.as_ref())
            .filter(|resolved| owned.contains(&resolved.script_pubkey))
            .map(|resolved| resolved.value)
            .sum()
    }

    /// Total value of outputs addressed to the wallet.
    pub fn value_received(&self, owned: &ScriptIndex) -> u64 {
        self.tx
            .output
            .iter()
            .filter(|output| owned.contains(&output.script_pubkey))
            .map(|output| output.value.to_sat())
            .sum()
    }

    /// Wallet-relative direction; `None` until all inputs are resolved.
    pub fn direction(&self, owned: &ScriptIndex) -> Option<Direction> {
        if self.requires_dependencies() {
            return None;
        }
        if self.value_sent(owned) > self.value_received(owned) {
            Some(Direction::Sent)
        } else {
            Some(Direction::Received)
        }
    }

    /// Exact fee; `None` until all inputs are resolved.
    pub fn fee(&self) -> Option<u64> {
        if self.requires_dependencies() {
            return None;
        }
        let input_value: u64 = self
            .inputs
            .iter()
            .filter_map(|input| input.resolved.as_ref())
            .map(|resolved| resolved.value)
            .sum();
        let output_value: u64 = self.tx.output.iter().map(|o| o.value.to_sat()).sum();
        input_value.checked_sub(output_value)
    }

    /// Raise the confirmation depth. Depth never decreases once set from a
    /// remote height.
    pub fn update_depth(&mut self, depth: u32) -> bool {
        if depth > self.depth {
            self.depth = depth;
            return true;
        }
        false
    }
}

/// Map from wallet-owned script to the key path that controls it.
#[derive(Debug, Clone, Default)]
pub struct ScriptIndex {
    scripts: HashMap<ScriptBuf, (KeyChain, u32)>,
}

impl ScriptIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, script: ScriptBuf, chain: KeyChain, index: u32) {
        self.scripts.insert(script, (chain, index));
    }

    pub fn contains(&self, script: &ScriptBuf) -> bool {
        self.scripts.contains_key(script)
    }

    pub fn lookup(&self, script: &ScriptBuf) -> Option<(KeyChain, u32)> {
        self.scripts.get(script).copied()
    }

    pub fn len(&self) -> usize {
        self.scripts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.scripts.is_empty()
    }
}

/// A spendable output of the wallet, recomputed on demand.
#[derive(Debug, Clone)]
pub struct UtxoCandidate {
    pub outpoint: OutPoint,
    pub value: u64,
    pub script_pubkey: ScriptBuf,
    pub chain: KeyChain,
    pub index: u32,
}

/// A confirmation-depth transition observed while advancing the tip.
#[derive(Debug, Clone, Copy)]
pub struct DepthChange {
    pub txid: Txid,
    pub old: u32,
    pub new: u32,
}

/// Outcome of one ingestion batch.
#[derive(Debug, Default)]
pub struct IngestReport {
    pub inserted: Vec<Txid>,
    pub merged: Vec<Txid>,
}

impl IngestReport {
    pub fn is_empty(&self) -> bool {
        self.inserted.is_empty() && self.merged.is_empty()
    }
}

#[derive(Debug, Default)]
pub struct TransactionStore {
    txs: HashMap<Txid, TrackedTransaction>,
}

impl TransactionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_transactions(txs: Vec<TrackedTransaction>) -> Self {
        Self {
            txs: txs.into_iter().map(|t| (t.txid, t)).collect(),
        }
    }

    pub fn find(&self, txid: &Txid) -> Option<&TrackedTransaction> {
        self.txs.get(txid)
    }

    pub fn len(&self) -> usize {
        self.txs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.txs.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &TrackedTransaction> {
        self.txs.values()
    }

    /// Transactions ordered oldest-first, with the txid as a tiebreak so
    /// the order is stable across runs.
    pub fn transactions_by_time(&self) -> Vec<&TrackedTransaction> {
        let mut list: Vec<_> = self.txs.values().collect();
        list.sort_by(|a, b| a.time.cmp(&b.time).then_with(|| a.txid.cmp(&b.txid)));
        list
    }

    /// Outpoints consumed by any live (non-dead) tracked transaction.
    pub fn spent_outpoints(&self) -> HashSet<OutPoint> {
        self.txs
            .values()
            .filter(|t| t.confidence != Confidence::Dead)
            .flat_map(|t| t.inputs.iter().map(|i| i.outpoint))
            .collect()
    }

    /// Balance = sum of connected, unspent, wallet-owned outputs of
    /// pending-or-building transactions. Always derived, never cached.
    pub fn balance(&self, owned: &ScriptIndex) -> u64 {
        self.spendable_outputs(owned, 0).iter().map(|c| c.value).sum()
    }

    /// Unspent wallet-owned outputs above the dust threshold, usable as
    /// transaction inputs.
    pub fn spendable_outputs(&self, owned: &ScriptIndex, dust: u64) -> Vec<UtxoCandidate> {
        let spent = self.spent_outpoints();
        let mut candidates = Vec::new();

        for tracked in self.txs.values() {
            if tracked.confidence == Confidence::Dead {
                continue;
            }
            for (vout, output) in tracked.tx.output.iter().enumerate() {
                let value = output.value.to_sat();
                if value < dust {
                    continue;
                }
                let Some((chain, index)) = owned.lookup(&output.script_pubkey) else {
                    continue;
                };
                let outpoint = OutPoint::new(tracked.txid, vout as u32);
                if spent.contains(&outpoint) {
                    continue;
                }
                candidates.push(UtxoCandidate {
                    outpoint,
                    value,
                    script_pubkey: output.script_pubkey.clone(),
                    chain,
                    index,
                });
            }
        }
        candidates
    }

    /// Ingest a batch of discovered transactions.
    ///
    /// Phase 1 resolves every missing dependency for the whole batch
    /// without touching the ledger, so a failed fetch leaves the store
    /// unchanged and surfaces as [`WalletError::DependencyFetchFailure`].
    /// Phase 2 inserts/merges in time order, connects inputs and invokes
    /// `persist` after each fully resolved transaction, so a crash never
    /// requires replaying the whole batch.
    pub async fn add_transactions(
        &mut self,
        batch: Vec<ProviderTx>,
        provider: &dyn ChainProvider,
        persist: &mut (dyn FnMut(&TransactionStore) -> Result<(), StorageError> + Send),
    ) -> Result<IngestReport, WalletError> {
        let mut ordered = batch;
        ordered.sort_by(|a, b| a.time.cmp(&b.time).then_with(|| a.txid().cmp(&b.txid())));

        // Outputs available for connecting inputs: tracked transactions,
        // batch siblings, and fetched parents.
        let mut known: HashMap<Txid, Transaction> = self
            .txs
            .values()
            .map(|t| (t.txid, t.tx.clone()))
            .collect();
        for ptx in &ordered {
            known.entry(ptx.txid()).or_insert_with(|| ptx.tx.clone());
        }

        // Phase 1: fetch everything the batch needs, mutating nothing.
        for ptx in &ordered {
            let txid = ptx.txid();
            let needs_fetch = ptx.tx.input.iter().any(|input| {
                !input.previous_output.is_null()
                    && !known.contains_key(&input.previous_output.txid)
            });
            if !needs_fetch {
                continue;
            }

            log::debug!("Fetching dependencies of {}", txid);
            let parents = provider
                .dependencies(txid)
                .await
                .map_err(|e| {
                    log::warn!("Dependency fetch for {} failed: {}", txid, e);
                    WalletError::DependencyFetchFailure { txid }
                })?;
            for (parent_id, parent) in parents {
                known.insert(parent_id, parent);
            }

            if let Some(missing) = ptx.tx.input.iter().find(|input| {
                !input.previous_output.is_null()
                    && !known.contains_key(&input.previous_output.txid)
            }) {
                return Err(WalletError::DependencyFetchFailure {
                    txid: missing.previous_output.txid,
                });
            }
        }

        // Phase 2: insert/merge oldest-first, connect, persist per tx.
        let mut report = IngestReport::default();
        for ptx in ordered {
            let txid = ptx.txid();

            if self.txs.contains_key(&txid) {
                // Merge block appearance without discarding resolution state.
                let mut did_merge = false;
                if let Some(existing) = self.txs.get_mut(&txid) {
                    if existing.block.is_none() && ptx.block.is_some() {
                        existing.block = ptx.block.clone();
                        existing.confidence = Confidence::Building;
                        if let Some(block) = &existing.block {
                            existing.time = block.time;
                        }
                        did_merge = true;
                    }
                }
                if did_merge {
                    log::debug!("Transaction {} confirmed", txid);
                    report.merged.push(txid);
                    persist(&*self)?;
                }
                continue;
            }

            let mut tracked = TrackedTransaction::from_provider(ptx);
            for input in tracked.inputs.iter_mut() {
                if input.resolved.is_some() {
                    continue;
                }
                let parent = known.get(&input.outpoint.txid).ok_or(
                    WalletError::DependencyFetchFailure {
                        txid: input.outpoint.txid,
                    },
                )?;
                let output = parent
                    .output
                    .get(input.outpoint.vout as usize)
                    .ok_or_else(|| {
                        WalletError::Internal(format!(
                            "Dependency {} has no output {}",
                            input.outpoint.txid, input.outpoint.vout
                        ))
                    })?;
                input.resolved = Some(ResolvedOutput {
                    value: output.value.to_sat(),
                    script_pubkey: output.script_pubkey.clone(),
                });
            }

            self.mark_conflicts(&tracked);
            log::debug!(
                "Tracking transaction {} ({})",
                txid,
                if tracked.block.is_some() {
                    "confirmed"
                } else {
                    "pending"
                }
            );
            self.txs.insert(txid, tracked);
            report.inserted.push(txid);
            persist(&*self)?;
        }

        Ok(report)
    }

    /// A confirmed arrival spending an outpoint already claimed by a
    /// pending transaction kills the pending one.
    fn mark_conflicts(&mut self, incoming: &TrackedTransaction) {
        if incoming.block.is_none() {
            return;
        }
        let incoming_spends: HashSet<OutPoint> =
            incoming.inputs.iter().map(|i| i.outpoint).collect();
        for tracked in self.txs.values_mut() {
            if tracked.confidence != Confidence::Pending {
                continue;
            }
            if tracked
                .inputs
                .iter()
                .any(|i| incoming_spends.contains(&i.outpoint))
            {
                log::warn!(
                    "Transaction {} is dead: conflicts with confirmed {}",
                    tracked.txid,
                    incoming.txid
                );
                tracked.confidence = Confidence::Dead;
            }
        }
    }

    /// Recompute confirmation depths against a new tip height. Returns the
    /// transactions whose depth changed, with old and new depth, so the
    /// caller can fire threshold-crossing notifications exactly once.
    pub fn update_depths(&mut self, tip_height: u32) -> Vec<DepthChange> {
        let mut changed = Vec::new();
        for tracked in self.txs.values_mut() {
            let Some(block) = &tracked.block else { continue };
            if block.height > tip_height {
                continue;
            }
            let old = tracked.depth;
            let new = tip_height - block.height + 1;
            if tracked.update_depth(new) {
                changed.push(DepthChange {
                    txid: tracked.txid,
                    old,
                    new,
                });
            }
        }
        changed
    }

    /// Snapshot for persistence.
    pub fn to_stored(&self) -> Vec<StoredTransaction> {
        self.transactions_by_time()
            .into_iter()
            .map(StoredTransaction::from_tracked)
            .collect()
    }
}

/// Serialized form of a tracked transaction in the wallet file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredTransaction {
    /// Consensus-encoded transaction, hex
    pub raw: String,
    pub time: u64,
    pub depth: u32,
    pub confidence: Confidence,
    pub block: Option<BlockAppearance>,
    /// Per-input connected output, in input order
    pub inputs: Vec<Option<ResolvedOutput>>,
}

impl StoredTransaction {
    pub fn from_tracked(tracked: &TrackedTransaction) -> Self {
        Self {
            raw: bitcoin::consensus::encode::serialize_hex(&tracked.tx),
            time: tracked.time,
            depth: tracked.depth,
            confidence: tracked.confidence,
            block: tracked.block.clone(),
            inputs: tracked.inputs.iter().map(|i| i.resolved.clone()).collect(),
        }
    }

    pub fn into_tracked(self) -> Result<TrackedTransaction, StorageError> {
        let raw = hex::decode(&self.raw)
            .map_err(|e| StorageError::Corrupt(format!("raw tx hex: {}", e)))?;
        let tx: Transaction = bitcoin::consensus::encode::deserialize(&raw)
            .map_err(|e| StorageError::Corrupt(format!("raw tx: {}", e)))?;
        if tx.input.len() != self.inputs.len() {
            return Err(StorageError::Corrupt(
                "input resolution count mismatch".into(),
            ));
        }
        let txid = tx.compute_txid();
        let inputs = tx
            .input
            .iter()
            .zip(self.inputs)
            .map(|(input, resolved)| TrackedInput {
                outpoint: input.previous_output,
                resolved,
            })
            .collect();
        Ok(TrackedTransaction {
            tx,
            txid,
            inputs,
            block: self.block,
            time: self.time,
            depth: self.depth,
            confidence: self.confidence,
        })
    }
}
