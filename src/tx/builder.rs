//! Payment construction
//!
//! Coin selection, change computation and fee estimation for a new
//! payment. Candidates are spent smallest-first to favor consolidating
//! small outputs; the fee estimate and the input set converge iteratively,
//! bounded by the wallet's total UTXO count.

use bitcoin::absolute::LockTime;
use bitcoin::transaction::Version;
use bitcoin::{Address, Amount, ScriptBuf, Sequence, Transaction, TxIn, TxOut, Witness};
use std::str::FromStr;

use super::signer::ScriptKind;
use crate::context::WalletContext;
use crate::error::WalletError;
use crate::keys::KeyChain;
use crate::store::UtxoCandidate;

/// Fixed transaction overhead (version, counts, locktime) in bytes.
const TX_BASE_SIZE: usize = 10;
/// Estimated serialized size of one output.
const OUTPUT_SIZE: usize = 34;

/// A fully constructed, not yet signed payment.
#[derive(Debug, Clone)]
pub struct PendingPayment {
    pub tx: Transaction,
    /// Connected outputs backing each input, aligned with `tx.input`
    pub selected: Vec<UtxoCandidate>,
    pub destination: Address,
    pub amount: u64,
    pub fee: u64,
    /// Change returned to the wallet; 0 when folded into the fee
    pub change: u64,
    /// Estimated serialized size the fee was computed from
    pub size: usize,
}

/// Build a payment of `amount` satoshis to `destination` at the given fee
/// rate (satoshis per 1024 bytes).
///
/// Validation order: dust, network maximum, spendable balance. The
/// returned transaction never carries an output below the dust threshold;
/// dust change is folded into the fee instead.
pub fn create_transaction(
    ctx: &mut WalletContext,
    destination: &str,
    amount: u64,
    fee_rate_per_kb: u64,
) -> Result<PendingPayment, WalletError> {
    let network = ctx.config.network;
    let dust = ctx.config.dust_threshold;

    let destination = Address::from_str(destination)
        .map_err(|e| WalletError::InvalidAddress(e.to_string()))?
        .require_network(network)
        .map_err(|e| WalletError::InvalidAddress(e.to_string()))?;

    if amount < dust {
        return Err(WalletError::DustAmount {
            amount,
            threshold: dust,
        });
    }
    if amount > ctx.config.max_money() {
        return Err(WalletError::ExceedsMaxMoney(amount));
    }

    // Spendable candidates with their script kinds; anything the signer
    // could not redeem is excluded up front.
    let mut candidates = Vec::new();
    for candidate in ctx.store.spendable_outputs(&ctx.scripts, dust) {
        let pubkey = ctx.keys.derive_public_key(candidate.chain, candidate.index)?;
        match ScriptKind::for_output(&candidate.script_pubkey, &pubkey) {
            Some(kind) => candidates.push((candidate, kind)),
            None => log::warn!(
                "Skipping unspendable candidate {} (unknown script kind)",
                candidate.outpoint
            ),
        }
    }

    let available: u64 = candidates.iter().map(|(c, _)| c.value).sum();
    if amount > available {
        return Err(WalletError::InsufficientBalance {
            needed: amount,
            available,
        });
    }

    // Smallest-first selection order, outpoint as a stable tiebreak.
    candidates.sort_by(|(a, _), (b, _)| {
        a.value
            .cmp(&b.value)
            .then_with(|| a.outpoint.cmp(&b.outpoint))
    });

    // Payment output plus mandatory protocol-fee outputs above dust.
    let mut base_outputs = vec![TxOut {
        value: Amount::from_sat(amount),
        script_pubkey: destination.script_pubkey(),
    }];
    for protocol_fee in &ctx.config.protocol_fees {
        if protocol_fee.value >= dust {
            base_outputs.push(TxOut {
                value: Amount::from_sat(protocol_fee.value),
                script_pubkey: protocol_fee.address.script_pubkey(),
            });
        }
    }
    let base_value: u64 = base_outputs.iter().map(|o| o.value.to_sat()).sum();

    // Iterative fee convergence: a higher fee can only pull in more
    // inputs, so the loop terminates within the candidate count.
    let mut fee = 0u64;
    let (selected, input_total, size) = loop {
        let target = base_value + fee;
        let (selected, input_total) = select_candidates(&candidates, target, available)?;

        let change = input_total - target;
        let output_count = base_outputs.len() + usize::from(change >= dust);
        let size = estimate_size(&selected, output_count);
        let required = fee_rate_per_kb.saturating_mul(size as u64) / 1024;

        if required > fee {
            fee = required;
            continue;
        }
        break (selected, input_total, size);
    };

    let change = input_total - base_value - fee;
    let mut outputs = base_outputs;
    let include_change = change >= dust;
    if include_change {
        let change_index = ctx.chain_state.issue_next(KeyChain::Internal);
        let change_address = ctx.keys.derive_address(KeyChain::Internal, change_index)?;
        ctx.scripts.insert(
            change_address.script_pubkey(),
            KeyChain::Internal,
            change_index,
        );
        outputs.push(TxOut {
            value: Amount::from_sat(change),
            script_pubkey: change_address.script_pubkey(),
        });
    } else if change > 0 {
        log::debug!("Folding dust change of {} sats into the fee", change);
    }

    let tx = Transaction {
        version: Version::TWO,
        lock_time: LockTime::ZERO,
        input: selected
            .iter()
            .map(|(c, _)| TxIn {
                previous_output: c.outpoint,
                script_sig: ScriptBuf::new(),
                sequence: Sequence::MAX,
                witness: Witness::new(),
            })
            .collect(),
        output: outputs,
    };

    let fee_paid = if include_change { fee } else { fee + change };
    log::info!(
        "Built payment of {} sats to {} ({} inputs, fee {} sats, ~{} bytes)",
        amount,
        destination,
        tx.input.len(),
        fee_paid,
        size
    );

    Ok(PendingPayment {
        tx,
        selected: selected.into_iter().map(|(c, _)| c).collect(),
        destination,
        amount,
        fee: fee_paid,
        change: if include_change { change } else { 0 },
        size,
    })
}

/// Accumulate sorted candidates until they cover `target`.
fn select_candidates(
    candidates: &[(UtxoCandidate, ScriptKind)],
    target: u64,
    available: u64,
) -> Result<(Vec<(UtxoCandidate, ScriptKind)>, u64), WalletError> {
    let mut selected = Vec::new();
    let mut total = 0u64;
    for (candidate, kind) in candidates {
        selected.push((candidate.clone(), kind.clone()));
        total += candidate.value;
        if total >= target {
            return Ok((selected, total));
        }
    }
    Err(WalletError::InsufficientBalance {
        needed: target,
        available,
    })
}

/// Estimated serialized size: fixed overhead, per-output size and
/// per-input size by script kind.
fn estimate_size(selected: &[(UtxoCandidate, ScriptKind)], output_count: usize) -> usize {
    TX_BASE_SIZE
        + OUTPUT_SIZE * output_count
        + selected
            .iter()
            .map(|(_, kind)| kind.input_size())
            .sum::<usize>()
}
