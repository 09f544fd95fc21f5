//! Gap-limit address scanner
//!
//! Probes ranges of derived addresses against the provider to discover
//! historical activity. The scan always terminates: it derives one batch
//! per provider call and stops after `inactivity_threshold` consecutive
//! empty batches, so a history whose last active index is L costs at most
//! `ceil((L + threshold * batch_size) / batch_size)` calls.

use bitcoin::Txid;
use std::collections::HashMap;

use crate::error::WalletError;
use crate::keys::{KeyChain, KeyTree};
use crate::provider::{ChainProvider, ProviderTx};

/// Result of scanning one chain.
#[derive(Debug)]
pub struct ScanOutcome {
    /// Number of addresses (relative to `from_index`) to freshly issue:
    /// everything up to and including the last active index, trailing
    /// inactive addresses trimmed.
    pub issued: u32,
    /// Discovered transactions, deduplicated by id.
    pub transactions: Vec<ProviderTx>,
}

/// Scan one chain starting at `from_index`.
///
/// Derives `batch_size` consecutive addresses per step and queries the
/// provider for their full history. Activity resets the inactivity
/// counter; the index always advances by the batch size. Any provider
/// error aborts the scan before any chain state is issued, so a failed
/// cycle never loses causal history.
pub async fn scan_chain(
    keys: &KeyTree,
    chain: KeyChain,
    from_index: u32,
    batch_size: u32,
    inactivity_threshold: u32,
    provider: &dyn ChainProvider,
) -> Result<ScanOutcome, WalletError> {
    let mut index = from_index;
    let mut inactive_batches = 0u32;
    let mut last_active: Option<u32> = None;
    let mut discovered: HashMap<Txid, ProviderTx> = HashMap::new();
    let mut batches = 0u32;

    while inactive_batches < inactivity_threshold {
        let batch = keys.derive_addresses(chain, index, batch_size)?;
        let addresses: Vec<_> = batch.iter().map(|(_, a)| a.clone()).collect();

        let history = provider.history(&addresses, 0).await?;
        batches += 1;

        if history.is_empty() {
            inactive_batches += 1;
        } else {
            inactive_batches = 0;
            // An address is active when some returned transaction pays it;
            // spends from it are always preceded by such a payment.
            for ptx in history {
                for (batch_index, address) in &batch {
                    let script = address.script_pubkey();
                    if ptx.tx.output.iter().any(|o| o.script_pubkey == script) {
                        last_active = Some(last_active.map_or(*batch_index, |l| l.max(*batch_index)));
                    }
                }
                discovered.entry(ptx.txid()).or_insert(ptx);
            }
        }

        index += batch_size;
    }

    let issued = last_active.map_or(0, |l| l + 1 - from_index);
    log::debug!(
        "Scanned {:?} chain from {}: {} batches, {} transactions, issuing {}",
        chain,
        from_index,
        batches,
        discovered.len(),
        issued
    );

    Ok(ScanOutcome {
        issued,
        transactions: discovered.into_values().collect(),
    })
}
