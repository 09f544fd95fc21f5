//! Transaction signing
//!
//! Script-type dispatch is a closed tagged variant: every spendable output
//! the wallet recognizes is P2PKH, P2WPKH or P2SH-nested-P2WPKH, and both
//! fee estimation and redeem-data construction branch on [`ScriptKind`]
//! instead of inspecting scripts at signing time.
//!
//! Signing is idempotent: an input whose existing script data already
//! satisfies the connected output is left untouched. The script shape must
//! match the kind, and the existing signature is re-verified against the
//! expected sighash rather than compared byte-for-byte.

use bitcoin::hashes::Hash;
use bitcoin::key::CompressedPublicKey;
use bitcoin::script::{Builder, PushBytesBuf, Script, ScriptBuf};
use bitcoin::secp256k1::{ecdsa, All, Message, Secp256k1};
use bitcoin::sighash::{EcdsaSighashType, SighashCache};
use bitcoin::{Amount, Network, PrivateKey, Transaction, Witness};

use crate::error::WalletError;
use crate::keys::{derive_private_key, KeyChain, Seed};
use crate::store::UtxoCandidate;

/// Output script scheme of a spendable output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScriptKind {
    P2pkh,
    P2wpkh,
    P2sh { redeem_script: ScriptBuf },
}

impl ScriptKind {
    /// Classify an output script against the key expected to control it.
    /// Returns `None` when the script is not a scheme this wallet can
    /// redeem with that key.
    pub fn for_output(script: &Script, pubkey: &CompressedPublicKey) -> Option<ScriptKind> {
        if script.is_p2pkh() {
            let expected = ScriptBuf::new_p2pkh(&pubkey.pubkey_hash());
            (script == expected.as_script()).then_some(ScriptKind::P2pkh)
        } else if script.is_p2wpkh() {
            let expected = ScriptBuf::new_p2wpkh(&pubkey.wpubkey_hash());
            (script == expected.as_script()).then_some(ScriptKind::P2wpkh)
        } else if script.is_p2sh() {
            // The only P2SH form the wallet issues is nested P2WPKH.
            let redeem_script = ScriptBuf::new_p2wpkh(&pubkey.wpubkey_hash());
            let expected = ScriptBuf::new_p2sh(&redeem_script.script_hash());
            (script == expected.as_script()).then_some(ScriptKind::P2sh { redeem_script })
        } else {
            None
        }
    }

    /// Estimated size contribution of the signature data for one input,
    /// in virtual bytes. Witness bytes count at a quarter weight.
    pub fn required_signature_size(&self) -> usize {
        match self {
            // scriptSig: 72-byte DER sig + 33-byte pubkey + pushes
            ScriptKind::P2pkh => 107,
            // same data in the witness, discounted
            ScriptKind::P2wpkh => 27,
            // redeem script push in scriptSig + discounted witness
            ScriptKind::P2sh { redeem_script } => 36 + redeem_script.len(),
        }
    }

    /// Total estimated input size: outpoint + sequence + script length
    /// prefix + signature data.
    pub fn input_size(&self) -> usize {
        41 + self.required_signature_size()
    }
}

/// Key material needed to satisfy one output script.
pub struct RedeemData {
    pub key: PrivateKey,
    pub pubkey: CompressedPublicKey,
    pub redeem_script: Option<ScriptBuf>,
}

/// Derive the redeem data for a candidate's script kind from the
/// decrypted seed.
pub fn build_redeem_data(
    kind: &ScriptKind,
    seed: &Seed,
    chain: KeyChain,
    index: u32,
    network: Network,
) -> Result<RedeemData, WalletError> {
    let secp = Secp256k1::new();
    let key = derive_private_key(seed, chain, index, network)?;
    let pubkey = CompressedPublicKey::from_private_key(&secp, &key)
        .map_err(|e| WalletError::Bitcoin(e.to_string()))?;
    let redeem_script = match kind {
        ScriptKind::P2sh { redeem_script } => Some(redeem_script.clone()),
        _ => None,
    };
    Ok(RedeemData {
        key,
        pubkey,
        redeem_script,
    })
}

enum InputSig {
    /// Existing script already satisfies the output
    Skip,
    Legacy { script_sig: ScriptBuf },
    Segwit { script_sig: ScriptBuf, witness: Witness },
}

/// Sign every input of `tx` in place. `candidates` must be aligned with
/// the inputs; each carries the connected output's script and the key path
/// that controls it. Inputs that already spend correctly are no-ops.
pub fn sign_transaction(
    tx: &mut Transaction,
    candidates: &[UtxoCandidate],
    seed: &Seed,
    network: Network,
) -> Result<(), WalletError> {
    if tx.input.len() != candidates.len() {
        return Err(WalletError::Internal(
            "input/candidate count mismatch".into(),
        ));
    }

    let secp = Secp256k1::new();
    let mut planned = Vec::with_capacity(tx.input.len());

    // Sighashes do not depend on other inputs' scripts, so everything is
    // computed against the transaction as-is and applied afterwards.
    {
        let tx_ref: &Transaction = &*tx;
        let mut cache = SighashCache::new(tx_ref);
        for (input_index, candidate) in candidates.iter().enumerate() {
            planned.push(plan_input(
                tx_ref,
                &mut cache,
                &secp,
                input_index,
                candidate,
                seed,
                network,
            )?);
        }
    }

    for (input_index, action) in planned.into_iter().enumerate() {
        match action {
            InputSig::Skip => {}
            InputSig::Legacy { script_sig } => {
                tx.input[input_index].script_sig = script_sig;
                tx.input[input_index].witness = Witness::new();
            }
            InputSig::Segwit {
                script_sig,
                witness,
            } => {
                tx.input[input_index].script_sig = script_sig;
                tx.input[input_index].witness = witness;
            }
        }
    }
    Ok(())
}

#[allow(clippy::too_many_arguments)]
fn plan_input(
    tx: &Transaction,
    cache: &mut SighashCache<&Transaction>,
    secp: &Secp256k1<All>,
    input_index: usize,
    candidate: &UtxoCandidate,
    seed: &Seed,
    network: Network,
) -> Result<InputSig, WalletError> {
    // Watch-only pubkey derivation would do, but the private key is needed
    // below anyway and the seed is already unlocked for this call.
    let probe_key = derive_private_key(seed, candidate.chain, candidate.index, network)?;
    let probe_pubkey = CompressedPublicKey::from_private_key(secp, &probe_key)
        .map_err(|e| WalletError::Bitcoin(e.to_string()))?;

    let kind = ScriptKind::for_output(&candidate.script_pubkey, &probe_pubkey)
        .ok_or(WalletError::UnresolvableRedeemData { input_index })?;

    let sighash = input_sighash(cache, input_index, candidate, &kind)?;
    let message = Message::from_digest(sighash);

    if input_spends_correctly(tx, input_index, &kind, &probe_pubkey, &message, secp) {
        log::debug!("Input {} already signed, skipping", input_index);
        return Ok(InputSig::Skip);
    }

    let redeem = build_redeem_data(&kind, seed, candidate.chain, candidate.index, network)?;
    let signature = secp.sign_ecdsa(&message, &redeem.key.inner);
    let mut sig_with_hashtype = signature.serialize_der().to_vec();
    sig_with_hashtype.push(EcdsaSighashType::All.to_u32() as u8);

    match kind {
        ScriptKind::P2pkh => {
            let sig_push = PushBytesBuf::try_from(sig_with_hashtype)
                .map_err(|e| WalletError::Bitcoin(e.to_string()))?;
            let script_sig = Builder::new()
                .push_slice(sig_push)
                .push_slice(redeem.pubkey.to_bytes())
                .into_script();
            Ok(InputSig::Legacy { script_sig })
        }
        ScriptKind::P2wpkh => {
            let mut witness = Witness::new();
            witness.push(&sig_with_hashtype);
            witness.push(redeem.pubkey.to_bytes());
            Ok(InputSig::Segwit {
                script_sig: ScriptBuf::new(),
                witness,
            })
        }
        ScriptKind::P2sh { .. } => {
            let redeem_script = redeem
                .redeem_script
                .ok_or(WalletError::UnresolvableRedeemData { input_index })?;
            let redeem_push = PushBytesBuf::try_from(redeem_script.into_bytes())
                .map_err(|e| WalletError::Bitcoin(e.to_string()))?;
            let script_sig = Builder::new().push_slice(redeem_push).into_script();
            let mut witness = Witness::new();
            witness.push(&sig_with_hashtype);
            witness.push(redeem.pubkey.to_bytes());
            Ok(InputSig::Segwit {
                script_sig,
                witness,
            })
        }
    }
}

/// Signature hash of one input for its script kind.
fn input_sighash(
    cache: &mut SighashCache<&Transaction>,
    input_index: usize,
    candidate: &UtxoCandidate,
    kind: &ScriptKind,
) -> Result<[u8; 32], WalletError> {
    match kind {
        ScriptKind::P2pkh => {
            let sighash = cache
                .legacy_signature_hash(
                    input_index,
                    &candidate.script_pubkey,
                    EcdsaSighashType::All.to_u32(),
                )
                .map_err(|e| WalletError::Bitcoin(e.to_string()))?;
            Ok(sighash.to_byte_array())
        }
        ScriptKind::P2wpkh => {
            let sighash = cache
                .p2wpkh_signature_hash(
                    input_index,
                    &candidate.script_pubkey,
                    Amount::from_sat(candidate.value),
                    EcdsaSighashType::All,
                )
                .map_err(|e| WalletError::Bitcoin(e.to_string()))?;
            Ok(sighash.to_byte_array())
        }
        ScriptKind::P2sh { redeem_script } => {
            let sighash = cache
                .p2wpkh_signature_hash(
                    input_index,
                    redeem_script,
                    Amount::from_sat(candidate.value),
                    EcdsaSighashType::All,
                )
                .map_err(|e| WalletError::Bitcoin(e.to_string()))?;
            Ok(sighash.to_byte_array())
        }
    }
}

fn witness_pair(witness: &Witness) -> Option<(Vec<u8>, Vec<u8>)> {
    if witness.len() != 2 {
        return None;
    }
    let (sig, pubkey) = (witness.nth(0)?, witness.nth(1)?);
    Some((sig.to_vec(), pubkey.to_vec()))
}

/// Check whether an input's existing script data already satisfies the
/// connected output: extract the (signature, pubkey) pair for the script
/// kind and verify the signature against the expected sighash.
fn input_spends_correctly(
    tx: &Transaction,
    input_index: usize,
    kind: &ScriptKind,
    expected_pubkey: &CompressedPublicKey,
    message: &Message,
    secp: &Secp256k1<All>,
) -> bool {
    let input = &tx.input[input_index];

    let (sig_bytes, pubkey_bytes): (Vec<u8>, Vec<u8>) = match kind {
        ScriptKind::P2pkh => {
            let mut pushes = Vec::new();
            for instruction in input.script_sig.instructions() {
                match instruction {
                    Ok(bitcoin::script::Instruction::PushBytes(pb)) => {
                        pushes.push(pb.as_bytes().to_vec())
                    }
                    _ => return false,
                }
            }
            if pushes.len() != 2 {
                return false;
            }
            (pushes[0].clone(), pushes[1].clone())
        }
        // A correct segwit spend needs the right scriptSig too: empty for
        // native P2WPKH, exactly the redeem-script push when nested.
        ScriptKind::P2wpkh => {
            if !input.script_sig.is_empty() {
                return false;
            }
            let Some(pair) = witness_pair(&input.witness) else {
                return false;
            };
            pair
        }
        ScriptKind::P2sh { redeem_script } => {
            let Ok(redeem_push) = PushBytesBuf::try_from(redeem_script.clone().into_bytes())
            else {
                return false;
            };
            let expected = Builder::new().push_slice(redeem_push).into_script();
            if input.script_sig != expected {
                return false;
            }
            let Some(pair) = witness_pair(&input.witness) else {
                return false;
            };
            pair
        }
    };

    if pubkey_bytes != expected_pubkey.to_bytes() {
        return false;
    }
    let Some((&hashtype, der)) = sig_bytes.split_last() else {
        return false;
    };
    if hashtype as u32 != EcdsaSighashType::All.to_u32() {
        return false;
    }
    let Ok(signature) = ecdsa::Signature::from_der(der) else {
        return false;
    };
    secp.verify_ecdsa(message, &signature, &expected_pubkey.0)
        .is_ok()
}
