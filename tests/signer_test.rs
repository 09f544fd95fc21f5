mod common;

use bitcoin::consensus::encode::serialize_hex;
use bitcoin::Network;
use bitwallet::error::WalletError;
use bitwallet::keys::KeyChain;
use bitwallet::store::{TransactionStore, TrackedTransaction, UtxoCandidate};
use bitwallet::tx::{create_transaction, sign_transaction, ScriptKind};

fn funded_wallet(
    dir: &tempfile::TempDir,
    value: u64,
) -> bitwallet::context::WalletContext {
    let (mut ctx, _) = common::new_wallet(dir);
    let receive = ctx.fresh_receive_address().unwrap();
    let ptx = common::confirmed(common::coinbase_paying(&receive, value, 1), 90, 1_000);
    ctx.store = TransactionStore::from_transactions(vec![TrackedTransaction::from_provider(ptx)]);
    ctx
}

#[test]
fn test_sign_p2pkh_payment() {
    common::init_logger();
    let dir = tempfile::tempdir().unwrap();
    let mut ctx = funded_wallet(&dir, 100_000);

    let mut payment = create_transaction(
        &mut ctx,
        &common::foreign_address().to_string(),
        30_000,
        10_000,
    )
    .unwrap();
    assert!(payment.tx.input[0].script_sig.is_empty());

    let seed = ctx.unlock(common::TOKEN).unwrap();
    sign_transaction(&mut payment.tx, &payment.selected, &seed, Network::Testnet).unwrap();

    // Legacy input: signature lives in the script, the witness stays empty.
    let input = &payment.tx.input[0];
    assert!(!input.script_sig.is_empty());
    assert!(input.witness.is_empty());
}

#[test]
fn test_signing_is_idempotent() {
    common::init_logger();
    let dir = tempfile::tempdir().unwrap();
    let mut ctx = funded_wallet(&dir, 100_000);

    let mut payment = create_transaction(
        &mut ctx,
        &common::foreign_address().to_string(),
        30_000,
        10_000,
    )
    .unwrap();

    let seed = ctx.unlock(common::TOKEN).unwrap();
    sign_transaction(&mut payment.tx, &payment.selected, &seed, Network::Testnet).unwrap();
    let first_pass = serialize_hex(&payment.tx);

    // A second pass recognizes the valid signature and changes nothing.
    sign_transaction(&mut payment.tx, &payment.selected, &seed, Network::Testnet).unwrap();
    assert_eq!(serialize_hex(&payment.tx), first_pass);
}

#[test]
fn test_unknown_script_kind_is_rejected() {
    common::init_logger();
    let dir = tempfile::tempdir().unwrap();
    let mut ctx = funded_wallet(&dir, 100_000);

    let mut payment = create_transaction(
        &mut ctx,
        &common::foreign_address().to_string(),
        30_000,
        10_000,
    )
    .unwrap();

    // Point the candidate at a script the claimed key path does not
    // control.
    let wrong_script = ctx
        .keys
        .derive_address(KeyChain::External, 9)
        .unwrap()
        .script_pubkey();
    let candidates: Vec<UtxoCandidate> = payment
        .selected
        .iter()
        .map(|c| UtxoCandidate {
            script_pubkey: wrong_script.clone(),
            ..c.clone()
        })
        .collect();

    let seed = ctx.unlock(common::TOKEN).unwrap();
    let result = sign_transaction(&mut payment.tx, &candidates, &seed, Network::Testnet);
    assert!(matches!(
        result,
        Err(WalletError::UnresolvableRedeemData { input_index: 0 })
    ));
}

#[test]
fn test_candidate_count_must_match_inputs() {
    common::init_logger();
    let dir = tempfile::tempdir().unwrap();
    let mut ctx = funded_wallet(&dir, 100_000);

    let mut payment = create_transaction(
        &mut ctx,
        &common::foreign_address().to_string(),
        30_000,
        10_000,
    )
    .unwrap();

    let seed = ctx.unlock(common::TOKEN).unwrap();
    let result = sign_transaction(&mut payment.tx, &[], &seed, Network::Testnet);
    assert!(matches!(result, Err(WalletError::Internal(_))));
}

#[test]
fn test_nested_p2sh_resign_restores_missing_redeem_push() {
    common::init_logger();
    let dir = tempfile::tempdir().unwrap();
    let (ctx, _) = common::new_wallet(&dir);

    // A nested P2SH-P2WPKH output controlled by external key 0.
    let pubkey = ctx.keys.derive_public_key(KeyChain::External, 0).unwrap();
    let redeem = bitcoin::ScriptBuf::new_p2wpkh(&pubkey.wpubkey_hash());
    let nested = bitcoin::Address::p2sh(&redeem, Network::Testnet).unwrap();

    let funding = common::coinbase_paying(&nested, 50_000, 9);
    let mut tx = common::spend(
        &funding,
        0,
        vec![common::out(40_000, &common::foreign_address())],
    );
    let candidate = UtxoCandidate {
        outpoint: bitcoin::OutPoint::new(funding.compute_txid(), 0),
        value: 50_000,
        script_pubkey: nested.script_pubkey(),
        chain: KeyChain::External,
        index: 0,
    };

    let seed = ctx.unlock(common::TOKEN).unwrap();
    sign_transaction(&mut tx, std::slice::from_ref(&candidate), &seed, Network::Testnet).unwrap();
    let script_sig = tx.input[0].script_sig.clone();
    assert!(!script_sig.is_empty());
    assert_eq!(tx.input[0].witness.len(), 2);

    // Strip the redeem push but keep the valid witness: the input no
    // longer spends correctly and must be re-signed, not skipped.
    tx.input[0].script_sig = bitcoin::ScriptBuf::new();
    sign_transaction(&mut tx, std::slice::from_ref(&candidate), &seed, Network::Testnet).unwrap();
    assert_eq!(tx.input[0].script_sig, script_sig);
    assert_eq!(tx.input[0].witness.len(), 2);
}

#[test]
fn test_script_kind_classification_and_sizes() {
    common::init_logger();
    let dir = tempfile::tempdir().unwrap();
    let (ctx, _) = common::new_wallet(&dir);

    let pubkey = ctx.keys.derive_public_key(KeyChain::External, 0).unwrap();

    let p2pkh = bitcoin::ScriptBuf::new_p2pkh(&pubkey.pubkey_hash());
    let kind = ScriptKind::for_output(&p2pkh, &pubkey).unwrap();
    assert_eq!(kind, ScriptKind::P2pkh);
    assert_eq!(kind.input_size(), 148);

    let p2wpkh = bitcoin::ScriptBuf::new_p2wpkh(&pubkey.wpubkey_hash());
    let kind = ScriptKind::for_output(&p2wpkh, &pubkey).unwrap();
    assert_eq!(kind, ScriptKind::P2wpkh);
    assert_eq!(kind.input_size(), 68);

    let nested = bitcoin::ScriptBuf::new_p2sh(&p2wpkh.script_hash());
    let kind = ScriptKind::for_output(&nested, &pubkey).unwrap();
    assert!(matches!(kind, ScriptKind::P2sh { .. }));

    // A script controlled by a different key is not classifiable.
    let other = ctx.keys.derive_public_key(KeyChain::External, 1).unwrap();
    let foreign = bitcoin::ScriptBuf::new_p2pkh(&other.pubkey_hash());
    assert!(ScriptKind::for_output(&foreign, &pubkey).is_none());
}
