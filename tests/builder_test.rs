mod common;

use bitwallet::error::WalletError;
use bitwallet::store::{TransactionStore, TrackedTransaction};
use bitwallet::tx::create_transaction;

/// Give the wallet a single confirmed P2PKH output of `value` sats.
fn fund(ctx: &mut bitwallet::context::WalletContext, value: u64) {
    let receive = ctx.fresh_receive_address().unwrap();
    let ptx = common::confirmed(common::coinbase_paying(&receive, value, 1), 90, 1_000);
    ctx.store = TransactionStore::from_transactions(vec![TrackedTransaction::from_provider(ptx)]);
}

#[test]
fn test_fee_converges_for_single_input_payment() {
    common::init_logger();
    let dir = tempfile::tempdir().unwrap();
    let (mut ctx, _) = common::new_wallet(&dir);
    fund(&mut ctx, 100_000);

    let destination = common::foreign_address();
    let payment =
        create_transaction(&mut ctx, &destination.to_string(), 30_000, 10_000).unwrap();

    // One P2PKH input (148 bytes), two outputs (2 x 34) and 10 bytes of
    // overhead: 226 bytes at 10_000 sats per 1024 bytes.
    assert_eq!(payment.size, 226);
    assert_eq!(payment.fee, 2_207);
    assert_eq!(payment.change, 67_793);
    assert_eq!(payment.tx.input.len(), 1);
    assert_eq!(payment.tx.output.len(), 2);

    // Value is conserved: inputs = payment + change + fee.
    let outputs: u64 = payment.tx.output.iter().map(|o| o.value.to_sat()).sum();
    assert_eq!(outputs + payment.fee, 100_000);

    // The payment output pays the destination.
    assert!(payment
        .tx
        .output
        .iter()
        .any(|o| o.script_pubkey == destination.script_pubkey()
            && o.value.to_sat() == 30_000));

    // The change output goes to a freshly issued internal address.
    assert_eq!(ctx.chain_state.internal_issued, 1);
}

#[test]
fn test_dust_change_is_folded_into_fee() {
    common::init_logger();
    let dir = tempfile::tempdir().unwrap();
    let (mut ctx, _) = common::new_wallet(&dir);
    fund(&mut ctx, 32_500);

    let payment = create_transaction(
        &mut ctx,
        &common::foreign_address().to_string(),
        30_000,
        10_000,
    )
    .unwrap();

    // 32_500 - 30_000 - 2_207 = 293 sats of change is below the dust
    // threshold; it goes to the miner instead of a change output.
    assert_eq!(payment.tx.output.len(), 1);
    assert_eq!(payment.change, 0);
    assert_eq!(payment.fee, 2_500);
    // No internal address was issued for the folded change.
    assert_eq!(ctx.chain_state.internal_issued, 0);
}

#[test]
fn test_validation_rejects_dust_payment() {
    common::init_logger();
    let dir = tempfile::tempdir().unwrap();
    let (mut ctx, _) = common::new_wallet(&dir);
    fund(&mut ctx, 100_000);

    let result = create_transaction(&mut ctx, &common::foreign_address().to_string(), 500, 10_000);
    assert!(matches!(
        result,
        Err(WalletError::DustAmount {
            amount: 500,
            threshold: 546
        })
    ));
}

#[test]
fn test_validation_rejects_amount_over_max_money() {
    common::init_logger();
    let dir = tempfile::tempdir().unwrap();
    let (mut ctx, _) = common::new_wallet(&dir);
    fund(&mut ctx, 100_000);

    let over = 21_000_000 * 100_000_000 + 1;
    let result =
        create_transaction(&mut ctx, &common::foreign_address().to_string(), over, 10_000);
    assert!(matches!(result, Err(WalletError::ExceedsMaxMoney(_))));
}

#[test]
fn test_validation_rejects_invalid_address() {
    common::init_logger();
    let dir = tempfile::tempdir().unwrap();
    let (mut ctx, _) = common::new_wallet(&dir);
    fund(&mut ctx, 100_000);

    let result = create_transaction(&mut ctx, "not-an-address", 30_000, 10_000);
    assert!(matches!(result, Err(WalletError::InvalidAddress(_))));

    // A mainnet address on a testnet wallet is rejected the same way.
    let mainnet = "1A1zP1eP5QGefi2DMPTfTL5SLmv7DivfNa";
    let result = create_transaction(&mut ctx, mainnet, 30_000, 10_000);
    assert!(matches!(result, Err(WalletError::InvalidAddress(_))));
}

#[test]
fn test_insufficient_balance_for_amount() {
    common::init_logger();
    let dir = tempfile::tempdir().unwrap();
    let (mut ctx, _) = common::new_wallet(&dir);
    fund(&mut ctx, 20_000);

    let result =
        create_transaction(&mut ctx, &common::foreign_address().to_string(), 30_000, 10_000);
    assert!(matches!(
        result,
        Err(WalletError::InsufficientBalance {
            needed: 30_000,
            available: 20_000
        })
    ));
}

#[test]
fn test_insufficient_balance_once_fee_is_added() {
    common::init_logger();
    let dir = tempfile::tempdir().unwrap();
    let (mut ctx, _) = common::new_wallet(&dir);
    fund(&mut ctx, 31_000);

    // 31_000 covers the payment but not payment + fee.
    let result =
        create_transaction(&mut ctx, &common::foreign_address().to_string(), 30_000, 10_000);
    assert!(matches!(
        result,
        Err(WalletError::InsufficientBalance { .. })
    ));
}

#[test]
fn test_smallest_outputs_are_selected_first() {
    common::init_logger();
    let dir = tempfile::tempdir().unwrap();
    let (mut ctx, _) = common::new_wallet(&dir);

    // Three outputs; the two smallest cover the payment.
    let a = ctx.fresh_receive_address().unwrap();
    let b = ctx.fresh_receive_address().unwrap();
    let c = ctx.fresh_receive_address().unwrap();
    let txs = vec![
        common::confirmed(common::coinbase_paying(&a, 10_000, 1), 90, 1_000),
        common::confirmed(common::coinbase_paying(&b, 50_000, 2), 90, 1_100),
        common::confirmed(common::coinbase_paying(&c, 200_000, 3), 90, 1_200),
    ];
    ctx.store = TransactionStore::from_transactions(
        txs.into_iter().map(TrackedTransaction::from_provider).collect(),
    );

    let payment = create_transaction(
        &mut ctx,
        &common::foreign_address().to_string(),
        50_000,
        10_000,
    )
    .unwrap();

    let selected: u64 = payment.selected.iter().map(|c| c.value).sum();
    assert_eq!(payment.tx.input.len(), 2);
    assert_eq!(selected, 60_000);
}
