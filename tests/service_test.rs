mod common;

use std::sync::Arc;
use bitwallet::error::WalletError;
use bitwallet::service::{AuthOutcome, WalletHandle};
use bitwallet::store::Confidence;
use common::MockProvider;

fn spawn_wallet(dir: &tempfile::TempDir, provider: Arc<MockProvider>) -> WalletHandle {
    WalletHandle::spawn(
        common::test_config(),
        dir.path().join("wallet.json"),
        provider,
    )
}

#[tokio::test]
async fn test_first_authentication_creates_the_wallet() {
    common::init_logger();
    let dir = tempfile::tempdir().unwrap();
    let provider = Arc::new(MockProvider::new(100));
    let handle = spawn_wallet(&dir, provider);

    assert!(!handle.wallet_exists().await.unwrap());

    let outcome = handle.authenticate(common::TOKEN.into()).await.unwrap();
    let AuthOutcome::Created { mnemonic } = outcome else {
        panic!("expected a freshly created wallet");
    };
    assert_eq!(mnemonic.split_whitespace().count(), 12);
    assert!(handle.wallet_exists().await.unwrap());

    // Second authentication unlocks the existing wallet.
    let outcome = handle.authenticate(common::TOKEN.into()).await.unwrap();
    assert!(matches!(outcome, AuthOutcome::Unlocked));

    // A wrong token is rejected.
    let result = handle.authenticate("wrong".into()).await;
    assert!(matches!(result, Err(WalletError::Authentication(_))));
}

#[tokio::test]
async fn test_operations_require_an_initialized_wallet() {
    common::init_logger();
    let dir = tempfile::tempdir().unwrap();
    let provider = Arc::new(MockProvider::new(100));
    let handle = spawn_wallet(&dir, provider);

    let result = handle.balance().await;
    assert!(matches!(result, Err(WalletError::WalletNotInitialized)));
    let result = handle.fresh_address().await;
    assert!(matches!(result, Err(WalletError::WalletNotInitialized)));
}

#[tokio::test]
async fn test_receive_sync_and_send_roundtrip() {
    common::init_logger();
    let dir = tempfile::tempdir().unwrap();
    let provider = Arc::new(MockProvider::new(100));
    let handle = spawn_wallet(&dir, Arc::clone(&provider));

    handle.authenticate(common::TOKEN.into()).await.unwrap();
    let mut events = handle.subscribe_events().await.unwrap();

    // Fund the first receive address and sync it in.
    let address = handle.fresh_address().await.unwrap();
    let parsed: bitcoin::Address = address
        .parse::<bitcoin::Address<bitcoin::address::NetworkUnchecked>>()
        .unwrap()
        .require_network(bitcoin::Network::Testnet)
        .unwrap();
    provider.add_tx(common::confirmed(
        common::coinbase_paying(&parsed, 100_000, 1),
        95,
        1_000,
    ));

    handle.sync(Some(3)).await.unwrap();
    assert_eq!(handle.balance().await.unwrap(), 100_000);

    // Build, sign and broadcast a payment.
    let payment = handle
        .create_transaction(common::foreign_address().to_string(), 30_000, 10_000)
        .await
        .unwrap();
    assert_eq!(payment.fee, 2_207);

    let txid = handle
        .send_transaction(payment, common::TOKEN.into())
        .await
        .unwrap();
    assert_eq!(provider.broadcasts(), vec![txid]);

    // The pending spend reduced the balance to the change amount.
    assert_eq!(handle.balance().await.unwrap(), 67_793);

    let list = handle.transactions().await.unwrap();
    assert_eq!(list.len(), 2);
    let sent = list.iter().find(|t| t.txid == txid).unwrap();
    assert_eq!(sent.confidence, Confidence::Pending);
    assert_eq!(sent.fee, Some(2_207));

    // Balance notifications were emitted along the way.
    let mut saw_balance = false;
    while let Ok(event) = events.try_recv() {
        if matches!(event, bitwallet::events::WalletEvent::BalanceChanged(_)) {
            saw_balance = true;
        }
    }
    assert!(saw_balance);
}

#[tokio::test]
async fn test_rejected_broadcast_does_not_track_the_payment() {
    common::init_logger();
    let dir = tempfile::tempdir().unwrap();
    let provider = Arc::new(MockProvider::new(100));
    let handle = spawn_wallet(&dir, Arc::clone(&provider));

    handle.authenticate(common::TOKEN.into()).await.unwrap();
    let address = handle.fresh_address().await.unwrap();
    let parsed: bitcoin::Address = address
        .parse::<bitcoin::Address<bitcoin::address::NetworkUnchecked>>()
        .unwrap()
        .require_network(bitcoin::Network::Testnet)
        .unwrap();
    provider.add_tx(common::confirmed(
        common::coinbase_paying(&parsed, 100_000, 1),
        95,
        1_000,
    ));
    handle.sync(Some(3)).await.unwrap();

    provider.reject_broadcasts();
    let payment = handle
        .create_transaction(common::foreign_address().to_string(), 30_000, 10_000)
        .await
        .unwrap();
    let result = handle.send_transaction(payment, common::TOKEN.into()).await;
    assert!(matches!(result, Err(WalletError::BroadcastRejected)));

    // Nothing was tracked and the balance is untouched.
    assert_eq!(handle.balance().await.unwrap(), 100_000);
    assert_eq!(handle.transactions().await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_push_registration_watches_issued_addresses() {
    common::init_logger();
    let dir = tempfile::tempdir().unwrap();
    let provider = Arc::new(MockProvider::new(100));
    let handle = spawn_wallet(&dir, Arc::clone(&provider));

    handle.authenticate(common::TOKEN.into()).await.unwrap();
    handle.fresh_address().await.unwrap();
    handle.fresh_address().await.unwrap();

    let accepted = handle.register_push("device-token".into()).await.unwrap();
    assert!(accepted);
    let subs = provider.subscriptions();
    assert_eq!(subs.len(), 1);
    assert_eq!(subs[0], ("device-token".to_string(), 2));
}

#[tokio::test]
async fn test_delete_removes_the_wallet_file_and_stops_the_worker() {
    common::init_logger();
    let dir = tempfile::tempdir().unwrap();
    let provider = Arc::new(MockProvider::new(100));
    let handle = spawn_wallet(&dir, provider);

    handle.authenticate(common::TOKEN.into()).await.unwrap();
    assert!(dir.path().join("wallet.json").exists());

    handle.delete().await.unwrap();
    assert!(!dir.path().join("wallet.json").exists());

    // The worker has stopped; further calls fail cleanly.
    let result = handle.balance().await;
    assert!(matches!(result, Err(WalletError::Internal(_))));
}

#[tokio::test]
async fn test_restore_then_load_round_trips_state() {
    common::init_logger();
    let dir = tempfile::tempdir().unwrap();
    let provider = Arc::new(MockProvider::new(100));
    let handle = spawn_wallet(&dir, Arc::clone(&provider));

    let outcome = handle.authenticate(common::TOKEN.into()).await.unwrap();
    let AuthOutcome::Created { mnemonic } = outcome else {
        panic!("expected a freshly created wallet");
    };
    let address = handle.fresh_address().await.unwrap();

    // A second wallet restored from the phrase derives the same address.
    let dir2 = tempfile::tempdir().unwrap();
    let restored = spawn_wallet(&dir2, provider);
    restored
        .restore(mnemonic, common::TOKEN.into())
        .await
        .unwrap();
    assert_eq!(restored.fresh_address().await.unwrap(), address);
}
