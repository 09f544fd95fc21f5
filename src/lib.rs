//! Embedded Bitcoin wallet engine.
//!
//! Deterministic key derivation from an encrypted BIP-39 seed, gap-limit
//! address discovery, a dependency-resolving transaction ledger, an
//! incremental sync engine and an idempotent transaction signer, all
//! behind a single-worker service so wallet state is never mutated
//! concurrently.
//!
//! The chain is reached through the [`provider::ChainProvider`] trait;
//! [`provider::HttpProvider`] talks to the backend over HTTP, and tests
//! substitute their own implementation.

pub mod config;
pub mod context;
pub mod error;
pub mod events;
pub mod keys;
pub mod provider;
pub mod service;
pub mod store;
pub mod sync;
pub mod tx;

pub use config::{ProtocolFee, WalletConfig};
pub use context::WalletContext;
pub use error::{ProviderError, StorageError, WalletError};
pub use events::{EventBus, WalletEvent};
pub use provider::{ChainProvider, ChainTip, HttpProvider, ProviderTx, TipStatus};
pub use service::{AuthOutcome, TransactionInfo, WalletHandle};
pub use store::{Confidence, Direction, TransactionStore, UtxoCandidate};
pub use sync::{BlockNotification, SyncEngine};
pub use tx::{create_transaction, sign_transaction, PendingPayment, ScriptKind};
