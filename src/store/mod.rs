//! Transaction ledger and wallet persistence

pub mod transactions;
pub mod wallet_file;

pub use transactions::{
    Confidence, DepthChange, Direction, IngestReport, ResolvedOutput, ScriptIndex,
    StoredTransaction, TrackedInput, TrackedTransaction, TransactionStore, UtxoCandidate,
};
pub use wallet_file::{BlockRef, WalletData, WalletFile};
