//! Transaction construction and signing

pub mod builder;
pub mod signer;

pub use builder::{create_transaction, PendingPayment};
pub use signer::{build_redeem_data, sign_transaction, RedeemData, ScriptKind};
