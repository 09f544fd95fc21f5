//! Deterministic key derivation and seed encryption

pub mod chain;
pub mod crypto;

pub use chain::{
    derive_private_key, generate_mnemonic, parse_mnemonic, seed_from_mnemonic, KeyChain,
    KeyChainState, KeyTree,
};
pub use crypto::{calibrate_kdf, decrypt_seed, encrypt_seed, EncryptedSeed, KdfParams, Seed};
