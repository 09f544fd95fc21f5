//! Master seed encryption
//!
//! The BIP39 seed is stored encrypted with AES-256-GCM under a key derived
//! from the caller's authentication token with Argon2id. The key-derivation
//! cost is calibrated once against a target derivation time when the wallet
//! file is created and the parameters are frozen into the file.

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use argon2::{Algorithm, Argon2, Params, Version};
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::error::WalletError;

/// Decrypted 64-byte BIP39 seed. Zeroed on drop; only ever lives on the
/// stack of an authenticated operation.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct Seed(pub [u8; 64]);

impl Seed {
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

/// Argon2id cost parameters, persisted alongside the ciphertext.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KdfParams {
    /// Memory cost in KiB
    pub memory_cost: u32,
    /// Time cost (iterations)
    pub time_cost: u32,
    /// Parallelism
    pub parallelism: u32,
}

impl Default for KdfParams {
    fn default() -> Self {
        Self {
            memory_cost: 65536,
            time_cost: 3,
            parallelism: 4,
        }
    }
}

/// Encrypted seed as stored in the wallet file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EncryptedSeed {
    /// Salt used for key derivation (32 bytes, hex)
    pub salt: String,
    /// Nonce used for encryption (12 bytes, hex)
    pub nonce: String,
    /// Ciphertext + auth tag (hex)
    pub ciphertext: String,
    /// Key derivation parameters, fixed at wallet creation
    pub kdf: KdfParams,
}

/// Pick a time cost such that one key derivation takes roughly `target`.
///
/// Measures a single-iteration derivation and scales linearly; clamped to
/// [1, 16] so a slow device never produces an unusable wallet file.
pub fn calibrate_kdf(target: Duration) -> KdfParams {
    let mut params = KdfParams {
        time_cost: 1,
        ..KdfParams::default()
    };

    let salt = [0u8; 32];
    let start = Instant::now();
    if derive_key("calibration", &salt, &params).is_err() {
        return KdfParams::default();
    }
    let elapsed = start.elapsed().max(Duration::from_millis(1));

    let scaled = (target.as_millis() / elapsed.as_millis()).max(1) as u32;
    params.time_cost = scaled.min(16);
    log::debug!(
        "Calibrated KDF: one iteration took {:?}, using time cost {}",
        elapsed,
        params.time_cost
    );
    params
}

/// Encrypt a seed under an authentication token.
pub fn encrypt_seed(
    seed: &Seed,
    token: &str,
    kdf: &KdfParams,
) -> Result<EncryptedSeed, WalletError> {
    let mut salt = [0u8; 32];
    OsRng.fill_bytes(&mut salt);
    let mut nonce_bytes = [0u8; 12];
    OsRng.fill_bytes(&mut nonce_bytes);

    let mut key = derive_key(token, &salt, kdf)?;

    let cipher = Aes256Gcm::new_from_slice(&key)
        .map_err(|e| WalletError::Crypto(format!("Failed to create cipher: {}", e)))?;
    let ciphertext = cipher
        .encrypt(Nonce::from_slice(&nonce_bytes), seed.as_bytes())
        .map_err(|e| WalletError::Crypto(format!("Encryption failed: {}", e)))?;
    key.zeroize();

    Ok(EncryptedSeed {
        salt: hex::encode(salt),
        nonce: hex::encode(nonce_bytes),
        ciphertext: hex::encode(ciphertext),
        kdf: kdf.clone(),
    })
}

/// Decrypt a stored seed. A wrong token or corrupted key material fails
/// the GCM tag check and surfaces as an authentication failure.
pub fn decrypt_seed(enc: &EncryptedSeed, token: &str) -> Result<Seed, WalletError> {
    let salt = hex::decode(&enc.salt)
        .map_err(|e| WalletError::Crypto(format!("Invalid salt: {}", e)))?;
    let nonce_bytes = hex::decode(&enc.nonce)
        .map_err(|e| WalletError::Crypto(format!("Invalid nonce: {}", e)))?;
    let ciphertext = hex::decode(&enc.ciphertext)
        .map_err(|e| WalletError::Crypto(format!("Invalid ciphertext: {}", e)))?;

    let mut key = derive_key(token, &salt, &enc.kdf)?;
    let cipher = Aes256Gcm::new_from_slice(&key)
        .map_err(|e| WalletError::Crypto(format!("Failed to create cipher: {}", e)))?;
    let plaintext = cipher
        .decrypt(Nonce::from_slice(&nonce_bytes), ciphertext.as_slice())
        .map_err(|_| WalletError::Authentication("wrong token or corrupt key material".into()));
    key.zeroize();
    let mut plaintext = plaintext?;

    if plaintext.len() != 64 {
        plaintext.zeroize();
        return Err(WalletError::Crypto("Unexpected seed length".into()));
    }
    let mut bytes = [0u8; 64];
    bytes.copy_from_slice(&plaintext);
    plaintext.zeroize();
    Ok(Seed(bytes))
}

fn derive_key(token: &str, salt: &[u8], kdf: &KdfParams) -> Result<[u8; 32], WalletError> {
    let params = Params::new(kdf.memory_cost, kdf.time_cost, kdf.parallelism, Some(32))
        .map_err(|e| WalletError::Crypto(format!("Invalid KDF parameters: {}", e)))?;
    let argon2 = Argon2::new(Algorithm::Argon2id, Version::V0x13, params);

    let mut key = [0u8; 32];
    argon2
        .hash_password_into(token.as_bytes(), salt, &mut key)
        .map_err(|e| WalletError::Crypto(format!("Key derivation failed: {}", e)))?;
    Ok(key)
}
