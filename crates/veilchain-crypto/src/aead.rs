//! AES-GCM sealing and opening.
//!
//! All encrypted material in the ledger uses the same wire layout:
//! `iv(12) ‖ ciphertext ‖ tag(16)`, with the tag appended to the ciphertext
//! by the AEAD. Callers pass associated data binding the ciphertext to its
//! context (block number and signer for on-chain data).

use aes_gcm::aead::consts::U12;
use aes_gcm::aead::{Aead, KeyInit, Payload};
use aes_gcm::aes::Aes192;
use aes_gcm::{Aes128Gcm, Aes256Gcm, AesGcm, Nonce};
use rand::RngCore;

use veilchain_core::constants::{AEAD_IV_LEN, AEAD_TAG_LEN};
use veilchain_core::KeyLength;

use crate::error::CryptoError;

type Aes192Gcm = AesGcm<Aes192, U12>;

/// Fresh random 96-bit IV.
pub fn random_iv() -> [u8; AEAD_IV_LEN] {
    let mut iv = [0u8; AEAD_IV_LEN];
    rand::rngs::OsRng.fill_bytes(&mut iv);
    iv
}

/// Encrypt; returns `ciphertext ‖ tag`.
pub fn seal(
    key: &[u8],
    key_length: KeyLength,
    iv: &[u8; AEAD_IV_LEN],
    plaintext: &[u8],
    aad: &[u8],
) -> Result<Vec<u8>, CryptoError> {
    check_key_len(key, key_length)?;
    let nonce = Nonce::from_slice(iv);
    let payload = Payload { msg: plaintext, aad };
    let out = match key_length {
        KeyLength::Aes128 => Aes128Gcm::new_from_slice(key)
            .map_err(|_| CryptoError::InvalidKey("bad AES-128 key".into()))?
            .encrypt(nonce, payload),
        KeyLength::Aes192 => Aes192Gcm::new_from_slice(key)
            .map_err(|_| CryptoError::InvalidKey("bad AES-192 key".into()))?
            .encrypt(nonce, payload),
        KeyLength::Aes256 => Aes256Gcm::new_from_slice(key)
            .map_err(|_| CryptoError::InvalidKey("bad AES-256 key".into()))?
            .encrypt(nonce, payload),
    };
    out.map_err(|_| CryptoError::AeadFailed)
}

/// Decrypt `ciphertext ‖ tag`. Fails closed on any tag or AAD mismatch.
pub fn open(
    key: &[u8],
    key_length: KeyLength,
    iv: &[u8; AEAD_IV_LEN],
    ciphertext_and_tag: &[u8],
    aad: &[u8],
) -> Result<Vec<u8>, CryptoError> {
    check_key_len(key, key_length)?;
    if ciphertext_and_tag.len() < AEAD_TAG_LEN {
        return Err(CryptoError::FormatInvalid("ciphertext shorter than tag".into()));
    }
    let nonce = Nonce::from_slice(iv);
    let payload = Payload { msg: ciphertext_and_tag, aad };
    let out = match key_length {
        KeyLength::Aes128 => Aes128Gcm::new_from_slice(key)
            .map_err(|_| CryptoError::InvalidKey("bad AES-128 key".into()))?
            .decrypt(nonce, payload),
        KeyLength::Aes192 => Aes192Gcm::new_from_slice(key)
            .map_err(|_| CryptoError::InvalidKey("bad AES-192 key".into()))?
            .decrypt(nonce, payload),
        KeyLength::Aes256 => Aes256Gcm::new_from_slice(key)
            .map_err(|_| CryptoError::InvalidKey("bad AES-256 key".into()))?
            .decrypt(nonce, payload),
    };
    out.map_err(|_| CryptoError::AeadFailed)
}

/// Split a stored `iv ‖ ciphertext ‖ tag` buffer into its IV and body.
pub fn split_iv(stored: &[u8]) -> Result<([u8; AEAD_IV_LEN], &[u8]), CryptoError> {
    if stored.len() < AEAD_IV_LEN + AEAD_TAG_LEN {
        return Err(CryptoError::FormatInvalid(format!(
            "encrypted buffer too short: {} bytes",
            stored.len()
        )));
    }
    let mut iv = [0u8; AEAD_IV_LEN];
    iv.copy_from_slice(&stored[..AEAD_IV_LEN]);
    Ok((iv, &stored[AEAD_IV_LEN..]))
}

fn check_key_len(key: &[u8], key_length: KeyLength) -> Result<(), CryptoError> {
    if key.len() != key_length.bytes() {
        return Err(CryptoError::InvalidKey(format!(
            "key is {} bytes, expected {}",
            key.len(),
            key_length.bytes()
        )));
    }
    Ok(())
}
