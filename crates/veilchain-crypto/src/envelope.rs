//! Block-data encryption envelope.
//!
//! An encrypted block stores `"[ENCRYPTED]" + base64(iv ‖ ciphertext ‖ tag)`
//! in its `data` field and a JSON metadata blob (algorithm, IV, KDF salt,
//! iteration count) in `encryption_metadata`. The AEAD's associated data
//! binds the ciphertext to `block_number | signer_public_key`, so an
//! envelope replayed onto another block fails authentication.
//!
//! When `metadata_encryption_enabled` is set the metadata JSON is itself
//! wrapped in an outer AES-GCM envelope; the outer form carries its own
//! salt and IV in the clear.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use rand::RngCore;
use serde::{Deserialize, Serialize};

use veilchain_core::constants::{AEAD_IV_LEN, ENCRYPTED_MARKER, KDF_SALT_LEN};
use veilchain_core::EncryptionConfig;

use crate::aead;
use crate::error::CryptoError;
use crate::kdf::KdfCache;

/// Parameters recorded alongside an encrypted block.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EnvelopeMetadata {
    pub algorithm: String,
    /// Base64 IV of the data envelope (also embedded in the stored data).
    pub iv: String,
    /// Base64 PBKDF2 salt for the data key.
    pub salt: String,
    pub iterations: u32,
    pub key_length_bits: u32,
}

/// Outer wrapper used when metadata itself is encrypted.
#[derive(Serialize, Deserialize)]
struct SealedMetadata {
    v: u8,
    salt: String,
    iv: String,
    enc: String,
}

/// True when `data` carries the encrypted-envelope marker.
pub fn is_envelope(data: &str) -> bool {
    data.starts_with(ENCRYPTED_MARKER)
}

/// Size of the stored envelope for a plaintext of `plaintext_len` bytes:
/// marker plus base64 over `iv ‖ ciphertext ‖ tag`. Used to decide whether
/// an encrypted payload still fits inline before any crypto work runs.
pub fn projected_envelope_len(plaintext_len: usize) -> usize {
    let raw = veilchain_core::constants::AEAD_IV_LEN
        + plaintext_len
        + veilchain_core::constants::AEAD_TAG_LEN;
    ENCRYPTED_MARKER.len() + raw.div_ceil(3) * 4
}

fn block_aad(block_number: u64, signer_public_key: &str) -> Vec<u8> {
    format!("{block_number}|{signer_public_key}").into_bytes()
}

fn metadata_aad(block_number: u64, signer_public_key: &str) -> Vec<u8> {
    format!("meta|{block_number}|{signer_public_key}").into_bytes()
}

/// Encrypt a block payload. Returns the `data` field content and the
/// `encryption_metadata` JSON.
pub fn seal_block_data(
    plaintext: &str,
    password: &str,
    block_number: u64,
    signer_public_key: &str,
    config: &EncryptionConfig,
    kdf: &KdfCache,
) -> Result<(String, String), CryptoError> {
    let mut salt = [0u8; KDF_SALT_LEN];
    rand::rngs::OsRng.fill_bytes(&mut salt);
    let iv = aead::random_iv();

    let key = kdf.derive(password, &salt, config.pbkdf2_iterations, config.key_length.bytes());
    let aad = block_aad(block_number, signer_public_key);
    let ct = aead::seal(&key, config.key_length, &iv, plaintext.as_bytes(), &aad)?;

    let mut stored = Vec::with_capacity(AEAD_IV_LEN + ct.len());
    stored.extend_from_slice(&iv);
    stored.extend_from_slice(&ct);
    let data = format!("{ENCRYPTED_MARKER}{}", BASE64.encode(&stored));

    let metadata = EnvelopeMetadata {
        algorithm: format!("AES-{}-GCM", config.key_length.bits()),
        iv: BASE64.encode(iv),
        salt: BASE64.encode(salt),
        iterations: config.pbkdf2_iterations,
        key_length_bits: config.key_length.bits(),
    };
    let metadata_json = serde_json::to_string(&metadata)
        .map_err(|e| CryptoError::FormatInvalid(e.to_string()))?;

    let metadata_json = if config.metadata_encryption_enabled {
        seal_metadata(&metadata_json, password, block_number, signer_public_key, config, kdf)?
    } else {
        metadata_json
    };

    Ok((data, metadata_json))
}

/// Decrypt a block payload produced by [`seal_block_data`].
pub fn open_block_data(
    data: &str,
    metadata_json: &str,
    password: &str,
    block_number: u64,
    signer_public_key: &str,
    config: &EncryptionConfig,
    kdf: &KdfCache,
) -> Result<String, CryptoError> {
    let stored = decode_envelope(data, config)?;
    let (iv, body) = aead::split_iv(&stored)?;

    let metadata = open_metadata(metadata_json, password, block_number, signer_public_key, config, kdf)?;
    if config.corruption_detection_enabled && metadata.iterations != config.pbkdf2_iterations {
        return Err(CryptoError::FormatInvalid(format!(
            "metadata iteration count {} does not match configuration {}",
            metadata.iterations, config.pbkdf2_iterations
        )));
    }
    let salt = BASE64
        .decode(&metadata.salt)
        .map_err(|_| CryptoError::FormatInvalid("metadata salt is not base64".into()))?;

    let key = kdf.derive(password, &salt, config.pbkdf2_iterations, config.key_length.bytes());
    let aad = block_aad(block_number, signer_public_key);
    let plaintext = aead::open(&key, config.key_length, &iv, body, &aad)?;
    String::from_utf8(plaintext).map_err(|_| CryptoError::InvalidUtf8)
}

/// Structural check of an envelope without decrypting it: marker present,
/// base64 payload, enough room for IV and tag.
pub fn validate_envelope_format(data: &str) -> Result<(), CryptoError> {
    let Some(b64) = data.strip_prefix(ENCRYPTED_MARKER) else {
        return Err(CryptoError::FormatInvalid("missing encryption marker".into()));
    };
    let stored = BASE64
        .decode(b64)
        .map_err(|_| CryptoError::FormatInvalid("envelope body is not base64".into()))?;
    aead::split_iv(&stored).map(|_| ())
}

fn decode_envelope(data: &str, config: &EncryptionConfig) -> Result<Vec<u8>, CryptoError> {
    if config.validate_encryption_format {
        validate_envelope_format(data)?;
    }
    let b64 = data
        .strip_prefix(ENCRYPTED_MARKER)
        .ok_or_else(|| CryptoError::FormatInvalid("missing encryption marker".into()))?;
    BASE64
        .decode(b64)
        .map_err(|_| CryptoError::FormatInvalid("envelope body is not base64".into()))
}

fn seal_metadata(
    metadata_json: &str,
    password: &str,
    block_number: u64,
    signer_public_key: &str,
    config: &EncryptionConfig,
    kdf: &KdfCache,
) -> Result<String, CryptoError> {
    let mut salt = [0u8; KDF_SALT_LEN];
    rand::rngs::OsRng.fill_bytes(&mut salt);
    let iv = aead::random_iv();
    let key = kdf.derive(password, &salt, config.pbkdf2_iterations, config.key_length.bytes());
    let ct = aead::seal(
        &key,
        config.key_length,
        &iv,
        metadata_json.as_bytes(),
        &metadata_aad(block_number, signer_public_key),
    )?;
    let sealed = SealedMetadata {
        v: 1,
        salt: BASE64.encode(salt),
        iv: BASE64.encode(iv),
        enc: BASE64.encode(ct),
    };
    serde_json::to_string(&sealed).map_err(|e| CryptoError::FormatInvalid(e.to_string()))
}

fn open_metadata(
    metadata_json: &str,
    password: &str,
    block_number: u64,
    signer_public_key: &str,
    config: &EncryptionConfig,
    kdf: &KdfCache,
) -> Result<EnvelopeMetadata, CryptoError> {
    if config.metadata_encryption_enabled {
        let sealed: SealedMetadata = serde_json::from_str(metadata_json)
            .map_err(|_| CryptoError::FormatInvalid("sealed metadata is not valid JSON".into()))?;
        let salt = BASE64
            .decode(&sealed.salt)
            .map_err(|_| CryptoError::FormatInvalid("sealed metadata salt is not base64".into()))?;
        let iv_bytes = BASE64
            .decode(&sealed.iv)
            .map_err(|_| CryptoError::FormatInvalid("sealed metadata iv is not base64".into()))?;
        let iv: [u8; AEAD_IV_LEN] = iv_bytes
            .try_into()
            .map_err(|_| CryptoError::FormatInvalid("sealed metadata iv has wrong length".into()))?;
        let ct = BASE64
            .decode(&sealed.enc)
            .map_err(|_| CryptoError::FormatInvalid("sealed metadata body is not base64".into()))?;

        let key = kdf.derive(password, &salt, config.pbkdf2_iterations, config.key_length.bytes());
        let plain = aead::open(
            &key,
            config.key_length,
            &iv,
            &ct,
            &metadata_aad(block_number, signer_public_key),
        )?;
        serde_json::from_slice(&plain)
            .map_err(|_| CryptoError::FormatInvalid("decrypted metadata is not valid JSON".into()))
    } else {
        serde_json::from_str(metadata_json)
            .map_err(|_| CryptoError::FormatInvalid("metadata is not valid JSON".into()))
    }
}

/// Best-effort decryption used by content scans: opens the envelope when
/// the password fits, `None` otherwise. Never surfaces an error.
pub fn try_open_block_data(
    data: &str,
    metadata_json: Option<&str>,
    password: &str,
    block_number: u64,
    signer_public_key: &str,
    config: &EncryptionConfig,
    kdf: &KdfCache,
) -> Option<String> {
    let metadata_json = metadata_json?;
    open_block_data(
        data,
        metadata_json,
        password,
        block_number,
        signer_public_key,
        config,
        kdf,
    )
    .ok()
}
