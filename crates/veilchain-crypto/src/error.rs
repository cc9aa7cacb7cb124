use thiserror::Error;
use veilchain_core::LedgerError;

#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("invalid signature")]
    InvalidSignature,

    #[error("invalid key material: {0}")]
    InvalidKey(String),

    #[error("AEAD operation failed (wrong key or corrupted data)")]
    AeadFailed,

    #[error("malformed ciphertext envelope: {0}")]
    FormatInvalid(String),

    #[error("decrypted payload is not valid UTF-8")]
    InvalidUtf8,
}

impl From<CryptoError> for LedgerError {
    fn from(e: CryptoError) -> Self {
        match e {
            CryptoError::InvalidSignature => LedgerError::SignatureInvalid,
            CryptoError::AeadFailed => {
                LedgerError::Unauthorized("decryption failed: wrong password or corrupted data".into())
            }
            other => LedgerError::Crypto(other.to_string()),
        }
    }
}
