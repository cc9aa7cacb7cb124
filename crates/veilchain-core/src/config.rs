use serde::{Deserialize, Serialize};

use crate::constants::{
    INLINE_DATA_CAP_BYTES, MAX_OFF_CHAIN_BYTES, MAX_REPORT_RESULTS,
    MAX_RESULT_METADATA_ENTRIES, PASSWORD_MAX_LEN, PASSWORD_MIN_LEN,
    PBKDF2_DEFAULT_ITERATIONS, PBKDF2_MIN_ITERATIONS,
};
use crate::error::LedgerError;

/// AES key length accepted by the encryption layer.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum KeyLength {
    Aes128,
    Aes192,
    Aes256,
}

impl KeyLength {
    pub fn bits(self) -> u32 {
        match self {
            KeyLength::Aes128 => 128,
            KeyLength::Aes192 => 192,
            KeyLength::Aes256 => 256,
        }
    }

    pub fn bytes(self) -> usize {
        (self.bits() / 8) as usize
    }

    pub fn from_bits(bits: u32) -> Result<Self, LedgerError> {
        match bits {
            128 => Ok(KeyLength::Aes128),
            192 => Ok(KeyLength::Aes192),
            256 => Ok(KeyLength::Aes256),
            other => Err(LedgerError::InvalidInput(format!(
                "unsupported key length {other}; expected 128, 192 or 256"
            ))),
        }
    }
}

/// Tunables of the encryption layer.
///
/// Two configurations can decrypt each other's output iff `key_length`,
/// `pbkdf2_iterations` and `metadata_encryption_enabled` all match.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptionConfig {
    pub key_length: KeyLength,
    pub pbkdf2_iterations: u32,
    /// Accepted for configuration compatibility; the envelope stores
    /// payloads uncompressed.
    pub enable_compression: bool,
    pub corruption_detection_enabled: bool,
    pub metadata_encryption_enabled: bool,
    /// Reject malformed envelopes early instead of failing inside AEAD open.
    pub validate_encryption_format: bool,
}

impl Default for EncryptionConfig {
    fn default() -> Self {
        Self {
            key_length: KeyLength::Aes256,
            pbkdf2_iterations: PBKDF2_DEFAULT_ITERATIONS,
            enable_compression: false,
            corruption_detection_enabled: true,
            metadata_encryption_enabled: true,
            validate_encryption_format: true,
        }
    }
}

impl EncryptionConfig {
    pub fn validate(&self) -> Result<(), LedgerError> {
        if self.pbkdf2_iterations < PBKDF2_MIN_ITERATIONS {
            return Err(LedgerError::InvalidInput(format!(
                "pbkdf2_iterations {} below minimum {}",
                self.pbkdf2_iterations, PBKDF2_MIN_ITERATIONS
            )));
        }
        Ok(())
    }

    /// True when material produced under `self` can be opened under `other`.
    pub fn is_interoperable_with(&self, other: &EncryptionConfig) -> bool {
        self.key_length == other.key_length
            && self.pbkdf2_iterations == other.pbkdf2_iterations
            && self.metadata_encryption_enabled == other.metadata_encryption_enabled
    }
}

/// Process-wide resource limits. All fields default to the protocol
/// constants; hosts may tighten or relax them at construction.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LedgerLimits {
    /// Largest inline `data` field, in bytes.
    pub inline_data_cap: usize,
    /// Largest off-chain blob, in bytes.
    pub max_off_chain_bytes: u64,
    /// Off-chain blobs at or above this size are skipped by deep content search.
    pub deep_scan_blob_threshold: u64,
    pub max_report_results: usize,
    pub max_result_metadata_entries: usize,
    pub password_min_len: usize,
    pub password_max_len: usize,
}

impl Default for LedgerLimits {
    fn default() -> Self {
        Self {
            inline_data_cap: INLINE_DATA_CAP_BYTES,
            max_off_chain_bytes: MAX_OFF_CHAIN_BYTES,
            deep_scan_blob_threshold: 4 * 1024 * 1024,
            max_report_results: MAX_REPORT_RESULTS,
            max_result_metadata_entries: MAX_RESULT_METADATA_ENTRIES,
            password_min_len: PASSWORD_MIN_LEN,
            password_max_len: PASSWORD_MAX_LEN,
        }
    }
}

impl LedgerLimits {
    /// Validate a password against the configured bounds. Runs before any
    /// KDF work so oversized input never reaches the crypto layer.
    pub fn check_password(&self, password: &str) -> Result<(), LedgerError> {
        let n = password.chars().count();
        if n < self.password_min_len {
            return Err(LedgerError::InvalidInput(format!(
                "password too short: minimum {} characters",
                self.password_min_len
            )));
        }
        if n > self.password_max_len {
            return Err(LedgerError::InvalidInput(format!(
                "password too long: maximum {} characters",
                self.password_max_len
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interoperability_ignores_cosmetic_flags() {
        let a = EncryptionConfig::default();
        let mut b = EncryptionConfig::default();
        b.enable_compression = true;
        b.validate_encryption_format = false;
        assert!(a.is_interoperable_with(&b));

        b.pbkdf2_iterations += 1;
        assert!(!a.is_interoperable_with(&b));
    }

    #[test]
    fn iteration_floor_enforced() {
        let mut cfg = EncryptionConfig::default();
        cfg.pbkdf2_iterations = 9_999;
        assert!(cfg.validate().is_err());
        cfg.pbkdf2_iterations = 10_000;
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn password_bounds() {
        let limits = LedgerLimits::default();
        assert!(limits.check_password("short").is_err());
        assert!(limits.check_password("long enough").is_ok());
        assert!(limits.check_password(&"x".repeat(257)).is_err());
    }
}
