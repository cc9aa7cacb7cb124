use serde::{Deserialize, Serialize};
use std::fmt;

use crate::constants::{ENCRYPTED_MARKER, GENESIS_PREVIOUS_HASH};
use crate::types::Timestamp;

/// Reference to a payload stored outside the chain.
///
/// The block owns the reference; the reference owns the file on disk. The
/// digest and signature cover the *stored* bytes — ciphertext when the blob
/// is encrypted — so integrity is checkable without a password.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct OffChainRef {
    /// Content address of the blob; equals `sha256`.
    pub file_id: String,
    /// Size of the stored file in bytes.
    pub size: u64,
    /// Lowercase hex SHA-256 of the stored file bytes.
    pub sha256: String,
    /// Base64 detached signature over the stored file bytes, made by the
    /// block's signer.
    pub signature: String,
    /// Base64 AES-GCM IV; present iff the blob is encrypted.
    pub iv: Option<String>,
}

/// One record of the append-only chain. Immutable once appended.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Block {
    /// Contiguous from 0 (genesis).
    pub block_number: u64,

    /// Hex SHA-256 of the prior block's `hash`; genesis uses the sentinel `"0"`.
    pub previous_hash: String,

    /// UTC append instant, microsecond precision.
    pub timestamp: Timestamp,

    /// UTF-8 payload. Encrypted blocks carry the `[ENCRYPTED]` marker
    /// followed by the base64 ciphertext envelope.
    pub data: String,

    /// PEM (SPKI) encoding of the signer's P-256 public key.
    pub signer_public_key: String,

    /// Base64 detached ECDSA signature over the block's `hash`.
    pub signature: String,

    /// Hex SHA-256 of the canonical content.
    pub hash: String,

    pub is_encrypted: bool,

    /// Opaque JSON blob describing the encryption (algorithm, IV, salt,
    /// KDF parameters). `None` for plaintext blocks.
    pub encryption_metadata: Option<String>,

    // ── Searchable metadata ──────────────────────────────────────────────────
    pub category: Option<String>,
    pub manual_keywords: Vec<String>,
    pub content_category: Option<String>,

    /// Set when the block is encrypted for a specific recipient.
    pub recipient_username: Option<String>,

    pub off_chain_ref: Option<OffChainRef>,
}

impl Block {
    pub fn is_genesis(&self) -> bool {
        self.block_number == 0 && self.previous_hash == GENESIS_PREVIOUS_HASH
    }

    /// True when the stored `data` carries the encrypted-envelope marker.
    pub fn has_encrypted_marker(&self) -> bool {
        self.data.starts_with(ENCRYPTED_MARKER)
    }

    pub fn has_off_chain_data(&self) -> bool {
        self.off_chain_ref.is_some()
    }
}

impl fmt::Display for Block {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let hash_prefix = if self.hash.len() >= 16 { &self.hash[..16] } else { &self.hash };
        write!(f, "Block #{} [{}…]", self.block_number, hash_prefix)
    }
}
