//! Canonical block content.
//!
//! The byte sequence hashed into a block's `hash` is a `|`-joined
//! concatenation of the block's identifying fields. Two builders exist and
//! validation MUST pick by `is_encrypted`:
//!
//! - the plain builder takes the cleartext `data` field;
//! - the encrypted builder takes the stored ciphertext envelope exactly as
//!   persisted (marker, base64 IV, ciphertext and tag).
//!
//! Feeding an encrypted block's decrypted plaintext through the plain
//! builder produces a hash that matches nothing on disk; tampered
//! ciphertext would then slip through validation unnoticed.

use veilchain_core::{canonical_timestamp, Block, Timestamp};
use veilchain_crypto::sha256_hex;

/// Canonical content of a plaintext block.
pub fn plain_content(
    block_number: u64,
    previous_hash: &str,
    timestamp: &Timestamp,
    data: &str,
    signer_public_key: &str,
) -> String {
    format!(
        "{block_number}|{previous_hash}|{}|{data}|{signer_public_key}",
        canonical_timestamp(timestamp)
    )
}

/// Canonical content of an encrypted block. `envelope` is the exact stored
/// `data` field.
pub fn encrypted_content(
    block_number: u64,
    previous_hash: &str,
    timestamp: &Timestamp,
    envelope: &str,
    signer_public_key: &str,
) -> String {
    format!(
        "{block_number}|{previous_hash}|{}|{envelope}|{signer_public_key}",
        canonical_timestamp(timestamp)
    )
}

/// Builder selection for an existing block record.
pub fn content_for_block(block: &Block) -> String {
    if block.is_encrypted {
        encrypted_content(
            block.block_number,
            &block.previous_hash,
            &block.timestamp,
            &block.data,
            &block.signer_public_key,
        )
    } else {
        plain_content(
            block.block_number,
            &block.previous_hash,
            &block.timestamp,
            &block.data,
            &block.signer_public_key,
        )
    }
}

/// Recompute the hash a block should carry.
pub fn hash_for_block(block: &Block) -> String {
    sha256_hex(content_for_block(block).as_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use veilchain_core::truncate_to_micros;

    fn ts() -> Timestamp {
        truncate_to_micros(Utc.with_ymd_and_hms(2026, 8, 1, 9, 30, 0).unwrap())
    }

    #[test]
    fn content_is_stable() {
        let c = plain_content(3, "abc", &ts(), "hello", "PEM");
        assert_eq!(c, "3|abc|2026-08-01T09:30:00.000000Z|hello|PEM");
    }

    #[test]
    fn builder_selection_follows_is_encrypted() {
        let envelope = "[ENCRYPTED]AAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAA";
        let mut block = Block {
            block_number: 1,
            previous_hash: "prev".into(),
            timestamp: ts(),
            data: envelope.into(),
            signer_public_key: "PEM".into(),
            signature: String::new(),
            hash: String::new(),
            is_encrypted: true,
            encryption_metadata: None,
            category: None,
            manual_keywords: Vec::new(),
            content_category: None,
            recipient_username: None,
            off_chain_ref: None,
        };
        let encrypted_hash = hash_for_block(&block);
        assert_eq!(
            encrypted_hash,
            sha256_hex(encrypted_content(1, "prev", &ts(), envelope, "PEM").as_bytes())
        );

        // The plain builder over the hidden plaintext is a different value
        // entirely; mixing the builders cannot go unnoticed.
        let plaintext_hash =
            sha256_hex(plain_content(1, "prev", &ts(), "secret-payload", "PEM").as_bytes());
        assert_ne!(encrypted_hash, plaintext_hash);

        // Any change to the stored envelope moves the hash.
        block.data = envelope.replacen('A', "B", 1);
        assert_ne!(hash_for_block(&block), encrypted_hash);
    }
}
