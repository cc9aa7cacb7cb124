//! Genesis bootstrap.
//!
//! The genesis block is signed by a reserved bootstrap key derived
//! deterministically from a fixed seed. The key is authorized for block 0
//! only, never appears in the authorized-key table, and can therefore
//! never be revoked or deleted.

use chrono::Utc;
use once_cell::sync::Lazy;

use veilchain_core::constants::{GENESIS_DATA, GENESIS_PREVIOUS_HASH};
use veilchain_core::{truncate_to_micros, Block};
use veilchain_crypto::{sha256_bytes, KeyPair};

use crate::canonical;

static BOOTSTRAP: Lazy<KeyPair> = Lazy::new(|| {
    // Walk the hash chain of the fixed seed until it lands on a valid
    // scalar; the walk is deterministic, so every process derives the same
    // key.
    let mut seed = sha256_bytes(b"veilchain bootstrap signer v1");
    loop {
        if let Ok(kp) = KeyPair::from_secret_scalar_bytes(&seed) {
            return kp;
        }
        seed = sha256_bytes(&seed);
    }
});

/// PEM of the reserved bootstrap signer.
pub fn bootstrap_public_key_pem() -> &'static str {
    BOOTSTRAP.public_key_pem()
}

/// Build and sign the genesis block. Called exactly once, on an empty
/// store.
pub fn build_genesis_block() -> Block {
    let timestamp = truncate_to_micros(Utc::now());
    let signer_public_key = BOOTSTRAP.public_key_pem().to_string();
    let content = canonical::plain_content(
        0,
        GENESIS_PREVIOUS_HASH,
        &timestamp,
        GENESIS_DATA,
        &signer_public_key,
    );
    let hash = veilchain_crypto::sha256_hex(content.as_bytes());
    let signature = BOOTSTRAP.sign(hash.as_bytes());
    Block {
        block_number: 0,
        previous_hash: GENESIS_PREVIOUS_HASH.to_string(),
        timestamp,
        data: GENESIS_DATA.to_string(),
        signer_public_key,
        signature,
        hash,
        is_encrypted: false,
        encryption_metadata: None,
        category: None,
        manual_keywords: Vec::new(),
        content_category: None,
        recipient_username: None,
        off_chain_ref: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use veilchain_crypto::verify_signature;

    #[test]
    fn bootstrap_key_is_stable() {
        assert_eq!(bootstrap_public_key_pem(), bootstrap_public_key_pem());
    }

    #[test]
    fn genesis_block_is_well_formed() {
        let g = build_genesis_block();
        assert!(g.is_genesis());
        assert_eq!(g.hash, canonical::hash_for_block(&g));
        assert!(verify_signature(&g.signer_public_key, g.hash.as_bytes(), &g.signature).is_ok());
    }
}
