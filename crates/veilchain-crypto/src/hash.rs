use sha2::{Digest, Sha256};

/// SHA-256 of arbitrary bytes → 32-byte array.
pub fn sha256_bytes(data: &[u8]) -> [u8; 32] {
    Sha256::digest(data).into()
}

/// SHA-256 of arbitrary bytes → 64-char lowercase hex.
pub fn sha256_hex(data: &[u8]) -> String {
    hex::encode(sha256_bytes(data))
}
