pub mod aead;
pub mod envelope;
pub mod error;
pub mod hash;
pub mod kdf;
pub mod keypair;

pub use error::CryptoError;
pub use hash::{sha256_bytes, sha256_hex};
pub use kdf::{derive_key, KdfCache};
pub use keypair::{verify_signature, KeyPair};
