//! veilchain-offchain
//!
//! Content-addressed storage for payloads too large to live on-chain.
//! Each blob is stored under `<root>/<hh>/<sha256>.blob` where `hh` is the
//! first two hex digits of the digest, with a sibling `.sig` file holding
//! the raw detached signature over the stored bytes. Encrypted blobs are
//! laid out `iv(12) ‖ ciphertext ‖ tag(16)`; the digest and the signature
//! always cover the stored (possibly encrypted) bytes, so integrity can be
//! verified without a password.

pub mod store;

pub use store::{BlobStore, BlobVerification};
