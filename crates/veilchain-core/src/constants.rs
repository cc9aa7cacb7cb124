//! ─── Veilchain Protocol Constants ────────────────────────────────────────────
//!
//! Fixed markers, sentinels, and default resource limits. Tunable values
//! have a matching field on [`crate::config::LedgerLimits`] or
//! [`crate::config::EncryptionConfig`]; the constants here are the defaults.

// ── Chain sentinels ───────────────────────────────────────────────────────────

/// `previous_hash` of the genesis block. Every later block carries the hex
/// SHA-256 of its predecessor.
pub const GENESIS_PREVIOUS_HASH: &str = "0";

/// Payload of the genesis block.
pub const GENESIS_DATA: &str = "Genesis Block";

/// Prefix of the `data` field of every encrypted block. The remainder of
/// the field is the base64 ciphertext envelope.
pub const ENCRYPTED_MARKER: &str = "[ENCRYPTED]";

// ── Payload limits ────────────────────────────────────────────────────────────

/// Largest `data` field stored inline on-chain. Anything larger must be
/// routed to the off-chain blob store.
pub const INLINE_DATA_CAP_BYTES: usize = 1024 * 1024;

/// Largest single off-chain blob.
pub const MAX_OFF_CHAIN_BYTES: u64 = 50 * 1024 * 1024;

// ── Password / KDF ────────────────────────────────────────────────────────────

pub const PASSWORD_MIN_LEN: usize = 8;
pub const PASSWORD_MAX_LEN: usize = 256;

/// Default PBKDF2-HMAC-SHA256 iteration count.
pub const PBKDF2_DEFAULT_ITERATIONS: u32 = 100_000;

/// Lowest iteration count accepted by configuration validation.
pub const PBKDF2_MIN_ITERATIONS: u32 = 10_000;

// ── AEAD layout (AES-GCM) ─────────────────────────────────────────────────────

/// AES-GCM IV length in bytes (96 bits).
pub const AEAD_IV_LEN: usize = 12;

/// AES-GCM authentication tag length in bytes.
pub const AEAD_TAG_LEN: usize = 16;

/// Key-file KDF salt length in bytes.
pub const KDF_SALT_LEN: usize = 16;

// ── Integrity reports ─────────────────────────────────────────────────────────

/// Hard cap on results held by one off-chain integrity report.
pub const MAX_REPORT_RESULTS: usize = 100_000;

/// Hard cap on metadata entries attached to one integrity check result.
pub const MAX_RESULT_METADATA_ENTRIES: usize = 50;

pub const MAX_REPORT_ID_LEN: usize = 255;
pub const MAX_DATA_ID_LEN: usize = 500;
pub const MAX_DETAILS_LEN: usize = 2_000;

/// Longest plausible single integrity check (24 hours, in milliseconds).
pub const MAX_CHECK_DURATION_MS: u64 = 24 * 3600 * 1000;

// ── Caches ────────────────────────────────────────────────────────────────────

/// Bounded capacity of the key-derivation LRU cache.
pub const KDF_CACHE_CAPACITY: usize = 64;

// ── Environment variables (production wiring) ─────────────────────────────────

/// Master password for the key-file store, read by the env constructor only.
pub const ENV_MASTER_PASSWORD: &str = "VEILCHAIN_MASTER_PASSWORD";

/// Key-file store directory, read by the env constructor only.
pub const ENV_KEYSTORE_PATH: &str = "VEILCHAIN_KEYSTORE_PATH";
