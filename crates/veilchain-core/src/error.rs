use thiserror::Error;

/// Workspace-wide error taxonomy.
///
/// Chain validation never maps a bad block into an `Err` — per-block
/// problems are reported in the validation report so the rest of the chain
/// keeps validating. Errors here are for operations that cannot proceed.
#[derive(Debug, Error)]
pub enum LedgerError {
    // ── Authorization ────────────────────────────────────────────────────────
    #[error("unauthorized: {0}")]
    Unauthorized(String),

    // ── Input validation ─────────────────────────────────────────────────────
    #[error("invalid input: {0}")]
    InvalidInput(String),

    // ── Cryptography ─────────────────────────────────────────────────────────
    #[error("signature verification failed")]
    SignatureInvalid,

    #[error("hash mismatch at block {block_number}")]
    HashMismatch { block_number: u64 },

    #[error("cryptographic operation failed: {0}")]
    Crypto(String),

    // ── Off-chain integrity ──────────────────────────────────────────────────
    #[error("off-chain integrity failure: {0}")]
    IntegrityFailed(String),

    // ── Lookup ───────────────────────────────────────────────────────────────
    #[error("not found: {0}")]
    NotFound(String),

    // ── Resource guards ──────────────────────────────────────────────────────
    #[error("capacity exceeded: {0}")]
    CapacityExceeded(String),

    // ── Persistence / serialization ──────────────────────────────────────────
    #[error("store operation failed: {0}")]
    StoreFailed(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    // ── Cancellation ─────────────────────────────────────────────────────────
    #[error("operation cancelled")]
    Cancelled,
}

impl LedgerError {
    /// True for errors a caller can fix by changing the request (as opposed
    /// to infrastructure failures).
    pub fn is_caller_error(&self) -> bool {
        matches!(
            self,
            LedgerError::Unauthorized(_)
                | LedgerError::InvalidInput(_)
                | LedgerError::SignatureInvalid
                | LedgerError::NotFound(_)
                | LedgerError::CapacityExceeded(_)
        )
    }
}
