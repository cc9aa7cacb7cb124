use veilchain_core::{AuthorizedKey, Block, DeletedKeyRecord, LedgerError, RecoveryCheckpoint};

/// Persistence contract for the chain engine and the search/index layers.
///
/// Any driver offering ordered scans, point lookup, set-filtered batch
/// reads, and per-call atomicity satisfies this. Batch retrieval methods
/// MUST resolve in a single underlying query — callers rely on them to
/// avoid per-item lookup storms, and the in-memory driver counts calls to
/// keep that property honest.
pub trait BlockDao: Send + Sync {
    // ── Blocks ───────────────────────────────────────────────────────────────

    /// The number the next appended block will carry. Blocks are contiguous
    /// from 0, so this equals the current block count. Writers serialize
    /// appends under the chain write lock; `put_block` still enforces
    /// contiguity atomically.
    fn next_block_number(&self) -> Result<u64, LedgerError>;

    /// Persist a block and its secondary index entries atomically.
    /// Rejects a block whose number is not the next contiguous number.
    fn put_block(&self, block: &Block) -> Result<(), LedgerError>;

    fn get_block(&self, block_number: u64) -> Result<Option<Block>, LedgerError>;

    fn get_block_by_hash(&self, hash: &str) -> Result<Option<Block>, LedgerError>;

    /// Blocks ordered by number, skipping `offset`, at most `limit`.
    fn get_blocks_paginated(&self, offset: u64, limit: usize) -> Result<Vec<Block>, LedgerError>;

    fn get_block_count(&self) -> Result<u64, LedgerError>;

    fn get_last_block(&self) -> Result<Option<Block>, LedgerError>;

    /// Fetch many blocks in one query; result is ascending by number, with
    /// unknown numbers silently absent.
    fn batch_retrieve_blocks(&self, block_numbers: &[u64]) -> Result<Vec<Block>, LedgerError>;

    /// Fetch many blocks by hash in one query; result ascending by number.
    fn batch_retrieve_blocks_by_hash(&self, hashes: &[String]) -> Result<Vec<Block>, LedgerError>;

    fn get_encrypted_blocks_paginated(
        &self,
        offset: u64,
        limit: usize,
    ) -> Result<Vec<Block>, LedgerError>;

    fn get_blocks_with_off_chain_data_paginated(
        &self,
        offset: u64,
        limit: usize,
    ) -> Result<Vec<Block>, LedgerError>;

    /// Historical blocks signed by `public_key_pem` (deletion impact input).
    fn count_blocks_signed_by(&self, public_key_pem: &str) -> Result<u64, LedgerError>;

    /// Remove every block with number > `block_number` (checkpoint
    /// restore). Returns how many were removed.
    fn delete_blocks_after(&self, block_number: u64) -> Result<u64, LedgerError>;

    // ── Authorized keys ──────────────────────────────────────────────────────

    /// Insert a key record; `public_key` is unique.
    fn put_authorized_key(&self, key: &AuthorizedKey) -> Result<(), LedgerError>;

    fn get_authorized_key(&self, public_key_pem: &str)
        -> Result<Option<AuthorizedKey>, LedgerError>;

    fn list_authorized_keys(&self) -> Result<Vec<AuthorizedKey>, LedgerError>;

    /// Hard-remove a key record; returns whether it existed.
    fn remove_authorized_key(&self, public_key_pem: &str) -> Result<bool, LedgerError>;

    fn put_deleted_key_record(&self, record: &DeletedKeyRecord) -> Result<(), LedgerError>;

    fn get_deleted_key_record(
        &self,
        public_key_pem: &str,
    ) -> Result<Option<DeletedKeyRecord>, LedgerError>;

    // ── Recovery checkpoints ─────────────────────────────────────────────────

    fn put_checkpoint(&self, checkpoint: &RecoveryCheckpoint) -> Result<(), LedgerError>;

    fn get_checkpoint(&self, checkpoint_id: &str)
        -> Result<Option<RecoveryCheckpoint>, LedgerError>;

    fn list_checkpoints(&self) -> Result<Vec<RecoveryCheckpoint>, LedgerError>;

    fn delete_checkpoint(&self, checkpoint_id: &str) -> Result<bool, LedgerError>;
}
