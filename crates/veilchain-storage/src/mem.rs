//! In-memory DAO with query instrumentation.
//!
//! Functionally equivalent to the sled driver but backed by maps under a
//! mutex, with a per-method call counter. Tests use the counters to prove
//! that batch paths issue exactly one query instead of N point lookups.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use veilchain_core::{AuthorizedKey, Block, DeletedKeyRecord, LedgerError, RecoveryCheckpoint};

use crate::dao::BlockDao;

/// Per-method query counters. Each trait call counts as one query
/// regardless of how many records it touches.
#[derive(Default)]
pub struct DaoCallStats {
    get_block: AtomicU64,
    get_block_by_hash: AtomicU64,
    get_blocks_paginated: AtomicU64,
    batch_retrieve_blocks: AtomicU64,
    batch_retrieve_blocks_by_hash: AtomicU64,
    put_block: AtomicU64,
    total: AtomicU64,
}

impl DaoCallStats {
    pub fn get_block_calls(&self) -> u64 {
        self.get_block.load(Ordering::SeqCst)
    }
    pub fn get_block_by_hash_calls(&self) -> u64 {
        self.get_block_by_hash.load(Ordering::SeqCst)
    }
    pub fn get_blocks_paginated_calls(&self) -> u64 {
        self.get_blocks_paginated.load(Ordering::SeqCst)
    }
    pub fn batch_retrieve_calls(&self) -> u64 {
        self.batch_retrieve_blocks.load(Ordering::SeqCst)
    }
    pub fn batch_retrieve_by_hash_calls(&self) -> u64 {
        self.batch_retrieve_blocks_by_hash.load(Ordering::SeqCst)
    }
    pub fn put_block_calls(&self) -> u64 {
        self.put_block.load(Ordering::SeqCst)
    }
    pub fn total_queries(&self) -> u64 {
        self.total.load(Ordering::SeqCst)
    }

    pub fn reset(&self) {
        self.get_block.store(0, Ordering::SeqCst);
        self.get_block_by_hash.store(0, Ordering::SeqCst);
        self.get_blocks_paginated.store(0, Ordering::SeqCst);
        self.batch_retrieve_blocks.store(0, Ordering::SeqCst);
        self.batch_retrieve_blocks_by_hash.store(0, Ordering::SeqCst);
        self.put_block.store(0, Ordering::SeqCst);
        self.total.store(0, Ordering::SeqCst);
    }

    fn bump(&self, counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::SeqCst);
        self.total.fetch_add(1, Ordering::SeqCst);
    }
}

#[derive(Default)]
struct Inner {
    blocks: BTreeMap<u64, Block>,
    by_hash: HashMap<String, u64>,
    authorized_keys: HashMap<String, AuthorizedKey>,
    deleted_keys: HashMap<String, DeletedKeyRecord>,
    checkpoints: HashMap<String, RecoveryCheckpoint>,
}

/// Map-backed [`BlockDao`] for tests and tooling.
#[derive(Default)]
pub struct MemoryDao {
    inner: Mutex<Inner>,
    stats: DaoCallStats,
}

impl MemoryDao {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stats(&self) -> &DaoCallStats {
        &self.stats
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().expect("memory dao poisoned")
    }
}

impl BlockDao for MemoryDao {
    fn next_block_number(&self) -> Result<u64, LedgerError> {
        Ok(self.lock().blocks.len() as u64)
    }

    fn put_block(&self, block: &Block) -> Result<(), LedgerError> {
        self.stats.bump(&self.stats.put_block);
        let mut inner = self.lock();
        let expected = inner.blocks.len() as u64;
        if block.block_number != expected {
            return Err(LedgerError::StoreFailed(format!(
                "non-contiguous block number {} (expected {expected})",
                block.block_number
            )));
        }
        inner.by_hash.insert(block.hash.clone(), block.block_number);
        inner.blocks.insert(block.block_number, block.clone());
        Ok(())
    }

    fn get_block(&self, block_number: u64) -> Result<Option<Block>, LedgerError> {
        self.stats.bump(&self.stats.get_block);
        Ok(self.lock().blocks.get(&block_number).cloned())
    }

    fn get_block_by_hash(&self, hash: &str) -> Result<Option<Block>, LedgerError> {
        self.stats.bump(&self.stats.get_block_by_hash);
        let inner = self.lock();
        Ok(inner
            .by_hash
            .get(hash)
            .and_then(|n| inner.blocks.get(n))
            .cloned())
    }

    fn get_blocks_paginated(&self, offset: u64, limit: usize) -> Result<Vec<Block>, LedgerError> {
        self.stats.bump(&self.stats.get_blocks_paginated);
        Ok(self
            .lock()
            .blocks
            .values()
            .skip(offset as usize)
            .take(limit)
            .cloned()
            .collect())
    }

    fn get_block_count(&self) -> Result<u64, LedgerError> {
        Ok(self.lock().blocks.len() as u64)
    }

    fn get_last_block(&self) -> Result<Option<Block>, LedgerError> {
        Ok(self.lock().blocks.values().next_back().cloned())
    }

    fn batch_retrieve_blocks(&self, block_numbers: &[u64]) -> Result<Vec<Block>, LedgerError> {
        self.stats.bump(&self.stats.batch_retrieve_blocks);
        let wanted: BTreeSet<u64> = block_numbers.iter().copied().collect();
        let inner = self.lock();
        Ok(wanted
            .iter()
            .filter_map(|n| inner.blocks.get(n))
            .cloned()
            .collect())
    }

    fn batch_retrieve_blocks_by_hash(&self, hashes: &[String]) -> Result<Vec<Block>, LedgerError> {
        self.stats.bump(&self.stats.batch_retrieve_blocks_by_hash);
        let wanted: HashSet<&str> = hashes.iter().map(String::as_str).collect();
        let inner = self.lock();
        let mut numbers: Vec<u64> = inner
            .by_hash
            .iter()
            .filter(|(h, _)| wanted.contains(h.as_str()))
            .map(|(_, n)| *n)
            .collect();
        numbers.sort_unstable();
        Ok(numbers
            .iter()
            .filter_map(|n| inner.blocks.get(n))
            .cloned()
            .collect())
    }

    fn get_encrypted_blocks_paginated(
        &self,
        offset: u64,
        limit: usize,
    ) -> Result<Vec<Block>, LedgerError> {
        Ok(self
            .lock()
            .blocks
            .values()
            .filter(|b| b.is_encrypted)
            .skip(offset as usize)
            .take(limit)
            .cloned()
            .collect())
    }

    fn get_blocks_with_off_chain_data_paginated(
        &self,
        offset: u64,
        limit: usize,
    ) -> Result<Vec<Block>, LedgerError> {
        Ok(self
            .lock()
            .blocks
            .values()
            .filter(|b| b.off_chain_ref.is_some())
            .skip(offset as usize)
            .take(limit)
            .cloned()
            .collect())
    }

    fn count_blocks_signed_by(&self, public_key_pem: &str) -> Result<u64, LedgerError> {
        Ok(self
            .lock()
            .blocks
            .values()
            .filter(|b| b.signer_public_key == public_key_pem)
            .count() as u64)
    }

    fn delete_blocks_after(&self, block_number: u64) -> Result<u64, LedgerError> {
        let mut inner = self.lock();
        let doomed: Vec<u64> = inner
            .blocks
            .range(block_number + 1..)
            .map(|(n, _)| *n)
            .collect();
        for n in &doomed {
            if let Some(block) = inner.blocks.remove(n) {
                inner.by_hash.remove(&block.hash);
            }
        }
        Ok(doomed.len() as u64)
    }

    fn put_authorized_key(&self, key: &AuthorizedKey) -> Result<(), LedgerError> {
        self.lock()
            .authorized_keys
            .insert(key.public_key.clone(), key.clone());
        Ok(())
    }

    fn get_authorized_key(
        &self,
        public_key_pem: &str,
    ) -> Result<Option<AuthorizedKey>, LedgerError> {
        Ok(self.lock().authorized_keys.get(public_key_pem).cloned())
    }

    fn list_authorized_keys(&self) -> Result<Vec<AuthorizedKey>, LedgerError> {
        Ok(self.lock().authorized_keys.values().cloned().collect())
    }

    fn remove_authorized_key(&self, public_key_pem: &str) -> Result<bool, LedgerError> {
        Ok(self.lock().authorized_keys.remove(public_key_pem).is_some())
    }

    fn put_deleted_key_record(&self, record: &DeletedKeyRecord) -> Result<(), LedgerError> {
        self.lock()
            .deleted_keys
            .insert(record.public_key.clone(), record.clone());
        Ok(())
    }

    fn get_deleted_key_record(
        &self,
        public_key_pem: &str,
    ) -> Result<Option<DeletedKeyRecord>, LedgerError> {
        Ok(self.lock().deleted_keys.get(public_key_pem).cloned())
    }

    fn put_checkpoint(&self, checkpoint: &RecoveryCheckpoint) -> Result<(), LedgerError> {
        self.lock()
            .checkpoints
            .insert(checkpoint.checkpoint_id.clone(), checkpoint.clone());
        Ok(())
    }

    fn get_checkpoint(
        &self,
        checkpoint_id: &str,
    ) -> Result<Option<RecoveryCheckpoint>, LedgerError> {
        Ok(self.lock().checkpoints.get(checkpoint_id).cloned())
    }

    fn list_checkpoints(&self) -> Result<Vec<RecoveryCheckpoint>, LedgerError> {
        Ok(self.lock().checkpoints.values().cloned().collect())
    }

    fn delete_checkpoint(&self, checkpoint_id: &str) -> Result<bool, LedgerError> {
        Ok(self.lock().checkpoints.remove(checkpoint_id).is_some())
    }
}
