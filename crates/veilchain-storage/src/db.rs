//! Sled-backed ledger database.
//!
//! Layout:
//!   chain (single tree, transactional unit for block writes)
//!     b/<u64 BE>                → bincode(Block)
//!     h/<hash hex>              → u64 BE (block number)
//!     e/<u64 BE>                → []  (encrypted-block membership)
//!     o/<u64 BE>                → []  (off-chain membership)
//!     s/<sha256(signer)><u64 BE>→ []  (signer membership)
//!     m/count                   → u64 BE (contiguous block count)
//!   authorized_keys — PEM bytes → bincode(AuthorizedKey)
//!   deleted_keys    — PEM bytes → bincode(DeletedKeyRecord)
//!   checkpoints     — id bytes  → bincode(RecoveryCheckpoint)
//!
//! Block writes and their secondary entries commit in one sled transaction
//! on the `chain` tree, so readers never observe a half-written block.

use std::collections::BTreeSet;
use std::collections::HashSet;
use std::path::Path;

use sled::transaction::{ConflictableTransactionError, TransactionError};
use tracing::info;
use veilchain_core::{AuthorizedKey, Block, DeletedKeyRecord, LedgerError, RecoveryCheckpoint};
use veilchain_crypto::sha256_bytes;

use crate::dao::BlockDao;

const KEY_COUNT: &[u8] = b"m/count";

pub struct LedgerDb {
    _db: sled::Db,
    chain: sled::Tree,
    authorized_keys: sled::Tree,
    deleted_keys: sled::Tree,
    checkpoints: sled::Tree,
}

fn store_err(e: impl std::fmt::Display) -> LedgerError {
    LedgerError::StoreFailed(e.to_string())
}

fn ser_err(e: impl std::fmt::Display) -> LedgerError {
    LedgerError::Serialization(e.to_string())
}

fn key_block(n: u64) -> Vec<u8> {
    let mut k = Vec::with_capacity(10);
    k.extend_from_slice(b"b/");
    k.extend_from_slice(&n.to_be_bytes());
    k
}

fn key_hash(hash: &str) -> Vec<u8> {
    [b"h/".as_ref(), hash.as_bytes()].concat()
}

fn key_encrypted(n: u64) -> Vec<u8> {
    let mut k = Vec::with_capacity(10);
    k.extend_from_slice(b"e/");
    k.extend_from_slice(&n.to_be_bytes());
    k
}

fn key_offchain(n: u64) -> Vec<u8> {
    let mut k = Vec::with_capacity(10);
    k.extend_from_slice(b"o/");
    k.extend_from_slice(&n.to_be_bytes());
    k
}

fn key_signer(public_key_pem: &str, n: u64) -> Vec<u8> {
    let mut k = Vec::with_capacity(42);
    k.extend_from_slice(b"s/");
    k.extend_from_slice(&sha256_bytes(public_key_pem.as_bytes()));
    k.extend_from_slice(&n.to_be_bytes());
    k
}

fn u64_from_be(bytes: &[u8]) -> u64 {
    let mut arr = [0u8; 8];
    arr.copy_from_slice(&bytes[..8]);
    u64::from_be_bytes(arr)
}

fn block_number_from_key(key: &[u8]) -> u64 {
    u64_from_be(&key[2..10])
}

impl LedgerDb {
    /// Open or create the ledger database at `path`.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, LedgerError> {
        let db = sled::open(path).map_err(store_err)?;
        let chain = db.open_tree("chain").map_err(store_err)?;
        let authorized_keys = db.open_tree("authorized_keys").map_err(store_err)?;
        let deleted_keys = db.open_tree("deleted_keys").map_err(store_err)?;
        let checkpoints = db.open_tree("checkpoints").map_err(store_err)?;
        Ok(Self {
            _db: db,
            chain,
            authorized_keys,
            deleted_keys,
            checkpoints,
        })
    }

    /// Flush all pending writes to disk.
    pub fn flush(&self) -> Result<(), LedgerError> {
        self._db.flush().map_err(store_err)?;
        Ok(())
    }

    fn decode_block(bytes: &[u8]) -> Result<Block, LedgerError> {
        bincode::deserialize(bytes).map_err(ser_err)
    }

    fn fetch_by_numbers(&self, numbers: &BTreeSet<u64>) -> Result<Vec<Block>, LedgerError> {
        let (Some(&min), Some(&max)) = (numbers.first(), numbers.last()) else {
            return Ok(Vec::new());
        };
        // One ordered range pass over the block prefix; membership decides
        // which records decode.
        let mut out = Vec::with_capacity(numbers.len());
        for item in self.chain.range(key_block(min)..=key_block(max)) {
            let (key, value) = item.map_err(store_err)?;
            if !key.starts_with(b"b/") {
                continue;
            }
            if numbers.contains(&block_number_from_key(&key)) {
                out.push(Self::decode_block(&value)?);
            }
        }
        Ok(out)
    }
}

impl BlockDao for LedgerDb {
    fn next_block_number(&self) -> Result<u64, LedgerError> {
        Ok(self
            .chain
            .get(KEY_COUNT)
            .map_err(store_err)?
            .map(|v| u64_from_be(&v))
            .unwrap_or(0))
    }

    fn put_block(&self, block: &Block) -> Result<(), LedgerError> {
        let encoded = bincode::serialize(block).map_err(ser_err)?;
        let n = block.block_number;
        let hash_key = key_hash(&block.hash);
        let signer_key = key_signer(&block.signer_public_key, n);
        let is_encrypted = block.is_encrypted;
        let has_off_chain = block.off_chain_ref.is_some();

        let result = self.chain.transaction(|tx| {
            let count = match tx.get(KEY_COUNT)? {
                Some(v) => u64_from_be(&v),
                None => 0,
            };
            if n != count {
                return Err(ConflictableTransactionError::Abort(format!(
                    "non-contiguous block number {n} (expected {count})"
                )));
            }
            tx.insert(key_block(n), encoded.clone())?;
            tx.insert(hash_key.clone(), n.to_be_bytes().to_vec())?;
            if is_encrypted {
                tx.insert(key_encrypted(n), Vec::new())?;
            }
            if has_off_chain {
                tx.insert(key_offchain(n), Vec::new())?;
            }
            tx.insert(signer_key.clone(), Vec::new())?;
            tx.insert(KEY_COUNT, (count + 1).to_be_bytes().to_vec())?;
            Ok(())
        });

        match result {
            Ok(()) => Ok(()),
            Err(TransactionError::Abort(msg)) => Err(LedgerError::StoreFailed(msg)),
            Err(TransactionError::Storage(e)) => Err(store_err(e)),
        }
    }

    fn get_block(&self, block_number: u64) -> Result<Option<Block>, LedgerError> {
        match self.chain.get(key_block(block_number)).map_err(store_err)? {
            Some(bytes) => Ok(Some(Self::decode_block(&bytes)?)),
            None => Ok(None),
        }
    }

    fn get_block_by_hash(&self, hash: &str) -> Result<Option<Block>, LedgerError> {
        match self.chain.get(key_hash(hash)).map_err(store_err)? {
            Some(n) => self.get_block(u64_from_be(&n)),
            None => Ok(None),
        }
    }

    fn get_blocks_paginated(&self, offset: u64, limit: usize) -> Result<Vec<Block>, LedgerError> {
        let mut out = Vec::with_capacity(limit.min(1024));
        for item in self.chain.scan_prefix(b"b/").skip(offset as usize).take(limit) {
            let (_, value) = item.map_err(store_err)?;
            out.push(Self::decode_block(&value)?);
        }
        Ok(out)
    }

    fn get_block_count(&self) -> Result<u64, LedgerError> {
        self.next_block_number()
    }

    fn get_last_block(&self) -> Result<Option<Block>, LedgerError> {
        let mut iter = self.chain.scan_prefix(b"b/");
        match iter.next_back() {
            Some(item) => {
                let (_, value) = item.map_err(store_err)?;
                Ok(Some(Self::decode_block(&value)?))
            }
            None => Ok(None),
        }
    }

    fn batch_retrieve_blocks(&self, block_numbers: &[u64]) -> Result<Vec<Block>, LedgerError> {
        let numbers: BTreeSet<u64> = block_numbers.iter().copied().collect();
        self.fetch_by_numbers(&numbers)
    }

    fn batch_retrieve_blocks_by_hash(&self, hashes: &[String]) -> Result<Vec<Block>, LedgerError> {
        if hashes.is_empty() {
            return Ok(Vec::new());
        }
        let wanted: HashSet<&str> = hashes.iter().map(String::as_str).collect();
        // Single ordered pass; hashes are random so a range bound buys nothing.
        let mut out = Vec::with_capacity(wanted.len());
        for item in self.chain.scan_prefix(b"b/") {
            let (_, value) = item.map_err(store_err)?;
            let block = Self::decode_block(&value)?;
            if wanted.contains(block.hash.as_str()) {
                out.push(block);
            }
        }
        Ok(out)
    }

    fn get_encrypted_blocks_paginated(
        &self,
        offset: u64,
        limit: usize,
    ) -> Result<Vec<Block>, LedgerError> {
        let mut numbers = BTreeSet::new();
        for item in self.chain.scan_prefix(b"e/").skip(offset as usize).take(limit) {
            let (key, _) = item.map_err(store_err)?;
            numbers.insert(block_number_from_key(&key));
        }
        self.fetch_by_numbers(&numbers)
    }

    fn get_blocks_with_off_chain_data_paginated(
        &self,
        offset: u64,
        limit: usize,
    ) -> Result<Vec<Block>, LedgerError> {
        let mut numbers = BTreeSet::new();
        for item in self.chain.scan_prefix(b"o/").skip(offset as usize).take(limit) {
            let (key, _) = item.map_err(store_err)?;
            numbers.insert(block_number_from_key(&key));
        }
        self.fetch_by_numbers(&numbers)
    }

    fn count_blocks_signed_by(&self, public_key_pem: &str) -> Result<u64, LedgerError> {
        let mut prefix = Vec::with_capacity(34);
        prefix.extend_from_slice(b"s/");
        prefix.extend_from_slice(&sha256_bytes(public_key_pem.as_bytes()));
        let mut count = 0u64;
        for item in self.chain.scan_prefix(&prefix) {
            item.map_err(store_err)?;
            count += 1;
        }
        Ok(count)
    }

    fn delete_blocks_after(&self, block_number: u64) -> Result<u64, LedgerError> {
        // Collect the doomed blocks first; the removal itself is one
        // transaction so a crash cannot leave dangling index entries.
        let mut doomed = Vec::new();
        for item in self.chain.range(key_block(block_number + 1)..key_block(u64::MAX)) {
            let (key, value) = item.map_err(store_err)?;
            if !key.starts_with(b"b/") {
                continue;
            }
            doomed.push(Self::decode_block(&value)?);
        }
        if doomed.is_empty() {
            return Ok(0);
        }

        let new_count = block_number + 1;
        let result = self.chain.transaction(|tx| {
            for block in &doomed {
                let n = block.block_number;
                tx.remove(key_block(n))?;
                tx.remove(key_hash(&block.hash))?;
                tx.remove(key_encrypted(n))?;
                tx.remove(key_offchain(n))?;
                tx.remove(key_signer(&block.signer_public_key, n))?;
            }
            tx.insert(KEY_COUNT, new_count.to_be_bytes().to_vec())?;
            Ok::<(), ConflictableTransactionError<String>>(())
        });
        match result {
            Ok(()) => {
                info!(after = block_number, removed = doomed.len(), "truncated block store");
                Ok(doomed.len() as u64)
            }
            Err(TransactionError::Abort(msg)) => Err(LedgerError::StoreFailed(msg)),
            Err(TransactionError::Storage(e)) => Err(store_err(e)),
        }
    }

    // ── Authorized keys ──────────────────────────────────────────────────────

    fn put_authorized_key(&self, key: &AuthorizedKey) -> Result<(), LedgerError> {
        let bytes = bincode::serialize(key).map_err(ser_err)?;
        self.authorized_keys
            .insert(key.public_key.as_bytes(), bytes)
            .map_err(store_err)?;
        Ok(())
    }

    fn get_authorized_key(
        &self,
        public_key_pem: &str,
    ) -> Result<Option<AuthorizedKey>, LedgerError> {
        match self
            .authorized_keys
            .get(public_key_pem.as_bytes())
            .map_err(store_err)?
        {
            Some(bytes) => Ok(Some(bincode::deserialize(&bytes).map_err(ser_err)?)),
            None => Ok(None),
        }
    }

    fn list_authorized_keys(&self) -> Result<Vec<AuthorizedKey>, LedgerError> {
        let mut out = Vec::new();
        for item in self.authorized_keys.iter() {
            let (_, bytes) = item.map_err(store_err)?;
            out.push(bincode::deserialize(&bytes).map_err(ser_err)?);
        }
        Ok(out)
    }

    fn remove_authorized_key(&self, public_key_pem: &str) -> Result<bool, LedgerError> {
        Ok(self
            .authorized_keys
            .remove(public_key_pem.as_bytes())
            .map_err(store_err)?
            .is_some())
    }

    fn put_deleted_key_record(&self, record: &DeletedKeyRecord) -> Result<(), LedgerError> {
        let bytes = bincode::serialize(record).map_err(ser_err)?;
        self.deleted_keys
            .insert(record.public_key.as_bytes(), bytes)
            .map_err(store_err)?;
        Ok(())
    }

    fn get_deleted_key_record(
        &self,
        public_key_pem: &str,
    ) -> Result<Option<DeletedKeyRecord>, LedgerError> {
        match self
            .deleted_keys
            .get(public_key_pem.as_bytes())
            .map_err(store_err)?
        {
            Some(bytes) => Ok(Some(bincode::deserialize(&bytes).map_err(ser_err)?)),
            None => Ok(None),
        }
    }

    // ── Recovery checkpoints ─────────────────────────────────────────────────

    fn put_checkpoint(&self, checkpoint: &RecoveryCheckpoint) -> Result<(), LedgerError> {
        let bytes = bincode::serialize(checkpoint).map_err(ser_err)?;
        self.checkpoints
            .insert(checkpoint.checkpoint_id.as_bytes(), bytes)
            .map_err(store_err)?;
        Ok(())
    }

    fn get_checkpoint(
        &self,
        checkpoint_id: &str,
    ) -> Result<Option<RecoveryCheckpoint>, LedgerError> {
        match self
            .checkpoints
            .get(checkpoint_id.as_bytes())
            .map_err(store_err)?
        {
            Some(bytes) => Ok(Some(bincode::deserialize(&bytes).map_err(ser_err)?)),
            None => Ok(None),
        }
    }

    fn list_checkpoints(&self) -> Result<Vec<RecoveryCheckpoint>, LedgerError> {
        let mut out = Vec::new();
        for item in self.checkpoints.iter() {
            let (_, bytes) = item.map_err(store_err)?;
            out.push(bincode::deserialize(&bytes).map_err(ser_err)?);
        }
        Ok(out)
    }

    fn delete_checkpoint(&self, checkpoint_id: &str) -> Result<bool, LedgerError> {
        Ok(self
            .checkpoints
            .remove(checkpoint_id.as_bytes())
            .map_err(store_err)?
            .is_some())
    }
}
