use std::sync::{Arc, RwLock};

use chrono::Utc;
use tracing::{info, warn};

use veilchain_core::{
    truncate_to_micros, AuthorizedKey, Block, CancelToken, DeletedKeyRecord, EncryptionConfig,
    KeyDeletionImpact, LedgerError, LedgerLimits, Timestamp,
};
use veilchain_coordinator::{
    IndexingCoordinator, RebuildHandler, RebuildRequest, ENCRYPTED_BLOCKS_CACHE_REBUILD,
    METADATA_INDEX_REBUILD,
};
use veilchain_crypto::{envelope, verify_signature, KdfCache, KeyPair};
use veilchain_index::MetadataIndex;
use veilchain_offchain::BlobStore;
use veilchain_storage::BlockDao;

use crate::cache::EncryptedBlocksCache;
use crate::canonical;
use crate::genesis;
use crate::validation::{structural_check, BlockValidation, ChainReport};

const VALIDATE_PAGE: usize = 256;

/// Append-time options. `Default` is a plaintext inline append with no
/// searchable metadata.
#[derive(Clone, Default)]
pub struct AppendOptions {
    /// Encrypt the block data (requires `password`).
    pub encrypt: bool,
    /// Password for encryption and/or private-layer indexing.
    pub password: Option<String>,
    pub category: Option<String>,
    pub manual_keywords: Vec<String>,
    pub content_category: Option<String>,
    pub recipient_username: Option<String>,
    /// Store this payload off-chain and reference it from the block.
    pub off_chain_payload: Option<Vec<u8>>,
}

/// The chain engine. One per process; construct with every collaborator it
/// needs — there is no lazily-initialized variant.
///
/// Locking: a readers-writer lock serializes the single logical writer
/// (append, key mutation, restore) against concurrent readers (validation,
/// lookups). std's RwLock makes no fairness guarantee; with one logical
/// writer that is acceptable.
pub struct ChainEngine {
    dao: Arc<dyn BlockDao>,
    blobs: Arc<BlobStore>,
    index: Arc<MetadataIndex>,
    coordinator: Arc<IndexingCoordinator>,
    kdf: Arc<KdfCache>,
    limits: LedgerLimits,
    crypto_config: EncryptionConfig,
    chain_lock: RwLock<()>,
    encrypted_cache: EncryptedBlocksCache,
}

impl ChainEngine {
    /// Build the engine, writing the genesis block if the store is empty.
    pub fn new(
        dao: Arc<dyn BlockDao>,
        blobs: Arc<BlobStore>,
        index: Arc<MetadataIndex>,
        coordinator: Arc<IndexingCoordinator>,
        kdf: Arc<KdfCache>,
        limits: LedgerLimits,
        crypto_config: EncryptionConfig,
    ) -> Result<Self, LedgerError> {
        crypto_config.validate()?;
        let engine = Self {
            dao,
            blobs,
            index,
            coordinator,
            kdf,
            limits,
            crypto_config,
            chain_lock: RwLock::new(()),
            encrypted_cache: EncryptedBlocksCache::new(),
        };
        if engine.dao.get_block_count()? == 0 {
            let block = genesis::build_genesis_block();
            engine.dao.put_block(&block)?;
            engine.index.update_public_for_block(&block)?;
            info!(hash = %block.hash, "genesis block written");
        }
        Ok(engine)
    }

    pub fn dao(&self) -> &Arc<dyn BlockDao> {
        &self.dao
    }

    pub fn blobs(&self) -> &Arc<BlobStore> {
        &self.blobs
    }

    pub fn index(&self) -> &Arc<MetadataIndex> {
        &self.index
    }

    pub fn limits(&self) -> &LedgerLimits {
        &self.limits
    }

    pub fn crypto_config(&self) -> &EncryptionConfig {
        &self.crypto_config
    }

    // ── Append ───────────────────────────────────────────────────────────────

    pub fn append(
        &self,
        data: &str,
        signer: &KeyPair,
        options: AppendOptions,
    ) -> Result<Block, LedgerError> {
        let _writer = self.chain_lock.write().expect("chain lock poisoned");

        // ── Input validation (before any crypto work) ─────────────────────────
        if data.is_empty() && options.off_chain_payload.is_none() {
            return Err(LedgerError::InvalidInput("block data must not be empty".into()));
        }
        if options.encrypt && options.password.is_none() {
            return Err(LedgerError::InvalidInput(
                "encryption requested without a password".into(),
            ));
        }
        if let Some(pw) = options.password.as_deref() {
            self.limits.check_password(pw)?;
        }
        if data.len() as u64 > self.limits.max_off_chain_bytes {
            return Err(LedgerError::CapacityExceeded(format!(
                "data of {} bytes exceeds the off-chain cap",
                data.len()
            )));
        }

        // ── Chain position and authorization ──────────────────────────────────
        let block_number = self.dao.next_block_number()?;
        let previous_hash = self
            .dao
            .get_last_block()?
            .map(|b| b.hash)
            .unwrap_or_else(|| veilchain_core::constants::GENESIS_PREVIOUS_HASH.to_string());
        let timestamp = truncate_to_micros(Utc::now());
        let signer_public_key = signer.public_key_pem().to_string();

        if !self.is_authorized_at(&signer_public_key, &timestamp, block_number)? {
            return Err(LedgerError::Unauthorized(format!(
                "signer is not an authorized key at {}",
                veilchain_core::canonical_timestamp(&timestamp)
            )));
        }

        // ── Payload routing: envelope inline, or off-chain ────────────────────
        let blob_password = if options.encrypt { options.password.as_deref() } else { None };
        let projected_inline = if options.encrypt {
            envelope::projected_envelope_len(data.len())
        } else {
            data.len()
        };

        let mut data_field = data.to_string();
        let mut inline_is_descriptor = false;
        let mut is_encrypted = false;
        let mut encryption_metadata = None;
        let mut off_chain_ref = None;

        if let Some(payload) = options.off_chain_payload.as_deref() {
            let r = self.blobs.store(payload, blob_password, signer)?;
            if data_field.is_empty() {
                data_field = format!("[OFF-CHAIN] sha256:{} size:{}", r.sha256, r.size);
                inline_is_descriptor = true;
            }
            off_chain_ref = Some(r);
        } else if projected_inline > self.limits.inline_data_cap {
            // Oversized data moves off-chain. Encryption (when asked for)
            // happens in the blob layer, so the inline descriptor is
            // plaintext and the block's own data field is not enveloped.
            let r = self.blobs.store(data.as_bytes(), blob_password, signer)?;
            data_field = format!("[OFF-CHAIN] sha256:{} size:{}", r.sha256, r.size);
            inline_is_descriptor = true;
            off_chain_ref = Some(r);
        }

        // An explicit off-chain payload can still carry an encrypted inline
        // annotation; a generated descriptor stays plaintext.
        if options.encrypt && !inline_is_descriptor {
            let password = options.password.as_deref().expect("checked above");
            let (sealed, metadata) = envelope::seal_block_data(
                &data_field,
                password,
                block_number,
                &signer_public_key,
                &self.crypto_config,
                &self.kdf,
            )?;
            data_field = sealed;
            encryption_metadata = Some(metadata);
            is_encrypted = true;
        }

        // ── Hash and sign ─────────────────────────────────────────────────────
        let content = if is_encrypted {
            canonical::encrypted_content(
                block_number,
                &previous_hash,
                &timestamp,
                &data_field,
                &signer_public_key,
            )
        } else {
            canonical::plain_content(
                block_number,
                &previous_hash,
                &timestamp,
                &data_field,
                &signer_public_key,
            )
        };
        let hash = veilchain_crypto::sha256_hex(content.as_bytes());
        let signature = signer.sign(hash.as_bytes());

        let block = Block {
            block_number,
            previous_hash,
            timestamp,
            data: data_field,
            signer_public_key,
            signature,
            hash,
            is_encrypted,
            encryption_metadata,
            category: options.category.clone(),
            manual_keywords: options.manual_keywords.clone(),
            content_category: options.content_category.clone(),
            recipient_username: options.recipient_username.clone(),
            off_chain_ref,
        };

        // ── Persist; orphan the blob if the store refuses the block ───────────
        if let Err(e) = self.dao.put_block(&block) {
            if let Some(r) = &block.off_chain_ref {
                if let Err(gc) = self.blobs.mark_orphan(&r.file_id) {
                    warn!(file_id = %r.file_id, error = %gc, "failed to mark orphaned blob");
                }
            }
            return Err(e);
        }

        // ── Caches and indexes ────────────────────────────────────────────────
        self.encrypted_cache.invalidate();
        let plaintext = if block.is_encrypted { Some(data) } else { None };
        if let Err(e) = self
            .index
            .update_for_block(&block, plaintext, options.password.as_deref())
        {
            // The index is derived state; a failed update degrades search
            // until the next rebuild but never loses the block.
            warn!(block_number, error = %e, "incremental index update failed");
        }
        self.schedule_incremental_index(block_number);

        info!(block_number, encrypted = block.is_encrypted, "appended block");
        Ok(block)
    }

    /// Route the incremental index update through the coordinator when a
    /// runtime is present. The synchronous update above already ran, and
    /// posting-list updates are idempotent, so this is belt and braces for
    /// hosts that rely on the coordinated path.
    fn schedule_incremental_index(&self, block_number: u64) {
        if tokio::runtime::Handle::try_current().is_err() {
            return;
        }
        let mut request = RebuildRequest::new(METADATA_INDEX_REBUILD);
        request.blocks = Some(vec![block_number]);
        request.can_wait = true;
        request.force = true;

        let index = self.index.clone();
        let fallback: RebuildHandler = Arc::new(move |ctx| {
            let index = index.clone();
            Box::pin(async move {
                let blocks = ctx.blocks.unwrap_or_default();
                tokio::task::spawn_blocking(move || {
                    let fetched = index
                        .dao()
                        .batch_retrieve_blocks(&blocks)
                        .map_err(|e| e.to_string())?;
                    for block in &fetched {
                        index.update_public_for_block(block).map_err(|e| e.to_string())?;
                    }
                    Ok(format!("indexed {} blocks", fetched.len()))
                })
                .await
                .map_err(|e| format!("index task failed: {e}"))?
            })
        });
        // Fire and forget; the ticket resolves in the background.
        let _ = self.coordinator.coordinate_with_fallback(request, fallback);
    }

    // ── Authorization ────────────────────────────────────────────────────────

    fn is_authorized_at(
        &self,
        public_key_pem: &str,
        ts: &Timestamp,
        block_number: u64,
    ) -> Result<bool, LedgerError> {
        if block_number == 0 && public_key_pem == genesis::bootstrap_public_key_pem() {
            return Ok(true);
        }
        Ok(self
            .dao
            .get_authorized_key(public_key_pem)?
            .is_some_and(|k| k.was_authorized_at(ts)))
    }

    /// Admit a key. Returns `false` when the key is already present and
    /// active. A previously hard-deleted key can never come back.
    pub fn add_authorized_key(&self, public_key_pem: &str, owner_name: &str) -> Result<bool, LedgerError> {
        let _writer = self.chain_lock.write().expect("chain lock poisoned");
        if public_key_pem.trim().is_empty() || owner_name.trim().is_empty() {
            return Err(LedgerError::InvalidInput(
                "public key and owner name must not be empty".into(),
            ));
        }
        if let Some(tombstone) = self.dao.get_deleted_key_record(public_key_pem)? {
            return Err(LedgerError::InvalidInput(format!(
                "key was hard-deleted at {} and cannot be re-admitted",
                veilchain_core::canonical_timestamp(&tombstone.deleted_at)
            )));
        }
        if let Some(existing) = self.dao.get_authorized_key(public_key_pem)? {
            if existing.is_active() {
                return Ok(false);
            }
            return Err(LedgerError::InvalidInput(
                "key was revoked; admit a fresh key instead of reviving it".into(),
            ));
        }
        let key = AuthorizedKey::new(
            public_key_pem.to_string(),
            owner_name.to_string(),
            truncate_to_micros(Utc::now()),
        );
        self.dao.put_authorized_key(&key)?;
        info!(owner = owner_name, "authorized key added");
        Ok(true)
    }

    /// Soft-revoke: the key stops signing from now on, but every block it
    /// signed while live stays valid.
    pub fn revoke_authorized_key(&self, public_key_pem: &str) -> Result<bool, LedgerError> {
        let _writer = self.chain_lock.write().expect("chain lock poisoned");
        let Some(mut key) = self.dao.get_authorized_key(public_key_pem)? else {
            return Ok(false);
        };
        if !key.is_active() {
            return Ok(false);
        }
        key.revoked_at = Some(truncate_to_micros(Utc::now()));
        self.dao.put_authorized_key(&key)?;
        info!(owner = %key.owner_name, "authorized key revoked");
        Ok(true)
    }

    /// Impact analysis for a candidate hard deletion.
    pub fn can_delete_authorized_key(
        &self,
        public_key_pem: &str,
    ) -> Result<KeyDeletionImpact, LedgerError> {
        let _reader = self.chain_lock.read().expect("chain lock poisoned");
        if self.dao.get_authorized_key(public_key_pem)?.is_none() {
            return Err(LedgerError::NotFound("no such authorized key".into()));
        }
        let affected = self.dao.count_blocks_signed_by(public_key_pem)?;
        Ok(KeyDeletionImpact::new(affected))
    }

    /// Hard deletion. Orphans every block the key signed, so a severe
    /// deletion demands `force` and a written reason.
    pub fn delete_authorized_key(
        &self,
        public_key_pem: &str,
        force: bool,
        reason: &str,
    ) -> Result<bool, LedgerError> {
        let impact = self.can_delete_authorized_key(public_key_pem)?;
        let _writer = self.chain_lock.write().expect("chain lock poisoned");

        if impact.severe && !force {
            return Err(LedgerError::InvalidInput(format!(
                "deleting this key orphans {} blocks; pass force with a reason to proceed",
                impact.affected_blocks
            )));
        }
        if force && reason.trim().is_empty() {
            return Err(LedgerError::InvalidInput(
                "forced key deletion requires a reason".into(),
            ));
        }

        let Some(key) = self.dao.get_authorized_key(public_key_pem)? else {
            return Ok(false);
        };
        self.dao.remove_authorized_key(public_key_pem)?;
        self.dao.put_deleted_key_record(&DeletedKeyRecord {
            public_key: key.public_key.clone(),
            owner_name: key.owner_name.clone(),
            deleted_at: truncate_to_micros(Utc::now()),
            reason: reason.to_string(),
            affected_blocks: impact.affected_blocks,
        })?;
        warn!(
            owner = %key.owner_name,
            affected_blocks = impact.affected_blocks,
            forced = force,
            reason,
            "authorized key hard-deleted"
        );
        Ok(true)
    }

    pub fn list_authorized_keys(&self) -> Result<Vec<AuthorizedKey>, LedgerError> {
        let _reader = self.chain_lock.read().expect("chain lock poisoned");
        self.dao.list_authorized_keys()
    }

    // ── Validation ───────────────────────────────────────────────────────────

    /// Validate one block (structural, cryptographic, authorization and
    /// off-chain aspects, independently flagged).
    pub fn validate_block(&self, block_number: u64) -> Result<BlockValidation, LedgerError> {
        let _reader = self.chain_lock.read().expect("chain lock poisoned");
        let block = self
            .dao
            .get_block(block_number)?
            .ok_or_else(|| LedgerError::NotFound(format!("block {block_number}")))?;
        let prev = if block_number > 0 {
            self.dao.get_block(block_number - 1)?
        } else {
            None
        };
        Ok(self.validate_block_record(&block, prev.as_ref()))
    }

    /// Validation core shared by [`validate_block`](Self::validate_block)
    /// and [`validate_chain`](Self::validate_chain).
    pub fn validate_block_record(&self, block: &Block, prev: Option<&Block>) -> BlockValidation {
        let (structural_ok, mut detail) = structural_check(block, prev);

        // Hash recomputation picks the builder from is_encrypted; see the
        // canonical module for why mixing the builders must never happen.
        let hash_ok = structural_ok && canonical::hash_for_block(block) == block.hash;
        if structural_ok && !hash_ok && detail.is_none() {
            detail = Some("stored hash does not match canonical content".into());
        }

        let signature_ok =
            verify_signature(&block.signer_public_key, block.hash.as_bytes(), &block.signature)
                .is_ok();

        let authorization_ok = self
            .is_authorized_at(&block.signer_public_key, &block.timestamp, block.block_number)
            .unwrap_or(false);

        let off_chain_ok = match &block.off_chain_ref {
            None => true,
            Some(r) => {
                let v = self.blobs.verify(r, &block.signer_public_key);
                if !v.is_ok() && detail.is_none() {
                    detail = Some(format!("off-chain blob {}: {v:?}", r.file_id));
                }
                v.is_ok()
            }
        };

        BlockValidation {
            block_number: block.block_number,
            structural_ok,
            hash_ok,
            signature_ok,
            authorization_ok,
            off_chain_ok,
            detail,
        }
    }

    /// Validate the whole chain, paginated. A bad block is reported and
    /// validation continues with the rest.
    pub fn validate_chain(&self) -> Result<ChainReport, LedgerError> {
        let _reader = self.chain_lock.read().expect("chain lock poisoned");
        let mut report = ChainReport::default();
        let mut prev: Option<Block> = None;
        let mut offset = 0u64;
        loop {
            let page = self.dao.get_blocks_paginated(offset, VALIDATE_PAGE)?;
            if page.is_empty() {
                break;
            }
            offset += page.len() as u64;
            for block in page {
                report
                    .results
                    .push(self.validate_block_record(&block, prev.as_ref()));
                prev = Some(block);
            }
        }
        Ok(report)
    }

    // ── Reads ────────────────────────────────────────────────────────────────

    pub fn get_block(&self, block_number: u64) -> Result<Option<Block>, LedgerError> {
        let _reader = self.chain_lock.read().expect("chain lock poisoned");
        self.dao.get_block(block_number)
    }

    pub fn get_block_by_hash(&self, hash: &str) -> Result<Option<Block>, LedgerError> {
        let _reader = self.chain_lock.read().expect("chain lock poisoned");
        self.dao.get_block_by_hash(hash)
    }

    pub fn block_count(&self) -> Result<u64, LedgerError> {
        let _reader = self.chain_lock.read().expect("chain lock poisoned");
        self.dao.get_block_count()
    }

    /// Ascending list of encrypted block numbers, served from the cache.
    pub fn encrypted_block_numbers(&self) -> Result<Arc<Vec<u64>>, LedgerError> {
        let _reader = self.chain_lock.read().expect("chain lock poisoned");
        self.encrypted_cache.get(self.dao.as_ref())
    }

    /// Decrypt an encrypted block's data with the given password.
    pub fn open_block_data(&self, block: &Block, password: &str) -> Result<String, LedgerError> {
        if !block.is_encrypted {
            return Ok(block.data.clone());
        }
        let metadata = block.encryption_metadata.as_deref().ok_or_else(|| {
            LedgerError::InvalidInput("encrypted block carries no metadata".into())
        })?;
        envelope::open_block_data(
            &block.data,
            metadata,
            password,
            block.block_number,
            &block.signer_public_key,
            &self.crypto_config,
            &self.kdf,
        )
        .map_err(LedgerError::from)
    }

    /// Best-effort decryption for content scans; `None` when the password
    /// does not open the block.
    pub fn try_open_block_data(&self, block: &Block, password: &str) -> Option<String> {
        envelope::try_open_block_data(
            &block.data,
            block.encryption_metadata.as_deref(),
            password,
            block.block_number,
            &block.signer_public_key,
            &self.crypto_config,
            &self.kdf,
        )
    }

    // ── Restore support ──────────────────────────────────────────────────────

    /// Truncate the chain back to `last_block_number` (checkpoint restore).
    /// Invalidates every cache and forces a full public index rebuild.
    pub fn restore_truncate(&self, last_block_number: u64) -> Result<u64, LedgerError> {
        let _writer = self.chain_lock.write().expect("chain lock poisoned");
        let removed = self.dao.delete_blocks_after(last_block_number)?;
        self.encrypted_cache.invalidate();
        self.kdf.clear();
        self.index.rebuild_public(true, &CancelToken::new())?;
        self.request_cache_rebuild();
        info!(last_block_number, removed, "chain truncated to checkpoint");
        Ok(removed)
    }

    fn request_cache_rebuild(&self) {
        if tokio::runtime::Handle::try_current().is_err() {
            return;
        }
        let mut request = RebuildRequest::new(ENCRYPTED_BLOCKS_CACHE_REBUILD);
        request.force = true;
        let _ = self.coordinator.coordinate(request);
    }

    /// Register the engine-owned rebuild operation with the coordinator.
    pub fn register_rebuild_handlers(self: &Arc<Self>) {
        let engine = self.clone();
        let handler: RebuildHandler = Arc::new(move |_ctx| {
            let engine = engine.clone();
            Box::pin(async move {
                tokio::task::spawn_blocking(move || {
                    engine.encrypted_cache.invalidate();
                    let list = engine
                        .encrypted_cache
                        .get(engine.dao.as_ref())
                        .map_err(|e| e.to_string())?;
                    Ok(format!("encrypted-blocks cache rebuilt: {} entries", list.len()))
                })
                .await
                .map_err(|e| format!("cache rebuild task failed: {e}"))?
            })
        });
        self.coordinator.register(ENCRYPTED_BLOCKS_CACHE_REBUILD, handler);
    }
}
