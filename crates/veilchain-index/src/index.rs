use std::collections::BTreeSet;
use std::path::Path;
use std::sync::Arc;

use hmac::{Hmac, Mac};
use sha2::Sha256;
use tracing::{debug, info, warn};
use zeroize::Zeroizing;

use veilchain_core::constants::AEAD_IV_LEN;
use veilchain_core::{Block, CancelToken, EncryptionConfig, KeyLength, LedgerError};
use veilchain_coordinator::{
    IndexingCoordinator, RebuildHandler, METADATA_INDEX_REBUILD, RECIPIENT_INDEX_REBUILD,
};
use veilchain_crypto::{aead, envelope, KdfCache};
use veilchain_storage::BlockDao;

use crate::tokenize::{normalize_term, tokenize};

type HmacSha256 = Hmac<Sha256>;

/// Salt for the private-layer master key. Fixed so fingerprints computed
/// in different processes agree for the same password.
const INDEX_KDF_SALT: &[u8] = b"veilchain-private-index-v1";

const WATERMARK_KEY: &[u8] = b"public_watermark";

/// Page size for paginated rebuilds; cancellation is observed between pages.
const REBUILD_PAGE: usize = 256;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RebuildStats {
    pub blocks_scanned: u64,
    pub entries_written: u64,
}

/// The two-layer metadata index. See the crate docs for the layout.
pub struct MetadataIndex {
    _db: sled::Db,
    public: sled::Tree,
    private: sled::Tree,
    recipients: sled::Tree,
    meta: sled::Tree,
    dao: Arc<dyn BlockDao>,
    config: EncryptionConfig,
    kdf: Arc<KdfCache>,
}

fn store_err(e: impl std::fmt::Display) -> LedgerError {
    LedgerError::StoreFailed(e.to_string())
}

fn ser_err(e: impl std::fmt::Display) -> LedgerError {
    LedgerError::Serialization(e.to_string())
}

impl MetadataIndex {
    pub fn open<P: AsRef<Path>>(
        path: P,
        dao: Arc<dyn BlockDao>,
        config: EncryptionConfig,
        kdf: Arc<KdfCache>,
    ) -> Result<Self, LedgerError> {
        config.validate()?;
        let db = sled::open(path).map_err(store_err)?;
        let public = db.open_tree("public_terms").map_err(store_err)?;
        let private = db.open_tree("private_terms").map_err(store_err)?;
        let recipients = db.open_tree("recipients").map_err(store_err)?;
        let meta = db.open_tree("meta").map_err(store_err)?;
        Ok(Self {
            _db: db,
            public,
            private,
            recipients,
            meta,
            dao,
            config,
            kdf,
        })
    }

    pub fn dao(&self) -> &Arc<dyn BlockDao> {
        &self.dao
    }

    // ── Token derivation ─────────────────────────────────────────────────────

    fn public_terms_for_block(block: &Block) -> BTreeSet<String> {
        let mut terms = BTreeSet::new();
        if let Some(cat) = block.category.as_deref().and_then(normalize_term) {
            terms.insert(cat);
        }
        if let Some(cat) = block.content_category.as_deref().and_then(normalize_term) {
            terms.insert(cat);
        }
        for kw in &block.manual_keywords {
            if let Some(t) = normalize_term(kw) {
                terms.insert(t);
            }
        }
        // Day-granularity timestamp bucket, e.g. "2026-08-01".
        terms.insert(block.timestamp.format("%Y-%m-%d").to_string());
        terms
    }

    // ── Incremental updates (called during append) ───────────────────────────

    /// Index the public metadata and recipient of one block. Idempotent.
    pub fn update_public_for_block(&self, block: &Block) -> Result<(), LedgerError> {
        for term in Self::public_terms_for_block(block) {
            upsert_posting(&self.public, term.as_bytes(), block.block_number)?;
        }
        if let Some(recipient) = block.recipient_username.as_deref().and_then(normalize_term) {
            upsert_posting(&self.recipients, recipient.as_bytes(), block.block_number)?;
        }
        self.bump_watermark(block.block_number + 1)?;
        Ok(())
    }

    /// Index one block across both layers. `plaintext` is the transient
    /// cleartext available while the writer still holds it; for encrypted
    /// blocks this is the only moment the private layer can see it.
    pub fn update_for_block(
        &self,
        block: &Block,
        plaintext: Option<&str>,
        password: Option<&str>,
    ) -> Result<(), LedgerError> {
        self.update_public_for_block(block)?;

        if let Some(password) = password {
            let text = match plaintext {
                Some(t) => Some(t),
                None if !block.is_encrypted => Some(block.data.as_str()),
                None => None,
            };
            if let Some(text) = text {
                self.insert_private_terms(password, text, block)?;
            }
        }
        Ok(())
    }

    fn insert_private_terms(
        &self,
        password: &str,
        text: &str,
        block: &Block,
    ) -> Result<(), LedgerError> {
        let master = self.master_key(password);
        let enc_key = subkey(&master, b"enc-key");
        let mut terms = tokenize(text);
        if let Some(recipient) = block.recipient_username.as_deref().and_then(normalize_term) {
            terms.insert(format!("recipient:{recipient}"));
        }
        for term in terms {
            let fp = fingerprint(&master, &term);
            self.upsert_private_posting(&enc_key, &fp, block.block_number)?;
        }
        debug!(block_number = block.block_number, "private index updated");
        Ok(())
    }

    // ── Lookups ──────────────────────────────────────────────────────────────

    /// Union of public posting lists for the given terms.
    pub fn lookup_public(&self, terms: &[String]) -> Result<BTreeSet<u64>, LedgerError> {
        let mut out = BTreeSet::new();
        for term in terms {
            let Some(term) = normalize_term(term) else { continue };
            if let Some(bytes) = self.public.get(term.as_bytes()).map_err(store_err)? {
                let list: Vec<u64> = bincode::deserialize(&bytes).map_err(ser_err)?;
                out.extend(list);
            }
        }
        Ok(out)
    }

    /// Union of private posting lists. Fingerprints are computed here from
    /// the password; the stored terms never appear in plaintext.
    pub fn lookup_private(
        &self,
        terms: &[String],
        password: &str,
    ) -> Result<BTreeSet<u64>, LedgerError> {
        let master = self.master_key(password);
        let enc_key = subkey(&master, b"enc-key");
        let mut out = BTreeSet::new();
        for term in terms {
            let Some(term) = normalize_term(term) else { continue };
            let fp = fingerprint(&master, &term);
            if let Some(stored) = self.private.get(fp).map_err(store_err)? {
                out.extend(self.open_posting(&enc_key, &fp, &stored)?);
            }
        }
        Ok(out)
    }

    /// Blocks addressed to `recipient`. Callers gate this behind an
    /// authenticated query.
    pub fn lookup_recipient(&self, recipient: &str) -> Result<BTreeSet<u64>, LedgerError> {
        let Some(recipient) = normalize_term(recipient) else {
            return Ok(BTreeSet::new());
        };
        match self.recipients.get(recipient.as_bytes()).map_err(store_err)? {
            Some(bytes) => {
                let list: Vec<u64> = bincode::deserialize(&bytes).map_err(ser_err)?;
                Ok(list.into_iter().collect())
            }
            None => Ok(BTreeSet::new()),
        }
    }

    // ── Rebuilds ─────────────────────────────────────────────────────────────

    /// Paginated rebuild of the public layer (and recipients). Incremental
    /// from the watermark unless `force_full`; a watermark past the chain
    /// head (after a restore truncated the chain) forces a full pass.
    pub fn rebuild_public(
        &self,
        force_full: bool,
        cancel: &CancelToken,
    ) -> Result<RebuildStats, LedgerError> {
        let chain_len = self.dao.get_block_count()?;
        let mut start = self.watermark()?;
        if force_full || start > chain_len {
            self.public.clear().map_err(store_err)?;
            self.recipients.clear().map_err(store_err)?;
            self.set_watermark(0)?;
            start = 0;
        }

        let mut stats = RebuildStats::default();
        let mut offset = start;
        loop {
            if cancel.is_cancelled() {
                return Err(LedgerError::Cancelled);
            }
            let page = self.dao.get_blocks_paginated(offset, REBUILD_PAGE)?;
            if page.is_empty() {
                break;
            }
            for block in &page {
                self.update_public_for_block(block)?;
                stats.blocks_scanned += 1;
                stats.entries_written += Self::public_terms_for_block(block).len() as u64;
            }
            offset += page.len() as u64;
            self.set_watermark(offset)?;
        }
        info!(
            blocks = stats.blocks_scanned,
            from = start,
            "public metadata index rebuilt"
        );
        Ok(stats)
    }

    /// Full rebuild of the recipient index.
    pub fn rebuild_recipients(&self, cancel: &CancelToken) -> Result<RebuildStats, LedgerError> {
        self.recipients.clear().map_err(store_err)?;
        let mut stats = RebuildStats::default();
        let mut offset = 0u64;
        loop {
            if cancel.is_cancelled() {
                return Err(LedgerError::Cancelled);
            }
            let page = self.dao.get_blocks_paginated(offset, REBUILD_PAGE)?;
            if page.is_empty() {
                break;
            }
            for block in &page {
                stats.blocks_scanned += 1;
                if let Some(r) = block.recipient_username.as_deref().and_then(normalize_term) {
                    upsert_posting(&self.recipients, r.as_bytes(), block.block_number)?;
                    stats.entries_written += 1;
                }
            }
            offset += page.len() as u64;
        }
        info!(blocks = stats.blocks_scanned, "recipient index rebuilt");
        Ok(stats)
    }

    /// Rebuild the private layer for one password by re-deriving plaintext
    /// from each encrypted block's envelope. Blocks the password does not
    /// open are skipped.
    pub fn rebuild_private(
        &self,
        password: &str,
        cancel: &CancelToken,
    ) -> Result<RebuildStats, LedgerError> {
        let mut stats = RebuildStats::default();
        let mut offset = 0u64;
        loop {
            if cancel.is_cancelled() {
                return Err(LedgerError::Cancelled);
            }
            let page = self.dao.get_encrypted_blocks_paginated(offset, REBUILD_PAGE)?;
            if page.is_empty() {
                break;
            }
            for block in &page {
                stats.blocks_scanned += 1;
                let opened = envelope::try_open_block_data(
                    &block.data,
                    block.encryption_metadata.as_deref(),
                    password,
                    block.block_number,
                    &block.signer_public_key,
                    &self.config,
                    &self.kdf,
                );
                match opened {
                    Some(plaintext) => {
                        self.insert_private_terms(password, &plaintext, block)?;
                        stats.entries_written += 1;
                    }
                    None => {
                        warn!(
                            block_number = block.block_number,
                            "private rebuild: password does not open block; skipped"
                        );
                    }
                }
            }
            offset += page.len() as u64;
        }
        info!(
            blocks = stats.blocks_scanned,
            indexed = stats.entries_written,
            "private index rebuilt"
        );
        Ok(stats)
    }

    // ── Private-layer crypto ─────────────────────────────────────────────────

    fn master_key(&self, password: &str) -> Zeroizing<Vec<u8>> {
        self.kdf
            .derive(password, INDEX_KDF_SALT, self.config.pbkdf2_iterations, 32)
    }

    fn upsert_private_posting(
        &self,
        enc_key: &[u8],
        fp: &[u8; 32],
        block_number: u64,
    ) -> Result<(), LedgerError> {
        let mut list = match self.private.get(fp).map_err(store_err)? {
            Some(stored) => self.open_posting(enc_key, fp, &stored)?,
            None => Vec::new(),
        };
        match list.binary_search(&block_number) {
            Ok(_) => return Ok(()),
            Err(pos) => list.insert(pos, block_number),
        }

        let plain = bincode::serialize(&list).map_err(ser_err)?;
        let iv = aead::random_iv();
        let ct = aead::seal(enc_key, KeyLength::Aes256, &iv, &plain, fp)
            .map_err(LedgerError::from)?;
        let mut stored = Vec::with_capacity(AEAD_IV_LEN + ct.len());
        stored.extend_from_slice(&iv);
        stored.extend_from_slice(&ct);
        self.private.insert(fp, stored).map_err(store_err)?;
        Ok(())
    }

    fn open_posting(
        &self,
        enc_key: &[u8],
        fp: &[u8; 32],
        stored: &[u8],
    ) -> Result<Vec<u64>, LedgerError> {
        let (iv, body) = aead::split_iv(stored).map_err(LedgerError::from)?;
        let plain = aead::open(enc_key, KeyLength::Aes256, &iv, body, fp)
            .map_err(LedgerError::from)?;
        bincode::deserialize(&plain).map_err(ser_err)
    }

    // ── Watermark ────────────────────────────────────────────────────────────

    fn watermark(&self) -> Result<u64, LedgerError> {
        Ok(self
            .meta
            .get(WATERMARK_KEY)
            .map_err(store_err)?
            .map(|v| {
                let mut arr = [0u8; 8];
                arr.copy_from_slice(&v[..8]);
                u64::from_be_bytes(arr)
            })
            .unwrap_or(0))
    }

    fn set_watermark(&self, value: u64) -> Result<(), LedgerError> {
        self.meta
            .insert(WATERMARK_KEY, value.to_be_bytes().to_vec())
            .map_err(store_err)?;
        Ok(())
    }

    fn bump_watermark(&self, candidate: u64) -> Result<(), LedgerError> {
        if candidate > self.watermark()? {
            self.set_watermark(candidate)?;
        }
        Ok(())
    }
}

fn subkey(master: &[u8], label: &[u8]) -> Zeroizing<Vec<u8>> {
    let mut mac = HmacSha256::new_from_slice(master).expect("HMAC accepts any key length");
    mac.update(label);
    Zeroizing::new(mac.finalize().into_bytes().to_vec())
}

fn fingerprint(master: &[u8], term: &str) -> [u8; 32] {
    let mut mac = HmacSha256::new_from_slice(master).expect("HMAC accepts any key length");
    mac.update(b"term:");
    mac.update(term.as_bytes());
    mac.finalize().into_bytes().into()
}

fn upsert_posting(tree: &sled::Tree, key: &[u8], block_number: u64) -> Result<(), LedgerError> {
    let mut list: Vec<u64> = match tree.get(key).map_err(store_err)? {
        Some(bytes) => bincode::deserialize(&bytes).map_err(ser_err)?,
        None => Vec::new(),
    };
    match list.binary_search(&block_number) {
        Ok(_) => return Ok(()),
        Err(pos) => list.insert(pos, block_number),
    }
    tree.insert(key, bincode::serialize(&list).map_err(ser_err)?)
        .map_err(store_err)?;
    Ok(())
}

/// Wire the stock rebuild operations into a coordinator. Consumers call
/// this once at startup, after both services exist.
pub fn register_rebuild_handlers(
    index: &Arc<MetadataIndex>,
    coordinator: &IndexingCoordinator,
) {
    let metadata_index = index.clone();
    let metadata_handler: RebuildHandler = Arc::new(move |ctx| {
        let index = metadata_index.clone();
        Box::pin(async move {
            tokio::task::spawn_blocking(move || match ctx.blocks {
                Some(blocks) => {
                    // One batch query regardless of how many blocks arrived.
                    let fetched = index
                        .dao
                        .batch_retrieve_blocks(&blocks)
                        .map_err(|e| e.to_string())?;
                    for block in &fetched {
                        index.update_public_for_block(block).map_err(|e| e.to_string())?;
                    }
                    Ok(format!("indexed {} blocks incrementally", fetched.len()))
                }
                None => {
                    let stats = index
                        .rebuild_public(ctx.force_rebuild, &CancelToken::new())
                        .map_err(|e| e.to_string())?;
                    Ok(format!("rebuilt public index over {} blocks", stats.blocks_scanned))
                }
            })
            .await
            .map_err(|e| format!("rebuild task failed: {e}"))?
        })
    });
    coordinator.register(METADATA_INDEX_REBUILD, metadata_handler);

    let recipient_index = index.clone();
    let recipient_handler: RebuildHandler = Arc::new(move |_ctx| {
        let index = recipient_index.clone();
        Box::pin(async move {
            tokio::task::spawn_blocking(move || {
                let stats = index
                    .rebuild_recipients(&CancelToken::new())
                    .map_err(|e| e.to_string())?;
                Ok(format!(
                    "rebuilt recipient index: {} entries over {} blocks",
                    stats.entries_written, stats.blocks_scanned
                ))
            })
            .await
            .map_err(|e| format!("rebuild task failed: {e}"))?
        })
    });
    coordinator.register(RECIPIENT_INDEX_REBUILD, recipient_handler);
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use veilchain_core::truncate_to_micros;
    use veilchain_storage::MemoryDao;

    fn fast_config() -> EncryptionConfig {
        EncryptionConfig {
            pbkdf2_iterations: 10_000,
            ..EncryptionConfig::default()
        }
    }

    fn block(n: u64, category: Option<&str>, keywords: &[&str], recipient: Option<&str>) -> Block {
        Block {
            block_number: n,
            previous_hash: "p".into(),
            timestamp: truncate_to_micros(Utc.with_ymd_and_hms(2026, 8, 1, 10, 0, 0).unwrap()),
            data: format!("payload {n}"),
            signer_public_key: "PEM".into(),
            signature: "sig".into(),
            hash: format!("{n:064x}"),
            is_encrypted: false,
            encryption_metadata: None,
            category: category.map(str::to_string),
            manual_keywords: keywords.iter().map(|s| s.to_string()).collect(),
            content_category: None,
            recipient_username: recipient.map(str::to_string),
            off_chain_ref: None,
        }
    }

    fn index_with_dao() -> (tempfile::TempDir, Arc<MemoryDao>, MetadataIndex) {
        let dir = tempfile::tempdir().unwrap();
        let dao = Arc::new(MemoryDao::new());
        let index = MetadataIndex::open(
            dir.path().join("index"),
            dao.clone(),
            fast_config(),
            Arc::new(KdfCache::default()),
        )
        .unwrap();
        (dir, dao, index)
    }

    #[test]
    fn public_lookup_by_category_keyword_and_date() {
        let (_dir, _dao, index) = index_with_dao();
        index
            .update_public_for_block(&block(1, Some("finance"), &["report", "q3"], None))
            .unwrap();
        index
            .update_public_for_block(&block(2, Some("finance"), &[], None))
            .unwrap();

        let by_cat = index.lookup_public(&["finance".into()]).unwrap();
        assert_eq!(by_cat.into_iter().collect::<Vec<_>>(), vec![1, 2]);

        let by_kw = index.lookup_public(&["REPORT".into()]).unwrap();
        assert_eq!(by_kw.into_iter().collect::<Vec<_>>(), vec![1]);

        let by_day = index.lookup_public(&["2026-08-01".into()]).unwrap();
        assert_eq!(by_day.len(), 2);

        assert!(index.lookup_public(&["absent".into()]).unwrap().is_empty());
    }

    #[test]
    fn private_terms_need_the_password() {
        let (_dir, _dao, index) = index_with_dao();
        let b = block(3, None, &[], None);
        index
            .update_for_block(&b, Some("the launch codes are 00000000"), Some("CorrectHorse9!"))
            .unwrap();

        let hit = index
            .lookup_private(&["launch".into()], "CorrectHorse9!")
            .unwrap();
        assert_eq!(hit.into_iter().collect::<Vec<_>>(), vec![3]);

        let miss = index
            .lookup_private(&["launch".into()], "WrongHorse9!!")
            .unwrap();
        assert!(miss.is_empty());

        // Nothing in the private tree resembles the term.
        for item in index.private.iter() {
            let (key, value) = item.unwrap();
            assert!(!key.windows(6).any(|w| w == b"launch"));
            assert!(!value.windows(6).any(|w| w == b"launch"));
        }
    }

    #[test]
    fn recipient_lookup() {
        let (_dir, _dao, index) = index_with_dao();
        index
            .update_public_for_block(&block(1, None, &[], Some("Bob")))
            .unwrap();
        index
            .update_public_for_block(&block(2, None, &[], Some("bob")))
            .unwrap();
        let hits = index.lookup_recipient("BOB").unwrap();
        assert_eq!(hits.into_iter().collect::<Vec<_>>(), vec![1, 2]);
    }

    #[test]
    fn paginated_rebuild_reindexes_everything() {
        let (_dir, dao, index) = index_with_dao();
        for n in 0..600u64 {
            let cat = if n % 2 == 0 { Some("even") } else { Some("odd") };
            dao.put_block(&block(n, cat, &[], None)).unwrap();
        }
        let stats = index.rebuild_public(true, &CancelToken::new()).unwrap();
        assert_eq!(stats.blocks_scanned, 600);
        assert_eq!(index.lookup_public(&["even".into()]).unwrap().len(), 300);

        // Incremental pass from the watermark scans nothing new.
        let again = index.rebuild_public(false, &CancelToken::new()).unwrap();
        assert_eq!(again.blocks_scanned, 0);
    }

    #[test]
    fn rebuild_observes_cancellation() {
        let (_dir, dao, index) = index_with_dao();
        for n in 0..600u64 {
            dao.put_block(&block(n, Some("cat"), &[], None)).unwrap();
        }
        let token = CancelToken::new();
        token.cancel();
        assert!(matches!(
            index.rebuild_public(true, &token),
            Err(LedgerError::Cancelled)
        ));
    }

    #[test]
    fn incremental_update_is_idempotent() {
        let (_dir, _dao, index) = index_with_dao();
        let b = block(5, Some("dup"), &[], None);
        index.update_public_for_block(&b).unwrap();
        index.update_public_for_block(&b).unwrap();
        assert_eq!(index.lookup_public(&["dup".into()]).unwrap().len(), 1);
    }
}
