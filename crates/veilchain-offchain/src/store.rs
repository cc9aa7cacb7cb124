use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use tracing::{info, warn};

use veilchain_core::{EncryptionConfig, LedgerError, LedgerLimits, OffChainRef};
use veilchain_crypto::{aead, sha256_hex, verify_signature, KdfCache, KeyPair};

/// Associated data binding off-chain ciphertexts to this store's domain.
const OFFCHAIN_AAD: &[u8] = b"veilchain-offchain-v1";

/// Outcome of a standalone blob verification. All failure modes are
/// reported independently so integrity sweeps can distinguish a missing
/// file from a corrupted one.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct BlobVerification {
    pub file_missing: bool,
    pub size_mismatch: bool,
    pub hash_mismatch: bool,
    pub signature_invalid: bool,
}

impl BlobVerification {
    pub fn is_ok(&self) -> bool {
        !self.file_missing && !self.size_mismatch && !self.hash_mismatch && !self.signature_invalid
    }
}

/// Filesystem blob store. Writes are crash-safe (temp file + atomic
/// rename) and serialized per prefix directory.
pub struct BlobStore {
    root: PathBuf,
    limits: LedgerLimits,
    config: EncryptionConfig,
    kdf: Arc<KdfCache>,
    dir_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
    tmp_counter: AtomicU64,
}

impl BlobStore {
    pub fn new<P: AsRef<Path>>(
        root: P,
        limits: LedgerLimits,
        config: EncryptionConfig,
        kdf: Arc<KdfCache>,
    ) -> Result<Self, LedgerError> {
        config.validate()?;
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(root.join("tmp"))
            .map_err(|e| LedgerError::StoreFailed(format!("create blob root: {e}")))?;
        fs::create_dir_all(root.join("orphaned"))
            .map_err(|e| LedgerError::StoreFailed(format!("create orphan dir: {e}")))?;
        Ok(Self {
            root,
            limits,
            config,
            kdf,
            dir_locks: Mutex::new(HashMap::new()),
            tmp_counter: AtomicU64::new(0),
        })
    }

    fn blob_path(&self, file_id: &str) -> PathBuf {
        self.root.join(&file_id[..2]).join(format!("{file_id}.blob"))
    }

    fn sig_path(&self, file_id: &str) -> PathBuf {
        self.root.join(&file_id[..2]).join(format!("{file_id}.sig"))
    }

    fn prefix_lock(&self, prefix: &str) -> Arc<Mutex<()>> {
        let mut locks = self.dir_locks.lock().expect("dir locks poisoned");
        locks.entry(prefix.to_string()).or_default().clone()
    }

    /// Store `bytes`, optionally encrypted under `password`, signing the
    /// stored form with `signer`. Returns the reference to embed in a block.
    pub fn store(
        &self,
        bytes: &[u8],
        password: Option<&str>,
        signer: &KeyPair,
    ) -> Result<OffChainRef, LedgerError> {
        if bytes.is_empty() {
            return Err(LedgerError::InvalidInput("off-chain payload is empty".into()));
        }
        if bytes.len() as u64 > self.limits.max_off_chain_bytes {
            return Err(LedgerError::CapacityExceeded(format!(
                "off-chain payload of {} bytes exceeds cap of {}",
                bytes.len(),
                self.limits.max_off_chain_bytes
            )));
        }
        if let Some(pw) = password {
            self.limits.check_password(pw)?;
        }

        let (stored, iv_b64) = match password {
            Some(pw) => {
                let iv = aead::random_iv();
                // The stored layout carries no salt field; the fresh random
                // IV doubles as the PBKDF2 salt.
                let key = self.kdf.derive(
                    pw,
                    &iv,
                    self.config.pbkdf2_iterations,
                    self.config.key_length.bytes(),
                );
                let ct = aead::seal(&key, self.config.key_length, &iv, bytes, OFFCHAIN_AAD)
                    .map_err(LedgerError::from)?;
                let mut stored = Vec::with_capacity(iv.len() + ct.len());
                stored.extend_from_slice(&iv);
                stored.extend_from_slice(&ct);
                (stored, Some(BASE64.encode(iv)))
            }
            None => (bytes.to_vec(), None),
        };

        let file_id = sha256_hex(&stored);
        let signature_b64 = signer.sign(&stored);
        let raw_signature = BASE64
            .decode(&signature_b64)
            .map_err(|e| LedgerError::Serialization(e.to_string()))?;

        let prefix = file_id[..2].to_string();
        let lock = self.prefix_lock(&prefix);
        let _guard = lock.lock().expect("prefix lock poisoned");

        let dir = self.root.join(&prefix);
        fs::create_dir_all(&dir)
            .map_err(|e| LedgerError::StoreFailed(format!("create prefix dir: {e}")))?;

        let blob_path = self.blob_path(&file_id);
        if !blob_path.exists() {
            let tmp_id = self.tmp_counter.fetch_add(1, Ordering::SeqCst);
            let tmp = self.root.join("tmp").join(format!("{file_id}.{tmp_id}"));
            fs::write(&tmp, &stored)
                .map_err(|e| LedgerError::StoreFailed(format!("write blob: {e}")))?;
            fs::rename(&tmp, &blob_path)
                .map_err(|e| LedgerError::StoreFailed(format!("commit blob: {e}")))?;
            fs::write(self.sig_path(&file_id), &raw_signature)
                .map_err(|e| LedgerError::StoreFailed(format!("write signature: {e}")))?;
        }

        info!(file_id, size = stored.len(), encrypted = password.is_some(), "stored off-chain blob");
        Ok(OffChainRef {
            file_id: file_id.clone(),
            size: stored.len() as u64,
            sha256: file_id,
            signature: signature_b64,
            iv: iv_b64,
        })
    }

    /// Load a blob back, decrypting when the reference says it is
    /// encrypted. Verifies the content address before anything else.
    pub fn load(&self, reference: &OffChainRef, password: Option<&str>) -> Result<Vec<u8>, LedgerError> {
        let stored = self.read_stored(reference)?;

        match &reference.iv {
            None => Ok(stored),
            Some(iv_b64) => {
                let pw = password.ok_or_else(|| {
                    LedgerError::Unauthorized(format!(
                        "blob {} is encrypted; a password is required",
                        reference.file_id
                    ))
                })?;
                self.limits.check_password(pw)?;
                let iv_bytes = BASE64.decode(iv_b64).map_err(|_| {
                    LedgerError::IntegrityFailed("reference IV is not base64".into())
                })?;
                let (iv, body) = aead::split_iv(&stored).map_err(LedgerError::from)?;
                if iv_bytes != iv {
                    return Err(LedgerError::IntegrityFailed(format!(
                        "stored IV does not match reference for {}",
                        reference.file_id
                    )));
                }
                let key = self.kdf.derive(
                    pw,
                    &iv,
                    self.config.pbkdf2_iterations,
                    self.config.key_length.bytes(),
                );
                aead::open(&key, self.config.key_length, &iv, body, OFFCHAIN_AAD).map_err(|_| {
                    LedgerError::Unauthorized(format!(
                        "decryption failed for blob {}: wrong password or corrupted data",
                        reference.file_id
                    ))
                })
            }
        }
    }

    fn read_stored(&self, reference: &OffChainRef) -> Result<Vec<u8>, LedgerError> {
        validate_file_id(&reference.file_id)?;
        let path = self.blob_path(&reference.file_id);
        let stored = fs::read(&path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                LedgerError::NotFound(format!("off-chain blob {} missing", reference.file_id))
            } else {
                LedgerError::StoreFailed(format!("read blob: {e}"))
            }
        })?;
        if stored.len() as u64 != reference.size {
            return Err(LedgerError::IntegrityFailed(format!(
                "blob {} is {} bytes, reference says {}",
                reference.file_id,
                stored.len(),
                reference.size
            )));
        }
        let digest = sha256_hex(&stored);
        if digest != reference.sha256 {
            return Err(LedgerError::IntegrityFailed(format!(
                "blob {} digest mismatch",
                reference.file_id
            )));
        }
        Ok(stored)
    }

    /// Standalone integrity verification against the block signer's key.
    /// Never returns an error for a bad blob — every failure mode is a flag.
    pub fn verify(&self, reference: &OffChainRef, signer_public_key_pem: &str) -> BlobVerification {
        let mut v = BlobVerification::default();
        if validate_file_id(&reference.file_id).is_err() {
            v.file_missing = true;
            return v;
        }
        let stored = match fs::read(self.blob_path(&reference.file_id)) {
            Ok(bytes) => bytes,
            Err(_) => {
                v.file_missing = true;
                return v;
            }
        };
        if stored.len() as u64 != reference.size {
            v.size_mismatch = true;
        }
        if sha256_hex(&stored) != reference.sha256 {
            v.hash_mismatch = true;
        }
        let sig_ok = match fs::read(self.sig_path(&reference.file_id)) {
            Ok(raw) => {
                let sig_b64 = BASE64.encode(raw);
                verify_signature(signer_public_key_pem, &stored, &sig_b64).is_ok()
            }
            // Fall back to the signature recorded in the reference.
            Err(_) => verify_signature(signer_public_key_pem, &stored, &reference.signature).is_ok(),
        };
        if !sig_ok {
            v.signature_invalid = true;
        }
        v
    }

    pub fn exists(&self, file_id: &str) -> bool {
        validate_file_id(file_id).is_ok() && self.blob_path(file_id).exists()
    }

    // ── Orphan GC ─────────────────────────────────────────────────────────────
    //
    // A failed block persist leaves its freshly written blob without an
    // owning block. The engine marks it; a later sweep removes it.

    pub fn mark_orphan(&self, file_id: &str) -> Result<(), LedgerError> {
        validate_file_id(file_id)?;
        fs::write(self.root.join("orphaned").join(file_id), b"")
            .map_err(|e| LedgerError::StoreFailed(format!("mark orphan: {e}")))?;
        warn!(file_id, "off-chain blob marked as orphan");
        Ok(())
    }

    /// Delete every marked orphan blob. Returns how many were removed.
    pub fn sweep_orphans(&self) -> Result<usize, LedgerError> {
        let orphan_dir = self.root.join("orphaned");
        let mut removed = 0usize;
        let entries = fs::read_dir(&orphan_dir)
            .map_err(|e| LedgerError::StoreFailed(format!("read orphan dir: {e}")))?;
        for entry in entries {
            let entry = entry.map_err(|e| LedgerError::StoreFailed(e.to_string()))?;
            let file_id = entry.file_name().to_string_lossy().to_string();
            if validate_file_id(&file_id).is_err() {
                continue;
            }
            let _ = fs::remove_file(self.blob_path(&file_id));
            let _ = fs::remove_file(self.sig_path(&file_id));
            fs::remove_file(entry.path())
                .map_err(|e| LedgerError::StoreFailed(format!("clear orphan marker: {e}")))?;
            removed += 1;
        }
        if removed > 0 {
            info!(removed, "swept orphaned off-chain blobs");
        }
        Ok(removed)
    }
}

fn validate_file_id(file_id: &str) -> Result<(), LedgerError> {
    if file_id.len() != 64 || !file_id.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()) {
        return Err(LedgerError::InvalidInput(format!(
            "malformed off-chain file id: {file_id:?}"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::RngCore;

    fn fast_config() -> EncryptionConfig {
        EncryptionConfig {
            pbkdf2_iterations: 10_000,
            ..EncryptionConfig::default()
        }
    }

    fn open_store(dir: &Path) -> BlobStore {
        BlobStore::new(
            dir,
            LedgerLimits::default(),
            fast_config(),
            Arc::new(KdfCache::default()),
        )
        .unwrap()
    }

    #[test]
    fn plain_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(dir.path());
        let signer = KeyPair::generate();

        let r = store.store(b"large payload bytes", None, &signer).unwrap();
        assert_eq!(r.file_id, r.sha256);
        assert!(r.iv.is_none());
        assert_eq!(store.load(&r, None).unwrap(), b"large payload bytes");
        assert!(store.verify(&r, signer.public_key_pem()).is_ok());
    }

    #[test]
    fn encrypted_round_trip_and_wrong_password() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(dir.path());
        let signer = KeyPair::generate();

        let mut payload = vec![0u8; 128 * 1024];
        rand::rngs::OsRng.fill_bytes(&mut payload);

        let r = store.store(&payload, Some("P@ssw0rd123"), &signer).unwrap();
        assert!(r.iv.is_some());
        assert_eq!(store.load(&r, Some("P@ssw0rd123")).unwrap(), payload);

        match store.load(&r, Some("wrong-password")) {
            Err(LedgerError::Unauthorized(_)) => {}
            other => panic!("expected Unauthorized, got {other:?}"),
        }
        match store.load(&r, None) {
            Err(LedgerError::Unauthorized(_)) => {}
            other => panic!("expected Unauthorized, got {other:?}"),
        }
    }

    #[test]
    fn tampered_blob_fails_integrity() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(dir.path());
        let signer = KeyPair::generate();

        let r = store.store(b"tamper target payload", None, &signer).unwrap();
        let path = store.blob_path(&r.file_id);
        let mut bytes = fs::read(&path).unwrap();
        bytes[0] ^= 0x01;
        fs::write(&path, &bytes).unwrap();

        assert!(matches!(store.load(&r, None), Err(LedgerError::IntegrityFailed(_))));
        let v = store.verify(&r, signer.public_key_pem());
        assert!(v.hash_mismatch);
        assert!(v.signature_invalid);
        assert!(!v.file_missing);
    }

    #[test]
    fn missing_blob_reported() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(dir.path());
        let signer = KeyPair::generate();

        let r = store.store(b"here today", None, &signer).unwrap();
        fs::remove_file(store.blob_path(&r.file_id)).unwrap();

        assert!(matches!(store.load(&r, None), Err(LedgerError::NotFound(_))));
        assert!(store.verify(&r, signer.public_key_pem()).file_missing);
    }

    #[test]
    fn size_cap_enforced() {
        let dir = tempfile::tempdir().unwrap();
        let mut limits = LedgerLimits::default();
        limits.max_off_chain_bytes = 16;
        let store = BlobStore::new(
            dir.path(),
            limits,
            fast_config(),
            Arc::new(KdfCache::default()),
        )
        .unwrap();
        let signer = KeyPair::generate();
        assert!(matches!(
            store.store(&[0u8; 17], None, &signer),
            Err(LedgerError::CapacityExceeded(_))
        ));
    }

    #[test]
    fn orphan_sweep_removes_blob() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(dir.path());
        let signer = KeyPair::generate();

        let r = store.store(b"soon to be orphaned", None, &signer).unwrap();
        assert!(store.exists(&r.file_id));
        store.mark_orphan(&r.file_id).unwrap();
        assert_eq!(store.sweep_orphans().unwrap(), 1);
        assert!(!store.exists(&r.file_id));
        assert_eq!(store.sweep_orphans().unwrap(), 0);
    }
}
