//! veilchain-keystore
//!
//! Encrypted at-rest storage of signing keys. Each owner gets one file
//! `<owner>.enc` laid out as `salt(16) ‖ iv(12) ‖ ciphertext ‖ tag(16)`,
//! where the ciphertext is AES-GCM over the PKCS#8 DER private key and the
//! key is PBKDF2-derived from the owner's password.

use std::fs;
use std::path::{Path, PathBuf};

use rand::RngCore;
use tracing::{info, warn};
use zeroize::Zeroizing;

use veilchain_core::constants::{
    AEAD_IV_LEN, AEAD_TAG_LEN, ENV_KEYSTORE_PATH, ENV_MASTER_PASSWORD, KDF_SALT_LEN,
};
use veilchain_core::{EncryptionConfig, LedgerError, LedgerLimits};
use veilchain_crypto::{aead, KdfCache, KeyPair};

/// File-backed store of password-encrypted private keys.
pub struct KeyFileStore {
    dir: PathBuf,
    config: EncryptionConfig,
    limits: LedgerLimits,
    kdf: KdfCache,
}

impl KeyFileStore {
    pub fn new<P: AsRef<Path>>(dir: P, config: EncryptionConfig) -> Result<Self, LedgerError> {
        config.validate()?;
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)
            .map_err(|e| LedgerError::StoreFailed(format!("create keystore dir: {e}")))?;
        Ok(Self {
            dir,
            config,
            limits: LedgerLimits::default(),
            kdf: KdfCache::default(),
        })
    }

    /// Production wiring: directory from `VEILCHAIN_KEYSTORE_PATH`.
    pub fn from_env(config: EncryptionConfig) -> Result<Self, LedgerError> {
        let dir = std::env::var(ENV_KEYSTORE_PATH).map_err(|_| {
            LedgerError::InvalidInput(format!("{ENV_KEYSTORE_PATH} is not set"))
        })?;
        Self::new(dir, config)
    }

    /// The master password from `VEILCHAIN_MASTER_PASSWORD`, if exported.
    /// Hosts pass this to `load`/`save` instead of prompting.
    pub fn master_password_from_env() -> Option<String> {
        std::env::var(ENV_MASTER_PASSWORD)
            .ok()
            .filter(|v| !v.trim().is_empty())
    }

    fn path_for(&self, owner: &str) -> Result<PathBuf, LedgerError> {
        validate_owner(owner)?;
        Ok(self.dir.join(format!("{owner}.enc")))
    }

    /// Encrypt and persist `keypair` for `owner`. Refuses to overwrite an
    /// existing key file.
    pub fn save(&self, owner: &str, keypair: &KeyPair, password: &str) -> Result<(), LedgerError> {
        self.limits.check_password(password)?;
        let path = self.path_for(owner)?;
        if path.exists() {
            return Err(LedgerError::InvalidInput(format!(
                "key file for '{owner}' already exists"
            )));
        }

        let mut salt = [0u8; KDF_SALT_LEN];
        rand::rngs::OsRng.fill_bytes(&mut salt);
        let iv = aead::random_iv();

        let key = self.kdf.derive(
            password,
            &salt,
            self.config.pbkdf2_iterations,
            self.config.key_length.bytes(),
        );
        let der: Zeroizing<Vec<u8>> = keypair.to_pkcs8_der().map_err(LedgerError::from)?;
        let ct = aead::seal(&key, self.config.key_length, &iv, &der, owner.as_bytes())
            .map_err(LedgerError::from)?;

        let mut file_bytes = Vec::with_capacity(KDF_SALT_LEN + AEAD_IV_LEN + ct.len());
        file_bytes.extend_from_slice(&salt);
        file_bytes.extend_from_slice(&iv);
        file_bytes.extend_from_slice(&ct);

        // Write to a temp name first so a crash never leaves a torn key file.
        let tmp = path.with_extension("enc.tmp");
        fs::write(&tmp, &file_bytes)
            .map_err(|e| LedgerError::StoreFailed(format!("write key file: {e}")))?;
        fs::rename(&tmp, &path)
            .map_err(|e| LedgerError::StoreFailed(format!("commit key file: {e}")))?;

        info!(owner, "saved encrypted key file");
        Ok(())
    }

    /// Load and decrypt the key file for `owner`.
    pub fn load(&self, owner: &str, password: &str) -> Result<KeyPair, LedgerError> {
        self.limits.check_password(password)?;
        let path = self.path_for(owner)?;
        let file_bytes = fs::read(&path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                LedgerError::NotFound(format!("no key file for '{owner}'"))
            } else {
                LedgerError::StoreFailed(format!("read key file: {e}"))
            }
        })?;

        if file_bytes.len() < KDF_SALT_LEN + AEAD_IV_LEN + AEAD_TAG_LEN {
            return Err(LedgerError::IntegrityFailed(format!(
                "key file for '{owner}' is truncated ({} bytes)",
                file_bytes.len()
            )));
        }
        let (salt, rest) = file_bytes.split_at(KDF_SALT_LEN);
        let (iv_bytes, ct) = rest.split_at(AEAD_IV_LEN);
        let mut iv = [0u8; AEAD_IV_LEN];
        iv.copy_from_slice(iv_bytes);

        let key = self.kdf.derive(
            password,
            salt,
            self.config.pbkdf2_iterations,
            self.config.key_length.bytes(),
        );
        let der = Zeroizing::new(
            aead::open(&key, self.config.key_length, &iv, ct, owner.as_bytes()).map_err(|_| {
                warn!(owner, "key file decryption failed");
                LedgerError::Unauthorized(format!("wrong password for key file '{owner}'"))
            })?,
        );
        KeyPair::from_pkcs8_der(&der).map_err(LedgerError::from)
    }

    /// Owners with a key file in the store directory.
    pub fn list(&self) -> Result<Vec<String>, LedgerError> {
        let mut owners = Vec::new();
        let entries = fs::read_dir(&self.dir)
            .map_err(|e| LedgerError::StoreFailed(format!("read keystore dir: {e}")))?;
        for entry in entries {
            let entry = entry.map_err(|e| LedgerError::StoreFailed(e.to_string()))?;
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if let Some(owner) = name.strip_suffix(".enc") {
                owners.push(owner.to_string());
            }
        }
        owners.sort();
        Ok(owners)
    }

    pub fn delete(&self, owner: &str) -> Result<(), LedgerError> {
        let path = self.path_for(owner)?;
        fs::remove_file(&path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                LedgerError::NotFound(format!("no key file for '{owner}'"))
            } else {
                LedgerError::StoreFailed(format!("delete key file: {e}"))
            }
        })?;
        info!(owner, "deleted key file");
        Ok(())
    }
}

/// Owner names become file names; keep them to a safe character set.
fn validate_owner(owner: &str) -> Result<(), LedgerError> {
    if owner.is_empty() || owner.len() > 128 {
        return Err(LedgerError::InvalidInput(
            "owner name must be 1-128 characters".into(),
        ));
    }
    if !owner
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.')
    {
        return Err(LedgerError::InvalidInput(format!(
            "owner name '{owner}' contains unsupported characters"
        )));
    }
    if owner.starts_with('.') {
        return Err(LedgerError::InvalidInput(
            "owner name must not start with '.'".into(),
        ));
    }
    Ok(())
}
