//! End-to-end chain engine scenarios against a real sled store in a
//! scratch directory.

use std::path::Path;
use std::sync::Arc;

use veilchain_chain::{AppendOptions, BlockStatus, ChainEngine};
use veilchain_coordinator::{CoordinatorConfig, IndexingCoordinator};
use veilchain_core::constants::ENCRYPTED_MARKER;
use veilchain_core::{EncryptionConfig, LedgerError, LedgerLimits};
use veilchain_crypto::{KdfCache, KeyPair};
use veilchain_index::MetadataIndex;
use veilchain_offchain::BlobStore;
use veilchain_storage::{BlockDao, LedgerDb};

fn fast_config() -> EncryptionConfig {
    EncryptionConfig {
        pbkdf2_iterations: 10_000,
        ..EncryptionConfig::default()
    }
}

fn build_engine(dir: &Path) -> Arc<ChainEngine> {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
    let config = fast_config();
    let kdf = Arc::new(KdfCache::default());
    let dao: Arc<dyn BlockDao> = Arc::new(LedgerDb::open(dir.join("db")).unwrap());
    let blobs = Arc::new(
        BlobStore::new(dir.join("blobs"), LedgerLimits::default(), config.clone(), kdf.clone())
            .unwrap(),
    );
    let index = Arc::new(
        MetadataIndex::open(dir.join("index"), dao.clone(), config.clone(), kdf.clone()).unwrap(),
    );
    let coordinator = Arc::new(IndexingCoordinator::new(CoordinatorConfig::default()));
    Arc::new(
        ChainEngine::new(
            dao,
            blobs,
            index,
            coordinator,
            kdf,
            LedgerLimits::default(),
            config,
        )
        .unwrap(),
    )
}

fn authorize(engine: &ChainEngine, owner: &str) -> KeyPair {
    let kp = KeyPair::generate();
    assert!(engine.add_authorized_key(kp.public_key_pem(), owner).unwrap());
    kp
}

// ── Genesis and plain appends ─────────────────────────────────────────────────

#[test]
fn genesis_plus_two_appends_validate() {
    let dir = tempfile::tempdir().unwrap();
    let engine = build_engine(dir.path());
    let alice = authorize(&engine, "alice");

    let b1 = engine.append("hello", &alice, AppendOptions::default()).unwrap();
    let b2 = engine.append("world", &alice, AppendOptions::default()).unwrap();

    assert_eq!(engine.block_count().unwrap(), 3);
    assert_eq!(b1.block_number, 1);
    assert_eq!(b2.block_number, 2);
    assert_eq!(b2.previous_hash, b1.hash);

    let report = engine.validate_chain().unwrap();
    assert_eq!(report.total(), 3);
    assert!(report.is_valid(), "summary: {}", report.summary());
}

#[test]
fn unauthorized_signer_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let engine = build_engine(dir.path());
    let stranger = KeyPair::generate();

    match engine.append("hi", &stranger, AppendOptions::default()) {
        Err(LedgerError::Unauthorized(_)) => {}
        other => panic!("expected Unauthorized, got {other:?}"),
    }
    assert_eq!(engine.block_count().unwrap(), 1);
}

// ── Encrypted append and tamper detection ─────────────────────────────────────

#[test]
fn encrypted_append_tamper_and_revert() {
    let dir = tempfile::tempdir().unwrap();
    let engine = build_engine(dir.path());
    let alice = authorize(&engine, "alice");

    let options = AppendOptions {
        encrypt: true,
        password: Some("CorrectHorse9!".into()),
        ..AppendOptions::default()
    };
    let block = engine.append("secret-payload", &alice, options).unwrap();
    assert!(block.is_encrypted);
    assert!(block.data.starts_with(ENCRYPTED_MARKER));
    assert!(!block.data.contains("secret-payload"));

    let genesis = engine.get_block(0).unwrap().unwrap();
    assert!(engine.validate_block_record(&block, Some(&genesis)).is_valid());

    // Flip one character inside the stored ciphertext.
    let mut tampered = block.clone();
    let pos = ENCRYPTED_MARKER.len() + 5;
    let mut bytes = tampered.data.into_bytes();
    bytes[pos] = if bytes[pos] == b'A' { b'B' } else { b'A' };
    tampered.data = String::from_utf8(bytes).unwrap();

    let v = engine.validate_block_record(&tampered, Some(&genesis));
    assert_eq!(v.status(), BlockStatus::HashMismatch);

    // Corrupting just the marker also fails validation.
    let mut marker_gone = block.clone();
    marker_gone.data = marker_gone.data.replacen("[ENCRYPTED]", "[FNCRYPTFD]", 1);
    assert!(!engine.validate_block_record(&marker_gone, Some(&genesis)).is_valid());

    // The untouched stored block still validates and decrypts.
    let stored = engine.validate_block(block.block_number).unwrap();
    assert!(stored.is_valid());
    assert_eq!(
        engine.open_block_data(&block, "CorrectHorse9!").unwrap(),
        "secret-payload"
    );
    assert!(engine.open_block_data(&block, "WrongHorse9!!").is_err());
}

// ── Off-chain payloads ────────────────────────────────────────────────────────

#[test]
fn off_chain_round_trip_with_password() {
    let dir = tempfile::tempdir().unwrap();
    let engine = build_engine(dir.path());
    let alice = authorize(&engine, "alice");

    let mut payload = vec![0u8; 10 * 1024 * 1024];
    for (i, b) in payload.iter_mut().enumerate() {
        *b = (i % 251) as u8;
    }

    let options = AppendOptions {
        encrypt: true,
        password: Some("P@ssw0rd123".into()),
        off_chain_payload: Some(payload.clone()),
        ..AppendOptions::default()
    };
    let block = engine.append("archived dataset", &alice, options).unwrap();
    let reference = block.off_chain_ref.clone().expect("off-chain reference");
    assert!(reference.iv.is_some());

    assert_eq!(engine.blobs().load(&reference, Some("P@ssw0rd123")).unwrap(), payload);
    assert!(engine.blobs().load(&reference, Some("wrong-pass")).is_err());

    assert!(engine.validate_block(block.block_number).unwrap().is_valid());
}

#[test]
fn oversized_inline_data_moves_off_chain() {
    let dir = tempfile::tempdir().unwrap();
    let engine = build_engine(dir.path());
    let alice = authorize(&engine, "alice");

    let big = "x".repeat(2 * 1024 * 1024);
    let block = engine.append(&big, &alice, AppendOptions::default()).unwrap();

    let reference = block.off_chain_ref.clone().expect("routed off-chain");
    assert!(block.data.len() <= engine.limits().inline_data_cap);
    assert!(block.data.starts_with("[OFF-CHAIN]"));
    assert_eq!(
        engine.blobs().load(&reference, None).unwrap(),
        big.as_bytes()
    );
    assert!(engine.validate_block(block.block_number).unwrap().is_valid());
}

#[test]
fn missing_blob_flags_the_block() {
    let dir = tempfile::tempdir().unwrap();
    let engine = build_engine(dir.path());
    let alice = authorize(&engine, "alice");

    let options = AppendOptions {
        off_chain_payload: Some(vec![7u8; 1024]),
        ..AppendOptions::default()
    };
    let block = engine.append("doomed blob", &alice, options).unwrap();
    let reference = block.off_chain_ref.clone().unwrap();

    let blob_path = dir
        .path()
        .join("blobs")
        .join(&reference.sha256[..2])
        .join(format!("{}.blob", reference.sha256));
    std::fs::remove_file(blob_path).unwrap();

    let v = engine.validate_block(block.block_number).unwrap();
    assert_eq!(v.status(), BlockStatus::OffChainMissing);

    // The rest of the chain is unaffected.
    let report = engine.validate_chain().unwrap();
    assert_eq!(report.valid_count(), report.total() - 1);
}

// ── Key lifecycle ─────────────────────────────────────────────────────────────

#[test]
fn revocation_blocks_new_appends_but_keeps_history_valid() {
    let dir = tempfile::tempdir().unwrap();
    let engine = build_engine(dir.path());
    let k1 = authorize(&engine, "alice");

    let block_a = engine.append("A", &k1, AppendOptions::default()).unwrap();
    assert!(engine.revoke_authorized_key(k1.public_key_pem()).unwrap());

    match engine.append("B", &k1, AppendOptions::default()) {
        Err(LedgerError::Unauthorized(_)) => {}
        other => panic!("expected Unauthorized, got {other:?}"),
    }

    // Revocation never retroactively invalidates.
    assert!(engine.validate_block(block_a.block_number).unwrap().is_valid());

    // Double revocation reports false.
    assert!(!engine.revoke_authorized_key(k1.public_key_pem()).unwrap());
}

#[test]
fn key_deletion_requires_force_and_orphans_blocks() {
    let dir = tempfile::tempdir().unwrap();
    let engine = build_engine(dir.path());
    let k1 = authorize(&engine, "alice");

    let block = engine.append("signed by alice", &k1, AppendOptions::default()).unwrap();

    let impact = engine.can_delete_authorized_key(k1.public_key_pem()).unwrap();
    assert_eq!(impact.affected_blocks, 1);
    assert!(impact.severe);

    // Unforced deletion refused while blocks depend on the key.
    assert!(engine.delete_authorized_key(k1.public_key_pem(), false, "").is_err());
    // Forced deletion requires a reason.
    assert!(engine.delete_authorized_key(k1.public_key_pem(), true, "  ").is_err());

    assert!(engine
        .delete_authorized_key(k1.public_key_pem(), true, "compromised key")
        .unwrap());

    // The orphaned block now fails authorization; the chain stays linked.
    let report = engine.validate_chain().unwrap();
    let orphaned = report.for_block(block.block_number).unwrap();
    assert_eq!(orphaned.status(), BlockStatus::AuthorizationInvalid);
    assert!(orphaned.hash_ok && orphaned.signature_ok);
    assert!(report.for_block(0).unwrap().is_valid());

    // A tombstoned key can never come back.
    match engine.add_authorized_key(k1.public_key_pem(), "alice-again") {
        Err(LedgerError::InvalidInput(_)) => {}
        other => panic!("expected InvalidInput, got {other:?}"),
    }
}

#[test]
fn safe_deletion_of_unused_key() {
    let dir = tempfile::tempdir().unwrap();
    let engine = build_engine(dir.path());
    let k1 = authorize(&engine, "alice");

    let impact = engine.can_delete_authorized_key(k1.public_key_pem()).unwrap();
    assert!(impact.is_safe());
    assert!(engine.delete_authorized_key(k1.public_key_pem(), false, "unused").unwrap());
    assert!(engine.list_authorized_keys().unwrap().is_empty());
}

// ── Input validation ──────────────────────────────────────────────────────────

#[test]
fn append_input_validation() {
    let dir = tempfile::tempdir().unwrap();
    let engine = build_engine(dir.path());
    let alice = authorize(&engine, "alice");

    assert!(matches!(
        engine.append("", &alice, AppendOptions::default()),
        Err(LedgerError::InvalidInput(_))
    ));

    let no_password = AppendOptions {
        encrypt: true,
        ..AppendOptions::default()
    };
    assert!(matches!(
        engine.append("data", &alice, no_password),
        Err(LedgerError::InvalidInput(_))
    ));

    let weak = AppendOptions {
        encrypt: true,
        password: Some("short".into()),
        ..AppendOptions::default()
    };
    assert!(matches!(
        engine.append("data", &alice, weak),
        Err(LedgerError::InvalidInput(_))
    ));
}

// ── Concurrency ───────────────────────────────────────────────────────────────

#[test]
fn concurrent_appends_never_share_a_block_number() {
    let dir = tempfile::tempdir().unwrap();
    let engine = build_engine(dir.path());
    let alice = Arc::new(authorize(&engine, "alice"));

    let mut handles = Vec::new();
    for t in 0..4 {
        let engine = engine.clone();
        let alice = alice.clone();
        handles.push(std::thread::spawn(move || {
            let mut numbers = Vec::new();
            for i in 0..5 {
                let block = engine
                    .append(&format!("writer {t} entry {i}"), &alice, AppendOptions::default())
                    .unwrap();
                numbers.push(block.block_number);
            }
            numbers
        }));
    }

    let mut all: Vec<u64> = handles
        .into_iter()
        .flat_map(|h| h.join().unwrap())
        .collect();
    all.sort_unstable();
    // 20 appends after genesis: numbers 1..=20, no duplicates, no gaps.
    assert_eq!(all, (1..=20).collect::<Vec<u64>>());

    let report = engine.validate_chain().unwrap();
    assert!(report.is_valid(), "{}", report.summary());
}

// ── Encrypted-blocks cache ────────────────────────────────────────────────────

#[test]
fn encrypted_block_numbers_track_appends() {
    let dir = tempfile::tempdir().unwrap();
    let engine = build_engine(dir.path());
    let alice = authorize(&engine, "alice");

    assert!(engine.encrypted_block_numbers().unwrap().is_empty());

    let options = AppendOptions {
        encrypt: true,
        password: Some("CorrectHorse9!".into()),
        ..AppendOptions::default()
    };
    let b = engine.append("hidden", &alice, options).unwrap();
    engine.append("visible", &alice, AppendOptions::default()).unwrap();

    let numbers = engine.encrypted_block_numbers().unwrap();
    assert_eq!(numbers.as_slice(), &[b.block_number]);
}
