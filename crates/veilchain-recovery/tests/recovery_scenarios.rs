//! Checkpoint and integrity-report scenarios over a fully wired chain.

use std::path::Path;
use std::sync::Arc;

use veilchain_chain::{AppendOptions, ChainEngine};
use veilchain_coordinator::{CoordinatorConfig, IndexingCoordinator};
use veilchain_core::{CancelToken, CheckpointStatus, EncryptionConfig, LedgerError, LedgerLimits};
use veilchain_crypto::{KdfCache, KeyPair};
use veilchain_index::MetadataIndex;
use veilchain_offchain::BlobStore;
use veilchain_recovery::{
    run_integrity_sweep, CheckpointManager, CheckStatus, OffChainIntegrityReport,
};
use veilchain_storage::{BlockDao, LedgerDb};

fn fast_config() -> EncryptionConfig {
    EncryptionConfig {
        pbkdf2_iterations: 10_000,
        ..EncryptionConfig::default()
    }
}

fn build_engine(dir: &Path) -> Arc<ChainEngine> {
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

#[test]
fn checkpoint_restore_truncates_the_tail() {
    let dir = tempfile::tempdir().unwrap();
    let engine = build_engine(dir.path());
    let alice = authorize(&engine, "alice");

    for i in 0..3 {
        engine
            .append(&format!("pre-checkpoint {i}"), &alice, AppendOptions::default())
            .unwrap();
    }
    let manager = CheckpointManager::new(engine.clone());
    let cp = manager.create_checkpoint("manual", "before risky writes").unwrap();
    assert_eq!(cp.last_block_number, 3);
    assert_eq!(cp.total_blocks, 4);
    assert_eq!(cp.status, CheckpointStatus::Active);

    for i in 0..2 {
        engine
            .append(&format!("post-checkpoint {i}"), &alice, AppendOptions::default())
            .unwrap();
    }
    assert_eq!(engine.block_count().unwrap(), 6);

    let outcome = manager.restore(&cp.checkpoint_id).unwrap();
    assert_eq!(outcome.removed_blocks, 2);
    assert_eq!(outcome.restored_to_block, 3);
    assert_eq!(engine.block_count().unwrap(), 4);
    assert!(engine.validate_chain().unwrap().is_valid());

    // Consumed checkpoints cannot be restored twice.
    let stored = manager.get(&cp.checkpoint_id).unwrap().unwrap();
    assert_eq!(stored.status, CheckpointStatus::Consumed);
    assert!(matches!(
        manager.restore(&cp.checkpoint_id),
        Err(LedgerError::InvalidInput(_))
    ));

    // The chain keeps appending cleanly after a restore.
    let appended = engine.append("fresh start", &alice, AppendOptions::default()).unwrap();
    assert_eq!(appended.block_number, 4);
}

#[test]
fn mismatched_checkpoint_is_marked_corrupted() {
    let dir = tempfile::tempdir().unwrap();
    let engine = build_engine(dir.path());
    let alice = authorize(&engine, "alice");
    engine.append("one", &alice, AppendOptions::default()).unwrap();

    let manager = CheckpointManager::new(engine.clone());
    let mut cp = manager.create_checkpoint("manual", "").unwrap();
    // Simulate a checkpoint whose anchor hash no longer matches the chain.
    cp.last_block_hash = "0".repeat(64);
    engine.dao().put_checkpoint(&cp).unwrap();

    assert!(matches!(
        manager.restore(&cp.checkpoint_id),
        Err(LedgerError::IntegrityFailed(_))
    ));
    assert_eq!(
        manager.get(&cp.checkpoint_id).unwrap().unwrap().status,
        CheckpointStatus::Corrupted
    );
}

#[test]
fn expired_checkpoint_is_not_restorable() {
    let dir = tempfile::tempdir().unwrap();
    let engine = build_engine(dir.path());
    let alice = authorize(&engine, "alice");
    engine.append("one", &alice, AppendOptions::default()).unwrap();

    let manager = CheckpointManager::new(engine.clone());
    let cp = manager.create_checkpoint("manual", "").unwrap();
    manager
        .set_expiration(&cp.checkpoint_id, cp.created_at - chrono::Duration::hours(1))
        .unwrap();
    assert!(matches!(
        manager.restore(&cp.checkpoint_id),
        Err(LedgerError::InvalidInput(_))
    ));
}

#[test]
fn integrity_sweep_reports_healthy_and_corrupted_blobs() {
    let dir = tempfile::tempdir().unwrap();
    let engine = build_engine(dir.path());
    let alice = authorize(&engine, "alice");

    let good = engine
        .append(
            "good blob",
            &alice,
            AppendOptions {
                off_chain_payload: Some(b"healthy bytes".to_vec()),
                ..AppendOptions::default()
            },
        )
        .unwrap();
    let bad = engine
        .append(
            "bad blob",
            &alice,
            AppendOptions {
                off_chain_payload: Some(b"soon to be corrupted".to_vec()),
                ..AppendOptions::default()
            },
        )
        .unwrap();

    // Corrupt the second blob on disk.
    let reference = bad.off_chain_ref.clone().unwrap();
    let blob_path = dir
        .path()
        .join("blobs")
        .join(&reference.sha256[..2])
        .join(format!("{}.blob", reference.sha256));
    let mut bytes = std::fs::read(&blob_path).unwrap();
    bytes[0] ^= 0x01;
    std::fs::write(&blob_path, &bytes).unwrap();

    let report = OffChainIntegrityReport::new("sweep-1").unwrap();
    run_integrity_sweep(&engine, &report, &CancelToken::new()).unwrap();

    let results = report.results();
    assert_eq!(results.len(), 2);
    let good_ref = good.off_chain_ref.unwrap();
    let good_result = results.iter().find(|r| r.data_id == good_ref.file_id).unwrap();
    assert_eq!(good_result.status, CheckStatus::Healthy);
    let bad_result = results.iter().find(|r| r.data_id == reference.file_id).unwrap();
    assert_eq!(bad_result.status, CheckStatus::Critical);

    let stats = report.statistics();
    assert_eq!(stats.total_checks, 2);
    assert_eq!(stats.healthy_checks, 1);
    assert!(report
        .recommendations()
        .iter()
        .any(|r| r.contains("failed critically")));
}

#[test]
fn cancelled_sweep_keeps_partial_report() {
    let dir = tempfile::tempdir().unwrap();
    let engine = build_engine(dir.path());
    let alice = authorize(&engine, "alice");
    engine
        .append(
            "blob",
            &alice,
            AppendOptions {
                off_chain_payload: Some(vec![1u8; 64]),
                ..AppendOptions::default()
            },
        )
        .unwrap();

    let report = OffChainIntegrityReport::new("sweep-2").unwrap();
    let token = CancelToken::new();
    token.cancel();
    assert!(matches!(
        run_integrity_sweep(&engine, &report, &token),
        Err(LedgerError::Cancelled)
    ));
    assert!(report.is_empty());
}
