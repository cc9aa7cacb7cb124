//! Search engine scenarios over a fully wired chain.

use std::path::Path;
use std::sync::Arc;

use veilchain_chain::{AppendOptions, ChainEngine};
use veilchain_coordinator::{CoordinatorConfig, IndexingCoordinator};
use veilchain_core::{CancelToken, EncryptionConfig, LedgerError, LedgerLimits};
use veilchain_crypto::{KdfCache, KeyPair};
use veilchain_index::MetadataIndex;
use veilchain_offchain::BlobStore;
use veilchain_search::{MatchOrigin, QueryHints, SearchEngine, SearchMode, SearchQuery};
use veilchain_storage::{BlockDao, LedgerDb, MemoryDao};

fn fast_config() -> EncryptionConfig {
    EncryptionConfig {
        pbkdf2_iterations: 10_000,
        ..EncryptionConfig::default()
    }
}

fn build_engine_with(dao: Arc<dyn BlockDao>, dir: &Path) -> Arc<ChainEngine> {
    let config = fast_config();
    let kdf = Arc::new(KdfCache::default());
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

fn build_engine(dir: &Path) -> Arc<ChainEngine> {
    let dao: Arc<dyn BlockDao> = Arc::new(LedgerDb::open(dir.join("db")).unwrap());
    build_engine_with(dao, dir)
}

fn authorize(engine: &ChainEngine, owner: &str) -> KeyPair {
    let kp = KeyPair::generate();
    assert!(engine.add_authorized_key(kp.public_key_pem(), owner).unwrap());
    kp
}

#[test]
fn fast_public_search_hits_metadata_only() {
    let dir = tempfile::tempdir().unwrap();
    let engine = build_engine(dir.path());
    let alice = authorize(&engine, "alice");

    let tagged = AppendOptions {
        category: Some("finance".into()),
        manual_keywords: vec!["quarterly".into(), "report".into()],
        ..AppendOptions::default()
    };
    let b1 = engine.append("the payload body", &alice, tagged).unwrap();
    engine.append("untagged", &alice, AppendOptions::default()).unwrap();

    let search = SearchEngine::new(engine.clone());
    let results = search
        .search(&SearchQuery::terms(&["finance"]), &CancelToken::new())
        .unwrap();
    assert_eq!(results.hits.len(), 1);
    let hit = &results.hits[0];
    assert_eq!(hit.block_number, b1.block_number);
    assert_eq!(hit.origins, vec![MatchOrigin::Public]);
    assert!(!results.truncated);

    // Body text is not in the public index; fast search misses it.
    let miss = search
        .search(&SearchQuery::terms(&["payload"]), &CancelToken::new())
        .unwrap();
    assert!(miss.hits.is_empty());
}

#[test]
fn private_layer_needs_password() {
    let dir = tempfile::tempdir().unwrap();
    let engine = build_engine(dir.path());
    let alice = authorize(&engine, "alice");

    let options = AppendOptions {
        encrypt: true,
        password: Some("CorrectHorse9!".into()),
        ..AppendOptions::default()
    };
    let b = engine
        .append("project aurora launch window", &alice, options)
        .unwrap();

    let search = SearchEngine::new(engine.clone());

    let hit = search
        .search(
            &SearchQuery::terms(&["aurora"]).with_password("CorrectHorse9!"),
            &CancelToken::new(),
        )
        .unwrap();
    assert_eq!(hit.hits.len(), 1);
    assert_eq!(hit.hits[0].block_number, b.block_number);
    assert!(hit.hits[0].origins.contains(&MatchOrigin::Private));

    // Same query, no password: nothing.
    let miss = search
        .search(&SearchQuery::terms(&["aurora"]), &CancelToken::new())
        .unwrap();
    assert!(miss.hits.is_empty());

    // Wrong password: fingerprints land elsewhere, still nothing.
    let wrong = search
        .search(
            &SearchQuery::terms(&["aurora"]).with_password("WrongHorse9!!"),
            &CancelToken::new(),
        )
        .unwrap();
    assert!(wrong.hits.is_empty());

    // Explicit authenticated mode without a password is an error.
    match search.search(
        &SearchQuery::terms(&["aurora"]).with_mode(SearchMode::AuthenticatedPrivate),
        &CancelToken::new(),
    ) {
        Err(LedgerError::Unauthorized(_)) => {}
        other => panic!("expected Unauthorized, got {other:?}"),
    }
}

#[test]
fn deep_content_scan_decrypts_what_it_can() {
    let dir = tempfile::tempdir().unwrap();
    let engine = build_engine(dir.path());
    let alice = authorize(&engine, "alice");

    let plain = engine
        .append("the needle hides in plain text", &alice, AppendOptions::default())
        .unwrap();
    let encrypted = engine
        .append(
            "the needle hides behind a password",
            &alice,
            AppendOptions {
                encrypt: true,
                password: Some("CorrectHorse9!".into()),
                ..AppendOptions::default()
            },
        )
        .unwrap();

    let search = SearchEngine::new(engine.clone());
    let deep = SearchQuery {
        hints: QueryHints { scan_content: true },
        ..SearchQuery::terms(&["needle"])
    };

    // Without a password the scan only reads plaintext blocks.
    let public_only = search.search(&deep, &CancelToken::new()).unwrap();
    let numbers: Vec<u64> = public_only.hits.iter().map(|h| h.block_number).collect();
    assert_eq!(numbers, vec![plain.block_number]);

    // With the password both blocks match, through the content layer.
    let both = search
        .search(&deep.clone().with_password("CorrectHorse9!"), &CancelToken::new())
        .unwrap();
    let mut numbers: Vec<u64> = both.hits.iter().map(|h| h.block_number).collect();
    numbers.sort_unstable();
    assert_eq!(numbers, vec![plain.block_number, encrypted.block_number]);
    assert!(both
        .hits
        .iter()
        .all(|h| h.origins.contains(&MatchOrigin::Content)));
}

#[test]
fn deep_scan_reads_small_off_chain_blobs() {
    let dir = tempfile::tempdir().unwrap();
    let engine = build_engine(dir.path());
    let alice = authorize(&engine, "alice");

    let blob_text = b"annual shipment manifest: cobalt, lithium".to_vec();
    let block = engine
        .append(
            "manifest attached",
            &alice,
            AppendOptions {
                off_chain_payload: Some(blob_text),
                ..AppendOptions::default()
            },
        )
        .unwrap();

    let search = SearchEngine::new(engine.clone());
    let deep = SearchQuery {
        hints: QueryHints { scan_content: true },
        ..SearchQuery::terms(&["cobalt"])
    };
    let results = search.search(&deep, &CancelToken::new()).unwrap();
    assert_eq!(results.hits.len(), 1);
    assert_eq!(results.hits[0].block_number, block.block_number);
    assert!(results.hits[0].origins.contains(&MatchOrigin::OffChain));
}

#[test]
fn recipient_queries_are_authenticated() {
    let dir = tempfile::tempdir().unwrap();
    let engine = build_engine(dir.path());
    let alice = authorize(&engine, "alice");

    let to_bob = AppendOptions {
        recipient_username: Some("bob".into()),
        category: Some("mail".into()),
        ..AppendOptions::default()
    };
    let block = engine.append("for bob's eyes", &alice, to_bob).unwrap();

    let search = SearchEngine::new(engine.clone());
    let mut query = SearchQuery::terms(&["mail"]).with_password("CorrectHorse9!");
    query.recipient = Some("bob".into());
    let results = search.search(&query, &CancelToken::new()).unwrap();
    assert_eq!(results.hits.len(), 1);
    assert_eq!(results.hits[0].block_number, block.block_number);

    let mut unauthenticated = SearchQuery::terms(&["mail"]);
    unauthenticated.recipient = Some("bob".into());
    match search.search(&unauthenticated, &CancelToken::new()) {
        Err(LedgerError::Unauthorized(_)) => {}
        other => panic!("expected Unauthorized, got {other:?}"),
    }
}

#[test]
fn cancelled_deep_scan_returns_truncated() {
    let dir = tempfile::tempdir().unwrap();
    let engine = build_engine(dir.path());
    let alice = authorize(&engine, "alice");
    engine
        .append("the needle somewhere", &alice, AppendOptions::default())
        .unwrap();

    let search = SearchEngine::new(engine.clone());
    let deep = SearchQuery {
        hints: QueryHints { scan_content: true },
        ..SearchQuery::terms(&["needle"])
    };
    let token = CancelToken::new();
    token.cancel();
    let results = search.search(&deep, &token).unwrap();
    assert!(results.truncated);
}

#[test]
fn result_materialization_is_one_batch_query() {
    let dir = tempfile::tempdir().unwrap();
    let dao = Arc::new(MemoryDao::new());
    let engine = build_engine_with(dao.clone(), dir.path());
    let alice = authorize(&engine, "alice");

    for i in 0..20 {
        engine
            .append(
                &format!("entry {i}"),
                &alice,
                AppendOptions {
                    category: Some("bulk".into()),
                    ..AppendOptions::default()
                },
            )
            .unwrap();
    }

    let search = SearchEngine::new(engine.clone());
    dao.stats().reset();
    let results = search
        .search(&SearchQuery::terms(&["bulk"]), &CancelToken::new())
        .unwrap();
    assert_eq!(results.hits.len(), 20);

    // However many candidates matched, the blocks came back in one query.
    assert_eq!(dao.stats().batch_retrieve_calls(), 1);
    assert_eq!(dao.stats().get_block_calls(), 0);
}

#[test]
fn scores_rank_multi_term_hits_first() {
    let dir = tempfile::tempdir().unwrap();
    let engine = build_engine(dir.path());
    let alice = authorize(&engine, "alice");

    let rich = AppendOptions {
        category: Some("finance".into()),
        manual_keywords: vec!["audit".into()],
        ..AppendOptions::default()
    };
    let both = engine.append("a", &alice, rich).unwrap();
    let single = AppendOptions {
        category: Some("finance".into()),
        ..AppendOptions::default()
    };
    let one = engine.append("b", &alice, single).unwrap();

    let search = SearchEngine::new(engine.clone());
    let results = search
        .search(&SearchQuery::terms(&["finance", "audit"]), &CancelToken::new())
        .unwrap();
    assert_eq!(results.hits.len(), 2);
    assert_eq!(results.hits[0].block_number, both.block_number);
    assert_eq!(results.hits[1].block_number, one.block_number);
    assert!(results.hits[0].score > results.hits[1].score);
}
