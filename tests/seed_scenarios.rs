// End-to-end scenarios exercising the engine the way a knowledge-base search
// service actually would: hot-path promotion, event-driven cascading
// invalidation, single-flight memoization under real concurrency, incremental
// loader progress reporting, ARC eviction under pressure, and shared-waiter
// timeout propagation.

use kbcache_engine::common::event::{CacheEvent, QueryKind};
use kbcache_engine::common::Outcome;
use kbcache_engine::invalidation::CacheOperation;
use kbcache_engine::loader::{IncrementalLoader, LoadRequest, LoadSource, LoadStrategy, ProgressCallback};
use kbcache_engine::memoizer::QueryDescriptor;
use kbcache_engine::{CacheError, Engine, EngineConfig, Result};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

fn engine() -> Engine<String> {
    Engine::new(EngineConfig::default()).unwrap()
}

/// A spillover hit climbs the hierarchy one threshold-gated hop at a time —
/// l2_to_l1 then l1_to_l0 — landing in the hot tier with its original tags
/// and TTL intact (spec.md §4.2).
#[tokio::test]
async fn hot_path_promotion_climbs_the_hierarchy() {
    let engine = engine();
    engine.orchestrator().spillover().set(
        b"kb:async-rust",
        "Async Rust uses futures.".into(),
        Some(Duration::from_secs(600)),
        vec!["knowledge-base".into()],
    );
    assert!(!engine.orchestrator().hot().has(b"kb:async-rust"));

    // l2_to_l1 needs access_count > 3 (4 reads), then l1_to_l0 needs a fresh
    // access_count > 2 against the freshly-promoted warm entry (3 more
    // reads): eight reads comfortably clears both hops.
    for _ in 0..8 {
        let outcome = engine.get(b"kb:async-rust").await;
        assert_eq!(outcome, Outcome::Ok("Async Rust uses futures.".to_string()));
    }

    assert!(engine.orchestrator().hot().has(b"kb:async-rust"), "repeated reads should promote all the way into hot");
    let info = engine.orchestrator().hot().get_for_promotion(b"kb:async-rust").unwrap();
    assert!(info.tags.iter().any(|t| t == "knowledge-base"), "promotion must preserve tags");
    assert!(info.remaining_ttl > Duration::from_secs(500), "promotion must preserve remaining ttl");
}

/// Firing an entity/op event that matches a rule's `trigger_events` (here via
/// the universal `data-change` wildcard) cascades through the dependency
/// graph: the directly-tagged entry and its dependent are both removed, for
/// a total of two entries across the rules that fire (spec.md §4.5).
#[tokio::test]
async fn tag_invalidation_cascades_via_on_event() {
    let engine = engine();
    let mut events = engine.orchestrator().events().subscribe();

    engine.set(b"articles:42", "stale summary".into(), None, vec!["database-query".into()]).await;
    engine.invalidation().add_dependency("database-query", "search").unwrap();
    engine.set(b"cached-search-page", "cached search page".into(), None, vec!["search".into()]).await;

    engine.invalidation().on_event("articles", CacheOperation::Update, None);

    let mut total_removed = 0usize;
    let deadline = tokio::time::Instant::now() + Duration::from_millis(300);
    while tokio::time::Instant::now() < deadline {
        if let Ok(Ok(CacheEvent::InvalidationFired { count, .. })) =
            tokio::time::timeout(Duration::from_millis(20), events.recv()).await
        {
            total_removed += count;
        }
        if engine.get(b"articles:42").await == Outcome::Miss && engine.get(b"cached-search-page").await == Outcome::Miss {
            break;
        }
    }

    assert_eq!(engine.get(b"articles:42").await, Outcome::Miss);
    assert_eq!(engine.get(b"cached-search-page").await, Outcome::Miss);
    assert_eq!(total_removed, 2, "cascade should remove exactly the tagged entry and its dependent");
}

/// Fifty concurrent callers racing the same query key share exactly one
/// producer run (spec.md §4.3 single-flight).
#[tokio::test]
async fn fifty_concurrent_callers_share_a_single_producer_run() {
    let engine = Arc::new(engine());
    let query = Arc::new(
        QueryDescriptor::new(QueryKind::Search, "search").with_param("query", serde_json::json!("graph databases")),
    );
    let calls = Arc::new(AtomicU32::new(0));

    let mut handles = Vec::new();
    for _ in 0..50 {
        let engine = engine.clone();
        let query = query.clone();
        let calls = calls.clone();
        handles.push(tokio::spawn(async move {
            engine
                .memoizer()
                .get_or_produce(&query, None, vec![], || {
                    let calls = calls.clone();
                    async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(15)).await;
                        Ok("3 hits".to_string())
                    }
                })
                .await
        }));
    }
    for h in handles {
        assert_eq!(h.await.unwrap().unwrap(), "3 hits");
    }
    assert_eq!(calls.load(Ordering::SeqCst), 1, "only one of the fifty callers should have produced the result");
}

struct FixtureSource;

#[async_trait::async_trait]
impl LoadSource<String> for FixtureSource {
    async fn fetch(&self, offset: usize, limit: usize) -> Result<Vec<String>> {
        Ok((offset..offset + limit).map(|i| format!("row-{i}")).collect())
    }
}

/// A 1000-item load in 100-item windows, up to 4 chunks in flight at once,
/// reports progress exactly once per completed chunk with `loaded`
/// monotonically increasing (spec.md §4.4).
#[tokio::test]
async fn incremental_loader_reports_progress_once_per_chunk() {
    let engine = engine();
    let mut loader_config = engine.config().loader.clone();
    loader_config.max_parallel_chunks = 4;
    let loader = Arc::new(IncrementalLoader::new(engine.orchestrator().clone(), loader_config));

    let request = LoadRequest::new("kb-seed", 1000, 100);
    let loaded_sizes = Arc::new(parking_lot::Mutex::new(Vec::new()));
    let callback_sizes = loaded_sizes.clone();
    let on_progress: ProgressCallback = Arc::new(move |progress| callback_sizes.lock().push(progress.loaded));

    let loaded = loader.load(request, LoadStrategy::Parallel, Arc::new(FixtureSource), Some(on_progress)).await.unwrap();

    assert_eq!(loaded, 1000);
    let sizes = loaded_sizes.lock();
    assert_eq!(sizes.len(), 10, "one progress call per completed chunk, ten 100-item chunks in a 1000-item load");
    assert!(sizes.windows(2).all(|w| w[0] <= w[1]), "loaded size must be monotonically increasing: {sizes:?}");
}

/// Repeatedly inserting past the spillover tier's entry cap under ARC
/// eviction pushes the oldest keys out; re-setting a since-evicted key is
/// re-admitted through the ordinary store path rather than rejected or
/// corrupting later lookups (spec.md §4.1 ARC adaptation).
#[tokio::test]
async fn arc_eviction_re_admits_a_previously_evicted_key() {
    let mut config = EngineConfig::default();
    config.spillover.max_entries = 4;
    let engine = Engine::<String>::new(config).unwrap();
    let spillover = engine.orchestrator().spillover().clone();

    for i in 0..8 {
        spillover.set(format!("k{i}").as_bytes(), format!("v{i}"), None, vec![]);
    }
    assert!(spillover.get(b"k0").is_none(), "k0 should have been evicted once the entry cap was exceeded");
    assert!(spillover.get(b"k7").is_some(), "the most recently written key should still be present");

    assert!(spillover.set(b"k0", "v0-reloaded".to_string(), None, vec![]));
    assert_eq!(spillover.get(b"k0"), Some("v0-reloaded".to_string()));
}

/// When the producer times out, every concurrent waiter sharing its
/// single-flight slot observes the same timeout rather than hanging or
/// silently succeeding (spec.md §4.3).
#[tokio::test]
async fn producer_timeout_propagates_to_every_shared_waiter() {
    let mut config = EngineConfig::default();
    config.memoizer.producer_timeout = Duration::from_millis(15);
    let engine = Arc::new(Engine::<String>::new(config).unwrap());
    let query = Arc::new(QueryDescriptor::new(QueryKind::Search, "slow"));

    let mut handles = Vec::new();
    for _ in 0..5 {
        let engine = engine.clone();
        let query = query.clone();
        handles.push(tokio::spawn(async move {
            engine
                .memoizer()
                .get_or_produce(&query, None, vec![], || async {
                    tokio::time::sleep(Duration::from_millis(200)).await;
                    Ok("late".to_string())
                })
                .await
        }));
    }
    for h in handles {
        let result = h.await.unwrap();
        assert!(matches!(result, Err(CacheError::ProducerTimeout(_))), "every waiter should see the shared timeout");
    }
}
