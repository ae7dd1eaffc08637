// Thin demonstration binary, grounded on the teacher's `main.rs` startup
// sequence (tracing init, config load, component summary) but scoped to a
// single end-to-end pass through the cache engine instead of a full server.

use kbcache_engine::{common::event::QueryKind, common::Outcome, memoizer::QueryDescriptor, Engine, EngineConfig, Result};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt().with_target(false).with_thread_ids(true).with_level(true).init();

    let config = EngineConfig::default();
    tracing::info!(
        hot_capacity = config.hot.max_entries,
        warm_capacity = config.warm.max_entries,
        spillover_capacity = config.spillover.max_entries,
        "starting kbcache-engine demo"
    );

    let engine: Engine<String> = Engine::new(config)?;
    engine.start_background_tasks();

    engine.set(b"kb:rust-ownership", "Rust tracks ownership at compile time.".into(), None, vec!["knowledge-base".into()]).await;

    match engine.get(b"kb:rust-ownership").await {
        Outcome::Ok(value) => tracing::info!(%value, "direct get hit"),
        other => tracing::warn!(?other, "unexpected outcome"),
    }

    let memoizer = engine.memoizer().clone();
    let query = QueryDescriptor::new(QueryKind::Search, "search").with_param("query", serde_json::json!("rust ownership"));
    let result = memoizer
        .get_or_produce(&query, None, vec!["search".into()], || async {
            tracing::info!("producing a fresh search result (first caller only)");
            Ok("3 results for 'rust ownership'".to_string())
        })
        .await?;
    tracing::info!(%result, "memoized search result");

    let invalidated = engine.invalidation().invalidate_by_pattern("kb:", "demo");
    tracing::info!(invalidated, "ran knowledge-base invalidation rule");

    let stats = engine.orchestrator().hot().stats();
    tracing::info!(summary = %stats.summary(), "hot tier stats");

    Ok(())
}
