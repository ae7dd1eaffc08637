//! Incremental/chunked loading: pages an upstream source by offset/limit
//! windows, plans which window to fetch next by priority, caches each
//! fetched chunk so re-requesting an overlapping window is free, and warms
//! every resolved item into the tier hierarchy — with retry, progress/ETA
//! reporting, and cancellation (spec.md §4.4). Grounded on the teacher's
//! async task-pool idiom (`tokio::spawn` + `Semaphore` bounding concurrency,
//! seen throughout its orchestration layer) rather than any single teacher
//! file, since the teacher has no chunked-loading module of its own.

use crate::common::Priority;
use crate::config::{LoaderConfig, TierConfig, TierStrategy};
use crate::error::{CacheError, Result};
use crate::orchestrator::{StrategyContext, TierOrchestrator};
use crate::tier::{Sizeable, TierStore};

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use rand::Rng;
use serde::{de::DeserializeOwned, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct LoadRequest {
    /// Correlates progress/log lines and the chunk cache for one load run.
    pub id: Uuid,
    /// Groups requests for adaptive chunk-size clustering, and forms the
    /// per-item warm key prefix — typically the logical source or query
    /// shape being paged through.
    pub pattern_key: String,
    pub total_size: usize,
    pub chunk_size: usize,
    pub priority: Priority,
    pub ttl: Option<Duration>,
    pub tags: Vec<String>,
}

impl LoadRequest {
    pub fn new(pattern_key: impl Into<String>, total_size: usize, chunk_size: usize) -> Self {
        Self {
            id: Uuid::new_v4(),
            pattern_key: pattern_key.into(),
            total_size,
            chunk_size,
            priority: Priority::Medium,
            ttl: None,
            tags: vec![],
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadStrategy {
    Sequential,
    Parallel,
    Adaptive,
}

#[derive(Debug, Clone)]
pub struct LoadProgress {
    pub loaded: usize,
    pub total: usize,
    pub loaded_chunks: usize,
    pub total_chunks: usize,
    pub percentage: f64,
    pub current_throughput: f64,
    pub eta: Option<Duration>,
}

pub type ProgressCallback = Arc<dyn Fn(LoadProgress) + Send + Sync>;

/// Upstream data source the loader pages through: one offset/limit fetch per
/// window. The cache engine owns chunk planning, retry, chunk-level caching,
/// and warming (spec.md §4.4).
#[async_trait]
pub trait LoadSource<V>: Send + Sync {
    async fn fetch(&self, offset: usize, limit: usize) -> Result<Vec<V>>;
}

#[derive(Default)]
struct ThroughputStats {
    samples: Vec<f64>, // items per second, most recent last
}

impl ThroughputStats {
    fn record(&mut self, items: usize, elapsed: Duration) {
        if elapsed.as_secs_f64() > 0.0 {
            self.samples.push(items as f64 / elapsed.as_secs_f64());
            if self.samples.len() > 20 {
                self.samples.remove(0);
            }
        }
    }

    fn avg(&self) -> Option<f64> {
        if self.samples.is_empty() {
            None
        } else {
            Some(self.samples.iter().sum::<f64>() / self.samples.len() as f64)
        }
    }
}

/// One offset/limit window of a load plan, ordered by priority before
/// execution (spec.md §4.4).
#[derive(Debug, Clone, Copy)]
struct Window {
    index: usize,
    offset: usize,
    limit: usize,
    score: f64,
}

fn plan_windows(total_size: usize, chunk_size: usize, priority: Priority, prioritize: bool) -> Vec<Window> {
    let chunk_size = chunk_size.max(1);
    let count = total_size.div_ceil(chunk_size).max(if total_size == 0 { 0 } else { 1 });
    let mut windows: Vec<Window> = (0..count)
        .map(|index| {
            let offset = index * chunk_size;
            let limit = chunk_size.min(total_size - offset);
            // Early-chunk boost: a small, strictly-decreasing bonus so windows
            // at the same priority still resolve in forward order instead of
            // ties breaking arbitrarily.
            let boost = (count - index) as f64 / (count as f64 * 1000.0).max(1.0);
            let score = priority.base_weight() as f64 + boost;
            Window { index, offset, limit, score }
        })
        .collect();
    if prioritize {
        windows.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
    }
    windows
}

fn chunk_cache_key(request_id: Uuid, offset: usize, limit: usize) -> String {
    format!("{request_id}:{offset}-{limit}")
}

pub struct IncrementalLoader<V> {
    orchestrator: Arc<TierOrchestrator<V>>,
    chunk_cache: Arc<TierStore<Vec<V>>>,
    config: LoaderConfig,
    throughput: Mutex<HashMap<String, ThroughputStats>>,
    cancellations: DashMap<Uuid, Arc<AtomicBool>>,
}

impl<V> IncrementalLoader<V>
where
    V: Clone + Send + Sync + Sizeable + Serialize + DeserializeOwned + 'static,
{
    pub fn new(orchestrator: Arc<TierOrchestrator<V>>, config: LoaderConfig) -> Self {
        let chunk_cache_config = TierConfig {
            name: "loader-chunk-cache".into(),
            eviction: crate::tier::eviction::EvictionKind::Lru,
            max_entries: config.chunk_cache_max_entries,
            max_memory_bytes: config.chunk_cache_max_memory_bytes,
            default_ttl_secs: config.chunk_cache_ttl.as_secs().max(1),
            strategy: TierStrategy::Always,
            frequency_half_life_secs: crate::config::DEFAULT_FREQUENCY_HALF_LIFE_SECS,
        };
        Self {
            orchestrator,
            chunk_cache: Arc::new(TierStore::new(chunk_cache_config)),
            config,
            throughput: Mutex::new(HashMap::new()),
            cancellations: DashMap::new(),
        }
    }

    fn chunk_size_for(&self, pattern_key: &str, requested: usize, strategy: LoadStrategy) -> usize {
        if strategy != LoadStrategy::Adaptive || !self.config.enable_adaptive_chunking {
            return requested;
        }
        let throughput = self.throughput.lock();
        match throughput.get(pattern_key).and_then(ThroughputStats::avg) {
            // Scale the requested chunk size by observed throughput relative
            // to a 100 items/sec reference point, clamped to a sane band.
            Some(avg) => {
                let scaled = (requested as f64 * (avg / 100.0).max(0.1)) as usize;
                scaled.clamp(requested / 4, requested * 4).max(1)
            }
            None => requested,
        }
    }

    /// Fetch `offset..offset+limit` through the chunk cache: a hit skips the
    /// source entirely, a miss fetches (under `fetch_timeout`), writes the
    /// chunk cache, and returns the items.
    async fn fetch_chunk(
        &self,
        request_id: Uuid,
        offset: usize,
        limit: usize,
        source: &Arc<dyn LoadSource<V>>,
    ) -> Result<Vec<V>> {
        let cache_key = chunk_cache_key(request_id, offset, limit);
        if let Some(items) = self.chunk_cache.get(cache_key.as_bytes()) {
            return Ok(items);
        }
        let items = tokio::time::timeout(self.config.fetch_timeout, source.fetch(offset, limit))
            .await
            .map_err(|_| CacheError::ProducerTimeout(self.config.fetch_timeout))??;
        self.chunk_cache.set(cache_key.as_bytes(), items.clone(), Some(self.config.chunk_cache_ttl), vec![]);
        Ok(items)
    }

    async fn fetch_chunk_with_retry(
        &self,
        request_id: Uuid,
        offset: usize,
        limit: usize,
        source: &Arc<dyn LoadSource<V>>,
    ) -> Result<Vec<V>> {
        let mut attempt = 0u32;
        loop {
            match self.fetch_chunk(request_id, offset, limit, source).await {
                Ok(items) => return Ok(items),
                Err(e) if attempt < self.config.max_retries => {
                    let base = (self.config.base_backoff * 2u32.pow(attempt)).min(self.config.max_backoff);
                    // Full jitter: spreads retries from many simultaneously-failing
                    // chunks instead of having them all wake up in lockstep.
                    let jittered =
                        Duration::from_secs_f64(rand::rng().random_range(0.0..=base.as_secs_f64().max(0.001)));
                    tracing::debug!(attempt, ?jittered, error = %e, "load chunk failed, retrying");
                    tokio::time::sleep(jittered).await;
                    attempt += 1;
                }
                Err(e) => return Err(CacheError::ProducerFailed(e.to_string())),
            }
        }
    }

    async fn warm_items(&self, pattern_key: &str, offset: usize, items: &[V], ttl: Option<Duration>, tags: &[String]) {
        for (i, value) in items.iter().enumerate() {
            let key = format!("{pattern_key}:{}", offset + i);
            self.orchestrator
                .set_with_context(key.as_bytes(), value.clone(), ttl, tags.to_vec(), StrategyContext::default())
                .await;
        }
    }

    /// Page through `request.total_size` in `request.chunk_size` windows
    /// (scaled adaptively when `strategy` is `Adaptive`), warming each
    /// resolved item into the tier hierarchy. Returns the count of items
    /// actually loaded (a cancelled or partially-failed run returns what it
    /// managed).
    pub async fn load(
        &self,
        request: LoadRequest,
        strategy: LoadStrategy,
        source: Arc<dyn LoadSource<V>>,
        on_progress: Option<ProgressCallback>,
    ) -> Result<usize> {
        let cancel = Arc::new(AtomicBool::new(false));
        self.cancellations.insert(request.id, cancel.clone());

        let chunk_size = self.chunk_size_for(&request.pattern_key, request.chunk_size, strategy);
        let windows = plan_windows(request.total_size, chunk_size, request.priority, self.config.enable_prioritization);
        let total_chunks = windows.len();
        let loaded = Arc::new(AtomicUsize::new(0));
        let loaded_chunks = Arc::new(AtomicUsize::new(0));
        let started = Instant::now();
        let total = request.total_size;

        let report = |loaded_now: usize, chunks_now: usize| {
            if let Some(cb) = &on_progress {
                let elapsed = started.elapsed().as_secs_f64().max(0.001);
                let throughput = loaded_now as f64 / elapsed;
                let eta = if loaded_now > 0 {
                    let remaining = total.saturating_sub(loaded_now);
                    Some(Duration::from_secs_f64(remaining as f64 / throughput.max(0.001)))
                } else {
                    None
                };
                let percentage = if total_chunks == 0 { 100.0 } else { chunks_now as f64 / total_chunks as f64 * 100.0 };
                cb(LoadProgress {
                    loaded: loaded_now,
                    total,
                    loaded_chunks: chunks_now,
                    total_chunks,
                    percentage,
                    current_throughput: throughput,
                    eta,
                });
            }
        };

        match strategy {
            LoadStrategy::Sequential => {
                for window in &windows {
                    if cancel.load(Ordering::Relaxed) {
                        break;
                    }
                    let items = self.fetch_chunk_with_retry(request.id, window.offset, window.limit, &source).await?;
                    self.warm_items(&request.pattern_key, window.offset, &items, request.ttl, &request.tags).await;
                    let now = loaded.fetch_add(items.len(), Ordering::Relaxed) + items.len();
                    let chunks_now = loaded_chunks.fetch_add(1, Ordering::Relaxed) + 1;
                    report(now, chunks_now);
                }
            }
            LoadStrategy::Parallel | LoadStrategy::Adaptive => {
                let semaphore = Arc::new(Semaphore::new(self.config.max_parallel_chunks));
                let mut handles = Vec::new();
                for window in windows.clone() {
                    if cancel.load(Ordering::Relaxed) {
                        break;
                    }
                    let permit = semaphore.clone().acquire_owned().await.expect("semaphore not closed");
                    let source = source.clone();
                    let cancel = cancel.clone();
                    let loaded = loaded.clone();
                    let loaded_chunks = loaded_chunks.clone();
                    let pattern_key = request.pattern_key.clone();
                    let tags = request.tags.clone();
                    let ttl = request.ttl;
                    let request_id = request.id;
                    let max_retries = self.config.max_retries;
                    let base_backoff = self.config.base_backoff;
                    let max_backoff = self.config.max_backoff;
                    let orchestrator = self.orchestrator.clone();
                    let chunk_cache = self.chunk_cache.clone();
                    let fetch_timeout = self.config.fetch_timeout;
                    handles.push(tokio::spawn(async move {
                        let _permit = permit;
                        if cancel.load(Ordering::Relaxed) {
                            return 0;
                        }
                        let items = fetch_chunk_with_retry_standalone(
                            request_id,
                            window.offset,
                            window.limit,
                            &source,
                            &chunk_cache,
                            fetch_timeout,
                            max_retries,
                            base_backoff,
                            max_backoff,
                        )
                        .await
                        .unwrap_or_default();
                        for (i, value) in items.iter().enumerate() {
                            let key = format!("{pattern_key}:{}", window.offset + i);
                            orchestrator
                                .set_with_context(key.as_bytes(), value.clone(), ttl, tags.clone(), StrategyContext::default())
                                .await;
                        }
                        loaded.fetch_add(items.len(), Ordering::Relaxed);
                        loaded_chunks.fetch_add(1, Ordering::Relaxed);
                        items.len()
                    }));
                }
                // Drain handles in actual completion order (not spawn order)
                // so progress/ETA reflect real throughput under concurrency.
                let mut pending: futures::stream::FuturesUnordered<_> = handles.into_iter().collect();
                while futures::StreamExt::next(&mut pending).await.is_some() {
                    report(loaded.load(Ordering::Relaxed), loaded_chunks.load(Ordering::Relaxed));
                }
            }
        }

        self.cancellations.remove(&request.id);
        let final_count = loaded.load(Ordering::Relaxed);
        self.throughput.lock().entry(request.pattern_key.clone()).or_default().record(final_count, started.elapsed());
        Ok(final_count)
    }

    /// Request cancellation of an in-flight load by its request id. Returns
    /// `false` if no load with that id is currently running.
    pub fn cancel_load(&self, request_id: Uuid) -> bool {
        match self.cancellations.get(&request_id) {
            Some(flag) => {
                flag.store(true, Ordering::Relaxed);
                true
            }
            None => false,
        }
    }

    /// Best-effort background warm of specific `(offset, limit)` windows,
    /// distinct from a full `load` run: no progress callback, no
    /// cancellation, failures are logged rather than propagated (spec.md
    /// §4.4 prefetch/preload).
    pub fn preload(
        self: &Arc<Self>,
        request_id: Uuid,
        pattern_key: impl Into<String>,
        chunk_ids: Vec<(usize, usize)>,
        ttl: Option<Duration>,
        tags: Vec<String>,
        source: Arc<dyn LoadSource<V>>,
    ) {
        let this = self.clone();
        let pattern_key = pattern_key.into();
        tokio::spawn(async move {
            for (offset, limit) in chunk_ids {
                match this.fetch_chunk_with_retry(request_id, offset, limit, &source).await {
                    Ok(items) => this.warm_items(&pattern_key, offset, &items, ttl, &tags).await,
                    Err(e) => tracing::warn!(error = %e, offset, limit, "preload chunk failed"),
                }
            }
        });
    }
}

#[allow(clippy::too_many_arguments)]
async fn fetch_chunk_with_retry_standalone<V>(
    request_id: Uuid,
    offset: usize,
    limit: usize,
    source: &Arc<dyn LoadSource<V>>,
    chunk_cache: &Arc<TierStore<Vec<V>>>,
    fetch_timeout: Duration,
    max_retries: u32,
    base_backoff: Duration,
    max_backoff: Duration,
) -> Result<Vec<V>>
where
    V: Clone + Send + Sync + Sizeable + 'static,
{
    let cache_key = chunk_cache_key(request_id, offset, limit);
    if let Some(items) = chunk_cache.get(cache_key.as_bytes()) {
        return Ok(items);
    }
    let mut attempt = 0u32;
    loop {
        let attempt_result = tokio::time::timeout(fetch_timeout, source.fetch(offset, limit)).await;
        match attempt_result {
            Ok(Ok(items)) => {
                chunk_cache.set(cache_key.as_bytes(), items.clone(), None, vec![]);
                return Ok(items);
            }
            Ok(Err(e)) if attempt < max_retries => {
                let base = (base_backoff * 2u32.pow(attempt)).min(max_backoff);
                let jittered = Duration::from_secs_f64(rand::rng().random_range(0.0..=base.as_secs_f64().max(0.001)));
                tracing::debug!(attempt, ?jittered, error = %e, "load chunk failed, retrying");
                tokio::time::sleep(jittered).await;
                attempt += 1;
            }
            Ok(Err(e)) => return Err(CacheError::ProducerFailed(e.to_string())),
            Err(_) if attempt < max_retries => {
                attempt += 1;
                tokio::time::sleep(base_backoff).await;
            }
            Err(_) => return Err(CacheError::ProducerTimeout(fetch_timeout)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::event::{AccessStream, EventChannel};
    use crate::config::EngineConfig;
    use std::sync::atomic::AtomicU32;

    struct CountingSource {
        calls: AtomicU32,
        fail_first: bool,
    }

    #[async_trait]
    impl LoadSource<String> for CountingSource {
        async fn fetch(&self, offset: usize, limit: usize) -> Result<Vec<String>> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail_first && n == 0 {
                return Err(CacheError::Other("transient".into()));
            }
            Ok((offset..offset + limit).map(|i| format!("v{i}")).collect())
        }
    }

    fn loader() -> Arc<IncrementalLoader<String>> {
        let config = EngineConfig::default();
        let orch = Arc::new(TierOrchestrator::new(
            &config,
            None,
            Arc::new(EventChannel::default()),
            Arc::new(AccessStream::default()),
        ));
        Arc::new(IncrementalLoader::new(orch, LoaderConfig { default_chunk_size: 4, ..Default::default() }))
    }

    #[tokio::test]
    async fn sequential_load_warms_all_items() {
        let loader = loader();
        let request = LoadRequest::new("seed", 10, 4);
        let source = Arc::new(CountingSource { calls: AtomicU32::new(0), fail_first: false });
        let n = loader.load(request, LoadStrategy::Sequential, source, None).await.unwrap();
        assert_eq!(n, 10);
        assert_eq!(loader.orchestrator.get(b"seed:0").await, crate::common::Outcome::Ok("v0".to_string()));
    }

    #[tokio::test]
    async fn parallel_load_warms_all_items() {
        let loader = loader();
        let request = LoadRequest::new("seed", 20, 4);
        let source = Arc::new(CountingSource { calls: AtomicU32::new(0), fail_first: false });
        let n = loader.load(request, LoadStrategy::Parallel, source, None).await.unwrap();
        assert_eq!(n, 20);
    }

    #[tokio::test]
    async fn transient_failure_is_retried() {
        let loader = loader();
        let request = LoadRequest::new("seed", 4, 4);
        let source = Arc::new(CountingSource { calls: AtomicU32::new(0), fail_first: true });
        let n = loader.load(request, LoadStrategy::Sequential, source, None).await.unwrap();
        assert_eq!(n, 4);
    }

    #[tokio::test]
    async fn cancel_load_stops_sequential_run_early() {
        let loader = loader();
        let request = LoadRequest::new("seed", 100, 4);
        let request_id = request.id;
        let source = Arc::new(CountingSource { calls: AtomicU32::new(0), fail_first: false });
        let handle = {
            let loader = loader.clone();
            tokio::spawn(async move { loader.load(request, LoadStrategy::Sequential, source, None).await })
        };
        loader.cancel_load(request_id);
        let n = handle.await.unwrap().unwrap();
        assert!(n < 100);
    }

    #[tokio::test]
    async fn repeated_window_is_served_from_the_chunk_cache() {
        let loader = loader();
        let source = Arc::new(CountingSource { calls: AtomicU32::new(0), fail_first: false });
        let first = loader.fetch_chunk(Uuid::nil(), 0, 4, &(source.clone() as Arc<dyn LoadSource<String>>)).await.unwrap();
        let calls_after_first = source.calls.load(Ordering::SeqCst);
        let second = loader.fetch_chunk(Uuid::nil(), 0, 4, &(source.clone() as Arc<dyn LoadSource<String>>)).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(source.calls.load(Ordering::SeqCst), calls_after_first);
    }

    #[test]
    fn priority_windows_sort_highest_score_first() {
        let windows = plan_windows(40, 10, Priority::Critical, true);
        assert_eq!(windows.len(), 4);
        assert!(windows.windows(2).all(|w| w[0].score >= w[1].score));
    }

    #[test]
    fn unprioritized_windows_stay_in_forward_order() {
        let windows = plan_windows(40, 10, Priority::Critical, false);
        let offsets: Vec<usize> = windows.iter().map(|w| w.offset).collect();
        assert_eq!(offsets, vec![0, 10, 20, 30]);
    }
}
