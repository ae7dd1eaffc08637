//! Query memoization: canonicalizes a structured query into a stable cache
//! key and de-duplicates concurrent producers for the same key (spec.md
//! §4.3), grounded on the teacher's `cache::query_cache::CacheKey` hashing
//! step but replacing its SHA-256-of-SQL-string approach with the
//! BLAKE3-based canonical hash the spec calls for, and the teacher's
//! `dashmap`-backed concurrent-map idiom for the single-flight table.

use crate::common::event::QueryKind;
use crate::common::Priority;
use crate::config::MemoizerConfig;
use crate::error::{CacheError, Result};
use crate::orchestrator::{StrategyContext, TierOrchestrator};
use crate::tier::Sizeable;

use dashmap::DashMap;
use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value as Json;
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Notify;

fn kind_name(kind: QueryKind) -> &'static str {
    match kind {
        QueryKind::Search => "search",
        QueryKind::Database => "database",
        QueryKind::Api => "api",
        QueryKind::Generic => "generic",
    }
}

/// A structured query before canonicalization. Field order and string case
/// don't affect the resulting key (spec.md §4.3).
#[derive(Debug, Clone)]
pub struct QueryDescriptor {
    pub kind: QueryKind,
    pub operation: String,
    pub params: BTreeMap<String, Json>,
    pub version: String,
}

impl QueryDescriptor {
    pub fn new(kind: QueryKind, operation: impl Into<String>) -> Self {
        Self { kind, operation: operation.into(), params: BTreeMap::new(), version: "1".into() }
    }

    pub fn with_param(mut self, key: impl Into<String>, value: Json) -> Self {
        self.params.insert(key.into(), canonicalize_value(value));
        self
    }

    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = version.into();
        self
    }

    /// Stable, filesystem/log-safe cache key: `query:<kind>:<operation>:<hash>:<version>`,
    /// where `<hash>` is the BLAKE3 digest of the canonical JSON params,
    /// truncated to 16 base32 characters (spec.md §4.3).
    pub fn cache_key(&self) -> String {
        let canonical = serde_json::json!({
            "op": self.operation.to_ascii_lowercase(),
            "params": &self.params,
        });
        let bytes = serde_json::to_vec(&canonical).expect("json values are always serializable");
        let hash = blake3::hash(&bytes);
        format!(
            "query:{}:{}:{}:{}",
            kind_name(self.kind),
            self.operation.to_ascii_lowercase(),
            base32_16(hash.as_bytes()),
            self.version,
        )
    }

    /// Standard tags every memoized result carries, ahead of any caller tags:
    /// `query`, `query-kind:<kind>`, `query-op:<operation>`, and the compound
    /// `query-kind-op:<kind>:<operation>` that lets `invalidate_queries`
    /// narrow by both dimensions at once (spec.md §4.3).
    fn standard_tags(&self) -> Vec<String> {
        let kind = kind_name(self.kind);
        let op = self.operation.to_ascii_lowercase();
        vec![
            "query".to_string(),
            format!("query-kind:{kind}"),
            format!("query-op:{op}"),
            format!("query-kind-op:{kind}:{op}"),
        ]
    }
}

fn canonicalize_value(value: Json) -> Json {
    match value {
        Json::String(s) => Json::String(s.to_ascii_lowercase()),
        Json::Array(items) => Json::Array(items.into_iter().map(canonicalize_value).collect()),
        Json::Object(map) => {
            let sorted: BTreeMap<String, Json> =
                map.into_iter().map(|(k, v)| (k.to_ascii_lowercase(), canonicalize_value(v))).collect();
            serde_json::to_value(sorted).unwrap_or(Json::Null)
        }
        other => other,
    }
}

const BASE32_ALPHABET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ234567";

fn base32_16(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(16);
    let mut buffer: u32 = 0;
    let mut bits = 0u32;
    for &byte in bytes {
        buffer = (buffer << 8) | byte as u32;
        bits += 8;
        while bits >= 5 && out.len() < 16 {
            bits -= 5;
            let idx = (buffer >> bits) & 0x1F;
            out.push(BASE32_ALPHABET[idx as usize] as char);
        }
        if out.len() >= 16 {
            break;
        }
    }
    out
}

/// Optional kind/operation narrowing for `QueryMemoizer::invalidate_queries`
/// (spec.md §4.3). Both absent invalidates every memoized query.
#[derive(Debug, Clone, Default)]
pub struct QueryFilter {
    pub kind: Option<QueryKind>,
    pub operation: Option<String>,
}

/// Per-key hit/latency/savings accounting (spec.md §4.3 per-key metrics).
#[derive(Debug, Clone, Default)]
pub struct QueryMetrics {
    pub hit_count: u64,
    pub retrieval_latency_total: Duration,
    pub producer_runs: u64,
    pub producer_latency_total: Duration,
    pub last_value_size_bytes: usize,
}

impl QueryMetrics {
    pub fn avg_retrieval_latency(&self) -> Duration {
        if self.hit_count == 0 {
            Duration::ZERO
        } else {
            self.retrieval_latency_total / self.hit_count as u32
        }
    }

    pub fn avg_producer_latency(&self) -> Duration {
        if self.producer_runs == 0 {
            Duration::ZERO
        } else {
            self.producer_latency_total / self.producer_runs as u32
        }
    }

    /// Rough estimate of bytes worth of producer work avoided: the last
    /// cached payload size times the number of hits it served.
    pub fn approx_bytes_saved(&self) -> usize {
        self.last_value_size_bytes.saturating_mul(self.hit_count as usize)
    }
}

/// De-duplicates concurrent producers racing for the same key and stores
/// results through a `TierOrchestrator`. Only one producer runs per key at a
/// time; latecomers wait on the in-flight one instead of repeating the work
/// (spec.md §4.3 single-flight).
pub struct QueryMemoizer<V> {
    orchestrator: Arc<TierOrchestrator<V>>,
    in_flight: DashMap<String, Arc<Notify>>,
    metrics: DashMap<String, QueryMetrics>,
    config: MemoizerConfig,
}

impl<V> QueryMemoizer<V>
where
    V: Clone + Send + Sync + Sizeable + Serialize + DeserializeOwned + 'static,
{
    pub fn new(orchestrator: Arc<TierOrchestrator<V>>, config: MemoizerConfig) -> Self {
        Self { orchestrator, in_flight: DashMap::new(), metrics: DashMap::new(), config }
    }

    /// Resolve `query`, running `produce` at most once across all concurrent
    /// callers sharing its cache key.
    pub async fn get_or_produce<F, Fut>(
        &self,
        query: &QueryDescriptor,
        ttl: Option<Duration>,
        tags: Vec<String>,
        produce: F,
    ) -> Result<V>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V>>,
    {
        let key = query.cache_key();
        let mut all_tags = query.standard_tags();
        all_tags.extend(tags);

        let lookup_start = Instant::now();
        if let crate::common::Outcome::Ok(v) = self.orchestrator.get(key.as_bytes()).await {
            self.record_hit(&key, lookup_start.elapsed());
            return Ok(v);
        }

        loop {
            let mut became_producer = false;
            let notify = match self.in_flight.entry(key.clone()) {
                dashmap::mapref::entry::Entry::Occupied(existing) => existing.get().clone(),
                dashmap::mapref::entry::Entry::Vacant(slot) => {
                    let n = Arc::new(Notify::new());
                    slot.insert(n.clone());
                    became_producer = true;
                    n
                }
            };

            if became_producer {
                let producer_start = Instant::now();
                let result = tokio::time::timeout(self.config.producer_timeout, produce()).await;
                let outcome = match result {
                    Ok(Ok(value)) => {
                        let size = value.estimated_size();
                        self.orchestrator
                            .set_with_context(
                                key.as_bytes(),
                                value.clone(),
                                ttl,
                                all_tags.clone(),
                                StrategyContext { cost_ms: producer_start.elapsed().as_millis() as u64, hit_count: 0 },
                            )
                            .await;
                        self.record_producer_run(&key, producer_start.elapsed(), size);
                        Ok(value)
                    }
                    Ok(Err(e)) => Err(e),
                    Err(_) => Err(CacheError::ProducerTimeout(self.config.producer_timeout)),
                };
                self.in_flight.remove(&key);
                notify.notify_waiters();
                return outcome;
            }

            // Not the producer. Register for the wakeup before checking
            // whether the producer already finished, so a `notify_waiters`
            // call racing with this check can never be missed: `enable`
            // makes registration and the recheck atomic with respect to it.
            // Without this ordering, a producer that finishes (and calls
            // `notify_waiters`) between our `entry()` lookup and a bare
            // `notify.notified().await` would leave us waiting on a
            // notification that already fired and is never coming again.
            let notified = notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.in_flight.contains_key(&key) {
                notified.await;
            }
            let wait_start = Instant::now();
            if let crate::common::Outcome::Ok(v) = self.orchestrator.get(key.as_bytes()).await {
                self.record_hit(&key, wait_start.elapsed());
                return Ok(v);
            }
            // Producer failed; loop to either retry as producer or observe a
            // fresh in-flight slot from a new caller.
        }
    }

    fn record_hit(&self, key: &str, latency: Duration) {
        let mut m = self.metrics.entry(key.to_string()).or_default();
        m.hit_count += 1;
        m.retrieval_latency_total += latency;
    }

    fn record_producer_run(&self, key: &str, latency: Duration, size_bytes: usize) {
        let mut m = self.metrics.entry(key.to_string()).or_default();
        m.producer_runs += 1;
        m.producer_latency_total += latency;
        m.last_value_size_bytes = size_bytes;
    }

    pub fn metrics_for(&self, cache_key: &str) -> Option<QueryMetrics> {
        self.metrics.get(cache_key).map(|m| m.clone())
    }

    pub fn metrics_snapshot(&self) -> Vec<(String, QueryMetrics)> {
        self.metrics.iter().map(|e| (e.key().clone(), e.value().clone())).collect()
    }

    /// Invalidate memoized queries matching `filter`. Both fields absent
    /// invalidates every memoized query (spec.md §4.3).
    pub fn invalidate_queries(&self, filter: QueryFilter) -> usize {
        let tag = match (filter.kind, filter.operation.as_deref()) {
            (Some(kind), Some(op)) => format!("query-kind-op:{}:{}", kind_name(kind), op.to_ascii_lowercase()),
            (Some(kind), None) => format!("query-kind:{}", kind_name(kind)),
            (None, Some(op)) => format!("query-op:{}", op.to_ascii_lowercase()),
            (None, None) => "query".to_string(),
        };
        self.orchestrator.invalidate_by_tag(&tag)
    }

    pub fn in_flight_count(&self) -> usize {
        self.in_flight.len()
    }
}

/// Priority hint a caller can attach when producing on a cache miss, read by
/// the incremental loader when the producer itself issues load requests
/// (spec.md §4.3/§4.4 boundary).
pub fn default_priority() -> Priority {
    Priority::Medium
}
