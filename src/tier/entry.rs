// Generic cache entry, grounded on the teacher's `cache::query_cache::CacheEntry`
// (timestamps, TTL, access accounting) but with an opaque payload `V` in place of
// the teacher's fixed `QueryResult`, and a tag set in place of table dependencies
// (spec.md §3).

use std::sync::Arc;
use std::time::{Duration, Instant};

/// Byte-size estimator for opaque cache payloads. Tiers need an approximate size
/// to enforce their memory budget without knowing the concrete value type
/// (spec.md §3, generalizing the teacher's per-`Value`-variant match in
/// `CacheEntry::estimate_memory_size`).
pub trait Sizeable {
    fn estimated_size(&self) -> usize;
}

impl Sizeable for Vec<u8> {
    fn estimated_size(&self) -> usize {
        self.len() + 24
    }
}

impl Sizeable for String {
    fn estimated_size(&self) -> usize {
        self.len() + 24
    }
}

impl Sizeable for serde_json::Value {
    fn estimated_size(&self) -> usize {
        // Cheap approximation: re-serializing the whole value on every size check
        // would be wasteful, so fall back to the compact string length.
        serde_json::to_string(self).map(|s| s.len()).unwrap_or(64) + 32
    }
}

/// Generalizes per-element `Sizeable` into the loader's chunk cache, which
/// stores `Vec<V>` batches rather than single values (spec.md §4.4).
impl<T: Sizeable> Sizeable for Vec<T> {
    fn estimated_size(&self) -> usize {
        self.iter().map(Sizeable::estimated_size).sum::<usize>() + 24
    }
}

#[derive(Debug, Clone)]
pub struct CacheEntry<V> {
    pub value: V,
    pub created_at: Instant,
    pub last_access_at: Instant,
    pub access_count: u64,
    pub frequency_score: f64,
    pub ttl: Duration,
    pub size_bytes: usize,
    pub tags: Vec<Arc<str>>,
    /// Producer-supplied version, used by the invalidation controller's
    /// dependency graph to tell stale writers from current ones.
    pub version: u64,
}

impl<V> CacheEntry<V> {
    pub fn new(value: V, ttl: Duration, size_bytes: usize, tags: Vec<Arc<str>>) -> Self {
        let now = Instant::now();
        Self {
            value,
            created_at: now,
            last_access_at: now,
            access_count: 1,
            frequency_score: 1.0,
            ttl,
            size_bytes,
            tags,
            version: 0,
        }
    }

    pub fn is_expired(&self) -> bool {
        self.created_at.elapsed() > self.ttl
    }

    pub fn has_tag(&self, tag: &str) -> bool {
        self.tags.iter().any(|t| t.as_ref() == tag)
    }

    pub fn remaining_ttl(&self) -> Duration {
        self.ttl.saturating_sub(self.created_at.elapsed())
    }

    /// Record an access: bumps the counter, decays the frequency score towards
    /// the current reference, and moves the recency clock forward. `half_life`
    /// comes from the owning tier's `TierConfig` (spec.md §3, configurable per
    /// tier rather than a single global constant).
    pub fn touch(&mut self, half_life: Duration) {
        let now = Instant::now();
        let dt = now.duration_since(self.last_access_at).as_secs_f64();
        let decay = (-dt / half_life.as_secs_f64().max(f64::MIN_POSITIVE)).exp();
        self.frequency_score = self.frequency_score * decay + 1.0;
        self.access_count += 1;
        self.last_access_at = now;
    }
}
