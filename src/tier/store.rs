// Single-tier store, grounded on the teacher's `cache::query_cache::QueryCache`
// (lock-minimal `HashMap` + recency structure, `get`/`put`/`invalidate_table`
// shape) generalized to an opaque payload and pluggable eviction policy
// (spec.md §4.1).

use crate::common::{Component, HealthStatus};
use crate::config::TierConfig;
use crate::error::{CacheError, Result};
use crate::tier::entry::{CacheEntry, Sizeable};
use crate::tier::eviction::{make_eviction, EntryMeta, EvictionPolicy};
use crate::tier::stats::{EvictionReason, TierStats, TierStatsSnapshot};

use parking_lot::RwLock;
use regex::Regex;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Key-matching predicate used by `TierStore::keys_matching` and the
/// invalidation controller's pattern rules (spec.md §4.5).
pub enum KeyPattern {
    Prefix(String),
    Regex(Regex),
}

impl KeyPattern {
    pub fn matches(&self, key: &[u8]) -> bool {
        let s = String::from_utf8_lossy(key);
        match self {
            KeyPattern::Prefix(p) => s.starts_with(p.as_str()),
            KeyPattern::Regex(r) => r.is_match(&s),
        }
    }
}

struct Inner<V> {
    entries: HashMap<Box<[u8]>, CacheEntry<V>>,
    tag_index: HashMap<Arc<str>, HashSet<Box<[u8]>>>,
    eviction: Box<dyn EvictionPolicy>,
}

impl<V> Inner<V> {
    fn meta_snapshot(&self) -> HashMap<Box<[u8]>, EntryMeta> {
        self.entries
            .iter()
            .map(|(k, e)| {
                (
                    k.clone(),
                    EntryMeta {
                        last_access: e.last_access_at,
                        frequency_score: e.frequency_score,
                    },
                )
            })
            .collect()
    }

    fn unindex_tags(&mut self, key: &[u8], tags: &[Arc<str>]) {
        for tag in tags {
            if let Some(set) = self.tag_index.get_mut(tag) {
                set.remove(key);
                if set.is_empty() {
                    self.tag_index.remove(tag);
                }
            }
        }
    }

    fn remove_entry(&mut self, key: &[u8]) -> Option<CacheEntry<V>> {
        let entry = self.entries.remove(key)?;
        self.unindex_tags(key, &entry.tags);
        self.eviction.on_remove(key);
        Some(entry)
    }
}

/// Everything a colder-tier hit needs to carry forward when promoted into a
/// warmer tier: the value itself, plus the source entry's tags and
/// remaining TTL so promotion never silently resets either (spec.md §4.2).
pub struct PromotionInfo<V> {
    pub value: V,
    pub tags: Vec<String>,
    pub remaining_ttl: Duration,
    pub access_count: u64,
}

/// A single tier of the cache hierarchy: one eviction policy, one memory
/// budget, one set of entries. `TierOrchestrator` composes several of these
/// into the L0/L1/L2 hierarchy (spec.md §4.2).
pub struct TierStore<V> {
    config: TierConfig,
    inner: RwLock<Inner<V>>,
    stats: RwLock<TierStats>,
    current_memory_bytes: AtomicUsize,
}

impl<V: Clone + Send + Sync + Sizeable + 'static> TierStore<V> {
    pub fn new(config: TierConfig) -> Self {
        let eviction = make_eviction(config.eviction, config.max_entries);
        Self {
            inner: RwLock::new(Inner {
                entries: HashMap::new(),
                tag_index: HashMap::new(),
                eviction,
            }),
            stats: RwLock::new(TierStats::default()),
            current_memory_bytes: AtomicUsize::new(0),
            config,
        }
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn config(&self) -> &TierConfig {
        &self.config
    }

    pub fn get(&self, key: &[u8]) -> Option<V> {
        self.get_for_promotion(key).map(|info| info.value)
    }

    /// Same lookup as `get`, but surfaces the tags, remaining TTL and access
    /// count a promotion into a warmer tier needs to preserve (spec.md §4.2 —
    /// promotion must not discard tags or reset TTL).
    pub fn get_for_promotion(&self, key: &[u8]) -> Option<PromotionInfo<V>> {
        let start = std::time::Instant::now();
        let mut inner = self.inner.write();
        let expired = matches!(inner.entries.get(key), Some(e) if e.is_expired());
        if expired {
            if let Some(entry) = inner.remove_entry(key) {
                self.current_memory_bytes.fetch_sub(entry.size_bytes, Ordering::Relaxed);
                let entries = inner.entries.len();
                self.stats.write().record_eviction(EvictionReason::Expired, entry.size_bytes, entries);
            }
            self.stats.write().record_miss();
            return None;
        }
        let half_life = self.config.half_life();
        match inner.entries.get_mut(key) {
            Some(entry) => {
                entry.touch(half_life);
                let info = PromotionInfo {
                    value: entry.value.clone(),
                    tags: entry.tags.iter().map(|t| t.to_string()).collect(),
                    remaining_ttl: entry.remaining_ttl(),
                    access_count: entry.access_count,
                };
                inner.eviction.on_access(key);
                self.stats.write().record_hit(start.elapsed());
                Some(info)
            }
            None => {
                self.stats.write().record_miss();
                None
            }
        }
    }

    pub fn has(&self, key: &[u8]) -> bool {
        let inner = self.inner.read();
        matches!(inner.entries.get(key), Some(e) if !e.is_expired())
    }

    /// Insert or overwrite. Returns `false` (rejected) when a single entry
    /// exceeds the tier's entire memory budget — spec.md §4.1 boundary case.
    pub fn set(&self, key: &[u8], value: V, ttl: Option<Duration>, tags: Vec<String>) -> bool {
        let size = value.estimated_size();
        if size > self.config.max_memory_bytes {
            self.stats.write().record_rejected();
            return false;
        }
        let ttl = ttl.unwrap_or_else(|| self.config.default_ttl());
        let tags: Vec<Arc<str>> = tags.into_iter().map(Arc::from).collect();

        let mut inner = self.inner.write();
        let previous_size = inner.entries.get(key).map(|e| e.size_bytes).unwrap_or(0);
        let is_new = !inner.entries.contains_key(key);

        self.evict_to_fit(&mut inner, size.saturating_sub(previous_size), is_new);

        if let Some(old) = inner.entries.get(key) {
            inner.unindex_tags(key, &old.tags);
        }
        for tag in &tags {
            inner.tag_index.entry(tag.clone()).or_default().insert(key.into());
        }

        let entry = CacheEntry::new(value, ttl, size, tags);
        inner.entries.insert(key.into(), entry);
        if is_new {
            inner.eviction.on_admit(key);
        } else {
            inner.eviction.on_access(key);
        }

        let delta = size as i64 - previous_size as i64;
        self.current_memory_bytes
            .fetch_add(delta.max(0) as usize, Ordering::Relaxed);
        if delta < 0 {
            self.current_memory_bytes
                .fetch_sub((-delta) as usize, Ordering::Relaxed);
        }
        let entries = inner.entries.len();
        drop(inner);
        self.stats.write().record_put(delta, entries);
        true
    }

    fn evict_to_fit(&self, inner: &mut Inner<V>, incoming: usize, is_new_entry: bool) {
        let budget = self.config.max_memory_bytes;
        let mut current = self.current_memory_bytes.load(Ordering::Relaxed);
        let entry_cap = self.config.max_entries;
        let projected_count = inner.entries.len() + if is_new_entry { 1 } else { 0 };

        let mut over_count = projected_count > entry_cap;
        let mut over_memory = current + incoming > budget;

        while (over_count || over_memory) && !inner.entries.is_empty() {
            let meta = inner.meta_snapshot();
            let Some(victim) = inner.eviction.select_victim(&meta) else {
                break;
            };
            if let Some(entry) = inner.remove_entry(&victim) {
                current = current.saturating_sub(entry.size_bytes);
                self.current_memory_bytes.store(current, Ordering::Relaxed);
                let reason = if over_count && !over_memory {
                    EvictionReason::EntryCountPressure
                } else {
                    EvictionReason::MemoryPressure
                };
                let entries = inner.entries.len();
                self.stats.write().record_eviction(reason, entry.size_bytes, entries);
            } else {
                break;
            }
            over_count = inner.entries.len() + if is_new_entry { 1 } else { 0 } > entry_cap;
            over_memory = current + incoming > budget;
        }
    }

    pub fn delete(&self, key: &[u8]) -> bool {
        let mut inner = self.inner.write();
        match inner.remove_entry(key) {
            Some(entry) => {
                self.current_memory_bytes.fetch_sub(entry.size_bytes, Ordering::Relaxed);
                let entries = inner.entries.len();
                self.stats.write().record_eviction(EvictionReason::Invalidated, entry.size_bytes, entries);
                true
            }
            None => false,
        }
    }

    pub fn invalidate_by_tag(&self, tag: &str) -> usize {
        let mut inner = self.inner.write();
        let Some(keys) = inner.tag_index.get(tag).cloned() else {
            return 0;
        };
        let mut freed = 0usize;
        for key in &keys {
            if let Some(entry) = inner.remove_entry(key) {
                freed += entry.size_bytes;
            }
        }
        self.current_memory_bytes.fetch_sub(freed, Ordering::Relaxed);
        let entries = inner.entries.len();
        self.stats.write().record_eviction(EvictionReason::Invalidated, freed, entries);
        keys.len()
    }

    pub fn keys_matching(&self, pattern: &KeyPattern) -> Vec<Box<[u8]>> {
        let inner = self.inner.read();
        inner
            .entries
            .keys()
            .filter(|k| pattern.matches(k))
            .cloned()
            .collect()
    }

    pub fn clear(&self) {
        let mut inner = self.inner.write();
        let freed = self.current_memory_bytes.swap(0, Ordering::Relaxed);
        let count = inner.entries.len();
        inner.entries.clear();
        inner.tag_index.clear();
        inner.eviction = make_eviction(self.config.eviction, self.config.max_entries);
        drop(inner);
        if count > 0 {
            self.stats.write().record_eviction(EvictionReason::Cleared, freed, 0);
        }
    }

    /// Sweep expired entries proactively; called on the invalidation
    /// controller's periodic schedule rather than waiting for a lazy `get`
    /// (spec.md §4.5 `ttl-cleanup`).
    pub fn sweep_expired(&self) -> usize {
        let mut inner = self.inner.write();
        let expired: Vec<Box<[u8]>> = inner
            .entries
            .iter()
            .filter(|(_, e)| e.is_expired())
            .map(|(k, _)| k.clone())
            .collect();
        let mut freed = 0usize;
        for key in &expired {
            if let Some(entry) = inner.remove_entry(key) {
                freed += entry.size_bytes;
            }
        }
        self.current_memory_bytes.fetch_sub(freed, Ordering::Relaxed);
        let entries = inner.entries.len();
        if !expired.is_empty() {
            self.stats.write().record_eviction(EvictionReason::Expired, freed, entries);
        }
        expired.len()
    }

    /// Periodic maintenance pass: multiplies every entry's frequency score by
    /// `factor` (spec.md §4.1). Run on a timer by
    /// `TierOrchestrator::spawn_maintenance_task` so cold entries fall out of
    /// contention even without being evicted.
    pub fn decay_all(&self, factor: f64) {
        let mut inner = self.inner.write();
        for entry in inner.entries.values_mut() {
            entry.frequency_score *= factor;
        }
    }

    pub fn len(&self) -> usize {
        self.inner.read().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> TierStatsSnapshot {
        self.stats.read().snapshot()
    }
}

impl<V: Clone + Send + Sync + Sizeable + serde::Serialize + serde::de::DeserializeOwned + 'static>
    TierStore<V>
{
    /// Export a serializable snapshot for warm-start or cross-process handoff
    /// (spec.md §6 snapshot export/import).
    pub fn export_snapshot(&self) -> Result<Vec<u8>> {
        let inner = self.inner.read();
        let flat: Vec<(Vec<u8>, V, u64, Vec<String>)> = inner
            .entries
            .iter()
            .map(|(k, e)| {
                (
                    k.to_vec(),
                    e.value.clone(),
                    e.ttl.as_secs(),
                    e.tags.iter().map(|t| t.to_string()).collect(),
                )
            })
            .collect();
        serde_json::to_vec(&flat).map_err(CacheError::from)
    }

    pub fn import_snapshot(&self, bytes: &[u8]) -> Result<usize> {
        let flat: Vec<(Vec<u8>, V, u64, Vec<String>)> = serde_json::from_slice(bytes)?;
        let count = flat.len();
        for (key, value, ttl_secs, tags) in flat {
            self.set(&key, value, Some(Duration::from_secs(ttl_secs)), tags);
        }
        Ok(count)
    }
}

impl<V: Clone + Send + Sync + Sizeable + 'static> Component for TierStore<V> {
    fn health_check(&self) -> HealthStatus {
        let stats = self.stats();
        if stats.current_memory_bytes > self.config.max_memory_bytes {
            HealthStatus::Degraded
        } else {
            HealthStatus::Healthy
        }
    }

    fn shutdown(&self) {
        self.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TierConfig;

    fn small_store(eviction: crate::tier::eviction::EvictionKind) -> TierStore<String> {
        let mut cfg = TierConfig::hot_defaults();
        cfg.eviction = eviction;
        cfg.max_entries = 2;
        cfg.max_memory_bytes = 1024;
        TierStore::new(cfg)
    }

    #[test]
    fn set_then_get_round_trips() {
        let store = small_store(crate::tier::eviction::EvictionKind::Lru);
        assert!(store.set(b"k1", "v1".to_string(), None, vec![]));
        assert_eq!(store.get(b"k1"), Some("v1".to_string()));
    }

    #[test]
    fn lru_evicts_when_entry_cap_exceeded() {
        let store = small_store(crate::tier::eviction::EvictionKind::Lru);
        store.set(b"a", "1".into(), None, vec![]);
        store.set(b"b", "2".into(), None, vec![]);
        store.get(b"a");
        store.set(b"c", "3".into(), None, vec![]);
        assert!(store.get(b"b").is_none());
        assert!(store.get(b"a").is_some());
        assert!(store.get(b"c").is_some());
    }

    #[test]
    fn oversized_entry_is_rejected() {
        let store = small_store(crate::tier::eviction::EvictionKind::Lru);
        let huge = "x".repeat(4096);
        assert!(!store.set(b"big", huge, None, vec![]));
    }

    #[test]
    fn tag_invalidation_removes_all_tagged_entries() {
        let store = small_store(crate::tier::eviction::EvictionKind::Lru);
        store.set(b"a", "1".into(), None, vec!["search".into()]);
        let removed = store.invalidate_by_tag("search");
        assert_eq!(removed, 1);
        assert!(store.get(b"a").is_none());
    }

    #[test]
    fn expired_entry_is_treated_as_miss() {
        let mut cfg = TierConfig::hot_defaults();
        cfg.default_ttl_secs = 1;
        cfg.max_entries = 10;
        cfg.max_memory_bytes = 1024;
        let store: TierStore<String> = TierStore::new(cfg);
        store.set(b"a", "1".into(), Some(Duration::from_millis(1)), vec![]);
        std::thread::sleep(Duration::from_millis(20));
        assert!(store.get(b"a").is_none());
    }

    #[test]
    fn keys_matching_prefix() {
        let store = small_store(crate::tier::eviction::EvictionKind::Lru);
        store.set(b"search:1", "1".into(), None, vec![]);
        store.set(b"other:1", "2".into(), None, vec![]);
        let matched = store.keys_matching(&KeyPattern::Prefix("search:".into()));
        assert_eq!(matched.len(), 1);
    }

    #[test]
    fn snapshot_round_trips_through_a_file() {
        let mut cfg = TierConfig::hot_defaults();
        cfg.max_entries = 10;
        cfg.max_memory_bytes = 1024 * 1024;
        let store: TierStore<String> = TierStore::new(cfg.clone());
        store.set(b"a", "1".into(), None, vec!["search".into()]);
        store.set(b"b", "2".into(), None, vec![]);

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("snapshot.json");
        std::fs::write(&path, store.export_snapshot().unwrap()).unwrap();

        let restored: TierStore<String> = TierStore::new(cfg);
        let bytes = std::fs::read(&path).unwrap();
        let imported = restored.import_snapshot(&bytes).unwrap();

        assert_eq!(imported, 2);
        assert_eq!(restored.get(b"a"), Some("1".to_string()));
        assert_eq!(restored.get(b"b"), Some("2".to_string()));
    }
}
