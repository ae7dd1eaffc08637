// Configuration types for every component, grounded on the teacher's
// `cache::query_cache::CacheConfig` (bounds + `validate()` pattern) and expanded
// per-component the way `main.rs`'s `DatabaseConfig` aggregates subsystem
// settings for the whole process.

use crate::error::{CacheError, Result};
use crate::tier::eviction::EvictionKind;
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

/// Default chunk-fetch parallelism for the loader, derived once from the
/// host's core count rather than a fixed guess (teacher precedent:
/// worker-pool sizing off `num_cpus` throughout the examples pack).
static DEFAULT_PARALLELISM: Lazy<usize> = Lazy::new(|| num_cpus::get().clamp(2, 32));

pub const MIN_TTL_SECS: u64 = 1;
pub const MAX_TTL_SECS: u64 = 86_400;

/// Default half-life for the frequency-decay formula (spec.md §3): 24h.
pub const DEFAULT_FREQUENCY_HALF_LIFE_SECS: u64 = 24 * 60 * 60;

/// Per-tier write-through admission predicate (spec.md §4.2). Plain writes
/// are evaluated against the destination tier's predicate using whatever
/// cost/hit-count signal the caller supplies (zero by default); promotions
/// driven by repeated reads bypass this check entirely (see
/// `TierOrchestrator::maybe_promote`).
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub enum TierStrategy {
    /// Always accepts — the spillover tier's catch-all.
    Always,
    /// Accepts if small enough AND (expensive enough OR already hit at least
    /// `min_hit_count` times). The hot tier's predicate.
    SizeAndCostOrHits { max_size_bytes: usize, min_cost_ms: u64, min_hit_count: u64 },
    /// Accepts if small enough AND expensive enough. The warm tier's
    /// predicate.
    SizeAndCost { max_size_bytes: usize, min_cost_ms: u64 },
    /// Accepts if small enough. The remote tier's predicate.
    SizeOnly { max_size_bytes: usize },
}

impl TierStrategy {
    pub fn accepts(&self, size_bytes: usize, cost_ms: u64, hit_count: u64) -> bool {
        match *self {
            TierStrategy::Always => true,
            TierStrategy::SizeAndCostOrHits { max_size_bytes, min_cost_ms, min_hit_count } => {
                size_bytes < max_size_bytes && (cost_ms > min_cost_ms || hit_count >= min_hit_count)
            }
            TierStrategy::SizeAndCost { max_size_bytes, min_cost_ms } => {
                size_bytes < max_size_bytes && cost_ms > min_cost_ms
            }
            TierStrategy::SizeOnly { max_size_bytes } => size_bytes < max_size_bytes,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TierConfig {
    pub name: String,
    pub eviction: EvictionKind,
    pub max_entries: usize,
    pub max_memory_bytes: usize,
    pub default_ttl_secs: u64,
    pub strategy: TierStrategy,
    /// Half-life (seconds) for the frequency-decay formula applied on every
    /// touch (spec.md §3). Defaults to 24h; configurable per tier since a hot
    /// tier may want a shorter memory than a spillover tier.
    pub frequency_half_life_secs: u64,
}

impl TierConfig {
    pub fn hot_defaults() -> Self {
        Self {
            name: "l0-hot".into(),
            eviction: EvictionKind::Lru,
            max_entries: 2_000,
            max_memory_bytes: 64 * 1024 * 1024,
            default_ttl_secs: 60,
            strategy: TierStrategy::SizeAndCostOrHits {
                max_size_bytes: 10 * 1024,
                min_cost_ms: 500,
                min_hit_count: 1,
            },
            frequency_half_life_secs: DEFAULT_FREQUENCY_HALF_LIFE_SECS,
        }
    }

    pub fn warm_defaults() -> Self {
        Self {
            name: "l1-warm".into(),
            eviction: EvictionKind::Adaptive,
            max_entries: 20_000,
            max_memory_bytes: 512 * 1024 * 1024,
            default_ttl_secs: 300,
            strategy: TierStrategy::SizeAndCost { max_size_bytes: 50 * 1024, min_cost_ms: 500 },
            frequency_half_life_secs: DEFAULT_FREQUENCY_HALF_LIFE_SECS,
        }
    }

    pub fn spillover_defaults() -> Self {
        Self {
            name: "l2-spillover".into(),
            eviction: EvictionKind::Arc,
            max_entries: 100_000,
            max_memory_bytes: 2 * 1024 * 1024 * 1024,
            default_ttl_secs: 3_600,
            strategy: TierStrategy::Always,
            frequency_half_life_secs: DEFAULT_FREQUENCY_HALF_LIFE_SECS,
        }
    }

    pub fn default_ttl(&self) -> Duration {
        Duration::from_secs(self.default_ttl_secs)
    }

    pub fn half_life(&self) -> Duration {
        Duration::from_secs(self.frequency_half_life_secs.max(1))
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_entries == 0 {
            return Err(CacheError::Configuration("max_entries must be > 0".into()));
        }
        if self.max_memory_bytes == 0 {
            return Err(CacheError::Configuration("max_memory_bytes must be > 0".into()));
        }
        if !(MIN_TTL_SECS..=MAX_TTL_SECS).contains(&self.default_ttl_secs) {
            return Err(CacheError::Configuration(format!(
                "default_ttl_secs must be between {MIN_TTL_SECS} and {MAX_TTL_SECS}"
            )));
        }
        if self.frequency_half_life_secs == 0 {
            return Err(CacheError::Configuration("frequency_half_life_secs must be > 0".into()));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteTierConfig {
    pub enabled: bool,
    pub endpoint: String,
    pub connect_timeout: Duration,
    pub request_timeout: Duration,
    pub failure_threshold: u32,
    pub success_threshold: u32,
    pub reset_timeout: Duration,
    /// L3's write-through size ceiling (spec.md §4.2: `size<100KiB AND remote
    /// enabled`).
    pub max_size_bytes: usize,
}

impl Default for RemoteTierConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            endpoint: "redis://127.0.0.1:6379".into(),
            connect_timeout: Duration::from_millis(500),
            request_timeout: Duration::from_secs(2),
            failure_threshold: 5,
            success_threshold: 2,
            reset_timeout: Duration::from_secs(30),
            max_size_bytes: 100 * 1024,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoizerConfig {
    pub producer_timeout: Duration,
    pub max_in_flight: usize,
}

impl Default for MemoizerConfig {
    fn default() -> Self {
        Self {
            producer_timeout: Duration::from_secs(30),
            max_in_flight: 512,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoaderConfig {
    pub default_chunk_size: usize,
    pub max_parallel_chunks: usize,
    pub max_retries: u32,
    pub base_backoff: Duration,
    pub max_backoff: Duration,
    pub enable_adaptive_chunking: bool,
    pub enable_prioritization: bool,
    /// TTL applied to each chunk written into the loader's own chunk cache.
    pub chunk_cache_ttl: Duration,
    pub chunk_cache_max_entries: usize,
    pub chunk_cache_max_memory_bytes: usize,
    /// Per-fetch timeout; a fetch that exceeds this counts as a retryable
    /// failure (spec.md §4.4).
    pub fetch_timeout: Duration,
}

impl Default for LoaderConfig {
    fn default() -> Self {
        Self {
            default_chunk_size: 256,
            max_parallel_chunks: *DEFAULT_PARALLELISM,
            max_retries: 3,
            base_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(10),
            enable_adaptive_chunking: true,
            enable_prioritization: true,
            chunk_cache_ttl: Duration::from_secs(300),
            chunk_cache_max_entries: 10_000,
            chunk_cache_max_memory_bytes: 256 * 1024 * 1024,
            fetch_timeout: Duration::from_secs(10),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvalidationConfig {
    pub sweep_interval: Duration,
    /// Capacity of the bounded queue event-driven invalidation fires through
    /// (spec.md §4.5: a bounded queue absorbs event bursts).
    pub event_queue_capacity: usize,
}

impl Default for InvalidationConfig {
    fn default() -> Self {
        Self {
            sweep_interval: Duration::from_secs(60),
            event_queue_capacity: 256,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PredictorConfig {
    pub event_channel_capacity: usize,
    pub max_concurrent_warms: usize,
    /// Entries per priority-ordered batch in `PredictorInterface::warm`
    /// (spec.md §4.6).
    pub warm_batch_size: usize,
}

impl Default for PredictorConfig {
    fn default() -> Self {
        Self {
            event_channel_capacity: 1024,
            max_concurrent_warms: 3,
            warm_batch_size: 10,
        }
    }
}

/// Hierarchy-wide policy knobs that don't belong to any one tier: which
/// read/write paths are active, per-destination promotion thresholds, and
/// the periodic frequency-decay maintenance pass (spec.md §4.1, §4.2).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    pub read_through: bool,
    pub write_through: bool,
    pub write_behind: bool,
    /// Whether a remote-tier outage causes `get`/`set` to return
    /// `BackendUnavailable` or to silently fall back to the in-memory tiers.
    pub failover: bool,
    /// Keyed by `"<n>_to_<n-1>"` tier-pair name (`"l1_to_l0"`, `"l2_to_l1"`):
    /// number of reads since arrival (`access_count`) required before a
    /// colder-tier hit is promoted one tier up (spec.md §4.2).
    pub promotion_thresholds_per_tier: HashMap<String, u64>,
    /// Interval between frequency-score decay maintenance passes (spec.md
    /// §4.1: a periodic maintenance pass multiplies every score by a decay
    /// constant per tick).
    pub decay_interval: Duration,
    pub decay_factor: f64,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        let mut promotion_thresholds_per_tier = HashMap::new();
        promotion_thresholds_per_tier.insert("l1_to_l0".to_string(), 2);
        promotion_thresholds_per_tier.insert("l2_to_l1".to_string(), 3);
        Self {
            read_through: true,
            write_through: true,
            write_behind: true,
            failover: true,
            promotion_thresholds_per_tier,
            decay_interval: Duration::from_secs(300),
            decay_factor: 0.95,
        }
    }
}

impl OrchestratorConfig {
    pub fn threshold_for(&self, pair: &str) -> u64 {
        self.promotion_thresholds_per_tier.get(pair).copied().unwrap_or(u64::MAX)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    pub hot: TierConfig,
    pub warm: TierConfig,
    pub spillover: TierConfig,
    pub remote: RemoteTierConfig,
    pub memoizer: MemoizerConfig,
    pub loader: LoaderConfig,
    pub invalidation: InvalidationConfig,
    pub predictor: PredictorConfig,
    pub orchestrator: OrchestratorConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            hot: TierConfig::hot_defaults(),
            warm: TierConfig::warm_defaults(),
            spillover: TierConfig::spillover_defaults(),
            remote: RemoteTierConfig::default(),
            memoizer: MemoizerConfig::default(),
            loader: LoaderConfig::default(),
            invalidation: InvalidationConfig::default(),
            predictor: PredictorConfig::default(),
            orchestrator: OrchestratorConfig::default(),
        }
    }
}

impl EngineConfig {
    pub fn validate(&self) -> Result<()> {
        self.hot.validate()?;
        self.warm.validate()?;
        self.spillover.validate()?;
        if self.memoizer.max_in_flight == 0 {
            return Err(CacheError::Configuration("memoizer.max_in_flight must be > 0".into()));
        }
        if self.loader.max_parallel_chunks == 0 {
            return Err(CacheError::Configuration("loader.max_parallel_chunks must be > 0".into()));
        }
        if self.loader.default_chunk_size == 0 {
            return Err(CacheError::Configuration("loader.default_chunk_size must be > 0".into()));
        }
        if !(0.0..1.0).contains(&self.orchestrator.decay_factor) {
            return Err(CacheError::Configuration("orchestrator.decay_factor must be in [0, 1)".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        assert!(EngineConfig::default().validate().is_ok());
    }

    #[test]
    fn zero_max_entries_rejected() {
        let mut cfg = TierConfig::hot_defaults();
        cfg.max_entries = 0;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn out_of_range_ttl_rejected() {
        let mut cfg = TierConfig::hot_defaults();
        cfg.default_ttl_secs = MAX_TTL_SECS + 1;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn hot_strategy_rejects_cheap_large_entries() {
        let strategy = TierConfig::hot_defaults().strategy;
        assert!(!strategy.accepts(20 * 1024, 0, 0));
        assert!(strategy.accepts(1024, 600, 0));
        assert!(strategy.accepts(1024, 0, 1));
    }

    #[test]
    fn spillover_strategy_always_accepts() {
        let strategy = TierConfig::spillover_defaults().strategy;
        assert!(strategy.accepts(usize::MAX, 0, 0));
    }

    #[test]
    fn default_promotion_thresholds_match_spec() {
        let cfg = OrchestratorConfig::default();
        assert_eq!(cfg.threshold_for("l1_to_l0"), 2);
        assert_eq!(cfg.threshold_for("l2_to_l1"), 3);
    }
}
