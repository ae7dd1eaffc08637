// Metrics, grounded on the teacher's `cache::cache_statistics` (hit/miss
// counters, per-reason eviction breakdown, latency percentiles) but scoped to a
// single tier rather than the whole database.

use serde::Serialize;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum EvictionReason {
    Expired,
    MemoryPressure,
    EntryCountPressure,
    Invalidated,
    Cleared,
}

#[derive(Debug, Default, Clone, Serialize)]
pub struct EvictionCounts {
    pub expired: u64,
    pub memory_pressure: u64,
    pub entry_count_pressure: u64,
    pub invalidated: u64,
    pub cleared: u64,
}

impl EvictionCounts {
    fn record(&mut self, reason: EvictionReason) {
        match reason {
            EvictionReason::Expired => self.expired += 1,
            EvictionReason::MemoryPressure => self.memory_pressure += 1,
            EvictionReason::EntryCountPressure => self.entry_count_pressure += 1,
            EvictionReason::Invalidated => self.invalidated += 1,
            EvictionReason::Cleared => self.cleared += 1,
        }
    }

    pub fn total(&self) -> u64 {
        self.expired + self.memory_pressure + self.entry_count_pressure + self.invalidated + self.cleared
    }
}

/// Rolling latency histogram. Bounded ring buffer rather than an unbounded
/// `Vec` so long-running tiers don't grow memory without limit.
struct LatencyHistogram {
    samples: Vec<u64>,
    capacity: usize,
    next: usize,
}

impl LatencyHistogram {
    fn new(capacity: usize) -> Self {
        Self { samples: Vec::with_capacity(capacity), capacity, next: 0 }
    }

    fn record(&mut self, micros: u64) {
        if self.samples.len() < self.capacity {
            self.samples.push(micros);
        } else {
            self.samples[self.next] = micros;
            self.next = (self.next + 1) % self.capacity;
        }
    }

    fn percentile(&self, p: f64) -> Duration {
        if self.samples.is_empty() {
            return Duration::ZERO;
        }
        let mut sorted = self.samples.clone();
        sorted.sort_unstable();
        let idx = ((sorted.len() as f64 - 1.0) * p).round() as usize;
        Duration::from_micros(sorted[idx.min(sorted.len() - 1)])
    }
}

pub struct TierStats {
    hits: u64,
    misses: u64,
    puts: u64,
    rejected: u64,
    evictions: EvictionCounts,
    current_memory_bytes: usize,
    peak_memory_bytes: usize,
    current_entries: usize,
    latency: LatencyHistogram,
}

impl Default for TierStats {
    fn default() -> Self {
        Self {
            hits: 0,
            misses: 0,
            puts: 0,
            rejected: 0,
            evictions: EvictionCounts::default(),
            current_memory_bytes: 0,
            peak_memory_bytes: 0,
            current_entries: 0,
            latency: LatencyHistogram::new(2048),
        }
    }
}

impl TierStats {
    pub fn record_hit(&mut self, latency: Duration) {
        self.hits += 1;
        self.latency.record(latency.as_micros() as u64);
    }

    pub fn record_miss(&mut self) {
        self.misses += 1;
    }

    pub fn record_put(&mut self, delta_bytes: i64, entries: usize) {
        self.puts += 1;
        self.current_memory_bytes = (self.current_memory_bytes as i64 + delta_bytes).max(0) as usize;
        self.peak_memory_bytes = self.peak_memory_bytes.max(self.current_memory_bytes);
        self.current_entries = entries;
    }

    pub fn record_rejected(&mut self) {
        self.rejected += 1;
    }

    pub fn record_eviction(&mut self, reason: EvictionReason, freed_bytes: usize, entries: usize) {
        self.evictions.record(reason);
        self.current_memory_bytes = self.current_memory_bytes.saturating_sub(freed_bytes);
        self.current_entries = entries;
    }

    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }

    pub fn snapshot(&self) -> TierStatsSnapshot {
        TierStatsSnapshot {
            hits: self.hits,
            misses: self.misses,
            puts: self.puts,
            rejected: self.rejected,
            hit_rate: self.hit_rate(),
            evictions: self.evictions.clone(),
            current_memory_bytes: self.current_memory_bytes,
            peak_memory_bytes: self.peak_memory_bytes,
            current_entries: self.current_entries,
            p50_latency: self.latency.percentile(0.50),
            p95_latency: self.latency.percentile(0.95),
            p99_latency: self.latency.percentile(0.99),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct TierStatsSnapshot {
    pub hits: u64,
    pub misses: u64,
    pub puts: u64,
    pub rejected: u64,
    pub hit_rate: f64,
    pub evictions: EvictionCounts,
    pub current_memory_bytes: usize,
    pub peak_memory_bytes: usize,
    pub current_entries: usize,
    #[serde(skip)]
    pub p50_latency: Duration,
    #[serde(skip)]
    pub p95_latency: Duration,
    #[serde(skip)]
    pub p99_latency: Duration,
}

impl TierStatsSnapshot {
    pub fn summary(&self) -> String {
        format!(
            "hits={} misses={} hit_rate={:.2}% entries={} mem={}B evictions={}",
            self.hits,
            self.misses,
            self.hit_rate * 100.0,
            self.current_entries,
            self.current_memory_bytes,
            self.evictions.total()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hit_rate_with_no_traffic_is_zero() {
        let s = TierStats::default();
        assert_eq!(s.hit_rate(), 0.0);
    }

    #[test]
    fn hit_rate_reflects_hits_and_misses() {
        let mut s = TierStats::default();
        s.record_hit(Duration::from_micros(5));
        s.record_hit(Duration::from_micros(5));
        s.record_miss();
        assert!((s.hit_rate() - (2.0 / 3.0)).abs() < 1e-9);
    }

    #[test]
    fn percentiles_are_monotonic() {
        let mut s = TierStats::default();
        for i in 1..=100u64 {
            s.record_hit(Duration::from_micros(i));
        }
        let snap = s.snapshot();
        assert!(snap.p50_latency <= snap.p95_latency);
        assert!(snap.p95_latency <= snap.p99_latency);
    }
}
