//! Composes the hot/warm/spillover tiers (and an optional remote L3) into one
//! read-through, write-through hierarchy (spec.md §4.2), grounded on the
//! teacher's tier-promotion idea in `cache::query_cache` (single `QueryCache`
//! generalized to several cooperating ones) and its
//! `orchestration::circuit_breaker` for the remote leg.

pub mod remote;

use crate::common::event::{AccessEvent, AccessOutcome, AccessStream, CacheEvent, EventChannel, QueryKind};
use crate::common::{Component, HealthStatus, Outcome};
use crate::config::{EngineConfig, OrchestratorConfig, TierStrategy};
use crate::tier::store::PromotionInfo;
use crate::tier::{KeyPattern, Sizeable, TierStore};
use remote::GuardedRemoteTier;

use serde::{de::DeserializeOwned, Serialize};
use std::sync::Arc;
use std::time::Duration;

/// Cost/frequency signal a caller supplies alongside a write, used to
/// evaluate each tier's `TierStrategy` predicate (spec.md §4.2). A plain
/// `set()` uses the neutral default (zero cost, zero hits), which only the
/// spillover tier's `Always` predicate accepts outright; the hot and warm
/// tiers only admit a fresh write when the caller demonstrates real cost or
/// hit signal (e.g. the memoizer/loader producer paths), or later via
/// read-through promotion.
#[derive(Debug, Clone, Copy, Default)]
pub struct StrategyContext {
    pub cost_ms: u64,
    pub hit_count: u64,
}

pub struct TierOrchestrator<V> {
    hot: Arc<TierStore<V>>,
    warm: Arc<TierStore<V>>,
    spillover: Arc<TierStore<V>>,
    remote: Option<Arc<GuardedRemoteTier>>,
    remote_max_size_bytes: usize,
    events: Arc<EventChannel>,
    access_stream: Arc<AccessStream>,
    config: OrchestratorConfig,
}

impl<V> TierOrchestrator<V>
where
    V: Clone + Send + Sync + Sizeable + Serialize + DeserializeOwned + 'static,
{
    pub fn new(
        config: &EngineConfig,
        remote: Option<Arc<GuardedRemoteTier>>,
        events: Arc<EventChannel>,
        access_stream: Arc<AccessStream>,
    ) -> Self {
        Self {
            hot: Arc::new(TierStore::new(config.hot.clone())),
            warm: Arc::new(TierStore::new(config.warm.clone())),
            spillover: Arc::new(TierStore::new(config.spillover.clone())),
            remote,
            remote_max_size_bytes: config.remote.max_size_bytes,
            events,
            access_stream,
            config: config.orchestrator.clone(),
        }
    }

    pub fn hot(&self) -> &Arc<TierStore<V>> {
        &self.hot
    }

    pub fn warm(&self) -> &Arc<TierStore<V>> {
        &self.warm
    }

    pub fn spillover(&self) -> &Arc<TierStore<V>> {
        &self.spillover
    }

    pub fn access_stream(&self) -> Arc<AccessStream> {
        self.access_stream.clone()
    }

    /// Read-through lookup across the hierarchy: a hit in a colder tier
    /// promotes the value into the next warmer tier once it has crossed that
    /// tier-pair's hit threshold, carrying the source entry's tags and
    /// remaining TTL forward rather than resetting them (spec.md §4.2).
    pub async fn get(&self, key: &[u8]) -> Outcome<V> {
        if let Some(info) = self.hot.get_for_promotion(key) {
            self.publish_access(key, AccessOutcome::Hit);
            self.events.publish(CacheEvent::CacheHit { tier: self.hot.name().into(), key: key_string(key) });
            return Outcome::Ok(info.value);
        }
        if let Some(info) = self.warm.get_for_promotion(key) {
            self.maybe_promote(key, &info, &self.hot, "l1_to_l0");
            self.publish_access(key, AccessOutcome::Hit);
            self.events.publish(CacheEvent::CacheHit { tier: self.warm.name().into(), key: key_string(key) });
            return Outcome::Ok(info.value);
        }
        if let Some(info) = self.spillover.get_for_promotion(key) {
            self.maybe_promote(key, &info, &self.warm, "l2_to_l1");
            self.publish_access(key, AccessOutcome::Hit);
            self.events.publish(CacheEvent::CacheHit { tier: self.spillover.name().into(), key: key_string(key) });
            return Outcome::Ok(info.value);
        }
        if let Some(remote) = &self.remote {
            match remote.get(key).await {
                Ok(Some(bytes)) => match serde_json::from_slice::<V>(&bytes) {
                    Ok(v) => {
                        // Fresh from remote: lands at spillover through the
                        // ordinary write-through predicate (its `Always`
                        // admits unconditionally); further reads climb the
                        // hierarchy one tier at a time like any other hit.
                        self.spillover.set(key, v.clone(), None, vec![]);
                        self.publish_access(key, AccessOutcome::Hit);
                        self.events.publish(CacheEvent::CacheHit { tier: "l3-remote".into(), key: key_string(key) });
                        return Outcome::Ok(v);
                    }
                    Err(e) => return Outcome::Rejected(e.to_string()),
                },
                Ok(None) => {}
                Err(crate::error::CacheError::BackendUnavailable(msg)) => {
                    if !self.config.failover {
                        return Outcome::BackendUnavailable;
                    }
                    tracing::debug!(error = %msg, "remote tier unavailable, failing over to a miss");
                }
                Err(e) => return Outcome::Rejected(e.to_string()),
            }
        }
        self.publish_access(key, AccessOutcome::Miss);
        self.events.publish(CacheEvent::CacheMiss { key: key_string(key) });
        Outcome::Miss
    }

    fn maybe_promote(&self, key: &[u8], info: &PromotionInfo<V>, target: &Arc<TierStore<V>>, threshold_pair: &str) {
        if !self.config.read_through {
            return;
        }
        let threshold = self.config.threshold_for(threshold_pair);
        if info.access_count > threshold {
            // Promotion bypasses the destination tier's strategy predicate:
            // crossing the hit threshold is itself the qualifying signal.
            target.set(key, info.value.clone(), Some(info.remaining_ttl), info.tags.clone());
            self.events.publish(CacheEvent::PromotionProgress {
                key: key_string(key),
                from_tier: "colder".into(),
                to_tier: target.name().into(),
            });
        }
    }

    fn publish_access(&self, key: &[u8], outcome: AccessOutcome) {
        self.access_stream.publish(AccessEvent {
            key: key_string(key),
            kind: QueryKind::Generic,
            timestamp: chrono::Utc::now(),
            user_context: None,
            outcome,
        });
    }

    /// Write-through with the neutral strategy context (zero cost, zero
    /// hits) — only the spillover tier's `Always` predicate accepts a write
    /// at this signal level. Callers with real cost/hit-count signal (the
    /// memoizer and loader producer paths) should use `set_with_context`.
    pub async fn set(&self, key: &[u8], value: V, ttl: Option<Duration>, tags: Vec<String>) -> bool {
        self.set_with_context(key, value, ttl, tags, StrategyContext::default()).await
    }

    /// Write-through evaluated per tier against its `TierStrategy` predicate
    /// (spec.md §4.2); the remote leg is written best-effort, in the
    /// background when `write_behind` is enabled, so a slow or degraded L3
    /// never adds latency to the caller.
    pub async fn set_with_context(
        &self,
        key: &[u8],
        value: V,
        ttl: Option<Duration>,
        tags: Vec<String>,
        ctx: StrategyContext,
    ) -> bool {
        if !self.config.write_through {
            return false;
        }
        let size = value.estimated_size();
        let mut accepted = false;

        if self.hot.config().strategy.accepts(size, ctx.cost_ms, ctx.hit_count) {
            accepted |= self.hot.set(key, value.clone(), ttl, tags.clone());
        }
        if self.warm.config().strategy.accepts(size, ctx.cost_ms, ctx.hit_count) {
            accepted |= self.warm.set(key, value.clone(), ttl, tags.clone());
        }
        if self.spillover.config().strategy.accepts(size, ctx.cost_ms, ctx.hit_count) {
            accepted |= self.spillover.set(key, value.clone(), ttl, tags.clone());
        }
        if let Some(remote) = self.remote.clone() {
            let remote_strategy = TierStrategy::SizeOnly { max_size_bytes: self.remote_max_size_bytes };
            if remote_strategy.accepts(size, ctx.cost_ms, ctx.hit_count) {
                if let Ok(bytes) = serde_json::to_vec(&value) {
                    let key = key.to_vec();
                    let ttl = ttl.unwrap_or(self.hot.config().default_ttl());
                    if self.config.write_behind {
                        tokio::spawn(async move {
                            let _ = remote.set(&key, bytes, ttl).await;
                        });
                    } else {
                        let _ = remote.set(&key, bytes, ttl).await;
                    }
                    accepted = true;
                }
            }
        }
        accepted
    }

    pub async fn delete(&self, key: &[u8]) -> bool {
        let a = self.hot.delete(key);
        let b = self.warm.delete(key);
        let c = self.spillover.delete(key);
        if let Some(remote) = self.remote.clone() {
            let key = key.to_vec();
            tokio::spawn(async move {
                let _ = remote.delete(&key).await;
            });
        }
        a || b || c
    }

    pub fn invalidate_by_tag(&self, tag: &str) -> usize {
        let n = self.hot.invalidate_by_tag(tag) + self.warm.invalidate_by_tag(tag) + self.spillover.invalidate_by_tag(tag);
        if n > 0 {
            self.events.publish(CacheEvent::Invalidate { tag: tag.into(), count: n });
        }
        n
    }

    pub fn keys_matching(&self, pattern: &KeyPattern) -> Vec<Box<[u8]>> {
        let mut keys: Vec<Box<[u8]>> = self.hot.keys_matching(pattern);
        keys.extend(self.warm.keys_matching(pattern));
        keys.extend(self.spillover.keys_matching(pattern));
        keys.sort();
        keys.dedup();
        keys
    }

    pub fn sweep_expired(&self) -> usize {
        self.hot.sweep_expired() + self.warm.sweep_expired() + self.spillover.sweep_expired()
    }

    pub fn clear_all(&self) {
        self.hot.clear();
        self.warm.clear();
        self.spillover.clear();
    }

    pub fn events(&self) -> Arc<EventChannel> {
        self.events.clone()
    }

    /// Spawn the periodic frequency-decay maintenance pass (spec.md §4.1).
    /// Callers hold the returned handle the same way
    /// `InvalidationController::spawn_scheduled_sweep` is held for the TTL
    /// sweep, aborting it on shutdown.
    pub fn spawn_maintenance_task(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let this = self.clone();
        let interval = self.config.decay_interval;
        let factor = self.config.decay_factor;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                this.hot.decay_all(factor);
                this.warm.decay_all(factor);
                this.spillover.decay_all(factor);
                tracing::debug!(factor, "frequency decay maintenance pass complete");
            }
        })
    }
}

fn key_string(key: &[u8]) -> String {
    String::from_utf8_lossy(key).into_owned()
}

impl<V> Component for TierOrchestrator<V>
where
    V: Clone + Send + Sync + Sizeable + Serialize + DeserializeOwned + 'static,
{
    fn health_check(&self) -> HealthStatus {
        let statuses = [self.hot.health_check(), self.warm.health_check(), self.spillover.health_check()];
        if statuses.iter().any(|s| *s == HealthStatus::Unhealthy) {
            HealthStatus::Unhealthy
        } else if statuses.iter().any(|s| *s == HealthStatus::Degraded) {
            HealthStatus::Degraded
        } else {
            HealthStatus::Healthy
        }
    }

    fn shutdown(&self) {
        self.clear_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;

    fn orchestrator() -> TierOrchestrator<String> {
        let config = EngineConfig::default();
        TierOrchestrator::new(&config, None, Arc::new(EventChannel::default()), Arc::new(AccessStream::default()))
    }

    #[tokio::test]
    async fn plain_set_lands_only_in_spillover() {
        let o = orchestrator();
        o.set(b"k", "v".to_string(), None, vec![]).await;
        assert!(!o.hot.has(b"k"));
        assert!(!o.warm.has(b"k"));
        assert!(o.spillover.has(b"k"));
    }

    #[tokio::test]
    async fn costly_write_lands_in_hot_tier() {
        let o = orchestrator();
        o.set_with_context(b"k", "v".to_string(), None, vec![], StrategyContext { cost_ms: 600, hit_count: 0 }).await;
        assert!(o.hot.has(b"k"));
    }

    #[tokio::test]
    async fn miss_without_remote_returns_miss() {
        let o = orchestrator();
        assert_eq!(o.get(b"missing").await, Outcome::Miss);
    }

    #[tokio::test]
    async fn repeated_reads_promote_into_warmer_tiers_preserving_tags_and_ttl() {
        let o = orchestrator();
        o.spillover.set(b"k", "v".to_string(), Some(Duration::from_secs(120)), vec!["search".into()]);
        // l2_to_l1 threshold is 3: access_count must exceed 3 to promote.
        for _ in 0..4 {
            assert_eq!(o.get(b"k").await, Outcome::Ok("v".to_string()));
        }
        assert!(o.warm.has(b"k"));
        let info = o.warm.get_for_promotion(b"k").unwrap();
        assert!(info.tags.iter().any(|t| t == "search"));
        assert!(info.remaining_ttl > Duration::from_secs(60));
    }

    #[tokio::test]
    async fn single_read_does_not_promote() {
        let o = orchestrator();
        o.spillover.set(b"k", "v".to_string(), None, vec![]);
        assert_eq!(o.get(b"k").await, Outcome::Ok("v".to_string()));
        assert!(!o.warm.has(b"k"));
    }

    #[tokio::test]
    async fn tag_invalidation_spans_all_tiers() {
        let o = orchestrator();
        o.set_with_context(b"k", "v".to_string(), None, vec!["search".into()], StrategyContext { cost_ms: 600, hit_count: 0 })
            .await;
        let n = o.invalidate_by_tag("search");
        assert!(n >= 1);
        assert_eq!(o.get(b"k").await, Outcome::Miss);
    }
}
