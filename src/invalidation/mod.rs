//! Invalidation controller: pattern/tag rules, a dependency graph between
//! tags, scheduled sweeps, and event-driven cascades (spec.md §4.5).
//! Grounded on the teacher's `cache::cache_invalidation::CacheInvalidator`
//! (table/row dependency maps, invalidation counters) generalized from
//! table/row identifiers to opaque tags, plus its `tokio::time::interval`
//! scheduling idiom seen in the orchestration layer.

use crate::common::event::CacheEvent;
use crate::common::event::EventChannel;
use crate::config::InvalidationConfig;
use crate::error::{CacheError, Result};
use crate::orchestrator::TierOrchestrator;
use crate::tier::{KeyPattern, Sizeable};

use parking_lot::{Mutex, RwLock};
use regex::Regex;
use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value as Json;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;
use tokio::task::AbortHandle;

#[derive(Debug, Clone)]
pub enum RulePattern {
    Prefix(String),
    Regex(String),
}

impl RulePattern {
    fn to_key_pattern(&self) -> Result<KeyPattern> {
        match self {
            RulePattern::Prefix(p) => Ok(KeyPattern::Prefix(p.clone())),
            RulePattern::Regex(r) => Ok(KeyPattern::Regex(Regex::new(r)?)),
        }
    }
}

fn pattern_compatible(rule_pattern: &RulePattern, pattern: &str) -> bool {
    match rule_pattern {
        RulePattern::Prefix(p) => p == pattern,
        RulePattern::Regex(r) => r == pattern,
    }
}

/// The operation that triggered a `CacheOperation` event, named the way the
/// entity/operation pair composes into a rule's `trigger_events` key
/// (spec.md §4.5, `"<entity>-<op>"`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheOperation {
    Create,
    Update,
    Delete,
}

impl CacheOperation {
    fn as_str(self) -> &'static str {
        match self {
            CacheOperation::Create => "create",
            CacheOperation::Update => "update",
            CacheOperation::Delete => "delete",
        }
    }
}

/// Extra gating a rule can apply beyond matching a trigger event — e.g. only
/// firing when the event payload carries a particular field (spec.md §4.5).
#[derive(Debug, Clone, Default)]
pub struct RuleConditions {
    pub requires_field: Option<String>,
}

impl RuleConditions {
    fn matches(&self, data: &Option<Json>) -> bool {
        match (&self.requires_field, data) {
            (Some(field), Some(Json::Object(map))) => map.contains_key(field),
            (Some(_), _) => false,
            (None, _) => true,
        }
    }
}

/// A named rule binding a key pattern to the tags it should carry, used both
/// for direct pattern invalidation and as a lookup when an event fires
/// (spec.md §4.5).
#[derive(Debug, Clone)]
pub struct InvalidationRule {
    pub name: String,
    pub enabled: bool,
    /// Higher fires first when several rules match the same pattern or
    /// event.
    pub priority: u32,
    pub pattern: RulePattern,
    pub tags: Vec<String>,
    /// `"<entity>-<op>"` keys this rule reacts to, plus the universal
    /// wildcard `"data-change"`.
    pub trigger_events: Vec<String>,
    /// Whether firing this rule also cascades through the dependency graph.
    pub cascade: bool,
    pub conditions: RuleConditions,
}

struct RuleRuntime {
    rule: InvalidationRule,
    triggered: AtomicU64,
    total_duration_ms: AtomicU64,
}

#[derive(Debug, Clone)]
pub struct RuleStats {
    pub name: String,
    pub triggered: u64,
    pub avg_duration_ms: f64,
}

/// Directed dependency graph between tags: invalidating a tag cascades to
/// every tag that depends on it. Cycle-rejecting at registration time
/// (spec.md §4.5).
#[derive(Default)]
struct DependencyGraph {
    edges: HashMap<String, HashSet<String>>,
}

impl DependencyGraph {
    fn add_edge(&mut self, from: &str, to: &str) -> Result<()> {
        if from == to {
            return Err(CacheError::InvariantViolation(format!("self-dependency: {from}")));
        }
        let mut probe = self.edges.clone();
        probe.entry(from.to_string()).or_default().insert(to.to_string());
        if Self::has_cycle(&probe, from) {
            return Err(CacheError::InvariantViolation(format!(
                "dependency {from} -> {to} would create a cycle"
            )));
        }
        self.edges = probe;
        Ok(())
    }

    fn has_cycle(edges: &HashMap<String, HashSet<String>>, start: &str) -> bool {
        let mut visited = HashSet::new();
        let mut stack = vec![start.to_string()];
        while let Some(node) = stack.pop() {
            if node == start && !visited.is_empty() {
                return true;
            }
            if !visited.insert(node.clone()) {
                continue;
            }
            if let Some(next) = edges.get(&node) {
                for n in next {
                    if n == start {
                        return true;
                    }
                    stack.push(n.clone());
                }
            }
        }
        false
    }

    fn dependents_of(&self, tag: &str) -> HashSet<String> {
        let mut result = HashSet::new();
        let mut stack = vec![tag.to_string()];
        while let Some(node) = stack.pop() {
            if let Some(next) = self.edges.get(&node) {
                for dep in next {
                    if result.insert(dep.clone()) {
                        stack.push(dep.clone());
                    }
                }
            }
        }
        result
    }
}

#[derive(Debug, Default, Clone)]
pub struct InvalidationStats {
    pub pattern_invalidations: u64,
    pub tag_invalidations: u64,
    pub dependency_cascades: u64,
    pub scheduled_sweeps: u64,
}

/// A one-shot invalidation to run after a delay (spec.md §4.5 `schedule`).
#[derive(Debug, Clone)]
pub struct ScheduledInvalidation {
    pub tag: String,
    pub after: Duration,
}

pub struct InvalidationController<V> {
    orchestrator: Arc<TierOrchestrator<V>>,
    rules: RwLock<HashMap<String, Arc<RuleRuntime>>>,
    dependencies: RwLock<DependencyGraph>,
    scheduled: Mutex<Vec<AbortHandle>>,
    event_queue: Arc<Semaphore>,
    events: Arc<EventChannel>,
    config: InvalidationConfig,
    pattern_invalidations: AtomicU64,
    tag_invalidations: AtomicU64,
    dependency_cascades: AtomicU64,
    scheduled_sweeps: AtomicU64,
}

impl<V> InvalidationController<V>
where
    V: Clone + Send + Sync + Sizeable + Serialize + DeserializeOwned + 'static,
{
    pub fn new(orchestrator: Arc<TierOrchestrator<V>>, config: InvalidationConfig) -> Self {
        let events = orchestrator.events();
        let controller = Self {
            orchestrator,
            rules: RwLock::new(HashMap::new()),
            dependencies: RwLock::new(DependencyGraph::default()),
            scheduled: Mutex::new(Vec::new()),
            event_queue: Arc::new(Semaphore::new(config.event_queue_capacity)),
            events,
            config,
            pattern_invalidations: AtomicU64::new(0),
            tag_invalidations: AtomicU64::new(0),
            dependency_cascades: AtomicU64::new(0),
            scheduled_sweeps: AtomicU64::new(0),
        };
        controller.install_default_rules();
        controller
    }

    /// Registers the rule set every deployment needs out of the box: the
    /// four domain prefixes named in spec.md §4.5 plus a periodic TTL sweep.
    /// `user` is highest-priority (account changes must never lag), then
    /// `knowledge-base`, `search`, and finally the lower-urgency
    /// `database-query` namespace, whose prefix is `query:db:` rather than a
    /// bare `dbq:` shorthand so it composes with the memoizer's `query:`
    /// cache-key namespace.
    fn install_default_rules(&self) {
        let defaults: [(&str, &str, &str, &str, u32, bool); 4] = [
            ("search", "search:", "content-update", "search", 10),
            ("knowledge-base", "kb:", "kb-update", "knowledge-base", 20),
            ("user", "user:", "user-update", "user", 30),
            ("database-query", "query:db:", "db-write", "database-query", 5),
        ]
        .map(|(name, prefix, trigger, tag, priority)| (name, prefix, trigger, tag, priority, name != "user"));

        for (name, prefix, trigger, tag, priority, cascade) in defaults {
            self.register_rule(InvalidationRule {
                name: name.to_string(),
                enabled: true,
                priority,
                pattern: RulePattern::Prefix(prefix.to_string()),
                tags: vec![tag.to_string()],
                trigger_events: vec![trigger.to_string(), "data-change".to_string()],
                cascade,
                conditions: RuleConditions::default(),
            })
            .expect("default rules never form dependency cycles");
        }
    }

    pub fn register_rule(&self, rule: InvalidationRule) -> Result<()> {
        rule.pattern.to_key_pattern()?; // validate pattern eagerly
        let runtime = Arc::new(RuleRuntime { rule, triggered: AtomicU64::new(0), total_duration_ms: AtomicU64::new(0) });
        self.rules.write().insert(runtime.rule.name.clone(), runtime);
        Ok(())
    }

    pub fn remove_rule(&self, name: &str) -> bool {
        self.rules.write().remove(name).is_some()
    }

    /// Declares that invalidating `from` should cascade to `to`. Rejected if
    /// it would introduce a cycle.
    pub fn add_dependency(&self, from: &str, to: &str) -> Result<()> {
        self.dependencies.write().add_edge(from, to)
    }

    /// Fire every enabled rule, sorted by priority descending, whose pattern
    /// matches `pattern`. Returns the total number of entries removed across
    /// all firing rules (spec.md §4.5).
    pub fn invalidate_by_pattern(&self, pattern: &str, trigger: &str) -> usize {
        let mut runtimes: Vec<Arc<RuleRuntime>> = self
            .rules
            .read()
            .values()
            .filter(|r| r.rule.enabled && pattern_compatible(&r.rule.pattern, pattern))
            .cloned()
            .collect();
        runtimes.sort_by(|a, b| b.rule.priority.cmp(&a.rule.priority));

        let total = runtimes.iter().map(|r| self.fire_rule(r, trigger)).sum();
        self.pattern_invalidations.fetch_add(1, Ordering::Relaxed);
        total
    }

    pub fn invalidate_by_dependency(&self, tag: &str) -> usize {
        let mut total = self.orchestrator.invalidate_by_tag(tag);
        self.tag_invalidations.fetch_add(1, Ordering::Relaxed);
        let dependents = self.dependencies.read().dependents_of(tag);
        for dep in dependents {
            total += self.orchestrator.invalidate_by_tag(&dep);
            self.dependency_cascades.fetch_add(1, Ordering::Relaxed);
        }
        total
    }

    /// Delete every key matching the rule's pattern across all tiers, fire
    /// its tags (and dependency cascade when `cascade` is set), and record
    /// the rule's per-firing stats and `InvalidationFired` event (spec.md
    /// §4.5). Shared by `invalidate_by_pattern` and `on_event`.
    fn fire_rule(&self, runtime: &RuleRuntime, trigger: &str) -> usize {
        let start = Instant::now();
        let pattern = runtime.rule.pattern.to_key_pattern().expect("validated at registration");
        let keys = self.orchestrator.keys_matching(&pattern);
        let mut count = 0usize;
        for key in &keys {
            let removed = self.orchestrator.hot().delete(key)
                | self.orchestrator.warm().delete(key)
                | self.orchestrator.spillover().delete(key);
            if removed {
                count += 1;
            }
        }
        for tag in &runtime.rule.tags {
            count += self.orchestrator.invalidate_by_tag(tag);
        }
        if runtime.rule.cascade {
            for tag in &runtime.rule.tags {
                let dependents = self.dependencies.read().dependents_of(tag);
                for dep in dependents {
                    count += self.orchestrator.invalidate_by_tag(&dep);
                    self.dependency_cascades.fetch_add(1, Ordering::Relaxed);
                }
            }
        }
        let duration_ms = start.elapsed().as_millis() as u64;
        runtime.triggered.fetch_add(1, Ordering::Relaxed);
        runtime.total_duration_ms.fetch_add(duration_ms, Ordering::Relaxed);
        self.events.publish(CacheEvent::InvalidationFired {
            kind: runtime.rule.name.clone(),
            trigger: trigger.to_string(),
            tags: runtime.rule.tags.clone(),
            count,
            duration_ms,
        });
        count
    }

    /// React to an entity-level change: fires every enabled rule whose
    /// `trigger_events` names `"<entity>-<op>"` or the universal
    /// `"data-change"` wildcard, and whose conditions match `data`. Bounded
    /// by `event_queue_capacity` — a burst beyond that capacity drops the
    /// newest event rather than piling up unbounded background work (spec.md
    /// §4.5 event-driven invalidation).
    pub fn on_event(self: &Arc<Self>, entity: impl Into<String>, op: CacheOperation, data: Option<Json>) {
        let entity = entity.into();
        let trigger_key = format!("{entity}-{}", op.as_str());
        let permit = match self.event_queue.clone().try_acquire_owned() {
            Ok(permit) => permit,
            Err(_) => {
                tracing::warn!(entity, op = op.as_str(), "invalidation event queue full, dropping event");
                return;
            }
        };
        let this = self.clone();
        tokio::spawn(async move {
            let _permit = permit;
            let mut runtimes: Vec<Arc<RuleRuntime>> = this
                .rules
                .read()
                .values()
                .filter(|r| {
                    r.rule.enabled
                        && r.rule.conditions.matches(&data)
                        && r.rule.trigger_events.iter().any(|t| t == &trigger_key || t == "data-change")
                })
                .cloned()
                .collect();
            runtimes.sort_by(|a, b| b.rule.priority.cmp(&a.rule.priority));
            for runtime in runtimes {
                this.fire_rule(&runtime, &trigger_key);
            }
        });
    }

    /// Schedule a one-shot tag invalidation to run after `desc.after`
    /// (spec.md §4.5). `clear_scheduled` cancels every pending one.
    pub fn schedule(self: &Arc<Self>, desc: ScheduledInvalidation) {
        let this = self.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(desc.after).await;
            this.invalidate_by_dependency(&desc.tag);
        });
        self.scheduled.lock().push(handle.abort_handle());
    }

    pub fn clear_scheduled(&self) {
        for handle in self.scheduled.lock().drain(..) {
            handle.abort();
        }
    }

    pub fn rule_stats(&self) -> Vec<RuleStats> {
        self.rules
            .read()
            .values()
            .map(|r| {
                let triggered = r.triggered.load(Ordering::Relaxed);
                let total = r.total_duration_ms.load(Ordering::Relaxed);
                let avg_duration_ms = if triggered == 0 { 0.0 } else { total as f64 / triggered as f64 };
                RuleStats { name: r.rule.name.clone(), triggered, avg_duration_ms }
            })
            .collect()
    }

    pub fn stats(&self) -> InvalidationStats {
        InvalidationStats {
            pattern_invalidations: self.pattern_invalidations.load(Ordering::Relaxed),
            tag_invalidations: self.tag_invalidations.load(Ordering::Relaxed),
            dependency_cascades: self.dependency_cascades.load(Ordering::Relaxed),
            scheduled_sweeps: self.scheduled_sweeps.load(Ordering::Relaxed),
        }
    }

    /// Spawn the periodic TTL sweep. Returns a handle the caller can abort on
    /// shutdown.
    pub fn spawn_scheduled_sweep(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let this = self.clone();
        let interval = self.config.sweep_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                let removed = this.orchestrator.sweep_expired();
                this.scheduled_sweeps.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(removed, "ttl sweep complete");
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::event::AccessStream;
    use crate::config::EngineConfig;

    fn controller() -> (Arc<TierOrchestrator<String>>, Arc<InvalidationController<String>>) {
        let config = EngineConfig::default();
        let orch = Arc::new(TierOrchestrator::new(
            &config,
            None,
            Arc::new(EventChannel::default()),
            Arc::new(AccessStream::default()),
        ));
        let controller = Arc::new(InvalidationController::new(orch.clone(), InvalidationConfig::default()));
        (orch, controller)
    }

    #[tokio::test]
    async fn default_rules_invalidate_by_prefix() {
        let (orch, controller) = controller();
        orch.set(b"search:rust", "v".to_string(), None, vec![]).await;
        let n = controller.invalidate_by_pattern("search:", "manual");
        assert_eq!(n, 1);
        assert_eq!(orch.get(b"search:rust").await, crate::common::Outcome::Miss);
    }

    #[tokio::test]
    async fn database_query_rule_uses_query_db_prefix_not_dbq() {
        let (orch, controller) = controller();
        orch.set(b"query:db:users", "v".to_string(), None, vec![]).await;
        let n = controller.invalidate_by_pattern("query:db:", "manual");
        assert_eq!(n, 1);
    }

    #[test]
    fn cyclic_dependency_is_rejected() {
        let (_, controller) = controller();
        controller.add_dependency("a", "b").unwrap();
        controller.add_dependency("b", "c").unwrap();
        assert!(controller.add_dependency("c", "a").is_err());
    }

    #[tokio::test]
    async fn dependency_cascade_invalidates_transitively() {
        let (orch, controller) = controller();
        orch.set(b"x", "v".to_string(), None, vec!["a".into()]).await;
        orch.set(b"y", "v".to_string(), None, vec!["b".into()]).await;
        controller.add_dependency("a", "b").unwrap();
        let n = controller.invalidate_by_dependency("a");
        assert_eq!(n, 2);
    }

    #[tokio::test]
    async fn on_event_fires_rules_matching_entity_and_operation() {
        let (orch, controller) = controller();
        orch.set(b"user:42", "v".to_string(), None, vec![]).await;
        controller.on_event("user", CacheOperation::Update, None);
        tokio::task::yield_now().await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(orch.get(b"user:42").await, crate::common::Outcome::Miss);
        let stats = controller.rule_stats();
        let user_rule = stats.iter().find(|s| s.name == "user").unwrap();
        assert_eq!(user_rule.triggered, 1);
    }

    #[tokio::test]
    async fn scheduled_invalidation_fires_after_delay_unless_cleared() {
        let (orch, controller) = controller();
        orch.set(b"x", "v".to_string(), None, vec!["a".into()]).await;
        controller.schedule(ScheduledInvalidation { tag: "a".into(), after: Duration::from_millis(5) });
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(orch.get(b"x").await, crate::common::Outcome::Miss);
    }

    #[tokio::test]
    async fn clear_scheduled_cancels_pending_invalidations() {
        let (orch, controller) = controller();
        orch.set(b"x", "v".to_string(), None, vec!["a".into()]).await;
        controller.schedule(ScheduledInvalidation { tag: "a".into(), after: Duration::from_millis(50) });
        controller.clear_scheduled();
        tokio::time::sleep(Duration::from_millis(80)).await;
        assert_eq!(orch.get(b"x").await, crate::common::Outcome::Ok("v".to_string()));
    }
}
