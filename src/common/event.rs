// # Event Channel
//
// Generalizes the teacher's `common::SystemEvent` / `EventListener` pattern
// (inheritance-from-EventEmitter → first-class typed channel, spec.md §9) to the
// cache-specific events the orchestrator emits for the predictor's access-stream
// sink (spec.md §4.6).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum QueryKind {
    Search,
    Database,
    Api,
    Generic,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AccessOutcome {
    Hit,
    Miss,
}

/// One record on the access-stream sink the predictor consumes (spec.md §4.6).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccessEvent {
    pub key: String,
    pub kind: QueryKind,
    pub timestamp: DateTime<Utc>,
    pub user_context: Option<String>,
    pub outcome: AccessOutcome,
}

/// Typed cache-lifecycle events, generalizing the teacher's `SystemEvent` enum
/// (spec.md §9: `{ CacheHit, CacheMiss, Evict, Invalidate, MigrationProgress,
/// ProducerStart, ProducerEnd }`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum CacheEvent {
    CacheHit { tier: String, key: String },
    CacheMiss { key: String },
    Evict { tier: String, key: String, reason: String },
    Invalidate { tag: String, count: usize },
    PromotionProgress { key: String, from_tier: String, to_tier: String },
    ProducerStart { key: String },
    ProducerEnd { key: String, success: bool, duration_ms: u64 },
    /// Emitted by the invalidation controller each time a rule or dependency
    /// cascade fires (spec.md §4.5 `InvalidationEvent`).
    InvalidationFired { kind: String, trigger: String, tags: Vec<String>, count: usize, duration_ms: u64 },
}

/// Bounded multi-producer broadcast channel. Emitters never block on slow
/// subscribers — a lagging receiver simply drops the oldest events it missed,
/// matching spec.md §9 ("emitters are non-blocking").
pub struct EventChannel {
    sender: tokio::sync::broadcast::Sender<CacheEvent>,
}

impl EventChannel {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = tokio::sync::broadcast::channel(capacity);
        Self { sender }
    }

    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<CacheEvent> {
        self.sender.subscribe()
    }

    /// Best-effort publish; a channel with no subscribers is not an error.
    pub fn publish(&self, event: CacheEvent) {
        let _ = self.sender.send(event);
    }
}

impl Default for EventChannel {
    fn default() -> Self {
        Self::new(1024)
    }
}

/// The access-stream sink named in spec.md §4.6: the orchestrator is the sole
/// publisher, `PredictorInterface` the intended subscriber, but both hold the
/// same sender so an external predictor can also inject synthetic events in
/// tests without reaching into the orchestrator.
#[derive(Clone)]
pub struct AccessStream {
    sender: tokio::sync::broadcast::Sender<AccessEvent>,
}

impl AccessStream {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = tokio::sync::broadcast::channel(capacity);
        Self { sender }
    }

    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<AccessEvent> {
        self.sender.subscribe()
    }

    pub fn publish(&self, event: AccessEvent) {
        let _ = self.sender.send(event);
    }
}

impl Default for AccessStream {
    fn default() -> Self {
        Self::new(1024)
    }
}
