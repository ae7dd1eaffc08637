//! External predictor interface: the engine publishes its access stream and
//! accepts prefetch warming instructions, but never runs prediction logic
//! itself (spec.md §4.6 Non-goals). Grounded on the teacher's broadcast-based
//! `common::SystemEvent` fan-out idiom, bounding concurrent warms the same
//! way the circuit breaker's call path bounds concurrent remote calls.

use crate::common::event::{AccessEvent, AccessStream};
use crate::common::Priority;
use crate::orchestrator::TierOrchestrator;
use crate::tier::Sizeable;

use serde::{de::DeserializeOwned, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, Semaphore};

/// One prefetch instruction from an external predictor: a key to warm, with
/// the value already resolved (the predictor is responsible for producing
/// it — the engine only stores it), and a priority used to order batches so
/// the highest-confidence predictions warm first (spec.md §4.6).
#[derive(Debug, Clone)]
pub struct WarmEntry<V> {
    pub key: Vec<u8>,
    pub value: V,
    pub ttl: Option<Duration>,
    pub tags: Vec<String>,
    pub priority: Priority,
}

/// Read-only handle external predictors use to observe cache traffic and
/// push prefetch hints back in. Does not expose get/set directly — callers
/// go through the orchestrator for that; this is purely the predictor seam.
/// Shares the orchestrator's `AccessStream` rather than owning a private
/// channel, so the same access events the orchestrator publishes on every
/// `get` reach the predictor without a separate forwarding step.
pub struct PredictorInterface<V> {
    orchestrator: Arc<TierOrchestrator<V>>,
    access_stream: Arc<AccessStream>,
    warm_semaphore: Arc<Semaphore>,
    warm_batch_size: usize,
}

impl<V> PredictorInterface<V>
where
    V: Clone + Send + Sync + Sizeable + Serialize + DeserializeOwned + 'static,
{
    pub fn new(
        orchestrator: Arc<TierOrchestrator<V>>,
        access_stream: Arc<AccessStream>,
        max_concurrent_warms: usize,
        warm_batch_size: usize,
    ) -> Self {
        Self {
            orchestrator,
            access_stream,
            warm_semaphore: Arc::new(Semaphore::new(max_concurrent_warms.max(1))),
            warm_batch_size: warm_batch_size.max(1),
        }
    }

    pub fn subscribe_access_stream(&self) -> broadcast::Receiver<AccessEvent> {
        self.access_stream.subscribe()
    }

    /// Best-effort publish; dropped if there are no subscribers, matching
    /// `AccessStream`'s non-blocking emitter contract.
    pub fn publish_access(&self, event: AccessEvent) {
        self.access_stream.publish(event);
    }

    /// Warm predictor-resolved entries in priority-ordered batches of
    /// `warm_batch_size`, each batch bounded by `max_concurrent_warms`
    /// concurrent writes so a large prefetch burst can't starve foreground
    /// traffic for tier-store locks (spec.md §4.6).
    pub async fn warm(&self, mut entries: Vec<WarmEntry<V>>) -> usize {
        entries.sort_by(|a, b| b.priority.cmp(&a.priority));
        let mut warmed = 0;
        for batch in entries.chunks(self.warm_batch_size) {
            let mut handles = Vec::with_capacity(batch.len());
            for entry in batch.iter().cloned() {
                let permit = self.warm_semaphore.clone().acquire_owned().await.expect("semaphore not closed");
                let orchestrator = self.orchestrator.clone();
                handles.push(tokio::spawn(async move {
                    let _permit = permit;
                    orchestrator.set(&entry.key, entry.value, entry.ttl, entry.tags).await
                }));
            }
            for h in handles {
                if let Ok(true) = h.await {
                    warmed += 1;
                }
            }
        }
        warmed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::event::{AccessOutcome, EventChannel, QueryKind};
    use crate::config::EngineConfig;

    #[tokio::test]
    async fn warm_batch_lands_in_hot_tier() {
        let config = EngineConfig::default();
        let stream = Arc::new(AccessStream::default());
        let orch = Arc::new(TierOrchestrator::new(&config, None, Arc::new(EventChannel::default()), stream.clone()));
        let predictor = PredictorInterface::new(orch.clone(), stream, 4, 10);
        let entries =
            vec![WarmEntry { key: b"a".to_vec(), value: "1".to_string(), ttl: None, tags: vec![], priority: Priority::Medium }];
        let warmed = predictor.warm(entries).await;
        assert_eq!(warmed, 1);
        assert_eq!(orch.get(b"a").await, crate::common::Outcome::Ok("1".to_string()));
    }

    #[tokio::test]
    async fn higher_priority_entries_warm_in_earlier_batches() {
        let config = EngineConfig::default();
        let stream = Arc::new(AccessStream::default());
        let orch = Arc::new(TierOrchestrator::new(&config, None, Arc::new(EventChannel::default()), stream.clone()));
        let predictor = PredictorInterface::new(orch.clone(), stream, 8, 1);
        let entries = vec![
            WarmEntry { key: b"low".to_vec(), value: "l".to_string(), ttl: None, tags: vec![], priority: Priority::Low },
            WarmEntry {
                key: b"critical".to_vec(),
                value: "c".to_string(),
                ttl: None,
                tags: vec![],
                priority: Priority::Critical,
            },
        ];
        let warmed = predictor.warm(entries).await;
        assert_eq!(warmed, 2);
    }

    #[test]
    fn access_stream_publish_without_subscribers_does_not_panic() {
        let config = EngineConfig::default();
        let stream = Arc::new(AccessStream::default());
        let orch = Arc::new(TierOrchestrator::new(&config, None, Arc::new(EventChannel::default()), stream.clone()));
        let predictor: PredictorInterface<String> = PredictorInterface::new(orch, stream, 2, 10);
        predictor.publish_access(AccessEvent {
            key: "k".into(),
            kind: QueryKind::Search,
            timestamp: chrono::Utc::now(),
            user_context: None,
            outcome: AccessOutcome::Miss,
        });
    }
}
