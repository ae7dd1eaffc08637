//! Multi-tier in-process caching engine for knowledge-base search services.
//!
//! Composes a tiered memory hierarchy (`tier`, `orchestrator`), query
//! memoization with single-flight de-duplication (`memoizer`), incremental
//! cache warming (`loader`), tag/pattern-driven invalidation
//! (`invalidation`), and an external predictor seam (`predictor`) behind one
//! [`Engine`] handle.

pub mod common;
pub mod config;
pub mod error;
pub mod invalidation;
pub mod loader;
pub mod memoizer;
pub mod orchestrator;
pub mod predictor;
pub mod tier;

pub use config::EngineConfig;
pub use error::{CacheError, Result};

use common::event::{AccessStream, EventChannel};
use common::{Component, HealthStatus, Outcome};
use invalidation::InvalidationController;
use loader::IncrementalLoader;
use memoizer::QueryMemoizer;
use orchestrator::remote::GuardedRemoteTier;
use orchestrator::TierOrchestrator;
use predictor::PredictorInterface;
use tier::Sizeable;

use serde::{de::DeserializeOwned, Serialize};
use std::sync::Arc;
use std::time::Duration;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Top-level handle to the caching engine. Construct one per process (or per
/// logical cache namespace); every component shares the same tier hierarchy
/// and event channel.
pub struct Engine<V> {
    orchestrator: Arc<TierOrchestrator<V>>,
    memoizer: Arc<QueryMemoizer<V>>,
    loader: Arc<IncrementalLoader<V>>,
    invalidation: Arc<InvalidationController<V>>,
    predictor: Arc<PredictorInterface<V>>,
    config: EngineConfig,
    sweep_handle: parking_lot::Mutex<Option<tokio::task::JoinHandle<()>>>,
    maintenance_handle: parking_lot::Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl<V> Engine<V>
where
    V: Clone + Send + Sync + Sizeable + Serialize + DeserializeOwned + 'static,
{
    pub fn new(config: EngineConfig) -> Result<Self> {
        Self::with_remote(config, None)
    }

    pub fn with_remote(config: EngineConfig, remote: Option<Arc<GuardedRemoteTier>>) -> Result<Self> {
        config.validate()?;
        let events = Arc::new(EventChannel::new(config.predictor.event_channel_capacity));
        let access_stream = Arc::new(AccessStream::new(config.predictor.event_channel_capacity));
        let orchestrator = Arc::new(TierOrchestrator::new(&config, remote, events.clone(), access_stream.clone()));
        let memoizer = Arc::new(QueryMemoizer::new(orchestrator.clone(), config.memoizer.clone()));
        let loader = Arc::new(IncrementalLoader::new(orchestrator.clone(), config.loader.clone()));
        let invalidation = Arc::new(InvalidationController::new(orchestrator.clone(), config.invalidation.clone()));
        let predictor = Arc::new(PredictorInterface::new(
            orchestrator.clone(),
            access_stream,
            config.predictor.max_concurrent_warms,
            config.predictor.warm_batch_size,
        ));
        Ok(Self {
            orchestrator,
            memoizer,
            loader,
            invalidation,
            predictor,
            config,
            sweep_handle: parking_lot::Mutex::new(None),
            maintenance_handle: parking_lot::Mutex::new(None),
        })
    }

    /// Start the invalidation controller's periodic TTL sweep and the
    /// orchestrator's periodic frequency-decay pass. Idempotent — calling it
    /// twice replaces the previous tasks.
    pub fn start_background_tasks(&self) {
        let handle = self.invalidation.spawn_scheduled_sweep();
        let mut slot = self.sweep_handle.lock();
        if let Some(old) = slot.replace(handle) {
            old.abort();
        }
        let maintenance = self.orchestrator.spawn_maintenance_task();
        let mut slot = self.maintenance_handle.lock();
        if let Some(old) = slot.replace(maintenance) {
            old.abort();
        }
    }

    pub fn orchestrator(&self) -> &Arc<TierOrchestrator<V>> {
        &self.orchestrator
    }

    pub fn memoizer(&self) -> &Arc<QueryMemoizer<V>> {
        &self.memoizer
    }

    pub fn loader(&self) -> &Arc<IncrementalLoader<V>> {
        &self.loader
    }

    pub fn invalidation(&self) -> &Arc<InvalidationController<V>> {
        &self.invalidation
    }

    pub fn predictor(&self) -> &Arc<PredictorInterface<V>> {
        &self.predictor
    }

    pub async fn get(&self, key: &[u8]) -> Outcome<V> {
        self.orchestrator.get(key).await
    }

    pub async fn set(&self, key: &[u8], value: V, ttl: Option<Duration>, tags: Vec<String>) -> bool {
        self.orchestrator.set(key, value, ttl, tags).await
    }

    pub async fn delete(&self, key: &[u8]) -> bool {
        self.orchestrator.delete(key).await
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }
}

impl<V> Component for Engine<V>
where
    V: Clone + Send + Sync + Sizeable + Serialize + DeserializeOwned + 'static,
{
    fn health_check(&self) -> HealthStatus {
        self.orchestrator.health_check()
    }

    fn shutdown(&self) {
        if let Some(handle) = self.sweep_handle.lock().take() {
            handle.abort();
        }
        if let Some(handle) = self.maintenance_handle.lock().take() {
            handle.abort();
        }
        self.orchestrator.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn engine_roundtrips_a_value() {
        let engine: Engine<String> = Engine::new(EngineConfig::default()).unwrap();
        engine.set(b"k", "v".to_string(), None, vec![]).await;
        assert_eq!(engine.get(b"k").await, Outcome::Ok("v".to_string()));
    }

    #[tokio::test]
    async fn invalid_config_is_rejected() {
        let mut config = EngineConfig::default();
        config.hot.max_entries = 0;
        let result: Result<Engine<String>> = Engine::new(config);
        assert!(result.is_err());
    }
}
