// Circuit breaker + remote-tier adapter, grounded on the teacher's
// `orchestration::circuit_breaker::CircuitBreaker` (Closed/Open/HalfOpen state
// machine, atomic counters, `call` wrapping a timeout) generalized from
// database-node calls to the L3 remote cache tier (spec.md §4.2).

use crate::error::{CacheError, Result};
use async_trait::async_trait;
use crossbeam::utils::CachePadded;
use parking_lot::RwLock;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    pub failure_threshold: u32,
    pub success_threshold: u32,
    pub call_timeout: Duration,
    pub reset_timeout: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 2,
            call_timeout: Duration::from_secs(2),
            reset_timeout: Duration::from_secs(30),
        }
    }
}

struct State {
    kind: CircuitState,
    consecutive_failures: u32,
    consecutive_successes: u32,
    opened_at: Option<Instant>,
}

/// Guards calls into the L3 remote tier. Trips open after `failure_threshold`
/// consecutive failures, probes again after `reset_timeout`, and fully closes
/// once `success_threshold` consecutive half-open calls succeed (spec.md §4.2).
pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    state: RwLock<State>,
    // Padded so the four independently-incremented counters don't share a
    // cache line under concurrent remote-tier traffic.
    total_calls: CachePadded<AtomicU64>,
    successful_calls: CachePadded<AtomicU64>,
    failed_calls: CachePadded<AtomicU64>,
    rejected_calls: CachePadded<AtomicU64>,
}

impl CircuitBreaker {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            state: RwLock::new(State {
                kind: CircuitState::Closed,
                consecutive_failures: 0,
                consecutive_successes: 0,
                opened_at: None,
            }),
            total_calls: CachePadded::new(AtomicU64::new(0)),
            successful_calls: CachePadded::new(AtomicU64::new(0)),
            failed_calls: CachePadded::new(AtomicU64::new(0)),
            rejected_calls: CachePadded::new(AtomicU64::new(0)),
        }
    }

    pub fn state(&self) -> CircuitState {
        let mut state = self.state.write();
        if state.kind == CircuitState::Open {
            if let Some(opened_at) = state.opened_at {
                if opened_at.elapsed() >= self.config.reset_timeout {
                    state.kind = CircuitState::HalfOpen;
                    state.consecutive_successes = 0;
                }
            }
        }
        state.kind
    }

    fn on_success(&self) {
        self.successful_calls.fetch_add(1, Ordering::Relaxed);
        let mut state = self.state.write();
        match state.kind {
            CircuitState::HalfOpen => {
                state.consecutive_successes += 1;
                if state.consecutive_successes >= self.config.success_threshold {
                    state.kind = CircuitState::Closed;
                    state.consecutive_failures = 0;
                    state.opened_at = None;
                }
            }
            CircuitState::Closed => {
                state.consecutive_failures = 0;
            }
            CircuitState::Open => {}
        }
    }

    fn on_failure(&self) {
        self.failed_calls.fetch_add(1, Ordering::Relaxed);
        let mut state = self.state.write();
        match state.kind {
            CircuitState::HalfOpen => {
                state.kind = CircuitState::Open;
                state.opened_at = Some(Instant::now());
                state.consecutive_successes = 0;
            }
            CircuitState::Closed => {
                state.consecutive_failures += 1;
                if state.consecutive_failures >= self.config.failure_threshold {
                    state.kind = CircuitState::Open;
                    state.opened_at = Some(Instant::now());
                }
            }
            CircuitState::Open => {}
        }
    }

    /// Run `f` under the breaker. Rejects immediately while open, otherwise
    /// runs `f` under `call_timeout` and feeds the outcome back into the state
    /// machine.
    pub async fn call<F, T>(&self, f: F) -> Result<T>
    where
        F: std::future::Future<Output = Result<T>>,
    {
        self.total_calls.fetch_add(1, Ordering::Relaxed);
        if self.state() == CircuitState::Open {
            self.rejected_calls.fetch_add(1, Ordering::Relaxed);
            return Err(CacheError::BackendUnavailable("circuit open".into()));
        }
        match tokio::time::timeout(self.config.call_timeout, f).await {
            Ok(Ok(value)) => {
                self.on_success();
                Ok(value)
            }
            Ok(Err(e)) => {
                self.on_failure();
                Err(e)
            }
            Err(_) => {
                self.on_failure();
                Err(CacheError::ProducerTimeout(self.config.call_timeout))
            }
        }
    }

    pub fn stats(&self) -> CircuitBreakerStats {
        CircuitBreakerStats {
            state: self.state(),
            total_calls: self.total_calls.load(Ordering::Relaxed),
            successful_calls: self.successful_calls.load(Ordering::Relaxed),
            failed_calls: self.failed_calls.load(Ordering::Relaxed),
            rejected_calls: self.rejected_calls.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone)]
pub struct CircuitBreakerStats {
    pub state: CircuitState,
    pub total_calls: u64,
    pub successful_calls: u64,
    pub failed_calls: u64,
    pub rejected_calls: u64,
}

/// Byte-oriented remote backend for the optional L3 tier. Kept as a trait so
/// the orchestrator doesn't depend on a concrete client, and so tests can
/// supply an in-memory fake (spec.md §4.2 Non-goals: no bundled remote
/// backend beyond an optional adapter).
#[async_trait]
pub trait RemoteTier: Send + Sync {
    async fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>>;
    async fn set(&self, key: &[u8], value: Vec<u8>, ttl: Duration) -> Result<()>;
    async fn delete(&self, key: &[u8]) -> Result<()>;
}

/// Wraps any `RemoteTier` with a circuit breaker so the orchestrator never
/// calls the backend directly.
pub struct GuardedRemoteTier {
    inner: Arc<dyn RemoteTier>,
    breaker: CircuitBreaker,
}

impl GuardedRemoteTier {
    pub fn new(inner: Arc<dyn RemoteTier>, config: CircuitBreakerConfig) -> Self {
        Self {
            inner,
            breaker: CircuitBreaker::new(config),
        }
    }

    pub async fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let inner = self.inner.clone();
        let key = key.to_vec();
        self.breaker.call(async move { inner.get(&key).await }).await
    }

    pub async fn set(&self, key: &[u8], value: Vec<u8>, ttl: Duration) -> Result<()> {
        let inner = self.inner.clone();
        let key = key.to_vec();
        self.breaker.call(async move { inner.set(&key, value, ttl).await }).await
    }

    pub async fn delete(&self, key: &[u8]) -> Result<()> {
        let inner = self.inner.clone();
        let key = key.to_vec();
        self.breaker.call(async move { inner.delete(&key).await }).await
    }

    pub fn circuit_stats(&self) -> CircuitBreakerStats {
        self.breaker.stats()
    }
}

#[cfg(feature = "remote-redis")]
pub mod redis_adapter {
    use super::*;
    use redis::aio::ConnectionManager;
    use redis::AsyncCommands;

    /// Thin adapter over `redis::aio::ConnectionManager`. Values are opaque
    /// bytes — serialization happens one layer up in the orchestrator.
    pub struct RedisTier {
        conn: ConnectionManager,
    }

    impl RedisTier {
        pub async fn connect(url: &str) -> Result<Self> {
            let client = redis::Client::open(url)
                .map_err(|e| CacheError::BackendUnavailable(e.to_string()))?;
            let conn = client
                .get_connection_manager()
                .await
                .map_err(|e| CacheError::BackendUnavailable(e.to_string()))?;
            Ok(Self { conn })
        }
    }

    #[async_trait]
    impl RemoteTier for RedisTier {
        async fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
            let mut conn = self.conn.clone();
            conn.get(key)
                .await
                .map_err(|e| CacheError::BackendUnavailable(e.to_string()))
        }

        async fn set(&self, key: &[u8], value: Vec<u8>, ttl: Duration) -> Result<()> {
            let mut conn = self.conn.clone();
            let secs = ttl.as_secs().max(1);
            conn.set_ex(key, value, secs)
                .await
                .map_err(|e| CacheError::BackendUnavailable(e.to_string()))
        }

        async fn delete(&self, key: &[u8]) -> Result<()> {
            let mut conn = self.conn.clone();
            conn.del(key)
                .await
                .map_err(|e| CacheError::BackendUnavailable(e.to_string()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;

    struct FlakyRemote {
        fail: AtomicBool,
    }

    #[async_trait]
    impl RemoteTier for FlakyRemote {
        async fn get(&self, _key: &[u8]) -> Result<Option<Vec<u8>>> {
            if self.fail.load(Ordering::Relaxed) {
                Err(CacheError::BackendUnavailable("down".into()))
            } else {
                Ok(Some(vec![1, 2, 3]))
            }
        }
        async fn set(&self, _key: &[u8], _value: Vec<u8>, _ttl: Duration) -> Result<()> {
            Ok(())
        }
        async fn delete(&self, _key: &[u8]) -> Result<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn breaker_opens_after_threshold_failures() {
        let remote = Arc::new(FlakyRemote { fail: AtomicBool::new(true) });
        let guarded = GuardedRemoteTier::new(
            remote.clone(),
            CircuitBreakerConfig { failure_threshold: 3, ..Default::default() },
        );
        for _ in 0..3 {
            let _ = guarded.get(b"k").await;
        }
        assert_eq!(guarded.circuit_stats().state, CircuitState::Open);
        let result = guarded.get(b"k").await;
        assert!(matches!(result, Err(CacheError::BackendUnavailable(_))));
    }

    #[tokio::test]
    async fn breaker_recovers_after_reset_timeout() {
        let remote = Arc::new(FlakyRemote { fail: AtomicBool::new(true) });
        let guarded = GuardedRemoteTier::new(
            remote.clone(),
            CircuitBreakerConfig {
                failure_threshold: 1,
                success_threshold: 1,
                reset_timeout: Duration::from_millis(10),
                ..Default::default()
            },
        );
        let _ = guarded.get(b"k").await;
        assert_eq!(guarded.circuit_stats().state, CircuitState::Open);
        remote.fail.store(false, Ordering::Relaxed);
        tokio::time::sleep(Duration::from_millis(20)).await;
        let result = guarded.get(b"k").await;
        assert!(result.is_ok());
        assert_eq!(guarded.circuit_stats().state, CircuitState::Closed);
    }
}
