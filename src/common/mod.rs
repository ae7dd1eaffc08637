// # Common Types and Traits
//
// Shared types used across the tier store, orchestrator, memoizer, loader, and
// invalidation controller: component lifecycle, health reporting, and the outcome
// type that keeps hot-path APIs exception-free (spec.md §9, "Exceptions for control
// flow → explicit outcomes").

pub mod event;

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Health of a single component, or the engine as a whole.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

/// Lifecycle contract shared by every major engine component.
pub trait Component: Send + Sync {
    fn health_check(&self) -> HealthStatus;
    fn shutdown(&self);
}

/// Outcome of a hot-path cache operation. The engine never throws across component
/// boundaries (spec.md §9); every public entry point returns one of these instead.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome<T> {
    Ok(T),
    Miss,
    Rejected(String),
    Timeout,
    BackendUnavailable,
    InvalidArg(String),
}

impl<T> Outcome<T> {
    pub fn is_ok(&self) -> bool {
        matches!(self, Outcome::Ok(_))
    }

    pub fn ok(self) -> Option<T> {
        match self {
            Outcome::Ok(v) => Some(v),
            _ => None,
        }
    }
}

/// Priority levels shared by load requests, prefetch warming, and invalidation
/// scheduling — spec.md §3 `LoadRequest.priority`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Priority {
    Low,
    Medium,
    High,
    Critical,
}

impl Priority {
    /// Base weight used by the loader's chunk-priority formula (spec.md §4.4).
    pub fn base_weight(self) -> u32 {
        match self {
            Priority::Critical => 4,
            Priority::High => 3,
            Priority::Medium => 2,
            Priority::Low => 1,
        }
    }
}

/// Monotonic clock wrapper kept as a single seam so tests can reason about elapsed
/// time without depending on wall-clock `SystemTime`.
pub type Clock = std::time::Instant;

/// Human-readable duration rendering used across stats summaries.
pub fn fmt_duration(d: Duration) -> String {
    if d.as_secs() > 0 {
        format!("{:.2}s", d.as_secs_f64())
    } else {
        format!("{}ms", d.as_millis())
    }
}
