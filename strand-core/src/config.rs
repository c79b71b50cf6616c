//! Engine Configuration
//!
//! Runtime knobs for the session manager and dispatcher. The schema itself
//! is not configurable at runtime; it is built once at startup.

use std::time::Duration;

/// Tunable limits for the state engine.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Upper bound on waiting for a single node lock during dispatch.
    /// Exceeding it fails the event with `EventError::LockTimeout`; it does
    /// not bound handler execution time.
    pub lock_timeout: Duration,

    /// Sessions idle longer than this are eligible for `evict_idle`.
    pub session_ttl: Duration,

    /// Soft cap on live sessions; `enforce_capacity` evicts the least
    /// recently used sessions beyond it.
    pub max_sessions: usize,

    /// Total passes (initial + chained) one dispatch may run before it is
    /// cut off with `EventError::ChainOverflow`. Guards against handlers
    /// that enqueue themselves forever.
    pub max_chained_events: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            lock_timeout: Duration::from_millis(500),
            session_ttl: Duration::from_secs(30 * 60),
            max_sessions: 4096,
            max_chained_events: 32,
        }
    }
}
