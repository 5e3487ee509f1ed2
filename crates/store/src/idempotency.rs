//! Pluggable idempotency backend for exactly-once command processing.
//!
//! Keyed by a caller-supplied idempotency key (see `Command::idempotency_key`
//! in `eventweave-messaging`). A hit short-circuits dispatch and replays the
//! previously committed event ids; a miss lets dispatch proceed and records
//! the outcome only after the terminal handler succeeds.

use std::collections::HashMap;
use std::sync::Mutex;

use uuid::Uuid;

/// Advisory record of a command's prior successful outcome.
pub trait IdempotencyBackend: Send + Sync {
    /// Returns the event ids committed by a prior execution of this key, if any.
    fn check(&self, key: &str) -> Option<Vec<Uuid>>;

    /// Records that `key` committed `event_ids`. Only called after a terminal
    /// handler returns `Ok`.
    fn record(&self, key: &str, event_ids: Vec<Uuid>);
}

/// Always misses; every command is treated as novel. The safe default.
#[derive(Debug, Default)]
pub struct NoOpIdempotencyBackend;

impl IdempotencyBackend for NoOpIdempotencyBackend {
    fn check(&self, _key: &str) -> Option<Vec<Uuid>> {
        None
    }

    fn record(&self, _key: &str, _event_ids: Vec<Uuid>) {}
}

/// In-memory idempotency backend for tests/dev and single-process deployments.
#[derive(Debug, Default)]
pub struct InMemoryIdempotencyBackend {
    outcomes: Mutex<HashMap<String, Vec<Uuid>>>,
}

impl InMemoryIdempotencyBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

impl IdempotencyBackend for InMemoryIdempotencyBackend {
    fn check(&self, key: &str) -> Option<Vec<Uuid>> {
        self.outcomes.lock().ok().and_then(|guard| guard.get(key).cloned())
    }

    fn record(&self, key: &str, event_ids: Vec<Uuid>) {
        if let Ok(mut guard) = self.outcomes.lock() {
            guard.insert(key.to_string(), event_ids);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn records_and_replays_prior_outcome() {
        let backend = InMemoryIdempotencyBackend::new();
        assert!(backend.check("key-1").is_none());
        let ids = vec![Uuid::now_v7()];
        backend.record("key-1", ids.clone());
        assert_eq!(backend.check("key-1"), Some(ids));
    }
}
