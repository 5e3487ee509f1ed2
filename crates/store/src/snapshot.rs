//! Pluggable, advisory snapshot backend.
//!
//! A snapshot is never the source of truth: it's an optimization that lets
//! the repository skip replaying an aggregate's full history. Losing all
//! snapshots must never change observable behavior, only performance.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use eventweave_core::AggregateId;
use serde_json::Value as JsonValue;

/// When a repository should take a new snapshot after a successful append.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SnapshotStrategy {
    /// Never snapshot; every load replays from scratch.
    Never,
    /// Snapshot once at least `n` events have been applied since the last one.
    AfterNEvents(u64),
    /// Snapshot once at least `d` has elapsed since the last snapshot.
    AfterTime(Duration),
}

/// A stored snapshot: the aggregate's serialized state at a given version.
#[derive(Debug, Clone)]
pub struct StoredSnapshot {
    pub version: u64,
    pub state: JsonValue,
}

/// Advisory cache of aggregate snapshots, keyed by aggregate id.
///
/// Implementations must tolerate being completely empty at any time; a miss
/// simply means the repository replays from the beginning of the stream.
pub trait SnapshotBackend: Send + Sync {
    fn load(&self, aggregate_id: AggregateId) -> Option<StoredSnapshot>;

    fn store(&self, aggregate_id: AggregateId, snapshot: StoredSnapshot);

    fn invalidate(&self, aggregate_id: AggregateId);
}

/// Always misses; never retains anything. The safe default.
#[derive(Debug, Default)]
pub struct NoOpSnapshotBackend;

impl SnapshotBackend for NoOpSnapshotBackend {
    fn load(&self, _aggregate_id: AggregateId) -> Option<StoredSnapshot> {
        None
    }

    fn store(&self, _aggregate_id: AggregateId, _snapshot: StoredSnapshot) {}

    fn invalidate(&self, _aggregate_id: AggregateId) {}
}

/// In-memory snapshot backend for tests/dev.
#[derive(Debug, Default)]
pub struct InMemorySnapshotBackend {
    snapshots: Mutex<HashMap<AggregateId, StoredSnapshot>>,
}

impl InMemorySnapshotBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SnapshotBackend for InMemorySnapshotBackend {
    fn load(&self, aggregate_id: AggregateId) -> Option<StoredSnapshot> {
        self.snapshots
            .lock()
            .ok()
            .and_then(|guard| guard.get(&aggregate_id).cloned())
    }

    fn store(&self, aggregate_id: AggregateId, snapshot: StoredSnapshot) {
        if let Ok(mut guard) = self.snapshots.lock() {
            guard.insert(aggregate_id, snapshot);
        }
    }

    fn invalidate(&self, aggregate_id: AggregateId) {
        if let Ok(mut guard) = self.snapshots.lock() {
            guard.remove(&aggregate_id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn noop_backend_always_misses() {
        let backend = NoOpSnapshotBackend;
        let id = AggregateId::new();
        backend.store(
            id,
            StoredSnapshot {
                version: 5,
                state: serde_json::json!({}),
            },
        );
        assert!(backend.load(id).is_none());
    }

    #[test]
    fn in_memory_backend_round_trips() {
        let backend = InMemorySnapshotBackend::new();
        let id = AggregateId::new();
        backend.store(
            id,
            StoredSnapshot {
                version: 3,
                state: serde_json::json!({"balance": 10}),
            },
        );
        let loaded = backend.load(id).unwrap();
        assert_eq!(loaded.version, 3);
        backend.invalidate(id);
        assert!(backend.load(id).is_none());
    }
}
