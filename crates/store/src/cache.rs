//! Pluggable, advisory in-process aggregate cache.
//!
//! Distinct from [`crate::SnapshotBackend`]: a snapshot is a durable
//! optimization consulted on cold load, while the cache holds a hydrated
//! aggregate's state across dispatches within the same process. A cached
//! aggregate is advisory, never authoritative: the repository always checks
//! the cached version against the store's current stream version before
//! using it, and replays only the delta on a mismatch.

use std::collections::HashMap;
use std::sync::Mutex;

use eventweave_core::AggregateId;
use serde_json::Value as JsonValue;

/// When the repository should populate the cache after a load or append.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CachePolicy {
    /// Never populate the cache; every load goes through the snapshot/replay path.
    NeverCache,
    /// Always populate the cache after a successful load or append.
    AlwaysCache,
}

/// A cached aggregate: its serialized state and the stream version it
/// reflects, so the repository can detect staleness.
#[derive(Debug, Clone)]
pub struct CachedAggregate {
    pub version: u64,
    pub state: JsonValue,
}

/// Advisory, in-process cache of hydrated aggregate state.
pub trait AggregateCache: Send + Sync {
    fn get(&self, aggregate_id: AggregateId) -> Option<CachedAggregate>;

    fn put(&self, aggregate_id: AggregateId, cached: CachedAggregate);

    fn invalidate(&self, aggregate_id: AggregateId);
}

/// Always misses; never retains anything. The safe default.
#[derive(Debug, Default)]
pub struct NoOpAggregateCache;

impl AggregateCache for NoOpAggregateCache {
    fn get(&self, _aggregate_id: AggregateId) -> Option<CachedAggregate> {
        None
    }

    fn put(&self, _aggregate_id: AggregateId, _cached: CachedAggregate) {}

    fn invalidate(&self, _aggregate_id: AggregateId) {}
}

/// In-memory aggregate cache for tests/dev and single-process deployments.
#[derive(Debug, Default)]
pub struct InMemoryAggregateCache {
    entries: Mutex<HashMap<AggregateId, CachedAggregate>>,
}

impl InMemoryAggregateCache {
    pub fn new() -> Self {
        Self::default()
    }
}

impl AggregateCache for InMemoryAggregateCache {
    fn get(&self, aggregate_id: AggregateId) -> Option<CachedAggregate> {
        self.entries
            .lock()
            .ok()
            .and_then(|guard| guard.get(&aggregate_id).cloned())
    }

    fn put(&self, aggregate_id: AggregateId, cached: CachedAggregate) {
        if let Ok(mut guard) = self.entries.lock() {
            guard.insert(aggregate_id, cached);
        }
    }

    fn invalidate(&self, aggregate_id: AggregateId) {
        if let Ok(mut guard) = self.entries.lock() {
            guard.remove(&aggregate_id);
        }
    }
}
