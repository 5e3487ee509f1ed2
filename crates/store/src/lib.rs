//! Append-only event storage, the pluggable snapshot/cache/idempotency
//! backends that sit in front of it, and the event-schema upcaster pipeline.
//!
//! This crate owns persistence mechanics only: no command/query dispatch, no
//! aggregate decision logic. `eventweave-runtime` composes these pieces into
//! the aggregate repository and processor executor.

mod cache;
mod event_store;
mod idempotency;
mod snapshot;
mod upcaster;

pub use cache::{AggregateCache, CachePolicy, InMemoryAggregateCache, NoOpAggregateCache};
pub use event_store::{
    EventStore, EventStoreError, InMemoryEventStore, StoredEvent, UncommittedEvent,
};
pub use idempotency::{IdempotencyBackend, InMemoryIdempotencyBackend, NoOpIdempotencyBackend};
pub use snapshot::{InMemorySnapshotBackend, NoOpSnapshotBackend, SnapshotBackend, SnapshotStrategy};
pub use upcaster::{Upcaster, UpcasterChain, UpcasterError, UpcastStrategy};
