//! Append-only event store boundary.
//!
//! This module defines an infrastructure-facing abstraction for storing and
//! loading event streams without making storage-backend assumptions.

use std::collections::HashMap;
use std::sync::RwLock;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;
use uuid::Uuid;

use eventweave_core::{AggregateId, CausationId, CorrelationId, ExpectedVersion};
use eventweave_messaging::{Event, EventEnvelope};

/// An event ready to be appended to a stream (not yet assigned a sequence number).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UncommittedEvent {
    pub event_id: Uuid,
    pub aggregate_id: AggregateId,
    pub aggregate_type: String,

    pub event_type: String,
    pub event_version: u32,
    pub occurred_at: DateTime<Utc>,

    pub correlation_id: Option<CorrelationId>,
    pub causation_id: Option<CausationId>,

    pub payload: JsonValue,
}

impl UncommittedEvent {
    /// Convenience constructor from a typed event payload.
    pub fn from_typed<E>(
        aggregate_id: AggregateId,
        aggregate_type: impl Into<String>,
        event_id: Uuid,
        correlation_id: Option<CorrelationId>,
        causation_id: Option<CausationId>,
        event: &E,
    ) -> Result<Self, EventStoreError>
    where
        E: Event + Serialize,
    {
        let payload = serde_json::to_value(event).map_err(|e| {
            EventStoreError::InvalidAppend(format!("payload serialization failed: {e}"))
        })?;

        Ok(Self {
            event_id,
            aggregate_id,
            aggregate_type: aggregate_type.into(),
            event_type: event.event_type().to_string(),
            event_version: event.version(),
            occurred_at: event.occurred_at(),
            correlation_id,
            causation_id,
            payload,
        })
    }
}

/// A stored event in an append-only stream (assigned a sequence number).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredEvent {
    pub event_id: Uuid,
    pub aggregate_id: AggregateId,
    pub aggregate_type: String,

    /// Monotonically increasing position in the aggregate stream.
    pub sequence_number: u64,

    pub event_type: String,
    pub event_version: u32,
    pub occurred_at: DateTime<Utc>,

    pub correlation_id: Option<CorrelationId>,
    pub causation_id: Option<CausationId>,

    pub payload: JsonValue,
}

impl StoredEvent {
    pub fn stream_version(&self) -> u64 {
        self.sequence_number
    }

    /// Converts a stored event into an envelope for publication, preserving
    /// every piece of envelope metadata.
    pub fn to_envelope(&self) -> EventEnvelope<JsonValue> {
        EventEnvelope::new(
            self.event_id,
            self.aggregate_id,
            self.aggregate_type.clone(),
            self.sequence_number,
            self.event_type.clone(),
            self.payload.clone(),
        )
        .with_occurred_at(self.occurred_at)
        .with_correlation_id(self.correlation_id)
        .with_causation_id(self.causation_id)
    }
}

#[derive(Debug, Error)]
pub enum EventStoreError {
    #[error("optimistic concurrency check failed: {0}")]
    Concurrency(String),

    #[error("aggregate type mismatch: {0}")]
    AggregateTypeMismatch(String),

    #[error("invalid append: {0}")]
    InvalidAppend(String),

    #[error("event publication failed: {0}")]
    Publish(String),

    /// Returned by the default `rewrite` implementation. Rewrite is an
    /// optional capability; eager upcasting degrades to lazy behavior when
    /// a backend doesn't support it.
    #[error("rewrite not supported by this event store backend")]
    Unsupported,
}

/// Append-only event store.
///
/// - **No storage assumptions** (works for in-memory tests/dev and future
///   SQL-backed implementations)
/// - **Optimistic locking** via `ExpectedVersion`
pub trait EventStore: Send + Sync {
    /// Appends events to an aggregate stream (append-only).
    ///
    /// Implementations must:
    /// - enforce optimistic concurrency against the current stream version
    /// - assign monotonically increasing `sequence_number`s starting at
    ///   `current_version + 1`
    fn append(
        &self,
        events: Vec<UncommittedEvent>,
        expected_version: ExpectedVersion,
    ) -> Result<Vec<StoredEvent>, EventStoreError>;

    /// Loads the full stream for an aggregate.
    fn load(&self, aggregate_id: AggregateId) -> Result<Vec<StoredEvent>, EventStoreError>;

    /// Replaces the stored payload/type of a single event in place, preserving
    /// its sequence number. Used by eager upcasting.
    ///
    /// Not every backend can support rewriting history transactionally;
    /// backends that can't should leave the default, which always errors with
    /// `EventStoreError::Unsupported`.
    fn rewrite(
        &self,
        _aggregate_id: AggregateId,
        _event_id: Uuid,
        _event_type: String,
        _payload: JsonValue,
    ) -> Result<(), EventStoreError> {
        Err(EventStoreError::Unsupported)
    }
}

impl<S> EventStore for std::sync::Arc<S>
where
    S: EventStore + ?Sized,
{
    fn append(
        &self,
        events: Vec<UncommittedEvent>,
        expected_version: ExpectedVersion,
    ) -> Result<Vec<StoredEvent>, EventStoreError> {
        (**self).append(events, expected_version)
    }

    fn load(&self, aggregate_id: AggregateId) -> Result<Vec<StoredEvent>, EventStoreError> {
        (**self).load(aggregate_id)
    }

    fn rewrite(
        &self,
        aggregate_id: AggregateId,
        event_id: Uuid,
        event_type: String,
        payload: JsonValue,
    ) -> Result<(), EventStoreError> {
        (**self).rewrite(aggregate_id, event_id, event_type, payload)
    }
}

/// In-memory append-only event store.
///
/// Intended for tests/dev. Supports `rewrite` unconditionally, since swapping
/// an element of an in-process `Vec` needs none of the careful transactional
/// handling a SQL-backed store would.
#[derive(Debug, Default)]
pub struct InMemoryEventStore {
    streams: RwLock<HashMap<AggregateId, Vec<StoredEvent>>>,
}

impl InMemoryEventStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn current_version(stream: &[StoredEvent]) -> u64 {
        stream.last().map(|e| e.sequence_number).unwrap_or(0)
    }
}

impl EventStore for InMemoryEventStore {
    fn append(
        &self,
        events: Vec<UncommittedEvent>,
        expected_version: ExpectedVersion,
    ) -> Result<Vec<StoredEvent>, EventStoreError> {
        if events.is_empty() {
            return Ok(vec![]);
        }

        let aggregate_id = events[0].aggregate_id;
        let aggregate_type = events[0].aggregate_type.clone();

        for (idx, e) in events.iter().enumerate() {
            if e.aggregate_id != aggregate_id {
                return Err(EventStoreError::InvalidAppend(format!(
                    "batch contains multiple aggregate_ids (index {idx})"
                )));
            }
            if e.aggregate_type != aggregate_type {
                return Err(EventStoreError::AggregateTypeMismatch(format!(
                    "batch contains multiple aggregate_types (index {idx})"
                )));
            }
        }

        let mut streams = self
            .streams
            .write()
            .map_err(|_| EventStoreError::InvalidAppend("lock poisoned".to_string()))?;

        let stream = streams.entry(aggregate_id).or_default();
        let current = Self::current_version(stream);

        if !expected_version.matches(current) {
            return Err(EventStoreError::Concurrency(format!(
                "expected {expected_version:?}, found {current}"
            )));
        }

        if let Some(existing) = stream.first() {
            if existing.aggregate_type != aggregate_type {
                return Err(EventStoreError::AggregateTypeMismatch(format!(
                    "stream aggregate_type is '{}', attempted append with '{}'",
                    existing.aggregate_type, aggregate_type
                )));
            }
        }

        let mut next = current + 1;
        let mut committed = Vec::with_capacity(events.len());
        for e in events {
            let stored = StoredEvent {
                event_id: e.event_id,
                aggregate_id: e.aggregate_id,
                aggregate_type: e.aggregate_type,
                sequence_number: next,
                event_type: e.event_type,
                event_version: e.event_version,
                occurred_at: e.occurred_at,
                correlation_id: e.correlation_id,
                causation_id: e.causation_id,
                payload: e.payload,
            };
            next += 1;
            stream.push(stored.clone());
            committed.push(stored);
        }

        Ok(committed)
    }

    fn load(&self, aggregate_id: AggregateId) -> Result<Vec<StoredEvent>, EventStoreError> {
        let streams = self
            .streams
            .read()
            .map_err(|_| EventStoreError::InvalidAppend("lock poisoned".to_string()))?;

        Ok(streams.get(&aggregate_id).cloned().unwrap_or_default())
    }

    fn rewrite(
        &self,
        aggregate_id: AggregateId,
        event_id: Uuid,
        event_type: String,
        payload: JsonValue,
    ) -> Result<(), EventStoreError> {
        let mut streams = self
            .streams
            .write()
            .map_err(|_| EventStoreError::InvalidAppend("lock poisoned".to_string()))?;

        let stream = streams
            .get_mut(&aggregate_id)
            .ok_or_else(|| EventStoreError::InvalidAppend("no such stream".to_string()))?;

        let event = stream
            .iter_mut()
            .find(|e| e.event_id == event_id)
            .ok_or_else(|| EventStoreError::InvalidAppend("no such event".to_string()))?;

        event.event_type = event_type;
        event.payload = payload;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(aggregate_id: AggregateId, event_type: &str) -> UncommittedEvent {
        UncommittedEvent {
            event_id: Uuid::now_v7(),
            aggregate_id,
            aggregate_type: "test.thing".to_string(),
            event_type: event_type.to_string(),
            event_version: 1,
            occurred_at: Utc::now(),
            correlation_id: None,
            causation_id: None,
            payload: serde_json::json!({}),
        }
    }

    #[test]
    fn append_assigns_sequential_sequence_numbers() {
        let store = InMemoryEventStore::new();
        let aggregate_id = AggregateId::new();
        let committed = store
            .append(
                vec![event(aggregate_id, "a"), event(aggregate_id, "b")],
                ExpectedVersion::Exact(0),
            )
            .unwrap();
        assert_eq!(committed[0].sequence_number, 1);
        assert_eq!(committed[1].sequence_number, 2);
    }

    #[test]
    fn append_rejects_stale_expected_version() {
        let store = InMemoryEventStore::new();
        let aggregate_id = AggregateId::new();
        store
            .append(vec![event(aggregate_id, "a")], ExpectedVersion::Exact(0))
            .unwrap();
        let result = store.append(vec![event(aggregate_id, "b")], ExpectedVersion::Exact(0));
        assert!(matches!(result, Err(EventStoreError::Concurrency(_))));
    }

    #[test]
    fn rewrite_replaces_payload_in_place() {
        let store = InMemoryEventStore::new();
        let aggregate_id = AggregateId::new();
        let committed = store
            .append(vec![event(aggregate_id, "a")], ExpectedVersion::Exact(0))
            .unwrap();
        let event_id = committed[0].event_id;

        store
            .rewrite(aggregate_id, event_id, "a.v2".to_string(), serde_json::json!({"v": 2}))
            .unwrap();

        let reloaded = store.load(aggregate_id).unwrap();
        assert_eq!(reloaded[0].event_type, "a.v2");
        assert_eq!(reloaded[0].sequence_number, 1);
    }

    #[test]
    fn load_on_unknown_aggregate_is_empty() {
        let store = InMemoryEventStore::new();
        assert!(store.load(AggregateId::new()).unwrap().is_empty());
    }
}

#[cfg(test)]
mod proptests {
    use super::*;
    use proptest::prelude::*;

    fn event(aggregate_id: AggregateId) -> UncommittedEvent {
        UncommittedEvent {
            event_id: Uuid::now_v7(),
            aggregate_id,
            aggregate_type: "test.thing".to_string(),
            event_type: "happened".to_string(),
            event_version: 1,
            occurred_at: Utc::now(),
            correlation_id: None,
            causation_id: None,
            payload: serde_json::json!({}),
        }
    }

    proptest! {
        /// Appending `n` batches of sizes drawn from `sizes` always leaves the
        /// stream with sequence numbers 1..=total, contiguous and gapless,
        /// regardless of how the total is split across append calls.
        #[test]
        fn append_sequence_numbers_are_contiguous(sizes in proptest::collection::vec(1usize..5, 1..10)) {
            let store = InMemoryEventStore::new();
            let aggregate_id = AggregateId::new();
            let mut expected_next = 1u64;

            for size in sizes {
                let batch: Vec<UncommittedEvent> = (0..size).map(|_| event(aggregate_id)).collect();
                let current = expected_next - 1;
                let committed = store
                    .append(batch, ExpectedVersion::Exact(current))
                    .unwrap();
                for stored in &committed {
                    prop_assert_eq!(stored.sequence_number, expected_next);
                    expected_next += 1;
                }
            }

            let loaded = store.load(aggregate_id).unwrap();
            prop_assert_eq!(loaded.len() as u64, expected_next - 1);
            for (idx, stored) in loaded.iter().enumerate() {
                prop_assert_eq!(stored.sequence_number, idx as u64 + 1);
            }
        }

        /// A load always returns a stream whose version equals the number of
        /// events successfully appended to it, independent of batch sizing.
        #[test]
        fn load_reflects_total_appended_version(sizes in proptest::collection::vec(1usize..5, 0..10)) {
            let store = InMemoryEventStore::new();
            let aggregate_id = AggregateId::new();
            let mut current = 0u64;

            for size in sizes {
                let batch: Vec<UncommittedEvent> = (0..size).map(|_| event(aggregate_id)).collect();
                store.append(batch, ExpectedVersion::Exact(current)).unwrap();
                current += size as u64;
            }

            let loaded = store.load(aggregate_id).unwrap();
            prop_assert_eq!(loaded.len() as u64, current);
            prop_assert_eq!(loaded.last().map(|e| e.sequence_number).unwrap_or(0), current);
        }

        /// An append at a stale `Exact` expected version is always rejected,
        /// and rejecting it never mutates the stream.
        #[test]
        fn stale_append_is_rejected_and_leaves_stream_unchanged(
            first_size in 1usize..5,
            stale_offset in 1u64..5,
        ) {
            let store = InMemoryEventStore::new();
            let aggregate_id = AggregateId::new();
            let batch: Vec<UncommittedEvent> = (0..first_size).map(|_| event(aggregate_id)).collect();
            store.append(batch, ExpectedVersion::Exact(0)).unwrap();

            let before = store.load(aggregate_id).unwrap();
            let stale_version = (first_size as u64).saturating_sub(stale_offset);
            let result = store.append(vec![event(aggregate_id)], ExpectedVersion::Exact(stale_version));

            prop_assert!(result.is_err());
            let after = store.load(aggregate_id).unwrap();
            prop_assert_eq!(before, after);
        }
    }
}
