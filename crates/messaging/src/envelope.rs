use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use eventweave_core::{AggregateId, CausationId, CorrelationId};

/// Envelope for an event, containing stream metadata.
///
/// An `EventEnvelope` wraps a domain event with the infrastructure metadata
/// needed for event sourcing. This is the **unit of persistence**: what gets
/// stored in the event store and published to the event bus.
///
/// ## Why Envelopes?
///
/// Envelopes separate infrastructure concerns (ordering, identity, stream
/// membership, causal metadata) from domain concerns (business events):
///
/// - **Event ordering**: sequence numbers enable deterministic replay and
///   detect duplicates
/// - **Stream management**: aggregate type + id enable efficient querying
/// - **Causal tracing**: correlation/causation ids let an event be traced
///   back to the command (or parent event) that produced it
/// - **Domain purity**: domain events remain infrastructure-agnostic
///
/// ```text
/// Domain Event (InventoryEvent::StockAdjusted)
///     ↓
/// EventEnvelope { aggregate_id, sequence_number, payload: event }
///     ↓
/// Event Store / Event Bus (infrastructure layer)
/// ```
///
/// ## Sequence Numbers
///
/// `sequence_number` is monotonically increasing per aggregate stream,
/// starting at 1 (0 is invalid). It provides ordering, duplicate detection,
/// and is the quantity `ExpectedVersion` checks against on append.
///
/// ## Generic Payload
///
/// The `E` type parameter lets envelopes carry different payload shapes:
/// `EventEnvelope<serde_json::Value>` for storage/transport, or
/// `EventEnvelope<InventoryEvent>` for strongly-typed domain code.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventEnvelope<E> {
    event_id: Uuid,

    aggregate_id: AggregateId,
    aggregate_type: String,

    /// Monotonically increasing position in the aggregate stream.
    sequence_number: u64,

    /// When the event was assigned a sequence number (UTC, assigned at emit).
    occurred_at: DateTime<Utc>,

    /// Trace id threading this event back to the operation that started the
    /// causal chain.
    correlation_id: Option<CorrelationId>,
    /// Id of whatever directly produced this event, typically the command
    /// id the aggregate was handling when it emitted the event.
    causation_id: Option<CausationId>,

    /// Stable payload type tag, carried alongside
    /// the payload itself since a JSON-erased envelope can't recover it from
    /// `payload` the way a strongly-typed one could from `Event::event_type`.
    event_type: String,

    payload: E,
}

impl<E> EventEnvelope<E> {
    /// Builds an envelope with no causal metadata and `occurred_at` set to
    /// now. Prefer `with_correlation_id`/`with_causation_id`/`with_occurred_at`
    /// to fill those in when they're known.
    pub fn new(
        event_id: Uuid,
        aggregate_id: AggregateId,
        aggregate_type: impl Into<String>,
        sequence_number: u64,
        event_type: impl Into<String>,
        payload: E,
    ) -> Self {
        Self {
            event_id,
            aggregate_id,
            aggregate_type: aggregate_type.into(),
            sequence_number,
            occurred_at: Utc::now(),
            correlation_id: None,
            causation_id: None,
            event_type: event_type.into(),
            payload,
        }
    }

    pub fn with_occurred_at(mut self, occurred_at: DateTime<Utc>) -> Self {
        self.occurred_at = occurred_at;
        self
    }

    pub fn with_correlation_id(mut self, correlation_id: Option<CorrelationId>) -> Self {
        self.correlation_id = correlation_id;
        self
    }

    pub fn with_causation_id(mut self, causation_id: Option<CausationId>) -> Self {
        self.causation_id = causation_id;
        self
    }

    pub fn event_id(&self) -> Uuid {
        self.event_id
    }

    pub fn aggregate_id(&self) -> AggregateId {
        self.aggregate_id
    }

    pub fn aggregate_type(&self) -> &str {
        &self.aggregate_type
    }

    pub fn sequence_number(&self) -> u64 {
        self.sequence_number
    }

    pub fn event_type(&self) -> &str {
        &self.event_type
    }

    pub fn occurred_at(&self) -> DateTime<Utc> {
        self.occurred_at
    }

    pub fn correlation_id(&self) -> Option<CorrelationId> {
        self.correlation_id
    }

    pub fn causation_id(&self) -> Option<CausationId> {
        self.causation_id
    }

    pub fn payload(&self) -> &E {
        &self.payload
    }

    pub fn into_payload(self) -> E {
        self.payload
    }

    /// Maps the payload, preserving all envelope metadata. Used when
    /// upcasting a stored JSON payload into a strongly-typed event.
    pub fn map_payload<F, E2>(self, f: F) -> EventEnvelope<E2>
    where
        F: FnOnce(E) -> E2,
    {
        EventEnvelope {
            event_id: self.event_id,
            aggregate_id: self.aggregate_id,
            aggregate_type: self.aggregate_type,
            sequence_number: self.sequence_number,
            occurred_at: self.occurred_at,
            correlation_id: self.correlation_id,
            causation_id: self.causation_id,
            event_type: self.event_type,
            payload: f(self.payload),
        }
    }
}
