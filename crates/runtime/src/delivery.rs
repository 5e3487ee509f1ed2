//! Event delivery: publishing committed events onto a transport, either
//! inline with the command dispatch or handed off to a background task.
//!
//! Built on `eventweave_messaging`'s `EventBus`/`InMemoryEventBus` for the
//! transport mechanics, composed here with [`CommitPublisher`] so the
//! aggregate repository never has to know whether publication is synchronous
//! or deferred.

use std::sync::mpsc::Receiver;
use std::sync::Arc;

use serde_json::Value as JsonValue;
use tracing::warn;

use eventweave_messaging::{EventBus, EventEnvelope, InMemoryEventBus, Subscription};
use eventweave_store::StoredEvent;

use crate::repository::{to_envelopes, CommitPublisher};

/// A place committed events are published to. Kept separate from
/// [`EventBus`] so alternative transports (e.g. a future message-broker
/// binding) only need to implement this narrow surface.
pub trait EventTransport: Send + Sync {
    fn publish(&self, envelope: EventEnvelope<JsonValue>) -> Result<(), String>;

    fn subscribe(&self) -> Subscription<EventEnvelope<JsonValue>>;
}

/// In-process transport for tests/dev, backed by the messaging crate's
/// in-memory pub/sub bus.
pub struct InMemoryTransport {
    bus: InMemoryEventBus<EventEnvelope<JsonValue>>,
}

impl InMemoryTransport {
    pub fn new() -> Self {
        Self {
            bus: InMemoryEventBus::new(),
        }
    }
}

impl Default for InMemoryTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl EventTransport for InMemoryTransport {
    fn publish(&self, envelope: EventEnvelope<JsonValue>) -> Result<(), String> {
        self.bus.publish(envelope).map_err(|e| format!("{e:?}"))
    }

    fn subscribe(&self) -> Subscription<EventEnvelope<JsonValue>> {
        self.bus.subscribe()
    }
}

/// Publishes every committed event to the transport before `dispatch`
/// returns. The caller observes publication failures directly, at the cost
/// of blocking the command result on however long the transport takes.
pub struct SyncDelivery<T> {
    transport: Arc<T>,
}

impl<T: EventTransport> SyncDelivery<T> {
    pub fn new(transport: Arc<T>) -> Self {
        Self { transport }
    }

    pub fn subscribe(&self) -> Subscription<EventEnvelope<JsonValue>> {
        self.transport.subscribe()
    }
}

impl<T: EventTransport> CommitPublisher for SyncDelivery<T> {
    fn publish(&self, events: &[StoredEvent]) -> Result<(), String> {
        for envelope in to_envelopes(events) {
            self.transport.publish(envelope)?;
        }
        Ok(())
    }
}

/// Hands committed events off to a bounded background queue and returns
/// immediately; a worker thread drains the queue and publishes to the
/// transport. A publish failure is logged rather than surfaced to the
/// command caller, since by the time it would happen the command has
/// already been accepted.
pub struct AsyncDelivery {
    sender: std::sync::mpsc::Sender<EventEnvelope<JsonValue>>,
}

impl AsyncDelivery {
    /// Spawns the background publishing worker. The worker exits once every
    /// `AsyncDelivery` handle (and thus every sender clone) has been dropped.
    pub fn spawn<T>(transport: Arc<T>) -> Self
    where
        T: EventTransport + 'static,
    {
        let (sender, receiver): (_, Receiver<EventEnvelope<JsonValue>>) = std::sync::mpsc::channel();

        std::thread::spawn(move || {
            while let Ok(envelope) = receiver.recv() {
                if let Err(err) = transport.publish(envelope) {
                    warn!(error = %err, "async event publication failed");
                }
            }
        });

        Self { sender }
    }
}

impl CommitPublisher for AsyncDelivery {
    fn publish(&self, events: &[StoredEvent]) -> Result<(), String> {
        for envelope in to_envelopes(events) {
            self.sender
                .send(envelope)
                .map_err(|e| format!("delivery worker is gone: {e}"))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use eventweave_core::AggregateId;
    use std::time::Duration;

    fn stored_event(aggregate_id: AggregateId, seq: u64) -> StoredEvent {
        StoredEvent {
            event_id: uuid::Uuid::now_v7(),
            aggregate_id,
            aggregate_type: "thing".to_string(),
            sequence_number: seq,
            event_type: "thing.happened".to_string(),
            event_version: 1,
            occurred_at: chrono::Utc::now(),
            correlation_id: None,
            causation_id: None,
            payload: serde_json::json!({}),
        }
    }

    #[test]
    fn sync_delivery_publishes_before_returning() {
        let transport = Arc::new(InMemoryTransport::new());
        let subscription = transport.subscribe();
        let delivery = SyncDelivery::new(transport);

        let aggregate_id = AggregateId::new();
        delivery.publish(&[stored_event(aggregate_id, 1)]).unwrap();

        let received = subscription.recv_timeout(Duration::from_millis(100)).unwrap();
        assert_eq!(received.aggregate_id(), aggregate_id);
    }

    #[test]
    fn async_delivery_eventually_publishes() {
        let transport = Arc::new(InMemoryTransport::new());
        let subscription = transport.subscribe();
        let delivery = AsyncDelivery::spawn(transport);

        let aggregate_id = AggregateId::new();
        delivery.publish(&[stored_event(aggregate_id, 1)]).unwrap();

        let received = subscription.recv_timeout(Duration::from_secs(1)).unwrap();
        assert_eq!(received.aggregate_id(), aggregate_id);
    }
}
