//! Event schema upcasting pipeline.
//!
//! An [`Upcaster`] transforms a stored JSON payload of one event type tag
//! into the next type tag in a schema evolution chain. [`UpcasterChain`]
//! assembles registered upcasters into a DAG keyed by type tag and walks a
//! stored event from whatever tag it was persisted under to the chain's
//! unique terminal type.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::warn;

use eventweave_core::AggregateId;

use crate::event_store::EventStore;

/// Transforms a payload from one event type tag to the next.
pub trait Upcaster: Send + Sync {
    /// The event type tag this upcaster consumes.
    fn from_type(&self) -> &str;

    /// The event type tag this upcaster produces.
    fn to_type(&self) -> &str;

    /// Whether this upcaster applies to the given stored type tag.
    fn can_upcast(&self, event_type: &str) -> bool {
        event_type == self.from_type()
    }

    /// Transforms the payload, returning the new type tag and payload.
    fn upcast(&self, payload: JsonValue) -> (String, JsonValue);
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum UpcasterError {
    #[error("upcaster chain contains a cycle involving event type {0}")]
    Cycle(String),

    #[error("more than one upcaster registered for source event type {0}")]
    DuplicateFromType(String),
}

/// Whether upcasting happens on every read (`Lazy`), or is additionally
/// persisted back to the store the first time an old event is read (`Eager`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpcastStrategy {
    /// Upcast in memory on every load; storage is never rewritten.
    Lazy,
    /// Upcast in memory, and also rewrite the stored event via
    /// `EventStore::rewrite`. Silently degrades to `Lazy` behavior (with a
    /// one-time warning per stream) if the backing store doesn't support
    /// rewriting.
    Eager,
}

/// A DAG of upcasters, built once at construction and walked on every read.
pub struct UpcasterChain {
    by_from_type: HashMap<String, Box<dyn Upcaster>>,
    warned_streams: Mutex<HashSet<AggregateId>>,
}

impl UpcasterChain {
    /// Builds a chain from a set of upcasters, rejecting a second upcaster
    /// registered for the same source type (`UpcasterError::DuplicateFromType`)
    /// and validating the resulting graph is acyclic (`UpcasterError::Cycle`).
    /// Each source type has at most one outgoing edge by construction, so an
    /// acyclic walk always reaches exactly one terminal type; there's no
    /// separate "more than one terminal reachable" case to check for.
    pub fn new(upcasters: Vec<Box<dyn Upcaster>>) -> Result<Self, UpcasterError> {
        let mut by_from_type = HashMap::new();
        for upcaster in upcasters {
            let from_type = upcaster.from_type().to_string();
            if by_from_type.insert(from_type.clone(), upcaster).is_some() {
                return Err(UpcasterError::DuplicateFromType(from_type));
            }
        }

        for start in by_from_type.keys() {
            Self::walk_acyclic(&by_from_type, start)?;
        }

        Ok(Self {
            by_from_type,
            warned_streams: Mutex::new(HashSet::new()),
        })
    }

    fn walk_acyclic(
        by_from_type: &HashMap<String, Box<dyn Upcaster>>,
        start: &str,
    ) -> Result<String, UpcasterError> {
        let mut visited = HashSet::new();
        let mut current = start.to_string();
        loop {
            if !visited.insert(current.clone()) {
                return Err(UpcasterError::Cycle(current));
            }
            match by_from_type.get(&current) {
                Some(upcaster) => current = upcaster.to_type().to_string(),
                None => return Ok(current),
            }
        }
    }

    /// Upcasts a payload from `event_type`, walking the chain to its terminal
    /// type. Returns the final type tag and payload; a tag with no registered
    /// upcaster is returned unchanged (it's already terminal).
    pub fn upcast(&self, event_type: &str, payload: JsonValue) -> (String, JsonValue) {
        let mut current_type = event_type.to_string();
        let mut current_payload = payload;

        while let Some(upcaster) = self.by_from_type.get(&current_type) {
            if !upcaster.can_upcast(&current_type) {
                break;
            }
            let (next_type, next_payload) = upcaster.upcast(current_payload);
            current_type = next_type;
            current_payload = next_payload;
        }

        (current_type, current_payload)
    }

    /// Upcasts a stored event, applying [`UpcastStrategy::Eager`] rewriting
    /// when requested and supported.
    pub fn upcast_stored(
        &self,
        store: &dyn EventStore,
        strategy: UpcastStrategy,
        aggregate_id: AggregateId,
        event_id: uuid::Uuid,
        event_type: &str,
        payload: JsonValue,
    ) -> (String, JsonValue) {
        let (new_type, new_payload) = self.upcast(event_type, payload);

        if strategy == UpcastStrategy::Eager && new_type != event_type {
            match store.rewrite(aggregate_id, event_id, new_type.clone(), new_payload.clone()) {
                Ok(()) => {}
                Err(crate::event_store::EventStoreError::Unsupported) => {
                    let mut warned = self
                        .warned_streams
                        .lock()
                        .unwrap_or_else(|poisoned| poisoned.into_inner());
                    if warned.insert(aggregate_id) {
                        warn!(
                            %aggregate_id,
                            "eager upcasting requested but store does not support rewrite; \
                             degrading to lazy upcasting for this stream"
                        );
                    }
                }
                Err(err) => {
                    warn!(%aggregate_id, %err, "eager upcast rewrite failed");
                }
            }
        }

        (new_type, new_payload)
    }
}
