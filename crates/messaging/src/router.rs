//! Type-indexed message dispatch table.
//!
//! A `TypeId`-keyed dispatch table for any message shape that can be routed
//! by its concrete Rust type: commands,
//! queries, and events all go through a `Router`. Handlers are boxed closures
//! that erase their input/output through `Box<dyn Any + Send>`; `dispatch`
//! downcasts back to the caller's expected types, so a type mismatch at the
//! call site is a programmer error (`RoutingError::TypeMismatch`) rather than
//! something that should ever actually trigger.
//!
//! Construction is two-phase: a [`RouterBuilder`] accumulates registrations
//! one message type at a time, then [`RouterBuilder::build`] freezes it into
//! an immutable [`Router`]. Once built, a `Router` never mutates its
//! registrations again, so lookups need no synchronization.

use std::any::{Any, TypeId};
use std::collections::HashMap;

type ErasedFn = Box<dyn Fn(Box<dyn Any + Send>) -> Box<dyn Any + Send> + Send + Sync>;

/// Error returned when [`Router::dispatch`] cannot route a message.
#[derive(Debug, thiserror::Error)]
pub enum RoutingError {
    /// No handler was registered for this message's concrete type.
    #[error("no handler registered for message type {0}")]
    NoHandler(&'static str),
    /// A handler was found but its output did not downcast to the expected
    /// type. Indicates a registration bug, not a runtime condition callers
    /// should design around.
    #[error("handler output type mismatch for message type {0}")]
    TypeMismatch(&'static str),
}

/// Accumulates per-message-type handler registrations before freezing into a
/// [`Router`].
pub struct RouterBuilder {
    handlers: HashMap<TypeId, ErasedFn>,
    type_names: HashMap<TypeId, &'static str>,
}

impl RouterBuilder {
    pub fn new() -> Self {
        Self {
            handlers: HashMap::new(),
            type_names: HashMap::new(),
        }
    }

    /// Registers a handler for message type `I`, producing `O`.
    ///
    /// Registering a second handler for the same `I` replaces the first;
    /// callers that need "duplicate registration is an error" semantics must
    /// check [`RouterBuilder::contains`] themselves before calling this.
    pub fn register<I, O, F>(mut self, handler: F) -> Self
    where
        I: Any + Send,
        O: Any + Send,
        F: Fn(I) -> O + Send + Sync + 'static,
    {
        let type_id = TypeId::of::<I>();
        self.type_names.insert(type_id, core::any::type_name::<I>());
        self.handlers.insert(
            type_id,
            Box::new(move |input: Box<dyn Any + Send>| {
                let input = *input
                    .downcast::<I>()
                    .expect("router input type matches its TypeId key");
                let output = handler(input);
                Box::new(output) as Box<dyn Any + Send>
            }),
        );
        self
    }

    /// Whether a handler for message type `I` has already been registered.
    pub fn contains<I: Any>(&self) -> bool {
        self.handlers.contains_key(&TypeId::of::<I>())
    }

    pub fn build(self) -> Router {
        Router {
            handlers: self.handlers,
            type_names: self.type_names,
        }
    }
}

impl Default for RouterBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Immutable, `TypeId`-indexed dispatch table. Build one with
/// [`RouterBuilder`]; lookups are O(1) and require no locking.
pub struct Router {
    handlers: HashMap<TypeId, ErasedFn>,
    type_names: HashMap<TypeId, &'static str>,
}

impl Router {
    /// Dispatches `input` to its registered handler and downcasts the result
    /// to `O`.
    pub fn dispatch<I, O>(&self, input: I) -> Result<O, RoutingError>
    where
        I: Any + Send,
        O: Any + Send,
    {
        let type_id = TypeId::of::<I>();
        let handler = self.handlers.get(&type_id).ok_or_else(|| {
            RoutingError::NoHandler(core::any::type_name::<I>())
        })?;
        let boxed_input: Box<dyn Any + Send> = Box::new(input);
        let boxed_output = handler(boxed_input);
        boxed_output
            .downcast::<O>()
            .map(|output| *output)
            .map_err(|_| RoutingError::TypeMismatch(core::any::type_name::<I>()))
    }

    /// Whether a handler is registered for message type `I`.
    pub fn has_handler<I: Any>(&self) -> bool {
        self.handlers.contains_key(&TypeId::of::<I>())
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    #[doc(hidden)]
    pub fn registered_type_name(&self, type_id: TypeId) -> Option<&'static str> {
        self.type_names.get(&type_id).copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Ping;
    struct Pong;

    #[test]
    fn dispatches_to_registered_handler() {
        let router = RouterBuilder::new()
            .register::<Ping, Pong, _>(|_| Pong)
            .build();

        let result: Result<Pong, RoutingError> = router.dispatch(Ping);
        assert!(result.is_ok());
    }

    #[test]
    fn missing_handler_errors() {
        let router = RouterBuilder::new().build();
        let result: Result<Pong, RoutingError> = router.dispatch(Ping);
        assert!(matches!(result, Err(RoutingError::NoHandler(_))));
    }

    #[test]
    fn later_registration_replaces_earlier_one() {
        let router = RouterBuilder::new()
            .register::<Ping, &'static str, _>(|_| "first")
            .register::<Ping, &'static str, _>(|_| "second")
            .build();

        let result: String = router.dispatch::<Ping, &'static str>(Ping).unwrap().to_string();
        assert_eq!(result, "second");
    }
}
