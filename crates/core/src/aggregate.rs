//! Aggregate root trait and the event-sourced command/apply contract.

/// Aggregate root marker + minimal interface.
///
/// This is intentionally small so a domain model can decide how it represents
/// state transitions without bringing in any infrastructure concerns.
pub trait AggregateRoot {
    /// Strongly-typed aggregate identifier.
    type Id: Clone + Eq + core::hash::Hash + core::fmt::Debug;

    /// Returns the aggregate identifier.
    fn id(&self) -> &Self::Id;

    /// Monotonically increasing version of the aggregate's state.
    ///
    /// Equals the number of events applied at rest.
    fn version(&self) -> u64;
}

/// Event-sourced aggregate: decides events from a command, evolves state from events.
///
/// `handle` is the pure *decide* step: it must not mutate `self` and must not
/// perform I/O. `apply` is the pure *evolve* step, invoked both when replaying
/// history and immediately after a handler emits a new event, so later logic in
/// the same `handle` call observes the updated state.
pub trait Aggregate: AggregateRoot {
    /// The command type this aggregate decides on.
    type Command;
    /// The event type this aggregate emits and replays.
    type Event;
    /// The error a rejected command surfaces.
    type Error;

    /// Decide what happened, without mutating state.
    fn handle(&self, command: &Self::Command) -> Result<Vec<Self::Event>, Self::Error>;

    /// Evolve state in response to a single event. Must be total and side-effect free.
    fn apply(&mut self, event: &Self::Event);
}
