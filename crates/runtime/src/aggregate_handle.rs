//! Decide-then-apply wrapper around an [`Aggregate`].
//!
//! Unlike a bare decide-then-mutate call, `AggregateHandle` also retains the
//! emitted events so the repository can persist them after the in-memory
//! state has already advanced.

use eventweave_core::Aggregate;

/// Wraps an aggregate instance and accumulates uncommitted events across one
/// or more `handle_command` calls.
pub struct AggregateHandle<A: Aggregate> {
    aggregate: A,
    uncommitted: Vec<A::Event>,
}

impl<A: Aggregate> AggregateHandle<A> {
    pub fn new(aggregate: A) -> Self {
        Self {
            aggregate,
            uncommitted: Vec::new(),
        }
    }

    pub fn aggregate(&self) -> &A {
        &self.aggregate
    }

    pub fn into_aggregate(self) -> A {
        self.aggregate
    }

    /// Applies a historical event without tracking it as uncommitted. Used
    /// during replay.
    pub fn replay(&mut self, event: &A::Event) {
        self.aggregate.apply(event);
    }

    /// Decides on a command, applying each emitted event immediately so later
    /// logic in the same `handle` call (or a subsequent `handle_command` call
    /// on this handle) observes the updated state.
    pub fn handle_command(&mut self, command: &A::Command) -> Result<(), A::Error> {
        let events = self.aggregate.handle(command)?;
        for event in &events {
            self.aggregate.apply(event);
        }
        self.uncommitted.extend(events);
        Ok(())
    }

    /// Drains and returns events accumulated across `handle_command` calls.
    pub fn take_uncommitted(&mut self) -> Vec<A::Event> {
        std::mem::take(&mut self.uncommitted)
    }
}
