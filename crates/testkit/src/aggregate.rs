//! Given/when/then harness for a single [`Aggregate`] instance.

use std::fmt::Debug;

use eventweave_core::Aggregate;
use eventweave_messaging::{ContextScope, ExecutionContext};
use eventweave_runtime::AggregateHandle;

/// Builds an aggregate's prior history, then exercises one command against it.
///
/// ```ignore
/// AggregateScenario::new(Account::default())
///     .given(vec![MoneyDeposited { amount: 100 }])
///     .when(Withdraw { amount: 40 })
///     .should_emit(vec![MoneyWithdrawn { amount: 40 }])
///     .should_have_state(|a| a.balance == 60);
/// ```
pub struct AggregateScenario<A: Aggregate> {
    handle: AggregateHandle<A>,
    _scope: ContextScope,
}

impl<A: Aggregate> AggregateScenario<A> {
    /// Starts a scenario from a freshly constructed aggregate instance (the
    /// same starting point `AggregateRepository::rehydrate` would use before
    /// replaying any history).
    pub fn new(initial: A) -> Self {
        let scope = ExecutionContext::new().enter();
        Self {
            handle: AggregateHandle::new(initial),
            _scope: scope,
        }
    }

    /// Replays prior history into the aggregate without tracking it as
    /// uncommitted, exactly as the repository does on rehydration.
    pub fn given(mut self, events: impl IntoIterator<Item = A::Event>) -> Self {
        for event in events {
            self.handle.replay(&event);
        }
        self
    }

    /// Decides on `command`, capturing whatever it emits (or the error it
    /// raised) for the `should_*` assertions.
    pub fn when(mut self, command: A::Command) -> WhenOutcome<A> {
        let result = self.handle.handle_command(&command);
        let emitted = self.handle.take_uncommitted();
        let error = result.err();
        WhenOutcome {
            aggregate: self.handle.into_aggregate(),
            emitted,
            error,
            _scope: self._scope,
        }
    }
}

/// Outcome of `AggregateScenario::when`, carrying the events emitted (if any),
/// the error raised (if any), and the aggregate's resulting state.
pub struct WhenOutcome<A: Aggregate> {
    aggregate: A,
    emitted: Vec<A::Event>,
    error: Option<A::Error>,
    _scope: ContextScope,
}

impl<A: Aggregate> WhenOutcome<A> {
    /// Asserts the command succeeded and emitted exactly these events, in order.
    pub fn should_emit(self, expected: impl IntoIterator<Item = A::Event>) -> Self
    where
        A::Event: PartialEq + Debug,
    {
        assert!(
            self.error.is_none(),
            "expected command to succeed, but it raised an error"
        );
        let expected: Vec<A::Event> = expected.into_iter().collect();
        assert_eq!(
            self.emitted, expected,
            "emitted events did not match expectation"
        );
        self
    }

    /// Asserts the aggregate's resulting state (after any emitted events have
    /// already been applied) satisfies `predicate`.
    pub fn should_have_state(self, predicate: impl FnOnce(&A) -> bool) -> Self {
        assert!(
            predicate(&self.aggregate),
            "aggregate state did not satisfy expectation"
        );
        self
    }

    /// Asserts the command was rejected with an error satisfying `predicate`.
    pub fn should_raise(self, predicate: impl FnOnce(&A::Error) -> bool) -> Self
    where
        A::Error: Debug,
    {
        match &self.error {
            Some(err) => assert!(
                predicate(err),
                "raised error did not satisfy expectation: {err:?}"
            ),
            None => panic!("expected command to raise an error, but it succeeded"),
        }
        self
    }
}
