//! Given/when/then harness for a single [`Saga`].
//!
//! Mirrors `eventweave_runtime::SagaRuntime::handle`'s per-event logic
//! (react, apply emitted saga events, track completion) without the
//! persistence/command-dispatch side of the real runtime, so a saga's pure
//! state machine can be exercised in isolation.

use std::fmt::Debug;

use eventweave_messaging::{ContextScope, EventEnvelope, ExecutionContext, Saga, SagaAction};
use serde_json::Value as JsonValue;

/// Drives one saga instance's state machine through a sequence of incoming
/// domain events.
///
/// ```ignore
/// SagaScenario::<TransferSaga>::new()
///     .when(&source_withdrawn_event)
///     .should_have_state(|s| s.source_withdrawn)
///     .when(&target_deposited_event)
///     .should_dispatch(vec![SagaAction::Complete])
///     .should_be_complete();
/// ```
pub struct SagaScenario<S: Saga> {
    state: S::State,
    dispatched: Vec<SagaAction>,
    completed: bool,
    _scope: ContextScope,
}

impl<S: Saga> SagaScenario<S> {
    pub fn new() -> Self {
        Self {
            state: S::State::default(),
            dispatched: Vec::new(),
            completed: false,
            _scope: ExecutionContext::new().enter(),
        }
    }

    /// Seeds the saga's state directly, skipping straight to mid-flow.
    pub fn given_state(mut self, state: S::State) -> Self {
        self.state = state;
        self
    }

    /// Reacts to one incoming event: runs `S::react`, applies any `Emit`
    /// actions to state, and records whether `Complete` was among the
    /// resulting actions.
    pub fn when(mut self, incoming: &EventEnvelope<JsonValue>) -> Self {
        let correlation = S::correlate(incoming)
            .expect("scenario event did not correlate to a saga instance");
        let actions = S::react(&self.state, &correlation, incoming);

        for action in &actions {
            match action {
                SagaAction::Emit { payload, .. } => {
                    let event: S::SagaEvent = serde_json::from_value(payload.clone())
                        .expect("saga event payload did not match the saga's SagaEvent shape");
                    S::apply(&mut self.state, &event);
                }
                SagaAction::Complete => self.completed = true,
                SagaAction::Command { .. } | SagaAction::Compensate { .. } => {}
            }
        }

        self.dispatched = actions;
        self
    }

    /// Asserts the most recent `when` produced exactly these actions, in order.
    pub fn should_dispatch(self, expected: impl IntoIterator<Item = SagaAction>) -> Self {
        let expected: Vec<SagaAction> = expected.into_iter().collect();
        assert_eq!(
            self.dispatched, expected,
            "saga actions did not match expectation"
        );
        self
    }

    /// Asserts the saga's current state satisfies `predicate`.
    pub fn should_have_state(self, predicate: impl FnOnce(&S::State) -> bool) -> Self
    where
        S::State: Debug,
    {
        assert!(
            predicate(&self.state),
            "saga state did not satisfy expectation: {:?}",
            self.state
        );
        self
    }

    /// Asserts the most recent `when` emitted a `Complete` action.
    pub fn should_be_complete(self) -> Self {
        assert!(self.completed, "expected saga to have completed");
        self
    }
}

impl<S: Saga> Default for SagaScenario<S> {
    fn default() -> Self {
        Self::new()
    }
}
