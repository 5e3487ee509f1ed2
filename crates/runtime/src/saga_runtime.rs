//! Saga Runtime: correlates events to saga instances, enforces step-at-most-once,
//! and drives compensation.
//!
//! Built around the `eventweave_messaging::Saga` state machine contract
//! (`correlate`, `saga_id`, `apply`, `react`), with append-only state
//! persistence and a pluggable compensating-command dispatcher. Step
//! completion is persisted as a `BTreeSet<StepId>` atomically with the state
//! write so each (saga id, step id) pair is applied at most once even under
//! redelivery.

use std::collections::{BTreeSet, HashMap};
use std::marker::PhantomData;
use std::sync::{Arc, Mutex};

use serde_json::Value as JsonValue;

use eventweave_messaging::{Command, EventEnvelope, ExecutionContext, Saga, SagaAction};

use crate::command_bus::{CommandBus, CommandOutcome};

/// Two-state saga lifecycle: `Active` while state is present, `Terminated`
/// once state has been deleted. A richer multi-state orchestrator lifecycle
/// isn't needed since this runtime only tracks presence/absence of state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SagaStatus {
    Active,
    Terminated,
}

/// A saga's state plus the set of `(event_type, saga_type)` steps already
/// applied. Persisted together so a crash between "apply step" and "record
/// completion" is impossible to observe.
#[derive(Debug, Clone)]
pub struct SagaRecord<S> {
    pub state: S,
    pub completed_steps: BTreeSet<String>,
}

/// Persistence boundary for saga state.
pub trait SagaStateStore<S>: Send + Sync {
    fn load(&self, saga_id: &str) -> Option<SagaRecord<S>>;

    /// Persists state and completed-step set atomically.
    fn save(&self, saga_id: &str, record: SagaRecord<S>);

    /// Deletes a saga's state, marking it terminated.
    fn delete(&self, saga_id: &str);
}

/// In-memory saga state store for tests/dev.
#[derive(Debug)]
pub struct InMemorySagaStateStore<S> {
    records: Mutex<HashMap<String, SagaRecord<S>>>,
}

impl<S> InMemorySagaStateStore<S> {
    pub fn new() -> Self {
        Self {
            records: Mutex::new(HashMap::new()),
        }
    }
}

impl<S> Default for InMemorySagaStateStore<S> {
    fn default() -> Self {
        Self::new()
    }
}

impl<S> SagaStateStore<S> for InMemorySagaStateStore<S>
where
    S: Clone + Send + Sync,
{
    fn load(&self, saga_id: &str) -> Option<SagaRecord<S>> {
        self.records
            .lock()
            .ok()
            .and_then(|guard| guard.get(saga_id).cloned())
    }

    fn save(&self, saga_id: &str, record: SagaRecord<S>) {
        if let Ok(mut guard) = self.records.lock() {
            guard.insert(saga_id.to_string(), record);
        }
    }

    fn delete(&self, saga_id: &str) {
        if let Ok(mut guard) = self.records.lock() {
            guard.remove(saga_id);
        }
    }
}

/// Dispatches a saga's compensating/follow-up commands to the rest of the
/// system.
pub trait CommandExecutor: Send + Sync {
    fn execute(&self, aggregate_type: &str, command_type: &str, payload: JsonValue) -> Result<(), String>;
}

/// Errors surfaced while driving a saga step. A saga step handler raising, or
/// a compensating command failing to dispatch, leaves the incoming event
/// unacknowledged so the transport redelivers it.
#[derive(Debug, thiserror::Error)]
pub enum SagaError {
    #[error("saga step handler failed: {0}")]
    StepFailed(String),

    #[error("saga command dispatch failed: {0}")]
    CommandFailed(String),
}

/// Drives one saga type: correlates incoming events, enforces
/// step-at-most-once, and persists state.
pub struct SagaRuntime<S: Saga, Store> {
    state_store: Store,
    commands: Arc<dyn CommandExecutor>,
    _saga: PhantomData<S>,
}

impl<S, Store> SagaRuntime<S, Store>
where
    S: Saga,
    Store: SagaStateStore<S::State>,
{
    pub fn new(state_store: Store, commands: Arc<dyn CommandExecutor>) -> Self {
        Self {
            state_store,
            commands,
            _saga: PhantomData,
        }
    }

    /// Handles one incoming domain event. Permissive: an event this saga's
    /// `correlate` doesn't recognize is silently skipped, matching the
    /// router's permissive mode for event processors.
    pub fn handle(&self, envelope: &EventEnvelope<JsonValue>) -> Result<(), SagaError> {
        let Some(correlation) = S::correlate(envelope) else {
            return Ok(());
        };

        let saga_key = S::saga_id(&correlation).to_string();
        let step_id = format!("{}::{}", envelope.event_type(), S::saga_type());

        let mut record = self.state_store.load(&saga_key).unwrap_or_else(|| SagaRecord {
            state: S::initial_state(&correlation),
            completed_steps: BTreeSet::new(),
        });

        if record.completed_steps.contains(&step_id) {
            tracing::debug!(saga_id = %saga_key, step = %step_id, "saga step already applied, skipping");
            return Ok(());
        }

        let actions = S::react(&record.state, &correlation, envelope);
        let mut terminated = false;

        for action in actions {
            match action {
                SagaAction::Emit { payload, .. } => {
                    let saga_event: S::SagaEvent = serde_json::from_value(payload)
                        .map_err(|e| SagaError::StepFailed(e.to_string()))?;
                    S::apply(&mut record.state, &saga_event);
                }
                SagaAction::Command {
                    aggregate_type,
                    command_type,
                    payload,
                }
                | SagaAction::Compensate {
                    aggregate_type,
                    command_type,
                    payload,
                } => {
                    self.commands
                        .execute(&aggregate_type, &command_type, payload)
                        .map_err(SagaError::CommandFailed)?;
                }
                SagaAction::Complete => terminated = true,
            }
        }

        record.completed_steps.insert(step_id);

        // Deleting the state (rather than keeping a terminated tombstone)
        // marks the saga terminated. Redelivery of the terminal event after
        // deletion re-runs the step, but relies on the compensating command
        // itself being idempotent to remain a no-op from the caller's point
        // of view.
        if terminated {
            self.state_store.delete(&saga_key);
        } else {
            self.state_store.save(&saga_key, record);
        }

        Ok(())
    }

    /// The underlying state store, for callers that need to inspect
    /// mid-flight saga state directly (tests, diagnostics).
    pub fn state_store(&self) -> &Store {
        &self.state_store
    }

    /// Current lifecycle status for the saga instance correlated by `correlation`.
    pub fn status(&self, correlation: &S::CorrelationId) -> SagaStatus {
        let saga_key = S::saga_id(correlation).to_string();
        match self.state_store.load(&saga_key) {
            Some(_) => SagaStatus::Active,
            None => SagaStatus::Terminated,
        }
    }
}

/// A [`CommandExecutor`] that decodes a saga action's JSON payload into a
/// concrete [`Command`] and dispatches it through a shared [`CommandBus`].
/// Bindings are registered ahead of time by `(aggregate_type, command_type)`
/// since the command bus itself routes by Rust type, not by string tag.
pub struct CommandBusExecutor {
    command_bus: Arc<CommandBus>,
    bindings: HashMap<(String, String), Box<dyn Fn(&CommandBus, JsonValue) -> CommandOutcome + Send + Sync>>,
}

impl CommandBusExecutor {
    pub fn new(command_bus: Arc<CommandBus>) -> Self {
        Self {
            command_bus,
            bindings: HashMap::new(),
        }
    }

    /// Registers how to decode and dispatch commands of type `C` for the
    /// given `(aggregate_type, command_type)` tag pair.
    pub fn bind<C>(mut self, aggregate_type: impl Into<String>, command_type: impl Into<String>) -> Self
    where
        C: Command + serde::de::DeserializeOwned,
    {
        self.bindings.insert(
            (aggregate_type.into(), command_type.into()),
            Box::new(|bus, payload| {
                let command: C = serde_json::from_value(payload).map_err(|e| {
                    crate::error::RepositoryError::Deserialize(e.to_string())
                })?;
                bus.dispatch(command, ExecutionContext::new())
            }),
        );
        self
    }
}

impl CommandExecutor for CommandBusExecutor {
    fn execute(&self, aggregate_type: &str, command_type: &str, payload: JsonValue) -> Result<(), String> {
        let key = (aggregate_type.to_string(), command_type.to_string());
        let dispatch = self.bindings.get(&key).ok_or_else(|| {
            format!("no command binding registered for {aggregate_type}.{command_type}")
        })?;
        dispatch(&self.command_bus, payload).map(|_events| ()).map_err(|e| e.to_string())
    }
}
