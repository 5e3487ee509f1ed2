use eventweave_core::{AggregateId, CommandId};

/// A command targets a specific aggregate (command abstraction).
///
/// Commands represent **intent**: a request to perform an action on an aggregate.
/// They are **transient** (not persisted); the aggregate decides whether they are
/// transformed into events (which are persisted).
///
/// ## Command vs Event
///
/// - **Command**: intent to do something (e.g. "deposit 100")
/// - **Event**: fact that something happened (e.g. "MoneyDeposited { amount: 100 }")
///
/// ## Aggregate Targeting
///
/// Every command names exactly one target aggregate via `aggregate_id()`, which
/// must be non-empty. This is what lets the command bus route the command, and
/// lets the repository serialize concurrent access per aggregate id.
///
/// ## Idempotency
///
/// `idempotency_key()` is optional; when present, the `IdempotencyMiddleware`
/// (`eventweave-runtime`) uses it to guarantee a command dispatched twice with the
/// same key commits its events at most once.
///
/// ## Design Constraints
///
/// Commands must be `Clone + Debug + Send + Sync + 'static` so they can be logged,
/// retried, and cross thread boundaries (the processor executor and concurrency
/// retry middleware both re-dispatch a cloned command).
pub trait Command: Clone + core::fmt::Debug + Send + Sync + 'static {
    /// The aggregate this command targets.
    fn aggregate_id(&self) -> AggregateId;

    /// A unique id for this command instance. Defaults to a fresh id per call,
    /// so implementors that need a stable id (e.g. for idempotency bookkeeping
    /// across retries) should override this to return a value stored on the
    /// command itself.
    fn command_id(&self) -> CommandId {
        CommandId::new()
    }

    /// Optional key used for exactly-once command processing by the
    /// idempotency middleware. `None` means the command is always re-executed.
    fn idempotency_key(&self) -> Option<&str> {
        None
    }
}
