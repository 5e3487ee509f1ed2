//! Aggregate repository, command/query buses, event delivery, the processor
//! executor, the saga runtime, and the application builder.
//!
//! Built on top of `eventweave-core`'s domain contracts, `eventweave-messaging`'s
//! mechanics (commands, events, the router, the execution context), and
//! `eventweave-store`'s persistence seams (event store, snapshots, cache,
//! idempotency, upcasting).

mod aggregate_handle;
mod application;
mod command_bus;
mod delivery;
mod error;
mod middleware;
mod processor;
mod query_bus;
mod repository;
mod saga_runtime;

pub use aggregate_handle::AggregateHandle;
pub use application::{Application, ApplicationBuilder, ApplicationScope, BuildError, LifecycleHook};
pub use command_bus::{CommandBus, CommandOutcome, DispatchError};
pub use delivery::{AsyncDelivery, EventTransport, InMemoryTransport, SyncDelivery};
pub use error::RepositoryError;
pub use middleware::{
    ConcurrencyRetryMiddleware, ContextPropagationMiddleware, IdempotencyMiddleware,
    LoggingMiddleware, Middleware,
};
pub use processor::{CatchupCondition, CatchupStrategy, CheckpointBackend, InMemoryCheckpointBackend, ProcessorExecutor, ProcessorMetrics};
pub use query_bus::{QueryBus, QueryError, QueryMeta, QueryOutcome};
pub use repository::{AggregateRepository, CommitPublisher, to_envelopes};
pub use saga_runtime::{
    CommandBusExecutor, CommandExecutor, InMemorySagaStateStore, SagaError, SagaRecord,
    SagaRuntime, SagaStateStore, SagaStatus,
};
