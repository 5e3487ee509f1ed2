//! Message vocabulary (commands, queries, events), the execution context that
//! threads correlation/causation through a dispatch, the type-indexed message
//! router, and the in-memory event bus mechanics.
//!
//! Everything here is pure mechanics: no storage, no concurrency policy beyond
//! what `Send + Sync` requires. The runtime crate builds the command bus, query
//! bus, repository, and processor executor on top of these pieces.

mod bus;
mod command;
mod context;
mod envelope;
mod event;
mod in_memory_bus;
mod projection;
mod query;
mod router;
mod runner;
mod saga;

pub use bus::{EventBus, Subscription};
pub use command::Command;
pub use context::{ContextScope, ExecutionContext};
pub use envelope::EventEnvelope;
pub use event::Event;
pub use in_memory_bus::{InMemoryBusError, InMemoryEventBus};
pub use projection::Projection;
pub use query::Query;
pub use router::{Router, RouterBuilder, RoutingError};
pub use runner::{ProjectionCursor, ProjectionError, ProjectionRunner};
pub use saga::{Saga, SagaAction};
