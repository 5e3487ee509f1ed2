//! Given/When/Then scenario harnesses for aggregates, projections, and sagas.
//!
//! Each scenario kit resets the ambient [`eventweave_messaging::ExecutionContext`]
//! via a [`eventweave_messaging::ContextScope`] guard on construction, so a test
//! that reads `ExecutionContext::current()` observes a scenario-scoped context
//! and a failed assertion (a panicking `should_*` call) still clears it on
//! unwind rather than leaking into the next test.

mod aggregate;
mod projection;
mod saga;

pub use aggregate::{AggregateScenario, WhenOutcome};
pub use projection::{ProjectionScenario, ProjectionWhenOutcome};
pub use saga::SagaScenario;
