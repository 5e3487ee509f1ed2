//! Per-operation ambient carrier for correlation/causation.
//!
//! The context is threaded explicitly through every dispatch entry point
//! (command bus, query bus, processor executor, saga runtime) rather than
//! stashed in a thread-local or global. The only place a
//! thread-local-like convenience exists is `ContextScope`, a `Drop` guard used
//! by the test scenario kits so a scenario doesn't have to thread a context
//! through every harness call by hand.

use std::cell::RefCell;

use eventweave_core::{AggregateId, CausationId, CorrelationId};

/// Correlation/causation/target-aggregate triple carried through one dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExecutionContext {
    correlation_id: CorrelationId,
    causation_id: Option<CausationId>,
    aggregate_id: Option<AggregateId>,
}

impl ExecutionContext {
    /// Starts a fresh context, generating a new correlation id.
    pub fn new() -> Self {
        Self {
            correlation_id: CorrelationId::new(),
            causation_id: None,
            aggregate_id: None,
        }
    }

    /// Starts a context inheriting an existing correlation id (e.g. because the
    /// inbound command already carried one).
    pub fn with_correlation(correlation_id: CorrelationId) -> Self {
        Self {
            correlation_id,
            causation_id: None,
            aggregate_id: None,
        }
    }

    pub fn correlation_id(&self) -> CorrelationId {
        self.correlation_id
    }

    pub fn causation_id(&self) -> Option<CausationId> {
        self.causation_id
    }

    pub fn aggregate_id(&self) -> Option<AggregateId> {
        self.aggregate_id
    }

    /// Returns a copy with `causation_id` set, e.g. to the id of the command
    /// that is about to produce child events.
    pub fn caused_by(mut self, causation_id: CausationId) -> Self {
        self.causation_id = Some(causation_id);
        self
    }

    /// Returns a copy scoped to the given aggregate.
    pub fn for_aggregate(mut self, aggregate_id: AggregateId) -> Self {
        self.aggregate_id = Some(aggregate_id);
        self
    }

    /// Derives a child context for a command/query dispatched as a side effect
    /// of handling the current one: same correlation id, caused by the current
    /// operation. Must be propagated explicitly by the caller when spawning
    /// concurrent work.
    pub fn child_caused_by(&self, causation_id: CausationId) -> Self {
        Self {
            correlation_id: self.correlation_id,
            causation_id: Some(causation_id),
            aggregate_id: None,
        }
    }

    /// Enters a scope for the duration of the returned guard, for the
    /// single-threaded convenience path used by the test scenario kits. The
    /// guard clears the ambient context on drop, including on an unwinding
    /// panic from a failed assertion.
    pub fn enter(self) -> ContextScope {
        CURRENT.with(|cell| {
            *cell.borrow_mut() = Some(self);
        });
        ContextScope { _private: () }
    }

    /// Reads the ambient context set by the innermost `enter` scope, if any.
    pub fn current() -> Option<Self> {
        CURRENT.with(|cell| *cell.borrow())
    }
}

impl Default for ExecutionContext {
    fn default() -> Self {
        Self::new()
    }
}

thread_local! {
    static CURRENT: RefCell<Option<ExecutionContext>> = const { RefCell::new(None) };
}

/// RAII guard returned by [`ExecutionContext::enter`]. Clears the ambient
/// context on drop; tests must never leak a context between cases.
pub struct ContextScope {
    _private: (),
}

impl Drop for ContextScope {
    fn drop(&mut self) {
        CURRENT.with(|cell| {
            *cell.borrow_mut() = None;
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scope_clears_on_drop() {
        assert!(ExecutionContext::current().is_none());
        {
            let _scope = ExecutionContext::new().enter();
            assert!(ExecutionContext::current().is_some());
        }
        assert!(ExecutionContext::current().is_none());
    }

    #[test]
    fn scope_clears_on_panicking_drop() {
        let result = std::panic::catch_unwind(|| {
            let _scope = ExecutionContext::new().enter();
            panic!("boom");
        });
        assert!(result.is_err());
        assert!(ExecutionContext::current().is_none());
    }

    #[test]
    fn child_context_inherits_correlation() {
        let parent = ExecutionContext::new();
        let child = parent.child_caused_by(CausationId::new());
        assert_eq!(parent.correlation_id(), child.correlation_id());
        assert!(child.causation_id().is_some());
    }
}
