//! Given/when/then harness for a single [`Projection`].

use std::fmt::Debug;
use std::sync::{Arc, Mutex};

use eventweave_core::AggregateId;
use eventweave_messaging::{ContextScope, Event, EventEnvelope, ExecutionContext, Projection, Query};
use eventweave_runtime::QueryBus;
use uuid::Uuid;

/// Feeds a sequence of domain events into a projection through its event
/// path, then dispatches a query through its query path and asserts on the
/// response.
///
/// ```ignore
/// ProjectionScenario::new(AccountBalances::default())
///     .given(vec![MoneyDeposited { amount: 100 }])
///     .register_query::<BalanceOf, _>(|p, q| p.balance(&q.account))
///     .when(BalanceOf { account: "acct-1".into() })
///     .should_return(60u64);
/// ```
pub struct ProjectionScenario<P: Projection> {
    projection: Arc<Mutex<P>>,
    aggregate_id: AggregateId,
    next_sequence: u64,
    query_bus: QueryBus,
    _scope: ContextScope,
}

impl<P: Projection> ProjectionScenario<P> {
    pub fn new(projection: P) -> Self {
        Self {
            projection: Arc::new(Mutex::new(projection)),
            aggregate_id: AggregateId::new(),
            next_sequence: 1,
            query_bus: QueryBus::new(),
            _scope: ExecutionContext::new().enter(),
        }
    }

    /// Scopes the scenario's synthesized envelopes to a specific aggregate id,
    /// for projections whose state keys off it.
    pub fn for_aggregate(mut self, aggregate_id: AggregateId) -> Self {
        self.aggregate_id = aggregate_id;
        self
    }

    fn apply_one(&mut self, event: P::Ev) {
        let envelope = EventEnvelope::new(
            Uuid::now_v7(),
            self.aggregate_id,
            "scenario",
            self.next_sequence,
            event.event_type(),
            event,
        );
        self.projection
            .lock()
            .expect("projection scenario lock poisoned")
            .apply(&envelope);
        self.next_sequence += 1;
    }

    /// Applies prior events to seed the projection's state, through the same
    /// event-applying path a live processor would use.
    pub fn given(mut self, events: impl IntoIterator<Item = P::Ev>) -> Self {
        for event in events {
            self.apply_one(event);
        }
        self
    }

    /// Binds a read model answer for query type `Q`, reading the
    /// projection's state as of whenever `when` later dispatches it. Must be
    /// called before `when` for the matching query type.
    pub fn register_query<Q, F>(mut self, handler: F) -> Self
    where
        Q: Query,
        F: Fn(&P, Q) -> Q::Response + Send + Sync + 'static,
        P: Send + 'static,
    {
        let projection = self.projection.clone();
        let registered = self.query_bus.register::<Q, _>(move |query: Q| {
            let projection = projection.lock().expect("projection scenario lock poisoned");
            handler(&projection, query)
        });
        debug_assert!(registered, "query type registered twice in one scenario");
        self
    }

    /// Dispatches `query` through the query bus and records the response for
    /// `should_return`/`should_satisfy`.
    pub fn when<Q: Query>(self, query: Q) -> ProjectionWhenOutcome<P, Q> {
        let response = self.query_bus.dispatch(query, ExecutionContext::new());
        ProjectionWhenOutcome {
            projection: self.projection,
            response,
            _scope: self._scope,
        }
    }

    /// Asserts the projection's state (independent of any query) satisfies
    /// `predicate`. Useful when a scenario only needs `given` plus a direct
    /// state check, without exercising the query path.
    pub fn should_have_state(self, predicate: impl FnOnce(&P) -> bool) -> Self {
        assert!(
            predicate(&self.projection.lock().expect("projection scenario lock poisoned")),
            "projection state did not satisfy expectation"
        );
        self
    }
}

/// The result of dispatching a query in a [`ProjectionScenario`]: the
/// projection's state plus the query's outcome, ready for assertions.
pub struct ProjectionWhenOutcome<P: Projection, Q: Query> {
    projection: Arc<Mutex<P>>,
    response: Result<Q::Response, eventweave_runtime::QueryError>,
    _scope: ContextScope,
}

impl<P: Projection, Q: Query> ProjectionWhenOutcome<P, Q> {
    /// Asserts the query returned `expected`.
    pub fn should_return(self, expected: Q::Response) -> Self
    where
        Q::Response: PartialEq + Debug,
    {
        match &self.response {
            Ok(actual) => assert_eq!(*actual, expected, "query response did not match expectation"),
            Err(err) => panic!("expected query to succeed, got error: {err}"),
        }
        self
    }

    /// Asserts the query's response satisfies `predicate`.
    pub fn should_satisfy(self, predicate: impl FnOnce(&Q::Response) -> bool) -> Self {
        match &self.response {
            Ok(actual) => assert!(predicate(actual), "query response did not satisfy expectation"),
            Err(err) => panic!("expected query to succeed, got error: {err}"),
        }
        self
    }

    /// Asserts the projection's underlying state (independent of the query
    /// response) satisfies `predicate`.
    pub fn should_have_state(self, predicate: impl FnOnce(&P) -> bool) -> Self {
        assert!(
            predicate(&self.projection.lock().expect("projection scenario lock poisoned")),
            "projection state did not satisfy expectation"
        );
        self
    }
}
