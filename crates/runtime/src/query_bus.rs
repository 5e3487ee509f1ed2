//! Query Bus: structurally parallel to the command bus, routing a read-only
//! query through the same kind of ordered middleware chain to exactly one
//! registered projection handler.
//!
//! A middleware opts in to queries, commands, or both by overriding the
//! relevant method(s) of [`crate::middleware::Middleware`]; most
//! query-agnostic middleware (idempotency, concurrency retry) simply never
//! overrides `handle_query` and falls through as a no-op here.

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::sync::Arc;

use eventweave_messaging::{ExecutionContext, Query};

use crate::middleware::Middleware;

pub(crate) type ErasedQuery = Box<dyn Any + Send>;
pub(crate) type ErasedResponse = Box<dyn Any + Send>;
type TerminalFn = Box<dyn Fn(ErasedQuery) -> ErasedResponse + Send + Sync>;

#[derive(Debug, thiserror::Error)]
pub enum QueryError {
    #[error("no handler registered for query type {0}")]
    NoHandler(&'static str),
}

pub type QueryOutcome<R> = Result<R, QueryError>;
pub(crate) type ErasedQueryOutcome = Result<ErasedResponse, QueryError>;

/// Everything a middleware can learn about a query without knowing its
/// concrete type, mirroring `CommandMeta`.
pub struct QueryMeta {
    pub query_type: &'static str,
}

/// Routes queries through a middleware chain to their registered projection
/// handler.
///
/// Unlike `CommandBus`, registering a second handler for a query type that
/// already has one is rejected outright: a query has exactly one owner, so a
/// silent "last registration wins" (as `Router` does for commands) would hide
/// a configuration mistake. `ApplicationBuilder::build` surfaces this as
/// `BuildError::DuplicateQueryHandler` before the handler even reaches here.
pub struct QueryBus {
    middlewares: Vec<Arc<dyn Middleware>>,
    handlers: HashMap<TypeId, TerminalFn>,
    type_names: HashMap<TypeId, &'static str>,
}

impl QueryBus {
    pub fn new() -> Self {
        Self {
            middlewares: Vec::new(),
            handlers: HashMap::new(),
            type_names: HashMap::new(),
        }
    }

    /// Appends a middleware to the end of the chain, in the same registration
    /// order used for commands. See `CommandBus::register_middleware`.
    pub fn register_middleware(&mut self, middleware: Arc<dyn Middleware>) {
        self.middlewares.push(middleware);
    }

    /// Registers a handler for query type `Q`. Returns `false` (and does not
    /// replace the existing handler) if one is already registered.
    pub fn register<Q, F>(&mut self, handler: F) -> bool
    where
        Q: Query,
        F: Fn(Q) -> Q::Response + Send + Sync + 'static,
    {
        let type_id = TypeId::of::<Q>();
        if self.handlers.contains_key(&type_id) {
            return false;
        }
        self.type_names.insert(type_id, core::any::type_name::<Q>());
        self.handlers.insert(
            type_id,
            Box::new(move |query: ErasedQuery| {
                let query = *query.downcast::<Q>().expect("query type matches its TypeId key");
                Box::new(handler(query)) as ErasedResponse
            }),
        );
        true
    }

    pub fn has_handler<Q: Query>(&self) -> bool {
        self.handlers.contains_key(&TypeId::of::<Q>())
    }

    /// Dispatches a query through the middleware chain to its terminal
    /// handler, threading the same `ExecutionContext` a command dispatch
    /// would carry (correlation/causation ids for logging and tracing).
    pub fn dispatch<Q: Query>(&self, query: Q, ctx: ExecutionContext) -> QueryOutcome<Q::Response> {
        let type_id = TypeId::of::<Q>();
        let query_type = core::any::type_name::<Q>();
        let meta = QueryMeta { query_type };

        let terminal = match self.handlers.get(&type_id) {
            Some(handler) => handler,
            None => return Err(QueryError::NoHandler(query_type)),
        };

        let chain = QueryMiddlewareChain {
            middlewares: &self.middlewares,
            terminal: terminal.as_ref(),
            meta: &meta,
        };
        let response = chain.run(0, Box::new(query), ctx)?;
        Ok(*response
            .downcast::<Q::Response>()
            .expect("response type matches registered query"))
    }
}

impl Default for QueryBus {
    fn default() -> Self {
        Self::new()
    }
}

/// Cursor over the registered middlewares plus the terminal query handler,
/// mirroring `command_bus::MiddlewareChain`.
struct QueryMiddlewareChain<'a> {
    middlewares: &'a [Arc<dyn Middleware>],
    terminal: &'a (dyn Fn(ErasedQuery) -> ErasedResponse + Send + Sync),
    meta: &'a QueryMeta,
}

impl<'a> QueryMiddlewareChain<'a> {
    fn run(&self, index: usize, query: ErasedQuery, ctx: ExecutionContext) -> ErasedQueryOutcome {
        match self.middlewares.get(index) {
            Some(middleware) => {
                let mut next = |q: ErasedQuery, ctx: ExecutionContext| self.run(index + 1, q, ctx);
                middleware.handle_query(query, self.meta, ctx, &mut next)
            }
            None => Ok((self.terminal)(query)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::middleware::Middleware;
    use std::sync::Mutex;

    #[derive(Clone, Debug)]
    struct CountThings;
    impl Query for CountThings {
        type Response = u64;
    }

    #[test]
    fn dispatches_to_registered_handler() {
        let mut bus = QueryBus::new();
        bus.register::<CountThings, _>(|_q| 42);
        assert_eq!(bus.dispatch(CountThings, ExecutionContext::new()).unwrap(), 42);
    }

    #[test]
    fn second_registration_is_rejected() {
        let mut bus = QueryBus::new();
        assert!(bus.register::<CountThings, _>(|_q| 1));
        assert!(!bus.register::<CountThings, _>(|_q| 2));
        assert_eq!(bus.dispatch(CountThings, ExecutionContext::new()).unwrap(), 1);
    }

    #[test]
    fn missing_handler_is_an_error() {
        let bus = QueryBus::new();
        assert!(bus.dispatch(CountThings, ExecutionContext::new()).is_err());
    }

    struct RecordingMiddleware(Arc<Mutex<Vec<&'static str>>>, &'static str);
    impl Middleware for RecordingMiddleware {
        fn handle_query(
            &self,
            query: ErasedQuery,
            _meta: &QueryMeta,
            ctx: ExecutionContext,
            next: &mut dyn FnMut(ErasedQuery, ExecutionContext) -> ErasedQueryOutcome,
        ) -> ErasedQueryOutcome {
            self.0.lock().unwrap().push(self.1);
            next(query, ctx)
        }
    }

    #[test]
    fn query_middlewares_run_in_registration_order() {
        let order = Arc::new(Mutex::new(Vec::new()));
        let mut bus = QueryBus::new();
        bus.register_middleware(Arc::new(RecordingMiddleware(order.clone(), "first")));
        bus.register_middleware(Arc::new(RecordingMiddleware(order.clone(), "second")));
        bus.register::<CountThings, _>(|_q| 1);

        bus.dispatch(CountThings, ExecutionContext::new()).unwrap();
        assert_eq!(*order.lock().unwrap(), vec!["first", "second"]);
    }

    struct CommandOnlyMiddleware(Arc<Mutex<u32>>);
    impl Middleware for CommandOnlyMiddleware {
        // Deliberately does not override `handle_query`: a middleware whose
        // concern (e.g. idempotency) never applies to read-only queries falls
        // through as a transparent no-op rather than needing a stub.
    }

    #[test]
    fn middleware_with_no_query_override_is_transparent() {
        let calls = Arc::new(Mutex::new(0));
        let mut bus = QueryBus::new();
        bus.register_middleware(Arc::new(CommandOnlyMiddleware(calls.clone())));
        bus.register::<CountThings, _>(|_q| 7);

        assert_eq!(bus.dispatch(CountThings, ExecutionContext::new()).unwrap(), 7);
        assert_eq!(*calls.lock().unwrap(), 0);
    }
}
