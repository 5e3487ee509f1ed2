//! Application builder: the explicit registry that wires aggregates,
//! projections, sagas, processors, middleware, and upcasters into one
//! runnable `Application`.
//!
//! Each module of a running system would otherwise hand-register its
//! aggregates and projections into a shared wiring point; here that
//! convention is made explicit and generic: `.register_aggregate` builds the
//! terminal handler (resolve the aggregate type, open a repository scope,
//! decide, persist, publish) and wires it into the command bus itself, rather
//! than requiring a caller to do it by hand for every command type.

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Serialize;

use eventweave_core::{Aggregate, AggregateId};
use eventweave_messaging::{Command, Event, Query};
use eventweave_store::{Upcaster, UpcasterChain, UpcasterError};

use crate::command_bus::CommandBus;
use crate::error::RepositoryError;
use crate::middleware::Middleware;
use crate::query_bus::QueryBus;
use crate::repository::{AggregateRepository, CommitPublisher};

/// Something the application should start and stop around its own lifetime
/// (a processor executor's poll loop, a saga runtime's subscription). Kept
/// deliberately narrow: wiring the actual consumption loop onto a transport
/// is left to the embedding application rather than owned here.
pub trait LifecycleHook: Send + Sync {
    /// Runs once when the application enters scope. A failure here aborts
    /// the remaining startups (but does not roll back hooks that already
    /// started).
    fn on_startup(&self) -> Result<(), String> {
        Ok(())
    }

    /// Runs once when the application exits scope, in reverse registration
    /// order. Failures are logged and do not stop the remaining shutdowns.
    fn on_shutdown(&self) -> Result<(), String> {
        Ok(())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    #[error("duplicate query handler registered for query type {0}")]
    DuplicateQueryHandler(&'static str),

    #[error("more than one aggregate type registered for command type {0}")]
    DuplicateCommandHandler(&'static str),

    #[error("upcaster chain is invalid: {0}")]
    InvalidUpcasterChain(#[from] UpcasterError),

    #[error("application startup failed: {0}")]
    Startup(String),
}

/// Accumulates registrations before freezing into an [`Application`].
pub struct ApplicationBuilder {
    command_bus: CommandBus,
    query_bus: QueryBus,
    upcasters: Vec<Box<dyn Upcaster>>,
    lifecycle_hooks: Vec<Arc<dyn LifecycleHook>>,
    dependencies: HashMap<TypeId, Box<dyn Any + Send + Sync>>,
    registered_commands: HashMap<TypeId, &'static str>,
    errors: Vec<BuildError>,
}

impl ApplicationBuilder {
    pub fn new() -> Self {
        Self {
            command_bus: CommandBus::new(),
            query_bus: QueryBus::new(),
            upcasters: Vec::new(),
            lifecycle_hooks: Vec::new(),
            dependencies: HashMap::new(),
            registered_commands: HashMap::new(),
            errors: Vec::new(),
        }
    }

    /// Registers an aggregate type, wiring the built-in `DelegateToAggregate`
    /// terminal handler for its command type into the command bus: resolve
    /// the target aggregate (by the command's Rust type), open a repository
    /// scope (`repository.dispatch`), decide, persist, and publish.
    ///
    /// `make_aggregate` constructs a fresh instance when replaying from
    /// scratch; `repository` may be shared with other aggregate types (same
    /// event store) or dedicated to this one, with its own snapshot/cache
    /// policy either way.
    pub fn register_aggregate<A, S, P, F>(
        &mut self,
        repository: Arc<AggregateRepository<S, P>>,
        aggregate_type: impl Into<String>,
        make_aggregate: F,
    ) -> &mut Self
    where
        A: Aggregate<Id = AggregateId> + Serialize + DeserializeOwned + 'static,
        A::Command: Command,
        A::Event: Event + Serialize + DeserializeOwned,
        A::Error: Into<RepositoryError>,
        S: eventweave_store::EventStore + 'static,
        P: CommitPublisher + 'static,
        F: Fn(AggregateId) -> A + Send + Sync + 'static,
    {
        let command_type_id = TypeId::of::<A::Command>();
        let command_type_name = core::any::type_name::<A::Command>();
        if self.registered_commands.contains_key(&command_type_id) {
            self.errors.push(BuildError::DuplicateCommandHandler(command_type_name));
            return self;
        }
        self.registered_commands.insert(command_type_id, command_type_name);

        let aggregate_type = aggregate_type.into();
        let make_aggregate = Arc::new(make_aggregate);

        self.command_bus.register_handler::<A::Command, _>(move |command, ctx| {
            let aggregate_id = command.aggregate_id();
            let make_aggregate = make_aggregate.clone();
            repository.dispatch::<A>(aggregate_id, aggregate_type.clone(), &command, &ctx, move |id| {
                make_aggregate(id)
            })
        });

        self
    }

    /// Registers a read-model query handler. Rejects (records a
    /// [`BuildError::DuplicateQueryHandler`]) a second handler for the same
    /// query type; a query has exactly one owner.
    pub fn register_projection<Q, F>(&mut self, handler: F) -> &mut Self
    where
        Q: Query,
        F: Fn(Q) -> Q::Response + Send + Sync + 'static,
    {
        if !self.query_bus.register::<Q, _>(handler) {
            self.errors.push(BuildError::DuplicateQueryHandler(core::any::type_name::<Q>()));
        }
        self
    }

    /// Appends a middleware to the end of both the command bus's and query
    /// bus's chains (registration order). A middleware that only overrides
    /// `handle_command` (or only `handle_query`) is a no-op on the side it
    /// doesn't opt into.
    pub fn register_middleware(&mut self, middleware: Arc<dyn Middleware>) -> &mut Self {
        self.command_bus.register_middleware(middleware.clone());
        self.query_bus.register_middleware(middleware);
        self
    }

    /// Registers an upcaster; the full set is validated for DAG acyclicity
    /// at `build()` time.
    pub fn register_upcaster(&mut self, upcaster: Box<dyn Upcaster>) -> &mut Self {
        self.upcasters.push(upcaster);
        self
    }

    /// Registers a processor (or saga runtime, or any other
    /// externally-driven consumer) for application-scoped startup/shutdown.
    /// Wiring the consumption loop itself onto a transport is the caller's
    /// responsibility; this only governs lifecycle ordering.
    pub fn register_processor(&mut self, hook: impl LifecycleHook + 'static) -> &mut Self {
        self.lifecycle_hooks.push(Arc::new(hook));
        self
    }

    /// Registers a saga runtime for application-scoped startup/shutdown.
    pub fn register_saga(&mut self, hook: impl LifecycleHook + 'static) -> &mut Self {
        self.lifecycle_hooks.push(Arc::new(hook));
        self
    }

    /// Binds a constructed dependency so handlers built outside the builder
    /// (e.g. a saga's `CommandExecutor`) can retrieve it from the built
    /// `Application` via `resolve`.
    pub fn bind<T: Send + Sync + 'static>(&mut self, value: T) -> &mut Self {
        self.dependencies.insert(TypeId::of::<T>(), Box::new(value));
        self
    }

    /// Validates registrations and freezes them into a runnable [`Application`].
    pub fn build(self) -> Result<Application, Vec<BuildError>> {
        let mut errors = self.errors;

        let upcasters = UpcasterChain::new(self.upcasters);
        let upcasters = match upcasters {
            Ok(chain) => Some(chain),
            Err(err) => {
                errors.push(BuildError::InvalidUpcasterChain(err));
                None
            }
        };

        if !errors.is_empty() {
            return Err(errors);
        }

        Ok(Application {
            command_bus: self.command_bus,
            query_bus: self.query_bus,
            upcasters: upcasters.expect("validated above"),
            lifecycle_hooks: self.lifecycle_hooks,
            dependencies: self.dependencies,
        })
    }
}

impl Default for ApplicationBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// A fully wired, validated runtime: command bus, query bus, upcaster chain,
/// lifecycle hooks, and a dependency map.
pub struct Application {
    command_bus: CommandBus,
    query_bus: QueryBus,
    upcasters: UpcasterChain,
    lifecycle_hooks: Vec<Arc<dyn LifecycleHook>>,
    dependencies: HashMap<TypeId, Box<dyn Any + Send + Sync>>,
}

impl Application {
    pub fn command_bus(&self) -> &CommandBus {
        &self.command_bus
    }

    pub fn query_bus(&self) -> &QueryBus {
        &self.query_bus
    }

    pub fn upcasters(&self) -> &UpcasterChain {
        &self.upcasters
    }

    /// Retrieves a dependency bound with `ApplicationBuilder::bind`.
    pub fn resolve<T: Send + Sync + 'static>(&self) -> Option<&T> {
        self.dependencies.get(&TypeId::of::<T>()).and_then(|v| v.downcast_ref::<T>())
    }

    /// Enters application scope: runs every registered lifecycle hook's
    /// `on_startup` in registration order. The returned guard runs
    /// `on_shutdown` in reverse order on drop.
    pub fn enter_scope(&self) -> Result<ApplicationScope<'_>, BuildError> {
        for hook in &self.lifecycle_hooks {
            hook.on_startup().map_err(BuildError::Startup)?;
        }
        Ok(ApplicationScope { app: self })
    }
}

/// RAII guard returned by [`Application::enter_scope`]. Runs every
/// registered lifecycle hook's `on_shutdown` in reverse order on drop;
/// failures are logged via `tracing::error!` and do not stop the remaining
/// shutdowns.
pub struct ApplicationScope<'a> {
    app: &'a Application,
}

impl Drop for ApplicationScope<'_> {
    fn drop(&mut self) {
        for hook in self.app.lifecycle_hooks.iter().rev() {
            if let Err(err) = hook.on_shutdown() {
                tracing::error!(error = %err, "lifecycle hook shutdown failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use eventweave_core::AggregateRoot;
    use eventweave_messaging::{ExecutionContext, Query as QueryTrait};
    use eventweave_store::InMemoryEventStore;

    #[derive(Clone, Debug)]
    struct OpenTab {
        id: AggregateId,
    }
    impl Command for OpenTab {
        fn aggregate_id(&self) -> AggregateId {
            self.id
        }
    }

    #[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
    struct TabOpened;
    impl Event for TabOpened {
        fn event_type(&self) -> &'static str {
            "tab_opened"
        }
        fn version(&self) -> u32 {
            1
        }
        fn occurred_at(&self) -> chrono::DateTime<chrono::Utc> {
            chrono::Utc::now()
        }
    }

    #[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
    struct Tab {
        id: AggregateId,
        opened: bool,
        version: u64,
    }

    impl AggregateRoot for Tab {
        type Id = AggregateId;
        fn id(&self) -> &Self::Id {
            &self.id
        }
        fn version(&self) -> u64 {
            self.version
        }
    }

    impl Aggregate for Tab {
        type Command = OpenTab;
        type Event = TabOpened;
        type Error = eventweave_core::DomainError;

        fn handle(&self, _command: &Self::Command) -> Result<Vec<Self::Event>, Self::Error> {
            Ok(vec![TabOpened])
        }

        fn apply(&mut self, _event: &Self::Event) {
            self.opened = true;
            self.version += 1;
        }
    }

    struct CountQuery;
    impl QueryTrait for CountQuery {
        type Response = u64;
    }

    #[test]
    fn register_aggregate_wires_command_dispatch() {
        let store = InMemoryEventStore::new();
        let repo = Arc::new(AggregateRepository::new(store, |_events: &[eventweave_store::StoredEvent]| Ok(())));

        let mut builder = ApplicationBuilder::new();
        builder.register_aggregate::<Tab, _, _, _>(repo, "tab", |id| Tab {
            id,
            ..Default::default()
        });
        let app = builder.build().unwrap();

        let id = AggregateId::new();
        let events = app
            .command_bus()
            .dispatch(OpenTab { id }, ExecutionContext::new())
            .unwrap();
        assert_eq!(events.len(), 1);
    }

    #[test]
    fn duplicate_query_handler_is_a_build_error() {
        let mut builder = ApplicationBuilder::new();
        builder.register_projection::<CountQuery, _>(|_| 1);
        builder.register_projection::<CountQuery, _>(|_| 2);
        let result = builder.build();
        assert!(matches!(result, Err(errors) if matches!(errors[0], BuildError::DuplicateQueryHandler(_))));
    }

    #[test]
    fn lifecycle_hooks_run_startup_then_shutdown_in_reverse() {
        struct Tracking(&'static str, Arc<std::sync::Mutex<Vec<&'static str>>>);
        impl LifecycleHook for Tracking {
            fn on_startup(&self) -> Result<(), String> {
                self.1.lock().unwrap().push(self.0);
                Ok(())
            }
            fn on_shutdown(&self) -> Result<(), String> {
                self.1.lock().unwrap().push(self.0);
                Ok(())
            }
        }

        let order = Arc::new(std::sync::Mutex::new(Vec::new()));

        let mut builder = ApplicationBuilder::new();
        builder.register_processor(Tracking("first", order.clone()));
        builder.register_processor(Tracking("second", order.clone()));
        let app = builder.build().unwrap();

        {
            let _scope = app.enter_scope().unwrap();
        }

        assert_eq!(*order.lock().unwrap(), vec!["first", "second", "second", "first"]);
    }
}
