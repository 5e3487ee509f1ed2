//! Command Bus with an ordered middleware chain.
//!
//! `CommandBus` holds its middlewares in a `Vec` in registration order, and
//! `MiddlewareChain` indexes into that `Vec` by position rather than
//! composing the whole chain into one nested closure ahead of dispatch time,
//! so a debugger can step through one stack frame per middleware.

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::sync::Arc;

use eventweave_messaging::{Command, ExecutionContext};
use eventweave_store::StoredEvent;

use crate::error::RepositoryError;
use crate::middleware::Middleware;

pub type CommandOutcome = Result<Vec<StoredEvent>, RepositoryError>;
pub(crate) type ErasedCommand = Box<dyn Any + Send>;
type TerminalFn = Box<dyn Fn(ErasedCommand, ExecutionContext) -> CommandOutcome + Send + Sync>;

/// Everything a middleware can learn about a command without knowing its
/// concrete type: its type name (for logging), its idempotency key (for the
/// idempotency middleware), and a way to clone the erased value (for the
/// concurrency retry middleware, which needs to re-dispatch the same command
/// after `next` has already consumed it once).
pub struct CommandMeta<'a> {
    pub command_type: &'static str,
    pub idempotency_key: Option<&'a str>,
    pub(crate) clone: &'a dyn Fn(&ErasedCommand) -> ErasedCommand,
}

impl<'a> CommandMeta<'a> {
    pub fn clone_command(&self, command: &ErasedCommand) -> ErasedCommand {
        (self.clone)(command)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("no handler registered for command type {0}")]
    NoHandler(&'static str),
}

impl From<DispatchError> for RepositoryError {
    fn from(value: DispatchError) -> Self {
        RepositoryError::Validation(value.to_string())
    }
}

/// Routes commands through a middleware chain to their registered aggregate
/// handler.
pub struct CommandBus {
    middlewares: Vec<Arc<dyn Middleware>>,
    handlers: HashMap<TypeId, TerminalFn>,
}

impl CommandBus {
    pub fn new() -> Self {
        Self {
            middlewares: Vec::new(),
            handlers: HashMap::new(),
        }
    }

    /// Appends a middleware to the end of the chain. Middlewares run in
    /// registration order on the way in, and unwind in reverse order on the
    /// way out (the usual middleware/onion pattern). The same `Middleware`
    /// may also be registered on a `QueryBus`; it opts in to whichever side
    /// it cares about by overriding `handle_command`/`handle_query`.
    pub fn register_middleware(&mut self, middleware: Arc<dyn Middleware>) {
        self.middlewares.push(middleware);
    }

    /// Registers the terminal handler for command type `C`.
    pub fn register_handler<C, F>(&mut self, handler: F)
    where
        C: Command,
        F: Fn(C, ExecutionContext) -> CommandOutcome + Send + Sync + 'static,
    {
        let type_id = TypeId::of::<C>();
        self.handlers.insert(
            type_id,
            Box::new(move |command: ErasedCommand, ctx: ExecutionContext| {
                let command = *command
                    .downcast::<C>()
                    .expect("command type matches its TypeId key");
                handler(command, ctx)
            }),
        );
    }

    /// Dispatches a command through the middleware chain to its terminal handler.
    pub fn dispatch<C: Command>(&self, command: C, ctx: ExecutionContext) -> CommandOutcome {
        let type_id = TypeId::of::<C>();
        let command_type = core::any::type_name::<C>();
        let idempotency_key = command.idempotency_key().map(str::to_owned);
        let clone: &dyn Fn(&ErasedCommand) -> ErasedCommand = &|boxed: &ErasedCommand| -> ErasedCommand {
            let concrete = boxed
                .downcast_ref::<C>()
                .expect("command type matches its TypeId key");
            Box::new(concrete.clone())
        };
        let meta = CommandMeta {
            command_type,
            idempotency_key: idempotency_key.as_deref(),
            clone,
        };

        let terminal = match self.handlers.get(&type_id) {
            Some(handler) => handler,
            None => return Err(DispatchError::NoHandler(command_type).into()),
        };

        let chain = MiddlewareChain {
            middlewares: &self.middlewares,
            terminal: terminal.as_ref(),
            meta: &meta,
        };
        chain.run(0, Box::new(command), ctx)
    }
}

impl Default for CommandBus {
    fn default() -> Self {
        Self::new()
    }
}

/// Cursor over the registered middlewares plus the terminal handler.
///
/// `run` indexes into `middlewares` by position instead of nesting closures
/// ahead of dispatch time.
struct MiddlewareChain<'a> {
    middlewares: &'a [Arc<dyn Middleware>],
    terminal: &'a (dyn Fn(ErasedCommand, ExecutionContext) -> CommandOutcome + Send + Sync),
    meta: &'a CommandMeta<'a>,
}

impl<'a> MiddlewareChain<'a> {
    fn run(&self, index: usize, command: ErasedCommand, ctx: ExecutionContext) -> CommandOutcome {
        match self.middlewares.get(index) {
            Some(middleware) => {
                let mut next = |cmd: ErasedCommand, ctx: ExecutionContext| self.run(index + 1, cmd, ctx);
                middleware.handle_command(command, self.meta, ctx, &mut next)
            }
            None => (self.terminal)(command, ctx),
        }
    }
}
