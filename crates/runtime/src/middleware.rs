//! The shared `Middleware` contract and the concrete implementations built
//! on top of it.
//!
//! A single `Middleware` is registered once with `ApplicationBuilder` and
//! applies to both the command bus and the query bus; it opts in to
//! commands, queries, or both by overriding the corresponding method(s);
//! the default implementation of each is a transparent pass-through to
//! `next`. None of the concrete middlewares below carry business rules; they
//! are purely cross-cutting: ambient context propagation, structured
//! logging, idempotent replay, and concurrency-conflict retry.

use std::sync::Arc;
use std::time::Duration;

use eventweave_messaging::ExecutionContext;
use eventweave_store::IdempotencyBackend;
use tracing::{info_span, warn};

use crate::command_bus::{CommandMeta, CommandOutcome, ErasedCommand};
use crate::error::RepositoryError;
use crate::query_bus::{ErasedQuery, ErasedQueryOutcome, QueryMeta};

/// A single link in the command or query dispatch pipeline.
///
/// `next` delegates to the remaining chain (either the next middleware, or
/// the terminal handler once the chain is exhausted). A middleware that
/// returns without calling `next` short-circuits dispatch. The two methods
/// are independent: a middleware overrides `handle_command`, `handle_query`,
/// or both, depending on which kind of message it cares about. This mirrors
/// "middleware may opt in to queries, commands, or both": a Rust trait's
/// default-method override stands in for annotation-based type matching.
pub trait Middleware: Send + Sync {
    fn handle_command(
        &self,
        command: ErasedCommand,
        _meta: &CommandMeta,
        ctx: ExecutionContext,
        next: &mut dyn FnMut(ErasedCommand, ExecutionContext) -> CommandOutcome,
    ) -> CommandOutcome {
        next(command, ctx)
    }

    fn handle_query(
        &self,
        query: ErasedQuery,
        _meta: &QueryMeta,
        ctx: ExecutionContext,
        next: &mut dyn FnMut(ErasedQuery, ExecutionContext) -> ErasedQueryOutcome,
    ) -> ErasedQueryOutcome {
        next(query, ctx)
    }
}

/// Enters `ctx` as the ambient [`ExecutionContext`] for the duration of the
/// downstream call, so code that can't have the context threaded to it
/// explicitly (chiefly the test scenario kits) can still read it via
/// `ExecutionContext::current()`. Application code should still prefer
/// threading the context explicitly rather than relying on this. Applies to
/// both commands and queries, since both carry correlation/causation ids.
pub struct ContextPropagationMiddleware;

impl Middleware for ContextPropagationMiddleware {
    fn handle_command(
        &self,
        command: ErasedCommand,
        _meta: &CommandMeta,
        ctx: ExecutionContext,
        next: &mut dyn FnMut(ErasedCommand, ExecutionContext) -> CommandOutcome,
    ) -> CommandOutcome {
        let _scope = ctx.enter();
        next(command, ctx)
    }

    fn handle_query(
        &self,
        query: ErasedQuery,
        _meta: &QueryMeta,
        ctx: ExecutionContext,
        next: &mut dyn FnMut(ErasedQuery, ExecutionContext) -> ErasedQueryOutcome,
    ) -> ErasedQueryOutcome {
        let _scope = ctx.enter();
        next(query, ctx)
    }
}

/// Wraps dispatch in a tracing span carrying the command/query type and
/// correlation id, and logs the outcome. Applies to both commands and
/// queries.
pub struct LoggingMiddleware;

impl Middleware for LoggingMiddleware {
    fn handle_command(
        &self,
        command: ErasedCommand,
        meta: &CommandMeta,
        ctx: ExecutionContext,
        next: &mut dyn FnMut(ErasedCommand, ExecutionContext) -> CommandOutcome,
    ) -> CommandOutcome {
        let span = info_span!(
            "command_dispatch",
            command_type = meta.command_type,
            correlation_id = %ctx.correlation_id(),
        );
        let _entered = span.enter();
        let result = next(command, ctx);
        match &result {
            Ok(events) => tracing::info!(event_count = events.len(), "command dispatched"),
            Err(err) => warn!(error = %err, "command dispatch failed"),
        }
        result
    }

    fn handle_query(
        &self,
        query: ErasedQuery,
        meta: &QueryMeta,
        ctx: ExecutionContext,
        next: &mut dyn FnMut(ErasedQuery, ExecutionContext) -> ErasedQueryOutcome,
    ) -> ErasedQueryOutcome {
        let span = info_span!(
            "query_dispatch",
            query_type = meta.query_type,
            correlation_id = %ctx.correlation_id(),
        );
        let _entered = span.enter();
        let result = next(query, ctx);
        match &result {
            Ok(_) => tracing::info!("query dispatched"),
            Err(err) => warn!(error = %err, "query dispatch failed"),
        }
        result
    }
}

/// Short-circuits a command carrying an idempotency key that was already
/// processed. Records the key only once the terminal handler returns `Ok`,
/// so a failed attempt remains retryable. Queries have no side effects to
/// deduplicate, so `handle_query` is left at its pass-through default.
pub struct IdempotencyMiddleware {
    backend: Arc<dyn IdempotencyBackend>,
}

impl IdempotencyMiddleware {
    pub fn new(backend: Arc<dyn IdempotencyBackend>) -> Self {
        Self { backend }
    }
}

impl Middleware for IdempotencyMiddleware {
    fn handle_command(
        &self,
        command: ErasedCommand,
        meta: &CommandMeta,
        ctx: ExecutionContext,
        next: &mut dyn FnMut(ErasedCommand, ExecutionContext) -> CommandOutcome,
    ) -> CommandOutcome {
        let Some(key) = meta.idempotency_key else {
            return next(command, ctx);
        };

        if self.backend.check(key).is_some() {
            return Ok(vec![]);
        }

        let result = next(command, ctx);
        if let Ok(events) = &result {
            self.backend.record(key, events.iter().map(|e| e.event_id).collect());
        }
        result
    }
}

/// Retries a command a bounded number of times when it fails on an
/// optimistic concurrency conflict, sleeping `retry_delay` between attempts.
/// Any other error propagates immediately. Queries never append events, so
/// there is no concurrency conflict to retry; `handle_query` is left at its
/// pass-through default.
pub struct ConcurrencyRetryMiddleware {
    max_attempts: u32,
    retry_delay: Duration,
}

impl ConcurrencyRetryMiddleware {
    pub fn new(max_attempts: u32, retry_delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            retry_delay,
        }
    }
}

impl Middleware for ConcurrencyRetryMiddleware {
    fn handle_command(
        &self,
        command: ErasedCommand,
        meta: &CommandMeta,
        ctx: ExecutionContext,
        next: &mut dyn FnMut(ErasedCommand, ExecutionContext) -> CommandOutcome,
    ) -> CommandOutcome {
        let mut attempt = 1;
        let mut current = command;
        loop {
            let retry_clone = (attempt < self.max_attempts).then(|| meta.clone_command(&current));
            let result = next(current, ctx);
            match result {
                Err(RepositoryError::Concurrency(ref msg)) if attempt < self.max_attempts => {
                    warn!(attempt, reason = %msg, "retrying command after concurrency conflict");
                    std::thread::sleep(self.retry_delay);
                    current = retry_clone.expect("cloned before this attempt");
                    attempt += 1;
                }
                other => return other,
            }
        }
    }
}
