//! # Middleware Chain
//!
//! Interceptors run strictly in registration order around the registry lookup:
//!
//! ```text
//! A before ─▶ B before ─▶ handler ─▶ B after ─▶ A after
//! ```
//!
//! Each interceptor receives a [`Next`] handle. Awaiting [`Next::run`] continues the chain;
//! returning without calling it short-circuits the request, usually after the interceptor
//! replied through the context itself.

use std::{sync::Arc, time::Instant};

use async_trait::async_trait;
use futures::future::BoxFuture;
use tracing::info;

use crate::{
    context::{HandlerResult, RequestContext},
    registry::Registry,
};

#[async_trait]
pub trait Middleware: Send + Sync {
    async fn handle(&self, ctx: &mut RequestContext, next: Next<'_>) -> HandlerResult;
}

/// Remaining links of the chain; the registry is the implicit last one.
#[derive(Clone, Copy)]
pub struct Next<'a> {
    middlewares: &'a [Arc<dyn Middleware>],
    registry: &'a Registry,
}

impl<'a> Next<'a> {
    pub fn new(middlewares: &'a [Arc<dyn Middleware>], registry: &'a Registry) -> Self {
        Self {
            middlewares,
            registry,
        }
    }

    /// Runs the next interceptor, or the handler lookup once the chain is exhausted.
    pub async fn run(self, ctx: &mut RequestContext) -> HandlerResult {
        match self.middlewares.split_first() {
            Some((current, rest)) => {
                current
                    .handle(ctx, Next::new(rest, self.registry))
                    .await
            }
            None => self.registry.invoke(ctx).await,
        }
    }
}

/// Middleware built from a closure, see [`from_fn`].
pub struct FnMiddleware<F>(F);

/// Wraps a closure returning a boxed future as [`Middleware`].
///
/// ```ignore
/// let auth = from_fn(|ctx, next| {
///     Box::pin(async move {
///         if !matches!(ctx.header().get("token"), Ok(token) if !token.is_empty()) {
///             return ctx.error(401, (), "unauthorized").await;
///         }
///         next.run(ctx).await
///     })
/// });
/// ```
pub fn from_fn<F>(f: F) -> FnMiddleware<F>
where
    F: for<'a> Fn(&'a mut RequestContext, Next<'a>) -> BoxFuture<'a, HandlerResult>
        + Send
        + Sync
        + 'static,
{
    FnMiddleware(f)
}

#[async_trait]
impl<F> Middleware for FnMiddleware<F>
where
    F: for<'a> Fn(&'a mut RequestContext, Next<'a>) -> BoxFuture<'a, HandlerResult>
        + Send
        + Sync
        + 'static,
{
    async fn handle(&self, ctx: &mut RequestContext, next: Next<'_>) -> HandlerResult {
        (self.0)(ctx, next).await
    }
}

/// Emits one `info` event per request once the rest of the chain has finished.
#[derive(Debug, Clone, Copy, Default)]
pub struct AccessLog;

#[async_trait]
impl Middleware for AccessLog {
    async fn handle(&self, ctx: &mut RequestContext, next: Next<'_>) -> HandlerResult {
        let started = Instant::now();
        let result = next.run(ctx).await;
        let code = ctx.response().map(|response| response.code);
        info!(
            module = ctx.module(),
            method = ctx.method(),
            id = ctx.id(),
            code = ?code,
            latency_us = started.elapsed().as_micros() as u64,
            ext_logs = ?ctx.ext_logs(),
            "request served"
        );
        result
    }
}
