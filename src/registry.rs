//! Maps module names to [`Module`]s and method names to [`MethodHandler`]s. Both tables are
//! built before the server binds and only read afterwards.
//!
//! Method names are canonicalized (ASCII lowercase) at registration and at lookup, so
//! `create`, `Create` and `CREATE` route to the same handler. Module names match exactly.

use std::{collections::HashMap, fmt, sync::Arc};

use async_trait::async_trait;
use futures::future::BoxFuture;
use tracing::warn;

use crate::context::{HandlerResult, RequestContext};

/// One callable capability of a module.
#[async_trait]
pub trait MethodHandler: Send + Sync {
    async fn call(&self, ctx: &mut RequestContext) -> HandlerResult;
}

pub struct FnHandler<F>(F);

#[async_trait]
impl<F> MethodHandler for FnHandler<F>
where
    F: for<'a> Fn(&'a mut RequestContext) -> BoxFuture<'a, HandlerResult> + Send + Sync + 'static,
{
    async fn call(&self, ctx: &mut RequestContext) -> HandlerResult {
        (self.0)(ctx).await
    }
}

/// Canonical form of a routed method token.
pub fn canonical_method(method: &str) -> String {
    method.to_ascii_lowercase()
}

/// Method table of one module.
#[derive(Default, Clone)]
pub struct Module {
    methods: HashMap<String, Arc<dyn MethodHandler>>,
}

impl Module {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a closure handler; a later method with the same canonical name replaces it.
    pub fn method<F>(self, name: &str, f: F) -> Self
    where
        F: for<'a> Fn(&'a mut RequestContext) -> BoxFuture<'a, HandlerResult>
            + Send
            + Sync
            + 'static,
    {
        self.handler(name, FnHandler(f))
    }

    pub fn handler(mut self, name: &str, handler: impl MethodHandler + 'static) -> Self {
        self.methods
            .insert(canonical_method(name), Arc::new(handler));
        self
    }

    pub fn resolve(&self, method: &str) -> Option<&Arc<dyn MethodHandler>> {
        self.methods.get(&canonical_method(method))
    }

    pub fn method_names(&self) -> impl Iterator<Item = &str> {
        self.methods.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.methods.len()
    }

    pub fn is_empty(&self) -> bool {
        self.methods.is_empty()
    }
}

impl fmt::Debug for Module {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names: Vec<_> = self.method_names().collect();
        names.sort_unstable();
        f.debug_struct("Module").field("methods", &names).finish()
    }
}

#[derive(Debug, Default)]
pub struct Registry {
    modules: HashMap<String, Module>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `module` under `name`. The last registration for a name wins.
    pub fn register(&mut self, name: impl Into<String>, module: Module) {
        let name = name.into();
        if self.modules.insert(name.clone(), module).is_some() {
            warn!(module = %name, "module registered twice, replacing previous handler");
        }
    }

    pub fn get(&self, name: &str) -> Option<&Module> {
        self.modules.get(name)
    }

    pub fn module_names(&self) -> impl Iterator<Item = &str> {
        self.modules.keys().map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.modules.is_empty()
    }

    /// Resolves the context's module and method and invokes the handler.
    ///
    /// Unknown modules and methods are answered with a raw text reply.
    pub async fn invoke(&self, ctx: &mut RequestContext) -> HandlerResult {
        let Some(module) = self.modules.get(ctx.module()) else {
            warn!(module = ctx.module(), "module not found");
            let message = format!("module {} not found", ctx.module());
            return ctx.write(message).await;
        };
        let Some(handler) = module.resolve(ctx.method()) else {
            warn!(module = ctx.module(), method = ctx.method(), "method not found");
            let message = format!("method {} not found", ctx.method());
            return ctx.write(message).await;
        };
        handler.call(ctx).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{bus::MockBus, server::ServerIdentity, subject::SubjectCodec};
    use mockall::predicate::eq;
    use serde_json::json;

    fn context(subject: &str, bus: MockBus) -> RequestContext {
        let subject = SubjectCodec::qualified("dev", "app").parse(subject).unwrap();
        RequestContext::new(
            subject,
            Some("_INBOX.r".to_string()),
            Arc::new(ServerIdentity::new("s1", "app", Some("dev".to_string()))),
            Arc::new(bus),
        )
    }

    fn registry() -> Registry {
        let mut registry = Registry::new();
        registry.register(
            "user",
            Module::new().method("Create", |ctx| {
                Box::pin(async move { ctx.json(json!({"created": true})).await })
            }),
        );
        registry
    }

    #[tokio::test]
    async fn test_method_lookup_is_case_insensitive() {
        let mut bus = MockBus::new();
        bus.expect_publish()
            .with(
                eq("_INBOX.r"),
                eq(br#"{"code":0,"errmsg":"","result":{"created":true}}"#.to_vec()),
            )
            .times(1)
            .returning(|_, _| Ok(()));

        let mut ctx = context("dev.app.user.CREATE", bus);
        registry().invoke(&mut ctx).await.unwrap();
    }

    #[tokio::test]
    async fn test_unknown_module_writes_raw_text() {
        let mut bus = MockBus::new();
        bus.expect_publish()
            .with(eq("_INBOX.r"), eq(b"module order not found".to_vec()))
            .times(1)
            .returning(|_, _| Ok(()));

        let mut ctx = context("dev.app.order.create", bus);
        registry().invoke(&mut ctx).await.unwrap();
        assert!(ctx.response().is_none());
    }

    #[tokio::test]
    async fn test_unknown_method_writes_raw_text() {
        let mut bus = MockBus::new();
        bus.expect_publish()
            .with(eq("_INBOX.r"), eq(b"method delete not found".to_vec()))
            .times(1)
            .returning(|_, _| Ok(()));

        let mut ctx = context("dev.app.user.delete", bus);
        registry().invoke(&mut ctx).await.unwrap();
    }

    #[test]
    fn test_last_registration_wins() {
        let mut registry = registry();
        registry.register(
            "user",
            Module::new().method("remove", |ctx| Box::pin(async move { ctx.json(()).await })),
        );

        let module = registry.get("user").unwrap();
        assert!(module.resolve("create").is_none());
        assert!(module.resolve("REMOVE").is_some());
        assert_eq!(module.len(), 1);
    }
}
