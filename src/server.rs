//! A [`Server`] collects modules and middleware, then [`Server::bind`] subscribes one
//! queue-group subscription per module and freezes both tables into a [`BoundServer`].
//! [`BoundServer::run`] pulls messages from all subscriptions and spawns one supervised
//! dispatch unit per message until the shutdown token is cancelled.
//!
//! ```ignore
//! let shutdown = CancellationToken::new();
//! Server::new(config, bus)
//!     .router("user", user_module)
//!     .use_middleware(AccessLog)
//!     .serving(shutdown.clone())
//!     .await?;
//! ```

use std::{sync::Arc, time::Duration};

use futures::{stream::select_all, StreamExt};
use thiserror::Error;
use tokio_util::{sync::CancellationToken, task::TaskTracker};
use tracing::{debug, info, warn};

use crate::{
    bus::{Bus, BusError, Subscription},
    config::ServerConfig,
    dispatcher::Dispatcher,
    middleware::Middleware,
    registry::{Module, Registry},
    subject::SubjectCodec,
};

/// Read-only identity exposed to handlers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerIdentity {
    pub id: String,
    pub queue: String,
    pub environment: Option<String>,
}

impl ServerIdentity {
    pub fn new(
        id: impl Into<String>,
        queue: impl Into<String>,
        environment: Option<String>,
    ) -> Self {
        Self {
            id: id.into(),
            queue: queue.into(),
            environment,
        }
    }
}

pub struct Server {
    codec: SubjectCodec,
    identity: Arc<ServerIdentity>,
    bus: Arc<dyn Bus>,
    registry: Registry,
    middlewares: Vec<Arc<dyn Middleware>>,
    shutdown_grace: Duration,
}

impl Server {
    pub fn new(config: ServerConfig, bus: Arc<dyn Bus>) -> Self {
        Self {
            codec: config.codec(),
            identity: Arc::new(config.identity()),
            bus,
            registry: Registry::new(),
            middlewares: Vec::new(),
            shutdown_grace: config.shutdown_grace,
        }
    }

    #[cfg(feature = "nats")]
    pub async fn connect(config: ServerConfig) -> ServerResult<Self> {
        let bus = crate::bus::NatsBus::connect(&config.nats_url)
            .await
            .map_err(ServerError::Connect)?;
        Ok(Self::new(config, Arc::new(bus)))
    }

    pub fn id(&self) -> &str {
        &self.identity.id
    }

    pub fn codec(&self) -> &SubjectCodec {
        &self.codec
    }

    pub fn bus(&self) -> Arc<dyn Bus> {
        self.bus.clone()
    }

    /// Registers `module` under `name`; the last registration for a name wins.
    pub fn router(mut self, name: impl Into<String>, module: Module) -> Self {
        self.registry.register(name, module);
        self
    }

    /// Appends to the middleware chain.
    pub fn use_middleware(mut self, middleware: impl Middleware + 'static) -> Self {
        self.middlewares.push(Arc::new(middleware));
        self
    }

    pub fn use_middlewares(
        mut self,
        middlewares: impl IntoIterator<Item = Arc<dyn Middleware>>,
    ) -> Self {
        self.middlewares.extend(middlewares);
        self
    }

    /// Subscribes every registered module under its queue group.
    pub async fn bind(self) -> ServerResult<BoundServer> {
        let mut modules: Vec<String> = self.registry.module_names().map(str::to_string).collect();
        modules.sort();

        let mut subscriptions = Vec::with_capacity(modules.len());
        for module in &modules {
            let subject = self.codec.subscription_subject(module);
            let queue_group = self.codec.queue_group(module);
            let subscription = self
                .bus
                .queue_subscribe(&subject, &queue_group)
                .await
                .map_err(ServerError::Subscribe)?;
            info!(subject = %subject, queue_group = %queue_group, "subscribed");
            subscriptions.push(subscription);
        }

        let dispatcher = Dispatcher::new(
            self.codec,
            self.identity.clone(),
            self.bus,
            Arc::new(self.registry),
            Arc::from(self.middlewares),
        );

        Ok(BoundServer {
            id: self.identity.id.clone(),
            modules,
            dispatcher,
            subscriptions,
            shutdown_grace: self.shutdown_grace,
        })
    }

    pub async fn serving(self, shutdown: CancellationToken) -> ServerResult<()> {
        self.bind().await?.run(shutdown).await
    }
}

/// A server whose subscriptions are live; registry and chain are frozen.
pub struct BoundServer {
    id: String,
    modules: Vec<String>,
    dispatcher: Dispatcher,
    subscriptions: Vec<Subscription>,
    shutdown_grace: Duration,
}

impl BoundServer {
    pub fn modules(&self) -> &[String] {
        &self.modules
    }

    /// Dispatches incoming messages until `shutdown` is cancelled, then waits up to the
    /// shutdown grace period for in-flight requests.
    pub async fn run(self, shutdown: CancellationToken) -> ServerResult<()> {
        let BoundServer {
            id,
            modules,
            dispatcher,
            subscriptions,
            shutdown_grace,
        } = self;

        if subscriptions.is_empty() {
            warn!(server = %id, "no modules registered, waiting for shutdown");
            shutdown.cancelled().await;
            return Ok(());
        }

        info!(server = %id, modules = ?modules, "serving");
        let mut messages = select_all(subscriptions);
        let tracker = TaskTracker::new();

        let outcome = loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!(server = %id, "shutdown requested");
                    break Ok(());
                }
                message = messages.next() => match message {
                    Some(message) => {
                        debug!(subject = %message.subject, "message received");
                        let dispatcher = dispatcher.clone();
                        tracker.spawn(async move { dispatcher.supervise(message).await });
                    }
                    None => {
                        warn!(server = %id, "all subscriptions closed");
                        break Err(ServerError::SubscriptionsClosed);
                    }
                },
            }
        };

        drop(messages);
        tracker.close();
        if tokio::time::timeout(shutdown_grace, tracker.wait()).await.is_err() {
            warn!(
                server = %id,
                in_flight = tracker.len(),
                grace = ?shutdown_grace,
                "shutdown grace elapsed with requests in flight"
            );
        }
        info!(server = %id, "stopped");
        outcome
    }
}

#[derive(Error, Debug)]
pub enum ServerError {
    #[error("failed to connect to bus: {0}")]
    Connect(#[source] BusError),

    #[error("{0}")]
    Subscribe(#[source] BusError),

    #[error("all subscriptions closed")]
    SubscriptionsClosed,
}

pub type ServerResult<T> = Result<T, ServerError>;
