//! # busrpc
//!
//! RPC dispatch over a publish/subscribe bus. A caller publishes a JSON object to
//! `[environment.]queue.module.method` with a reply subject; exactly one server in the
//! module's queue group receives it, runs it through the middleware chain into the
//! registered handler, and the handler answers on the reply subject.
//!
//! ```ignore
//! use busrpc::{AccessLog, Module, Server, ServerConfig};
//!
//! let user = Module::new().method("get", |ctx| {
//!     Box::pin(async move {
//!         let id = match ctx.params().get_int("id") {
//!             Ok(id) => id,
//!             Err(e) => return ctx.error(400, (), e).await,
//!         };
//!         ctx.json(serde_json::json!({ "id": id })).await
//!     })
//! });
//!
//! Server::connect(ServerConfig::default())
//!     .await?
//!     .router("user", user)
//!     .use_middleware(AccessLog)
//!     .serving(shutdown)
//!     .await?;
//! ```

pub mod bus;
pub mod client;
pub mod config;
pub mod context;
pub mod dispatcher;
pub mod error;
pub mod middleware;
pub mod params;
pub mod registry;
pub mod server;
pub mod subject;
pub mod telemetry;

// Re-exports
pub use bus::{Bus, BusError, BusMessage, InMemoryBus};
#[cfg(feature = "nats")]
pub use bus::NatsBus;
pub use client::{Client, ClientError, Reply};
pub use config::{ConfigError, LoggingConfig, ServerConfig};
pub use context::{Cookie, HandlerResult, ReplyError, RequestContext, Response};
pub use dispatcher::{DispatchError, Dispatcher};
pub use error::{Error, Result};
pub use middleware::{from_fn, AccessLog, Middleware, Next};
pub use params::{ParamError, Params};
pub use registry::{MethodHandler, Module, Registry};
pub use server::{BoundServer, Server, ServerError, ServerIdentity};
pub use subject::{Subject, SubjectCodec, SubjectError, SubjectLayout};
pub use tokio_util::sync::CancellationToken;
