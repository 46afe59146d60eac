//! Turns one bus message into one request:
//!
//! ```text
//! Received ─▶ Parsed ─▶ Decoded ─▶ FieldsExtracted ─▶ MiddlewareRunning ─▶ HandlerInvoked ─▶ Responded
//!     └──────────┴─────────┴────────────┴──────────────────┴───────────────────┴──▶ Aborted
//! ```
//!
//! Every message runs as its own dispatch unit: a tokio task watched by a supervisor task.
//! A panic inside middleware or a handler ends only that unit. The unit catches it together
//! with the backtrace taken at the panic site, and the supervisor logs both and answers the
//! caller with a raw `server internal error` text if nothing was replied yet.

use std::{
    any::Any,
    backtrace::Backtrace,
    cell::RefCell,
    panic::{self, AssertUnwindSafe},
    sync::{Arc, Once},
};

use futures::FutureExt;
use thiserror::Error;
use tracing::{debug, error, warn};

use crate::{
    bus::{Bus, BusError, BusMessage},
    context::{ReplyError, ReplyGuard, RequestContext},
    middleware::{Middleware, Next},
    params::Params,
    registry::Registry,
    server::ServerIdentity,
    subject::{SubjectCodec, SubjectError},
};

/// Raw reply for bodies that are not a single JSON object.
pub const MALFORMED_PARAMS: &str = "params should be json format";

#[derive(Clone)]
pub struct Dispatcher {
    codec: SubjectCodec,
    identity: Arc<ServerIdentity>,
    bus: Arc<dyn Bus>,
    registry: Arc<Registry>,
    middlewares: Arc<[Arc<dyn Middleware>]>,
}

impl Dispatcher {
    pub fn new(
        codec: SubjectCodec,
        identity: Arc<ServerIdentity>,
        bus: Arc<dyn Bus>,
        registry: Arc<Registry>,
        middlewares: Arc<[Arc<dyn Middleware>]>,
    ) -> Self {
        Self {
            codec,
            identity,
            bus,
            registry,
            middlewares,
        }
    }

    /// Runs `message` in its own task and converts a panic into a best-effort raw reply.
    pub async fn supervise(&self, message: BusMessage) {
        let guard = ReplyGuard::new();
        let subject = message.subject.clone();
        let reply_to = message.reply_to.clone();

        let unit = {
            let dispatcher = self.clone();
            let guard = guard.clone();
            tokio::spawn(async move { dispatcher.run_unit(message, guard).await })
        };

        let outcome = match unit.await {
            Ok(outcome) => outcome,
            Err(e) => {
                warn!(subject = %subject, error = %e, "dispatch unit cancelled");
                return;
            }
        };

        let text = match outcome {
            Ok(Ok(())) => return,
            Ok(Err(DispatchError::Reply(ReplyError::Serialize(e)))) => {
                error!(subject = %subject, error = %e, "reply could not be encoded");
                format!("server internal error: {}", e)
            }
            Ok(Err(e)) => {
                warn!(subject = %subject, error = %e, "request aborted");
                return;
            }
            Err(fault) => {
                error!(
                    subject = %subject,
                    panic = %fault.message,
                    backtrace = %fault.backtrace,
                    "dispatch unit panicked"
                );
                format!("server internal error: {}", fault.message)
            }
        };

        if let Some(reply_to) = reply_to {
            if let Err(e) = self.raw_reply(&reply_to, &guard, text).await {
                warn!(subject = %subject, error = %e, "failed to report internal error");
            }
        }
    }

    /// Dispatches `message`, catching a panic on the task it happens on.
    pub(crate) async fn run_unit(
        &self,
        message: BusMessage,
        guard: ReplyGuard,
    ) -> Result<DispatchResult<()>, Fault> {
        install_panic_hook();
        match AssertUnwindSafe(self.dispatch(message, guard))
            .catch_unwind()
            .await
        {
            Ok(result) => Ok(result),
            Err(payload) => Err(Fault {
                message: panic_message(payload),
                backtrace: PANIC_TRACE
                    .with(|trace| trace.borrow_mut().take())
                    .map(|trace| trace.to_string())
                    .unwrap_or_else(|| "backtrace unavailable".to_string()),
            }),
        }
    }

    /// Drives one message through parsing, decoding, the middleware chain and the handler.
    ///
    /// Protocol failures are answered with raw text before the error is returned.
    pub async fn dispatch(&self, message: BusMessage, guard: ReplyGuard) -> DispatchResult<()> {
        let BusMessage {
            subject,
            payload,
            reply_to,
        } = message;

        let parsed = match self.codec.parse(&subject) {
            Ok(parsed) => parsed,
            Err(e) => {
                if let Some(reply_to) = &reply_to {
                    let text = format!("invalid subject: {}", subject);
                    self.raw_reply(reply_to, &guard, text).await?;
                }
                return Err(e.into());
            }
        };

        let mut ctx =
            RequestContext::new(parsed, reply_to, self.identity.clone(), self.bus.clone())
                .with_reply_guard(guard);

        if !payload.is_empty() {
            match Params::decode(&payload) {
                Ok(params) => ctx.bind_params(params),
                Err(e) => {
                    ctx.write(MALFORMED_PARAMS).await?;
                    return Err(DispatchError::MalformedParams {
                        module: ctx.module().to_string(),
                        method: ctx.method().to_string(),
                        source: e,
                    });
                }
            }
        }

        debug!(
            module = ctx.module(),
            method = ctx.method(),
            id = ctx.id(),
            "dispatching request"
        );

        let result = Next::new(&self.middlewares, &self.registry)
            .run(&mut ctx)
            .await;

        if !ctx.has_replied() {
            debug!(
                module = ctx.module(),
                method = ctx.method(),
                id = ctx.id(),
                "request finished without a reply"
            );
        }
        if !ctx.ext_logs().is_empty() {
            debug!(id = ctx.id(), ext_logs = ?ctx.ext_logs(), "request ext logs");
        }

        result.map_err(DispatchError::from)
    }

    async fn raw_reply(
        &self,
        reply_to: &str,
        guard: &ReplyGuard,
        text: String,
    ) -> Result<(), BusError> {
        if !guard.claim() {
            return Ok(());
        }
        self.bus.publish(reply_to, text.into_bytes()).await
    }
}

/// A panic caught inside a dispatch unit.
#[derive(Debug)]
pub(crate) struct Fault {
    pub(crate) message: String,
    pub(crate) backtrace: String,
}

thread_local! {
    static PANIC_TRACE: RefCell<Option<Backtrace>> = const { RefCell::new(None) };
}

static PANIC_HOOK: Once = Once::new();

// The hook runs on the panicking thread before unwinding, so the trace still holds the
// frames of the middleware or handler. `run_unit` reads it back on the same thread.
fn install_panic_hook() {
    PANIC_HOOK.call_once(|| {
        let previous = panic::take_hook();
        panic::set_hook(Box::new(move |info| {
            PANIC_TRACE.with(|trace| *trace.borrow_mut() = Some(Backtrace::force_capture()));
            previous(info);
        }));
    });
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[derive(Error, Debug)]
pub enum DispatchError {
    #[error(transparent)]
    InvalidSubject(#[from] SubjectError),

    #[error("malformed params for {module}.{method}: {source}")]
    MalformedParams {
        module: String,
        method: String,
        #[source]
        source: serde_json::Error,
    },

    #[error(transparent)]
    Reply(#[from] ReplyError),

    #[error(transparent)]
    Bus(#[from] BusError),
}

pub type DispatchResult<T> = Result<T, DispatchError>;
