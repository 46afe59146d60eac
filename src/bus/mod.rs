//! # Message Bus
//!
//! The dispatcher never talks to a transport directly. Everything it needs from the bus,
//! publishing, queue-group subscriptions and caller-side request/reply, sits behind the
//! [`Bus`] trait.
//!
//! ## Implementations
//!
//! - **[`InMemoryBus`]**: process-local bus with NATS subject semantics, used by tests
//!   and embedded deployments
//! - **`NatsBus`** (feature `nats`): production bus backed by `async-nats`
//!
//! ## Delivery Model
//!
//! ```text
//! ┌────────┐  publish(subject, reply)  ┌─────┐  queue group "env:app:user"  ┌──────────┐
//! │ Caller │──────────────────────────▶│ Bus │─────────────────────────────▶│ Server A │
//! └───▲────┘                           └──┬──┘         (exactly one)        ├──────────┤
//!     │                                   └ ─ ─ ─ ─ ─ ─ ─ ─ ─ ─ ─ ─ ─ ─ ─ ─▶│ Server B │
//!     │              reply subject                                         └────┬─────┘
//!     └─────────────────────────────────────────────────────────────────────────┘
//! ```

mod memory;
#[cfg(feature = "nats")]
mod nats;

pub use memory::InMemoryBus;
#[cfg(feature = "nats")]
pub use nats::NatsBus;

use std::{fmt, time::Duration};

use async_trait::async_trait;
use futures::stream::BoxStream;
use thiserror::Error;

/// A message delivered by the bus.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BusMessage {
    /// Concrete subject the message was published on
    pub subject: String,
    /// Raw payload bytes
    pub payload: Vec<u8>,
    /// Ephemeral subject the publisher listens on for the reply
    pub reply_to: Option<String>,
}

impl BusMessage {
    pub fn new(subject: impl Into<String>, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            subject: subject.into(),
            payload: payload.into(),
            reply_to: None,
        }
    }

    pub fn with_reply_to(mut self, reply_to: impl Into<String>) -> Self {
        self.reply_to = Some(reply_to.into());
        self
    }
}

/// Stream of messages produced by a subscription.
pub type Subscription = BoxStream<'static, BusMessage>;

/// Publish/subscribe transport used by servers and callers.
///
/// Connection management, reconnects and at-least-once delivery are the implementation's
/// business; the dispatcher only relies on the operations below.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Bus: Send + Sync {
    /// Publishes `payload` on `subject` without a reply destination.
    async fn publish(&self, subject: &str, payload: Vec<u8>) -> BusResult<()>;

    /// Publishes `payload` on `subject`, asking responders to answer on `reply_to`.
    async fn publish_with_reply(
        &self,
        subject: &str,
        reply_to: &str,
        payload: Vec<u8>,
    ) -> BusResult<()>;

    /// Receives every message matching `subject` (`*` and `>` wildcards allowed).
    async fn subscribe(&self, subject: &str) -> BusResult<Subscription>;

    /// Receives messages matching `subject`; each message goes to exactly one member of
    /// `queue_group` across all subscribers sharing that group name.
    async fn queue_subscribe(&self, subject: &str, queue_group: &str) -> BusResult<Subscription>;

    /// Publishes a request on an ephemeral inbox and waits for the first reply.
    async fn request(
        &self,
        subject: &str,
        payload: Vec<u8>,
        timeout: Duration,
    ) -> BusResult<BusMessage>;
}

impl fmt::Debug for dyn Bus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Bus")
    }
}

/// Returns true when `subject` matches `pattern` using NATS token wildcards.
pub fn subject_matches(pattern: &str, subject: &str) -> bool {
    let mut pattern_tokens = pattern.split('.');
    let mut subject_tokens = subject.split('.');
    loop {
        match (pattern_tokens.next(), subject_tokens.next()) {
            (Some(">"), Some(_)) => return true,
            (Some("*"), Some(_)) => continue,
            (Some(expected), Some(token)) if expected == token => continue,
            (None, None) => return true,
            _ => return false,
        }
    }
}

#[derive(Error, Debug)]
pub enum BusError {
    #[error("connection error: {0}")]
    Connection(String),

    #[error("failed to publish on {subject}: {message}")]
    Publish { subject: String, message: String },

    #[error("failed to subscribe to {subject}: {message}")]
    Subscribe { subject: String, message: String },

    #[error("no responders on {subject}")]
    NoResponders { subject: String },

    #[error("request on {subject} timed out after {timeout:?}")]
    Timeout { subject: String, timeout: Duration },

    #[error("bus closed")]
    Closed,
}

pub type BusResult<T> = Result<T, BusError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_subject_matches_wildcards() {
        assert!(subject_matches("dev.app.user.*", "dev.app.user.create"));
        assert!(!subject_matches("dev.app.user.*", "dev.app.user.sub.create"));
        assert!(subject_matches("dev.app.user.sub.*", "dev.app.user.sub.create"));
        assert!(subject_matches("dev.>", "dev.app.user.create"));
        assert!(!subject_matches("dev.>", "dev"));
        assert!(subject_matches("_INBOX.abc", "_INBOX.abc"));
        assert!(!subject_matches("dev.app.user.*", "dev.app.order.create"));
    }
}
