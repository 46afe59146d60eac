//! # Request Context
//!
//! A [`RequestContext`] is created for every inbound message and owned by the dispatch
//! unit handling it. Middleware and handlers read the routing coordinates and parameters
//! from it and answer the caller through exactly one terminal call:
//!
//! - [`RequestContext::json`]: success envelope `{"code":0,"errmsg":"","result":...}`
//! - [`RequestContext::error`]: failure envelope with a caller-chosen code and message
//! - [`RequestContext::write`]: raw bytes, bypassing the envelope (protocol failures)

use std::{
    fmt,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::{
    bus::{Bus, BusError},
    params::Params,
    server::ServerIdentity,
    subject::Subject,
};

/// Reserved payload key holding caller headers.
pub const HEADER_KEY: &str = "HEADER";
/// Reserved payload key holding caller cookies.
pub const COOKIE_KEY: &str = "COOKIE";
/// Payload key seeding the correlation id.
pub const REQ_ID_KEY: &str = "req_id";

/// Response envelope for application-level replies.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    pub code: i64,
    pub errmsg: String,
    pub result: Value,
    #[serde(rename = "COOKIE", default, skip_serializing_if = "Vec::is_empty")]
    pub cookies: Vec<Cookie>,
}

impl Response {
    pub fn success(result: Value) -> Self {
        Self {
            code: 0,
            errmsg: String::new(),
            result,
            cookies: Vec::new(),
        }
    }

    pub fn failure(code: i64, result: Value, message: impl fmt::Display) -> Self {
        Self {
            code,
            errmsg: message.to_string(),
            result,
            cookies: Vec::new(),
        }
    }

    pub fn is_success(&self) -> bool {
        self.code == 0
    }
}

/// Outgoing cookie set by a handler, forwarded by the gateway in front of the bus.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Cookie {
    pub name: String,
    pub value: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub domain: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_age: Option<i64>,
    #[serde(default)]
    pub secure: bool,
    #[serde(default)]
    pub http_only: bool,
}

impl Cookie {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
            ..Default::default()
        }
    }
}

/// Shared flag recording that a reply has been published for a request.
///
/// The dispatcher's supervisor keeps a clone so it can tell whether a faulted unit still
/// owes the caller an answer.
#[derive(Debug, Clone, Default)]
pub struct ReplyGuard(Arc<AtomicBool>);

impl ReplyGuard {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_replied(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }

    /// Marks the request as answered; false when it already was.
    pub(crate) fn claim(&self) -> bool {
        !self.0.swap(true, Ordering::AcqRel)
    }
}

/// Per-request state threaded through middleware into the handler.
pub struct RequestContext {
    subject: Subject,
    params: Params,
    header: Params,
    cookie: Params,
    id: String,
    ext_logs: Vec<String>,
    server: Arc<ServerIdentity>,
    bus: Arc<dyn Bus>,
    reply_to: Option<String>,
    new_cookies: Vec<Cookie>,
    response: Option<Response>,
    replied: ReplyGuard,
}

impl RequestContext {
    pub fn new(
        subject: Subject,
        reply_to: Option<String>,
        server: Arc<ServerIdentity>,
        bus: Arc<dyn Bus>,
    ) -> Self {
        Self {
            subject,
            params: Params::new(),
            header: Params::new(),
            cookie: Params::new(),
            id: Uuid::new_v4().to_string(),
            ext_logs: Vec::new(),
            server,
            bus,
            reply_to,
            new_cookies: Vec::new(),
            response: None,
            replied: ReplyGuard::new(),
        }
    }

    /// Shares `guard` with whoever supervises this request.
    pub fn with_reply_guard(mut self, guard: ReplyGuard) -> Self {
        self.replied = guard;
        self
    }

    /// Installs the decoded payload, lifting the reserved keys out of it.
    ///
    /// `HEADER` and `COOKIE` are moved into their own maps when they hold objects.
    /// A string or numeric `req_id` becomes the correlation id and stays visible.
    pub fn bind_params(&mut self, mut params: Params) {
        if let Some(header) = params.take_object(HEADER_KEY) {
            self.header = header;
        }
        if let Some(cookie) = params.take_object(COOKIE_KEY) {
            self.cookie = cookie;
        }
        match params.value(REQ_ID_KEY) {
            Some(Value::String(id)) if !id.is_empty() => self.id = id.clone(),
            Some(Value::Number(id)) => self.id = id.to_string(),
            _ => {}
        }
        self.params = params;
    }

    pub fn subject(&self) -> &Subject {
        &self.subject
    }

    pub fn module(&self) -> &str {
        &self.subject.module
    }

    pub fn method(&self) -> &str {
        &self.subject.method
    }

    pub fn params(&self) -> &Params {
        &self.params
    }

    pub fn params_mut(&mut self) -> &mut Params {
        &mut self.params
    }

    pub fn header(&self) -> &Params {
        &self.header
    }

    pub fn cookie(&self) -> &Params {
        &self.cookie
    }

    /// Correlation id: the caller's `req_id`, or a generated UUID.
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn server_id(&self) -> &str {
        &self.server.id
    }

    pub fn app(&self) -> &str {
        &self.server.queue
    }

    pub fn environment(&self) -> Option<&str> {
        self.server.environment.as_deref()
    }

    pub fn reply_to(&self) -> Option<&str> {
        self.reply_to.as_deref()
    }

    pub fn append_ext_log(&mut self, line: impl Into<String>) {
        self.ext_logs.push(line.into());
    }

    pub fn ext_logs(&self) -> &[String] {
        &self.ext_logs
    }

    pub fn set_cookie(&mut self, cookie: Cookie) {
        self.new_cookies.push(cookie);
    }

    /// The envelope sent by `json` or `error`, if any.
    pub fn response(&self) -> Option<&Response> {
        self.response.as_ref()
    }

    pub fn has_replied(&self) -> bool {
        self.replied.is_replied()
    }

    /// Publishes raw bytes to the reply destination without an envelope.
    pub async fn write(&mut self, bytes: impl Into<Vec<u8>>) -> HandlerResult {
        let bytes = bytes.into();
        self.claim_reply()?;
        self.publish(bytes).await
    }

    /// Replies with a success envelope carrying `result` and any cookies set so far.
    pub async fn json<T: Serialize>(&mut self, result: T) -> HandlerResult {
        let result = serde_json::to_value(result)?;
        self.respond(Response::success(result)).await
    }

    pub async fn error<T: Serialize>(
        &mut self,
        code: i64,
        result: T,
        message: impl fmt::Display,
    ) -> HandlerResult {
        let result = serde_json::to_value(result)?;
        self.respond(Response::failure(code, result, message)).await
    }

    async fn respond(&mut self, mut response: Response) -> HandlerResult {
        response.cookies = self.new_cookies.clone();
        let payload = serde_json::to_vec(&response)?;
        self.claim_reply()?;
        self.response = Some(response);
        self.publish(payload).await
    }

    fn claim_reply(&self) -> HandlerResult {
        if self.replied.claim() {
            Ok(())
        } else {
            warn!(
                module = self.module(),
                method = self.method(),
                id = %self.id,
                "reply already sent, dropping second reply"
            );
            Err(ReplyError::AlreadyReplied)
        }
    }

    async fn publish(&self, payload: Vec<u8>) -> HandlerResult {
        match &self.reply_to {
            Some(reply_to) => Ok(self.bus.publish(reply_to, payload).await?),
            None => {
                debug!(
                    module = self.module(),
                    method = self.method(),
                    "no reply destination, reply discarded"
                );
                Ok(())
            }
        }
    }
}

impl fmt::Debug for RequestContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestContext")
            .field("subject", &self.subject)
            .field("id", &self.id)
            .field("params", &self.params)
            .field("reply_to", &self.reply_to)
            .field("replied", &self.has_replied())
            .finish()
    }
}

#[derive(Error, Debug)]
pub enum ReplyError {
    #[error("failed to serialize reply: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("failed to publish reply: {0}")]
    Publish(#[from] BusError),

    #[error("reply already sent")]
    AlreadyReplied,
}

/// Outcome of middleware and handlers. Errors only describe reply delivery; application
/// failures are answered with [`RequestContext::error`].
pub type HandlerResult = Result<(), ReplyError>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{bus::MockBus, subject::SubjectLayout};
    use mockall::predicate::eq;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn identity() -> Arc<ServerIdentity> {
        Arc::new(ServerIdentity {
            id: "server-1".to_string(),
            queue: "shop".to_string(),
            environment: Some("dev".to_string()),
        })
    }

    fn context(bus: MockBus, reply_to: Option<&str>) -> RequestContext {
        let subject = Subject::parse("dev.shop.user.create", SubjectLayout::Qualified).unwrap();
        RequestContext::new(
            subject,
            reply_to.map(str::to_string),
            identity(),
            Arc::new(bus),
        )
    }

    #[tokio::test]
    async fn test_json_publishes_exact_envelope() {
        let mut bus = MockBus::new();
        bus.expect_publish()
            .with(
                eq("_INBOX.1"),
                eq(br#"{"code":0,"errmsg":"","result":{"x":1}}"#.to_vec()),
            )
            .times(1)
            .returning(|_, _| Ok(()));

        let mut ctx = context(bus, Some("_INBOX.1"));
        ctx.json(json!({"x": 1})).await.unwrap();

        assert!(ctx.has_replied());
        assert_eq!(ctx.response(), Some(&Response::success(json!({"x": 1}))));
    }

    #[tokio::test]
    async fn test_error_carries_cookies_and_message() {
        let mut bus = MockBus::new();
        bus.expect_publish()
            .withf(|subject, payload| {
                let response: Response = serde_json::from_slice(payload).unwrap();
                subject == "_INBOX.2"
                    && response.code == 403
                    && response.errmsg == "denied"
                    && response.cookies == vec![Cookie::new("sid", "abc")]
            })
            .times(1)
            .returning(|_, _| Ok(()));

        let mut ctx = context(bus, Some("_INBOX.2"));
        ctx.set_cookie(Cookie::new("sid", "abc"));
        ctx.error(403, Value::Null, "denied").await.unwrap();
    }

    #[tokio::test]
    async fn test_second_reply_is_rejected() {
        let mut bus = MockBus::new();
        bus.expect_publish().times(1).returning(|_, _| Ok(()));

        let mut ctx = context(bus, Some("_INBOX.3"));
        ctx.write("first").await.unwrap();
        let second = ctx.json(json!(1)).await;

        assert!(matches!(second, Err(ReplyError::AlreadyReplied)));
        assert!(ctx.response().is_none());
    }

    #[tokio::test]
    async fn test_missing_reply_destination_publishes_nothing() {
        let mut bus = MockBus::new();
        bus.expect_publish().never();

        let mut ctx = context(bus, None);
        ctx.json(json!({})).await.unwrap();
        assert!(ctx.has_replied());
    }

    #[tokio::test]
    async fn test_publish_failure_surfaces() {
        let mut bus = MockBus::new();
        bus.expect_publish().returning(|subject, _| {
            Err(BusError::Publish {
                subject: subject.to_string(),
                message: "closed".to_string(),
            })
        });

        let mut ctx = context(bus, Some("_INBOX.4"));
        let result = ctx.write(b"x".to_vec()).await;
        assert!(matches!(result, Err(ReplyError::Publish(_))));
    }

    #[test]
    fn test_bind_params_lifts_reserved_keys() {
        let mut ctx = context(MockBus::new(), None);
        let params: Params = serde_json::from_value(json!({
            "a": "123",
            "req_id": "abc-1",
            "HEADER": {"User-Agent": "test"},
            "COOKIE": {"sid": "s1"},
        }))
        .unwrap();

        ctx.bind_params(params);

        assert!(!ctx.params().contains_key(HEADER_KEY));
        assert!(!ctx.params().contains_key(COOKIE_KEY));
        assert_eq!(ctx.params().get("a").unwrap(), "123");
        assert_eq!(ctx.header().get("User-Agent").unwrap(), "test");
        assert_eq!(ctx.cookie().get("sid").unwrap(), "s1");
        assert_eq!(ctx.id(), "abc-1");
        assert_eq!(ctx.server_id(), "server-1");
        assert_eq!(ctx.app(), "shop");
        assert_eq!(ctx.environment(), Some("dev"));
    }

    #[test]
    fn test_success_envelope_omits_empty_cookies() {
        let encoded = serde_json::to_string(&Response::success(json!([1, 2]))).unwrap();
        assert_eq!(encoded, r#"{"code":0,"errmsg":"","result":[1,2]}"#);
    }
}
