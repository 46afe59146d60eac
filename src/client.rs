//! Caller side of the request/reply pattern.

use std::{sync::Arc, time::Duration};

use serde::Serialize;
use thiserror::Error;
use tracing::debug;

use crate::{
    bus::{Bus, BusError},
    context::Response,
    subject::SubjectCodec,
};

/// A decoded reply: either a response envelope or a raw protocol message.
#[derive(Debug, Clone, PartialEq)]
pub enum Reply {
    Envelope(Response),
    Raw(String),
}

impl Reply {
    pub fn decode(payload: &[u8]) -> Self {
        match serde_json::from_slice::<Response>(payload) {
            Ok(response) => Reply::Envelope(response),
            Err(_) => Reply::Raw(String::from_utf8_lossy(payload).into_owned()),
        }
    }

    pub fn envelope(&self) -> Option<&Response> {
        match self {
            Reply::Envelope(response) => Some(response),
            Reply::Raw(_) => None,
        }
    }

    pub fn raw(&self) -> Option<&str> {
        match self {
            Reply::Raw(text) => Some(text),
            Reply::Envelope(_) => None,
        }
    }
}

#[derive(Clone)]
pub struct Client {
    bus: Arc<dyn Bus>,
    codec: SubjectCodec,
}

impl Client {
    pub fn new(bus: Arc<dyn Bus>, codec: SubjectCodec) -> Self {
        Self { bus, codec }
    }

    /// Sends `params` as a JSON object to `module.method` and waits for the reply.
    pub async fn call<P: Serialize>(
        &self,
        module: &str,
        method: &str,
        params: &P,
        timeout: Duration,
    ) -> ClientResult<Reply> {
        let payload = serde_json::to_vec(params)?;
        self.call_raw(module, method, payload, timeout).await
    }

    /// Like [`Client::call`] but sends `payload` unchanged.
    pub async fn call_raw(
        &self,
        module: &str,
        method: &str,
        payload: Vec<u8>,
        timeout: Duration,
    ) -> ClientResult<Reply> {
        let subject = self.codec.method_subject(module, method);
        debug!(subject = %subject, "calling");
        let message = self.bus.request(&subject, payload, timeout).await?;
        Ok(Reply::decode(&message.payload))
    }
}

#[derive(Error, Debug)]
pub enum ClientError {
    #[error("failed to encode params: {0}")]
    Encode(#[from] serde_json::Error),

    #[error(transparent)]
    Bus(#[from] BusError),
}

pub type ClientResult<T> = Result<T, ClientError>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::{BusMessage, MockBus};
    use serde_json::json;

    #[test]
    fn test_decode_distinguishes_envelope_from_raw() {
        let reply = Reply::decode(br#"{"code":7,"errmsg":"bad","result":null}"#);
        let response = reply.envelope().unwrap();
        assert_eq!(response.code, 7);
        assert_eq!(response.errmsg, "bad");

        let reply = Reply::decode(b"module user not found");
        assert_eq!(reply.raw(), Some("module user not found"));
    }

    #[tokio::test]
    async fn test_call_targets_method_subject() {
        let mut bus = MockBus::new();
        bus.expect_request()
            .withf(|subject, payload, _| {
                subject == "dev.shop.user.get" && payload == br#"{"id":1}"#
            })
            .times(1)
            .returning(|subject, _, _| {
                Ok(BusMessage::new(
                    subject,
                    br#"{"code":0,"errmsg":"","result":"ok"}"#.to_vec(),
                ))
            });

        let client = Client::new(Arc::new(bus), SubjectCodec::qualified("dev", "shop"));
        let reply = client
            .call("user", "get", &json!({"id": 1}), Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(reply.envelope().map(|r| &r.result), Some(&json!("ok")));
    }
}
