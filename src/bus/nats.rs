//! NATS-backed bus.

use std::time::Duration;

use async_nats::{client::RequestErrorKind, Client, ConnectOptions, Event, Message};
use async_trait::async_trait;
use futures::StreamExt;
use tracing::{info, warn};

use super::{Bus, BusError, BusMessage, BusResult, Subscription};

/// [`Bus`] over a NATS connection. Reconnects and queue-group balancing are handled by the
/// NATS client and server.
#[derive(Clone)]
pub struct NatsBus {
    client: Client,
}

impl NatsBus {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    /// Connects to `url`, logging connection state changes.
    pub async fn connect(url: &str) -> BusResult<Self> {
        let client = ConnectOptions::new()
            .event_callback(|event| async move {
                match event {
                    Event::Connected => info!("nats connected"),
                    Event::Disconnected => warn!("nats disconnected"),
                    Event::Closed => warn!("nats connection closed"),
                    other => info!(event = %other, "nats event"),
                }
            })
            .connect(url)
            .await
            .map_err(|e| BusError::Connection(format!("{}: {}", url, e)))?;
        info!(url, "connected to nats");
        Ok(Self::new(client))
    }

    pub fn client(&self) -> &Client {
        &self.client
    }
}

fn into_bus_message(message: Message) -> BusMessage {
    BusMessage {
        subject: message.subject.to_string(),
        payload: message.payload.to_vec(),
        reply_to: message.reply.map(|reply| reply.to_string()),
    }
}

#[async_trait]
impl Bus for NatsBus {
    async fn publish(&self, subject: &str, payload: Vec<u8>) -> BusResult<()> {
        self.client
            .publish(subject.to_string(), payload.into())
            .await
            .map_err(|e| BusError::Publish {
                subject: subject.to_string(),
                message: e.to_string(),
            })
    }

    async fn publish_with_reply(
        &self,
        subject: &str,
        reply_to: &str,
        payload: Vec<u8>,
    ) -> BusResult<()> {
        self.client
            .publish_with_reply(subject.to_string(), reply_to.to_string(), payload.into())
            .await
            .map_err(|e| BusError::Publish {
                subject: subject.to_string(),
                message: e.to_string(),
            })
    }

    async fn subscribe(&self, subject: &str) -> BusResult<Subscription> {
        let subscriber = self
            .client
            .subscribe(subject.to_string())
            .await
            .map_err(|e| BusError::Subscribe {
                subject: subject.to_string(),
                message: e.to_string(),
            })?;
        Ok(subscriber.map(into_bus_message).boxed())
    }

    async fn queue_subscribe(&self, subject: &str, queue_group: &str) -> BusResult<Subscription> {
        let subscriber = self
            .client
            .queue_subscribe(subject.to_string(), queue_group.to_string())
            .await
            .map_err(|e| BusError::Subscribe {
                subject: subject.to_string(),
                message: e.to_string(),
            })?;
        Ok(subscriber.map(into_bus_message).boxed())
    }

    async fn request(
        &self,
        subject: &str,
        payload: Vec<u8>,
        timeout: Duration,
    ) -> BusResult<BusMessage> {
        let request = self.client.request(subject.to_string(), payload.into());
        match tokio::time::timeout(timeout, request).await {
            Ok(Ok(message)) => Ok(into_bus_message(message)),
            Ok(Err(e)) => Err(match e.kind() {
                RequestErrorKind::NoResponders => BusError::NoResponders {
                    subject: subject.to_string(),
                },
                RequestErrorKind::TimedOut => BusError::Timeout {
                    subject: subject.to_string(),
                    timeout,
                },
                _ => BusError::Publish {
                    subject: subject.to_string(),
                    message: e.to_string(),
                },
            }),
            Err(_) => Err(BusError::Timeout {
                subject: subject.to_string(),
                timeout,
            }),
        }
    }
}
