//! Process-local bus with NATS delivery semantics.

use std::{
    collections::BTreeMap,
    sync::atomic::{AtomicU64, AtomicUsize, Ordering},
    time::Duration,
};

use async_trait::async_trait;
use dashmap::DashMap;
use futures::StreamExt;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::trace;
use uuid::Uuid;

use super::{subject_matches, Bus, BusError, BusMessage, BusResult, Subscription};

/// Prefix of the ephemeral reply subjects created by [`Bus::request`].
pub const INBOX_PREFIX: &str = "_INBOX";

type SubscriptionId = u64;

struct Subscriber {
    pattern: String,
    queue_group: Option<String>,
    sender: mpsc::UnboundedSender<BusMessage>,
}

/// # InMemoryBus
///
/// Delivers messages between tasks of the same process. Plain subscribers receive every
/// matching message; subscribers sharing a queue group receive each matching message
/// once between them, rotating round-robin over the live members. Subscriptions end when
/// their stream is dropped.
#[derive(Default)]
pub struct InMemoryBus {
    subscribers: DashMap<SubscriptionId, Subscriber>,
    next_id: AtomicU64,
    /// Round-robin cursor per queue group
    cursors: DashMap<String, AtomicUsize>,
}

impl InMemoryBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live subscriptions (dropped streams are pruned on the next delivery).
    pub fn subscription_count(&self) -> usize {
        self.subscribers.len()
    }

    fn register(
        &self,
        pattern: &str,
        queue_group: Option<&str>,
    ) -> (SubscriptionId, mpsc::UnboundedReceiver<BusMessage>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.subscribers.insert(
            id,
            Subscriber {
                pattern: pattern.to_string(),
                queue_group: queue_group.map(str::to_string),
                sender,
            },
        );
        (id, receiver)
    }

    /// Routes `message` to matching subscribers and returns how many received it.
    fn deliver(&self, message: BusMessage) -> usize {
        let mut plain = Vec::new();
        let mut groups: BTreeMap<String, Vec<(SubscriptionId, mpsc::UnboundedSender<BusMessage>)>> =
            BTreeMap::new();

        for entry in self.subscribers.iter() {
            if !subject_matches(&entry.pattern, &message.subject) {
                continue;
            }
            match &entry.queue_group {
                None => plain.push((*entry.key(), entry.sender.clone())),
                Some(group) => groups
                    .entry(group.clone())
                    .or_default()
                    .push((*entry.key(), entry.sender.clone())),
            }
        }

        let mut delivered = 0;
        let mut closed = Vec::new();

        for (id, sender) in plain {
            if sender.send(message.clone()).is_ok() {
                delivered += 1;
            } else {
                closed.push(id);
            }
        }

        for (group, mut members) in groups {
            members.sort_by_key(|(id, _)| *id);
            let start = self
                .cursors
                .entry(group)
                .or_insert_with(|| AtomicUsize::new(0))
                .fetch_add(1, Ordering::Relaxed);
            for offset in 0..members.len() {
                let (id, sender) = &members[(start + offset) % members.len()];
                if sender.send(message.clone()).is_ok() {
                    delivered += 1;
                    break;
                }
                closed.push(*id);
            }
        }

        for id in closed {
            self.subscribers.remove(&id);
        }

        trace!(subject = %message.subject, delivered, "in-memory delivery");
        delivered
    }
}

#[async_trait]
impl Bus for InMemoryBus {
    async fn publish(&self, subject: &str, payload: Vec<u8>) -> BusResult<()> {
        self.deliver(BusMessage::new(subject, payload));
        Ok(())
    }

    async fn publish_with_reply(
        &self,
        subject: &str,
        reply_to: &str,
        payload: Vec<u8>,
    ) -> BusResult<()> {
        self.deliver(BusMessage::new(subject, payload).with_reply_to(reply_to));
        Ok(())
    }

    async fn subscribe(&self, subject: &str) -> BusResult<Subscription> {
        let (_, receiver) = self.register(subject, None);
        Ok(UnboundedReceiverStream::new(receiver).boxed())
    }

    async fn queue_subscribe(&self, subject: &str, queue_group: &str) -> BusResult<Subscription> {
        let (_, receiver) = self.register(subject, Some(queue_group));
        Ok(UnboundedReceiverStream::new(receiver).boxed())
    }

    async fn request(
        &self,
        subject: &str,
        payload: Vec<u8>,
        timeout: Duration,
    ) -> BusResult<BusMessage> {
        let inbox = format!("{}.{}", INBOX_PREFIX, Uuid::new_v4().simple());
        let (id, mut receiver) = self.register(&inbox, None);

        let delivered = self.deliver(BusMessage::new(subject, payload).with_reply_to(&inbox));
        let result = if delivered == 0 {
            Err(BusError::NoResponders {
                subject: subject.to_string(),
            })
        } else {
            match tokio::time::timeout(timeout, receiver.recv()).await {
                Ok(Some(reply)) => Ok(reply),
                Ok(None) => Err(BusError::Closed),
                Err(_) => Err(BusError::Timeout {
                    subject: subject.to_string(),
                    timeout,
                }),
            }
        };

        self.subscribers.remove(&id);
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_plain_subscribers_all_receive() {
        let bus = InMemoryBus::new();
        let mut first = bus.subscribe("dev.app.>").await.unwrap();
        let mut second = bus.subscribe("dev.app.user.*").await.unwrap();

        bus.publish("dev.app.user.create", b"hi".to_vec()).await.unwrap();

        assert_eq!(first.next().await.unwrap().payload, b"hi");
        assert_eq!(second.next().await.unwrap().subject, "dev.app.user.create");
    }

    #[tokio::test]
    async fn test_queue_group_delivers_once() {
        let bus = InMemoryBus::new();
        let mut a = bus.queue_subscribe("dev.app.user.*", "dev:app:user").await.unwrap();
        let mut b = bus.queue_subscribe("dev.app.user.*", "dev:app:user").await.unwrap();

        for i in 0..4 {
            bus.publish("dev.app.user.create", vec![i]).await.unwrap();
        }

        let mut received = Vec::new();
        for _ in 0..2 {
            received.push(a.next().await.unwrap().payload[0]);
            received.push(b.next().await.unwrap().payload[0]);
        }
        received.sort();
        assert_eq!(received, vec![0, 1, 2, 3]);
    }

    #[tokio::test]
    async fn test_dropped_member_is_skipped() {
        let bus = InMemoryBus::new();
        let dropped = bus.queue_subscribe("dev.app.user.*", "g").await.unwrap();
        let mut live = bus.queue_subscribe("dev.app.user.*", "g").await.unwrap();
        drop(dropped);

        bus.publish("dev.app.user.a", b"1".to_vec()).await.unwrap();
        bus.publish("dev.app.user.b", b"2".to_vec()).await.unwrap();

        assert_eq!(live.next().await.unwrap().payload, b"1");
        assert_eq!(live.next().await.unwrap().payload, b"2");
        assert_eq!(bus.subscription_count(), 1);
    }

    #[tokio::test]
    async fn test_request_reply() {
        let bus = std::sync::Arc::new(InMemoryBus::new());
        let mut service = bus.subscribe("svc.echo").await.unwrap();

        let responder = {
            let bus = bus.clone();
            tokio::spawn(async move {
                let message = service.next().await.unwrap();
                let reply_to = message.reply_to.unwrap();
                bus.publish(&reply_to, message.payload).await.unwrap();
            })
        };

        let reply = bus
            .request("svc.echo", b"ping".to_vec(), Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(reply.payload, b"ping");
        responder.await.unwrap();
    }

    #[tokio::test]
    async fn test_request_without_responders() {
        let bus = InMemoryBus::new();
        let result = bus
            .request("svc.none", Vec::new(), Duration::from_millis(50))
            .await;
        assert!(matches!(result, Err(BusError::NoResponders { .. })));
    }

    #[tokio::test]
    async fn test_request_timeout() {
        let bus = InMemoryBus::new();
        let _silent = bus.subscribe("svc.silent").await.unwrap();
        let result = bus
            .request("svc.silent", Vec::new(), Duration::from_millis(50))
            .await;
        assert!(matches!(result, Err(BusError::Timeout { .. })));
    }
}
