//! Topic-addressed publish/subscribe message bus.
//!
//! Stages never call each other directly: every hop of the pipeline is a
//! named topic on a [`MessageBus`]. [`TopicBus`] is the in-process
//! implementation: each subscriber owns a bounded [`tokio::sync::mpsc`]
//! queue and a publish hands the envelope to every live subscriber of the
//! topic.
//!
//! # Delivery
//!
//! | Situation | Behaviour |
//! |---|---|
//! | Topic has subscribers | Every subscriber receives every envelope, in publish order |
//! | Topic has no subscribers | [`RouteError::Transport`] |
//! | A subscriber's queue is full | `publish` waits until it has room; nothing is dropped |
//! | Subscriber stream dropped | It is pruned on the next publish |
//! | Topic closed with [`MessageBus::close_topic`] | Subscriber streams end once drained |

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use async_trait::async_trait;
use futures_util::StreamExt;
use futures_util::stream::{self, BoxStream};
use intermesh_types::{MessageEnvelope, RouteError};
use tokio::sync::mpsc;
use tracing::debug;

/// Default per-subscriber queue capacity. A publisher waits once a
/// subscriber has this many undelivered envelopes.
const DEFAULT_CAPACITY: usize = 1024;

/// Stream of envelopes delivered on one topic.
pub type EnvelopeStream = BoxStream<'static, MessageEnvelope>;

/// Transport seam between stages.
#[async_trait]
pub trait MessageBus: Send + Sync {
    /// Publish `envelope` on `topic`.
    ///
    /// # Errors
    ///
    /// Returns [`RouteError::Transport`] when the envelope could not be
    /// handed to any subscriber.
    async fn publish(&self, topic: &str, envelope: MessageEnvelope) -> Result<(), RouteError>;

    /// Subscribe to `topic`. The subscription is live as soon as this
    /// returns, so envelopes published afterwards are never missed.
    fn subscribe(&self, topic: &str) -> EnvelopeStream;

    /// Tear down `topic`, ending every subscriber stream.
    fn close_topic(&self, topic: &str);
}

type Subscribers = Vec<mpsc::Sender<MessageEnvelope>>;

/// In-process [`MessageBus`]. Clone it cheaply – all clones share the same
/// subscriber tables.
#[derive(Clone, Debug)]
pub struct TopicBus {
    capacity: usize,
    topics: Arc<RwLock<HashMap<String, Subscribers>>>,
}

impl TopicBus {
    /// Create a new bus; `capacity` bounds every subscriber queue
    /// independently.
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            topics: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Number of live subscribers on `topic`.
    pub fn subscriber_count(&self, topic: &str) -> usize {
        self.topics
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(topic)
            .map_or(0, |subscribers| subscribers.iter().filter(|tx| !tx.is_closed()).count())
    }

    /// Live subscribers of `topic`, pruning those whose stream was dropped.
    fn live_subscribers(&self, topic: &str) -> Subscribers {
        let mut topics = self.topics.write().unwrap_or_else(PoisonError::into_inner);
        match topics.get_mut(topic) {
            Some(subscribers) => {
                subscribers.retain(|tx| !tx.is_closed());
                if subscribers.is_empty() {
                    topics.remove(topic);
                    Vec::new()
                } else {
                    subscribers.clone()
                }
            }
            None => Vec::new(),
        }
    }
}

impl Default for TopicBus {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

#[async_trait]
impl MessageBus for TopicBus {
    async fn publish(&self, topic: &str, envelope: MessageEnvelope) -> Result<(), RouteError> {
        let subscribers = self.live_subscribers(topic);
        let mut delivered = 0usize;
        // The table lock is released before awaiting a full queue.
        for tx in &subscribers {
            if tx.send(envelope.clone()).await.is_ok() {
                delivered += 1;
            }
        }
        if delivered == 0 {
            return Err(RouteError::Transport(format!("no subscribers on topic '{topic}'")));
        }
        debug!(topic = %topic, receivers = delivered, "published");
        Ok(())
    }

    fn subscribe(&self, topic: &str) -> EnvelopeStream {
        let (tx, rx) = mpsc::channel(self.capacity);
        self.topics
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(topic.to_string())
            .or_default()
            .push(tx);
        stream::unfold(rx, |mut rx| async move { rx.recv().await.map(|envelope| (envelope, rx)) }).boxed()
    }

    fn close_topic(&self, topic: &str) {
        let removed = self
            .topics
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(topic);
        if removed.is_some() {
            debug!(topic = %topic, "topic closed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use intermesh_types::MessageType;
    use std::time::Duration;

    fn make_envelope(conversation_id: &str) -> MessageEnvelope {
        MessageEnvelope::new([MessageType::Observation], conversation_id)
    }

    #[tokio::test]
    async fn publish_and_receive() -> Result<(), Box<dyn std::error::Error>> {
        let bus = TopicBus::default();
        let mut rx = bus.subscribe("prm_arm");

        let envelope = make_envelope("conv-1");
        bus.publish("prm_arm", envelope.clone()).await?;

        let received = rx.next().await.ok_or("no envelope received")?;
        assert_eq!(received, envelope);
        Ok(())
    }

    #[tokio::test]
    async fn multiple_subscribers_receive_same_envelope() -> Result<(), Box<dyn std::error::Error>> {
        let bus = TopicBus::default();
        let mut rx1 = bus.subscribe("error");
        let mut rx2 = bus.subscribe("error");

        bus.publish("error", make_envelope("conv-2")).await?;

        assert_eq!(rx1.next().await.ok_or("rx1 empty")?.conversation_id, "conv-2");
        assert_eq!(rx2.next().await.ok_or("rx2 empty")?.conversation_id, "conv-2");
        Ok(())
    }

    #[tokio::test]
    async fn publish_without_subscribers_is_a_transport_error() {
        let bus = TopicBus::default();
        let result = bus.publish("nobody_listens", make_envelope("conv-3")).await;
        assert!(matches!(result, Err(RouteError::Transport(_))));
    }

    #[tokio::test]
    async fn subscriber_does_not_receive_other_topics() -> Result<(), Box<dyn std::error::Error>> {
        let bus = TopicBus::default();
        let mut arm = bus.subscribe("prm_arm");
        let _ipsmrm = bus.subscribe("prm_ipsmrm");

        bus.publish("prm_ipsmrm", make_envelope("conv-4")).await?;

        let result = tokio::time::timeout(Duration::from_millis(50), arm.next()).await;
        assert!(result.is_err(), "prm_arm subscriber must not see prm_ipsmrm traffic");
        Ok(())
    }

    #[tokio::test]
    async fn envelopes_arrive_in_publish_order() -> Result<(), Box<dyn std::error::Error>> {
        let bus = TopicBus::default();
        let mut rx = bus.subscribe("ordered");
        for i in 0..20 {
            bus.publish("ordered", make_envelope(&format!("conv-{i}"))).await?;
        }
        for i in 0..20 {
            let env = rx.next().await.ok_or("stream ended early")?;
            assert_eq!(env.conversation_id, format!("conv-{i}"));
        }
        Ok(())
    }

    #[tokio::test]
    async fn full_subscriber_queue_holds_the_publisher_without_dropping() {
        let bus = TopicBus::new(4);
        let mut slow = bus.subscribe("flood");
        let publisher = {
            let bus = bus.clone();
            tokio::spawn(async move {
                for i in 0..50 {
                    bus.publish("flood", make_envelope(&format!("conv-{i}"))).await?;
                }
                Ok::<_, RouteError>(())
            })
        };

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!publisher.is_finished(), "publisher must wait for the slow subscriber");

        for i in 0..50 {
            let env = slow.next().await.expect("stream ended early");
            assert_eq!(env.conversation_id, format!("conv-{i}"));
        }
        publisher.await.expect("publisher task").expect("every publish delivered");
    }

    #[tokio::test]
    async fn dropped_subscriber_is_pruned() {
        let bus = TopicBus::default();
        let gone = bus.subscribe("prm_arm");
        let mut kept = bus.subscribe("prm_arm");
        drop(gone);

        bus.publish("prm_arm", make_envelope("conv-5")).await.unwrap();
        assert_eq!(kept.next().await.unwrap().conversation_id, "conv-5");
        assert_eq!(bus.subscriber_count("prm_arm"), 1);

        drop(kept);
        let result = bus.publish("prm_arm", make_envelope("conv-6")).await;
        assert!(matches!(result, Err(RouteError::Transport(_))));
    }

    #[tokio::test]
    async fn closing_a_topic_ends_its_streams() {
        let bus = TopicBus::default();
        let mut rx = bus.subscribe("bridge_ipsmrm_p1");
        assert_eq!(bus.subscriber_count("bridge_ipsmrm_p1"), 1);

        bus.close_topic("bridge_ipsmrm_p1");

        let next = tokio::time::timeout(Duration::from_secs(1), rx.next())
            .await
            .expect("stream must end promptly");
        assert!(next.is_none());
        assert_eq!(bus.subscriber_count("bridge_ipsmrm_p1"), 0);
    }
}
