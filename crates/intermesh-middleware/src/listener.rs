//! Topic listeners.
//!
//! A listener drains one topic and runs a handler for each envelope. The
//! handler for one envelope completes before the next one starts, so
//! envelopes on a topic are handled in publish order; different topics run
//! on independent tasks.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Mutex, PoisonError};

use futures_util::StreamExt;
use intermesh_types::MessageEnvelope;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::bus::MessageBus;

/// Subscribe to `topic` and spawn a task feeding every envelope to
/// `handler`.
///
/// The subscription is established before this function returns.
pub fn spawn_listener<F, Fut>(bus: &dyn MessageBus, topic: &str, handler: F) -> JoinHandle<()>
where
    F: Fn(MessageEnvelope) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    let mut stream = bus.subscribe(topic);
    let topic = topic.to_string();
    tokio::spawn(async move {
        debug!(topic = %topic, "listener started");
        while let Some(envelope) = stream.next().await {
            handler(envelope).await;
        }
        debug!(topic = %topic, "listener stopped");
    })
}

/// Listener tasks grouped under a key (usually a platform id) so they can
/// be stopped together.
#[derive(Default)]
pub struct ListenerGroup {
    handles: Mutex<HashMap<String, Vec<JoinHandle<()>>>>,
}

impl ListenerGroup {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, key: &str, handle: JoinHandle<()>) {
        self.handles
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(key.to_string())
            .or_default()
            .push(handle);
    }

    /// Abort every listener registered under `key`. Returns how many were
    /// stopped.
    pub fn stop(&self, key: &str) -> usize {
        let removed = self
            .handles
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(key)
            .unwrap_or_default();
        for handle in &removed {
            handle.abort();
        }
        removed.len()
    }

    pub fn stop_all(&self) {
        let all: Vec<_> = self
            .handles
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain()
            .collect();
        for handle in all.iter().flat_map(|(_, handles)| handles) {
            handle.abort();
        }
    }

    pub fn contains(&self, key: &str) -> bool {
        self.handles
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::TopicBus;
    use intermesh_types::MessageType;
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::sync::mpsc;

    #[tokio::test]
    async fn listener_sees_envelopes_published_right_after_spawn() {
        let bus = TopicBus::default();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let _handle = spawn_listener(&bus, "arm_prm", move |env| {
            let tx = tx.clone();
            async move {
                let _ = tx.send(env.conversation_id);
            }
        });

        bus.publish("arm_prm", MessageEnvelope::new([MessageType::Query], "conv-1"))
            .await
            .expect("listener is subscribed");

        let got = tokio::time::timeout(Duration::from_secs(1), rx.recv()).await.unwrap();
        assert_eq!(got.as_deref(), Some("conv-1"));
    }

    #[tokio::test]
    async fn handlers_run_one_at_a_time_in_order() {
        let bus = TopicBus::default();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_in_handler = Arc::clone(&seen);
        let _handle = spawn_listener(&bus, "ordered", move |env| {
            let seen = Arc::clone(&seen_in_handler);
            async move {
                // The first handler sleeps longest; order must still hold.
                let delay = if env.conversation_id == "c0" { 30 } else { 1 };
                tokio::time::sleep(Duration::from_millis(delay)).await;
                seen.lock().unwrap().push(env.conversation_id);
            }
        });

        for i in 0..3 {
            bus.publish("ordered", MessageEnvelope::new([MessageType::Observation], format!("c{i}")))
                .await
                .unwrap();
        }
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(*seen.lock().unwrap(), vec!["c0", "c1", "c2"]);
    }

    #[tokio::test]
    async fn stopping_a_group_aborts_its_listeners() {
        let bus = TopicBus::default();
        let group = ListenerGroup::new();
        group.insert("p1", spawn_listener(&bus, "t1", |_| async {}));
        group.insert("p1", spawn_listener(&bus, "t2", |_| async {}));
        group.insert("p2", spawn_listener(&bus, "t3", |_| async {}));

        assert_eq!(group.stop("p1"), 2);
        assert!(!group.contains("p1"));
        assert!(group.contains("p2"));
        assert_eq!(group.stop("unknown"), 0);
        group.stop_all();
        assert!(!group.contains("p2"));
    }
}
