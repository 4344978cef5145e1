//! [`BridgeManager`] – one running controller per registered platform.
//!
//! Creating a bridge builds the adapter from the [`BridgeFactoryTable`],
//! wraps it in a [`BridgeController`] and subscribes the controller to
//! `ipsmrm_bridge_<platform id>`. Removing it aborts the listener and lets
//! the adapter stop its background work.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use intermesh_middleware::{ErrorReporter, MessageBus, spawn_listener};
use intermesh_types::{BrokerTopic, EntityKind, Platform, RouteError};
use tokio::task::JoinHandle;
use tracing::info;

use crate::adapter::{BridgeContext, BridgePublisher};
use crate::controller::BridgeController;
use crate::factory::BridgeFactoryTable;

struct RunningBridge {
    controller: Arc<BridgeController>,
    listener: JoinHandle<()>,
}

pub struct BridgeManager {
    bus: Arc<dyn MessageBus>,
    factories: BridgeFactoryTable,
    bridges: Mutex<HashMap<String, RunningBridge>>,
}

impl BridgeManager {
    pub fn new(bus: Arc<dyn MessageBus>, factories: BridgeFactoryTable) -> Self {
        Self {
            bus,
            factories,
            bridges: Mutex::new(HashMap::new()),
        }
    }

    /// Build and start the bridge for `platform`.
    ///
    /// # Errors
    ///
    /// - [`RouteError::AlreadyRegistered`] when a bridge already runs for the
    ///   platform.
    /// - [`RouteError::Middleware`] when the platform type has no factory or
    ///   the factory fails.
    pub fn create_bridge(&self, platform: &Platform) -> Result<(), RouteError> {
        let platform_id = platform.platform_id.as_str();
        let mut bridges = self.bridges.lock().unwrap_or_else(PoisonError::into_inner);
        if bridges.contains_key(platform_id) {
            return Err(RouteError::already_registered(EntityKind::Bridge, platform_id));
        }

        let factory = self.factories.get(&platform.platform_type).ok_or_else(|| {
            RouteError::Middleware(format!(
                "no bridge available for platform type '{}'",
                platform.platform_type
            ))
        })?;
        let publisher = BridgePublisher::new(Arc::clone(&self.bus), platform_id);
        let adapter = factory(BridgeContext {
            configuration: self.factories.configuration(&platform.platform_type),
            platform: platform.clone(),
            publisher: publisher.clone(),
        })
        .map_err(|e| RouteError::Middleware(format!("failed to create bridge for platform {platform_id}: {e}")))?;

        let reporter = ErrorReporter::new(Arc::clone(&self.bus), "bridge");
        let controller = Arc::new(BridgeController::new(adapter, publisher, reporter));
        let for_listener = Arc::clone(&controller);
        let listener = spawn_listener(
            self.bus.as_ref(),
            &BrokerTopic::IpsmrmBridge.for_platform(platform_id),
            move |msg| {
                let controller = Arc::clone(&for_listener);
                async move { controller.process(msg).await }
            },
        );
        bridges.insert(platform_id.to_string(), RunningBridge { controller, listener });
        info!(platform_id = %platform_id, platform_type = %platform.platform_type, "bridge created");
        Ok(())
    }

    /// Stop and forget the bridge for `platform_id`.
    ///
    /// # Errors
    ///
    /// [`RouteError::NotRegistered`] when no bridge runs for the platform.
    pub async fn remove_bridge(&self, platform_id: &str) -> Result<(), RouteError> {
        let running = self
            .bridges
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(platform_id)
            .ok_or_else(|| RouteError::not_registered(EntityKind::Bridge, platform_id))?;
        running.listener.abort();
        running.controller.shutdown().await;
        info!(platform_id = %platform_id, "bridge removed");
        Ok(())
    }

    pub async fn stop_all(&self) {
        let all: Vec<(String, RunningBridge)> = self
            .bridges
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain()
            .collect();
        for (platform_id, running) in all {
            running.listener.abort();
            running.controller.shutdown().await;
            info!(platform_id = %platform_id, "bridge stopped");
        }
    }

    pub fn has_bridge(&self, platform_id: &str) -> bool {
        self.bridges
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(platform_id)
    }

    pub fn supported_platform_types(&self) -> Vec<String> {
        self.factories.supported_platform_types()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_bridge::TestBridge;
    use futures_util::StreamExt;
    use intermesh_middleware::TopicBus;
    use intermesh_types::{MessageType, request::PlatformReq};
    use std::time::Duration;

    fn test_platform(id: &str) -> Platform {
        Platform::new(id, TestBridge::PLATFORM_TYPE, "http://localhost:4568")
    }

    #[tokio::test]
    async fn created_bridge_answers_on_its_topics() {
        let bus = Arc::new(TopicBus::default());
        let manager = BridgeManager::new(bus.clone(), BridgeFactoryTable::with_defaults());
        let platform = test_platform("http://p1");
        let mut upstream = bus.subscribe(&BrokerTopic::BridgeIpsmrm.for_platform("http://p1"));

        manager.create_bridge(&platform).unwrap();
        assert!(manager.has_bridge("http://p1"));

        let register = PlatformReq::new(platform).to_envelope(MessageType::PlatformRegister, "conv-r");
        bus.publish(&BrokerTopic::IpsmrmBridge.for_platform("http://p1"), register)
            .await
            .unwrap();

        let response = tokio::time::timeout(Duration::from_secs(1), upstream.next()).await.unwrap().unwrap();
        assert_eq!(response.conversation_id, "conv-r");
        assert!(response.has(MessageType::Response));
    }

    #[tokio::test]
    async fn duplicate_bridge_is_already_registered() {
        let bus = Arc::new(TopicBus::default());
        let manager = BridgeManager::new(bus, BridgeFactoryTable::with_defaults());
        manager.create_bridge(&test_platform("http://p1")).unwrap();
        let err = manager.create_bridge(&test_platform("http://p1")).unwrap_err();
        assert!(matches!(err, RouteError::AlreadyRegistered { kind: EntityKind::Bridge, .. }));
    }

    #[tokio::test]
    async fn unknown_platform_type_is_a_middleware_error() {
        let bus = Arc::new(TopicBus::default());
        let manager = BridgeManager::new(bus, BridgeFactoryTable::with_defaults());
        let platform = Platform::new("http://p9", "http://inter-iot.eu/Unknown", "http://localhost");
        assert!(matches!(manager.create_bridge(&platform), Err(RouteError::Middleware(_))));
        assert!(!manager.has_bridge("http://p9"));
    }

    #[tokio::test]
    async fn removed_bridge_stops_listening() {
        let bus = Arc::new(TopicBus::default());
        let manager = BridgeManager::new(bus.clone(), BridgeFactoryTable::with_defaults());
        manager.create_bridge(&test_platform("http://p1")).unwrap();

        manager.remove_bridge("http://p1").await.unwrap();
        assert!(!manager.has_bridge("http://p1"));
        assert!(matches!(
            manager.remove_bridge("http://p1").await,
            Err(RouteError::NotRegistered { .. })
        ));

        tokio::time::sleep(Duration::from_millis(20)).await;
        let topic = BrokerTopic::IpsmrmBridge.for_platform("http://p1");
        assert_eq!(bus.subscriber_count(&topic), 0);
    }
}
