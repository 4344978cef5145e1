//! [`PlatformRoutingStage`] – registry bookkeeping, bridge lifecycle and
//! virtual subscriptions.
//!
//! # Downstream (`arm_prm`)
//!
//! | Tags | Action |
//! |---|---|
//! | PLATFORM_REGISTER | bridge created, platform stored, forwarded to `prm_ipsmrm` |
//! | PLATFORM_UPDATE | platform updated in the registry, forwarded |
//! | PLATFORM_CREATE_DEVICE / UPDATE_DEVICE / DELETE_DEVICE | registry mutated, then forwarded |
//! | VIRTUAL_SUBSCRIBE | stored, SUBSCRIBE sent to the source platform |
//! | VIRTUAL_UNSUBSCRIBE | UNSUBSCRIBE sent to the source platform, subscription dropped |
//! | DEVICE_DISCOVERY_QUERY / PLATFORM_DISCOVERY_QUERY | answered from the registry on `prm_arm` |
//! | LIST_SUPPORTED_PLATFORM_TYPES | answered from the bridge table on `prm_arm` |
//! | PLATFORM_UNREGISTER, SUBSCRIBE, UNSUBSCRIBE, OBSERVATION, LIST_DEVICES, ACTUATION, QUERY | forwarded |
//!
//! # Upstream (`ipsmrm_prm`)
//!
//! | Tags | Action |
//! |---|---|
//! | SUBSCRIBE response of a virtual subscription | VIRTUAL_SUBSCRIBE+RESPONSE to `prm_arm` |
//! | UNSUBSCRIBE response of a virtual unsubscribe | VIRTUAL_UNSUBSCRIBE+RESPONSE to `prm_arm` |
//! | OBSERVATION of a virtual subscription | relabeled for the target, sent back downstream |
//! | DEVICE_REGISTRY_INITIALIZE / DEVICE_ADD_OR_UPDATE | devices stored, consumed |
//! | DEVICE_REMOVE | devices removed from the registry |
//! | LIST_DEVICES | consumed |
//! | PLATFORM_UNREGISTER | bridge and platform removed, forwarded |
//! | anything else | `prm_arm` |

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use intermesh_bridge::BridgeManager;
use intermesh_middleware::{ErrorReporter, ListenerGroup, MessageBus, spawn_listener};
use intermesh_registry::Registry;
use intermesh_types::request::{
    DeviceIdsReq, DevicesReq, DiscoveryQueryReq, ObservationPayload, Plat2PlatSubscribeReq, Plat2PlatUnsubscribeReq,
    PlatformReq, PlatformTypesRes, SubscribeReq, UnsubscribeReq, query_result_payload,
};
use intermesh_types::{
    BrokerTopic, EntityKind, ErrorCode, MessageEnvelope, MessageType, Plat2PlatSubscription, Platform, RouteError,
    generate_conversation_id,
};
use tracing::{debug, info, warn};

/// Downstream tags passed to the semantic stage untouched.
const FORWARDED: &[MessageType] = &[
    MessageType::PlatformUnregister,
    MessageType::Subscribe,
    MessageType::Unsubscribe,
    MessageType::Observation,
    MessageType::ListDevices,
    MessageType::Actuation,
    MessageType::Query,
];

pub struct PlatformRoutingStage {
    bus: Arc<dyn MessageBus>,
    registry: Arc<dyn Registry>,
    bridges: Arc<BridgeManager>,
    reporter: ErrorReporter,
    /// Virtual subscriptions keyed by their conversation id.
    virtual_subscriptions: Mutex<HashMap<String, Plat2PlatSubscription>>,
    /// Conversation id of a pending UNSUBSCRIBE → virtual subscription id.
    pending_unsubscribes: Mutex<HashMap<String, String>>,
    listeners: ListenerGroup,
}

impl PlatformRoutingStage {
    pub fn new(bus: Arc<dyn MessageBus>, registry: Arc<dyn Registry>, bridges: Arc<BridgeManager>) -> Self {
        let reporter = ErrorReporter::new(Arc::clone(&bus), "prm");
        Self {
            bus,
            registry,
            bridges,
            reporter,
            virtual_subscriptions: Mutex::new(HashMap::new()),
            pending_unsubscribes: Mutex::new(HashMap::new()),
            listeners: ListenerGroup::new(),
        }
    }

    /// Start consuming `ipsmrm_prm`, restore state from the registry, then
    /// start consuming `arm_prm`.
    ///
    /// Recovery completes before any downstream message is accepted, while
    /// the platforms' answers to the synthetic registrations already have a
    /// listener.
    ///
    /// # Errors
    ///
    /// As [`restore_state`](Self::restore_state); the upstream listener is
    /// left running and the downstream one is not started.
    pub async fn start(self: &Arc<Self>) -> Result<(), RouteError> {
        let upstream = BrokerTopic::IpsmrmPrm.name();
        let stage = Arc::clone(self);
        let handle = spawn_listener(self.bus.as_ref(), upstream, move |envelope| {
            let stage = Arc::clone(&stage);
            async move { stage.handle_upstream(envelope).await }
        });
        self.listeners.stop(upstream);
        self.listeners.insert(upstream, handle);

        self.restore_state().await?;

        let downstream = BrokerTopic::ArmPrm.name();
        let stage = Arc::clone(self);
        let handle = spawn_listener(self.bus.as_ref(), downstream, move |envelope| {
            let stage = Arc::clone(&stage);
            async move { stage.handle_downstream(envelope).await }
        });
        self.listeners.stop(downstream);
        self.listeners.insert(downstream, handle);
        info!(downstream, upstream, "platform routing stage listening");
        Ok(())
    }

    pub fn stop(&self) {
        self.listeners.stop_all();
    }

    pub fn virtual_subscription_count(&self) -> usize {
        self.virtual_subscriptions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn has_virtual_subscription(&self, conversation_id: &str) -> bool {
        self.virtual_subscriptions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(conversation_id)
    }

    pub fn has_pending_unsubscribe(&self, conversation_id: &str) -> bool {
        self.pending_unsubscribes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(conversation_id)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Recovery
    // ─────────────────────────────────────────────────────────────────────────

    /// Rebuild bridges and tables from the registry.
    ///
    /// Every stored platform gets its bridge back and a synthetic
    /// PLATFORM_REGISTER+SYS_INIT is sent downstream so the semantic stage
    /// rebuilds its routing entry. Virtual subscriptions are reloaded without
    /// re-subscribing at the source platform. [`start`](Self::start) runs
    /// it before accepting downstream traffic.
    ///
    /// # Errors
    ///
    /// Only when the registry cannot be listed; a platform that fails to
    /// restore is logged and skipped.
    pub async fn restore_state(&self) -> Result<(), RouteError> {
        let platforms = self.registry.list_platforms().await?;
        if platforms.is_empty() {
            debug!("no platforms to restore");
        }
        for platform in &platforms {
            match self.restore_platform(platform).await {
                Ok(()) => info!(platform_id = %platform.platform_id, "platform restored"),
                Err(e) => warn!(
                    platform_id = %platform.platform_id,
                    error = %e,
                    "failed to restore platform; continuing"
                ),
            }
        }

        let subscriptions = self.registry.list_plat2plat_subscriptions().await?;
        let restored = subscriptions.len();
        {
            let mut table = self
                .virtual_subscriptions
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            for subscription in subscriptions {
                table.insert(subscription.conversation_id.clone(), subscription);
            }
        }
        info!(platforms = platforms.len(), virtual_subscriptions = restored, "platform routing state restored");
        Ok(())
    }

    async fn restore_platform(&self, platform: &Platform) -> Result<(), RouteError> {
        self.bridges.create_bridge(platform)?;
        let envelope = PlatformReq::new(platform.clone())
            .to_envelope(MessageType::PlatformRegister, &generate_conversation_id())
            .with_type(MessageType::SysInit);
        self.publish_downstream(envelope).await
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Downstream
    // ─────────────────────────────────────────────────────────────────────────

    /// Handle one envelope from `arm_prm`; failures are reported on
    /// `prm_arm`, never returned.
    pub async fn handle_downstream(&self, envelope: MessageEnvelope) {
        debug!(
            conversation_id = %envelope.conversation_id,
            message_types = %envelope.describe_types(),
            "downstream message received"
        );
        if let Err(e) = self.route_downstream(&envelope).await {
            self.reporter
                .report_with(
                    &envelope,
                    &e,
                    ErrorCode::ErrorHandlingReceivedMessage,
                    Some("PRM failed to handle downstream message"),
                    Some(BrokerTopic::PrmArm.name()),
                )
                .await;
        }
    }

    async fn route_downstream(&self, envelope: &MessageEnvelope) -> Result<(), RouteError> {
        if envelope.has(MessageType::PlatformRegister) {
            let request = PlatformReq::from_envelope(envelope)?;
            self.register_platform(&request.platform).await?;
            self.publish_downstream(envelope.clone()).await
        } else if envelope.has(MessageType::PlatformUpdate) {
            let request = PlatformReq::from_envelope(envelope)?;
            self.registry.update_platform(&request.platform).await?;
            self.publish_downstream(envelope.clone()).await
        } else if envelope.has(MessageType::PlatformCreateDevice) {
            let devices = DevicesReq::from_envelope(envelope)?.devices;
            self.registry.register_devices(&devices).await?;
            self.publish_downstream(envelope.clone()).await
        } else if envelope.has(MessageType::PlatformUpdateDevice) {
            let devices = DevicesReq::from_envelope(envelope)?.devices;
            self.registry.update_devices(&devices).await?;
            self.publish_downstream(envelope.clone()).await
        } else if envelope.has(MessageType::PlatformDeleteDevice) {
            let device_ids = DeviceIdsReq::from_envelope(envelope)?.device_ids;
            self.registry.remove_devices(&device_ids).await?;
            self.publish_downstream(envelope.clone()).await
        } else if envelope.has(MessageType::VirtualSubscribe) {
            self.subscribe_virtual(Plat2PlatSubscribeReq::from_envelope(envelope)?).await
        } else if envelope.has(MessageType::VirtualUnsubscribe) {
            self.unsubscribe_virtual(Plat2PlatUnsubscribeReq::from_envelope(envelope)?).await
        } else if envelope.has_any(&[MessageType::DeviceDiscoveryQuery, MessageType::PlatformDiscoveryQuery]) {
            let response = self.discovery_query(envelope).await?;
            self.publish_upstream(response).await
        } else if envelope.has(MessageType::ListSupportedPlatformTypes) {
            let body = PlatformTypesRes {
                platform_types: self.bridges.supported_platform_types(),
            };
            debug!(platform_types = ?body.platform_types, "listing supported platform types");
            let response = MessageEnvelope::response_to(envelope).with_payload(serde_json::to_value(body)?);
            self.publish_upstream(response).await
        } else if envelope.has_any(FORWARDED) {
            self.publish_downstream(envelope.clone()).await
        } else {
            Err(envelope.unsupported())
        }
    }

    async fn register_platform(&self, platform: &Platform) -> Result<(), RouteError> {
        let platform_id = &platform.platform_id;
        debug!(platform_id = %platform_id, "creating bridge");
        self.bridges.create_bridge(platform)?;
        if let Err(e) = self.registry.register_platform(platform).await {
            // Keep bridges and registry in step.
            if let Err(cleanup) = self.bridges.remove_bridge(platform_id).await {
                warn!(platform_id = %platform_id, error = %cleanup, "failed to remove bridge after registry error");
            }
            return Err(e.into());
        }
        info!(platform_id = %platform_id, platform_type = %platform.platform_type, "platform registered");
        Ok(())
    }

    async fn subscribe_virtual(&self, request: Plat2PlatSubscribeReq) -> Result<(), RouteError> {
        let conversation_id = request.conversation_id.clone();
        if self.has_virtual_subscription(&conversation_id) {
            return Err(RouteError::already_registered(EntityKind::Subscription, conversation_id));
        }
        let subscription = request.into_subscription();
        self.registry.add_plat2plat_subscription(&subscription).await?;

        let subscribe = SubscribeReq {
            conversation_id: conversation_id.clone(),
            client_id: Some(subscription.client_id.clone()),
            platform_id: subscription.source_platform_id.clone(),
            device_ids: vec![subscription.source_device_id.clone()],
        }
        .to_envelope()
        .with_subscription(conversation_id.clone());

        // Recorded before publishing: the response may come back first.
        let source_platform = subscription.source_platform_id.clone();
        let source_device = subscription.source_device_id.clone();
        self.virtual_subscriptions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(conversation_id.clone(), subscription);

        if let Err(e) = self.publish_downstream(subscribe).await {
            self.forget_virtual_subscription(&conversation_id).await;
            return Err(e);
        }
        info!(
            conversation_id = %conversation_id,
            source_platform = %source_platform,
            source_device = %source_device,
            "virtual subscription requested at source platform"
        );
        Ok(())
    }

    async fn unsubscribe_virtual(&self, request: Plat2PlatUnsubscribeReq) -> Result<(), RouteError> {
        let subscription_id = request.subscription_id;
        let subscription = self
            .registry
            .get_plat2plat_subscription(&subscription_id)
            .await?
            .ok_or_else(|| RouteError::not_registered(EntityKind::Subscription, subscription_id.clone()))?;

        let unsubscribe = UnsubscribeReq {
            conversation_id: request.conversation_id.clone(),
            subscription_id: subscription_id.clone(),
            client_id: request.client_id,
            platform_id: subscription.source_platform_id.clone(),
            device_ids: vec![subscription.source_device_id.clone()],
        }
        .to_envelope();

        self.pending_unsubscribes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(request.conversation_id.clone(), subscription_id.clone());
        if let Err(e) = self.publish_downstream(unsubscribe).await {
            self.pending_unsubscribes
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .remove(&request.conversation_id);
            return Err(e);
        }

        self.forget_virtual_subscription(&subscription_id).await;
        info!(
            conversation_id = %request.conversation_id,
            subscription_id = %subscription_id,
            "virtual subscription cancelled"
        );
        Ok(())
    }

    /// Drop a virtual subscription from the table and the registry.
    async fn forget_virtual_subscription(&self, subscription_id: &str) {
        self.virtual_subscriptions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(subscription_id);
        if let Err(e) = self.registry.delete_plat2plat_subscription(subscription_id).await {
            warn!(subscription_id = %subscription_id, error = %e, "failed to delete virtual subscription from registry");
        }
    }

    async fn discovery_query(&self, envelope: &MessageEnvelope) -> Result<MessageEnvelope, RouteError> {
        let request = DiscoveryQueryReq::from_envelope(envelope)?;
        debug!(query = %request.query, query_type = ?request.query_type, "executing discovery query");
        let result = self.registry.execute_query(&request.query, request.query_type).await?;
        Ok(MessageEnvelope::response_to(envelope).with_payload(query_result_payload(&result)))
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Upstream
    // ─────────────────────────────────────────────────────────────────────────

    /// Handle one envelope from `ipsmrm_prm`.
    pub async fn handle_upstream(&self, envelope: MessageEnvelope) {
        debug!(
            conversation_id = %envelope.conversation_id,
            message_types = %envelope.describe_types(),
            sender = ?envelope.sender_platform_id,
            "upstream message received"
        );
        if let Err(e) = self.route_upstream(envelope.clone()).await {
            self.reporter
                .report_with(
                    &envelope,
                    &e,
                    ErrorCode::ErrorHandlingReceivedMessage,
                    Some("PRM failed to handle upstream message"),
                    Some(BrokerTopic::PrmArm.name()),
                )
                .await;
        }
    }

    async fn route_upstream(&self, envelope: MessageEnvelope) -> Result<(), RouteError> {
        let conversation_id = envelope.conversation_id.clone();

        if envelope.has(MessageType::Subscribe) && self.has_virtual_subscription(&conversation_id) {
            self.virtual_subscribe_response(&envelope).await
        } else if envelope.has(MessageType::Unsubscribe) && self.has_pending_unsubscribe(&conversation_id) {
            self.virtual_unsubscribe_response(&envelope).await
        } else if envelope.has(MessageType::Error) {
            self.publish_upstream(envelope).await
        } else if envelope.has(MessageType::Observation) {
            self.route_observation(envelope).await
        } else if envelope.has_any(&[MessageType::DeviceRegistryInitialize, MessageType::DeviceAddOrUpdate]) {
            let sender = sender_of(&envelope)?;
            let mut devices = DevicesReq::from_envelope(&envelope)?.devices;
            for device in &mut devices {
                device.hosted_by = sender.to_string();
            }
            self.registry.register_devices(&devices).await?;
            debug!(platform_id = %sender, devices = devices.len(), "devices stored from platform");
            Ok(())
        } else if envelope.has(MessageType::DeviceRemove) {
            let device_ids = DeviceIdsReq::from_envelope(&envelope)?.device_ids;
            debug!(device_ids = ?device_ids, "removing devices reported by platform");
            Ok(self.registry.remove_devices(&device_ids).await?)
        } else if envelope.has(MessageType::ListDevices) {
            debug!(conversation_id = %conversation_id, "device list acknowledged");
            Ok(())
        } else if envelope.has(MessageType::PlatformUnregister) {
            let platform_id = sender_of(&envelope)?.to_string();
            self.unregister_platform(&platform_id).await?;
            self.publish_upstream(envelope).await
        } else {
            self.publish_upstream(envelope).await
        }
    }

    async fn virtual_subscribe_response(&self, envelope: &MessageEnvelope) -> Result<(), RouteError> {
        let conversation_id = envelope.conversation_id.clone();
        let client_id = self
            .virtual_subscriptions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&conversation_id)
            .map(|s| s.client_id.clone());

        let mut response = MessageEnvelope::new([MessageType::VirtualSubscribe, MessageType::Response], conversation_id.clone())
            .with_subscription(conversation_id.clone());
        response.client_id = client_id;
        if envelope.has(MessageType::Error) {
            warn!(conversation_id = %conversation_id, "source platform rejected virtual subscription");
            response = response.with_type(MessageType::Error);
            response.error = envelope.error.clone();
            self.forget_virtual_subscription(&conversation_id).await;
        } else {
            debug!(conversation_id = %conversation_id, "virtual subscription confirmed by source platform");
        }
        self.publish_upstream(response).await
    }

    async fn virtual_unsubscribe_response(&self, envelope: &MessageEnvelope) -> Result<(), RouteError> {
        let conversation_id = envelope.conversation_id.clone();
        let Some(subscription_id) = self
            .pending_unsubscribes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&conversation_id)
        else {
            return self.publish_upstream(envelope.clone()).await;
        };

        let mut response = MessageEnvelope::new([MessageType::VirtualUnsubscribe, MessageType::Response], conversation_id)
            .with_subscription(subscription_id);
        response.client_id = envelope.client_id.clone();
        if envelope.has(MessageType::Error) {
            response = response.with_type(MessageType::Error);
            response.error = envelope.error.clone();
        }
        self.publish_upstream(response).await
    }

    /// Relabel an observation of a virtual subscription for its target and
    /// send it back downstream; other observations go to the gateway.
    async fn route_observation(&self, mut envelope: MessageEnvelope) -> Result<(), RouteError> {
        let subscription = self
            .virtual_subscriptions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&envelope.conversation_id)
            .cloned();
        let Some(subscription) = subscription else {
            return self.publish_upstream(envelope).await;
        };

        if envelope.sender_platform_id.as_deref() != Some(subscription.source_platform_id.as_str()) {
            return Err(RouteError::Middleware(format!(
                "unexpected sender platform {:?} for virtual subscription {} (source is {})",
                envelope.sender_platform_id, subscription.conversation_id, subscription.source_platform_id
            )));
        }

        let mut observations = ObservationPayload::from_envelope(&envelope)?;
        observations.relabel_sensor(&subscription.target_device_id);
        observations.write_into(&mut envelope)?;
        envelope.receiver_platform_ids = vec![subscription.target_platform_id.clone()];

        debug!(
            conversation_id = %subscription.conversation_id,
            target_platform = %subscription.target_platform_id,
            target_device = %subscription.target_device_id,
            "observation relabeled for virtual subscription"
        );
        self.publish_downstream(envelope).await
    }

    async fn unregister_platform(&self, platform_id: &str) -> Result<(), RouteError> {
        if let Err(e) = self.bridges.remove_bridge(platform_id).await {
            warn!(platform_id = %platform_id, error = %e, "no bridge to remove");
        }
        self.registry.remove_platform(platform_id).await?;
        info!(platform_id = %platform_id, "platform unregistered");
        Ok(())
    }

    // ─────────────────────────────────────────────────────────────────────────

    async fn publish_downstream(&self, envelope: MessageEnvelope) -> Result<(), RouteError> {
        self.bus.publish(BrokerTopic::PrmIpsmrm.name(), envelope).await
    }

    async fn publish_upstream(&self, envelope: MessageEnvelope) -> Result<(), RouteError> {
        self.bus.publish(BrokerTopic::PrmArm.name(), envelope).await
    }
}

fn sender_of(envelope: &MessageEnvelope) -> Result<&str, RouteError> {
    envelope.sender_platform_id.as_deref().ok_or_else(|| {
        RouteError::Middleware(format!(
            "{} message {} has no sender platform",
            envelope.describe_types(),
            envelope.log_id()
        ))
    })
}
