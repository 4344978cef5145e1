//! [`SemanticRoutingStage`] – decides whether a message detours through
//! translation on its way to or from a bridge.
//!
//! # Downstream (`prm_ipsmrm`)
//!
//! | Tags | Destination |
//! |---|---|
//! | PLATFORM_REGISTER / PLATFORM_UPDATE | routing table updated, then `ipsmrm_bridge_<pid>` |
//! | PLATFORM_UNREGISTER, SUBSCRIBE, UNSUBSCRIBE, LIST_DEVICES, QUERY, discovery queries, ERROR, UNRECOGNIZED | `ipsmrm_bridge_<pid>` |
//! | device and data-plane tags | `mw-ipsm-downstream-<pid>` when downstream translation is on, else `ipsmrm_bridge_<pid>` |
//!
//! # Upstream (`bridge_ipsmrm_<pid>`)
//!
//! | Tags | Destination |
//! |---|---|
//! | ERROR | `ipsmrm_prm` |
//! | OBSERVATION, QUERY, DEVICE_REGISTRY_INITIALIZE, DEVICE_ADD_OR_UPDATE | `mw-ipsm-upstream-<pid>` when upstream translation is on, else `ipsmrm_prm` |
//! | PLATFORM_UNREGISTER | `ipsmrm_prm`, then the platform's routing entry, channels and listeners are torn down |
//! | anything else | `ipsmrm_prm` |
//!
//! Translated messages returning on `ipsm-mw-downstream-<pid>` go to the
//! bridge; those on `ipsm-mw-upstream-<pid>` go to `ipsmrm_prm`.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use intermesh_middleware::{ErrorReporter, ListenerGroup, MessageBus, spawn_listener};
use intermesh_types::request::PlatformReq;
use intermesh_types::topic::{
    from_translation_downstream, from_translation_upstream, to_translation_downstream, to_translation_upstream,
};
use intermesh_types::{BrokerTopic, ErrorCode, IpsmRoutingInfo, MessageEnvelope, MessageType, Platform, RouteError};
use tracing::{debug, info};

use crate::translation::TranslationService;

/// Tags that never detour through translation.
const CONTROL_PLANE: &[MessageType] = &[
    MessageType::PlatformUnregister,
    MessageType::Subscribe,
    MessageType::Unsubscribe,
    MessageType::ListDevices,
    MessageType::DeviceDiscoveryQuery,
    MessageType::PlatformDiscoveryQuery,
    MessageType::Query,
    MessageType::Error,
    MessageType::Unrecognized,
];

/// Tags routed through downstream translation when it is enabled.
const DATA_PLANE: &[MessageType] = &[
    MessageType::DeviceAddOrUpdate,
    MessageType::DeviceRemove,
    MessageType::DeviceRegistryInitialize,
    MessageType::PlatformCreateDevice,
    MessageType::PlatformUpdateDevice,
    MessageType::PlatformDeleteDevice,
    MessageType::Observation,
    MessageType::Actuation,
];

/// Upstream tags routed through upstream translation when it is enabled.
const UPSTREAM_TRANSLATED: &[MessageType] = &[
    MessageType::Observation,
    MessageType::Query,
    MessageType::DeviceRegistryInitialize,
    MessageType::DeviceAddOrUpdate,
];

pub struct SemanticRoutingStage {
    bus: Arc<dyn MessageBus>,
    translation: Arc<dyn TranslationService>,
    reporter: ErrorReporter,
    routing: RwLock<HashMap<String, IpsmRoutingInfo>>,
    /// Keyed by platform id.
    listeners: ListenerGroup,
    /// The stage's own `prm_ipsmrm` listener.
    inbound: ListenerGroup,
}

impl SemanticRoutingStage {
    pub fn new(bus: Arc<dyn MessageBus>, translation: Arc<dyn TranslationService>) -> Self {
        let reporter = ErrorReporter::new(Arc::clone(&bus), "ipsmrm");
        Self {
            bus,
            translation,
            reporter,
            routing: RwLock::new(HashMap::new()),
            listeners: ListenerGroup::new(),
            inbound: ListenerGroup::new(),
        }
    }

    /// Start consuming `prm_ipsmrm`.
    pub fn start(self: &Arc<Self>) {
        let topic = BrokerTopic::PrmIpsmrm.name();
        let stage = Arc::clone(self);
        let handle = spawn_listener(self.bus.as_ref(), topic, move |envelope| {
            let stage = Arc::clone(&stage);
            async move { stage.handle_downstream(envelope).await }
        });
        self.inbound.stop(topic);
        self.inbound.insert(topic, handle);
        info!(topic, "semantic routing stage listening");
    }

    /// Stop every listener the stage owns.
    pub fn stop(&self) {
        self.inbound.stop_all();
        self.listeners.stop_all();
    }

    /// Translation flags for `platform_id`, if it is registered.
    pub fn routing_info(&self, platform_id: &str) -> Option<IpsmRoutingInfo> {
        self.routing
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(platform_id)
            .copied()
    }

    pub fn platform_count(&self) -> usize {
        self.routing.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Downstream
    // ─────────────────────────────────────────────────────────────────────────

    /// Handle one envelope from `prm_ipsmrm`; failures are reported, never
    /// returned.
    pub async fn handle_downstream(self: &Arc<Self>, envelope: MessageEnvelope) {
        debug!(
            conversation_id = %envelope.conversation_id,
            message_types = %envelope.describe_types(),
            "downstream message received"
        );
        if let Err(e) = self.route_downstream(&envelope).await {
            self.reporter
                .report(&envelope, &e, ErrorCode::ErrorHandlingReceivedMessage, Some(BrokerTopic::PrmArm.name()))
                .await;
        }
    }

    async fn route_downstream(self: &Arc<Self>, envelope: &MessageEnvelope) -> Result<(), RouteError> {
        let platform_id = envelope
            .first_receiver()
            .ok_or_else(|| RouteError::Middleware(format!("message {} has no receiving platform", envelope.log_id())))?
            .to_string();

        if envelope.has(MessageType::PlatformRegister) {
            let request = PlatformReq::from_envelope(envelope)?;
            self.register_platform(&request.platform).await?;
            self.publish_to_bridge(envelope.clone(), &platform_id).await
        } else if envelope.has(MessageType::PlatformUpdate) {
            let request = PlatformReq::from_envelope(envelope)?;
            self.update_platform(&request.platform).await?;
            self.publish_to_bridge(envelope.clone(), &platform_id).await
        } else if envelope.has_any(CONTROL_PLANE) {
            self.publish_to_bridge(envelope.clone(), &platform_id).await
        } else if envelope.has_any(DATA_PLANE) {
            self.publish_downstream_data(envelope.clone(), &platform_id).await
        } else {
            Err(envelope.unsupported())
        }
    }

    async fn publish_downstream_data(&self, envelope: MessageEnvelope, platform_id: &str) -> Result<(), RouteError> {
        let info = self.routing_info(platform_id).ok_or_else(|| {
            RouteError::Middleware(format!("no semantic routing information for platform '{platform_id}'"))
        })?;
        if info.use_downstream_translation {
            let topic = to_translation_downstream(platform_id);
            debug!(platform_id = %platform_id, topic = %topic, "publishing to downstream translation");
            self.bus.publish(&topic, envelope).await
        } else {
            self.publish_to_bridge(envelope, platform_id).await
        }
    }

    async fn publish_to_bridge(&self, envelope: MessageEnvelope, platform_id: &str) -> Result<(), RouteError> {
        let topic = BrokerTopic::IpsmrmBridge.for_platform(platform_id);
        debug!(platform_id = %platform_id, topic = %topic, "publishing to bridge");
        self.bus.publish(&topic, envelope).await
    }

    async fn register_platform(self: &Arc<Self>, platform: &Platform) -> Result<(), RouteError> {
        let platform_id = &platform.platform_id;
        let info = if platform.has_any_alignment() {
            self.translation.setup_channels_for_platform(platform).await?;
            IpsmRoutingInfo::for_platform(platform)
        } else {
            IpsmRoutingInfo::default()
        };

        // A re-registration after restart replaces whatever was left behind.
        self.stop_platform_listeners(platform_id);
        self.routing
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(platform_id.clone(), info);

        let stage = Arc::clone(self);
        let pid = platform_id.clone();
        let handle = spawn_listener(
            self.bus.as_ref(),
            &BrokerTopic::BridgeIpsmrm.for_platform(platform_id),
            move |envelope| {
                let stage = Arc::clone(&stage);
                let pid = pid.clone();
                async move { stage.handle_upstream(envelope, &pid).await }
            },
        );
        self.listeners.insert(platform_id, handle);
        self.listen_for_translations(platform_id, info);

        info!(
            platform_id = %platform_id,
            downstream_translation = info.use_downstream_translation,
            upstream_translation = info.use_upstream_translation,
            "platform routing registered"
        );
        Ok(())
    }

    async fn update_platform(&self, platform: &Platform) -> Result<(), RouteError> {
        if !platform.has_any_alignment() {
            debug!(platform_id = %platform.platform_id, "update declares no alignments; routing unchanged");
            return Ok(());
        }
        self.translation.setup_channels_for_platform(platform).await?;

        let info = IpsmRoutingInfo::for_platform(platform);
        let previous = self
            .routing
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(platform.platform_id.clone(), info);
        let previous = previous.unwrap_or_default();

        let key_down = translation_key(&platform.platform_id, Direction::Downstream);
        let key_up = translation_key(&platform.platform_id, Direction::Upstream);
        if previous.use_downstream_translation && !info.use_downstream_translation {
            self.listeners.stop(&key_down);
        }
        if previous.use_upstream_translation && !info.use_upstream_translation {
            self.listeners.stop(&key_up);
        }
        let added = IpsmRoutingInfo {
            use_downstream_translation: info.use_downstream_translation && !self.listeners.contains(&key_down),
            use_upstream_translation: info.use_upstream_translation && !self.listeners.contains(&key_up),
        };
        self.listen_for_translations(&platform.platform_id, added);
        info!(platform_id = %platform.platform_id, "platform routing updated");
        Ok(())
    }

    /// Forward translated messages returning from the translation service.
    fn listen_for_translations(&self, platform_id: &str, info: IpsmRoutingInfo) {
        if info.use_downstream_translation {
            let bus = Arc::clone(&self.bus);
            let reporter = self.reporter.clone();
            let bridge_topic = BrokerTopic::IpsmrmBridge.for_platform(platform_id);
            let handle = spawn_listener(self.bus.as_ref(), &from_translation_downstream(platform_id), move |envelope| {
                forward(Arc::clone(&bus), reporter.clone(), bridge_topic.clone(), envelope)
            });
            self.listeners
                .insert(&translation_key(platform_id, Direction::Downstream), handle);
        }
        if info.use_upstream_translation {
            let bus = Arc::clone(&self.bus);
            let reporter = self.reporter.clone();
            let handle = spawn_listener(self.bus.as_ref(), &from_translation_upstream(platform_id), move |envelope| {
                forward(Arc::clone(&bus), reporter.clone(), BrokerTopic::IpsmrmPrm.name().to_string(), envelope)
            });
            self.listeners
                .insert(&translation_key(platform_id, Direction::Upstream), handle);
        }
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Upstream
    // ─────────────────────────────────────────────────────────────────────────

    /// Handle one envelope from `bridge_ipsmrm_<platform_id>`.
    pub async fn handle_upstream(&self, envelope: MessageEnvelope, platform_id: &str) {
        debug!(
            platform_id = %platform_id,
            conversation_id = %envelope.conversation_id,
            message_types = %envelope.describe_types(),
            "upstream message received"
        );
        if let Err(e) = self.route_upstream(&envelope, platform_id).await {
            self.reporter
                .report(&envelope, &e, ErrorCode::ErrorHandlingReceivedMessage, Some(BrokerTopic::PrmArm.name()))
                .await;
        }
    }

    async fn route_upstream(&self, envelope: &MessageEnvelope, platform_id: &str) -> Result<(), RouteError> {
        let upstream = BrokerTopic::IpsmrmPrm.name();
        if envelope.message_types.is_empty() {
            return Err(envelope.unsupported());
        }

        if envelope.has(MessageType::Error) {
            self.bus.publish(upstream, envelope.clone()).await
        } else if envelope.has_any(UPSTREAM_TRANSLATED) {
            let info = self.routing_info(platform_id).ok_or_else(|| {
                RouteError::Middleware(format!("no semantic routing information for platform '{platform_id}'"))
            })?;
            if info.use_upstream_translation {
                let topic = to_translation_upstream(platform_id);
                debug!(platform_id = %platform_id, topic = %topic, "publishing to upstream translation");
                self.bus.publish(&topic, envelope.clone()).await
            } else {
                self.bus.publish(upstream, envelope.clone()).await
            }
        } else if envelope.has(MessageType::PlatformUnregister) {
            let forwarded = self.bus.publish(upstream, envelope.clone()).await;
            self.unregister_platform(platform_id).await?;
            forwarded
        } else {
            self.bus.publish(upstream, envelope.clone()).await
        }
    }

    /// Drop the routing entry, translation channels and listeners of
    /// `platform_id`. Listeners go last: this may run on one of them.
    async fn unregister_platform(&self, platform_id: &str) -> Result<(), RouteError> {
        let removed = self
            .routing
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(platform_id);
        let channels = match removed {
            Some(info) if info.use_downstream_translation || info.use_upstream_translation => {
                self.translation.remove_channels_for_platform(platform_id).await.map_err(RouteError::from)
            }
            _ => Ok(()),
        };
        info!(platform_id = %platform_id, "platform routing removed");

        self.stop_platform_listeners(platform_id);
        channels
    }

    fn stop_platform_listeners(&self, platform_id: &str) {
        self.listeners
            .stop(&translation_key(platform_id, Direction::Downstream));
        self.listeners
            .stop(&translation_key(platform_id, Direction::Upstream));
        self.listeners.stop(platform_id);
    }
}

#[derive(Clone, Copy)]
enum Direction {
    Downstream,
    Upstream,
}

fn translation_key(platform_id: &str, direction: Direction) -> String {
    match direction {
        Direction::Downstream => from_translation_downstream(platform_id),
        Direction::Upstream => from_translation_upstream(platform_id),
    }
}

async fn forward(bus: Arc<dyn MessageBus>, reporter: ErrorReporter, topic: String, envelope: MessageEnvelope) {
    debug!(topic = %topic, conversation_id = %envelope.conversation_id, "forwarding translated message");
    if let Err(e) = bus.publish(&topic, envelope.clone()).await {
        reporter
            .report(&envelope, &e, ErrorCode::ErrorHandlingReceivedMessage, Some(BrokerTopic::PrmArm.name()))
            .await;
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::translation::{NoopTranslation, TranslationError};
    use async_trait::async_trait;
    use futures_util::StreamExt;
    use intermesh_middleware::{EnvelopeStream, TopicBus};
    use intermesh_types::Alignment;
    use intermesh_types::request::unregister_platform_envelope;
    use std::sync::Mutex;
    use std::time::Duration;

    const P1: &str = "http://test.inter-iot.eu/p1";

    /// Records every call; optionally fails setup.
    #[derive(Default)]
    struct RecordingTranslation {
        calls: Mutex<Vec<String>>,
        fail_setup: bool,
    }

    #[async_trait]
    impl TranslationService for RecordingTranslation {
        async fn setup_channels_for_platform(&self, platform: &Platform) -> Result<(), TranslationError> {
            self.calls.lock().unwrap().push(format!("setup {}", platform.platform_id));
            if self.fail_setup {
                return Err(TranslationError::Status { status: 503, body: "down".into() });
            }
            Ok(())
        }

        async fn remove_channels_for_platform(&self, platform_id: &str) -> Result<(), TranslationError> {
            self.calls.lock().unwrap().push(format!("remove {platform_id}"));
            Ok(())
        }
    }

    fn aligned_platform() -> Platform {
        let mut platform = Platform::new(P1, "http://inter-iot.eu/MWTestPlatform", "http://endpoint");
        platform.downstream_input_alignment = Some(Alignment::new("Down", "1.0"));
        platform.upstream_output_alignment = Some(Alignment::new("Up", "1.0"));
        platform
    }

    fn register(platform: &Platform) -> MessageEnvelope {
        PlatformReq::new(platform.clone()).to_envelope(MessageType::PlatformRegister, "conv-reg")
    }

    async fn next(stream: &mut EnvelopeStream) -> MessageEnvelope {
        tokio::time::timeout(Duration::from_secs(2), stream.next())
            .await
            .expect("timed out waiting for envelope")
            .expect("stream ended")
    }

    async fn nothing(stream: &mut EnvelopeStream) -> bool {
        tokio::time::timeout(Duration::from_millis(50), stream.next()).await.is_err()
    }

    fn stage_with(bus: &Arc<TopicBus>, translation: Arc<dyn TranslationService>) -> Arc<SemanticRoutingStage> {
        Arc::new(SemanticRoutingStage::new(bus.clone(), translation))
    }

    #[tokio::test]
    async fn platform_without_alignments_disables_translation() {
        let bus = Arc::new(TopicBus::default());
        let translation = Arc::new(RecordingTranslation::default());
        let stage = stage_with(&bus, translation.clone());
        let mut bridge = bus.subscribe(&BrokerTopic::IpsmrmBridge.for_platform(P1));

        let platform = Platform::new(P1, "type", "http://endpoint");
        stage.handle_downstream(register(&platform)).await;

        assert!(next(&mut bridge).await.has(MessageType::PlatformRegister));
        assert_eq!(stage.routing_info(P1), Some(IpsmRoutingInfo::default()));
        assert!(translation.calls.lock().unwrap().is_empty(), "no channels requested");
    }

    #[tokio::test]
    async fn data_plane_detours_through_translation_when_enabled() {
        let bus = Arc::new(TopicBus::default());
        let stage = stage_with(&bus, Arc::new(RecordingTranslation::default()));
        let mut bridge = bus.subscribe(&BrokerTopic::IpsmrmBridge.for_platform(P1));
        let mut to_ipsm = bus.subscribe(&to_translation_downstream(P1));

        stage.handle_downstream(register(&aligned_platform())).await;
        next(&mut bridge).await;
        assert_eq!(
            stage.routing_info(P1),
            Some(IpsmRoutingInfo { use_downstream_translation: true, use_upstream_translation: true })
        );

        let actuation = MessageEnvelope::new([MessageType::Actuation], "conv-act").with_receiver(P1);
        stage.handle_downstream(actuation).await;
        assert_eq!(next(&mut to_ipsm).await.conversation_id, "conv-act");

        let subscribe = MessageEnvelope::new([MessageType::Subscribe], "conv-sub").with_receiver(P1);
        stage.handle_downstream(subscribe).await;
        assert_eq!(next(&mut bridge).await.conversation_id, "conv-sub", "control plane bypasses translation");
    }

    #[tokio::test]
    async fn translated_messages_are_forwarded_to_their_destination() {
        let bus = Arc::new(TopicBus::default());
        let stage = stage_with(&bus, Arc::new(RecordingTranslation::default()));
        let mut bridge = bus.subscribe(&BrokerTopic::IpsmrmBridge.for_platform(P1));
        let mut upstream = bus.subscribe(BrokerTopic::IpsmrmPrm.name());

        stage.handle_downstream(register(&aligned_platform())).await;
        next(&mut bridge).await;

        bus.publish(&from_translation_downstream(P1), MessageEnvelope::new([MessageType::Actuation], "conv-d"))
            .await
            .unwrap();
        assert_eq!(next(&mut bridge).await.conversation_id, "conv-d");

        bus.publish(&from_translation_upstream(P1), MessageEnvelope::new([MessageType::Observation], "conv-u"))
            .await
            .unwrap();
        assert_eq!(next(&mut upstream).await.conversation_id, "conv-u");
    }

    #[tokio::test]
    async fn data_plane_falls_through_to_bridge_without_translation() {
        let bus = Arc::new(TopicBus::default());
        let stage = stage_with(&bus, Arc::new(NoopTranslation));
        let mut bridge = bus.subscribe(&BrokerTopic::IpsmrmBridge.for_platform(P1));

        stage.handle_downstream(register(&Platform::new(P1, "type", "e"))).await;
        next(&mut bridge).await;

        let create = MessageEnvelope::new([MessageType::PlatformCreateDevice], "conv-c").with_receiver(P1);
        stage.handle_downstream(create).await;
        assert_eq!(next(&mut bridge).await.conversation_id, "conv-c");
    }

    #[tokio::test]
    async fn unsupported_downstream_tags_are_reported_not_forwarded() {
        let bus = Arc::new(TopicBus::default());
        let stage = stage_with(&bus, Arc::new(NoopTranslation));
        let mut bridge = bus.subscribe(&BrokerTopic::IpsmrmBridge.for_platform(P1));
        let _arm = bus.subscribe(BrokerTopic::PrmArm.name());
        let mut errors = bus.subscribe(BrokerTopic::Error.name());

        let odd = MessageEnvelope::new([MessageType::ListSupportedPlatformTypes], "conv-odd").with_receiver(P1);
        stage.handle_downstream(odd).await;

        let report = next(&mut errors).await;
        assert_eq!(report.conversation_id, "conv-odd");
        assert!(report.error.unwrap().description.contains("unsupported message type"));
        assert!(nothing(&mut bridge).await);
    }

    #[tokio::test]
    async fn translation_failure_blocks_registration() {
        let bus = Arc::new(TopicBus::default());
        let translation = Arc::new(RecordingTranslation { fail_setup: true, ..Default::default() });
        let stage = stage_with(&bus, translation);
        let mut bridge = bus.subscribe(&BrokerTopic::IpsmrmBridge.for_platform(P1));
        let mut arm = bus.subscribe(BrokerTopic::PrmArm.name());

        stage.handle_downstream(register(&aligned_platform())).await;

        let error = next(&mut arm).await;
        assert!(error.has(MessageType::Error) && error.has(MessageType::PlatformRegister));
        assert!(stage.routing_info(P1).is_none());
        assert!(nothing(&mut bridge).await);
    }

    #[tokio::test]
    async fn upstream_observation_uses_translation_flag() {
        let bus = Arc::new(TopicBus::default());
        let stage = stage_with(&bus, Arc::new(RecordingTranslation::default()));
        let mut bridge = bus.subscribe(&BrokerTopic::IpsmrmBridge.for_platform(P1));
        let mut to_ipsm_up = bus.subscribe(&to_translation_upstream(P1));
        let mut upstream = bus.subscribe(BrokerTopic::IpsmrmPrm.name());

        stage.handle_downstream(register(&aligned_platform())).await;
        next(&mut bridge).await;

        let obs = MessageEnvelope::new([MessageType::Observation], "conv-o").with_sender(P1);
        bus.publish(&BrokerTopic::BridgeIpsmrm.for_platform(P1), obs).await.unwrap();
        assert_eq!(next(&mut to_ipsm_up).await.conversation_id, "conv-o");

        let response = MessageEnvelope::new([MessageType::Subscribe, MessageType::Response], "conv-s").with_sender(P1);
        bus.publish(&BrokerTopic::BridgeIpsmrm.for_platform(P1), response).await.unwrap();
        assert_eq!(next(&mut upstream).await.conversation_id, "conv-s");
    }

    #[tokio::test]
    async fn upstream_unregister_forwards_then_tears_down() {
        let bus = Arc::new(TopicBus::default());
        let translation = Arc::new(RecordingTranslation::default());
        let stage = stage_with(&bus, translation.clone());
        let mut bridge = bus.subscribe(&BrokerTopic::IpsmrmBridge.for_platform(P1));
        let mut upstream = bus.subscribe(BrokerTopic::IpsmrmPrm.name());

        stage.handle_downstream(register(&aligned_platform())).await;
        next(&mut bridge).await;

        let response = MessageEnvelope::response_to(&unregister_platform_envelope("conv-un", P1)).with_sender(P1);
        stage.handle_upstream(response, P1).await;

        assert!(next(&mut upstream).await.has(MessageType::PlatformUnregister));
        assert!(stage.routing_info(P1).is_none());
        assert_eq!(stage.platform_count(), 0);
        assert_eq!(
            translation.calls.lock().unwrap().clone(),
            vec![format!("setup {P1}"), format!("remove {P1}")]
        );
    }

    #[tokio::test]
    async fn update_without_alignments_leaves_routing_untouched() {
        let bus = Arc::new(TopicBus::default());
        let translation = Arc::new(RecordingTranslation::default());
        let stage = stage_with(&bus, translation.clone());
        let mut bridge = bus.subscribe(&BrokerTopic::IpsmrmBridge.for_platform(P1));

        stage.handle_downstream(register(&aligned_platform())).await;
        next(&mut bridge).await;

        let update = PlatformReq::new(Platform::new(P1, "type", "e")).to_envelope(MessageType::PlatformUpdate, "conv-up");
        stage.handle_downstream(update).await;
        assert!(next(&mut bridge).await.has(MessageType::PlatformUpdate));
        assert!(stage.routing_info(P1).unwrap().use_downstream_translation);
        assert_eq!(translation.calls.lock().unwrap().len(), 1);
    }
}
