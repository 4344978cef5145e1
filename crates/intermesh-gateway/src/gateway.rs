//! [`ClientGateway`] – the client-facing end of the pipeline.
//!
//! Downstream, it stamps correlation state and publishes on `arm_prm`.
//! Upstream, it listens on `prm_arm` and hands each envelope to the client
//! that started the conversation.
//!
//! # Correlation tables
//!
//! | Table | Key → value | Lifetime |
//! |---|---|---|
//! | conversations | conversation id → client id | until a terminal response, UNSUBSCRIBE or callback removal |
//! | live subscriptions | conversation id → receiving platforms | until UNSUBSCRIBE or callback removal |
//! | query cache | conversation id → QUERY response | consumed on read or TTL |
//! | last metadata | sender platform → most recent upstream envelope (payload stripped) | overwritten |

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;

use intermesh_middleware::{MessageBus, spawn_listener};
use intermesh_registry::Registry;
use intermesh_types::request::{SubscribeReq, UnsubscribeReq};
use intermesh_types::{
    BrokerTopic, Client, EntityKind, IoTDevice, MessageEnvelope, MessageType, ResponseDelivery, RouteError,
    Subscription, generate_conversation_id,
};
use serde_json::Value;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::callback::{ApiCallback, PullCallback, PushCallback, PushSettings};
use crate::query_cache::QueryCache;

/// Gateway tuning.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub push: PushSettings,
    pub query_cache_ttl: Duration,
    /// Bound on undelivered messages per pull client.
    pub pull_queue_capacity: usize,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            push: PushSettings::default(),
            query_cache_ttl: Duration::from_secs(300),
            pull_queue_capacity: 10_000,
        }
    }
}

pub struct ClientGateway {
    bus: Arc<dyn MessageBus>,
    registry: Arc<dyn Registry>,
    config: GatewayConfig,
    callbacks: RwLock<HashMap<String, Arc<dyn ApiCallback>>>,
    conversations: Mutex<HashMap<String, String>>,
    live_subscriptions: Mutex<HashMap<String, HashSet<String>>>,
    last_metadata: Mutex<HashMap<String, MessageEnvelope>>,
    query_cache: QueryCache,
    listener: Mutex<Option<JoinHandle<()>>>,
}

impl ClientGateway {
    pub fn new(bus: Arc<dyn MessageBus>, registry: Arc<dyn Registry>, config: GatewayConfig) -> Self {
        let query_cache = QueryCache::new(config.query_cache_ttl);
        Self {
            bus,
            registry,
            config,
            callbacks: RwLock::new(HashMap::new()),
            conversations: Mutex::new(HashMap::new()),
            live_subscriptions: Mutex::new(HashMap::new()),
            last_metadata: Mutex::new(HashMap::new()),
            query_cache,
            listener: Mutex::new(None),
        }
    }

    /// Start consuming `prm_arm`. Calling it again replaces the listener.
    pub fn start(self: &Arc<Self>) {
        let gateway = Arc::clone(self);
        let handle = spawn_listener(self.bus.as_ref(), BrokerTopic::PrmArm.name(), move |envelope| {
            let gateway = Arc::clone(&gateway);
            async move { gateway.handle_upstream(envelope).await }
        });
        if let Some(old) = self.listener.lock().unwrap_or_else(PoisonError::into_inner).replace(handle) {
            old.abort();
        }
        info!(topic = BrokerTopic::PrmArm.name(), "client gateway listening");
    }

    /// Stop the upstream listener and every delivery worker.
    pub fn stop(&self) {
        if let Some(handle) = self.listener.lock().unwrap_or_else(PoisonError::into_inner).take() {
            handle.abort();
        }
        let callbacks: Vec<_> = self
            .callbacks
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .drain()
            .collect();
        for (client_id, callback) in callbacks {
            callback.stop();
            debug!(client_id = %client_id, "callback stopped");
        }
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Callbacks and clients
    // ─────────────────────────────────────────────────────────────────────────

    /// Install `callback` for `client_id`, stopping any previous one.
    pub fn register_callback(&self, client_id: &str, callback: Arc<dyn ApiCallback>) {
        let previous = self
            .callbacks
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(client_id.to_string(), callback);
        if let Some(previous) = previous {
            previous.stop();
        }
        debug!(client_id = %client_id, "callback registered");
    }

    /// Apply `client`'s delivery parameters to its existing callback.
    ///
    /// # Errors
    ///
    /// Returns [`RouteError::NotRegistered`] when no callback exists.
    pub fn update_callback(&self, client: &Client) -> Result<(), RouteError> {
        let callback = self
            .callback(&client.client_id)
            .ok_or_else(|| RouteError::not_registered(EntityKind::Client, &client.client_id))?;
        callback.update(client);
        Ok(())
    }

    /// Forget `client_id`: drop its correlations, stop its worker. Unknown
    /// clients are ignored.
    pub fn unregister_callback(&self, client_id: &str) {
        let removed: Vec<String> = {
            let mut conversations = self.conversations.lock().unwrap_or_else(PoisonError::into_inner);
            let ids: Vec<String> = conversations
                .iter()
                .filter(|(_, owner)| owner.as_str() == client_id)
                .map(|(conv, _)| conv.clone())
                .collect();
            for conv in &ids {
                conversations.remove(conv);
            }
            ids
        };
        {
            let mut live = self.live_subscriptions.lock().unwrap_or_else(PoisonError::into_inner);
            for conv in &removed {
                live.remove(conv);
            }
        }

        let callback = self
            .callbacks
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(client_id);
        if let Some(callback) = callback {
            callback.stop();
            info!(client_id = %client_id, conversations = removed.len(), "callback unregistered");
        }
    }

    /// Persist `client` when new and install its callback; a known client is
    /// updated in place.
    ///
    /// # Errors
    ///
    /// Registry failures, or [`RouteError::Middleware`] for a push client
    /// without a usable callback URL.
    pub async fn register_client(&self, client: &Client) -> Result<(), RouteError> {
        if self.registry.get_client(&client.client_id).await?.is_some() {
            self.registry.update_client(client).await?;
        } else {
            self.registry.register_client(client).await?;
        }

        match self.callback(&client.client_id) {
            Some(existing) if delivery_of(existing.as_ref()) == client.response_delivery => {
                existing.update(client);
            }
            _ => {
                let callback = self.create_callback(client)?;
                self.register_callback(&client.client_id, callback);
            }
        }
        info!(client_id = %client.client_id, delivery = ?client.response_delivery, "client registered");
        Ok(())
    }

    /// Unregister the callback and delete the registry entry.
    ///
    /// # Errors
    ///
    /// Returns [`RouteError::NotRegistered`] when the registry has no such
    /// client.
    pub async fn remove_client(&self, client_id: &str) -> Result<(), RouteError> {
        self.unregister_callback(client_id);
        self.registry.remove_client(client_id).await?;
        Ok(())
    }

    pub fn registered_clients(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .callbacks
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        ids.sort();
        ids
    }

    fn callback(&self, client_id: &str) -> Option<Arc<dyn ApiCallback>> {
        self.callbacks
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(client_id)
            .cloned()
    }

    fn create_callback(&self, client: &Client) -> Result<Arc<dyn ApiCallback>, RouteError> {
        Ok(match client.response_delivery {
            ResponseDelivery::ClientPull => Arc::new(PullCallback::new(client, self.config.pull_queue_capacity)),
            ResponseDelivery::ServerPush => Arc::new(PushCallback::start(client, &self.config.push)?),
        })
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Downstream
    // ─────────────────────────────────────────────────────────────────────────

    /// Record correlation state for `envelope` and publish it on `arm_prm`.
    /// Returns the conversation id without waiting for a response.
    ///
    /// # Errors
    ///
    /// - [`RouteError::MissingConversationId`] for an empty conversation id.
    /// - [`RouteError::AlreadyRegistered`] for a SUBSCRIBE whose conversation
    ///   is already live at one of its receiving platforms.
    /// - [`RouteError::Middleware`] for a SUBSCRIBE without a receiving
    ///   platform.
    /// - [`RouteError::Transport`] when the publish fails; correlation state
    ///   recorded for this call is rolled back.
    pub async fn process_downstream(&self, envelope: MessageEnvelope) -> Result<String, RouteError> {
        let conversation_id = envelope.require_conversation_id()?.to_string();

        let claimed = if envelope.has(MessageType::Subscribe) {
            self.claim_subscription(&conversation_id, &envelope.receiver_platform_ids)?
        } else {
            Vec::new()
        };

        if envelope.has_any(&[MessageType::Unsubscribe, MessageType::VirtualUnsubscribe]) {
            if let Some(subscription_id) = envelope.subscription_id.as_deref() {
                self.conversations
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .remove(subscription_id);
                self.live_subscriptions
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .remove(subscription_id);
                debug!(subscription_id = %subscription_id, "subscription correlation released");
            }
        }

        let newly_correlated = match envelope.client_id.as_deref() {
            Some(client_id) => self
                .conversations
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .insert(conversation_id.clone(), client_id.to_string())
                .is_none(),
            None => false,
        };

        debug!(
            conversation_id = %conversation_id,
            message_types = %envelope.describe_types(),
            "publishing downstream"
        );
        if let Err(e) = self.bus.publish(BrokerTopic::ArmPrm.name(), envelope).await {
            self.release_subscription(&conversation_id, &claimed);
            if newly_correlated {
                self.conversations
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .remove(&conversation_id);
            }
            return Err(e);
        }
        Ok(conversation_id)
    }

    /// Mark `conversation_id` live at `platforms`, all or nothing.
    fn claim_subscription(&self, conversation_id: &str, platforms: &[String]) -> Result<Vec<String>, RouteError> {
        if platforms.is_empty() {
            return Err(RouteError::Middleware(format!(
                "SUBSCRIBE '{conversation_id}' names no receiving platform"
            )));
        }
        let mut live = self.live_subscriptions.lock().unwrap_or_else(PoisonError::into_inner);
        let entry = live.entry(conversation_id.to_string()).or_default();
        if platforms.iter().any(|p| entry.contains(p)) {
            return Err(RouteError::already_registered(EntityKind::Subscription, conversation_id));
        }
        entry.extend(platforms.iter().cloned());
        Ok(platforms.to_vec())
    }

    fn release_subscription(&self, conversation_id: &str, platforms: &[String]) {
        let mut live = self.live_subscriptions.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(entry) = live.get_mut(conversation_id) {
            for p in platforms {
                entry.remove(p);
            }
            if entry.is_empty() {
                live.remove(conversation_id);
            }
        }
    }

    /// Persist a subscription for `device_ids` and send one SUBSCRIBE per
    /// hosting platform. Returns the subscription id.
    ///
    /// # Errors
    ///
    /// [`RouteError::NotRegistered`] for an unknown client or device.
    pub async fn subscribe_devices(&self, client_id: &str, device_ids: &[String]) -> Result<String, RouteError> {
        if self.callback(client_id).is_none() {
            return Err(RouteError::not_registered(EntityKind::Client, client_id));
        }
        let by_platform = self.group_by_platform(device_ids).await?;

        let conversation_id = generate_conversation_id();
        self.registry
            .subscribe(&Subscription {
                conversation_id: conversation_id.clone(),
                client_id: client_id.to_string(),
                device_ids: device_ids.to_vec(),
            })
            .await?;

        for (platform_id, ids) in by_platform {
            let request = SubscribeReq {
                conversation_id: conversation_id.clone(),
                client_id: Some(client_id.to_string()),
                platform_id,
                device_ids: ids,
            };
            self.process_downstream(request.to_envelope()).await?;
        }
        info!(client_id = %client_id, subscription_id = %conversation_id, "subscription created");
        Ok(conversation_id)
    }

    /// Delete `subscription_id` and send one UNSUBSCRIBE per hosting
    /// platform under a fresh conversation id, which is returned.
    ///
    /// # Errors
    ///
    /// [`RouteError::NotRegistered`] when the subscription does not exist or
    /// belongs to another client.
    pub async fn unsubscribe(&self, client_id: &str, subscription_id: &str) -> Result<String, RouteError> {
        let subscription = self
            .registry
            .get_subscription_by_id(subscription_id)
            .await?
            .filter(|s| s.client_id == client_id)
            .ok_or_else(|| RouteError::not_registered(EntityKind::Subscription, subscription_id))?;
        let by_platform = self.group_by_platform(&subscription.device_ids).await?;

        self.registry.delete_subscription(subscription_id).await?;

        let conversation_id = generate_conversation_id();
        for (platform_id, ids) in by_platform {
            let request = UnsubscribeReq {
                conversation_id: conversation_id.clone(),
                subscription_id: subscription_id.to_string(),
                client_id: Some(client_id.to_string()),
                platform_id,
                device_ids: ids,
            };
            self.process_downstream(request.to_envelope()).await?;
        }
        info!(client_id = %client_id, subscription_id = %subscription_id, "subscription removed");
        Ok(conversation_id)
    }

    async fn group_by_platform(&self, device_ids: &[String]) -> Result<BTreeMap<String, Vec<String>>, RouteError> {
        let devices: Vec<IoTDevice> = self.registry.get_devices(device_ids).await?;
        let known: HashSet<&str> = devices.iter().map(|d| d.device_id.as_str()).collect();
        if let Some(missing) = device_ids.iter().find(|id| !known.contains(id.as_str())) {
            return Err(RouteError::not_registered(EntityKind::Device, missing));
        }
        let mut grouped: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for device in devices {
            grouped.entry(device.hosted_by).or_default().push(device.device_id);
        }
        Ok(grouped)
    }

    /// Rebuild callbacks and live subscriptions from the registry. Failures
    /// are logged per item.
    pub async fn restore_state(&self) -> Result<(), RouteError> {
        let clients = self.registry.list_clients().await?;
        let mut restored_clients = 0usize;
        for client in &clients {
            match self.create_callback(client) {
                Ok(callback) => {
                    self.register_callback(&client.client_id, callback);
                    restored_clients += 1;
                }
                Err(e) => error!(client_id = %client.client_id, error = %e, "cannot restore callback"),
            }
        }

        let subscriptions = self.registry.list_subscriptions(None).await?;
        let mut restored_subscriptions = 0usize;
        for subscription in &subscriptions {
            let by_platform = match self.group_by_platform(&subscription.device_ids).await {
                Ok(grouped) => grouped,
                Err(e) => {
                    error!(subscription_id = %subscription.conversation_id, error = %e, "cannot restore subscription");
                    continue;
                }
            };
            for (platform_id, ids) in by_platform {
                let envelope = SubscribeReq {
                    conversation_id: subscription.conversation_id.clone(),
                    client_id: Some(subscription.client_id.clone()),
                    platform_id: platform_id.clone(),
                    device_ids: ids,
                }
                .to_envelope()
                .with_type(MessageType::SysInit);
                match self.process_downstream(envelope).await {
                    Ok(_) => restored_subscriptions += 1,
                    Err(e) => error!(
                        subscription_id = %subscription.conversation_id,
                        platform_id = %platform_id,
                        error = %e,
                        "cannot re-issue subscription"
                    ),
                }
            }
        }
        info!(clients = restored_clients, subscriptions = restored_subscriptions, "client gateway state restored");
        Ok(())
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Upstream
    // ─────────────────────────────────────────────────────────────────────────

    /// Deliver one envelope received on `prm_arm`. Never fails: every problem
    /// is logged and the envelope dropped.
    pub async fn handle_upstream(&self, envelope: MessageEnvelope) {
        if let Some(sender) = envelope.sender_platform_id.clone() {
            let mut metadata = envelope.clone();
            metadata.payload = Value::Null;
            self.last_metadata
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .insert(sender, metadata);
        }

        if envelope.is_disjoint(&[MessageType::Response, MessageType::Observation, MessageType::Error]) {
            warn!(
                conversation_id = %envelope.conversation_id,
                message_types = %envelope.describe_types(),
                "upstream message is neither a response, an observation nor an error; dropped"
            );
            return;
        }

        let conversation_id = envelope.conversation_id.clone();

        if envelope.has(MessageType::Query) {
            self.conversations
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .remove(&conversation_id);
            self.query_cache.insert(conversation_id.clone(), envelope);
            debug!(conversation_id = %conversation_id, "query response cached");
            return;
        }

        let client_id = self
            .conversations
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&conversation_id)
            .cloned();
        let Some(client_id) = client_id else {
            warn!(conversation_id = %conversation_id, "no client for conversation; dropped");
            return;
        };
        let Some(callback) = self.callback(&client_id) else {
            warn!(conversation_id = %conversation_id, client_id = %client_id, "no callback for client; dropped");
            return;
        };

        let terminal = envelope.is_disjoint(&[MessageType::Subscribe, MessageType::Observation]);
        let failed_subscribe = envelope.has(MessageType::Subscribe) && envelope.has(MessageType::Error);
        let sender = envelope.sender_platform_id.clone();

        if let Err(e) = callback.handle(envelope).await {
            error!(conversation_id = %conversation_id, client_id = %client_id, error = %e, "delivery to client failed");
        }

        if terminal {
            self.conversations
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .remove(&conversation_id);
        }
        if failed_subscribe {
            let platforms: Vec<String> = sender.into_iter().collect();
            if platforms.is_empty() {
                self.live_subscriptions
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .remove(&conversation_id);
            } else {
                self.release_subscription(&conversation_id, &platforms);
            }
        }
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Accessors
    // ─────────────────────────────────────────────────────────────────────────

    /// Drain up to the receiving capacity from a pull client's queue.
    ///
    /// # Errors
    ///
    /// [`RouteError::NotRegistered`] for an unknown client,
    /// [`RouteError::Middleware`] for a push client.
    pub async fn retrieve_responses(&self, client_id: &str) -> Result<Vec<MessageEnvelope>, RouteError> {
        let callback = self.pull_callback(client_id)?;
        let pull = callback
            .as_pull()
            .ok_or_else(|| RouteError::Middleware(format!("client '{client_id}' uses push delivery")))?;
        Ok(pull.retrieve().await)
    }

    /// Wait up to `timeout` for one message on a pull client's queue.
    pub async fn retrieve_response(
        &self,
        client_id: &str,
        timeout: Duration,
    ) -> Result<Option<MessageEnvelope>, RouteError> {
        let callback = self.pull_callback(client_id)?;
        let pull = callback
            .as_pull()
            .ok_or_else(|| RouteError::Middleware(format!("client '{client_id}' uses push delivery")))?;
        Ok(pull.retrieve_one(timeout).await)
    }

    fn pull_callback(&self, client_id: &str) -> Result<Arc<dyn ApiCallback>, RouteError> {
        self.callback(client_id)
            .ok_or_else(|| RouteError::not_registered(EntityKind::Client, client_id))
    }

    /// Consume the cached QUERY response for `conversation_id`.
    pub fn take_query_response(&self, conversation_id: &str) -> Option<MessageEnvelope> {
        self.query_cache.take(conversation_id)
    }

    /// Most recent upstream envelope from `platform_id`, payload stripped.
    pub fn last_message_metadata(&self, platform_id: &str) -> Option<MessageEnvelope> {
        self.last_metadata
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(platform_id)
            .cloned()
    }

    pub fn client_for_conversation(&self, conversation_id: &str) -> Option<String> {
        self.conversations
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(conversation_id)
            .cloned()
    }

    pub fn is_subscription_live(&self, conversation_id: &str) -> bool {
        self.live_subscriptions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(conversation_id)
            .is_some_and(|platforms| !platforms.is_empty())
    }
}

fn delivery_of(callback: &dyn ApiCallback) -> ResponseDelivery {
    if callback.as_pull().is_some() {
        ResponseDelivery::ClientPull
    } else {
        ResponseDelivery::ServerPush
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::StreamExt;
    use intermesh_middleware::{EnvelopeStream, TopicBus};
    use intermesh_registry::InMemoryRegistry;

    struct Harness {
        bus: Arc<TopicBus>,
        registry: Arc<InMemoryRegistry>,
        gateway: Arc<ClientGateway>,
        downstream: EnvelopeStream,
    }

    fn harness() -> Harness {
        let bus = Arc::new(TopicBus::default());
        let registry = Arc::new(InMemoryRegistry::new());
        let downstream = bus.subscribe(BrokerTopic::ArmPrm.name());
        let gateway = Arc::new(ClientGateway::new(bus.clone(), registry.clone(), GatewayConfig::default()));
        Harness { bus, registry, gateway, downstream }
    }

    async fn next(stream: &mut EnvelopeStream) -> MessageEnvelope {
        tokio::time::timeout(Duration::from_secs(2), stream.next())
            .await
            .expect("timed out waiting for envelope")
            .expect("stream ended")
    }

    async fn seed_devices(registry: &InMemoryRegistry) {
        registry
            .register_devices(&[
                IoTDevice::new("dev-a1", "http://pa"),
                IoTDevice::new("dev-a2", "http://pa"),
                IoTDevice::new("dev-b1", "http://pb"),
            ])
            .await
            .unwrap();
    }

    fn subscribe(conv: &str, platform: &str) -> MessageEnvelope {
        SubscribeReq {
            conversation_id: conv.into(),
            client_id: Some("c1".into()),
            platform_id: platform.into(),
            device_ids: vec!["dev".into()],
        }
        .to_envelope()
    }

    #[tokio::test]
    async fn process_downstream_requires_conversation_id() {
        let h = harness();
        let env = MessageEnvelope::new([MessageType::Query], "");
        assert_eq!(h.gateway.process_downstream(env).await, Err(RouteError::MissingConversationId));
    }

    #[tokio::test]
    async fn process_downstream_returns_conversation_and_publishes() {
        let mut h = harness();
        let env = MessageEnvelope::new([MessageType::ListDevices], "conv-7")
            .with_client("c1")
            .with_receiver("http://pa");
        assert_eq!(h.gateway.process_downstream(env).await.unwrap(), "conv-7");
        assert_eq!(next(&mut h.downstream).await.conversation_id, "conv-7");
        assert_eq!(h.gateway.client_for_conversation("conv-7").as_deref(), Some("c1"));
    }

    #[tokio::test]
    async fn second_subscribe_for_live_conversation_is_rejected() {
        let h = harness();
        h.gateway.process_downstream(subscribe("conv-s", "http://pa")).await.unwrap();
        let again = h.gateway.process_downstream(subscribe("conv-s", "http://pa")).await;
        assert!(matches!(again, Err(RouteError::AlreadyRegistered { kind: EntityKind::Subscription, .. })));

        // Same subscription fanned out to another platform is fine.
        h.gateway.process_downstream(subscribe("conv-s", "http://pb")).await.unwrap();
    }

    #[tokio::test]
    async fn subscribe_without_receiving_platform_is_rejected_every_time() {
        let mut h = harness();
        let unaddressed = || {
            MessageEnvelope::new([MessageType::Subscribe], "conv-dup")
                .with_client("c1")
                .with_payload(serde_json::json!({ "deviceIds": ["dev"] }))
        };

        for _ in 0..2 {
            let result = h.gateway.process_downstream(unaddressed()).await;
            assert!(matches!(result, Err(RouteError::Middleware(_))), "got {result:?}");
        }
        assert!(!h.gateway.is_subscription_live("conv-dup"));
        assert!(h.gateway.live_subscriptions.lock().unwrap().is_empty());
        assert!(h.gateway.client_for_conversation("conv-dup").is_none());
        let published = tokio::time::timeout(Duration::from_millis(50), h.downstream.next()).await;
        assert!(published.is_err(), "rejected SUBSCRIBE must not be published");
    }

    #[tokio::test]
    async fn failed_publish_rolls_back_subscription_claim() {
        let bus = Arc::new(TopicBus::default());
        let gateway = ClientGateway::new(bus, Arc::new(InMemoryRegistry::new()), GatewayConfig::default());

        let result = gateway.process_downstream(subscribe("conv-r", "http://pa")).await;
        assert!(matches!(result, Err(RouteError::Transport(_))));
        assert!(!gateway.is_subscription_live("conv-r"));
        assert!(gateway.client_for_conversation("conv-r").is_none());
    }

    #[tokio::test]
    async fn unsubscribe_releases_correlation_keyed_by_subscription_id() {
        let h = harness();
        h.gateway.process_downstream(subscribe("conv-sub", "http://pa")).await.unwrap();
        assert!(h.gateway.is_subscription_live("conv-sub"));

        let unsub = UnsubscribeReq {
            conversation_id: "conv-unsub".into(),
            subscription_id: "conv-sub".into(),
            client_id: Some("c1".into()),
            platform_id: "http://pa".into(),
            device_ids: vec![],
        }
        .to_envelope();
        h.gateway.process_downstream(unsub).await.unwrap();

        assert!(!h.gateway.is_subscription_live("conv-sub"));
        assert!(h.gateway.client_for_conversation("conv-sub").is_none());
        assert_eq!(h.gateway.client_for_conversation("conv-unsub").as_deref(), Some("c1"));
    }

    #[tokio::test]
    async fn register_client_twice_updates_the_single_callback() {
        let h = harness();
        h.gateway.register_client(&Client::pull("c1", 1)).await.unwrap();
        h.gateway.register_client(&Client::pull("c1", 3)).await.unwrap();
        assert_eq!(h.gateway.registered_clients(), vec!["c1".to_string()]);
        assert_eq!(h.registry.list_clients().await.unwrap().len(), 1);

        h.gateway.process_downstream(subscribe("conv-x", "http://pa")).await.unwrap();
        for _ in 0..3 {
            h.gateway
                .handle_upstream(MessageEnvelope::new([MessageType::Observation], "conv-x").with_sender("http://pa"))
                .await;
        }
        assert_eq!(h.gateway.retrieve_responses("c1").await.unwrap().len(), 3, "capacity follows the update");
    }

    #[tokio::test]
    async fn update_callback_for_unknown_client_fails() {
        let h = harness();
        assert!(matches!(
            h.gateway.update_callback(&Client::pull("ghost", 1)),
            Err(RouteError::NotRegistered { kind: EntityKind::Client, .. })
        ));
    }

    #[tokio::test]
    async fn upstream_routes_to_client_and_clears_terminal_conversations() {
        let h = harness();
        h.gateway.register_client(&Client::pull("c1", 10)).await.unwrap();
        h.gateway.process_downstream(subscribe("conv-obs", "http://pa")).await.unwrap();
        let list = MessageEnvelope::new([MessageType::ListDevices], "conv-list").with_client("c1");
        h.gateway.process_downstream(list).await.unwrap();

        let obs = MessageEnvelope::new([MessageType::Observation], "conv-obs").with_sender("http://pa");
        h.gateway.handle_upstream(obs).await;
        let resp = MessageEnvelope::new([MessageType::ListDevices, MessageType::Response], "conv-list");
        h.gateway.handle_upstream(resp).await;

        let got = h.gateway.retrieve_responses("c1").await.unwrap();
        assert_eq!(got.len(), 2);
        assert_eq!(h.gateway.client_for_conversation("conv-obs").as_deref(), Some("c1"));
        assert!(h.gateway.client_for_conversation("conv-list").is_none());
    }

    #[tokio::test]
    async fn upstream_drops_protocol_violations_and_unknown_conversations() {
        let h = harness();
        h.gateway.register_client(&Client::pull("c1", 10)).await.unwrap();
        h.gateway
            .process_downstream(MessageEnvelope::new([MessageType::ListDevices], "conv-1").with_client("c1"))
            .await
            .unwrap();

        // Neither RESPONSE, OBSERVATION nor ERROR.
        h.gateway.handle_upstream(MessageEnvelope::new([MessageType::ListDevices], "conv-1")).await;
        h.gateway
            .handle_upstream(MessageEnvelope::new([MessageType::ListDevices, MessageType::Response], "conv-unknown"))
            .await;

        assert!(h.gateway.retrieve_responses("c1").await.unwrap().is_empty());
        assert_eq!(h.gateway.client_for_conversation("conv-1").as_deref(), Some("c1"));
    }

    #[tokio::test]
    async fn query_responses_are_cached_not_delivered() {
        let h = harness();
        h.gateway.register_client(&Client::pull("c1", 10)).await.unwrap();
        h.gateway
            .process_downstream(MessageEnvelope::new([MessageType::Query], "conv-q").with_client("c1"))
            .await
            .unwrap();

        h.gateway
            .handle_upstream(MessageEnvelope::new([MessageType::Query, MessageType::Response], "conv-q"))
            .await;

        assert!(h.gateway.retrieve_responses("c1").await.unwrap().is_empty());
        assert!(h.gateway.take_query_response("conv-q").is_some());
        assert!(h.gateway.take_query_response("conv-q").is_none());
    }

    #[tokio::test]
    async fn unregister_callback_drops_every_correlation_of_the_client() {
        let h = harness();
        h.gateway.register_client(&Client::pull("c1", 10)).await.unwrap();
        h.gateway.process_downstream(subscribe("conv-a", "http://pa")).await.unwrap();
        h.gateway.process_downstream(subscribe("conv-b", "http://pb")).await.unwrap();

        h.gateway.unregister_callback("c1");
        h.gateway.unregister_callback("c1");

        assert!(h.gateway.client_for_conversation("conv-a").is_none());
        assert!(!h.gateway.is_subscription_live("conv-b"));
        assert!(matches!(
            h.gateway.retrieve_responses("c1").await,
            Err(RouteError::NotRegistered { .. })
        ));
    }

    #[tokio::test]
    async fn subscribe_devices_fans_out_per_platform() {
        let mut h = harness();
        seed_devices(&h.registry).await;
        h.gateway.register_client(&Client::pull("c1", 10)).await.unwrap();

        let ids = vec!["dev-a1".to_string(), "dev-b1".to_string(), "dev-a2".to_string()];
        let sub_id = h.gateway.subscribe_devices("c1", &ids).await.unwrap();

        let first = next(&mut h.downstream).await;
        let second = next(&mut h.downstream).await;
        let first_req = SubscribeReq::from_envelope(&first).unwrap();
        let second_req = SubscribeReq::from_envelope(&second).unwrap();
        assert_eq!(first_req.platform_id, "http://pa");
        assert_eq!(first_req.device_ids, vec!["dev-a1", "dev-a2"]);
        assert_eq!(second_req.platform_id, "http://pb");
        assert!(first.conversation_id == sub_id && second.conversation_id == sub_id);

        let stored = h.registry.get_subscription_by_id(&sub_id).await.unwrap().unwrap();
        assert_eq!(stored.client_id, "c1");
    }

    #[tokio::test]
    async fn subscribe_devices_rejects_unknown_device() {
        let h = harness();
        seed_devices(&h.registry).await;
        h.gateway.register_client(&Client::pull("c1", 10)).await.unwrap();
        let err = h
            .gateway
            .subscribe_devices("c1", &["dev-a1".to_string(), "nope".to_string()])
            .await
            .unwrap_err();
        assert_eq!(err, RouteError::not_registered(EntityKind::Device, "nope"));
        assert!(h.registry.list_subscriptions(None).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn unsubscribe_sends_one_request_per_platform_under_fresh_conversation() {
        let mut h = harness();
        seed_devices(&h.registry).await;
        h.gateway.register_client(&Client::pull("c1", 10)).await.unwrap();
        let sub_id = h
            .gateway
            .subscribe_devices("c1", &["dev-a1".to_string(), "dev-b1".to_string()])
            .await
            .unwrap();
        next(&mut h.downstream).await;
        next(&mut h.downstream).await;

        let conv = h.gateway.unsubscribe("c1", &sub_id).await.unwrap();
        assert_ne!(conv, sub_id);
        for _ in 0..2 {
            let env = next(&mut h.downstream).await;
            assert!(env.has(MessageType::Unsubscribe));
            assert_eq!(env.subscription_id.as_deref(), Some(sub_id.as_str()));
        }
        assert!(!h.gateway.is_subscription_live(&sub_id));
        assert!(h.registry.get_subscription_by_id(&sub_id).await.unwrap().is_none());

        assert!(matches!(
            h.gateway.unsubscribe("c1", &sub_id).await,
            Err(RouteError::NotRegistered { kind: EntityKind::Subscription, .. })
        ));
    }

    #[tokio::test]
    async fn restore_state_recreates_callbacks_and_reissues_subscriptions() {
        let mut h = harness();
        seed_devices(&h.registry).await;
        h.registry.register_client(&Client::pull("c1", 10)).await.unwrap();
        h.registry
            .subscribe(&Subscription {
                conversation_id: "conv-persisted".into(),
                client_id: "c1".into(),
                device_ids: vec!["dev-a1".into()],
            })
            .await
            .unwrap();

        h.gateway.restore_state().await.unwrap();

        assert_eq!(h.gateway.registered_clients(), vec!["c1".to_string()]);
        let env = next(&mut h.downstream).await;
        assert!(env.has(MessageType::Subscribe) && env.has(MessageType::SysInit));
        assert_eq!(env.conversation_id, "conv-persisted");
        assert!(h.gateway.is_subscription_live("conv-persisted"));
    }

    #[tokio::test]
    async fn listener_delivers_and_records_metadata() -> Result<(), Box<dyn std::error::Error>> {
        let h = harness();
        h.gateway.start();
        h.gateway.register_client(&Client::pull("c1", 10)).await?;
        h.gateway.process_downstream(subscribe("conv-l", "http://pa")).await?;

        let obs = MessageEnvelope::new([MessageType::Observation], "conv-l")
            .with_sender("http://pa")
            .with_payload(serde_json::json!({ "observations": [] }));
        h.bus.publish(BrokerTopic::PrmArm.name(), obs).await?;

        let got = h.gateway.retrieve_response("c1", Duration::from_secs(2)).await?;
        assert_eq!(got.map(|e| e.conversation_id), Some("conv-l".to_string()));
        let meta = h.gateway.last_message_metadata("http://pa").ok_or("no metadata")?;
        assert_eq!(meta.payload, Value::Null);
        h.gateway.stop();
        Ok(())
    }
}
