//! [`TestBridge`] – an in-process platform for development and tests.
//!
//! Answers every request immediately and fakes a platform behind it:
//!
//! | Request | Behaviour |
//! |---|---|
//! | `SUBSCRIBE` | starts a periodic task emitting one observation per device, keyed by conversation id |
//! | `UNSUBSCRIBE` | aborts the task keyed by the subscription id |
//! | `QUERY` | one observation per requested device (ten sample sensors when none are named) |
//! | `LIST_DEVICES` | emits `DEVICE_REGISTRY_INITIALIZE` with the platform's sample devices |
//! | `OBSERVATION` | re-emits the observation under every local subscription containing its sensor |
//!
//! # Configuration
//!
//! | Property | Default |
//! |---|---|
//! | `observation.period.ms` | `2000` |
//! | `device.count` | `3` |

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use intermesh_types::request::{DevicesReq, ObservationPayload, PlatformReq, SubscribeReq, UnsubscribeReq};
use intermesh_types::{DeviceType, IoTDevice, MessageEnvelope, MessageType, Platform, generate_conversation_id};
use serde_json::{Value, json};
use tokio::task::JoinHandle;
use tokio::time::{Instant, interval_at};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::adapter::{BridgeAdapter, BridgeContext, BridgeError, BridgePublisher};

const SAMPLE_SENSOR_PREFIX: &str = "http://test.inter-iot.eu/sensor_";

struct SubscriptionTask {
    device_ids: Vec<String>,
    handle: JoinHandle<()>,
}

pub struct TestBridge {
    platform: RwLock<Platform>,
    publisher: BridgePublisher,
    observation_period: Duration,
    device_count: usize,
    subscriptions: Mutex<HashMap<String, SubscriptionTask>>,
}

impl TestBridge {
    pub const PLATFORM_TYPE: &'static str = "http://inter-iot.eu/MWTestPlatform";

    pub fn new(ctx: BridgeContext) -> Result<Self, BridgeError> {
        let period_ms: u64 = ctx.configuration.parse_or("observation.period.ms", 2000)?;
        if period_ms == 0 {
            return Err(BridgeError::Configuration("observation.period.ms must be positive".into()));
        }
        Ok(Self {
            platform: RwLock::new(ctx.platform),
            publisher: ctx.publisher,
            observation_period: Duration::from_millis(period_ms),
            device_count: ctx.configuration.parse_or("device.count", 3)?,
            subscriptions: Mutex::new(HashMap::new()),
        })
    }

    /// [`BridgeFactory`][crate::BridgeFactory] for this adapter.
    pub fn factory(ctx: BridgeContext) -> Result<Box<dyn BridgeAdapter>, BridgeError> {
        Ok(Box::new(Self::new(ctx)?))
    }

    fn platform_id(&self) -> String {
        self.platform
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .platform_id
            .clone()
    }

    /// Conversation ids of the running observation tasks.
    pub fn active_subscriptions(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .subscriptions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        ids.sort();
        ids
    }

    fn response(&self, msg: &MessageEnvelope) -> MessageEnvelope {
        MessageEnvelope::response_to(msg).with_sender(self.platform_id())
    }

    fn sample_devices(&self) -> Vec<IoTDevice> {
        let platform_id = self.platform_id();
        (0..self.device_count)
            .map(|i| {
                let mut device = IoTDevice::new(format!("{platform_id}/device_{i}"), platform_id.clone());
                device.device_types.insert(DeviceType::Sensor);
                device.name = Some(format!("Test sensor {i}"));
                device
            })
            .collect()
    }
}

fn observation(device_id: &str, value: i64) -> Value {
    json!({
        "id": format!("http://test.inter-iot.eu/observations/{}", Uuid::new_v4()),
        "madeBySensor": device_id,
        "hasResult": value,
        "observedProperty": "http://test.inter-iot.eu/temperature",
        "resultTime": Utc::now().to_rfc3339(),
    })
}

fn device_ids_of(msg: &MessageEnvelope) -> Vec<String> {
    msg.payload
        .get("deviceIds")
        .and_then(Value::as_array)
        .map(|ids| ids.iter().filter_map(Value::as_str).map(str::to_string).collect())
        .unwrap_or_default()
}

async fn emit_observations(
    publisher: BridgePublisher,
    conversation_id: String,
    device_ids: Vec<String>,
    period: Duration,
) {
    let mut ticker = interval_at(Instant::now() + period, period);
    let mut value = 10;
    loop {
        ticker.tick().await;
        for device_id in device_ids.iter().filter(|d| !d.contains("virtual")) {
            let envelope = MessageEnvelope::new([MessageType::Observation], conversation_id.clone())
                .with_payload(json!({ "observations": [observation(device_id, value)] }));
            if let Err(e) = publisher.publish(envelope).await {
                warn!(conversation_id = %conversation_id, device_id = %device_id, error = %e, "failed to emit observation");
            }
        }
        value += 1;
    }
}

#[async_trait]
impl BridgeAdapter for TestBridge {
    async fn register_platform(&self, msg: &MessageEnvelope) -> Result<MessageEnvelope, BridgeError> {
        debug!(platform_id = %self.platform_id(), "test platform registered");
        Ok(self.response(msg))
    }

    async fn update_platform(&self, msg: &MessageEnvelope) -> Result<MessageEnvelope, BridgeError> {
        let updated = PlatformReq::from_envelope(msg)?.platform;
        let mut platform = self.platform.write().unwrap_or_else(PoisonError::into_inner);
        if updated.base_endpoint != platform.base_endpoint {
            debug!(platform_id = %platform.platform_id, "base endpoint changed");
        }
        *platform = updated;
        drop(platform);
        Ok(self.response(msg))
    }

    async fn unregister_platform(&self, msg: &MessageEnvelope) -> Result<MessageEnvelope, BridgeError> {
        debug!(platform_id = %self.platform_id(), "test platform unregistered");
        Ok(self.response(msg))
    }

    async fn subscribe(&self, msg: &MessageEnvelope) -> Result<MessageEnvelope, BridgeError> {
        let req = SubscribeReq::from_envelope(msg)?;
        let mut subscriptions = self.subscriptions.lock().unwrap_or_else(PoisonError::into_inner);
        if subscriptions.contains_key(&req.conversation_id) {
            return Err(BridgeError::InvalidMessage(format!(
                "subscription {} already exists",
                req.conversation_id
            )));
        }
        let handle = tokio::spawn(emit_observations(
            self.publisher.clone(),
            req.conversation_id.clone(),
            req.device_ids.clone(),
            self.observation_period,
        ));
        debug!(conversation_id = %req.conversation_id, devices = req.device_ids.len(), "subscription scheduled");
        subscriptions.insert(
            req.conversation_id,
            SubscriptionTask {
                device_ids: req.device_ids,
                handle,
            },
        );
        drop(subscriptions);
        Ok(self.response(msg))
    }

    async fn unsubscribe(&self, msg: &MessageEnvelope) -> Result<MessageEnvelope, BridgeError> {
        let req = UnsubscribeReq::from_envelope(msg)?;
        let task = self
            .subscriptions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&req.subscription_id)
            .ok_or_else(|| BridgeError::InvalidMessage(format!("subscription {} does not exist", req.subscription_id)))?;
        task.handle.abort();
        debug!(subscription_id = %req.subscription_id, "subscription cancelled");
        Ok(self.response(msg))
    }

    async fn query(&self, msg: &MessageEnvelope) -> Result<MessageEnvelope, BridgeError> {
        let mut device_ids = device_ids_of(msg);
        if device_ids.is_empty() {
            device_ids = (0..10).map(|i| format!("{SAMPLE_SENSOR_PREFIX}{i}")).collect();
        }
        let observations: Vec<Value> = device_ids
            .iter()
            .zip(10..)
            .map(|(id, value)| observation(id, value))
            .collect();
        Ok(self.response(msg).with_payload(json!({ "observations": observations })))
    }

    async fn list_devices(&self, msg: &MessageEnvelope) -> Result<MessageEnvelope, BridgeError> {
        let platform_id = self.platform_id();
        let init = DevicesReq::new(self.sample_devices()).to_envelope(
            MessageType::DeviceRegistryInitialize,
            &generate_conversation_id(),
            &platform_id,
        );
        let publisher = self.publisher.clone();
        tokio::spawn(async move {
            if let Err(e) = publisher.publish(init).await {
                warn!(platform_id = %platform_id, error = %e, "failed to publish device registry");
            }
        });
        Ok(self.response(msg))
    }

    async fn platform_create_devices(&self, msg: &MessageEnvelope) -> Result<MessageEnvelope, BridgeError> {
        for device in DevicesReq::from_envelope(msg)?.devices {
            debug!(device_id = %device.device_id, hosted_by = %device.hosted_by, "managing new device");
        }
        Ok(self.response(msg))
    }

    async fn platform_update_devices(&self, msg: &MessageEnvelope) -> Result<MessageEnvelope, BridgeError> {
        for device in DevicesReq::from_envelope(msg)?.devices {
            debug!(device_id = %device.device_id, "updating device");
        }
        Ok(self.response(msg))
    }

    async fn platform_delete_devices(&self, msg: &MessageEnvelope) -> Result<MessageEnvelope, BridgeError> {
        for device_id in device_ids_of(msg) {
            debug!(device_id = %device_id, "deleting device");
        }
        Ok(self.response(msg))
    }

    async fn observe(&self, msg: &MessageEnvelope) -> Result<(), BridgeError> {
        let payload = ObservationPayload::from_envelope(msg)?;
        let Some(sensor) = payload.sensors().last().map(str::to_string) else {
            debug!(conversation_id = %msg.conversation_id, "observation names no sensor");
            return Ok(());
        };

        let matching: Vec<String> = self
            .subscriptions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|(_, task)| task.device_ids.contains(&sensor))
            .map(|(conv, _)| conv.clone())
            .collect();

        for conversation_id in matching {
            debug!(conversation_id = %conversation_id, sensor = %sensor, "subscription includes virtual device");
            let mut local = msg.clone();
            local.conversation_id = conversation_id;
            local.receiver_platform_ids.clear();
            self.publisher.publish(local).await?;
        }
        Ok(())
    }

    async fn actuate(&self, msg: &MessageEnvelope) -> Result<MessageEnvelope, BridgeError> {
        Ok(self.response(msg))
    }

    async fn shutdown(&self) {
        let tasks: Vec<SubscriptionTask> = self
            .subscriptions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain()
            .map(|(_, task)| task)
            .collect();
        for task in tasks {
            task.handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::BridgeConfiguration;
    use futures_util::StreamExt;
    use intermesh_middleware::{EnvelopeStream, MessageBus, TopicBus};
    use std::collections::BTreeMap;
    use std::sync::Arc;

    const PID: &str = "http://test.inter-iot.eu/p1";

    fn bridge(bus: Arc<TopicBus>, period_ms: u64) -> (TestBridge, EnvelopeStream) {
        let publisher = BridgePublisher::new(bus.clone(), PID);
        let upstream = bus.subscribe(publisher.topic());
        let configuration = BridgeConfiguration::new(BTreeMap::from([(
            "observation.period.ms".to_string(),
            period_ms.to_string(),
        )]));
        let ctx = BridgeContext {
            configuration,
            platform: Platform::new(PID, TestBridge::PLATFORM_TYPE, "http://localhost"),
            publisher,
        };
        (TestBridge::new(ctx).unwrap(), upstream)
    }

    fn subscribe_msg(conv: &str, devices: &[&str]) -> MessageEnvelope {
        SubscribeReq {
            conversation_id: conv.into(),
            client_id: Some("alice".into()),
            platform_id: PID.into(),
            device_ids: devices.iter().map(|d| d.to_string()).collect(),
        }
        .to_envelope()
    }

    fn unsubscribe_msg(subscription_id: &str) -> MessageEnvelope {
        UnsubscribeReq {
            conversation_id: "conv-unsub".into(),
            subscription_id: subscription_id.into(),
            client_id: None,
            platform_id: PID.into(),
            device_ids: vec![],
        }
        .to_envelope()
    }

    #[tokio::test]
    async fn subscription_emits_observations_until_cancelled() {
        let bus = Arc::new(TopicBus::default());
        let (bridge, mut upstream) = bridge(bus, 20);

        let response = bridge.subscribe(&subscribe_msg("conv-s", &[&format!("{PID}/dev1")])).await.unwrap();
        assert!(response.has(MessageType::Subscribe) && response.has(MessageType::Response));

        let obs = tokio::time::timeout(Duration::from_secs(1), upstream.next()).await.unwrap().unwrap();
        assert_eq!(obs.conversation_id, "conv-s");
        assert_eq!(obs.sender_platform_id.as_deref(), Some(PID));
        let payload = ObservationPayload::from_envelope(&obs).unwrap();
        assert_eq!(payload.sensors().collect::<Vec<_>>(), vec![format!("{PID}/dev1")]);

        bridge.unsubscribe(&unsubscribe_msg("conv-s")).await.unwrap();
        assert!(bridge.active_subscriptions().is_empty());
    }

    #[tokio::test]
    async fn duplicate_subscription_is_rejected() {
        let bus = Arc::new(TopicBus::default());
        let (bridge, _upstream) = bridge(bus, 1000);
        bridge.subscribe(&subscribe_msg("conv-s", &["d"])).await.unwrap();
        assert!(matches!(
            bridge.subscribe(&subscribe_msg("conv-s", &["d"])).await,
            Err(BridgeError::InvalidMessage(_))
        ));
        bridge.shutdown().await;
    }

    #[tokio::test]
    async fn unknown_unsubscribe_is_rejected() {
        let bus = Arc::new(TopicBus::default());
        let (bridge, _upstream) = bridge(bus, 1000);
        assert!(bridge.unsubscribe(&unsubscribe_msg("nope")).await.is_err());
    }

    #[tokio::test]
    async fn query_answers_one_observation_per_device() {
        let bus = Arc::new(TopicBus::default());
        let (bridge, _upstream) = bridge(bus, 1000);

        let msg = MessageEnvelope::new([MessageType::Query], "conv-q")
            .with_payload(json!({ "deviceIds": ["a", "b"] }));
        let response = bridge.query(&msg).await.unwrap();
        assert_eq!(ObservationPayload::from_envelope(&response).unwrap().observations.len(), 2);

        let empty = MessageEnvelope::new([MessageType::Query], "conv-q2");
        let response = bridge.query(&empty).await.unwrap();
        assert_eq!(ObservationPayload::from_envelope(&response).unwrap().observations.len(), 10);
    }

    #[tokio::test]
    async fn list_devices_emits_registry_initialize() {
        let bus = Arc::new(TopicBus::default());
        let (bridge, mut upstream) = bridge(bus, 1000);

        let response = bridge
            .list_devices(&MessageEnvelope::new([MessageType::ListDevices], "conv-l"))
            .await
            .unwrap();
        assert!(response.has(MessageType::ListDevices));

        let init = tokio::time::timeout(Duration::from_secs(1), upstream.next()).await.unwrap().unwrap();
        assert!(init.has(MessageType::DeviceRegistryInitialize));
        let devices = DevicesReq::from_envelope(&init).unwrap().devices;
        assert_eq!(devices.len(), 3);
        assert!(devices.iter().all(|d| d.hosted_by == PID));
    }

    #[tokio::test]
    async fn virtual_observation_is_reemitted_under_local_subscription() {
        let bus = Arc::new(TopicBus::default());
        let (bridge, mut upstream) = bridge(bus, 60_000);
        bridge
            .subscribe(&subscribe_msg("conv-local", &["http://virtual.inter-iot.eu/device/D2"]))
            .await
            .unwrap();

        let incoming = MessageEnvelope::new([MessageType::Observation], "conv-virtual")
            .with_receiver(PID)
            .with_payload(json!({
                "observations": [{ "id": "o1", "madeBySensor": "http://virtual.inter-iot.eu/device/D2" }]
            }));
        bridge.observe(&incoming).await.unwrap();

        let out = tokio::time::timeout(Duration::from_secs(1), upstream.next()).await.unwrap().unwrap();
        assert_eq!(out.conversation_id, "conv-local");
        assert!(out.receiver_platform_ids.is_empty());
        bridge.shutdown().await;
    }
}
