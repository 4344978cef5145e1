//! Typed views over envelope payloads.
//!
//! The routing core treats payloads as opaque JSON except where a stage has
//! to act on their content: platform lifecycle, device registry mutations,
//! subscriptions, discovery queries and observation relabeling. Each request
//! type here builds its envelope with [`to_envelope`](SubscribeReq::to_envelope)
//! and parses it back with `from_envelope`, failing with
//! [`RouteError::Middleware`] on a malformed payload.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};

use crate::envelope::{MessageEnvelope, MessageType};
use crate::error::RouteError;
use crate::model::{IoTDevice, Plat2PlatSubscription, Platform, QueryResult, QueryType};

fn payload_field<T: DeserializeOwned>(env: &MessageEnvelope, field: &str) -> Result<T, RouteError> {
    let value = env.payload.get(field).cloned().ok_or_else(|| {
        RouteError::Middleware(format!(
            "{} message {} has no '{field}' in its payload",
            env.describe_types(),
            env.log_id()
        ))
    })?;
    serde_json::from_value(value).map_err(|e| {
        RouteError::Middleware(format!(
            "{} message {} has an invalid '{field}': {e}",
            env.describe_types(),
            env.log_id()
        ))
    })
}

fn required(value: Option<&str>, what: &str, env: &MessageEnvelope) -> Result<String, RouteError> {
    value.map(str::to_string).ok_or_else(|| {
        RouteError::Middleware(format!(
            "{} message {} is missing its {what}",
            env.describe_types(),
            env.log_id()
        ))
    })
}

// ─────────────────────────────────────────────────────────────────────────────
// Platform lifecycle
// ─────────────────────────────────────────────────────────────────────────────

/// Payload of PLATFORM_REGISTER and PLATFORM_UPDATE.
#[derive(Debug, Clone, PartialEq)]
pub struct PlatformReq {
    pub platform: Platform,
}

impl PlatformReq {
    pub fn new(platform: Platform) -> Self {
        Self { platform }
    }

    /// Build an envelope tagged `tag`, addressed to the platform itself.
    pub fn to_envelope(&self, tag: MessageType, conversation_id: &str) -> MessageEnvelope {
        MessageEnvelope::new([tag], conversation_id)
            .with_receiver(self.platform.platform_id.clone())
            .with_payload(json!({ "platform": self.platform }))
    }

    pub fn from_envelope(env: &MessageEnvelope) -> Result<Self, RouteError> {
        Ok(Self {
            platform: payload_field(env, "platform")?,
        })
    }
}

/// PLATFORM_UNREGISTER carries nothing but its addressing.
pub fn unregister_platform_envelope(conversation_id: &str, platform_id: &str) -> MessageEnvelope {
    MessageEnvelope::new([MessageType::PlatformUnregister], conversation_id).with_receiver(platform_id)
}

// ─────────────────────────────────────────────────────────────────────────────
// Devices
// ─────────────────────────────────────────────────────────────────────────────

/// Payload of device create/update, DEVICE_ADD_OR_UPDATE and
/// DEVICE_REGISTRY_INITIALIZE.
#[derive(Debug, Clone, PartialEq)]
pub struct DevicesReq {
    pub devices: Vec<IoTDevice>,
}

impl DevicesReq {
    pub fn new(devices: Vec<IoTDevice>) -> Self {
        Self { devices }
    }

    pub fn to_envelope(&self, tag: MessageType, conversation_id: &str, platform_id: &str) -> MessageEnvelope {
        MessageEnvelope::new([tag], conversation_id)
            .with_receiver(platform_id)
            .with_payload(json!({ "devices": self.devices }))
    }

    pub fn from_envelope(env: &MessageEnvelope) -> Result<Self, RouteError> {
        Ok(Self {
            devices: payload_field(env, "devices")?,
        })
    }
}

/// Payload of PLATFORM_DELETE_DEVICE and DEVICE_REMOVE.
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceIdsReq {
    pub device_ids: Vec<String>,
}

impl DeviceIdsReq {
    pub fn new(device_ids: Vec<String>) -> Self {
        Self { device_ids }
    }

    pub fn to_envelope(&self, tag: MessageType, conversation_id: &str, platform_id: &str) -> MessageEnvelope {
        MessageEnvelope::new([tag], conversation_id)
            .with_receiver(platform_id)
            .with_payload(json!({ "deviceIds": self.device_ids }))
    }

    pub fn from_envelope(env: &MessageEnvelope) -> Result<Self, RouteError> {
        Ok(Self {
            device_ids: payload_field(env, "deviceIds")?,
        })
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Subscriptions
// ─────────────────────────────────────────────────────────────────────────────

/// SUBSCRIBE to a set of devices on one platform.
#[derive(Debug, Clone, PartialEq)]
pub struct SubscribeReq {
    pub conversation_id: String,
    pub client_id: Option<String>,
    pub platform_id: String,
    pub device_ids: Vec<String>,
}

impl SubscribeReq {
    pub fn to_envelope(&self) -> MessageEnvelope {
        let mut env = MessageEnvelope::new([MessageType::Subscribe], self.conversation_id.clone())
            .with_receiver(self.platform_id.clone())
            .with_payload(json!({ "deviceIds": self.device_ids }));
        env.client_id = self.client_id.clone();
        env
    }

    pub fn from_envelope(env: &MessageEnvelope) -> Result<Self, RouteError> {
        Ok(Self {
            conversation_id: env.conversation_id.clone(),
            client_id: env.client_id.clone(),
            platform_id: required(env.first_receiver(), "receiving platform", env)?,
            device_ids: payload_field(env, "deviceIds")?,
        })
    }
}

/// UNSUBSCRIBE from `subscription_id` on one platform.
#[derive(Debug, Clone, PartialEq)]
pub struct UnsubscribeReq {
    pub conversation_id: String,
    pub subscription_id: String,
    pub client_id: Option<String>,
    pub platform_id: String,
    pub device_ids: Vec<String>,
}

impl UnsubscribeReq {
    pub fn to_envelope(&self) -> MessageEnvelope {
        let mut env = MessageEnvelope::new([MessageType::Unsubscribe], self.conversation_id.clone())
            .with_receiver(self.platform_id.clone())
            .with_subscription(self.subscription_id.clone())
            .with_payload(json!({ "deviceIds": self.device_ids }));
        env.client_id = self.client_id.clone();
        env
    }

    pub fn from_envelope(env: &MessageEnvelope) -> Result<Self, RouteError> {
        let device_ids = match env.payload.get("deviceIds") {
            Some(_) => payload_field(env, "deviceIds")?,
            None => Vec::new(),
        };
        Ok(Self {
            conversation_id: env.conversation_id.clone(),
            subscription_id: required(env.subscription_id.as_deref(), "subscription id", env)?,
            client_id: env.client_id.clone(),
            platform_id: required(env.first_receiver(), "receiving platform", env)?,
            device_ids,
        })
    }
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Plat2PlatBody {
    source_platform_id: String,
    source_device_id: String,
    target_platform_id: String,
    target_device_id: String,
}

/// VIRTUAL_SUBSCRIBE: make `target_*` see `source_*` observations as its own.
#[derive(Debug, Clone, PartialEq)]
pub struct Plat2PlatSubscribeReq {
    pub conversation_id: String,
    pub client_id: String,
    pub source_platform_id: String,
    pub source_device_id: String,
    pub target_platform_id: String,
    pub target_device_id: String,
}

impl Plat2PlatSubscribeReq {
    pub fn to_envelope(&self) -> MessageEnvelope {
        let body = Plat2PlatBody {
            source_platform_id: self.source_platform_id.clone(),
            source_device_id: self.source_device_id.clone(),
            target_platform_id: self.target_platform_id.clone(),
            target_device_id: self.target_device_id.clone(),
        };
        MessageEnvelope::new([MessageType::VirtualSubscribe], self.conversation_id.clone())
            .with_client(self.client_id.clone())
            .with_subscription(self.conversation_id.clone())
            .with_payload(json!({ "subscription": body }))
    }

    pub fn from_envelope(env: &MessageEnvelope) -> Result<Self, RouteError> {
        let body: Plat2PlatBody = payload_field(env, "subscription")?;
        Ok(Self {
            conversation_id: env.require_conversation_id()?.to_string(),
            client_id: required(env.client_id.as_deref(), "client id", env)?,
            source_platform_id: body.source_platform_id,
            source_device_id: body.source_device_id,
            target_platform_id: body.target_platform_id,
            target_device_id: body.target_device_id,
        })
    }

    pub fn into_subscription(self) -> Plat2PlatSubscription {
        Plat2PlatSubscription {
            conversation_id: self.conversation_id,
            client_id: self.client_id,
            source_platform_id: self.source_platform_id,
            source_device_id: self.source_device_id,
            target_platform_id: self.target_platform_id,
            target_device_id: self.target_device_id,
        }
    }
}

/// VIRTUAL_UNSUBSCRIBE from the virtual subscription `subscription_id`.
#[derive(Debug, Clone, PartialEq)]
pub struct Plat2PlatUnsubscribeReq {
    pub conversation_id: String,
    pub subscription_id: String,
    pub client_id: Option<String>,
}

impl Plat2PlatUnsubscribeReq {
    pub fn to_envelope(&self) -> MessageEnvelope {
        let mut env = MessageEnvelope::new([MessageType::VirtualUnsubscribe], self.conversation_id.clone())
            .with_subscription(self.subscription_id.clone());
        env.client_id = self.client_id.clone();
        env
    }

    pub fn from_envelope(env: &MessageEnvelope) -> Result<Self, RouteError> {
        Ok(Self {
            conversation_id: env.require_conversation_id()?.to_string(),
            subscription_id: required(env.subscription_id.as_deref(), "subscription id", env)?,
            client_id: env.client_id.clone(),
        })
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Discovery
// ─────────────────────────────────────────────────────────────────────────────

/// DEVICE_DISCOVERY_QUERY against the registry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiscoveryQueryReq {
    pub query: String,
    #[serde(default)]
    pub query_type: QueryType,
}

impl DiscoveryQueryReq {
    pub fn to_envelope(&self, conversation_id: &str) -> MessageEnvelope {
        MessageEnvelope::new([MessageType::DeviceDiscoveryQuery], conversation_id)
            .with_payload(json!({ "query": self.query, "queryType": self.query_type }))
    }

    pub fn from_envelope(env: &MessageEnvelope) -> Result<Self, RouteError> {
        Ok(serde_json::from_value(env.payload.clone())?)
    }
}

/// Wrap a discovery result as the payload of a response envelope.
pub fn query_result_payload(result: &QueryResult) -> Value {
    json!({ "result": result })
}

/// Read a discovery result back from a response envelope.
pub fn query_result_from(env: &MessageEnvelope) -> Result<QueryResult, RouteError> {
    payload_field(env, "result")
}

/// Payload of the LIST_SUPPORTED_PLATFORM_TYPES response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlatformTypesRes {
    pub platform_types: Vec<String>,
}

// ─────────────────────────────────────────────────────────────────────────────
// Observations
// ─────────────────────────────────────────────────────────────────────────────

/// One observation entry. Fields the routing core does not touch are kept
/// verbatim in `extra`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Observation {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub made_by_sensor: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Payload of an OBSERVATION envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObservationPayload {
    pub observations: Vec<Observation>,
}

impl ObservationPayload {
    pub fn from_envelope(env: &MessageEnvelope) -> Result<Self, RouteError> {
        Ok(Self {
            observations: payload_field(env, "observations")?,
        })
    }

    /// Store these observations as `env`'s payload, keeping other payload
    /// fields intact.
    pub fn write_into(&self, env: &mut MessageEnvelope) -> Result<(), RouteError> {
        let observations = serde_json::to_value(&self.observations)?;
        match env.payload.as_object_mut() {
            Some(map) => {
                map.insert("observations".to_string(), observations);
            }
            None => env.payload = json!({ "observations": observations }),
        }
        Ok(())
    }

    /// Point every observation's "made by sensor" at `device_id`.
    pub fn relabel_sensor(&mut self, device_id: &str) {
        for observation in &mut self.observations {
            observation.made_by_sensor = Some(device_id.to_string());
        }
    }

    /// Sensors referenced by these observations.
    pub fn sensors(&self) -> impl Iterator<Item = &str> {
        self.observations.iter().filter_map(|o| o.made_by_sensor.as_deref())
    }
}
