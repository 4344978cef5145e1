//! Domain models persisted by the registry and carried in payloads.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ─────────────────────────────────────────────────────────────────────────────
// Client
// ─────────────────────────────────────────────────────────────────────────────

/// Serialization used when handing responses to a client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ResponseFormat {
    #[default]
    #[serde(rename = "JSON_LD")]
    JsonLd,
    #[serde(rename = "JSON")]
    Json,
}

impl ResponseFormat {
    /// HTTP content type for push delivery.
    pub fn content_type(self) -> &'static str {
        match self {
            ResponseFormat::JsonLd => "application/ld+json",
            ResponseFormat::Json => "application/json",
        }
    }
}

/// How responses reach a client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ResponseDelivery {
    /// The client polls a private queue.
    #[default]
    ClientPull,
    /// The middleware POSTs batches to the client's callback URL.
    ServerPush,
}

/// An external caller of the middleware.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Client {
    pub client_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub callback_url: Option<String>,
    /// Maximum number of messages per pull or push batch.
    pub receiving_capacity: usize,
    #[serde(default)]
    pub response_format: ResponseFormat,
    #[serde(default)]
    pub response_delivery: ResponseDelivery,
}

impl Client {
    /// A pull-mode client.
    pub fn pull(client_id: impl Into<String>, receiving_capacity: usize) -> Self {
        Self {
            client_id: client_id.into(),
            callback_url: None,
            receiving_capacity,
            response_format: ResponseFormat::JsonLd,
            response_delivery: ResponseDelivery::ClientPull,
        }
    }

    /// A push-mode client delivering to `callback_url`.
    pub fn push(
        client_id: impl Into<String>,
        callback_url: impl Into<String>,
        receiving_capacity: usize,
        response_format: ResponseFormat,
    ) -> Self {
        Self {
            client_id: client_id.into(),
            callback_url: Some(callback_url.into()),
            receiving_capacity,
            response_format,
            response_delivery: ResponseDelivery::ServerPush,
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Platform
// ─────────────────────────────────────────────────────────────────────────────

/// Name and version of a semantic alignment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Alignment {
    pub name: String,
    pub version: String,
}

impl Alignment {
    pub fn new(name: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
        }
    }

    fn is_declared(alignment: &Option<Alignment>) -> bool {
        alignment.as_ref().is_some_and(|a| !a.name.trim().is_empty())
    }
}

/// A registered IoT platform.
///
/// The four optional alignments decide whether messages to and from the
/// platform detour through the translation service.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Platform {
    pub platform_id: String,
    /// Bridge type, e.g. `http://inter-iot.eu/MWTestPlatform`.
    #[serde(rename = "type")]
    pub platform_type: String,
    pub base_endpoint: String,
    #[serde(default)]
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub encrypted_password: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub encryption_algorithm: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time_created: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub downstream_input_alignment: Option<Alignment>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub downstream_output_alignment: Option<Alignment>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub upstream_input_alignment: Option<Alignment>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub upstream_output_alignment: Option<Alignment>,
}

impl fmt::Debug for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Platform")
            .field("platform_id", &self.platform_id)
            .field("platform_type", &self.platform_type)
            .field("base_endpoint", &self.base_endpoint)
            .field("name", &self.name)
            .field("username", &self.username)
            .field(
                "encrypted_password",
                if self.encrypted_password.is_some() { &"<redacted>" } else { &"<not set>" },
            )
            .field("downstream_input_alignment", &self.downstream_input_alignment)
            .field("downstream_output_alignment", &self.downstream_output_alignment)
            .field("upstream_input_alignment", &self.upstream_input_alignment)
            .field("upstream_output_alignment", &self.upstream_output_alignment)
            .finish()
    }
}

impl Platform {
    /// A platform with no credentials and no alignments.
    pub fn new(
        platform_id: impl Into<String>,
        platform_type: impl Into<String>,
        base_endpoint: impl Into<String>,
    ) -> Self {
        Self {
            platform_id: platform_id.into(),
            platform_type: platform_type.into(),
            base_endpoint: base_endpoint.into(),
            name: String::new(),
            location_id: None,
            client_id: None,
            username: None,
            encrypted_password: None,
            encryption_algorithm: None,
            time_created: None,
            downstream_input_alignment: None,
            downstream_output_alignment: None,
            upstream_input_alignment: None,
            upstream_output_alignment: None,
        }
    }

    pub fn has_downstream_alignment(&self) -> bool {
        Alignment::is_declared(&self.downstream_input_alignment)
            || Alignment::is_declared(&self.downstream_output_alignment)
    }

    pub fn has_upstream_alignment(&self) -> bool {
        Alignment::is_declared(&self.upstream_input_alignment)
            || Alignment::is_declared(&self.upstream_output_alignment)
    }

    pub fn has_any_alignment(&self) -> bool {
        self.has_downstream_alignment() || self.has_upstream_alignment()
    }
}

/// Per-platform translation flags kept by the semantic routing stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IpsmRoutingInfo {
    pub use_downstream_translation: bool,
    pub use_upstream_translation: bool,
}

impl IpsmRoutingInfo {
    /// Flags derived from the alignments a platform declares.
    pub fn for_platform(platform: &Platform) -> Self {
        Self {
            use_downstream_translation: platform.has_downstream_alignment(),
            use_upstream_translation: platform.has_upstream_alignment(),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Devices
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DeviceType {
    Device,
    Sensor,
    Actuator,
}

impl DeviceType {
    pub fn as_str(self) -> &'static str {
        match self {
            DeviceType::Device => "DEVICE",
            DeviceType::Sensor => "SENSOR",
            DeviceType::Actuator => "ACTUATOR",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_uppercase().as_str() {
            "DEVICE" => Some(DeviceType::Device),
            "SENSOR" => Some(DeviceType::Sensor),
            "ACTUATOR" => Some(DeviceType::Actuator),
            _ => None,
        }
    }
}

/// A device hosted by a platform.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IoTDevice {
    pub device_id: String,
    /// Id of the hosting platform.
    pub hosted_by: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
    #[serde(default)]
    pub device_types: BTreeSet<DeviceType>,
}

impl IoTDevice {
    pub fn new(device_id: impl Into<String>, hosted_by: impl Into<String>) -> Self {
        Self {
            device_id: device_id.into(),
            hosted_by: hosted_by.into(),
            name: None,
            location: None,
            device_types: BTreeSet::from([DeviceType::Device]),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Subscriptions
// ─────────────────────────────────────────────────────────────────────────────

/// A client's subscription to a list of devices.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Subscription {
    pub conversation_id: String,
    pub client_id: String,
    pub device_ids: Vec<String>,
}

/// "Target platform should see source device's observations as its own."
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Plat2PlatSubscription {
    pub conversation_id: String,
    pub client_id: String,
    pub source_platform_id: String,
    pub source_device_id: String,
    pub target_platform_id: String,
    pub target_device_id: String,
}

// ─────────────────────────────────────────────────────────────────────────────
// Discovery queries
// ─────────────────────────────────────────────────────────────────────────────

/// Result shape requested from a discovery query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum QueryType {
    Construct,
    #[default]
    Select,
    Ask,
}

/// Outcome of a discovery query, in whichever shape the query produced.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum QueryResult {
    /// Full records of the matching devices.
    ConstructResult(Vec<IoTDevice>),
    /// One attribute row per matching device.
    SelectResult(Vec<BTreeMap<String, String>>),
    /// Whether any device matched.
    AskResult(bool),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn platform_without_alignments_disables_translation() {
        let platform = Platform::new("http://p1", "http://inter-iot.eu/MWTestPlatform", "http://localhost");
        assert!(!platform.has_any_alignment());
        assert_eq!(IpsmRoutingInfo::for_platform(&platform), IpsmRoutingInfo::default());
    }

    #[test]
    fn blank_alignment_name_does_not_count() {
        let mut platform = Platform::new("p", "t", "e");
        platform.upstream_output_alignment = Some(Alignment::new("  ", "1.0"));
        assert!(!platform.has_upstream_alignment());

        platform.upstream_output_alignment = Some(Alignment::new("CO_FIWARE_align", "0.3"));
        let info = IpsmRoutingInfo::for_platform(&platform);
        assert!(info.use_upstream_translation);
        assert!(!info.use_downstream_translation);
    }

    #[test]
    fn platform_debug_redacts_password() {
        let mut platform = Platform::new("p", "t", "e");
        platform.encrypted_password = Some("hunter2".into());
        let debug = format!("{platform:?}");
        assert!(!debug.contains("hunter2"));
        assert!(debug.contains("<redacted>"));
    }

    #[test]
    fn client_enums_use_wire_names() {
        let client = Client::push("c1", "http://localhost:9000/cb", 5, ResponseFormat::Json);
        let json = serde_json::to_value(&client).unwrap();
        assert_eq!(json["responseFormat"], "JSON");
        assert_eq!(json["responseDelivery"], "SERVER_PUSH");
        assert_eq!(ResponseFormat::JsonLd.content_type(), "application/ld+json");
    }

    #[test]
    fn device_type_parse_is_case_insensitive() {
        assert_eq!(DeviceType::parse("sensor"), Some(DeviceType::Sensor));
        assert_eq!(DeviceType::parse("thermostat"), None);
    }
}
