//! [`MessageEnvelope`] – the unit routed by every stage.
//!
//! An envelope carries a set of [`MessageType`] tags, a conversation id that
//! ties a request to all of its asynchronous responses, optional addressing
//! metadata and a payload that the routing core treats as opaque JSON.
//!
//! Tags combine: a bridge answering a subscription sends
//! `{SUBSCRIBE, RESPONSE}`, an error report on a failed registration carries
//! `{PLATFORM_REGISTER, RESPONSE, ERROR}`.

use std::collections::BTreeSet;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::error::RouteError;

/// Message-type tags understood by the control plane.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MessageType {
    PlatformRegister,
    PlatformUpdate,
    PlatformUnregister,
    PlatformCreateDevice,
    PlatformUpdateDevice,
    PlatformDeleteDevice,
    DeviceRegistryInitialize,
    DeviceAddOrUpdate,
    DeviceRemove,
    ListDevices,
    Subscribe,
    Unsubscribe,
    VirtualSubscribe,
    VirtualUnsubscribe,
    Observation,
    Actuation,
    Query,
    DeviceDiscoveryQuery,
    PlatformDiscoveryQuery,
    ListSupportedPlatformTypes,
    Response,
    Error,
    Unrecognized,
    /// Marks synthetic messages produced by startup recovery.
    SysInit,
}

impl MessageType {
    pub fn as_str(self) -> &'static str {
        match self {
            MessageType::PlatformRegister => "PLATFORM_REGISTER",
            MessageType::PlatformUpdate => "PLATFORM_UPDATE",
            MessageType::PlatformUnregister => "PLATFORM_UNREGISTER",
            MessageType::PlatformCreateDevice => "PLATFORM_CREATE_DEVICE",
            MessageType::PlatformUpdateDevice => "PLATFORM_UPDATE_DEVICE",
            MessageType::PlatformDeleteDevice => "PLATFORM_DELETE_DEVICE",
            MessageType::DeviceRegistryInitialize => "DEVICE_REGISTRY_INITIALIZE",
            MessageType::DeviceAddOrUpdate => "DEVICE_ADD_OR_UPDATE",
            MessageType::DeviceRemove => "DEVICE_REMOVE",
            MessageType::ListDevices => "LIST_DEVICES",
            MessageType::Subscribe => "SUBSCRIBE",
            MessageType::Unsubscribe => "UNSUBSCRIBE",
            MessageType::VirtualSubscribe => "VIRTUAL_SUBSCRIBE",
            MessageType::VirtualUnsubscribe => "VIRTUAL_UNSUBSCRIBE",
            MessageType::Observation => "OBSERVATION",
            MessageType::Actuation => "ACTUATION",
            MessageType::Query => "QUERY",
            MessageType::DeviceDiscoveryQuery => "DEVICE_DISCOVERY_QUERY",
            MessageType::PlatformDiscoveryQuery => "PLATFORM_DISCOVERY_QUERY",
            MessageType::ListSupportedPlatformTypes => "LIST_SUPPORTED_PLATFORM_TYPES",
            MessageType::Response => "RESPONSE",
            MessageType::Error => "ERROR",
            MessageType::Unrecognized => "UNRECOGNIZED",
            MessageType::SysInit => "SYS_INIT",
        }
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Diagnostic details attached to `ERROR` envelopes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorInfo {
    /// Catalogue name of the [`ErrorCode`][crate::ErrorCode], or `"N/A"`.
    pub category: String,
    pub description: String,
    /// JSON serialization of the envelope that failed, when available.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub original_message: Option<String>,
}

/// A routed message.
///
/// `conversation_id` must never be empty once an envelope enters the
/// pipeline; [`MessageEnvelope::require_conversation_id`] enforces that at
/// the client boundary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageEnvelope {
    pub message_types: BTreeSet<MessageType>,
    pub conversation_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender_platform_id: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub receiver_platform_ids: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
    /// Subscription being cancelled (UNSUBSCRIBE, VIRTUAL_UNSUBSCRIBE and
    /// their responses). Distinct from the conversation id.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subscription_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorInfo>,
    #[serde(default)]
    pub payload: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
}

/// Generate a fresh conversation id.
pub fn generate_conversation_id() -> String {
    format!("conv{}", Uuid::new_v4())
}

fn generate_message_id() -> String {
    format!("msg{}", Uuid::new_v4())
}

impl MessageEnvelope {
    /// Create an envelope with the given tags and conversation id, a fresh
    /// message id, the current timestamp and a `null` payload.
    pub fn new(
        types: impl IntoIterator<Item = MessageType>,
        conversation_id: impl Into<String>,
    ) -> Self {
        Self {
            message_types: types.into_iter().collect(),
            conversation_id: conversation_id.into(),
            message_id: Some(generate_message_id()),
            sender_platform_id: None,
            receiver_platform_ids: Vec::new(),
            client_id: None,
            subscription_id: None,
            error: None,
            payload: Value::Null,
            timestamp: Some(Utc::now()),
        }
    }

    /// Build the response to `request`: same tags plus `RESPONSE`, same
    /// conversation, client and subscription ids, fresh message id.
    pub fn response_to(request: &MessageEnvelope) -> Self {
        let mut response = Self::new(
            request.message_types.iter().copied(),
            request.conversation_id.clone(),
        );
        response.message_types.insert(MessageType::Response);
        response.message_types.remove(&MessageType::SysInit);
        response.client_id = request.client_id.clone();
        response.subscription_id = request.subscription_id.clone();
        response
    }

    pub fn with_payload(mut self, payload: Value) -> Self {
        self.payload = payload;
        self
    }

    pub fn with_sender(mut self, platform_id: impl Into<String>) -> Self {
        self.sender_platform_id = Some(platform_id.into());
        self
    }

    pub fn with_receiver(mut self, platform_id: impl Into<String>) -> Self {
        self.receiver_platform_ids.push(platform_id.into());
        self
    }

    pub fn with_client(mut self, client_id: impl Into<String>) -> Self {
        self.client_id = Some(client_id.into());
        self
    }

    pub fn with_subscription(mut self, subscription_id: impl Into<String>) -> Self {
        self.subscription_id = Some(subscription_id.into());
        self
    }

    pub fn with_type(mut self, tag: MessageType) -> Self {
        self.message_types.insert(tag);
        self
    }

    pub fn has(&self, tag: MessageType) -> bool {
        self.message_types.contains(&tag)
    }

    pub fn has_any(&self, tags: &[MessageType]) -> bool {
        tags.iter().any(|t| self.message_types.contains(t))
    }

    pub fn is_disjoint(&self, tags: &[MessageType]) -> bool {
        !self.has_any(tags)
    }

    /// The first receiving platform, which is the platform a downstream
    /// message is addressed to.
    pub fn first_receiver(&self) -> Option<&str> {
        self.receiver_platform_ids.first().map(String::as_str)
    }

    /// Return the conversation id or [`RouteError::MissingConversationId`]
    /// when it is empty.
    pub fn require_conversation_id(&self) -> Result<&str, RouteError> {
        if self.conversation_id.is_empty() {
            Err(RouteError::MissingConversationId)
        } else {
            Ok(&self.conversation_id)
        }
    }

    /// Tags joined with `+`, e.g. `SUBSCRIBE+RESPONSE`.
    pub fn describe_types(&self) -> String {
        self.message_types
            .iter()
            .map(|t| t.as_str())
            .collect::<Vec<_>>()
            .join("+")
    }

    /// Shorthand for [`RouteError::UnsupportedMessageType`] naming this
    /// envelope's tags.
    pub fn unsupported(&self) -> RouteError {
        RouteError::UnsupportedMessageType(self.describe_types())
    }

    /// Message id for log lines.
    pub fn log_id(&self) -> &str {
        self.message_id.as_deref().unwrap_or("-")
    }
}
