//! The [`BridgeAdapter`] trait and what an adapter is built from.
//!
//! Adapters implement one method per message tag. Every method that answers
//! returns the response envelope; the [`BridgeController`][crate::BridgeController]
//! stamps the sender platform and publishes it. Messages an adapter emits on
//! its own (observations, device registry updates) go through the
//! [`BridgePublisher`] handed to it in its [`BridgeContext`].

use std::collections::BTreeMap;
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use intermesh_middleware::MessageBus;
use intermesh_types::{BrokerTopic, MessageEnvelope, Platform, RouteError};
use thiserror::Error;

/// Errors raised by bridge adapters.
#[derive(Error, Debug)]
pub enum BridgeError {
    #[error("invalid bridge configuration: {0}")]
    Configuration(String),
    #[error("invalid message: {0}")]
    InvalidMessage(String),
    #[error("platform call failed: {0}")]
    Platform(String),
    #[error(transparent)]
    Route(#[from] RouteError),
}

impl From<BridgeError> for RouteError {
    fn from(e: BridgeError) -> Self {
        match e {
            BridgeError::Route(inner) => inner,
            other => RouteError::Middleware(format!("bridge: {other}")),
        }
    }
}

/// String properties configured for a platform type.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BridgeConfiguration {
    properties: BTreeMap<String, String>,
}

impl BridgeConfiguration {
    pub fn new(properties: BTreeMap<String, String>) -> Self {
        Self { properties }
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.properties.get(key).map(String::as_str)
    }

    /// Parse property `key`, falling back to `default` when it is absent.
    ///
    /// # Errors
    ///
    /// [`BridgeError::Configuration`] when the property is present but does
    /// not parse.
    pub fn parse_or<T: FromStr>(&self, key: &str, default: T) -> Result<T, BridgeError> {
        match self.get(key) {
            None => Ok(default),
            Some(raw) => raw
                .trim()
                .parse()
                .map_err(|_| BridgeError::Configuration(format!("property '{key}' has invalid value '{raw}'"))),
        }
    }
}

/// Publishes adapter-initiated messages upstream on
/// `bridge_ipsmrm_<platform id>`.
#[derive(Clone)]
pub struct BridgePublisher {
    bus: Arc<dyn MessageBus>,
    topic: String,
    platform_id: String,
}

impl BridgePublisher {
    pub fn new(bus: Arc<dyn MessageBus>, platform_id: &str) -> Self {
        Self {
            bus,
            topic: BrokerTopic::BridgeIpsmrm.for_platform(platform_id),
            platform_id: platform_id.to_string(),
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn platform_id(&self) -> &str {
        &self.platform_id
    }

    /// Stamp `envelope` as sent by this platform and publish it upstream.
    pub async fn publish(&self, mut envelope: MessageEnvelope) -> Result<(), RouteError> {
        envelope.sender_platform_id = Some(self.platform_id.clone());
        self.bus.publish(&self.topic, envelope).await
    }
}

/// Everything an adapter is constructed from.
#[derive(Clone)]
pub struct BridgeContext {
    pub configuration: BridgeConfiguration,
    pub platform: Platform,
    pub publisher: BridgePublisher,
}

/// A platform-specific adapter.
///
/// The controller guarantees that `register_platform` is the first call an
/// adapter sees and that it is never called twice without an
/// `unregister_platform` in between.
#[async_trait]
pub trait BridgeAdapter: Send + Sync {
    async fn register_platform(&self, msg: &MessageEnvelope) -> Result<MessageEnvelope, BridgeError>;
    async fn update_platform(&self, msg: &MessageEnvelope) -> Result<MessageEnvelope, BridgeError>;
    async fn unregister_platform(&self, msg: &MessageEnvelope) -> Result<MessageEnvelope, BridgeError>;

    async fn subscribe(&self, msg: &MessageEnvelope) -> Result<MessageEnvelope, BridgeError>;
    async fn unsubscribe(&self, msg: &MessageEnvelope) -> Result<MessageEnvelope, BridgeError>;

    async fn query(&self, msg: &MessageEnvelope) -> Result<MessageEnvelope, BridgeError>;
    async fn list_devices(&self, msg: &MessageEnvelope) -> Result<MessageEnvelope, BridgeError>;

    async fn platform_create_devices(&self, msg: &MessageEnvelope) -> Result<MessageEnvelope, BridgeError>;
    async fn platform_update_devices(&self, msg: &MessageEnvelope) -> Result<MessageEnvelope, BridgeError>;
    async fn platform_delete_devices(&self, msg: &MessageEnvelope) -> Result<MessageEnvelope, BridgeError>;

    /// Consume an observation addressed to this platform. Produces no
    /// response.
    async fn observe(&self, msg: &MessageEnvelope) -> Result<(), BridgeError>;
    async fn actuate(&self, msg: &MessageEnvelope) -> Result<MessageEnvelope, BridgeError>;

    async fn error(&self, _msg: &MessageEnvelope) -> Result<Option<MessageEnvelope>, BridgeError> {
        Ok(None)
    }

    async fn unrecognized(&self, _msg: &MessageEnvelope) -> Result<Option<MessageEnvelope>, BridgeError> {
        Ok(None)
    }

    /// Stop background work. Called once when the bridge is removed.
    async fn shutdown(&self) {}
}
