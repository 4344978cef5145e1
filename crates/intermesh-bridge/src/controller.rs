//! [`BridgeController`] – per-platform gatekeeper in front of an adapter.
//!
//! | Situation | Outcome |
//! |---|---|
//! | Any tag other than `PLATFORM_REGISTER` before registration | [`RouteError::NotRegistered`] |
//! | `PLATFORM_REGISTER` while registered | [`RouteError::AlreadyRegistered`] |
//! | `OBSERVATION`, `ERROR`, `UNRECOGNIZED` | handled, no response |
//! | Any other known tag | adapter response published on `bridge_ipsmrm_<pid>` |
//!
//! Failures are reported through the [`ErrorReporter`] toward the semantic
//! routing stage; the controller never propagates them to the listener.

use std::sync::atomic::{AtomicBool, Ordering};

use intermesh_middleware::ErrorReporter;
use intermesh_types::{EntityKind, ErrorCode, MessageEnvelope, MessageType, RouteError};
use tracing::{debug, error};

use crate::adapter::{BridgeAdapter, BridgePublisher};

pub struct BridgeController {
    adapter: Box<dyn BridgeAdapter>,
    publisher: BridgePublisher,
    reporter: ErrorReporter,
    registered: AtomicBool,
}

impl BridgeController {
    pub fn new(adapter: Box<dyn BridgeAdapter>, publisher: BridgePublisher, reporter: ErrorReporter) -> Self {
        Self {
            adapter,
            publisher,
            reporter,
            registered: AtomicBool::new(false),
        }
    }

    pub fn platform_id(&self) -> &str {
        self.publisher.platform_id()
    }

    pub fn is_registered(&self) -> bool {
        self.registered.load(Ordering::SeqCst)
    }

    /// Handle one downstream envelope.
    pub async fn process(&self, msg: MessageEnvelope) {
        debug!(
            platform_id = %self.platform_id(),
            conversation_id = %msg.conversation_id,
            message_types = %msg.describe_types(),
            "bridge received message"
        );
        if let Err(e) = self.try_process(&msg).await {
            error!(
                platform_id = %self.platform_id(),
                message_id = %msg.log_id(),
                error = %e,
                "bridge failed to process message"
            );
            let description = format!(
                "Bridge failed to process message {} of type {} for the platform {}.",
                msg.log_id(),
                msg.describe_types(),
                self.platform_id()
            );
            self.reporter
                .report_with(
                    &msg,
                    &e,
                    ErrorCode::ErrorHandlingReceivedMessage,
                    Some(&description),
                    Some(self.publisher.topic()),
                )
                .await;
        }
    }

    async fn try_process(&self, msg: &MessageEnvelope) -> Result<(), RouteError> {
        let registering = msg.has(MessageType::PlatformRegister);
        let registered = self.is_registered();
        if !registered && !registering {
            return Err(RouteError::not_registered(EntityKind::Platform, self.platform_id()));
        }
        if registered && registering {
            return Err(RouteError::already_registered(EntityKind::Platform, self.platform_id()));
        }

        let response = self.dispatch(msg).await?;
        if let Some(response) = response {
            self.publisher.publish(response).await?;
        }
        Ok(())
    }

    async fn dispatch(&self, msg: &MessageEnvelope) -> Result<Option<MessageEnvelope>, RouteError> {
        let adapter = &self.adapter;
        let response = if msg.has(MessageType::PlatformRegister) {
            let response = adapter.register_platform(msg).await?;
            self.registered.store(true, Ordering::SeqCst);
            response
        } else if msg.has(MessageType::PlatformUpdate) {
            adapter.update_platform(msg).await?
        } else if msg.has(MessageType::PlatformUnregister) {
            let response = adapter.unregister_platform(msg).await?;
            self.registered.store(false, Ordering::SeqCst);
            response
        } else if msg.has(MessageType::Subscribe) {
            adapter.subscribe(msg).await?
        } else if msg.has(MessageType::Unsubscribe) {
            adapter.unsubscribe(msg).await?
        } else if msg.has(MessageType::Query) {
            adapter.query(msg).await?
        } else if msg.has(MessageType::ListDevices) {
            adapter.list_devices(msg).await?
        } else if msg.has(MessageType::PlatformCreateDevice) {
            adapter.platform_create_devices(msg).await?
        } else if msg.has(MessageType::PlatformUpdateDevice) {
            adapter.platform_update_devices(msg).await?
        } else if msg.has(MessageType::PlatformDeleteDevice) {
            adapter.platform_delete_devices(msg).await?
        } else if msg.has(MessageType::Observation) {
            adapter.observe(msg).await?;
            return Ok(None);
        } else if msg.has(MessageType::Actuation) {
            adapter.actuate(msg).await?
        } else if msg.has(MessageType::Error) {
            return Ok(adapter.error(msg).await?);
        } else if msg.has(MessageType::DeviceDiscoveryQuery) {
            MessageEnvelope::response_to(msg)
        } else if msg.has(MessageType::Unrecognized) {
            return Ok(adapter.unrecognized(msg).await?);
        } else {
            return Err(msg.unsupported());
        };
        Ok(Some(response))
    }

    /// Stop the adapter's background work.
    pub async fn shutdown(&self) {
        self.adapter.shutdown().await;
    }
}
