//! [`ErrorReporter`] – the recovery boundary's outlet.
//!
//! Every per-message handler that fails hands its error here. The reporter
//! turns it into an error envelope that keeps the original conversation id
//! and tags (plus `RESPONSE` and `ERROR`), publishes it toward the caller
//! when an upstream topic is given, and always publishes a copy to the
//! `error` topic.
//!
//! Reporting never fails: a publish failure upstream downgrades to a
//! fallback `CANNOT_PUBLISH_MESSAGE_UPSTREAM` envelope on the `error` topic,
//! and a failure on the `error` topic itself is only logged.

use std::sync::Arc;

use intermesh_types::{
    BrokerTopic, ErrorCode, ErrorInfo, MessageEnvelope, MessageType, RouteError,
    generate_conversation_id,
};
use tracing::{debug, error, warn};

/// Publishes error envelopes on behalf of a stage.
#[derive(Clone)]
pub struct ErrorReporter {
    bus: Arc<dyn crate::MessageBus>,
    /// Stage name used in log lines, e.g. `"prm"`.
    component: &'static str,
}

impl ErrorReporter {
    pub fn new(bus: Arc<dyn crate::MessageBus>, component: &'static str) -> Self {
        Self { bus, component }
    }

    /// Build the error envelope for `original` without publishing it.
    pub fn error_envelope(
        original: &MessageEnvelope,
        err: &RouteError,
        code: ErrorCode,
        description: Option<&str>,
    ) -> MessageEnvelope {
        let conversation_id = match original.require_conversation_id() {
            Ok(id) => id.to_string(),
            Err(_) => generate_conversation_id(),
        };
        let mut envelope = MessageEnvelope::new(original.message_types.iter().copied(), conversation_id)
            .with_type(MessageType::Response)
            .with_type(MessageType::Error);
        envelope.client_id = original.client_id.clone();
        envelope.subscription_id = original.subscription_id.clone();
        envelope.sender_platform_id = original.sender_platform_id.clone();
        envelope.receiver_platform_ids = original.receiver_platform_ids.clone();

        let mut lines = vec![code.description().to_string()];
        if let Some(d) = description {
            lines.push(d.to_string());
        }
        lines.push(err.to_string());

        envelope.error = Some(ErrorInfo {
            category: code.name().to_string(),
            description: lines.join("\n"),
            original_message: serde_json::to_string(original).ok(),
        });
        envelope
    }

    /// Report `err` raised while handling `original`.
    ///
    /// `upstream` is the topic leading back toward the client gateway, when
    /// one is meaningful for the failing stage.
    pub async fn report(
        &self,
        original: &MessageEnvelope,
        err: &RouteError,
        code: ErrorCode,
        upstream: Option<&str>,
    ) {
        self.report_with(original, err, code, None, upstream).await;
    }

    /// Like [`report`](Self::report) with an extra human-readable line.
    pub async fn report_with(
        &self,
        original: &MessageEnvelope,
        err: &RouteError,
        code: ErrorCode,
        description: Option<&str>,
        upstream: Option<&str>,
    ) {
        warn!(
            component = self.component,
            conversation_id = %original.conversation_id,
            message_id = %original.log_id(),
            message_types = %original.describe_types(),
            error = %err,
            "failed to handle message"
        );
        let envelope = Self::error_envelope(original, err, code, description);

        let upstream_failure = match upstream {
            Some(topic) => self.bus.publish(topic, envelope.clone()).await.err().map(|e| (topic, e)),
            None => None,
        };
        if let Some((topic, e)) = upstream_failure {
            error!(
                component = self.component,
                topic = %topic,
                message_id = %envelope.log_id(),
                error = %e,
                "failed to publish error message upstream"
            );
            let fallback_code = ErrorCode::CannotPublishMessageUpstream;
            let mut fallback = MessageEnvelope::new([MessageType::Error], envelope.conversation_id.clone());
            fallback.error = Some(ErrorInfo {
                category: fallback_code.name().to_string(),
                description: fallback_code.description().to_string(),
                original_message: None,
            });
            self.publish_to_error_topic(fallback).await;
        }

        self.publish_to_error_topic(envelope).await;
    }

    async fn publish_to_error_topic(&self, envelope: MessageEnvelope) {
        debug!(component = self.component, message_id = %envelope.log_id(), "publishing to error topic");
        if let Err(e) = self.bus.publish(BrokerTopic::Error.name(), envelope).await {
            error!(component = self.component, error = %e, "failed to publish to error topic");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::{MessageBus, TopicBus};
    use futures_util::StreamExt;
    use std::time::Duration;

    fn original() -> MessageEnvelope {
        MessageEnvelope::new([MessageType::PlatformRegister], "conv-err")
            .with_client("client-a")
            .with_receiver("http://p1")
    }

    #[test]
    fn error_envelope_keeps_conversation_and_tags() {
        let err = RouteError::Middleware("bridge creation failed".into());
        let env = ErrorReporter::error_envelope(&original(), &err, ErrorCode::CannotCreateComponent, None);

        assert_eq!(env.conversation_id, "conv-err");
        assert!(env.has(MessageType::PlatformRegister));
        assert!(env.has(MessageType::Response));
        assert!(env.has(MessageType::Error));
        assert_eq!(env.client_id.as_deref(), Some("client-a"));

        let info = env.error.expect("error info");
        assert_eq!(info.category, "CANNOT_CREATE_COMPONENT");
        assert!(info.description.contains("bridge creation failed"));
        assert!(info.original_message.unwrap().contains("conv-err"));
    }

    #[test]
    fn error_envelope_for_missing_conversation_gets_fresh_id() {
        let original = MessageEnvelope::new([MessageType::Query], "");
        let env = ErrorReporter::error_envelope(
            &original,
            &RouteError::MissingConversationId,
            ErrorCode::ErrorHandlingReceivedMessage,
            None,
        );
        assert!(!env.conversation_id.is_empty());
    }

    #[tokio::test]
    async fn report_publishes_upstream_and_to_error_topic() {
        let bus = Arc::new(TopicBus::default());
        let mut upstream = bus.subscribe("prm_arm");
        let mut errors = bus.subscribe("error");
        let reporter = ErrorReporter::new(bus.clone(), "test");

        reporter
            .report(&original(), &RouteError::Transport("down".into()), ErrorCode::ErrorHandlingReceivedMessage, Some("prm_arm"))
            .await;

        let up = tokio::time::timeout(Duration::from_secs(1), upstream.next()).await.unwrap().unwrap();
        let copy = tokio::time::timeout(Duration::from_secs(1), errors.next()).await.unwrap().unwrap();
        assert_eq!(up.conversation_id, "conv-err");
        assert_eq!(copy.message_id, up.message_id, "error topic receives a copy of the same envelope");
    }

    #[tokio::test]
    async fn upstream_failure_falls_back_to_low_detail_error() {
        let bus = Arc::new(TopicBus::default());
        let mut errors = bus.subscribe("error");
        let reporter = ErrorReporter::new(bus.clone(), "test");

        // Nobody listens on prm_arm, so the upstream publish fails.
        reporter
            .report(&original(), &RouteError::Middleware("boom".into()), ErrorCode::ErrorHandlingReceivedMessage, Some("prm_arm"))
            .await;

        let fallback = errors.next().await.unwrap();
        assert_eq!(
            fallback.error.as_ref().map(|e| e.category.as_str()),
            Some("CANNOT_PUBLISH_MESSAGE_UPSTREAM")
        );
        assert!(fallback.error.unwrap().original_message.is_none());

        let full = errors.next().await.unwrap();
        assert_eq!(full.error.unwrap().category, "ERROR_HANDLING_RECEIVED_MESSAGE");
    }

    #[tokio::test]
    async fn report_with_no_listeners_anywhere_does_not_panic() {
        let bus = Arc::new(TopicBus::default());
        let reporter = ErrorReporter::new(bus, "test");
        reporter
            .report(&original(), &RouteError::MissingConversationId, ErrorCode::ErrorHandlingReceivedMessage, None)
            .await;
    }
}
