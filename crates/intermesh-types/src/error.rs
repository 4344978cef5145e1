//! Error kinds shared by every stage.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// What kind of entity a [`RouteError::NotRegistered`] or
/// [`RouteError::AlreadyRegistered`] refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntityKind {
    Platform,
    Client,
    Device,
    Subscription,
    Bridge,
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EntityKind::Platform => write!(f, "platform"),
            EntityKind::Client => write!(f, "client"),
            EntityKind::Device => write!(f, "device"),
            EntityKind::Subscription => write!(f, "subscription"),
            EntityKind::Bridge => write!(f, "bridge"),
        }
    }
}

/// Closed set of failures a routing stage can produce.
///
/// Collaborator-specific errors (registry, translation service, bridges)
/// convert into [`RouteError::Middleware`] unless they map onto one of the
/// registration kinds.
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RouteError {
    #[error("message has no conversation id")]
    MissingConversationId,

    #[error("{kind} '{id}' is not registered")]
    NotRegistered { kind: EntityKind, id: String },

    #[error("{kind} '{id}' is already registered")]
    AlreadyRegistered { kind: EntityKind, id: String },

    #[error("unsupported message type {0}")]
    UnsupportedMessageType(String),

    #[error("middleware error: {0}")]
    Middleware(String),

    #[error("transport error: {0}")]
    Transport(String),
}

impl RouteError {
    pub fn not_registered(kind: EntityKind, id: impl Into<String>) -> Self {
        RouteError::NotRegistered { kind, id: id.into() }
    }

    pub fn already_registered(kind: EntityKind, id: impl Into<String>) -> Self {
        RouteError::AlreadyRegistered { kind, id: id.into() }
    }
}

impl From<serde_json::Error> for RouteError {
    fn from(e: serde_json::Error) -> Self {
        RouteError::Middleware(format!("malformed payload: {e}"))
    }
}

/// Numeric error catalogue attached to every error envelope.
///
/// | Code | Name |
/// |---|---|
/// | 1 | `NO_CONFIG` |
/// | 2 | `NO_CONFIG_PROPERTY` |
/// | 4 | `CONTEXT_EXCEPTION` |
/// | 5 | `UNSUPPORTED_ACTION_EXCEPTION` |
/// | 6 | `ILLEGAL_ACTION_EXCEPTION` |
/// | 7 | `UNKNOWN_ACTION_EXCEPTION` |
/// | 8 | `CANNOT_CREATE_COMPONENT` |
/// | 9 | `CANNOT_DESTROY_COMPONENT` |
/// | 10 | `CANNOT_PUBLISH_MESSAGE_UPSTREAM` |
/// | 11 | `CANNOT_PUBLISH_MESSAGE_DOWNSTREAM` |
/// | 12 | `CANNOT_PUBLISH_MESSAGE_TO_SERVICES` |
/// | 13 | `PLATFORMID_URI_NOT_VALID` |
/// | 14 | `ERROR_HANDLING_RECEIVED_MESSAGE` |
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    NoConfig,
    NoConfigProperty,
    ContextException,
    UnsupportedActionException,
    IllegalActionException,
    UnknownActionException,
    CannotCreateComponent,
    CannotDestroyComponent,
    CannotPublishMessageUpstream,
    CannotPublishMessageDownstream,
    CannotPublishMessageToServices,
    #[serde(rename = "PLATFORMID_URI_NOT_VALID")]
    PlatformIdUriNotValid,
    ErrorHandlingReceivedMessage,
}

impl ErrorCode {
    pub fn code(self) -> u32 {
        match self {
            ErrorCode::NoConfig => 1,
            ErrorCode::NoConfigProperty => 2,
            ErrorCode::ContextException => 4,
            ErrorCode::UnsupportedActionException => 5,
            ErrorCode::IllegalActionException => 6,
            ErrorCode::UnknownActionException => 7,
            ErrorCode::CannotCreateComponent => 8,
            ErrorCode::CannotDestroyComponent => 9,
            ErrorCode::CannotPublishMessageUpstream => 10,
            ErrorCode::CannotPublishMessageDownstream => 11,
            ErrorCode::CannotPublishMessageToServices => 12,
            ErrorCode::PlatformIdUriNotValid => 13,
            ErrorCode::ErrorHandlingReceivedMessage => 14,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            ErrorCode::NoConfig => "NO_CONFIG",
            ErrorCode::NoConfigProperty => "NO_CONFIG_PROPERTY",
            ErrorCode::ContextException => "CONTEXT_EXCEPTION",
            ErrorCode::UnsupportedActionException => "UNSUPPORTED_ACTION_EXCEPTION",
            ErrorCode::IllegalActionException => "ILLEGAL_ACTION_EXCEPTION",
            ErrorCode::UnknownActionException => "UNKNOWN_ACTION_EXCEPTION",
            ErrorCode::CannotCreateComponent => "CANNOT_CREATE_COMPONENT",
            ErrorCode::CannotDestroyComponent => "CANNOT_DESTROY_COMPONENT",
            ErrorCode::CannotPublishMessageUpstream => "CANNOT_PUBLISH_MESSAGE_UPSTREAM",
            ErrorCode::CannotPublishMessageDownstream => "CANNOT_PUBLISH_MESSAGE_DOWNSTREAM",
            ErrorCode::CannotPublishMessageToServices => "CANNOT_PUBLISH_MESSAGE_TO_SERVICES",
            ErrorCode::PlatformIdUriNotValid => "PLATFORMID_URI_NOT_VALID",
            ErrorCode::ErrorHandlingReceivedMessage => "ERROR_HANDLING_RECEIVED_MESSAGE",
        }
    }

    pub fn description(self) -> &'static str {
        match self {
            ErrorCode::NoConfig => "No configuration registered",
            ErrorCode::NoConfigProperty => "A mandatory configuration property is missing",
            ErrorCode::ContextException => "There is an error while creating the context",
            ErrorCode::UnsupportedActionException => {
                "The requested action is legal but currently not supported"
            }
            ErrorCode::IllegalActionException => {
                "The requested action is not legal for the component addressed"
            }
            ErrorCode::UnknownActionException => {
                "The action requested is labelled as unknown and thus is not processable by the component"
            }
            ErrorCode::CannotCreateComponent => "Cannot create the desired component",
            ErrorCode::CannotDestroyComponent => "Cannot destroy the desired component",
            ErrorCode::CannotPublishMessageUpstream => {
                "Cannot publish the message to the desired component going upstream"
            }
            ErrorCode::CannotPublishMessageDownstream => {
                "Cannot publish the message to the desired component going downstream"
            }
            ErrorCode::CannotPublishMessageToServices => "Cannot publish the message to services",
            ErrorCode::PlatformIdUriNotValid => "The platform identifier is not a valid URI",
            ErrorCode::ErrorHandlingReceivedMessage => "Error while handling received message",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.name(), self.code())
    }
}
