//! `intermesh-types` – Shared vocabulary of the routing control plane.
//!
//! Every stage (client gateway, semantic routing, platform routing) and every
//! bridge speaks in terms of the types defined here and nothing else.
//!
//! # Modules
//!
//! - [`envelope`] – [`MessageEnvelope`], the unit routed by every stage, and
//!   its [`MessageType`] tags.
//! - [`model`] – Clients, platforms, devices and subscriptions.
//! - [`request`] – Typed views over envelope payloads (subscribe requests,
//!   observations, discovery queries, …).
//! - [`error`] – [`RouteError`], the closed set of failures a stage can
//!   report, and the numeric [`ErrorCode`] catalogue.
//! - [`topic`] – Deterministic topic naming for the message bus.

pub mod envelope;
pub mod error;
pub mod model;
pub mod request;
pub mod topic;

pub use envelope::{ErrorInfo, MessageEnvelope, MessageType, generate_conversation_id};
pub use error::{EntityKind, ErrorCode, RouteError};
pub use model::{
    Alignment, Client, DeviceType, IoTDevice, IpsmRoutingInfo, Plat2PlatSubscription, Platform,
    QueryResult, QueryType, ResponseDelivery, ResponseFormat, Subscription,
};
pub use topic::BrokerTopic;
