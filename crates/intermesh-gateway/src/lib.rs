//! `intermesh-gateway` – The client-facing routing stage.
//!
//! Clients talk to the middleware through [`ClientGateway`]: requests go
//! downstream on `arm_prm`, and everything coming back on `prm_arm` is
//! matched to the client that opened the conversation.
//!
//! # Modules
//!
//! - [`gateway`] – [`ClientGateway`]: correlation tables, downstream
//!   publishing, the upstream listener, subscription helpers and startup
//!   restore from the registry.
//! - [`callback`] – [`ApiCallback`] and its two implementations:
//!   [`PullCallback`] (bounded queue drained by the client) and
//!   [`PushCallback`] (HTTP POST worker with unbounded retry).
//! - [`response`] – JSON and JSON-LD serialization of delivered envelopes.
//! - [`query_cache`] – [`QueryCache`], the TTL map holding QUERY responses
//!   for synchronous callers.

pub mod callback;
pub mod gateway;
pub mod query_cache;
pub mod response;

pub use callback::{ApiCallback, DeliveryError, PullCallback, PushCallback, PushSettings};
pub use gateway::{ClientGateway, GatewayConfig};
pub use query_cache::QueryCache;
pub use response::serialize_response;
