//! `intermesh-bridge` – The platform-facing edge.
//!
//! A bridge turns envelopes into native platform calls and back. The routing
//! core only ever talks to the [`BridgeAdapter`] trait, so adapters for new
//! platform types plug in without touching the stages.
//!
//! # Modules
//!
//! - [`adapter`] – [`BridgeAdapter`] trait, [`BridgeContext`],
//!   [`BridgeConfiguration`] and [`BridgeError`].
//! - [`controller`] – [`BridgeController`]: registration gating, per-tag
//!   dispatch and response publishing for one platform.
//! - [`factory`] – [`BridgeFactoryTable`]: platform type → constructor, built
//!   at startup.
//! - [`manager`] – [`BridgeManager`]: creates, wires and tears down one
//!   controller per registered platform.
//! - [`test_bridge`] – [`TestBridge`], an in-process platform emitting
//!   synthetic observations.

pub mod adapter;
pub mod controller;
pub mod factory;
pub mod manager;
pub mod test_bridge;

pub use adapter::{BridgeAdapter, BridgeConfiguration, BridgeContext, BridgeError, BridgePublisher};
pub use controller::BridgeController;
pub use factory::{BridgeFactory, BridgeFactoryTable};
pub use manager::BridgeManager;
pub use test_bridge::TestBridge;
