//! `intermesh-registry` – Durable control-plane state.
//!
//! Platforms, devices, client subscriptions, virtual subscriptions and
//! client records live here so that the routing stages can rebuild their
//! in-memory tables after a restart.
//!
//! # Modules
//!
//! - [`store`] – the [`Registry`] trait every stage talks to, and
//!   [`RegistryError`].
//! - [`memory`] – [`InMemoryRegistry`], lock-guarded maps for tests and
//!   ephemeral deployments.
//! - [`sqlite`] – [`SqliteRegistry`], the persistent backend.
//! - [`query`] – [`DeviceFilter`], the `key=value&...` device discovery
//!   language behind [`Registry::execute_query`].

pub mod memory;
pub mod query;
pub mod sqlite;
pub mod store;

pub use memory::InMemoryRegistry;
pub use query::DeviceFilter;
pub use sqlite::SqliteRegistry;
pub use store::{Registry, RegistryError};
