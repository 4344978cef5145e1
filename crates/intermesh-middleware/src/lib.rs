//! `intermesh-middleware` – The transport plumbing.
//!
//! Moves envelopes between stages without caring about their meaning.
//!
//! # Modules
//!
//! - [`bus`] – [`MessageBus`] trait and the in-process [`TopicBus`] built on
//!   bounded Tokio mpsc queues, one per subscriber.
//! - [`listener`] – Spawning per-topic listener tasks and stopping them in
//!   groups.
//! - [`reporter`] – [`ErrorReporter`], which turns handler failures into
//!   error envelopes.

pub mod bus;
pub mod listener;
pub mod reporter;

pub use bus::{EnvelopeStream, MessageBus, TopicBus};
pub use listener::{ListenerGroup, spawn_listener};
pub use reporter::ErrorReporter;
