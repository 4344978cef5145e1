//! `intermesh-platform` – The platform routing stage.
//!
//! The stage closest to the platforms' control plane: it owns bridge
//! lifecycle, keeps the registry in step with platform and device changes,
//! answers discovery queries locally and implements virtual (platform to
//! platform) subscriptions by rewriting observations in flight.
//!
//! # Modules
//!
//! - [`stage`] – [`PlatformRoutingStage`]: downstream and upstream dispatch,
//!   virtual-subscription tables and startup recovery.

pub mod stage;

pub use stage::PlatformRoutingStage;
