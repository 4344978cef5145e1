//! `intermesh-semantic` – The semantic routing stage.
//!
//! Sits between platform routing and the bridges and decides, per platform
//! and per direction, whether a message detours through the translation
//! service before reaching its destination.
//!
//! # Modules
//!
//! - [`stage`] – [`SemanticRoutingStage`]: the per-platform routing table,
//!   downstream and upstream dispatch, translation return listeners.
//! - [`translation`] – the [`TranslationService`] seam, [`TranslationError`]
//!   and [`NoopTranslation`] for deployments without translation.
//! - [`ipsm`] – [`IpsmApiClient`], the HTTP client that reconciles
//!   translation channels against a platform's declared alignments.

pub mod ipsm;
pub mod stage;
pub mod translation;

pub use ipsm::{ChannelAction, ChannelInfo, ChannelInput, IpsmApiClient};
pub use stage::SemanticRoutingStage;
pub use translation::{NoopTranslation, TranslationError, TranslationService};
