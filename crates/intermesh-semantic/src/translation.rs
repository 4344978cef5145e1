//! The translation-service seam.
//!
//! A platform that declares alignments has its data-plane traffic detour
//! through a translation channel per direction. The stage only asks the
//! service to set those channels up and tear them down; the translated
//! messages come back on the `ipsm-mw-*` topics.

use async_trait::async_trait;
use intermesh_types::{Platform, RouteError};
use thiserror::Error;
use tracing::debug;

/// Errors reported by a translation service.
#[derive(Error, Debug)]
pub enum TranslationError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("translation service answered {status}: {body}")]
    Status { status: u16, body: String },
}

impl From<TranslationError> for RouteError {
    fn from(e: TranslationError) -> Self {
        RouteError::Middleware(format!("translation service: {e}"))
    }
}

#[async_trait]
pub trait TranslationService: Send + Sync {
    /// Make the channels of `platform` match its declared alignments.
    async fn setup_channels_for_platform(&self, platform: &Platform) -> Result<(), TranslationError>;

    /// Remove every channel belonging to `platform_id`.
    async fn remove_channels_for_platform(&self, platform_id: &str) -> Result<(), TranslationError>;
}

/// Used when no translation service is configured: every call succeeds and
/// does nothing.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopTranslation;

#[async_trait]
impl TranslationService for NoopTranslation {
    async fn setup_channels_for_platform(&self, platform: &Platform) -> Result<(), TranslationError> {
        debug!(platform_id = %platform.platform_id, "translation disabled; no channels set up");
        Ok(())
    }

    async fn remove_channels_for_platform(&self, platform_id: &str) -> Result<(), TranslationError> {
        debug!(platform_id = %platform_id, "translation disabled; no channels removed");
        Ok(())
    }
}
