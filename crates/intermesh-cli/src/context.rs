//! [`MiddlewareContext`] – the collaborators every stage is built from,
//! constructed once at startup.

use std::sync::Arc;

use intermesh_bridge::{BridgeFactoryTable, BridgeManager};
use intermesh_gateway::GatewayConfig;
use intermesh_middleware::{MessageBus, TopicBus};
use intermesh_registry::{InMemoryRegistry, Registry, RegistryError, SqliteRegistry};
use intermesh_semantic::{IpsmApiClient, NoopTranslation, TranslationError, TranslationService};
use thiserror::Error;
use tracing::info;

use crate::config::{Config, IN_MEMORY_REGISTRY};

#[derive(Error, Debug)]
pub enum ContextError {
    #[error("cannot create registry directory {path}: {source}")]
    RegistryDir {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("cannot open registry: {0}")]
    Registry(#[from] RegistryError),
    #[error("cannot create translation client: {0}")]
    Translation(#[from] TranslationError),
}

pub struct MiddlewareContext {
    pub bus: Arc<dyn MessageBus>,
    pub registry: Arc<dyn Registry>,
    pub translation: Arc<dyn TranslationService>,
    pub bridges: Arc<BridgeManager>,
    pub gateway: GatewayConfig,
}

impl MiddlewareContext {
    pub fn new(
        bus: Arc<dyn MessageBus>,
        registry: Arc<dyn Registry>,
        translation: Arc<dyn TranslationService>,
        factories: BridgeFactoryTable,
        gateway: GatewayConfig,
    ) -> Self {
        let bridges = Arc::new(BridgeManager::new(Arc::clone(&bus), factories));
        Self {
            bus,
            registry,
            translation,
            bridges,
            gateway,
        }
    }

    /// Build the context described by `config`.
    ///
    /// # Errors
    ///
    /// [`ContextError`] when the registry directory cannot be created, the
    /// registry cannot be opened or the translation client cannot be built.
    pub fn from_config(config: &Config) -> Result<Self, ContextError> {
        let bus: Arc<dyn MessageBus> = Arc::new(TopicBus::new(config.bus_capacity));

        let registry: Arc<dyn Registry> = if config.registry_path == IN_MEMORY_REGISTRY {
            info!("using in-memory registry; state is lost on exit");
            Arc::new(InMemoryRegistry::new())
        } else {
            if let Some(parent) = std::path::Path::new(&config.registry_path).parent() {
                std::fs::create_dir_all(parent).map_err(|source| ContextError::RegistryDir {
                    path: parent.display().to_string(),
                    source,
                })?;
            }
            info!(path = %config.registry_path, "opening registry");
            Arc::new(SqliteRegistry::open(&config.registry_path)?)
        };

        let translation: Arc<dyn TranslationService> = if config.ipsm_base_url.trim().is_empty() {
            info!("no translation service configured; translation disabled");
            Arc::new(NoopTranslation)
        } else {
            Arc::new(IpsmApiClient::new(config.ipsm_base_url.trim())?)
        };

        Ok(Self::new(
            bus,
            registry,
            translation,
            config.bridge_table(),
            config.gateway_config(),
        ))
    }
}
