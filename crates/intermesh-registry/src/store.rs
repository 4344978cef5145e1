//! The [`Registry`] seam.

use async_trait::async_trait;
use intermesh_types::{
    Client, EntityKind, IoTDevice, Plat2PlatSubscription, Platform, QueryResult, QueryType,
    RouteError, Subscription,
};
use thiserror::Error;

use crate::query::DeviceFilter;

/// Errors raised by a registry backend.
#[derive(Error, Debug)]
pub enum RegistryError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("stored record is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("{kind} '{id}' not found")]
    NotFound { kind: EntityKind, id: String },
    #[error("{kind} '{id}' already exists")]
    AlreadyExists { kind: EntityKind, id: String },
    #[error("invalid query: {0}")]
    InvalidQuery(String),
}

impl RegistryError {
    pub fn not_found(kind: EntityKind, id: impl Into<String>) -> Self {
        RegistryError::NotFound { kind, id: id.into() }
    }

    pub fn already_exists(kind: EntityKind, id: impl Into<String>) -> Self {
        RegistryError::AlreadyExists { kind, id: id.into() }
    }
}

impl From<RegistryError> for RouteError {
    fn from(e: RegistryError) -> Self {
        match e {
            RegistryError::NotFound { kind, id } => RouteError::NotRegistered { kind, id },
            RegistryError::AlreadyExists { kind, id } => RouteError::AlreadyRegistered { kind, id },
            other => RouteError::Middleware(format!("registry: {other}")),
        }
    }
}

/// Durable CRUD store for control-plane state.
///
/// Lookups that may legitimately miss (`get_*`) return `Ok(None)`; mutations
/// of an unknown entity fail with [`RegistryError::NotFound`].
#[async_trait]
pub trait Registry: Send + Sync {
    // ── Platforms ───────────────────────────────────────────────────────────

    /// # Errors
    ///
    /// [`RegistryError::AlreadyExists`] when the platform id is taken.
    async fn register_platform(&self, platform: &Platform) -> Result<(), RegistryError>;
    async fn update_platform(&self, platform: &Platform) -> Result<(), RegistryError>;
    /// Remove a platform together with every device it hosts.
    async fn remove_platform(&self, platform_id: &str) -> Result<(), RegistryError>;
    async fn list_platforms(&self) -> Result<Vec<Platform>, RegistryError>;
    async fn get_platform_by_id(&self, platform_id: &str) -> Result<Option<Platform>, RegistryError>;

    // ── Devices ─────────────────────────────────────────────────────────────

    /// Insert devices, replacing any stored record with the same id.
    async fn register_devices(&self, devices: &[IoTDevice]) -> Result<(), RegistryError>;
    /// # Errors
    ///
    /// [`RegistryError::NotFound`] for the first device that is not stored;
    /// nothing is written in that case.
    async fn update_devices(&self, devices: &[IoTDevice]) -> Result<(), RegistryError>;
    /// Remove devices by id. Unknown ids are ignored.
    async fn remove_devices(&self, device_ids: &[String]) -> Result<(), RegistryError>;
    /// Stored records for the given ids, skipping unknown ones.
    async fn get_devices(&self, device_ids: &[String]) -> Result<Vec<IoTDevice>, RegistryError>;
    /// Ids of every device hosted by `platform_id`.
    async fn get_device_ids(&self, platform_id: &str) -> Result<Vec<String>, RegistryError>;
    /// All devices, or those of one platform.
    async fn list_devices(&self, platform_id: Option<&str>) -> Result<Vec<IoTDevice>, RegistryError>;

    // ── Client subscriptions ────────────────────────────────────────────────

    async fn subscribe(&self, subscription: &Subscription) -> Result<(), RegistryError>;
    async fn delete_subscription(&self, conversation_id: &str) -> Result<(), RegistryError>;
    /// Every subscription, or those of one client.
    async fn list_subscriptions(&self, client_id: Option<&str>) -> Result<Vec<Subscription>, RegistryError>;
    async fn get_subscription_by_id(&self, conversation_id: &str) -> Result<Option<Subscription>, RegistryError>;

    // ── Virtual subscriptions ───────────────────────────────────────────────

    async fn add_plat2plat_subscription(&self, subscription: &Plat2PlatSubscription) -> Result<(), RegistryError>;
    async fn delete_plat2plat_subscription(&self, conversation_id: &str) -> Result<(), RegistryError>;
    async fn list_plat2plat_subscriptions(&self) -> Result<Vec<Plat2PlatSubscription>, RegistryError>;
    async fn get_plat2plat_subscription(
        &self,
        conversation_id: &str,
    ) -> Result<Option<Plat2PlatSubscription>, RegistryError>;

    /// The virtual subscription linking `source_device_id` to
    /// `target_device_id`, if any.
    async fn find_plat2plat_subscription(
        &self,
        source_device_id: &str,
        target_device_id: &str,
    ) -> Result<Option<Plat2PlatSubscription>, RegistryError> {
        Ok(self
            .list_plat2plat_subscriptions()
            .await?
            .into_iter()
            .find(|s| s.source_device_id == source_device_id && s.target_device_id == target_device_id))
    }

    // ── Clients ─────────────────────────────────────────────────────────────

    async fn register_client(&self, client: &Client) -> Result<(), RegistryError>;
    async fn update_client(&self, client: &Client) -> Result<(), RegistryError>;
    async fn remove_client(&self, client_id: &str) -> Result<(), RegistryError>;
    async fn get_client(&self, client_id: &str) -> Result<Option<Client>, RegistryError>;
    async fn list_clients(&self) -> Result<Vec<Client>, RegistryError>;

    // ── Discovery ───────────────────────────────────────────────────────────

    /// Run a device discovery query. See [`DeviceFilter`] for the syntax.
    ///
    /// # Errors
    ///
    /// [`RegistryError::InvalidQuery`] when the query cannot be parsed.
    async fn execute_query(&self, query: &str, query_type: QueryType) -> Result<QueryResult, RegistryError> {
        let filter = DeviceFilter::parse(query)?;
        let devices = self.list_devices(filter.platform_id()).await?;
        Ok(filter.evaluate(devices, query_type))
    }
}
