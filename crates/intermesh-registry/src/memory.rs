//! [`InMemoryRegistry`] – one lock-guarded map per table.
//!
//! Listing returns entries ordered by key. Nothing survives the process.

use std::collections::BTreeMap;
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use async_trait::async_trait;
use intermesh_types::{Client, EntityKind, IoTDevice, Plat2PlatSubscription, Platform, Subscription};

use crate::store::{Registry, RegistryError};

fn read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(PoisonError::into_inner)
}

fn write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(PoisonError::into_inner)
}

/// Registry that keeps everything in memory.
#[derive(Default)]
pub struct InMemoryRegistry {
    platforms: RwLock<BTreeMap<String, Platform>>,
    devices: RwLock<BTreeMap<String, IoTDevice>>,
    subscriptions: RwLock<BTreeMap<String, Subscription>>,
    plat2plat: RwLock<BTreeMap<String, Plat2PlatSubscription>>,
    clients: RwLock<BTreeMap<String, Client>>,
}

impl InMemoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Registry for InMemoryRegistry {
    async fn register_platform(&self, platform: &Platform) -> Result<(), RegistryError> {
        let mut platforms = write(&self.platforms);
        if platforms.contains_key(&platform.platform_id) {
            return Err(RegistryError::already_exists(EntityKind::Platform, &platform.platform_id));
        }
        platforms.insert(platform.platform_id.clone(), platform.clone());
        Ok(())
    }

    async fn update_platform(&self, platform: &Platform) -> Result<(), RegistryError> {
        match write(&self.platforms).get_mut(&platform.platform_id) {
            Some(stored) => {
                *stored = platform.clone();
                Ok(())
            }
            None => Err(RegistryError::not_found(EntityKind::Platform, &platform.platform_id)),
        }
    }

    async fn remove_platform(&self, platform_id: &str) -> Result<(), RegistryError> {
        if write(&self.platforms).remove(platform_id).is_none() {
            return Err(RegistryError::not_found(EntityKind::Platform, platform_id));
        }
        write(&self.devices).retain(|_, d| d.hosted_by != platform_id);
        Ok(())
    }

    async fn list_platforms(&self) -> Result<Vec<Platform>, RegistryError> {
        Ok(read(&self.platforms).values().cloned().collect())
    }

    async fn get_platform_by_id(&self, platform_id: &str) -> Result<Option<Platform>, RegistryError> {
        Ok(read(&self.platforms).get(platform_id).cloned())
    }

    async fn register_devices(&self, devices: &[IoTDevice]) -> Result<(), RegistryError> {
        let mut stored = write(&self.devices);
        for device in devices {
            stored.insert(device.device_id.clone(), device.clone());
        }
        Ok(())
    }

    async fn update_devices(&self, devices: &[IoTDevice]) -> Result<(), RegistryError> {
        let mut stored = write(&self.devices);
        if let Some(missing) = devices.iter().find(|d| !stored.contains_key(&d.device_id)) {
            return Err(RegistryError::not_found(EntityKind::Device, &missing.device_id));
        }
        for device in devices {
            stored.insert(device.device_id.clone(), device.clone());
        }
        Ok(())
    }

    async fn remove_devices(&self, device_ids: &[String]) -> Result<(), RegistryError> {
        let mut stored = write(&self.devices);
        for id in device_ids {
            stored.remove(id);
        }
        Ok(())
    }

    async fn get_devices(&self, device_ids: &[String]) -> Result<Vec<IoTDevice>, RegistryError> {
        let stored = read(&self.devices);
        Ok(device_ids.iter().filter_map(|id| stored.get(id).cloned()).collect())
    }

    async fn get_device_ids(&self, platform_id: &str) -> Result<Vec<String>, RegistryError> {
        Ok(read(&self.devices)
            .values()
            .filter(|d| d.hosted_by == platform_id)
            .map(|d| d.device_id.clone())
            .collect())
    }

    async fn list_devices(&self, platform_id: Option<&str>) -> Result<Vec<IoTDevice>, RegistryError> {
        Ok(read(&self.devices)
            .values()
            .filter(|d| platform_id.is_none_or(|p| d.hosted_by == p))
            .cloned()
            .collect())
    }

    async fn subscribe(&self, subscription: &Subscription) -> Result<(), RegistryError> {
        let mut stored = write(&self.subscriptions);
        if stored.contains_key(&subscription.conversation_id) {
            return Err(RegistryError::already_exists(EntityKind::Subscription, &subscription.conversation_id));
        }
        stored.insert(subscription.conversation_id.clone(), subscription.clone());
        Ok(())
    }

    async fn delete_subscription(&self, conversation_id: &str) -> Result<(), RegistryError> {
        write(&self.subscriptions)
            .remove(conversation_id)
            .map(|_| ())
            .ok_or_else(|| RegistryError::not_found(EntityKind::Subscription, conversation_id))
    }

    async fn list_subscriptions(&self, client_id: Option<&str>) -> Result<Vec<Subscription>, RegistryError> {
        Ok(read(&self.subscriptions)
            .values()
            .filter(|s| client_id.is_none_or(|c| s.client_id == c))
            .cloned()
            .collect())
    }

    async fn get_subscription_by_id(&self, conversation_id: &str) -> Result<Option<Subscription>, RegistryError> {
        Ok(read(&self.subscriptions).get(conversation_id).cloned())
    }

    async fn add_plat2plat_subscription(&self, subscription: &Plat2PlatSubscription) -> Result<(), RegistryError> {
        let mut stored = write(&self.plat2plat);
        if stored.contains_key(&subscription.conversation_id) {
            return Err(RegistryError::already_exists(EntityKind::Subscription, &subscription.conversation_id));
        }
        stored.insert(subscription.conversation_id.clone(), subscription.clone());
        Ok(())
    }

    async fn delete_plat2plat_subscription(&self, conversation_id: &str) -> Result<(), RegistryError> {
        write(&self.plat2plat)
            .remove(conversation_id)
            .map(|_| ())
            .ok_or_else(|| RegistryError::not_found(EntityKind::Subscription, conversation_id))
    }

    async fn list_plat2plat_subscriptions(&self) -> Result<Vec<Plat2PlatSubscription>, RegistryError> {
        Ok(read(&self.plat2plat).values().cloned().collect())
    }

    async fn get_plat2plat_subscription(
        &self,
        conversation_id: &str,
    ) -> Result<Option<Plat2PlatSubscription>, RegistryError> {
        Ok(read(&self.plat2plat).get(conversation_id).cloned())
    }

    async fn register_client(&self, client: &Client) -> Result<(), RegistryError> {
        let mut stored = write(&self.clients);
        if stored.contains_key(&client.client_id) {
            return Err(RegistryError::already_exists(EntityKind::Client, &client.client_id));
        }
        stored.insert(client.client_id.clone(), client.clone());
        Ok(())
    }

    async fn update_client(&self, client: &Client) -> Result<(), RegistryError> {
        match write(&self.clients).get_mut(&client.client_id) {
            Some(stored) => {
                *stored = client.clone();
                Ok(())
            }
            None => Err(RegistryError::not_found(EntityKind::Client, &client.client_id)),
        }
    }

    async fn remove_client(&self, client_id: &str) -> Result<(), RegistryError> {
        write(&self.clients)
            .remove(client_id)
            .map(|_| ())
            .ok_or_else(|| RegistryError::not_found(EntityKind::Client, client_id))
    }

    async fn get_client(&self, client_id: &str) -> Result<Option<Client>, RegistryError> {
        Ok(read(&self.clients).get(client_id).cloned())
    }

    async fn list_clients(&self) -> Result<Vec<Client>, RegistryError> {
        Ok(read(&self.clients).values().cloned().collect())
    }
}
