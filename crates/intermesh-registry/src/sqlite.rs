//! [`SqliteRegistry`] – the persistent registry backend.
//!
//! # Storage layout
//!
//! Each entity is stored as a JSON document next to the columns it is looked
//! up by. Tables are created if they do not already exist.
//!
//! | table           | key column        | extra columns                        |
//! |-----------------|-------------------|--------------------------------------|
//! | `platforms`     | `platform_id`     |                                      |
//! | `devices`       | `device_id`       | `platform_id`                        |
//! | `subscriptions` | `conversation_id` | `client_id`                          |
//! | `plat2plat`     | `conversation_id` | `source_device_id`, `target_device_id` |
//! | `clients`       | `client_id`       |                                      |
//!
//! Every table also has a `body TEXT` column holding the serialized record.

use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use intermesh_types::{Client, EntityKind, IoTDevice, Plat2PlatSubscription, Platform, Subscription};
use rusqlite::{Connection, OptionalExtension, params};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::debug;

use crate::store::{Registry, RegistryError};

/// SQLite-backed registry.
///
/// Calls run on the caller's task while holding the connection lock; they
/// never await, so the lock is never held across a suspension point.
pub struct SqliteRegistry {
    conn: Mutex<Connection>,
}

impl SqliteRegistry {
    /// Open (or create) a registry database at `path`.
    pub fn open(path: &str) -> Result<Self, RegistryError> {
        let registry = Self {
            conn: Mutex::new(Connection::open(path)?),
        };
        registry.init_schema()?;
        debug!(path = %path, "registry opened");
        Ok(registry)
    }

    /// Open a temporary in-memory database.
    pub fn open_in_memory() -> Result<Self, RegistryError> {
        let registry = Self {
            conn: Mutex::new(Connection::open_in_memory()?),
        };
        registry.init_schema()?;
        Ok(registry)
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn init_schema(&self) -> Result<(), RegistryError> {
        self.conn().execute_batch(
            "CREATE TABLE IF NOT EXISTS platforms (
                platform_id TEXT NOT NULL PRIMARY KEY,
                body        TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS devices (
                device_id   TEXT NOT NULL PRIMARY KEY,
                platform_id TEXT NOT NULL,
                body        TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS devices_by_platform ON devices (platform_id);
            CREATE TABLE IF NOT EXISTS subscriptions (
                conversation_id TEXT NOT NULL PRIMARY KEY,
                client_id       TEXT NOT NULL,
                body            TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS plat2plat (
                conversation_id  TEXT NOT NULL PRIMARY KEY,
                source_device_id TEXT NOT NULL,
                target_device_id TEXT NOT NULL,
                body             TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS clients (
                client_id TEXT NOT NULL PRIMARY KEY,
                body      TEXT NOT NULL
            );",
        )?;
        Ok(())
    }

    /// Run `sql` with one parameter and decode every `body` it returns.
    fn query_bodies<T: DeserializeOwned>(&self, sql: &str, param: Option<&str>) -> Result<Vec<T>, RegistryError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(sql)?;
        let bodies = match param {
            Some(p) => stmt.query_map(params![p], |row| row.get::<_, String>(0))?.collect::<Result<Vec<_>, _>>()?,
            None => stmt.query_map([], |row| row.get::<_, String>(0))?.collect::<Result<Vec<_>, _>>()?,
        };
        bodies
            .iter()
            .map(|b| serde_json::from_str(b).map_err(RegistryError::from))
            .collect()
    }

    fn query_one<T: DeserializeOwned>(&self, sql: &str, key: &str) -> Result<Option<T>, RegistryError> {
        let body: Option<String> = self
            .conn()
            .query_row(sql, params![key], |row| row.get(0))
            .optional()?;
        body.map(|b| serde_json::from_str(&b).map_err(RegistryError::from))
            .transpose()
    }

    /// `DELETE` by key, failing with `NotFound` when nothing was removed.
    fn delete_one(&self, sql: &str, kind: EntityKind, key: &str) -> Result<(), RegistryError> {
        let removed = self.conn().execute(sql, params![key])?;
        if removed == 0 {
            return Err(RegistryError::not_found(kind, key));
        }
        Ok(())
    }

    /// `UPDATE` by key, failing with `NotFound` when nothing matched.
    fn update_one<T: Serialize>(&self, sql: &str, kind: EntityKind, key: &str, record: &T) -> Result<(), RegistryError> {
        let body = serde_json::to_string(record)?;
        let changed = self.conn().execute(sql, params![body, key])?;
        if changed == 0 {
            return Err(RegistryError::not_found(kind, key));
        }
        Ok(())
    }
}

fn is_constraint_violation(e: &rusqlite::Error) -> bool {
    matches!(
        e,
        rusqlite::Error::SqliteFailure(err, _) if err.code == rusqlite::ErrorCode::ConstraintViolation
    )
}

/// Map a primary-key violation onto `AlreadyExists`.
fn insert_result(result: rusqlite::Result<usize>, kind: EntityKind, key: &str) -> Result<(), RegistryError> {
    match result {
        Ok(_) => Ok(()),
        Err(e) if is_constraint_violation(&e) => Err(RegistryError::already_exists(kind, key)),
        Err(e) => Err(e.into()),
    }
}

#[async_trait]
impl Registry for SqliteRegistry {
    async fn register_platform(&self, platform: &Platform) -> Result<(), RegistryError> {
        let body = serde_json::to_string(platform)?;
        let result = self.conn().execute(
            "INSERT INTO platforms (platform_id, body) VALUES (?1, ?2)",
            params![platform.platform_id, body],
        );
        insert_result(result, EntityKind::Platform, &platform.platform_id)
    }

    async fn update_platform(&self, platform: &Platform) -> Result<(), RegistryError> {
        self.update_one(
            "UPDATE platforms SET body = ?1 WHERE platform_id = ?2",
            EntityKind::Platform,
            &platform.platform_id,
            platform,
        )
    }

    async fn remove_platform(&self, platform_id: &str) -> Result<(), RegistryError> {
        let mut conn = self.conn();
        let tx = conn.transaction()?;
        let removed = tx.execute("DELETE FROM platforms WHERE platform_id = ?1", params![platform_id])?;
        if removed == 0 {
            return Err(RegistryError::not_found(EntityKind::Platform, platform_id));
        }
        tx.execute("DELETE FROM devices WHERE platform_id = ?1", params![platform_id])?;
        tx.commit()?;
        Ok(())
    }

    async fn list_platforms(&self) -> Result<Vec<Platform>, RegistryError> {
        self.query_bodies("SELECT body FROM platforms ORDER BY platform_id", None)
    }

    async fn get_platform_by_id(&self, platform_id: &str) -> Result<Option<Platform>, RegistryError> {
        self.query_one("SELECT body FROM platforms WHERE platform_id = ?1", platform_id)
    }

    async fn register_devices(&self, devices: &[IoTDevice]) -> Result<(), RegistryError> {
        let mut conn = self.conn();
        let tx = conn.transaction()?;
        for device in devices {
            tx.execute(
                "INSERT OR REPLACE INTO devices (device_id, platform_id, body) VALUES (?1, ?2, ?3)",
                params![device.device_id, device.hosted_by, serde_json::to_string(device)?],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    async fn update_devices(&self, devices: &[IoTDevice]) -> Result<(), RegistryError> {
        let mut conn = self.conn();
        let tx = conn.transaction()?;
        for device in devices {
            let changed = tx.execute(
                "UPDATE devices SET platform_id = ?1, body = ?2 WHERE device_id = ?3",
                params![device.hosted_by, serde_json::to_string(device)?, device.device_id],
            )?;
            if changed == 0 {
                // Dropping the transaction rolls back earlier updates.
                return Err(RegistryError::not_found(EntityKind::Device, &device.device_id));
            }
        }
        tx.commit()?;
        Ok(())
    }

    async fn remove_devices(&self, device_ids: &[String]) -> Result<(), RegistryError> {
        let mut conn = self.conn();
        let tx = conn.transaction()?;
        for id in device_ids {
            tx.execute("DELETE FROM devices WHERE device_id = ?1", params![id])?;
        }
        tx.commit()?;
        Ok(())
    }

    async fn get_devices(&self, device_ids: &[String]) -> Result<Vec<IoTDevice>, RegistryError> {
        let mut found = Vec::with_capacity(device_ids.len());
        for id in device_ids {
            if let Some(device) = self.query_one("SELECT body FROM devices WHERE device_id = ?1", id)? {
                found.push(device);
            }
        }
        Ok(found)
    }

    async fn get_device_ids(&self, platform_id: &str) -> Result<Vec<String>, RegistryError> {
        let conn = self.conn();
        let mut stmt = conn.prepare("SELECT device_id FROM devices WHERE platform_id = ?1 ORDER BY device_id")?;
        let ids = stmt
            .query_map(params![platform_id], |row| row.get(0))?
            .collect::<Result<Vec<String>, _>>()?;
        Ok(ids)
    }

    async fn list_devices(&self, platform_id: Option<&str>) -> Result<Vec<IoTDevice>, RegistryError> {
        match platform_id {
            Some(p) => self.query_bodies("SELECT body FROM devices WHERE platform_id = ?1 ORDER BY device_id", Some(p)),
            None => self.query_bodies("SELECT body FROM devices ORDER BY device_id", None),
        }
    }

    async fn subscribe(&self, subscription: &Subscription) -> Result<(), RegistryError> {
        let body = serde_json::to_string(subscription)?;
        let result = self.conn().execute(
            "INSERT INTO subscriptions (conversation_id, client_id, body) VALUES (?1, ?2, ?3)",
            params![subscription.conversation_id, subscription.client_id, body],
        );
        insert_result(result, EntityKind::Subscription, &subscription.conversation_id)
    }

    async fn delete_subscription(&self, conversation_id: &str) -> Result<(), RegistryError> {
        self.delete_one(
            "DELETE FROM subscriptions WHERE conversation_id = ?1",
            EntityKind::Subscription,
            conversation_id,
        )
    }

    async fn list_subscriptions(&self, client_id: Option<&str>) -> Result<Vec<Subscription>, RegistryError> {
        match client_id {
            Some(c) => self.query_bodies(
                "SELECT body FROM subscriptions WHERE client_id = ?1 ORDER BY conversation_id",
                Some(c),
            ),
            None => self.query_bodies("SELECT body FROM subscriptions ORDER BY conversation_id", None),
        }
    }

    async fn get_subscription_by_id(&self, conversation_id: &str) -> Result<Option<Subscription>, RegistryError> {
        self.query_one("SELECT body FROM subscriptions WHERE conversation_id = ?1", conversation_id)
    }

    async fn add_plat2plat_subscription(&self, subscription: &Plat2PlatSubscription) -> Result<(), RegistryError> {
        let body = serde_json::to_string(subscription)?;
        let result = self.conn().execute(
            "INSERT INTO plat2plat (conversation_id, source_device_id, target_device_id, body)
             VALUES (?1, ?2, ?3, ?4)",
            params![
                subscription.conversation_id,
                subscription.source_device_id,
                subscription.target_device_id,
                body
            ],
        );
        insert_result(result, EntityKind::Subscription, &subscription.conversation_id)
    }

    async fn delete_plat2plat_subscription(&self, conversation_id: &str) -> Result<(), RegistryError> {
        self.delete_one(
            "DELETE FROM plat2plat WHERE conversation_id = ?1",
            EntityKind::Subscription,
            conversation_id,
        )
    }

    async fn list_plat2plat_subscriptions(&self) -> Result<Vec<Plat2PlatSubscription>, RegistryError> {
        self.query_bodies("SELECT body FROM plat2plat ORDER BY conversation_id", None)
    }

    async fn get_plat2plat_subscription(
        &self,
        conversation_id: &str,
    ) -> Result<Option<Plat2PlatSubscription>, RegistryError> {
        self.query_one("SELECT body FROM plat2plat WHERE conversation_id = ?1", conversation_id)
    }

    async fn find_plat2plat_subscription(
        &self,
        source_device_id: &str,
        target_device_id: &str,
    ) -> Result<Option<Plat2PlatSubscription>, RegistryError> {
        let body: Option<String> = self
            .conn()
            .query_row(
                "SELECT body FROM plat2plat WHERE source_device_id = ?1 AND target_device_id = ?2",
                params![source_device_id, target_device_id],
                |row| row.get(0),
            )
            .optional()?;
        body.map(|b| serde_json::from_str(&b).map_err(RegistryError::from))
            .transpose()
    }

    async fn register_client(&self, client: &Client) -> Result<(), RegistryError> {
        let body = serde_json::to_string(client)?;
        let result = self.conn().execute(
            "INSERT INTO clients (client_id, body) VALUES (?1, ?2)",
            params![client.client_id, body],
        );
        insert_result(result, EntityKind::Client, &client.client_id)
    }

    async fn update_client(&self, client: &Client) -> Result<(), RegistryError> {
        self.update_one(
            "UPDATE clients SET body = ?1 WHERE client_id = ?2",
            EntityKind::Client,
            &client.client_id,
            client,
        )
    }

    async fn remove_client(&self, client_id: &str) -> Result<(), RegistryError> {
        self.delete_one("DELETE FROM clients WHERE client_id = ?1", EntityKind::Client, client_id)
    }

    async fn get_client(&self, client_id: &str) -> Result<Option<Client>, RegistryError> {
        self.query_one("SELECT body FROM clients WHERE client_id = ?1", client_id)
    }

    async fn list_clients(&self) -> Result<Vec<Client>, RegistryError> {
        self.query_bodies("SELECT body FROM clients ORDER BY client_id", None)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
