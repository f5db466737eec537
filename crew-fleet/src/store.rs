//! Tenant configuration store backed by SQLite.
//!
//! Holds one row per team: its chat-transport token, the two channels its
//! bot serves, and a display name. The fleet only ever reads it.

use std::path::Path;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use rusqlite::{Connection, OptionalExtension};
use serde::{Deserialize, Serialize};

/// One team's bot configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TenantConfig {
    pub tenant_id: String,
    pub transport_token: String,
    pub primary_channel_id: String,
    pub secondary_channel_id: String,
    pub display_name: String,
}

/// Why a tenant was left out of the fleet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    MissingTenantId,
    MissingToken,
    MissingPrimaryChannel,
    MissingSecondaryChannel,
}

impl std::fmt::Display for SkipReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SkipReason::MissingTenantId => write!(f, "no tenant id"),
            SkipReason::MissingToken => write!(f, "no transport token"),
            SkipReason::MissingPrimaryChannel => write!(f, "no primary channel id"),
            SkipReason::MissingSecondaryChannel => write!(f, "no secondary channel id"),
        }
    }
}

impl TenantConfig {
    /// A tenant gets a crew and a connection only with an id, a token and
    /// both channels set.
    pub fn eligibility(&self) -> Result<(), SkipReason> {
        if self.tenant_id.trim().is_empty() {
            Err(SkipReason::MissingTenantId)
        } else if self.transport_token.trim().is_empty() {
            Err(SkipReason::MissingToken)
        } else if self.primary_channel_id.trim().is_empty() {
            Err(SkipReason::MissingPrimaryChannel)
        } else if self.secondary_channel_id.trim().is_empty() {
            Err(SkipReason::MissingSecondaryChannel)
        } else {
            Ok(())
        }
    }

    /// Display name, falling back to the tenant id.
    pub fn name(&self) -> &str {
        if self.display_name.trim().is_empty() {
            &self.tenant_id
        } else {
            &self.display_name
        }
    }
}

/// Source of tenant configurations.
#[async_trait]
pub trait ConfigStore: Send + Sync + 'static {
    async fn list_tenant_configs(&self) -> Result<Vec<TenantConfig>>;
}

/// SQLite-backed [`ConfigStore`].
pub struct TenantStore {
    db: Mutex<Connection>,
}

impl TenantStore {
    /// Open or create a tenant database.
    pub fn open(path: &Path) -> Result<Self> {
        let db = Connection::open(path)
            .with_context(|| format!("Failed to open tenant database {}", path.display()))?;
        db.execute_batch(
            "CREATE TABLE IF NOT EXISTS tenants (
                tenant_id TEXT PRIMARY KEY,
                transport_token TEXT NOT NULL DEFAULT '',
                primary_channel_id TEXT NOT NULL DEFAULT '',
                secondary_channel_id TEXT NOT NULL DEFAULT '',
                display_name TEXT NOT NULL DEFAULT '',
                updated_at TEXT NOT NULL
            );",
        )?;
        Ok(Self { db: Mutex::new(db) })
    }

    /// Open an in-memory database (for testing).
    pub fn in_memory() -> Result<Self> {
        Self::open(Path::new(":memory:"))
    }

    /// Insert or replace a tenant.
    pub fn upsert(&self, config: &TenantConfig) -> Result<()> {
        let db = self.db.lock();
        let now = Utc::now().to_rfc3339();
        db.execute(
            "INSERT OR REPLACE INTO tenants
                (tenant_id, transport_token, primary_channel_id, secondary_channel_id, display_name, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            rusqlite::params![
                config.tenant_id,
                config.transport_token,
                config.primary_channel_id,
                config.secondary_channel_id,
                config.display_name,
                now
            ],
        )?;
        Ok(())
    }

    /// Remove a tenant. Returns whether it existed.
    pub fn remove(&self, tenant_id: &str) -> Result<bool> {
        let db = self.db.lock();
        let n = db.execute(
            "DELETE FROM tenants WHERE tenant_id = ?1",
            rusqlite::params![tenant_id],
        )?;
        Ok(n > 0)
    }

    pub fn get(&self, tenant_id: &str) -> Result<Option<TenantConfig>> {
        let db = self.db.lock();
        let mut stmt = db.prepare(
            "SELECT tenant_id, transport_token, primary_channel_id, secondary_channel_id, display_name
             FROM tenants WHERE tenant_id = ?1",
        )?;
        let config = stmt
            .query_row(rusqlite::params![tenant_id], row_to_config)
            .optional()?;
        Ok(config)
    }

    /// All tenants, ordered by id.
    pub fn list(&self) -> Result<Vec<TenantConfig>> {
        let db = self.db.lock();
        let mut stmt = db.prepare(
            "SELECT tenant_id, transport_token, primary_channel_id, secondary_channel_id, display_name
             FROM tenants ORDER BY tenant_id ASC",
        )?;
        let configs = stmt
            .query_map([], row_to_config)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(configs)
    }
}

fn row_to_config(row: &rusqlite::Row<'_>) -> rusqlite::Result<TenantConfig> {
    Ok(TenantConfig {
        tenant_id: row.get(0)?,
        transport_token: row.get(1)?,
        primary_channel_id: row.get(2)?,
        secondary_channel_id: row.get(3)?,
        display_name: row.get(4)?,
    })
}

#[async_trait]
impl ConfigStore for TenantStore {
    async fn list_tenant_configs(&self) -> Result<Vec<TenantConfig>> {
        self.list()
    }
}
