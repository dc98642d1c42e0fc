//! # Device Registry
//!
//! One record per `(user, device)` pair holding device metadata, sync
//! configuration and the sync status aggregate.
//!
//! Records are created on first registration, refreshed on every heartbeat
//! and never hard-deleted: deactivation only clears the `active` flag, and a
//! later registration brings the same record back.

use crate::error::{Result, SyncError};
use crate::session::{SessionId, SessionState};
use bridge_traits::{Clock, DeviceKey, SyncCategory, UserId};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info};

/// Default interval between scheduled sessions (5 minutes)
pub const DEFAULT_SYNC_INTERVAL_SECS: u64 = 300;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Platform {
    Ios,
    Android,
    Web,
    Desktop,
    Other,
}

/// Metadata reported by the device on registration and heartbeat.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceInfo {
    pub name: String,
    pub platform: Platform,
    pub app_version: String,
    pub push_token: Option<String>,
    /// Stamped by the registry; caller-provided values are ignored
    #[serde(default)]
    pub last_active_at: Option<DateTime<Utc>>,
}

impl DeviceInfo {
    pub fn new(name: impl Into<String>, platform: Platform, app_version: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            platform,
            app_version: app_version.into(),
            push_token: None,
            last_active_at: None,
        }
    }

    pub fn with_push_token(mut self, push_token: impl Into<String>) -> Self {
        self.push_token = Some(push_token.into());
        self
    }
}

/// Scheduling tier; higher tiers are served first when many devices are due.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataPriority {
    Low,
    Normal,
    High,
}

/// Per-device sync configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncConfig {
    pub auto_sync: bool,
    pub sync_interval_secs: u64,
    pub enabled_categories: BTreeSet<SyncCategory>,
    pub data_priority: DataPriority,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            auto_sync: true,
            sync_interval_secs: DEFAULT_SYNC_INTERVAL_SECS,
            enabled_categories: SyncCategory::PRIORITY_ORDER.into_iter().collect(),
            data_priority: DataPriority::Normal,
        }
    }
}

impl SyncConfig {
    pub fn with_interval_secs(mut self, secs: u64) -> Self {
        self.sync_interval_secs = secs;
        self
    }

    pub fn with_categories(mut self, categories: impl IntoIterator<Item = SyncCategory>) -> Self {
        self.enabled_categories = categories.into_iter().collect();
        self
    }

    pub fn sync_interval(&self) -> Duration {
        crate::session::secs_to_duration(self.sync_interval_secs)
    }

    /// Enabled categories in drain order.
    pub fn categories_in_order(&self) -> Vec<SyncCategory> {
        // BTreeSet iterates in the category's declared priority order
        self.enabled_categories.iter().copied().collect()
    }
}

/// Sync status aggregate owned by the device record.
///
/// `consecutive_failures` survives across sessions and is only mutated by
/// the session transition function while the device lock is held.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceSyncStatus {
    pub current: Option<SessionState>,
    pub current_session_id: Option<SessionId>,
    pub last_attempt_at: Option<DateTime<Utc>>,
    pub last_success_at: Option<DateTime<Utc>>,
    pub next_sync_at: Option<DateTime<Utc>>,
    pub consecutive_failures: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceRecord {
    pub key: DeviceKey,
    pub info: DeviceInfo,
    pub config: SyncConfig,
    pub status: DeviceSyncStatus,
    pub active: bool,
    pub registered_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl DeviceRecord {
    /// Whether a scheduled session should start at `now`.
    ///
    /// A scheduled `next_sync_at` takes precedence so backoff is honored;
    /// otherwise the device is due one interval after its last attempt.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        if !self.active || !self.config.auto_sync {
            return false;
        }

        if self
            .status
            .current
            .map(|state| state.is_active())
            .unwrap_or(false)
        {
            return false;
        }

        match (self.status.next_sync_at, self.status.last_attempt_at) {
            (Some(next), _) => now >= next,
            (None, Some(last)) => now >= last + self.config.sync_interval(),
            (None, None) => true,
        }
    }
}

/// Outcome of [`DeviceRegistry::register`].
#[derive(Debug, Clone)]
pub struct Registration {
    pub record: DeviceRecord,
    /// True on first registration of the pair
    pub created: bool,
    /// True when an inactive record was brought back
    pub reactivated: bool,
}

/// In-memory registry of device records.
pub struct DeviceRegistry {
    devices: RwLock<HashMap<DeviceKey, DeviceRecord>>,
    clock: Arc<dyn Clock>,
}

impl DeviceRegistry {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            devices: RwLock::new(HashMap::new()),
            clock,
        }
    }

    /// Register a device or refresh an existing registration.
    ///
    /// Never duplicates: re-registering replaces metadata and configuration,
    /// reactivates an inactive record and keeps the status aggregate.
    pub async fn register(
        &self,
        key: DeviceKey,
        mut info: DeviceInfo,
        config: SyncConfig,
    ) -> Registration {
        let now = self.clock.now();
        info.last_active_at = Some(now);

        let mut devices = self.devices.write().await;
        match devices.get_mut(&key) {
            Some(record) => {
                let reactivated = !record.active;
                record.info = info;
                record.config = config;
                record.active = true;
                record.updated_at = now;

                info!(device = %key, reactivated, "Device re-registered");
                Registration {
                    record: record.clone(),
                    created: false,
                    reactivated,
                }
            }
            None => {
                let record = DeviceRecord {
                    key: key.clone(),
                    info,
                    config,
                    status: DeviceSyncStatus::default(),
                    active: true,
                    registered_at: now,
                    updated_at: now,
                };
                devices.insert(key.clone(), record.clone());

                info!(device = %key, "Device registered");
                Registration {
                    record,
                    created: true,
                    reactivated: false,
                }
            }
        }
    }

    /// Refresh metadata and the last-active timestamp.
    pub async fn heartbeat(&self, key: &DeviceKey, info: DeviceInfo) -> Result<DeviceRecord> {
        let now = self.clock.now();
        self.modify(key, |record| {
            record.info = DeviceInfo {
                last_active_at: Some(now),
                ..info
            };
            record.updated_at = now;
        })
        .await
    }

    pub async fn update_config(&self, key: &DeviceKey, config: SyncConfig) -> Result<DeviceRecord> {
        let now = self.clock.now();
        self.modify(key, |record| {
            record.config = config;
            record.updated_at = now;
        })
        .await
    }

    /// Mark a record inactive. Session cancellation and token revocation are
    /// the caller's responsibility.
    pub async fn deactivate(&self, key: &DeviceKey) -> Result<DeviceRecord> {
        let now = self.clock.now();
        let record = self
            .modify(key, |record| {
                record.active = false;
                record.updated_at = now;
            })
            .await?;
        info!(device = %key, "Device deactivated");
        Ok(record)
    }

    /// Replace the status aggregate.
    pub async fn set_status(&self, key: &DeviceKey, status: DeviceSyncStatus) -> Result<DeviceRecord> {
        let now = self.clock.now();
        self.modify(key, |record| {
            record.status = status;
            record.updated_at = now;
        })
        .await
    }

    pub async fn get(&self, key: &DeviceKey) -> Option<DeviceRecord> {
        self.devices.read().await.get(key).cloned()
    }

    /// Fetch a record, failing with `NotFound` for unknown pairs.
    pub async fn require(&self, key: &DeviceKey) -> Result<DeviceRecord> {
        self.get(key).await.ok_or_else(|| not_found(key))
    }

    /// All records of a user, active or not, ordered by device id.
    pub async fn list_for_user(&self, user_id: &UserId) -> Vec<DeviceRecord> {
        let devices = self.devices.read().await;
        let mut records: Vec<DeviceRecord> = devices
            .values()
            .filter(|r| &r.key.user_id == user_id)
            .cloned()
            .collect();
        records.sort_by(|a, b| a.key.cmp(&b.key));
        records
    }

    pub async fn list_active(&self) -> Vec<DeviceRecord> {
        let devices = self.devices.read().await;
        let mut records: Vec<DeviceRecord> =
            devices.values().filter(|r| r.active).cloned().collect();
        records.sort_by(|a, b| a.key.cmp(&b.key));
        records
    }

    /// Devices due at `now`, highest data priority first.
    pub async fn due_devices(&self, now: DateTime<Utc>) -> Vec<DeviceKey> {
        let devices = self.devices.read().await;
        let mut due: Vec<&DeviceRecord> = devices.values().filter(|r| r.is_due(now)).collect();
        due.sort_by(|a, b| {
            b.config
                .data_priority
                .cmp(&a.config.data_priority)
                .then_with(|| a.key.cmp(&b.key))
        });
        debug!(count = due.len(), "Collected due devices");
        due.into_iter().map(|r| r.key.clone()).collect()
    }

    /// Insert a record loaded from persistence, replacing any in-memory copy.
    pub async fn restore(&self, record: DeviceRecord) {
        self.devices.write().await.insert(record.key.clone(), record);
    }

    async fn modify<F>(&self, key: &DeviceKey, f: F) -> Result<DeviceRecord>
    where
        F: FnOnce(&mut DeviceRecord),
    {
        let mut devices = self.devices.write().await;
        let record = devices.get_mut(key).ok_or_else(|| not_found(key))?;
        f(record);
        Ok(record.clone())
    }
}

fn not_found(key: &DeviceKey) -> SyncError {
    SyncError::NotFound {
        entity: "device",
        id: key.to_string(),
    }
}
