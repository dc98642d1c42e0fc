//! # Sync State Repository
//!
//! Persistence for per-device state documents and session history.
//!
//! ## Overview
//!
//! - `device_sync_state` holds one JSON document per device, upserted after
//!   every session transition. Token secrets never reach this table; only
//!   the token's expiry and key reference are stored.
//! - `sync_sessions` keeps one row per session for history queries.

use crate::conflict::SettingsLog;
use crate::error::{Result, SyncError};
use crate::errors::SyncErrorEntry;
use crate::metrics::MetricsRecord;
use crate::queue::SyncItem;
use crate::registry::{DeviceInfo, DeviceRecord, DeviceSyncStatus, SyncConfig};
use crate::session::{SessionId, SessionStats, SessionState, SessionTrigger, SyncSession};
use async_trait::async_trait;
use bridge_traits::{DeviceId, DeviceKey, UserId};
use chrono::{DateTime, Utc};
use core_auth::TokenMetadata;
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, SqlitePool};

/// Settings queue with its change log
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SettingsQueueDocument {
    pub version: u64,
    pub changes: Vec<crate::conflict::SettingsChange>,
    #[serde(default)]
    pub items: Vec<SyncItem>,
}

impl SettingsQueueDocument {
    pub fn new(log: SettingsLog, items: Vec<SyncItem>) -> Self {
        Self {
            version: log.version,
            changes: log.changes,
            items,
        }
    }

    pub fn log(&self) -> SettingsLog {
        SettingsLog {
            version: self.version,
            changes: self.changes.clone(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QueuesDocument {
    pub messages: Vec<SyncItem>,
    pub media: Vec<SyncItem>,
    pub contacts: Vec<SyncItem>,
    pub settings: SettingsQueueDocument,
}

impl QueuesDocument {
    /// All queued items across categories
    pub fn all_items(&self) -> Vec<SyncItem> {
        self.settings
            .items
            .iter()
            .chain(&self.messages)
            .chain(&self.contacts)
            .chain(&self.media)
            .cloned()
            .collect()
    }
}

/// Persisted per-device state
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceStateDocument {
    pub user_id: UserId,
    pub device_id: DeviceId,
    pub device_info: DeviceInfo,
    pub sync_config: SyncConfig,
    pub sync_status: DeviceSyncStatus,
    pub active: bool,
    pub registered_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub token: Option<TokenMetadata>,
    pub queues: QueuesDocument,
    pub metrics: MetricsRecord,
    pub errors: Vec<SyncErrorEntry>,
}

impl DeviceStateDocument {
    pub fn key(&self) -> DeviceKey {
        DeviceKey {
            user_id: self.user_id.clone(),
            device_id: self.device_id.clone(),
        }
    }

    pub fn record(&self) -> DeviceRecord {
        DeviceRecord {
            key: self.key(),
            info: self.device_info.clone(),
            config: self.sync_config.clone(),
            status: self.sync_status.clone(),
            active: self.active,
            registered_at: self.registered_at,
            updated_at: self.updated_at,
        }
    }
}

/// Repository trait for sync state persistence
#[async_trait]
pub trait SyncStateRepository: Send + Sync {
    /// Insert or replace a device's state document
    async fn save_device_state(&self, document: &DeviceStateDocument) -> Result<()>;

    async fn load_device_state(&self, device: &DeviceKey) -> Result<Option<DeviceStateDocument>>;

    /// All stored documents, ordered by user and device
    async fn list_device_states(&self) -> Result<Vec<DeviceStateDocument>>;

    async fn insert_session(&self, session: &SyncSession) -> Result<()>;

    /// # Errors
    ///
    /// Returns `NotFound` if the session was never inserted
    async fn update_session(&self, session: &SyncSession) -> Result<()>;

    async fn find_session(&self, id: &SessionId) -> Result<Option<SyncSession>>;

    /// Most recent sessions of a device first
    async fn session_history(&self, device: &DeviceKey, limit: u32) -> Result<Vec<SyncSession>>;
}

/// SQLite implementation of [`SyncStateRepository`]
pub struct SqliteSyncStateRepository {
    pool: SqlitePool,
}

impl SqliteSyncStateRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[derive(Debug, FromRow)]
struct SessionRow {
    id: String,
    user_id: String,
    device_id: String,
    state: String,
    trigger_kind: String,
    items_synced: i64,
    items_failed: i64,
    items_exhausted: i64,
    inbound_applied: i64,
    conflicts_resolved: i64,
    bytes_transferred: i64,
    error_message: Option<String>,
    created_at: i64,
    started_at: Option<i64>,
    ended_at: Option<i64>,
}

fn from_millis(millis: i64) -> Result<DateTime<Utc>> {
    DateTime::<Utc>::from_timestamp_millis(millis)
        .ok_or_else(|| SyncError::Database(format!("Invalid timestamp: {millis}")))
}

impl TryFrom<SessionRow> for SyncSession {
    type Error = SyncError;

    fn try_from(row: SessionRow) -> Result<Self> {
        Ok(SyncSession {
            id: SessionId::from_string(&row.id)?,
            device: DeviceKey::new(row.user_id.as_str(), row.device_id.as_str()),
            state: row.state.parse::<SessionState>()?,
            trigger: row.trigger_kind.parse::<SessionTrigger>()?,
            stats: SessionStats {
                items_synced: row.items_synced.max(0) as u64,
                items_failed: row.items_failed.max(0) as u64,
                items_exhausted: row.items_exhausted.max(0) as u64,
                inbound_applied: row.inbound_applied.max(0) as u64,
                conflicts_resolved: row.conflicts_resolved.max(0) as u64,
                bytes_transferred: row.bytes_transferred.max(0) as u64,
            },
            error_message: row.error_message,
            created_at: from_millis(row.created_at)?,
            started_at: row.started_at.map(from_millis).transpose()?,
            ended_at: row.ended_at.map(from_millis).transpose()?,
        })
    }
}

const SESSION_COLUMNS: &str = r#"
    id, user_id, device_id, state, trigger_kind,
    items_synced, items_failed, items_exhausted, inbound_applied,
    conflicts_resolved, bytes_transferred, error_message,
    created_at, started_at, ended_at
"#;

#[async_trait]
impl SyncStateRepository for SqliteSyncStateRepository {
    async fn save_device_state(&self, document: &DeviceStateDocument) -> Result<()> {
        let json = serde_json::to_string(document)?;

        sqlx::query(
            r#"
            INSERT INTO device_sync_state (user_id, device_id, active, document, updated_at)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT (user_id, device_id) DO UPDATE SET
                active = excluded.active,
                document = excluded.document,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(document.user_id.as_str())
        .bind(document.device_id.as_str())
        .bind(document.active)
        .bind(json)
        .bind(document.updated_at.timestamp_millis())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn load_device_state(&self, device: &DeviceKey) -> Result<Option<DeviceStateDocument>> {
        let row: Option<(String,)> = sqlx::query_as(
            "SELECT document FROM device_sync_state WHERE user_id = ? AND device_id = ?",
        )
        .bind(device.user_id.as_str())
        .bind(device.device_id.as_str())
        .fetch_optional(&self.pool)
        .await?;

        row.map(|(json,)| serde_json::from_str(&json).map_err(SyncError::from))
            .transpose()
    }

    async fn list_device_states(&self) -> Result<Vec<DeviceStateDocument>> {
        let rows: Vec<(String,)> = sqlx::query_as(
            "SELECT document FROM device_sync_state ORDER BY user_id, device_id",
        )
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|(json,)| serde_json::from_str(&json).map_err(SyncError::from))
            .collect()
    }

    async fn insert_session(&self, session: &SyncSession) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO sync_sessions (
                id, user_id, device_id, state, trigger_kind,
                items_synced, items_failed, items_exhausted, inbound_applied,
                conflicts_resolved, bytes_transferred, error_message,
                created_at, started_at, ended_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(session.id.to_string())
        .bind(session.device.user_id.as_str())
        .bind(session.device.device_id.as_str())
        .bind(session.state.as_str())
        .bind(session.trigger.as_str())
        .bind(session.stats.items_synced as i64)
        .bind(session.stats.items_failed as i64)
        .bind(session.stats.items_exhausted as i64)
        .bind(session.stats.inbound_applied as i64)
        .bind(session.stats.conflicts_resolved as i64)
        .bind(session.stats.bytes_transferred as i64)
        .bind(&session.error_message)
        .bind(session.created_at.timestamp_millis())
        .bind(session.started_at.map(|t| t.timestamp_millis()))
        .bind(session.ended_at.map(|t| t.timestamp_millis()))
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn update_session(&self, session: &SyncSession) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE sync_sessions SET
                state = ?,
                items_synced = ?,
                items_failed = ?,
                items_exhausted = ?,
                inbound_applied = ?,
                conflicts_resolved = ?,
                bytes_transferred = ?,
                error_message = ?,
                started_at = ?,
                ended_at = ?
            WHERE id = ?
            "#,
        )
        .bind(session.state.as_str())
        .bind(session.stats.items_synced as i64)
        .bind(session.stats.items_failed as i64)
        .bind(session.stats.items_exhausted as i64)
        .bind(session.stats.inbound_applied as i64)
        .bind(session.stats.conflicts_resolved as i64)
        .bind(session.stats.bytes_transferred as i64)
        .bind(&session.error_message)
        .bind(session.started_at.map(|t| t.timestamp_millis()))
        .bind(session.ended_at.map(|t| t.timestamp_millis()))
        .bind(session.id.to_string())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(SyncError::NotFound {
                entity: "session",
                id: session.id.to_string(),
            });
        }

        Ok(())
    }

    async fn find_session(&self, id: &SessionId) -> Result<Option<SyncSession>> {
        let row = sqlx::query_as::<_, SessionRow>(&format!(
            "SELECT {SESSION_COLUMNS} FROM sync_sessions WHERE id = ?"
        ))
        .bind(id.to_string())
        .fetch_optional(&self.pool)
        .await?;

        row.map(SyncSession::try_from).transpose()
    }

    async fn session_history(&self, device: &DeviceKey, limit: u32) -> Result<Vec<SyncSession>> {
        let rows = sqlx::query_as::<_, SessionRow>(&format!(
            r#"
            SELECT {SESSION_COLUMNS} FROM sync_sessions
            WHERE user_id = ? AND device_id = ?
            ORDER BY created_at DESC, rowid DESC
            LIMIT ?
            "#
        ))
        .bind(device.user_id.as_str())
        .bind(device.device_id.as_str())
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(SyncSession::try_from).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::create_test_pool;
    use crate::registry::Platform;
    use chrono::{Duration, TimeZone};

    async fn repo() -> SqliteSyncStateRepository {
        SqliteSyncStateRepository::new(create_test_pool().await.unwrap())
    }

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap()
    }

    fn document(device: &str) -> DeviceStateDocument {
        DeviceStateDocument {
            user_id: UserId::new("alice"),
            device_id: DeviceId::new(device),
            device_info: DeviceInfo::new("Phone", Platform::Android, "1.0.0"),
            sync_config: SyncConfig::default(),
            sync_status: DeviceSyncStatus::default(),
            active: true,
            registered_at: t0(),
            updated_at: t0(),
            token: None,
            queues: QueuesDocument::default(),
            metrics: MetricsRecord::default(),
            errors: Vec::new(),
        }
    }

    #[tokio::test]
    async fn test_save_and_load_device_state() {
        let repo = repo().await;
        let mut doc = document("phone");
        repo.save_device_state(&doc).await.unwrap();

        doc.sync_status.consecutive_failures = 3;
        doc.active = false;
        repo.save_device_state(&doc).await.unwrap();

        let loaded = repo.load_device_state(&doc.key()).await.unwrap().unwrap();
        assert_eq!(loaded, doc);
        assert_eq!(repo.list_device_states().await.unwrap().len(), 1);

        assert!(repo
            .load_device_state(&DeviceKey::new("alice", "ghost"))
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_document_uses_persisted_layout() {
        let json = serde_json::to_value(document("phone")).unwrap();
        for field in [
            "userId",
            "deviceId",
            "deviceInfo",
            "syncConfig",
            "syncStatus",
            "token",
            "queues",
            "metrics",
            "errors",
        ] {
            assert!(json.get(field).is_some(), "missing {field}");
        }
        assert!(json["queues"]["settings"].get("version").is_some());
        assert!(json["queues"]["settings"].get("changes").is_some());
    }

    #[tokio::test]
    async fn test_session_insert_update_and_find() {
        let repo = repo().await;
        let device = DeviceKey::new("alice", "phone");
        let session = SyncSession::new(device.clone(), SessionTrigger::Manual, t0());
        repo.insert_session(&session).await.unwrap();

        let session = session.start(t0()).unwrap();
        repo.update_session(&session).await.unwrap();

        let stats = SessionStats {
            items_synced: 3,
            bytes_transferred: 42,
            ..SessionStats::default()
        };
        let session = session
            .complete(stats, t0() + Duration::seconds(2))
            .unwrap();
        repo.update_session(&session).await.unwrap();

        let found = repo.find_session(&session.id).await.unwrap().unwrap();
        assert_eq!(found, session);
    }

    #[tokio::test]
    async fn test_update_unknown_session() {
        let repo = repo().await;
        let session = SyncSession::new(DeviceKey::new("alice", "phone"), SessionTrigger::Manual, t0());
        assert!(matches!(
            repo.update_session(&session).await,
            Err(SyncError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_session_history_is_newest_first() {
        let repo = repo().await;
        let device = DeviceKey::new("alice", "phone");

        let mut ids = Vec::new();
        for offset in 0..4 {
            let session = SyncSession::new(
                device.clone(),
                SessionTrigger::Scheduled,
                t0() + Duration::minutes(offset),
            );
            ids.push(session.id);
            repo.insert_session(&session).await.unwrap();
        }
        let other = SyncSession::new(DeviceKey::new("alice", "tablet"), SessionTrigger::Manual, t0());
        repo.insert_session(&other).await.unwrap();

        let history = repo.session_history(&device, 3).await.unwrap();
        let history_ids: Vec<SessionId> = history.iter().map(|s| s.id).collect();
        assert_eq!(history_ids, vec![ids[3], ids[2], ids[1]]);
    }
}
