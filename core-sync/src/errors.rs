//! Per-device append-only error log.
//!
//! Entries are never mutated after creation except for the `resolved` flag.

use crate::error::{Result, SyncError};
use bridge_traits::{Clock, DeviceKey};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::warn;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncErrorEntry {
    pub id: Uuid,
    pub code: String,
    pub message: String,
    pub timestamp: DateTime<Utc>,
    /// Originating component, e.g. `"media"`, `"auth"` or `"session"`
    pub component: String,
    pub resolved: bool,
}

pub struct ErrorLog {
    entries: RwLock<HashMap<DeviceKey, Vec<SyncErrorEntry>>>,
    clock: Arc<dyn Clock>,
}

impl ErrorLog {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            clock,
        }
    }

    pub async fn append(
        &self,
        device: &DeviceKey,
        code: impl Into<String>,
        message: impl Into<String>,
        component: impl Into<String>,
    ) -> SyncErrorEntry {
        let entry = SyncErrorEntry {
            id: Uuid::new_v4(),
            code: code.into(),
            message: message.into(),
            timestamp: self.clock.now(),
            component: component.into(),
            resolved: false,
        };

        warn!(
            device = %device,
            code = %entry.code,
            component = %entry.component,
            message = %entry.message,
            "Sync error recorded"
        );

        self.entries
            .write()
            .await
            .entry(device.clone())
            .or_default()
            .push(entry.clone());
        entry
    }

    /// Append an entry derived from a [`SyncError`].
    pub async fn record(
        &self,
        device: &DeviceKey,
        error: &SyncError,
        component: impl Into<String>,
    ) -> SyncErrorEntry {
        self.append(device, error.code(), error.to_string(), component)
            .await
    }

    /// All entries for a device in append order.
    pub async fn list(&self, device: &DeviceKey) -> Vec<SyncErrorEntry> {
        self.entries
            .read()
            .await
            .get(device)
            .cloned()
            .unwrap_or_default()
    }

    pub async fn unresolved(&self, device: &DeviceKey) -> Vec<SyncErrorEntry> {
        self.list(device)
            .await
            .into_iter()
            .filter(|e| !e.resolved)
            .collect()
    }

    /// Flag an entry as resolved. Resolving twice is a no-op.
    pub async fn resolve(&self, device: &DeviceKey, id: Uuid) -> Result<SyncErrorEntry> {
        let mut entries = self.entries.write().await;
        let entry = entries
            .get_mut(device)
            .and_then(|list| list.iter_mut().find(|e| e.id == id))
            .ok_or_else(|| SyncError::NotFound {
                entity: "sync error",
                id: id.to_string(),
            })?;
        entry.resolved = true;
        Ok(entry.clone())
    }

    /// Replace a device's log with persisted entries.
    pub async fn restore(&self, device: &DeviceKey, entries: Vec<SyncErrorEntry>) {
        self.entries.write().await.insert(device.clone(), entries);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bridge_traits::SystemClock;

    #[tokio::test]
    async fn test_append_and_resolve() {
        let log = ErrorLog::new(Arc::new(SystemClock));
        let device = DeviceKey::new("alice", "phone");

        let first = log.append(&device, "TIMEOUT", "send timed out", "messages").await;
        log.append(&device, "RETRY_EXHAUSTED", "gave up", "media").await;
        assert_eq!(log.list(&device).await.len(), 2);
        assert_eq!(log.unresolved(&device).await.len(), 2);

        let resolved = log.resolve(&device, first.id).await.unwrap();
        assert!(resolved.resolved);
        assert_eq!(resolved.message, first.message);
        assert_eq!(log.unresolved(&device).await.len(), 1);
        // Entries are kept after resolution
        assert_eq!(log.list(&device).await.len(), 2);
    }

    #[tokio::test]
    async fn test_resolve_unknown_entry() {
        let log = ErrorLog::new(Arc::new(SystemClock));
        let device = DeviceKey::new("alice", "phone");

        let result = log.resolve(&device, Uuid::new_v4()).await;
        assert!(matches!(result, Err(SyncError::NotFound { .. })));
    }

    #[tokio::test]
    async fn test_record_uses_error_code() {
        let log = ErrorLog::new(Arc::new(SystemClock));
        let device = DeviceKey::new("alice", "phone");

        let entry = log
            .record(&device, &SyncError::TokenExpired(device.to_string()), "auth")
            .await;
        assert_eq!(entry.code, "TOKEN_EXPIRED");
        assert_eq!(entry.component, "auth");
        assert!(log.list(&DeviceKey::new("alice", "tablet")).await.is_empty());
    }
}
